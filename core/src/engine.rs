//! Process supervision: startup ordering, signal handling, cooperative
//! shutdown and the kill switch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use snooper::SnoopConfig;
use storage::{Store, StoreConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_OR_STORAGE: i32 = 1;
pub const EXIT_WATCHER_INIT: i32 = 2;
pub const EXIT_SCHEDULER_INIT: i32 = 3;
pub const EXIT_KILL_SWITCH: i32 = 4;

pub async fn run(conf: AppConfig) -> i32 {
    let cancel = CancellationToken::new();
    let kill_switch_fired = Arc::new(AtomicBool::new(false));

    // Init storage.
    info!(target: "main", "initializing the storage backend...");
    let store = match Store::open(StoreConfig {
        instance: conf.instance.clone(),
        root: None,
    }) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(target: "main", "failed to initialize storage: {e}");
            return EXIT_CONFIG_OR_STORAGE;
        }
    };
    info!(target: "main", "storage backend ready");

    tokio::spawn(handle_signals(cancel.clone(), Arc::clone(&store)));

    // The communication channel between the watcher and the scheduler.
    // Backpressure on purpose: a slow scheduler delays the next pass.
    let (changes_tx, changes_rx) = mpsc::channel(1);

    info!(target: "main", "initializing the drive watcher...");
    let kill_cancel = cancel.clone();
    let kill_flag = Arc::clone(&kill_switch_fired);
    let kill_switch: gdrive::KillSwitch = Arc::new(move || {
        kill_flag.store(true, Ordering::SeqCst);
        kill_cancel.cancel();
    });
    let watcher = match gdrive::Controller::new(
        cancel.clone(),
        SnoopConfig {
            config_path: conf.rclone_config_path.clone(),
            drive_backend_name: conf.drive_backend_name.clone(),
            crypt_backend_name: conf.crypt_backend_name.clone(),
        },
        gdrive::Config {
            poll_interval: conf.poll_interval,
            state: Box::new(store.realm("drive_state")),
            index: Box::new(store.realm("drive_index")),
            kill_switch,
            output: changes_tx,
        },
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(target: "main", "failed to initialize the drive watcher: {e}");
            cancel.cancel();
            store.stop().await;
            return EXIT_WATCHER_INIT;
        }
    };
    info!(target: "main", "drive watcher started");

    info!(target: "main", "initializing the scan scheduler...");
    let scheduler = match plex::Controller::new(
        cancel.clone(),
        plex::Config {
            input: changes_rx,
            poll_interval: conf.poll_interval,
            dir_cache_time: conf.dir_cache_time,
            mount_point: conf.mount_path.clone(),
            plex_url: conf.plex_url.clone(),
            plex_token: conf.plex_token.clone(),
            product_name: env!("CARGO_PKG_NAME").to_string(),
            product_version: env!("CARGO_PKG_VERSION").to_string(),
            state: Box::new(store.realm("plex_state")),
        },
    ) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!(target: "main", "failed to initialize the scan scheduler: {e}");
            cancel.cancel();
            watcher.wait_until_full_stop().await;
            store.stop().await;
            return EXIT_SCHEDULER_INIT;
        }
    };
    info!(target: "main", "scan scheduler started");

    // We are ready.
    info!(target: "main", "{} v{} ready", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    cancel.cancelled().await;

    // Cooperative shutdown: workers first, storage last.
    debug!(target: "main", "main context cancelled, stopping");
    tokio::join!(
        watcher.wait_until_full_stop(),
        scheduler.wait_until_full_stop()
    );
    store.stop().await;
    debug!(target: "main", "clean stop ok, exiting");

    if kill_switch_fired.load(Ordering::SeqCst) {
        EXIT_KILL_SWITCH
    } else {
        EXIT_OK
    }
}

#[cfg(unix)]
async fn handle_signals(cancel: CancellationToken, store: Arc<Store>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(target: "main", "can not register the SIGTERM handler: {e}");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(target: "main", "can not register the SIGINT handler: {e}");
            return;
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(target: "main", "can not register the SIGUSR1 handler: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "main", "signal 'SIGTERM' caught: initiating clean stop");
                cancel.cancel();
                return;
            }
            _ = sigint.recv() => {
                info!(target: "main", "signal 'SIGINT' caught: initiating clean stop");
                cancel.cancel();
                return;
            }
            _ = sigusr1.recv() => {
                info!(target: "main", "signal 'SIGUSR1' caught: snapshotting the db");
                if let Err(e) = store.backup() {
                    warn!(target: "main", "db snapshot failed: {e}");
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(cancel: CancellationToken, _store: Arc<Store>) {
    if let Ok(()) = tokio::signal::ctrl_c().await {
        info!(target: "main", "interrupt caught: initiating clean stop");
        cancel.cancel();
    }
}
