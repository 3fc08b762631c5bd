//! Embedded key/value persistence for the daemon.
//!
//! One log-structured store on disk, shared by every component through
//! realm-scoped views (`drive_state`, `drive_index`, `plex_state`). The
//! store keeps its own `stats` realm and runs a background compaction
//! pass.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod error;
mod log;
mod realm;
mod stats;
mod warden;

pub use error::StoreError;
pub use log::EngineStats;
pub use realm::{MemoryRealm, Realm, RealmExt, RealmView};

use log::Engine;
use stats::SizeStats;

const STATS_REALM: &str = "stats";

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Optional instance name, suffixed to the storage directory names so
    /// several daemons can coexist in the same working directory.
    pub instance: Option<String>,
    /// Parent directory for the storage directories. Defaults to the
    /// current working directory.
    pub root: Option<PathBuf>,
}

pub(crate) struct Shared {
    engine: Mutex<Engine>,
    size_stats: Mutex<SizeStats>,
}

impl Shared {
    pub(crate) fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().expect("store engine lock poisoned")
    }

    pub(crate) fn observe_sizes(&self, key_len: usize, value_len: usize) {
        self.size_stats
            .lock()
            .expect("store stats lock poisoned")
            .observe(key_len, value_len);
    }
}

/// The store controller: owns the on-disk engine, hands out realm views,
/// and runs the compaction warden until [`Store::stop`] is called.
pub struct Store {
    shared: Arc<Shared>,
    backup_path: PathBuf,
    cancel: CancellationToken,
    warden: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Open the store, snapshot it into the backup directory (best-effort)
    /// and start the warden.
    pub fn open(conf: StoreConfig) -> Result<Self, StoreError> {
        let suffix = match &conf.instance {
            Some(instance) if !instance.is_empty() => format!("_{instance}"),
            _ => String::new(),
        };
        let root = conf.root.unwrap_or_else(|| PathBuf::from("."));
        let main_path = root.join(format!("scanbridge_storage{suffix}"));
        let backup_path = root.join(format!("scanbridge_storage{suffix}_backup"));

        let mut engine = Engine::open(&main_path)?;
        debug!(target: "storage", path = %main_path.display(), "db successfully open");
        if let Err(e) = engine.snapshot_to(&backup_path) {
            warn!(target: "storage", "could not snapshot the db into the backup copy: {e}");
        } else {
            debug!(target: "storage", "db backup successful");
        }

        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            size_stats: Mutex::new(SizeStats::default()),
        });
        let store = Store {
            shared: Arc::clone(&shared),
            backup_path,
            cancel: CancellationToken::new(),
            warden: Mutex::new(None),
        };

        let loaded = stats::load(&store.realm(STATS_REALM));
        *shared.size_stats.lock().expect("store stats lock poisoned") = loaded;

        let handle = tokio::spawn(warden::warden(shared, store.cancel.clone()));
        *store.warden.lock().expect("warden handle lock poisoned") = Some(handle);
        Ok(store)
    }

    /// A realm-scoped view. Realms are plain key prefixes; nothing prevents
    /// two views on the same realm, so writers must agree on ownership.
    pub fn realm(&self, name: &str) -> RealmView {
        RealmView::new(name, Arc::clone(&self.shared))
    }

    /// Snapshot the main store into the backup directory without
    /// interrupting service (SIGUSR1 handler).
    pub fn backup(&self) -> Result<(), StoreError> {
        self.shared.engine().snapshot_to(&self.backup_path)
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.engine().stats()
    }

    /// Stop the warden, persist size stats and close the db. A close
    /// failure leaves the backup copy untouched for the next start.
    pub async fn stop(&self) {
        debug!(target: "storage", "stop signal received, stopping workers...");
        self.cancel.cancel();
        let snapshot = *self
            .shared
            .size_stats
            .lock()
            .expect("store stats lock poisoned");
        stats::save(&self.realm(STATS_REALM), snapshot);
        let handle = self
            .warden
            .lock()
            .expect("warden handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(target: "storage", "workers stopped, closing the db...");
        if let Err(e) = self.shared.engine().close() {
            error!(
                target: "storage",
                "can not cleanly close the db, it might get corrupt, please consider using the backup copy before restarting: {e}"
            );
            return;
        }
        info!(target: "storage", "database closed");
    }
}
