//! Remote drive watcher: validates local state, maintains the persistent
//! file index, and turns the remote change feed into path-level change
//! batches for the scan scheduler.

use std::sync::Arc;
use std::time::Duration;

use models::FileChange;
use snooper::{CryptBackend, SnoopConfig, Snooper};
use storage::Realm;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod api;
mod changes;
mod client;
mod error;
mod index;
mod path;
mod ratelimit;
mod state;
mod watcher;

pub use client::HttpDriveClient;
pub use error::WatchError;
pub use ratelimit::RateLimiter;

/// Cancels the whole process from inside a worker, for failures no retry
/// will fix.
pub type KillSwitch = Arc<dyn Fn() + Send + Sync>;

pub struct Config {
    pub poll_interval: Duration,
    pub state: Box<dyn Realm>,
    pub index: Box<dyn Realm>,
    pub kill_switch: KillSwitch,
    pub output: mpsc::Sender<Vec<FileChange>>,
}

/// Watch scoping recovered from the drive and crypt backends.
#[derive(Default)]
pub struct WatchOptions {
    pub root_folder_id: Option<String>,
    pub team_drive: Option<String>,
    pub crypt: Option<CryptBackend>,
}

pub(crate) struct WatcherCtx {
    pub api: Arc<dyn api::DriveApi>,
    pub state: Box<dyn Realm>,
    pub index: Box<dyn Realm>,
    pub root_folder_id: Option<String>,
    pub team_drive: Option<String>,
    pub crypt: Option<CryptBackend>,
    pub poll_interval: Duration,
    pub cancel: CancellationToken,
    pub kill_switch: KillSwitch,
    pub output: mpsc::Sender<Vec<FileChange>>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to initialize the RClone snooper: {0}")]
    Snoop(#[from] snooper::SnoopError),
    #[error(transparent)]
    Api(#[from] api::ApiError),
}

pub struct Controller {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Snoop the rclone configuration, build the Drive client and start
    /// the polling worker.
    pub fn new(
        cancel: CancellationToken,
        rclone: SnoopConfig,
        conf: Config,
    ) -> Result<Self, InitError> {
        let snooper = Snooper::new(rclone)?;
        info!(target: "drive", "{}", snooper.summary());
        let client = HttpDriveClient::new(&snooper.drive, cancel.clone())?;
        let options = WatchOptions {
            root_folder_id: snooper.drive.root_folder_id.clone(),
            team_drive: snooper.drive.team_drive.clone(),
            crypt: snooper.crypt,
        };
        Ok(Self::with_api(cancel, Arc::new(client), options, conf))
    }

    /// Same controller over an injected API implementation. The
    /// production path goes through [`Self::new`].
    pub fn with_api(
        cancel: CancellationToken,
        api: Arc<dyn api::DriveApi>,
        options: WatchOptions,
        conf: Config,
    ) -> Self {
        let ctx = WatcherCtx {
            api,
            state: conf.state,
            index: conf.index,
            root_folder_id: options.root_folder_id,
            team_drive: options.team_drive,
            crypt: options.crypt,
            poll_interval: conf.poll_interval,
            cancel,
            kill_switch: conf.kill_switch,
            output: conf.output,
        };
        let handle = tokio::spawn(watcher::run(Arc::new(ctx)));
        Controller {
            task: Mutex::new(Some(handle)),
        }
    }

    /// Wait for the polling worker to fully wind down after cancellation.
    pub async fn wait_until_full_stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(target: "drive", "fully stopped");
    }
}
