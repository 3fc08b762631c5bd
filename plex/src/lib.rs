//! Scan scheduler: consumes the watcher's change batches, maps changed
//! paths onto media libraries, and fires delayed partial scans, keeping
//! undispatched jobs across restarts.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use models::FileChange;
use storage::Realm;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use url::Url;

pub mod api;
mod jobs;
mod state;
mod worker;

pub use api::{Client, ClientConfig, PlexApi, PlexError};
pub use jobs::ScanJob;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("mount point path should be absolute: {0}")]
    MountNotAbsolute(String),
    #[error("failed to recover or generate a client ID for the plex API: {0}")]
    ClientId(#[from] storage::StoreError),
    #[error("failed to instantiate the Plex API client: {0}")]
    Api(#[from] PlexError),
}

pub struct Config {
    pub input: mpsc::Receiver<Vec<FileChange>>,
    /// The mount layer's change poll interval: a created file is visible
    /// locally at most this long after its event time.
    pub poll_interval: Duration,
    /// How long the mount layer caches directory listings; deletions stay
    /// visible for up to this long.
    pub dir_cache_time: Duration,
    pub mount_point: String,
    pub plex_url: Url,
    pub plex_token: String,
    pub product_name: String,
    pub product_version: String,
    pub state: Box<dyn Realm>,
}

pub(crate) struct SchedulerCtx {
    pub api: Arc<dyn PlexApi>,
    pub state: Box<dyn Realm>,
    pub mount_point: String,
    pub poll_interval: Duration,
    pub dir_cache_time: Duration,
    pub cancel: CancellationToken,
    /// Jobs to restore at startup and jobs parked by executors at
    /// shutdown.
    pub pending: StdMutex<Vec<ScanJob>>,
    /// Every live executor task, so shutdown can join them all.
    pub tracker: TaskTracker,
}

pub struct Controller {
    ctx: Arc<SchedulerCtx>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(cancel: CancellationToken, conf: Config) -> Result<Self, InitError> {
        if !conf.mount_point.starts_with('/') {
            return Err(InitError::MountNotAbsolute(conf.mount_point));
        }
        let client_id = state::get_client_id(conf.state.as_ref())?;
        let client = Client::new(ClientConfig {
            base_url: conf.plex_url.clone(),
            token: conf.plex_token.clone(),
            product_name: conf.product_name.clone(),
            product_version: conf.product_version.clone(),
            client_id,
        })?;
        Ok(Self::with_api(cancel, Arc::new(client), conf))
    }

    /// Same controller over an injected API implementation. The
    /// production path goes through [`Self::new`].
    pub fn with_api(
        cancel: CancellationToken,
        api: Arc<dyn PlexApi>,
        conf: Config,
    ) -> Self {
        let mount_point = normalize_mount_point(&conf.mount_point);
        let restored = jobs::restore_jobs(conf.state.as_ref());
        let ctx = Arc::new(SchedulerCtx {
            api,
            state: conf.state,
            mount_point,
            poll_interval: conf.poll_interval,
            dir_cache_time: conf.dir_cache_time,
            cancel,
            pending: StdMutex::new(restored),
            tracker: TaskTracker::new(),
        });
        let handle = tokio::spawn(worker::run(Arc::clone(&ctx), conf.input));
        Controller {
            ctx,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Wait for the dispatch worker and every executor to wind down, then
    /// persist whatever never fired.
    pub async fn wait_until_full_stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        debug!(target: "plex", "saving unstarted jobs to state...");
        let pending = {
            let mut pending = self
                .ctx
                .pending
                .lock()
                .expect("pending jobs lock poisoned");
            std::mem::take(&mut *pending)
        };
        jobs::save_jobs(self.ctx.state.as_ref(), &pending);
        info!(target: "plex", "fully stopped");
    }
}

/// Trim the trailing separator; prefix matching appends its own.
fn normalize_mount_point(mount_point: &str) -> String {
    if mount_point == "/" {
        return mount_point.to_string();
    }
    mount_point.trim_end_matches('/').to_string()
}
