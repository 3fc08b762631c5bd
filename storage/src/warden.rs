use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Shared;

const WARDEN_PERIOD: Duration = Duration::from_secs(10 * 60);
const MIN_RECLAIM_RATIO: f64 = 0.10;
const MIN_RECLAIM_BYTES: u64 = 10 * 1024 * 1024;

/// Periodic compaction pass over the store. Triggers a merge once enough
/// dead bytes have accumulated, either absolutely or relative to the total
/// size on disk.
pub(crate) async fn warden(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + WARDEN_PERIOD, WARDEN_PERIOD);
    debug!(target: "storage", "will check the db every {WARDEN_PERIOD:?}");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "storage", "stopping warden as the main context has been cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }
        let pass_shared = Arc::clone(&shared);
        if let Err(e) = tokio::task::spawn_blocking(move || warden_pass(&pass_shared)).await {
            error!(target: "storage", "warden pass panicked: {e}");
        }
    }
}

fn warden_pass(shared: &Shared) {
    debug!(target: "storage", "checking the db...");
    let stats = shared.engine().stats();
    info!(
        target: "storage",
        data_files = stats.data_files,
        keys = stats.keys,
        total_bytes = stats.total_bytes,
        "db stats"
    );
    if stats.reclaimable_bytes == 0 {
        return;
    }
    let ratio = stats.reclaimable_bytes as f64 / stats.total_bytes.max(1) as f64;
    if stats.reclaimable_bytes >= MIN_RECLAIM_BYTES || ratio >= MIN_RECLAIM_RATIO {
        info!(
            target: "storage",
            "reclaiming {} bytes ({:.02}% of total db size) of disk space...",
            stats.reclaimable_bytes,
            ratio * 100.0
        );
        if let Err(e) = shared.engine().merge() {
            error!(target: "storage", "failed to reclaim disk space: {e}");
        } else {
            info!(
                target: "storage",
                "successfully reclaimed {} bytes ({:.02}% of total db size) of disk space",
                stats.reclaimable_bytes,
                ratio * 100.0
            );
        }
    } else {
        debug!(
            target: "storage",
            "reclaimable space is too low to perform a merge: {:.02}% representing {} bytes",
            ratio * 100.0,
            stats.reclaimable_bytes
        );
    }
}
