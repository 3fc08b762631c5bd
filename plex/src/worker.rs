//! The dispatch worker: consumes change batches, probes the media server
//! and fans scan jobs out to their executors.

use std::sync::Arc;

use models::FileChange;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::jobs::{
    consolidate_and_optimize, extract_base_paths_to_scan, generate_jobs_definition, job_executor,
};
use crate::SchedulerCtx;

pub(crate) async fn run(ctx: Arc<SchedulerCtx>, mut input: mpsc::Receiver<Vec<FileChange>>) {
    test_plex_connection(&ctx).await;
    // Launch whatever survived the previous run.
    let restored = {
        let mut pending = ctx.pending.lock().expect("pending jobs lock poisoned");
        std::mem::take(&mut *pending)
    };
    for (index, job) in restored.into_iter().enumerate() {
        debug!(
            target: "plex",
            "starting restored job #{}: {}, {}, {}",
            index + 1,
            job.lib_name,
            job.scan_path,
            job.scan_at
        );
        ctx.tracker.spawn(job_executor(Arc::clone(&ctx), job));
    }
    debug!(target: "plex", "waiting for input");
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(target: "plex", "stopping worker as the main context has been cancelled");
                return;
            }
            batch = input.recv() => {
                match batch {
                    Some(batch) => worker_pass(&ctx, batch).await,
                    None => {
                        debug!(target: "plex", "change channel closed, stopping worker");
                        return;
                    }
                }
            }
        }
    }
}

/// Startup probe: a library layout that can never match a change is
/// almost certainly a misconfiguration worth warning about.
async fn test_plex_connection(ctx: &SchedulerCtx) {
    let libs = match ctx.api.libraries().await {
        Ok(libs) => libs,
        Err(e) => {
            error!(target: "plex", "failed to query the current libraries: {e}");
            return;
        }
    };
    let mount_prefix = format!("{}/", ctx.mount_point.trim_end_matches('/'));
    let nb_paths: usize = libs.iter().map(|lib| lib.locations.len()).sum();
    let nb_candidates = libs
        .iter()
        .flat_map(|lib| lib.locations.iter())
        .filter(|location| location.starts_with(&mount_prefix) || **location == ctx.mount_point)
        .count();
    if nb_paths == 0 {
        warn!(
            target: "plex",
            "no location found in any library: change events won't trigger any scan"
        );
    } else if nb_candidates == 0 {
        warn!(
            target: "plex",
            "found {} libraries based on {nb_paths} locations but none are based on the mount point '{}': change events won't trigger any scan",
            libs.len(),
            ctx.mount_point
        );
    } else {
        info!(
            target: "plex",
            "found {} libraries based on {nb_paths} locations of which {nb_candidates} are based on the declared mount point '{}'",
            libs.len(),
            ctx.mount_point
        );
    }
}

async fn worker_pass(ctx: &Arc<SchedulerCtx>, changes: Vec<FileChange>) {
    debug!(target: "plex", "received a batch of {} change(s)", changes.len());
    let scan_list = extract_base_paths_to_scan(
        &changes,
        &ctx.mount_point,
        ctx.poll_interval,
        ctx.dir_cache_time,
    );
    if scan_list.is_empty() {
        return;
    }
    // The library layout can change at any time; ask again per batch.
    let libs = match ctx.api.libraries().await {
        Ok(libs) => libs,
        Err(e) => {
            error!(
                target: "plex",
                "failed to query the current libraries, aborting this batch: {e}"
            );
            return;
        }
    };
    let mut jobs = Vec::new();
    for (path, scan_at) in scan_list {
        jobs.extend(generate_jobs_definition(&path, scan_at, &libs));
    }
    debug!(target: "plex", "created {} scan job(s)", jobs.len());
    let jobs = consolidate_and_optimize(jobs);
    for (index, job) in jobs.into_iter().enumerate() {
        debug!(
            target: "plex",
            "launching job #{}: scheduling scan of '{}' in '{}' at {}",
            index + 1,
            job.scan_path,
            job.lib_name,
            job.scan_at
        );
        ctx.tracker.spawn(job_executor(Arc::clone(ctx), job));
    }
}
