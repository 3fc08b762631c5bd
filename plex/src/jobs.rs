//! Scan jobs: creation from change batches, parent/child consolidation,
//! timer-parked execution, and persistence of whatever did not run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storage::{Realm, RealmExt};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::api::Library;
use crate::SchedulerCtx;

pub(crate) const SAFETY_MARGIN: Duration = Duration::from_secs(1);
pub(crate) const STATE_JOBS_TOTAL_KEY: &str = "jobs_len";
pub(crate) const STATE_JOBS_PREFIX: &str = "jobs_#";

/// One pending partial scan of a library path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    #[serde(rename = "libKey")]
    pub lib_key: String,
    #[serde(rename = "libName")]
    pub lib_name: String,
    #[serde(rename = "scanAt", with = "time::serde::rfc3339")]
    pub scan_at: OffsetDateTime,
    #[serde(rename = "scanPath")]
    pub scan_path: String,
}

/// One job per library whose locations contain `scan_path`.
pub(crate) fn generate_jobs_definition(
    scan_path: &str,
    scan_at: OffsetDateTime,
    libs: &[Library],
) -> Vec<ScanJob> {
    let mut jobs = Vec::new();
    let mut matched: HashSet<&str> = HashSet::new();
    for lib in libs {
        if matched.contains(lib.key.as_str()) {
            continue;
        }
        if lib
            .locations
            .iter()
            .any(|location| scan_path.starts_with(location.as_str()))
        {
            debug!(
                target: "plex",
                "library '{}' has a location containing '{scan_path}' which needs (re)scan: adding to job creation list",
                lib.title
            );
            matched.insert(lib.key.as_str());
            jobs.push(ScanJob {
                lib_key: lib.key.clone(),
                lib_name: lib.title.clone(),
                scan_at,
                scan_path: scan_path.to_string(),
            });
        }
    }
    jobs
}

/// Drop jobs whose path is strictly under another scheduled path of the
/// same library; a dropped child occurring later pushes the surviving
/// parent's scan time back so both end up visible on the mount.
pub(crate) fn consolidate_and_optimize(mut jobs: Vec<ScanJob>) -> Vec<ScanJob> {
    let mut removed: HashSet<usize> = HashSet::new();
    for parent_idx in 0..jobs.len() {
        for child_idx in 0..jobs.len() {
            if parent_idx == child_idx || removed.contains(&child_idx) {
                continue;
            }
            if jobs[parent_idx].lib_key != jobs[child_idx].lib_key {
                continue;
            }
            let parent_path = jobs[parent_idx].scan_path.clone();
            let child = &jobs[child_idx];
            if child.scan_path.len() > parent_path.len()
                && child.scan_path.starts_with(parent_path.as_str())
            {
                debug!(
                    target: "plex",
                    "library '{}': path '{}' removed from scan list: its parent '{}' is already scheduled for scan",
                    child.lib_name, child.scan_path, parent_path
                );
                removed.insert(child_idx);
                let child_scan_at = child.scan_at;
                if child_scan_at > jobs[parent_idx].scan_at {
                    debug!(
                        target: "plex",
                        "library '{}': delaying the scan of the parent '{}' because the removed child path was scheduled later",
                        jobs[parent_idx].lib_name, parent_path
                    );
                    jobs[parent_idx].scan_at = child_scan_at;
                }
            }
        }
    }
    let mut index = 0;
    jobs.retain(|_| {
        let keep = !removed.contains(&index);
        index += 1;
        keep
    });
    jobs
}

/// Wait out the job's scan time, then fire the partial scan. On shutdown
/// before the timer elapses, the job is parked for persistence instead.
pub(crate) async fn job_executor(ctx: Arc<SchedulerCtx>, job: ScanJob) {
    let wait = (job.scan_at - OffsetDateTime::now_utc()).max(time::Duration::ZERO);
    let wait = Duration::try_from(wait).unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            info!(
                target: "plex",
                "scan job for '{}' on '{}' is not yet launched, saving for resume later...",
                job.lib_name, job.scan_path
            );
            ctx.pending.lock().expect("pending jobs lock poisoned").push(job);
        }
        _ = tokio::time::sleep(wait) => {
            match ctx.api.scan_library(&job.lib_key, &job.scan_path).await {
                Ok(()) => info!(
                    target: "plex",
                    "successfully launched a partial scan for '{}' on path '{}'",
                    job.lib_name, job.scan_path
                ),
                Err(e) => error!(
                    target: "plex",
                    "failed to start partial library scan for '{}' on path '{}': {e}",
                    job.lib_name, job.scan_path
                ),
            }
        }
    }
}

/// Read back every persisted job, deleting the keys as they are consumed.
pub(crate) fn restore_jobs(state: &dyn Realm) -> Vec<ScanJob> {
    let total: usize = match state.get(STATE_JOBS_TOTAL_KEY) {
        Ok(Some(total)) => total,
        Ok(None) => {
            debug!(target: "plex", "saved jobs index not found in db, assuming no job needs resuming");
            return Vec::new();
        }
        Err(e) => {
            error!(
                target: "plex",
                "failed to load the total number of saved job(s), the db might have become inconsistent: {e}"
            );
            return Vec::new();
        }
    };
    let mut restored = Vec::with_capacity(total);
    for i in 0..total {
        let job_key = format!("{STATE_JOBS_PREFIX}{i}");
        match state.get::<ScanJob>(&job_key) {
            Ok(Some(job)) => restored.push(job),
            Ok(None) => error!(
                target: "plex",
                "failed to restore the job #{i}: not found within db (is the db inconsistent?)"
            ),
            Err(e) => {
                error!(target: "plex", "failed to restore the job #{i}: {e}");
                continue;
            }
        }
        if let Err(e) = state.delete(&job_key) {
            error!(
                target: "plex",
                "failed to delete the restored job #{i} from the db, it might have become inconsistent: {e}"
            );
        }
    }
    if let Err(e) = state.delete(STATE_JOBS_TOTAL_KEY) {
        error!(
            target: "plex",
            "failed to delete the total number of saved jobs from the db, it might have become inconsistent: {e}"
        );
    }
    if restored.is_empty() {
        debug!(target: "plex", "no previously planned scan job found/restored");
    } else {
        info!(
            target: "plex",
            "restored {} previously planned scan job(s)",
            restored.len()
        );
    }
    restored
}

/// Persist undispatched jobs under numbered keys, then the count. One bad
/// job loses that job only.
pub(crate) fn save_jobs(state: &dyn Realm, jobs: &[ScanJob]) {
    let mut written = 0usize;
    for (index, job) in jobs.iter().enumerate() {
        let job_key = format!("{STATE_JOBS_PREFIX}{written}");
        if let Err(e) = state.set(&job_key, job) {
            error!(
                target: "plex",
                "failed to save the unstarted job #{index}, job will be lost: {} @ {}: {e}",
                job.lib_name, job.scan_path
            );
        } else {
            written += 1;
        }
    }
    if let Err(e) = state.set(STATE_JOBS_TOTAL_KEY, &written) {
        error!(
            target: "plex",
            "failed to save the total number of saved job(s), the db might have become inconsistent: {e}"
        );
    }
}

/// Per-parent scan times for one change batch: folders that still exist
/// scan nothing, deletions wait out the directory cache, and a parent
/// seen twice keeps the later time.
pub(crate) fn extract_base_paths_to_scan(
    changes: &[models::FileChange],
    mount_point: &str,
    poll_interval: Duration,
    dir_cache_time: Duration,
) -> HashMap<String, OffsetDateTime> {
    let mut scan_list: HashMap<String, OffsetDateTime> = HashMap::new();
    for change in changes {
        for change_path in &change.paths {
            if change.folder && !change.deleted {
                info!(
                    target: "plex",
                    "skipping folder change not being a deletion: {change_path}"
                );
                continue;
            }
            let wait_until = if change.deleted {
                // The mount layer caches negative lookups for the dir
                // cache time.
                change.event_time + dir_cache_time + SAFETY_MARGIN
            } else {
                change.event_time + poll_interval + SAFETY_MARGIN
            };
            let parent = local_parent(mount_point, change_path);
            match scan_list.get(&parent) {
                None => {
                    let action = if change.deleted {
                        "deleted"
                    } else {
                        "created or changed"
                    };
                    info!(
                        target: "plex",
                        "'{change_path}' {action}, adding its local parent to the scan list: {parent}"
                    );
                    scan_list.insert(parent, wait_until);
                }
                Some(&scheduled) if scheduled < wait_until => {
                    debug!(
                        target: "plex",
                        "path '{parent}' was already registered for scan at {scheduled}; this event is younger, replacing time: {wait_until}"
                    );
                    scan_list.insert(parent, wait_until);
                }
                Some(&scheduled) => {
                    debug!(
                        target: "plex",
                        "path '{parent}' is already registered for scan at {scheduled}, skipping the event at {wait_until}"
                    );
                }
            }
        }
    }
    scan_list
}

/// The mounted directory containing `change_path`.
fn local_parent(mount_point: &str, change_path: &str) -> String {
    let dir = match change_path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };
    let dir = dir.trim_matches('/');
    let mount = mount_point.trim_end_matches('/');
    if dir.is_empty() {
        mount.to_string()
    } else {
        format!("{mount}/{dir}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn lib(key: &str, title: &str, locations: &[&str]) -> Library {
        Library {
            key: key.to_string(),
            title: title.to_string(),
            locations: locations.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn change(paths: &[&str], folder: bool, deleted: bool) -> models::FileChange {
        models::FileChange {
            event_time: datetime!(2024-01-02 03:04:05 UTC),
            folder,
            deleted,
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn scan_times_honor_poll_interval_and_dir_cache() {
        let poll = Duration::from_secs(60);
        let cache = Duration::from_secs(300);
        let scan_list = extract_base_paths_to_scan(
            &[
                change(&["/docs/F"], false, false),
                change(&["/videos/old.mkv"], false, true),
            ],
            "/mnt",
            poll,
            cache,
        );
        assert_eq!(
            scan_list.get("/mnt/docs").copied().unwrap(),
            datetime!(2024-01-02 03:05:06 UTC)
        );
        assert_eq!(
            scan_list.get("/mnt/videos").copied().unwrap(),
            datetime!(2024-01-02 03:09:06 UTC)
        );
    }

    #[test]
    fn surviving_folders_are_skipped_and_later_events_win() {
        let poll = Duration::from_secs(60);
        let cache = Duration::from_secs(300);
        let scan_list = extract_base_paths_to_scan(
            &[
                change(&["/docs"], true, false),
                change(&["/docs/a"], false, false),
                change(&["/docs/b"], false, true),
            ],
            "/mnt",
            poll,
            cache,
        );
        // The folder creation contributed nothing; the deletion's later
        // wait replaced the creation's.
        assert_eq!(scan_list.len(), 1);
        assert_eq!(
            scan_list.get("/mnt/docs").copied().unwrap(),
            datetime!(2024-01-02 03:09:06 UTC)
        );
    }

    #[test]
    fn root_level_changes_scan_the_mount_itself() {
        let scan_list = extract_base_paths_to_scan(
            &[change(&["/F"], false, false)],
            "/mnt",
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        assert!(scan_list.contains_key("/mnt"));
    }

    #[test]
    fn jobs_match_libraries_by_location_prefix() {
        let libs = vec![
            lib("1", "Movies", &["/mnt/movies"]),
            lib("2", "Shows", &["/mnt/shows", "/mnt/anime"]),
        ];
        let when = datetime!(2024-01-02 03:05:06 UTC);
        let jobs = generate_jobs_definition("/mnt/shows/s01", when, &libs);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].lib_key, "2");
        assert_eq!(jobs[0].lib_name, "Shows");
        assert_eq!(jobs[0].scan_at, when);

        assert!(generate_jobs_definition("/elsewhere", when, &libs).is_empty());
    }

    #[test]
    fn consolidation_drops_children_and_keeps_the_later_time() {
        let early = datetime!(2024-01-02 03:05:06 UTC);
        let late = datetime!(2024-01-02 03:09:06 UTC);
        let job = |path: &str, at, key: &str| ScanJob {
            lib_key: key.to_string(),
            lib_name: format!("lib{key}"),
            scan_at: at,
            scan_path: path.to_string(),
        };
        let jobs = consolidate_and_optimize(vec![
            job("/mnt/shows", early, "2"),
            job("/mnt/shows/s01", late, "2"),
            job("/mnt/shows/s01", late, "1"),
        ]);
        // No two same-library jobs in strict prefix relation survive.
        for a in &jobs {
            for b in &jobs {
                if a != b && a.lib_key == b.lib_key {
                    assert!(!b.scan_path.starts_with(&a.scan_path));
                }
            }
        }
        assert_eq!(jobs.len(), 2);
        let parent = jobs.iter().find(|j| j.lib_key == "2").unwrap();
        assert_eq!(parent.scan_path, "/mnt/shows");
        assert_eq!(parent.scan_at, late);
        // The other library keeps its own child job untouched.
        assert!(jobs.iter().any(|j| j.lib_key == "1" && j.scan_at == late));
    }

    #[test]
    fn scan_jobs_persist_with_their_wire_field_names() {
        let job = ScanJob {
            lib_key: "2".to_string(),
            lib_name: "Shows".to_string(),
            scan_at: datetime!(2024-01-02 03:05:06 UTC),
            scan_path: "/mnt/shows".to_string(),
        };
        let raw = serde_json::to_value(&job).unwrap();
        assert_eq!(raw["libKey"], "2");
        assert_eq!(raw["libName"], "Shows");
        assert_eq!(raw["scanAt"], "2024-01-02T03:05:06Z");
        assert_eq!(raw["scanPath"], "/mnt/shows");
    }
}
