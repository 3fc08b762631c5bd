//! Index maintenance: the initial full listing and per-batch
//! incorporation of raw changes, including the transitive fetch of
//! missing parents that keeps path resolution total.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use models::NodeInfo;
use storage::{Realm, RealmExt};
use tracing::{debug, info};

use crate::api::{DriveApi, DriveChange, DriveFile};
use crate::error::WatchError;

const PROGRESS_EVERY: Duration = Duration::from_secs(60);

fn node_from_file(file: &DriveFile) -> NodeInfo {
    NodeInfo {
        name: file.name.clone(),
        folder: file.folder,
        parents: file.parents.clone(),
    }
}

/// Stream the full non-trashed listing into the index. Returns the number
/// of nodes indexed.
pub(crate) async fn initial_build(
    api: &dyn DriveApi,
    index: &dyn Realm,
) -> Result<usize, WatchError> {
    info!(target: "drive", "building the initial index...");
    let start = Instant::now();
    let mut last_progress = Instant::now();
    let mut total = 0usize;
    let mut lookup: HashSet<String> = HashSet::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = api.list_page(page_token.as_deref()).await?;
        for file in &page.files {
            index.set(&file.id, &node_from_file(file))?;
            // All parents show up in the listing themselves, except the
            // root folder: remember anything unseen for the closure below.
            for parent in &file.parents {
                lookup.insert(parent.clone());
            }
            total += 1;
        }
        if last_progress.elapsed() >= PROGRESS_EVERY {
            info!(target: "drive", indexed = total, "still indexing the drive...");
            last_progress = Instant::now();
        }
        match page.next_page_token {
            Some(next) if !next.is_empty() => page_token = Some(next),
            _ => break,
        }
    }
    fetch_and_add_if_missing(api, index, lookup).await?;
    info!(
        target: "drive",
        nodes = total,
        elapsed = ?start.elapsed(),
        "index built"
    );
    Ok(total)
}

/// Incorporate one batch of raw changes into the index.
///
/// Removed entries are left in place (their index entry is still needed to
/// resolve the deleted path; the watcher purges them after emission). The
/// missing-parent closure then guarantees every referenced id resolves.
pub(crate) async fn incorporate_changes(
    api: &dyn DriveApi,
    index: &dyn Realm,
    changes: &[DriveChange],
) -> Result<(), WatchError> {
    let mut lookup: HashSet<String> = HashSet::new();
    for change in changes {
        if change.change_type != "file" {
            continue;
        }
        if change.removed {
            continue;
        }
        match &change.file {
            None => {
                lookup.insert(change.file_id.clone());
            }
            Some(file) => {
                index.set(
                    &change.file_id,
                    &NodeInfo {
                        name: file.name.clone(),
                        folder: file.folder,
                        parents: file.parents.clone(),
                    },
                )?;
                for parent in &file.parents {
                    lookup.insert(parent.clone());
                }
            }
        }
    }
    fetch_and_add_if_missing(api, index, lookup).await
}

/// Fetch every id of `lookup` that the index does not know yet, feeding
/// freshly discovered parents back into the search until it closes.
pub(crate) async fn fetch_and_add_if_missing(
    api: &dyn DriveApi,
    index: &dyn Realm,
    mut lookup: HashSet<String>,
) -> Result<(), WatchError> {
    while !lookup.is_empty() {
        let mut next: HashSet<String> = HashSet::new();
        for id in lookup {
            if index.has(&id) {
                continue;
            }
            debug!(target: "drive", file_id = %id, "fetching infos for unknown fileID");
            let file = api.file_info(&id).await?;
            index.set(&id, &node_from_file(&file))?;
            for parent in file.parents {
                if !index.has(&parent) {
                    next.insert(parent);
                }
            }
        }
        lookup = next;
    }
    Ok(())
}
