//! Startup validation of the persisted watcher state against the remote
//! drive, and the full reset when they disagree.

use models::NodeInfo;
use storage::{Realm, RealmExt};
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::index;
use crate::WatcherCtx;

pub(crate) const ROOT_FOLDER_ID_KEY: &str = "rootFolderID";
pub(crate) const NEXT_START_PAGE_KEY: &str = "nextStartPage";
pub(crate) const INDEX_OK_KEY: &str = "indexOK";

pub(crate) async fn validate_state(ctx: &WatcherCtx) -> Result<(), WatchError> {
    info!(target: "drive", "validating local state against the remote drive...");
    let root = ctx.api.file_info("root").await?;
    let remote_root_id = root.id.clone();
    let remote_infos = NodeInfo {
        name: root.name,
        folder: root.folder,
        parents: root.parents,
    };
    debug!(target: "drive", root_id = %remote_root_id, "remote root id recovered");
    if stored_state_matches(ctx, &remote_root_id, &remote_infos)? {
        debug!(
            target: "drive",
            root_id = %remote_root_id,
            "the rootID and its metadata in our local state seem valid"
        );
        return Ok(());
    }
    reinit_state(ctx, &remote_root_id, &remote_infos).await
}

fn stored_state_matches(
    ctx: &WatcherCtx,
    remote_root_id: &str,
    remote_infos: &NodeInfo,
) -> Result<bool, WatchError> {
    let stored_root_id: String = match ctx.state.get(ROOT_FOLDER_ID_KEY)? {
        Some(id) => id,
        None => {
            info!(target: "drive", "no stored root folderID found: starting a new state");
            return Ok(false);
        }
    };
    if stored_root_id != remote_root_id {
        warn!(
            target: "drive",
            "rootID has changed ({stored_root_id} -> {remote_root_id}): reiniting local state"
        );
        return Ok(false);
    }
    let stored_infos: NodeInfo = match ctx.index.get(&stored_root_id)? {
        Some(infos) => infos,
        None => {
            warn!(
                target: "drive",
                "we have a stored rootFolderID but it is not present in our index: reiniting local state"
            );
            return Ok(false);
        }
    };
    if stored_infos != *remote_infos {
        warn!(
            target: "drive",
            "our cached root property is not the same as remote ({stored_infos:?} -> {remote_infos:?}): reiniting local state"
        );
        return Ok(false);
    }
    if ctx.state.get::<String>(NEXT_START_PAGE_KEY)?.is_none() {
        warn!(
            target: "drive",
            "did not find any changes startNextPage token in our state: reiniting local state"
        );
        return Ok(false);
    }
    if !ctx.state.has(INDEX_OK_KEY) {
        warn!(target: "drive", "local index is incomplete: reiniting local state");
        return Ok(false);
    }
    if let Some(custom_root) = &ctx.root_folder_id {
        if !ctx.index.has(custom_root) {
            warn!(
                target: "drive",
                "custom root folder ID ('{custom_root}') not found within our index: reiniting local state"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

async fn reinit_state(
    ctx: &WatcherCtx,
    remote_root_id: &str,
    remote_infos: &NodeInfo,
) -> Result<(), WatchError> {
    ctx.state.clear()?;
    ctx.index.clear()?;
    ctx.state.set(ROOT_FOLDER_ID_KEY, remote_root_id)?;
    ctx.index.set(remote_root_id, remote_infos)?;
    // Team drives report their root under a different id form; alias it so
    // both resolve identically.
    if let Some(team_drive) = &ctx.team_drive {
        if team_drive != remote_root_id {
            debug!(
                target: "drive",
                "retrieved root folderID '{remote_root_id}' is different than the supplied teamdrive ID '{team_drive}': cloning it within the index"
            );
            ctx.index.set(team_drive, remote_infos)?;
        }
    }
    // A configured custom root must exist upstream before we rely on it.
    if let Some(custom_root) = &ctx.root_folder_id {
        ctx.api.file_info(custom_root).await?;
    }
    let next_start_page = ctx.api.start_page_token().await?;
    ctx.state.set(NEXT_START_PAGE_KEY, &next_start_page)?;
    index::initial_build(ctx.api.as_ref(), ctx.index.as_ref()).await?;
    ctx.state.set(INDEX_OK_KEY, &true)?;
    Ok(())
}
