//! The polling worker: one pass per tick, cursor backup/restore around
//! each pass, batch emission towards the scheduler.

use std::sync::Arc;

use models::FileChange;
use storage::RealmExt;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use crate::api::ApiError;
use crate::changes::{collapse_rewrites, process_changes_through_crypt, translate_changes};
use crate::error::WatchError;
use crate::index;
use crate::state::{self, NEXT_START_PAGE_KEY};
use crate::WatcherCtx;

pub(crate) async fn run(ctx: Arc<WatcherCtx>) {
    if let Err(e) = state::validate_state(&ctx).await {
        error!(target: "drive", "failed to validate local state: {e}");
        if !ctx.cancel.is_cancelled() {
            (ctx.kill_switch)();
        }
        return;
    }
    let mut ticker = interval_at(
        Instant::now() + ctx.poll_interval,
        ctx.poll_interval,
    );
    info!(target: "drive", "will check for changes every {:?}", ctx.poll_interval);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(target: "drive", "stopping watcher as the main context has been cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }
        worker_pass(&ctx).await;
    }
}

async fn worker_pass(ctx: &WatcherCtx) {
    debug!(target: "drive", "checking changes...");
    let batch = match one_pass(ctx).await {
        Ok(batch) => batch,
        Err(WatchError::Api(ApiError::Cancelled)) => {
            debug!(target: "drive", "pass interrupted by cancellation");
            return;
        }
        Err(e) if e.is_fatal() => {
            error!(target: "drive", "failed to process changes: {e}");
            if !ctx.cancel.is_cancelled() {
                (ctx.kill_switch)();
            }
            return;
        }
        Err(e) => {
            // Cursor already restored; the next tick replays the pass.
            error!(target: "drive", "failed to process changed files, will retry next tick: {e}");
            return;
        }
    };
    if batch.is_empty() {
        return;
    }
    for change in &batch {
        let kind = if change.folder { "directory" } else { "file" };
        let suffix = if change.deleted { " (removed)" } else { "" };
        for path in &change.paths {
            info!(target: "drive", "{kind} change detected: {path}{suffix}");
        }
    }
    debug!(target: "drive", "sending change(s)...");
    let sent = batch.len();
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            debug!(target: "drive", "dropping the pending batch, shutting down");
        }
        result = ctx.output.send(batch) => {
            if result.is_err() {
                error!(target: "drive", "change consumer is gone, batch lost");
            } else {
                debug!(target: "drive", "sent {sent} change(s)");
            }
        }
    }
}

/// One full polling pass. Any failure restores the cursor so the next
/// tick retries from the same point.
async fn one_pass(ctx: &WatcherCtx) -> Result<Vec<FileChange>, WatchError> {
    let cursor: String = ctx
        .state
        .get(NEXT_START_PAGE_KEY)?
        .ok_or(WatchError::MissingCursor)?;
    match fetch_and_process(ctx, &cursor).await {
        Ok(batch) => Ok(batch),
        Err(e) => {
            let stored: Option<String> = ctx.state.get(NEXT_START_PAGE_KEY).unwrap_or(None);
            if stored.as_deref() != Some(cursor.as_str()) {
                if let Err(restore_err) = ctx.state.set(NEXT_START_PAGE_KEY, &cursor) {
                    error!(
                        target: "drive",
                        "failed to restore the changes cursor after a failed pass: {restore_err}"
                    );
                }
            }
            Err(e)
        }
    }
}

async fn fetch_and_process(ctx: &WatcherCtx, cursor: &str) -> Result<Vec<FileChange>, WatchError> {
    // Drain the page chain first; progress is only saved at its end.
    let mut raw_changes = Vec::new();
    let mut page_token = cursor.to_string();
    let new_start_page = loop {
        let page = ctx.api.changes_page(&page_token).await?;
        raw_changes.extend(page.changes);
        match page.next_page_token {
            Some(next) if !next.is_empty() => {
                debug!(target: "drive", "another page of changes is available at {next}");
                page_token = next;
            }
            _ => {
                break page
                    .new_start_page_token
                    .filter(|token| !token.is_empty())
                    .ok_or(WatchError::MissingStartToken)?;
            }
        }
    };
    if new_start_page != cursor {
        debug!(
            target: "drive",
            "recovering the changes marker for the next run: {new_start_page}"
        );
        ctx.state.set(NEXT_START_PAGE_KEY, &new_start_page)?;
    }
    if raw_changes.is_empty() {
        return Ok(Vec::new());
    }
    debug!(target: "drive", count = raw_changes.len(), "raw change(s) received");

    index::incorporate_changes(ctx.api.as_ref(), ctx.index.as_ref(), &raw_changes).await?;
    let mut batch = translate_changes(
        ctx.index.as_ref(),
        ctx.root_folder_id.as_deref(),
        &raw_changes,
    )?;
    if let Some(crypt) = &ctx.crypt {
        let before = batch.len();
        batch = process_changes_through_crypt(batch, crypt);
        info!(
            target: "drive",
            "crypt process of changes removed {} change(s), remaining: {}",
            before - batch.len(),
            batch.len()
        );
    }
    let before = batch.len();
    batch = collapse_rewrites(batch);
    if before != batch.len() {
        debug!(
            target: "drive",
            "removed {} deletion event(s) because matching path change event(s) were along (rewritten file(s))",
            before - batch.len()
        );
    }
    Ok(batch)
}
