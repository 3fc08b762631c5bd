//! The Drive API seam: just the four calls the watcher needs.

use async_trait::async_trait;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network trouble, 5xx, rate limiting. Retried on the next poll tick.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// Invalid credentials, revoked permissions, missing files. Escalates.
    #[error("fatal remote failure: {0}")]
    Fatal(String),
    #[error("cancelled while waiting for the remote")]
    Cancelled,
}

/// One file entry as returned by `files.get` / `files.list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub folder: bool,
    pub parents: Vec<String>,
}

/// File payload attached to a change entry (absent for removals).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFile {
    pub name: String,
    pub folder: bool,
    pub trashed: bool,
    pub parents: Vec<String>,
}

/// One raw entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveChange {
    /// `"file"` or `"drive"`; only file changes are processed.
    pub change_type: String,
    pub file_id: String,
    pub removed: bool,
    /// RFC 3339 instant, parsed during translation.
    pub time: String,
    pub file: Option<ChangeFile>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<DriveChange>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub files: Vec<DriveFile>,
    pub next_page_token: Option<String>,
}

/// Drive v3 subset used by the watcher. Every implementation is expected
/// to rate-limit itself and honor cancellation.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// `files.get`. `file_id` may be the literal `"root"`; the returned
    /// entry carries the resolved id.
    async fn file_info(&self, file_id: &str) -> Result<DriveFile, ApiError>;

    /// `changes.getStartPageToken`.
    async fn start_page_token(&self) -> Result<String, ApiError>;

    /// One page of `files.list` over the non-trashed corpus.
    async fn list_page(&self, page_token: Option<&str>) -> Result<ListPage, ApiError>;

    /// One page of `changes.list`.
    async fn changes_page(&self, page_token: &str) -> Result<ChangePage, ApiError>;
}
