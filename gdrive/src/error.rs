use crate::api::ApiError;
use storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("local state: {0}")]
    Storage(#[from] StoreError),
    #[error("fileID '{0}' not found in the local index")]
    IndexMiss(String),
    #[error("change for fileID '{0}' carries no metadata and has no index entry")]
    MissingMetadata(String),
    #[error("failed to parse change time '{raw}': {source}")]
    BadTime {
        raw: String,
        source: time::error::Parse,
    },
    #[error("end of changelist should contain newStartPageToken")]
    MissingStartToken,
    #[error("no changes start page token in the local state")]
    MissingCursor,
}

impl WatchError {
    /// Only revoked access and broken local storage are beyond what a
    /// retry of the pass can fix.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatchError::Api(ApiError::Fatal(_)) | WatchError::Storage(_)
        )
    }
}
