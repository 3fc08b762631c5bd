use crate::log::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key too large: {0} bytes (max {MAX_KEY_SIZE})")]
    KeyTooLarge(usize),
    #[error("value too large: {0} bytes (max {MAX_VALUE_SIZE})")]
    ValueTooLarge(usize),
    #[error("store corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("value codec: {0}")]
    Codec(#[from] serde_json::Error),
}
