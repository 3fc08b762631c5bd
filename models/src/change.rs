use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One path-level change derived from the remote change feed.
///
/// Emitted by the drive watcher in batches; consumed by the scan scheduler.
/// `paths` is never empty: a change whose paths were all filtered out is
/// dropped before emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// When the remote reported the change (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub event_time: OffsetDateTime,
    pub folder: bool,
    /// Removed or trashed upstream.
    pub deleted: bool,
    /// Absolute paths with a leading `/`, already decrypted and re-rooted
    /// when a crypt backend or custom root folder is configured.
    pub paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::FileChange;
    use time::macros::datetime;

    #[test]
    fn event_time_round_trips_as_rfc3339() {
        let change = FileChange {
            event_time: datetime!(2024-01-02 03:04:05 UTC),
            folder: false,
            deleted: true,
            paths: vec!["/docs/report.odt".to_string()],
        };
        let raw = serde_json::to_string(&change).unwrap();
        assert!(raw.contains("2024-01-02T03:04:05Z"));
        let back: FileChange = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, change);
    }
}
