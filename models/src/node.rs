use serde::{Deserialize, Serialize};

/// Basic info for one node of the remote file tree, as persisted in the
/// `drive_index` realm keyed by fileID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(rename = "isFolder")]
    pub folder: bool,
    /// Remote parent ids. Empty only for the root node (and its team-drive
    /// alias). A node may carry several parents.
    pub parents: Vec<String>,
}

impl NodeInfo {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::NodeInfo;

    #[test]
    fn serializes_with_index_field_names() {
        let node = NodeInfo {
            name: "docs".to_string(),
            folder: true,
            parents: vec!["rootid".to_string()],
        };
        let raw = serde_json::to_value(&node).unwrap();
        assert_eq!(raw["name"], "docs");
        assert_eq!(raw["isFolder"], true);
        assert_eq!(raw["parents"][0], "rootid");
    }

    #[test]
    fn root_has_no_parents() {
        let root = NodeInfo {
            name: "Drive".to_string(),
            folder: true,
            parents: vec![],
        };
        assert!(root.is_root());
    }
}
