//! Bottom-up path resolution over the persisted file index.

use models::NodeInfo;
use storage::{Realm, RealmExt};

use crate::error::WatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathElem {
    pub id: String,
    pub name: String,
}

/// One path variant, bottom-up: the queried node first, the direct child
/// of the root last. The root itself is never included so joining the
/// reversed names with `/` yields the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversePath(pub Vec<PathElem>);

impl ReversePath {
    /// Truncate at (not including) the element carrying `id`. Returns
    /// whether the id was present at all.
    pub fn cut_at(&mut self, id: &str) -> bool {
        match self.0.iter().position(|elem| elem.id == id) {
            Some(index) => {
                self.0.truncate(index);
                true
            }
            None => false,
        }
    }

    /// Top-down rendering, without a leading separator.
    pub fn path(&self) -> String {
        let mut names: Vec<&str> = self.0.iter().map(|elem| elem.name.as_str()).collect();
        names.reverse();
        names.join("/")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// All bottom-up path variants for `file_id`. Multi-parented nodes fan out
/// into one variant per resolvable ancestry; the root resolves to no
/// variants at all. Every referenced id must already be in the index.
pub fn generate_reverse_paths(
    index: &dyn Realm,
    file_id: &str,
) -> Result<Vec<ReversePath>, WatchError> {
    let infos: NodeInfo = index
        .get(file_id)?
        .ok_or_else(|| WatchError::IndexMiss(file_id.to_string()))?;
    // No parent: we reached the root folder.
    if infos.parents.is_empty() {
        return Ok(Vec::new());
    }
    let elem = PathElem {
        id: file_id.to_string(),
        name: infos.name,
    };
    let mut built = Vec::with_capacity(infos.parents.len());
    for parent in &infos.parents {
        let parent_paths = generate_reverse_paths(index, parent)?;
        if parent_paths.is_empty() {
            // Parent is the root folder: we are a direct child.
            built.push(ReversePath(vec![elem.clone()]));
            continue;
        }
        for parent_path in parent_paths {
            let mut current = Vec::with_capacity(parent_path.0.len() + 1);
            current.push(elem.clone());
            current.extend(parent_path.0);
            built.push(ReversePath(current));
        }
    }
    Ok(built)
}
