//! Translation of raw feed changes into path-level change events:
//! path resolution, custom-root filtering, crypt decryption, and the
//! delete+create collapse for rewritten files.

use models::FileChange;
use snooper::CryptBackend;
use storage::{Realm, RealmExt};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::api::DriveChange;
use crate::error::WatchError;
use crate::path::generate_reverse_paths;

/// Translate one batch of raw changes, in feed order. Index entries of
/// removed or trashed targets are purged once their paths are out.
pub(crate) fn translate_changes(
    index: &dyn Realm,
    root_folder_id: Option<&str>,
    changes: &[DriveChange],
) -> Result<Vec<FileChange>, WatchError> {
    let mut translated = Vec::with_capacity(changes.len());
    for change in changes {
        if change.change_type != "file" {
            continue;
        }
        if let Some(file_change) = translate_one(index, root_folder_id, change)? {
            translated.push(file_change);
        }
        if is_deleted(change) {
            index.delete(&change.file_id)?;
        }
    }
    Ok(translated)
}

fn is_deleted(change: &DriveChange) -> bool {
    change.removed || change.file.as_ref().is_some_and(|f| f.trashed)
}

fn translate_one(
    index: &dyn Realm,
    root_folder_id: Option<&str>,
    change: &DriveChange,
) -> Result<Option<FileChange>, WatchError> {
    // Effective metadata comes from the change payload, or from the index
    // for removals which carry none.
    let folder = match &change.file {
        Some(file) => file.folder,
        None => match index.get::<models::NodeInfo>(&change.file_id)? {
            Some(node) => node.folder,
            None if change.removed => {
                warn!(
                    target: "drive",
                    file_id = %change.file_id,
                    "removal of a fileID we never indexed: skipping"
                );
                return Ok(None);
            }
            None => return Err(WatchError::MissingMetadata(change.file_id.clone())),
        },
    };
    let event_time =
        OffsetDateTime::parse(&change.time, &Rfc3339).map_err(|source| WatchError::BadTime {
            raw: change.time.clone(),
            source,
        })?;

    let mut variants = generate_reverse_paths(index, &change.file_id)?;
    if let Some(custom_root) = root_folder_id {
        // Only keep ancestries passing through the custom root, re-rooted
        // on it.
        variants.retain_mut(|variant| variant.cut_at(custom_root));
    }
    let paths: Vec<String> = variants
        .iter()
        .map(|variant| format!("/{}", variant.path()))
        .collect();
    if paths.is_empty() {
        debug!(
            target: "drive",
            file_id = %change.file_id,
            "change resolves to no paths within scope: dropping"
        );
        return Ok(None);
    }
    Ok(Some(FileChange {
        event_time,
        folder,
        deleted: is_deleted(change),
        paths,
    }))
}

/// Keep only the paths living inside the crypt namespace, decrypted.
/// Decryption failures drop the path, never the whole change.
pub(crate) fn process_changes_through_crypt(
    changes: Vec<FileChange>,
    crypt: &CryptBackend,
) -> Vec<FileChange> {
    let mut valid = Vec::with_capacity(changes.len());
    for mut change in changes {
        let mut valid_paths = Vec::with_capacity(change.paths.len());
        for path in &change.paths {
            match decrypt_path(crypt, path, change.folder) {
                Ok(Some(decrypted)) => valid_paths.push(decrypted),
                Ok(None) => debug!(
                    target: "drive",
                    path,
                    prefix = %crypt.path_prefix,
                    "path is not part of the crypt prefix: skipping"
                ),
                Err(e) => error!(target: "drive", "can not decrypt path '{path}': {e}"),
            }
        }
        if !valid_paths.is_empty() {
            change.paths = valid_paths;
            valid.push(change);
        }
    }
    valid
}

fn decrypt_path(
    crypt: &CryptBackend,
    path: &str,
    folder: bool,
) -> Result<Option<String>, snooper::CipherError> {
    let stripped = match path.strip_prefix(crypt.path_prefix.as_str()) {
        Some(stripped) => stripped,
        None => return Ok(None),
    };
    // Nothing left after the prefix: the crypt root itself.
    let stripped = stripped.strip_prefix('/').unwrap_or(stripped);
    if stripped.is_empty() {
        return Ok(Some("/".to_string()));
    }
    let decrypted = if folder {
        crypt.codec.decrypt_dir_name(stripped)?
    } else {
        crypt.codec.decrypt_file_name(stripped)?
    };
    Ok(Some(format!("/{decrypted}")))
}

/// Rewritten files surface as a deletion plus a creation on the same
/// paths; the file never disappeared, so the deletion is noise.
pub(crate) fn collapse_rewrites(changes: Vec<FileChange>) -> Vec<FileChange> {
    let mut kept = Vec::with_capacity(changes.len());
    for (idx, change) in changes.iter().enumerate() {
        if change.deleted {
            let rewritten = changes
                .iter()
                .enumerate()
                .any(|(other_idx, other)| {
                    other_idx != idx && !other.deleted && other.paths == change.paths
                });
            if rewritten {
                debug!(
                    target: "drive",
                    paths = ?change.paths,
                    "skipping deletion event: another change targets the same path(s)"
                );
                continue;
            }
        }
        kept.push(change.clone());
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::{collapse_rewrites, process_changes_through_crypt};
    use models::FileChange;
    use snooper::cipher::{Codec, NameScheme, PathCodec};
    use snooper::CryptBackend;
    use time::macros::datetime;

    fn change(paths: &[&str], folder: bool, deleted: bool) -> FileChange {
        FileChange {
            event_time: datetime!(2024-01-02 03:04:05 UTC),
            folder,
            deleted,
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn crypt_backend(prefix: &str) -> CryptBackend {
        CryptBackend {
            path_prefix: prefix.to_string(),
            filename_scheme: "obfuscate".to_string(),
            dirs_encrypted: true,
            codec: Codec::new(NameScheme::Obfuscate, true, None),
        }
    }

    #[test]
    fn crypt_filter_decrypts_prefixed_paths_and_drops_the_rest() {
        let crypt = crypt_backend("/Media");
        let codec = Codec::new(NameScheme::Obfuscate, true, None);
        let encrypted = codec.encrypt_file_name("Movies/Heat.mkv");

        let kept = process_changes_through_crypt(
            vec![change(
                &[&format!("/Media/{encrypted}"), "/Elsewhere/clear.mkv"],
                false,
                false,
            )],
            &crypt,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].paths, vec!["/Movies/Heat.mkv"]);
    }

    #[test]
    fn crypt_filter_drops_only_the_failing_path() {
        let crypt = crypt_backend("");
        let codec = Codec::new(NameScheme::Obfuscate, true, None);
        let good = codec.encrypt_file_name("fine.mkv");

        let kept = process_changes_through_crypt(
            vec![change(&[&format!("/{good}"), "/not-encrypted"], false, false)],
            &crypt,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].paths, vec!["/fine.mkv"]);
    }

    #[test]
    fn crypt_filter_drops_changes_with_no_valid_path_left() {
        let crypt = crypt_backend("/Media");
        let kept = process_changes_through_crypt(
            vec![change(&["/Elsewhere/clear.mkv"], false, false)],
            &crypt,
        );
        assert!(kept.is_empty());
    }

    #[test]
    fn crypt_root_decrypts_to_the_bare_separator() {
        let crypt = crypt_backend("/Media");
        let kept =
            process_changes_through_crypt(vec![change(&["/Media"], true, false)], &crypt);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].paths, vec!["/"]);
    }

    #[test]
    fn folder_paths_go_through_the_dirname_codec() {
        let crypt = crypt_backend("");
        let codec = Codec::new(NameScheme::Obfuscate, true, None);
        let encrypted = codec.encrypt_dir_name("Shows/S01");
        let kept = process_changes_through_crypt(
            vec![change(&[&format!("/{encrypted}")], true, false)],
            &crypt,
        );
        assert_eq!(kept[0].paths, vec!["/Shows/S01"]);
    }

    #[test]
    fn rewrites_drop_the_deletion_half_only() {
        let kept = collapse_rewrites(vec![
            change(&["/x/y"], false, true),
            change(&["/x/y"], false, false),
            change(&["/x/z"], false, true),
        ]);
        assert_eq!(kept.len(), 2);
        assert!(!kept[0].deleted);
        assert_eq!(kept[1].paths, vec!["/x/z"]);
    }

    #[test]
    fn twin_deletions_both_survive() {
        let kept = collapse_rewrites(vec![
            change(&["/x/y"], false, true),
            change(&["/x/y"], false, true),
        ]);
        assert_eq!(kept.len(), 2);
    }
}
