use std::collections::HashMap;
use std::sync::Arc;

use crate::cipher::{Codec, NameScheme, PathCodec};
use crate::SnoopError;

/// The crypt backend view: where the encrypted namespace lives inside the
/// drive, and the codec that undoes its name encryption.
pub struct CryptBackend {
    /// Drive-side prefix of the crypt namespace, normalized to either `""`
    /// (whole drive) or `"/some/sub/path"`.
    pub path_prefix: String,
    pub filename_scheme: String,
    pub dirs_encrypted: bool,
    pub codec: Arc<dyn PathCodec>,
}

impl std::fmt::Debug for CryptBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptBackend")
            .field("path_prefix", &self.path_prefix)
            .field("filename_scheme", &self.filename_scheme)
            .field("dirs_encrypted", &self.dirs_encrypted)
            .finish()
    }
}

pub(crate) fn extract_crypt_backend(
    name: &str,
    drive_backend_name: &str,
    section: &HashMap<String, String>,
) -> Result<CryptBackend, SnoopError> {
    let fail = |reason: String| SnoopError::Backend {
        backend: name.to_string(),
        reason,
    };
    match section.get("type") {
        Some(kind) if kind == "crypt" => {}
        Some(kind) => return Err(fail(format!("not a crypt backend: {kind}"))),
        None => return Err(fail("backend type missing".to_string())),
    }
    let remote = section
        .get("remote")
        .ok_or_else(|| fail("no remote declared".to_string()))?;
    let suffix = remote.strip_prefix(drive_backend_name).and_then(|r| r.strip_prefix(':'));
    let path_prefix = match suffix {
        Some(path) => normalize_prefix(path),
        None => {
            return Err(fail(format!(
                "should have the declared drive backend as remote: '{drive_backend_name}:' (currently: '{remote}')"
            )))
        }
    };

    let filename_scheme = section
        .get("filename_encryption")
        .cloned()
        .unwrap_or_else(|| "standard".to_string());
    let scheme = match filename_scheme.as_str() {
        "off" => NameScheme::Off,
        "obfuscate" => NameScheme::Obfuscate,
        other => {
            return Err(fail(format!(
                "filename encryption '{other}' is not supported (only 'off' and 'obfuscate' are)"
            )))
        }
    };
    let dirs_encrypted = match section.get("directory_name_encryption").map(String::as_str) {
        None => true,
        Some("true") => true,
        Some("false") => false,
        Some(other) => {
            return Err(fail(format!(
                "directory_name_encryption must be true or false (got {other})"
            )))
        }
    };
    let codec = Codec::new(scheme, dirs_encrypted, section.get("suffix").map(String::as_str));
    Ok(CryptBackend {
        path_prefix,
        filename_scheme,
        dirs_encrypted,
        codec,
    })
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
