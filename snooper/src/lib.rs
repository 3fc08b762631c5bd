//! Recovers the remote-store credentials and the optional crypt layer from
//! the external tool's configuration file, without ever writing to it.

use std::path::{Path, PathBuf};

pub mod cipher;
mod crypt;
mod drive;
mod ini;

pub use cipher::{CipherError, Codec, NameScheme, PathCodec};
pub use crypt::CryptBackend;
pub use drive::{DriveBackend, OAuthToken};

use ini::IniFile;

#[derive(Debug, thiserror::Error)]
pub enum SnoopError {
    #[error("can not read the config file '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file parse: {0}")]
    Parse(String),
    #[error("backend '{0}' not found in the config file")]
    MissingBackend(String),
    #[error("backend '{backend}': {reason}")]
    Backend { backend: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct SnoopConfig {
    pub config_path: PathBuf,
    pub drive_backend_name: String,
    pub crypt_backend_name: Option<String>,
}

/// The snooped configuration: one mandatory drive backend, one optional
/// crypt backend layered on top of it.
#[derive(Debug)]
pub struct Snooper {
    pub conf: SnoopConfig,
    pub drive: DriveBackend,
    pub crypt: Option<CryptBackend>,
}

impl Snooper {
    pub fn new(conf: SnoopConfig) -> Result<Self, SnoopError> {
        let ini = load_config(&conf.config_path)?;
        let drive_section = ini
            .section(&conf.drive_backend_name)
            .ok_or_else(|| SnoopError::MissingBackend(conf.drive_backend_name.clone()))?;
        let drive = drive::extract_drive_backend(&conf.drive_backend_name, drive_section)?;
        let crypt = match &conf.crypt_backend_name {
            Some(name) => {
                let section = ini
                    .section(name)
                    .ok_or_else(|| SnoopError::MissingBackend(name.clone()))?;
                Some(crypt::extract_crypt_backend(
                    name,
                    &conf.drive_backend_name,
                    section,
                )?)
            }
            None => None,
        };
        Ok(Snooper { conf, drive, crypt })
    }

    /// One-line description of the snooped setup for startup logging.
    pub fn summary(&self) -> String {
        let mut parts = Vec::with_capacity(8);
        parts.push(format!("config path: {}", self.conf.config_path.display()));
        parts.push(format!("drive backend: {}", self.conf.drive_backend_name));
        match &self.drive.root_folder_id {
            Some(id) => parts.push(format!("custom root folderID: {id}")),
            None => parts.push("no custom root folderID".to_string()),
        }
        match &self.drive.team_drive {
            Some(id) => parts.push(format!("team drive: {id}")),
            None => parts.push("no team drive".to_string()),
        }
        if let Some(name) = &self.conf.crypt_backend_name {
            parts.push(format!("crypt drive backend: {name}"));
            if let Some(crypt) = &self.crypt {
                if !crypt.path_prefix.is_empty() {
                    parts.push(format!("path prefix: {}", crypt.path_prefix));
                }
                parts.push(format!("filename encryption: {}", crypt.filename_scheme));
                parts.push(format!(
                    "directory name encryption: {}",
                    crypt.dirs_encrypted
                ));
            }
        }
        parts.join(", ")
    }
}

fn load_config(path: &Path) -> Result<IniFile, SnoopError> {
    let content = std::fs::read_to_string(path).map_err(|source| SnoopError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    IniFile::parse(&content).map_err(SnoopError::Parse)
}
