//! Path name codec for crypt backends.
//!
//! Supports the `off` scheme (plaintext names, encrypted files carry a
//! suffix) and the `obfuscate` scheme (per-segment position-dependent
//! rotation prefixed by its rotation amount, `<n>.<rotated>`). The
//! `standard` scheme is rejected at construction: it needs the full EME
//! cipher stack and name decryption is the only thing this daemon does
//! with a crypt backend.

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("'{0}' is not an encrypted name")]
    NotEncrypted(String),
    #[error("bad obfuscated segment '{0}'")]
    BadSegment(String),
}

/// Filename/dirname decryption seam. The watcher only ever decrypts;
/// encryption exists for tests and tooling.
pub trait PathCodec: Send + Sync {
    fn encrypt_file_name(&self, path: &str) -> String;
    fn decrypt_file_name(&self, path: &str) -> Result<String, CipherError>;
    fn encrypt_dir_name(&self, path: &str) -> String;
    fn decrypt_dir_name(&self, path: &str) -> Result<String, CipherError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScheme {
    Off,
    Obfuscate,
}

pub struct Codec {
    scheme: NameScheme,
    dirs_encrypted: bool,
    /// Suffix carried by encrypted files when names are not encrypted.
    suffix: String,
}

impl Codec {
    pub fn new(scheme: NameScheme, dirs_encrypted: bool, suffix: Option<&str>) -> Arc<dyn PathCodec> {
        Arc::new(Codec {
            scheme,
            // Plaintext file names imply plaintext directory names.
            dirs_encrypted: dirs_encrypted && scheme != NameScheme::Off,
            suffix: match suffix {
                Some("none") => String::new(),
                Some(s) => s.to_string(),
                None => ".bin".to_string(),
            },
        })
    }

    fn encrypt_segment(&self, segment: &str) -> String {
        match self.scheme {
            NameScheme::Off => segment.to_string(),
            NameScheme::Obfuscate => obfuscate_segment(segment),
        }
    }

    fn decrypt_segment(&self, segment: &str) -> Result<String, CipherError> {
        match self.scheme {
            NameScheme::Off => Ok(segment.to_string()),
            NameScheme::Obfuscate => deobfuscate_segment(segment),
        }
    }

    fn encrypt_dirs(&self, path: &str) -> String {
        if !self.dirs_encrypted {
            return path.to_string();
        }
        path.split('/')
            .map(|seg| self.encrypt_segment(seg))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn decrypt_dirs(&self, path: &str) -> Result<String, CipherError> {
        if !self.dirs_encrypted {
            return Ok(path.to_string());
        }
        let mut out = Vec::new();
        for seg in path.split('/') {
            out.push(self.decrypt_segment(seg)?);
        }
        Ok(out.join("/"))
    }
}

impl PathCodec for Codec {
    fn encrypt_file_name(&self, path: &str) -> String {
        match self.scheme {
            NameScheme::Off => format!("{path}{}", self.suffix),
            NameScheme::Obfuscate => match path.rsplit_once('/') {
                Some((dirs, file)) => {
                    format!("{}/{}", self.encrypt_dirs(dirs), self.encrypt_segment(file))
                }
                None => self.encrypt_segment(path),
            },
        }
    }

    fn decrypt_file_name(&self, path: &str) -> Result<String, CipherError> {
        match self.scheme {
            NameScheme::Off => {
                if self.suffix.is_empty() {
                    return Ok(path.to_string());
                }
                path.strip_suffix(self.suffix.as_str())
                    .map(|p| p.to_string())
                    .ok_or_else(|| CipherError::NotEncrypted(path.to_string()))
            }
            NameScheme::Obfuscate => match path.rsplit_once('/') {
                Some((dirs, file)) => Ok(format!(
                    "{}/{}",
                    self.decrypt_dirs(dirs)?,
                    self.decrypt_segment(file)?
                )),
                None => self.decrypt_segment(path),
            },
        }
    }

    fn encrypt_dir_name(&self, path: &str) -> String {
        self.encrypt_dirs(path)
    }

    fn decrypt_dir_name(&self, path: &str) -> Result<String, CipherError> {
        self.decrypt_dirs(path)
    }
}

/// Rotation amount for one segment: the sum of its character values,
/// folded into a byte. Stored as a plaintext prefix so decryption does
/// not need the original.
fn rotation(segment: &str) -> u32 {
    segment.chars().fold(0u32, |acc, c| acc.wrapping_add(c as u32)) % 256
}

fn rotate_char(c: char, by: u32, forward: bool) -> char {
    let (base, span) = match c {
        'a'..='z' => (b'a', 26),
        'A'..='Z' => (b'A', 26),
        '0'..='9' => (b'0', 10),
        _ => return c,
    };
    let offset = (c as u8 - base) as u32;
    let by = by % span;
    let rotated = if forward {
        (offset + by) % span
    } else {
        (offset + span - by) % span
    };
    (base + rotated as u8) as char
}

fn obfuscate_segment(segment: &str) -> String {
    if segment.is_empty() {
        return String::new();
    }
    let by = rotation(segment);
    let rotated: String = segment.chars().map(|c| rotate_char(c, by, true)).collect();
    format!("{by}.{rotated}")
}

fn deobfuscate_segment(segment: &str) -> Result<String, CipherError> {
    if segment.is_empty() {
        return Ok(String::new());
    }
    let (amount, rest) = segment
        .split_once('.')
        .ok_or_else(|| CipherError::BadSegment(segment.to_string()))?;
    let by: u32 = amount
        .parse()
        .map_err(|_| CipherError::BadSegment(segment.to_string()))?;
    Ok(rest.chars().map(|c| rotate_char(c, by, false)).collect())
}

#[cfg(test)]
mod tests {
    use super::{Codec, NameScheme, PathCodec};

    #[test]
    fn obfuscate_round_trips_paths() {
        let codec = Codec::new(NameScheme::Obfuscate, true, None);
        for name in ["Media/Movies/Heat (1995).mkv", "a", "Shows/S01E02.srt"] {
            let enc = codec.encrypt_file_name(name);
            assert_ne!(enc, name);
            assert_eq!(codec.decrypt_file_name(&enc).unwrap(), name);
        }
        let dir = "Media/Movies";
        let enc = codec.encrypt_dir_name(dir);
        assert_eq!(codec.decrypt_dir_name(&enc).unwrap(), dir);
    }

    #[test]
    fn obfuscate_rejects_plaintext() {
        let codec = Codec::new(NameScheme::Obfuscate, true, None);
        assert!(codec.decrypt_file_name("not-obfuscated").is_err());
        assert!(codec.decrypt_dir_name("nan.x").is_err());
    }

    #[test]
    fn plain_dirs_with_obfuscated_files() {
        let codec = Codec::new(NameScheme::Obfuscate, false, None);
        let enc = codec.encrypt_file_name("Movies/Heat.mkv");
        assert!(enc.starts_with("Movies/"));
        assert_eq!(codec.decrypt_file_name(&enc).unwrap(), "Movies/Heat.mkv");
        assert_eq!(codec.decrypt_dir_name("Movies").unwrap(), "Movies");
    }

    #[test]
    fn off_scheme_strips_the_file_suffix() {
        let codec = Codec::new(NameScheme::Off, true, None);
        assert_eq!(codec.encrypt_file_name("x/y.mkv"), "x/y.mkv.bin");
        assert_eq!(codec.decrypt_file_name("x/y.mkv.bin").unwrap(), "x/y.mkv");
        assert!(codec.decrypt_file_name("x/y.mkv").is_err());
        assert_eq!(codec.decrypt_dir_name("x/y").unwrap(), "x/y");
    }
}
