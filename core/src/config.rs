use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use url::Url;
use utilities::LogLevel;

const RCLONE_CONFIG_PATH: &str = "SCANBRIDGE_RCLONE_CONFIG_PATH";
const RCLONE_DRIVE_NAME: &str = "SCANBRIDGE_RCLONE_BACKEND_DRIVE_NAME";
const RCLONE_CRYPT_NAME: &str = "SCANBRIDGE_RCLONE_BACKEND_CRYPT_NAME";
const RCLONE_POLL_INTERVAL: &str = "SCANBRIDGE_RCLONE_BACKEND_DRIVE_POLLINTERVAL";
const RCLONE_DIR_CACHE_TIME: &str = "SCANBRIDGE_RCLONE_BACKEND_DRIVE_DIRCACHETIME";
const RCLONE_MOUNT_PATH: &str = "SCANBRIDGE_RCLONE_MOUNT_PATH";
const PLEX_URL: &str = "SCANBRIDGE_PLEX_URL";
const PLEX_TOKEN: &str = "SCANBRIDGE_PLEX_TOKEN";
const LOG_LEVEL: &str = "SCANBRIDGE_LOGLEVEL";
const LOG_FILE: &str = "SCANBRIDGE_LOGFILE";

/// The mount tooling's own defaults, used when the env leaves the
/// timings unset.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DIR_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Parser)]
#[command(
    name = "scanbridge",
    version,
    about = "Bridges a drive change feed to partial Plex scans"
)]
pub struct CliArgs {
    /// Custom instance name for storage, allowing several daemons to
    /// coexist
    #[arg(long)]
    pub instance: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub instance: Option<String>,
    pub rclone_config_path: PathBuf,
    pub drive_backend_name: String,
    pub crypt_backend_name: Option<String>,
    pub poll_interval: Duration,
    pub dir_cache_time: Duration,
    pub mount_path: String,
    pub plex_url: Url,
    pub plex_token: String,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env(cli: CliArgs) -> Result<Self> {
        Self::from_lookup(cli, |name| std::env::var(name).ok())
    }

    fn from_lookup(cli: CliArgs, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("{name} must be set"))
        };

        let rclone_config_path = PathBuf::from(required(RCLONE_CONFIG_PATH)?);
        std::fs::metadata(&rclone_config_path).with_context(|| {
            format!(
                "can not access the rclone config file at '{}'",
                rclone_config_path.display()
            )
        })?;

        let drive_backend_name = required(RCLONE_DRIVE_NAME)?;
        let crypt_backend_name = lookup(RCLONE_CRYPT_NAME).filter(|v| !v.is_empty());

        let poll_interval = match lookup(RCLONE_POLL_INTERVAL).filter(|v| !v.is_empty()) {
            Some(raw) => {
                let interval = utilities::parse_duration(&raw)
                    .map_err(|e| anyhow!("failed to parse {RCLONE_POLL_INTERVAL}: {e}"))?;
                if interval < Duration::from_secs(1) {
                    bail!("{RCLONE_POLL_INTERVAL} ({interval:?}) can not be set under a second");
                }
                interval
            }
            None => DEFAULT_POLL_INTERVAL,
        };
        let dir_cache_time = match lookup(RCLONE_DIR_CACHE_TIME).filter(|v| !v.is_empty()) {
            Some(raw) => {
                let cache = utilities::parse_duration(&raw)
                    .map_err(|e| anyhow!("failed to parse {RCLONE_DIR_CACHE_TIME}: {e}"))?;
                if cache < poll_interval {
                    bail!(
                        "{RCLONE_DIR_CACHE_TIME} ({cache:?}) can not be set lower than {RCLONE_POLL_INTERVAL} ({poll_interval:?})"
                    );
                }
                cache
            }
            None => DEFAULT_DIR_CACHE_TIME.max(poll_interval),
        };

        let mount_path = required(RCLONE_MOUNT_PATH)?;
        if !mount_path.starts_with('/') {
            bail!("{RCLONE_MOUNT_PATH} must be absolute (it must start with '/')");
        }

        let plex_url: Url = required(PLEX_URL)?
            .parse()
            .with_context(|| format!("failed to parse {PLEX_URL} as a URL"))?;
        let plex_token = required(PLEX_TOKEN)?;

        let log_level = match lookup(LOG_LEVEL).filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse().map_err(|e| anyhow!("{LOG_LEVEL}: {e}"))?,
            None => LogLevel::Info,
        };
        let log_file = lookup(LOG_FILE).filter(|v| !v.is_empty()).map(PathBuf::from);

        Ok(AppConfig {
            instance: cli.instance,
            rclone_config_path,
            drive_backend_name,
            crypt_backend_name,
            poll_interval,
            dir_cache_time,
            mount_path,
            plex_url,
            plex_token,
            log_level,
            log_file,
        })
    }

    /// Debug dump of the effective configuration, token redacted.
    pub fn debug_dump(&self) {
        tracing::debug!(target: "main", "{RCLONE_CONFIG_PATH}: {}", self.rclone_config_path.display());
        tracing::debug!(target: "main", "{RCLONE_DRIVE_NAME}: {}", self.drive_backend_name);
        tracing::debug!(target: "main", "{RCLONE_CRYPT_NAME}: {:?}", self.crypt_backend_name);
        tracing::debug!(target: "main", "{RCLONE_POLL_INTERVAL}: {:?}", self.poll_interval);
        tracing::debug!(target: "main", "{RCLONE_DIR_CACHE_TIME}: {:?}", self.dir_cache_time);
        tracing::debug!(target: "main", "{RCLONE_MOUNT_PATH}: {}", self.mount_path);
        tracing::debug!(target: "main", "{PLEX_URL}: {}", self.plex_url);
        tracing::debug!(target: "main", "{PLEX_TOKEN}: <redacted>");
    }
}
