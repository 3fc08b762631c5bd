//! Media server REST client: library listing and partial scans.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const TOKEN_HEADER: &str = "X-Plex-Token";

#[derive(Debug, thiserror::Error)]
pub enum PlexError {
    #[error("can not build the HTTP client: {0}")]
    Build(String),
    #[error("failed to execute the {endpoint} query: {reason}")]
    Request { endpoint: String, reason: String },
    #[error("{endpoint} answered {status}")]
    Status { endpoint: String, status: String },
}

/// One media library and the on-disk locations it indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub key: String,
    pub title: String,
    pub locations: Vec<String>,
}

#[async_trait]
pub trait PlexApi: Send + Sync {
    async fn libraries(&self) -> Result<Vec<Library>, PlexError>;
    async fn scan_library(&self, key: &str, path: &str) -> Result<(), PlexError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub token: String,
    /// Application identification sent with every request.
    pub product_name: String,
    pub product_version: String,
    /// Stable per-installation identifier.
    pub client_id: String,
}

pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl Client {
    pub fn new(conf: ClientConfig) -> Result<Self, PlexError> {
        let device = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| format!("generic {}", std::env::consts::OS));
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: &str| {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        };
        put("X-Plex-Platform", std::env::consts::OS);
        put("X-Plex-Provides", "controller");
        put("X-Plex-Client-Identifier", &conf.client_id);
        put("X-Plex-Product", &conf.product_name);
        put("X-Plex-Version", &conf.product_version);
        put("X-Plex-Device", &device);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PlexError::Build(e.to_string()))?;
        let mut base_url = conf.base_url;
        // A trailing slash would double up once endpoints are appended.
        if base_url.path().ends_with('/') {
            let trimmed = base_url.path().trim_end_matches('/').to_string();
            base_url.set_path(&trimmed);
        }
        Ok(Client {
            http,
            base_url,
            token: conf.token,
        })
    }

    async fn request_raw(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, PlexError> {
        let mut url = self.base_url.clone();
        url.set_path(&format!("{}{}", url.path(), endpoint));
        let response = self
            .http
            .get(url)
            .header(TOKEN_HEADER, &self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| PlexError::Request {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlexError::Status {
                endpoint: endpoint.to_string(),
                status: status.to_string(),
            });
        }
        Ok(response)
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PlexError> {
        let response = self.request_raw(endpoint, query).await?;
        response.json().await.map_err(|e| PlexError::Request {
            endpoint: endpoint.to_string(),
            reason: format!("failed to decode the response payload as JSON: {e}"),
        })
    }
}

#[async_trait]
impl PlexApi for Client {
    async fn libraries(&self) -> Result<Vec<Library>, PlexError> {
        let payload: LibrariesPayload = self.request("/library/sections", &[]).await?;
        let libraries = payload
            .media_container
            .directory
            .into_iter()
            .map(|dir| Library {
                key: dir.key,
                title: dir.title,
                locations: dir.location.into_iter().map(|l| l.path).collect(),
            })
            .collect();
        Ok(libraries)
    }

    async fn scan_library(&self, key: &str, path: &str) -> Result<(), PlexError> {
        let endpoint = format!("/library/sections/{key}/refresh");
        debug!(target: "plex", key, path, "requesting a partial scan");
        self.request_raw(&endpoint, &[("path", path)]).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct LibrariesPayload {
    #[serde(rename = "MediaContainer", default)]
    media_container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
struct MediaContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<DirectoryPayload>,
}

#[derive(Debug, Deserialize)]
struct DirectoryPayload {
    key: String,
    title: String,
    #[serde(rename = "Location", default)]
    location: Vec<LocationPayload>,
}

#[derive(Debug, Deserialize)]
struct LocationPayload {
    path: String,
}
