//! Drive v3 REST client with OAuth2 refresh-token handling.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use async_trait::async_trait;
use snooper::{DriveBackend, OAuthToken};

use crate::api::{
    ApiError, ChangeFile, ChangePage, DriveApi, DriveChange, DriveFile, ListPage, FOLDER_MIME_TYPE,
};
use crate::ratelimit::RateLimiter;

const DRIVE_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE_PREFIX: &str = "https://www.googleapis.com/auth/";
const MAX_FILES_PER_PAGE: u32 = 1000;
const MAX_CHANGES_PER_PAGE: u32 = 1000;

const FILE_FIELDS: &str = "id,name,mimeType,parents";
const LIST_FIELDS: &str = "nextPageToken,files/id,files/name,files/mimeType,files/parents";
const CHANGES_FIELDS: &str = "nextPageToken,newStartPageToken,changes/changeType,changes/fileId,\
changes/removed,changes/time,changes/file/name,changes/file/mimeType,changes/file/trashed,\
changes/file/parents";

pub struct HttpDriveClient {
    http: reqwest::Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    team_drive: Option<String>,
    auth: Mutex<OAuthToken>,
    limiter: RateLimiter,
    cancel: CancellationToken,
}

impl HttpDriveClient {
    pub fn new(backend: &DriveBackend, cancel: CancellationToken) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Fatal(format!("can not build the HTTP client: {e}")))?;
        Ok(HttpDriveClient {
            http,
            base_url: DRIVE_BASE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            client_id: backend.client_id.clone(),
            client_secret: backend.client_secret.clone(),
            scope: format!("{SCOPE_PREFIX}{}", backend.scope),
            team_drive: backend.team_drive.clone(),
            auth: Mutex::new(backend.token.clone()),
            limiter: RateLimiter::for_drive(),
            cancel,
        })
    }

    /// Current bearer token, refreshed through the token endpoint when
    /// expired.
    async fn bearer(&self) -> Result<String, ApiError> {
        let mut auth = self.auth.lock().await;
        if !auth.expired_at(OffsetDateTime::now_utc()) {
            return Ok(auth.access_token.clone());
        }
        debug!(target: "drive", "access token expired, refreshing...");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", auth.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("scope", self.scope.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ApiError::Transient(format!("token refresh request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            // An unusable refresh token means revoked access, not weather.
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                ApiError::Transient(format!("token endpoint answered {status}"))
            } else {
                ApiError::Fatal(format!("token refresh refused ({status}): {body}"))
            });
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("bad token endpoint payload: {e}")))?;
        auth.access_token = refreshed.access_token;
        if let Some(token_type) = refreshed.token_type {
            auth.token_type = token_type;
        }
        auth.expiry = refreshed
            .expires_in
            .map(|seconds| OffsetDateTime::now_utc() + time::Duration::seconds(seconds));
        Ok(auth.access_token.clone())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.limiter.acquire(&self.cancel).await?;
        let bearer = self.bearer().await?;
        let url = format!("{}{}", self.base_url, path);
        let request = self.http.get(&url).bearer_auth(bearer).query(query);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ApiError::Cancelled),
            response = request.send() => response,
        }
        .map_err(|e| ApiError::Transient(format!("request to {path} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, path));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("bad payload from {path}: {e}")))
    }
}

fn classify_status(status: StatusCode, path: &str) -> ApiError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ApiError::Transient(format!("{path} answered {status}"))
    } else {
        ApiError::Fatal(format!("{path} answered {status}"))
    }
}

#[async_trait]
impl DriveApi for HttpDriveClient {
    async fn file_info(&self, file_id: &str) -> Result<DriveFile, ApiError> {
        debug!(target: "drive", file_id, "requesting file information...");
        let mut query = vec![("fields", FILE_FIELDS.to_string())];
        if self.team_drive.is_some() {
            query.push(("supportsAllDrives", "true".to_string()));
        }
        let file: FileResource = self.get_json(&format!("/files/{file_id}"), &query).await?;
        Ok(file.into())
    }

    async fn start_page_token(&self) -> Result<String, ApiError> {
        let mut query = Vec::new();
        if let Some(drive_id) = &self.team_drive {
            query.push(("supportsAllDrives", "true".to_string()));
            query.push(("driveId", drive_id.clone()));
        }
        let token: StartPageTokenResource =
            self.get_json("/changes/startPageToken", &query).await?;
        Ok(token.start_page_token)
    }

    async fn list_page(&self, page_token: Option<&str>) -> Result<ListPage, ApiError> {
        debug!(target: "drive", "getting a new page of files...");
        let mut query = vec![
            ("spaces", "drive".to_string()),
            ("q", "trashed=false".to_string()),
            ("pageSize", MAX_FILES_PER_PAGE.to_string()),
            ("fields", LIST_FIELDS.to_string()),
        ];
        match &self.team_drive {
            Some(drive_id) => {
                query.push(("corpora", "drive".to_string()));
                query.push(("supportsAllDrives", "true".to_string()));
                query.push(("includeItemsFromAllDrives", "true".to_string()));
                query.push(("driveId", drive_id.clone()));
            }
            None => query.push(("corpora", "user".to_string())),
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let list: FileListResource = self.get_json("/files", &query).await?;
        Ok(ListPage {
            files: list.files.into_iter().map(Into::into).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn changes_page(&self, page_token: &str) -> Result<ChangePage, ApiError> {
        debug!(target: "drive", "getting a new page of changes...");
        let mut query = vec![
            ("pageToken", page_token.to_string()),
            ("includeRemoved", "true".to_string()),
            ("pageSize", MAX_CHANGES_PER_PAGE.to_string()),
            ("fields", CHANGES_FIELDS.to_string()),
        ];
        if let Some(drive_id) = &self.team_drive {
            query.push(("supportsAllDrives", "true".to_string()));
            query.push(("includeItemsFromAllDrives", "true".to_string()));
            query.push(("driveId", drive_id.clone()));
        }
        let page: ChangeListResource = self.get_json("/changes", &query).await?;
        Ok(ChangePage {
            changes: page.changes.into_iter().map(Into::into).collect(),
            next_page_token: page.next_page_token,
            new_start_page_token: page.new_start_page_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileResource {
    id: String,
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
}

impl From<FileResource> for DriveFile {
    fn from(file: FileResource) -> Self {
        DriveFile {
            id: file.id,
            name: file.name,
            folder: file.mime_type == FOLDER_MIME_TYPE,
            parents: file.parents,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileListResource {
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<FileResource>,
}

#[derive(Debug, Deserialize)]
struct StartPageTokenResource {
    #[serde(rename = "startPageToken")]
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
struct ChangeFileResource {
    #[serde(default)]
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeResource {
    #[serde(rename = "changeType", default)]
    change_type: String,
    #[serde(rename = "fileId", default)]
    file_id: String,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    time: String,
    file: Option<ChangeFileResource>,
}

impl From<ChangeResource> for DriveChange {
    fn from(change: ChangeResource) -> Self {
        DriveChange {
            change_type: change.change_type,
            file_id: change.file_id,
            removed: change.removed,
            time: change.time,
            file: change.file.map(|f| ChangeFile {
                folder: f.mime_type == FOLDER_MIME_TYPE,
                name: f.name,
                trashed: f.trashed,
                parents: f.parents,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangeListResource {
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "newStartPageToken")]
    new_start_page_token: Option<String>,
    #[serde(default)]
    changes: Vec<ChangeResource>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
    token_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{ChangeListResource, FileResource, StatusCode};
    use crate::api::{ApiError, DriveChange, DriveFile};

    #[test]
    fn file_resources_map_folder_mime_types() {
        let raw = r#"{"id":"f1","name":"docs","mimeType":"application/vnd.google-apps.folder","parents":["root1"]}"#;
        let file: DriveFile = serde_json::from_str::<FileResource>(raw).unwrap().into();
        assert!(file.folder);
        assert_eq!(file.parents, vec!["root1"]);
    }

    #[test]
    fn change_pages_decode_removals_without_file_payload() {
        let raw = r#"{
            "newStartPageToken": "1043",
            "changes": [
                {"changeType":"file","fileId":"f1","removed":true,"time":"2024-01-02T03:04:05Z"},
                {"changeType":"file","fileId":"f2","removed":false,"time":"2024-01-02T03:04:06Z",
                 "file":{"name":"clip.mkv","mimeType":"video/x-matroska","trashed":false,"parents":["d1"]}}
            ]
        }"#;
        let page: ChangeListResource = serde_json::from_str(raw).unwrap();
        assert_eq!(page.new_start_page_token.as_deref(), Some("1043"));
        let changes: Vec<DriveChange> = page.changes.into_iter().map(Into::into).collect();
        assert!(changes[0].removed);
        assert!(changes[0].file.is_none());
        assert_eq!(changes[1].file.as_ref().unwrap().name, "clip.mkv");
    }

    #[test]
    fn statuses_split_into_transient_and_fatal() {
        assert!(matches!(
            super::classify_status(StatusCode::TOO_MANY_REQUESTS, "/files"),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            super::classify_status(StatusCode::BAD_GATEWAY, "/files"),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            super::classify_status(StatusCode::UNAUTHORIZED, "/files"),
            ApiError::Fatal(_)
        ));
        assert!(matches!(
            super::classify_status(StatusCode::NOT_FOUND, "/files"),
            ApiError::Fatal(_)
        ));
    }
}
