use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::SnoopError;

/// OAuth2 token as stored by the external tool: a JSON blob with a refresh
/// token and an absolute expiry instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub refresh_token: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiry: Option<OffsetDateTime>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// Expired (or about to expire) tokens must be refreshed before use.
    pub fn expired_at(&self, now: OffsetDateTime) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now + time::Duration::seconds(10),
            None => false,
        }
    }
}

/// Everything the watcher needs from the drive backend section.
#[derive(Debug, Clone)]
pub struct DriveBackend {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub token: OAuthToken,
    pub root_folder_id: Option<String>,
    pub team_drive: Option<String>,
}

pub(crate) fn extract_drive_backend(
    name: &str,
    section: &HashMap<String, String>,
) -> Result<DriveBackend, SnoopError> {
    let fail = |reason: String| SnoopError::Backend {
        backend: name.to_string(),
        reason,
    };
    match section.get("type") {
        Some(kind) if kind == "drive" => {}
        Some(kind) => return Err(fail(format!("not a drive backend: {kind}"))),
        None => return Err(fail("backend type missing".to_string())),
    }
    let required = |key: &str| {
        section
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| fail(format!("key {key} not found")))
    };
    let client_id = required("client_id")?;
    let client_secret = required("client_secret")?;
    let scope = required("scope")?;
    let token = match section.get("token") {
        Some(raw) => serde_json::from_str::<OAuthToken>(raw)
            .map_err(|e| fail(format!("failed to parse the oauth2 token: {e}")))?,
        None if section.contains_key("service_account_file") => {
            return Err(fail(
                "authentication with a service account is not supported".to_string(),
            ))
        }
        None => {
            return Err(fail(
                "no suitable authentication found (oauth2 token required)".to_string(),
            ))
        }
    };
    // The remote's own alias for the default root adds nothing.
    let root_folder_id = section
        .get("root_folder_id")
        .filter(|v| !v.is_empty() && v.as_str() != "root")
        .cloned();
    let team_drive = section
        .get("team_drive")
        .filter(|v| !v.is_empty())
        .cloned();
    Ok(DriveBackend {
        client_id,
        client_secret,
        scope,
        token,
        root_folder_id,
        team_drive,
    })
}

#[cfg(test)]
mod tests {
    use super::extract_drive_backend;
    use std::collections::HashMap;

    fn base_section() -> HashMap<String, String> {
        let mut s = HashMap::new();
        s.insert("type".into(), "drive".into());
        s.insert("client_id".into(), "id.apps.googleusercontent.com".into());
        s.insert("client_secret".into(), "s3cret".into());
        s.insert("scope".into(), "drive".into());
        s.insert(
            "token".into(),
            r#"{"access_token":"at","token_type":"Bearer","refresh_token":"rt","expiry":"2030-01-01T00:00:00Z"}"#
                .into(),
        );
        s
    }

    #[test]
    fn extracts_a_complete_backend() {
        let mut section = base_section();
        section.insert("team_drive".into(), "0TDRIVE".into());
        let backend = extract_drive_backend("gd", &section).unwrap();
        assert_eq!(backend.scope, "drive");
        assert_eq!(backend.token.refresh_token, "rt");
        assert_eq!(backend.team_drive.as_deref(), Some("0TDRIVE"));
        assert_eq!(backend.root_folder_id, None);
    }

    #[test]
    fn literal_root_folder_id_is_ignored() {
        let mut section = base_section();
        section.insert("root_folder_id".into(), "root".into());
        let backend = extract_drive_backend("gd", &section).unwrap();
        assert_eq!(backend.root_folder_id, None);
    }

    #[test]
    fn rejects_wrong_type_and_missing_auth() {
        let mut section = base_section();
        section.insert("type".into(), "s3".into());
        assert!(extract_drive_backend("gd", &section).is_err());

        let mut section = base_section();
        section.remove("token");
        assert!(extract_drive_backend("gd", &section).is_err());

        let mut section = base_section();
        section.remove("token");
        section.insert("service_account_file".into(), "/sa.json".into());
        let err = extract_drive_backend("gd", &section).unwrap_err();
        assert!(err.to_string().contains("service account"));
    }
}
