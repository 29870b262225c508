//! Remote file-storage client: Google Drive v3 with service-account auth.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "ors-drive";

pub const SPREADSHEET_MIME: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("signing service-account assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("drive returned {status} during {context}")]
    Status { status: StatusCode, context: String },
    #[error("resumable upload session is missing its location header")]
    MissingUploadSession,
    #[error("local file {path}: {source}")]
    LocalIo {
        path: String,
        source: std::io::Error,
    },
}

/// Handle to a remote artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    Created,
    Updated,
}

impl fmt::Display for UploadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
        }
    }
}

/// Seam between the orchestrator and the remote file store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn find_by_name(
        &self,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<RemoteFile>, DriveError>;

    async fn download(&self, file: &RemoteFile, dest: &Path) -> Result<(), DriveError>;

    /// Upload the local file into the folder, replacing a same-named remote
    /// file when one exists.
    async fn upload_or_replace(
        &self,
        local: &Path,
        folder_id: &str,
    ) -> Result<(RemoteFile, UploadAction), DriveError>;
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub client_email: String,
    /// PEM private key; literal `\n` sequences are normalized before parsing.
    pub private_key: String,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

/// Google Drive [`RemoteStore`]. The signing key is validated at
/// construction so credential problems abort the run before any account is
/// processed.
pub struct DriveClient {
    http: reqwest::Client,
    client_email: String,
    signing_key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
}

impl DriveClient {
    pub fn new(config: DriveConfig) -> Result<Self, DriveError> {
        let pem = config.private_key.replace("\\n", "\n");
        let signing_key = EncodingKey::from_rsa_pem(pem.as_bytes())?;
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            client_email: config.client_email,
            signing_key,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, DriveError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(token.access_token.clone());
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iss: &self.client_email,
            scope: DRIVE_SCOPE,
            aud: TOKEN_URI,
            iat: now,
            exp: now + 3600,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)?;
        let response = self
            .http
            .post(TOKEN_URI)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let response = check_status(response, "token exchange")?;
        let token: TokenResponse = response.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        debug!("refreshed drive access token");
        Ok(access_token)
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn find_by_name(
        &self,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<RemoteFile>, DriveError> {
        let token = self.access_token().await?;
        let query = name_in_folder_query(folder_id, name);
        let response = self
            .http
            .get(FILES_URL)
            .bearer_auth(&token)
            .query(&[
                ("q", query.as_str()),
                ("spaces", "drive"),
                ("fields", "files(id,name)"),
                ("includeItemsFromAllDrives", "true"),
                ("supportsAllDrives", "true"),
            ])
            .send()
            .await?;
        let response = check_status(response, "file lookup")?;
        let list: FileList = response.json().await?;
        Ok(list.files.into_iter().next())
    }

    async fn download(&self, file: &RemoteFile, dest: &Path) -> Result<(), DriveError> {
        let token = self.access_token().await?;
        let url = format!("{FILES_URL}/{}", file.id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await?;
        let response = check_status(response, "download")?;
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|source| DriveError::LocalIo {
                path: dest.display().to_string(),
                source,
            })?;
        Ok(())
    }

    async fn upload_or_replace(
        &self,
        local: &Path,
        folder_id: &str,
    ) -> Result<(RemoteFile, UploadAction), DriveError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| DriveError::LocalIo {
                path: local.display().to_string(),
                source,
            })?;
        let token = self.access_token().await?;

        if let Some(existing) = self.find_by_name(folder_id, &name).await? {
            let url = format!("{UPLOAD_URL}/{}", existing.id);
            let response = self
                .http
                .patch(&url)
                .bearer_auth(&token)
                .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
                .header(header::CONTENT_TYPE, SPREADSHEET_MIME)
                .body(bytes)
                .send()
                .await?;
            check_status(response, "media update")?;
            return Ok((existing, UploadAction::Updated));
        }

        // resumable create: metadata first, then the payload
        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
            "mimeType": SPREADSHEET_MIME,
        });
        let response = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(&token)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .json(&metadata)
            .send()
            .await?;
        let response = check_status(response, "upload session")?;
        let session = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
            .ok_or(DriveError::MissingUploadSession)?;
        let response = self
            .http
            .put(&session)
            .bearer_auth(&token)
            .header(header::CONTENT_TYPE, SPREADSHEET_MIME)
            .body(bytes)
            .send()
            .await?;
        let response = check_status(response, "upload payload")?;
        let created: RemoteFile = response.json().await?;
        Ok((created, UploadAction::Created))
    }
}

fn check_status(response: reqwest::Response, context: &str) -> Result<reqwest::Response, DriveError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DriveError::Status {
            status,
            context: context.to_string(),
        })
    }
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn name_in_folder_query(folder_id: &str, name: &str) -> String {
    format!(
        "name = '{}' and '{}' in parents and trashed = false",
        escape_query_value(name),
        escape_query_value(folder_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_query_escapes_quotes() {
        let query = name_in_folder_query("folder-1", "O'Hare Imports.xlsx");
        assert_eq!(
            query,
            "name = 'O\\'Hare Imports.xlsx' and 'folder-1' in parents and trashed = false"
        );
    }

    #[test]
    fn upload_action_renders_like_the_run_log_expects() {
        assert_eq!(UploadAction::Created.to_string(), "created");
        assert_eq!(UploadAction::Updated.to_string(), "updated");
    }

    #[test]
    fn token_claims_serialize_with_oauth_field_names() {
        let claims = TokenClaims {
            iss: "svc@example.iam.gserviceaccount.com",
            scope: DRIVE_SCOPE,
            aud: TOKEN_URI,
            iat: 1,
            exp: 3601,
        };
        let value = serde_json::to_value(&claims).expect("serialize");
        assert_eq!(value["iss"], "svc@example.iam.gserviceaccount.com");
        assert_eq!(value["aud"], TOKEN_URI);
        assert_eq!(value["exp"], 3601);
    }

    #[test]
    fn malformed_private_key_is_rejected_at_construction() {
        let err = DriveClient::new(DriveConfig {
            client_email: "svc@example.iam.gserviceaccount.com".into(),
            private_key: "not a pem".into(),
        });
        assert!(matches!(err, Err(DriveError::Jwt(_))));
    }
}
