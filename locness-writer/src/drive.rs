//! Google Drive publish target.
//!
//! Implements [`Publisher`] with replace-by-name semantics on top of the Drive v3
//! REST API:
//! - look the file up by name (and folder), caching file ids per name;
//! - existing file: overwrite its content with a media upload;
//! - missing file: create the metadata entry, then upload the content.
//!
//! Authentication is the service-account JWT bearer grant. Access tokens are
//! cached and refreshed shortly before they expire. Shared drives are supported
//! through the `supportsAllDrives` family of parameters.

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use locness_writer_core::contract::{PublishError, PublishReceipt, Publisher};

use crate::credentials::ServiceAccountKey;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const DRIVES_URL: &str = "https://www.googleapis.com/drive/v3/drives";
const CSV_MIME: &str = "text/csv";
/// Tokens are refreshed this long before Google says they expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
struct DriveInfo {
    #[serde(default)]
    name: Option<String>,
}

/// Result of `check-drive`.
#[derive(Debug, Serialize)]
pub struct DriveAccess {
    pub client_email: String,
    pub folder_id: Option<String>,
    pub shared_drive: Option<String>,
    /// Files visible to a one-item listing of the target folder.
    pub visible_files: Vec<String>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Service-account access tokens for the Drive scope.
pub struct TokenSource {
    key: ServiceAccountKey,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(key: ServiceAccountKey, http: Client) -> Self {
        Self {
            key,
            http,
            cached: Mutex::new(None),
        }
    }

    /// Signed RS256 assertion for the JWT bearer grant, valid for one hour.
    pub fn assertion(&self, issued_at: i64) -> Result<String, PublishError> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.key.token_uri,
            iat: issued_at,
            exp: issued_at + 3600,
        };
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| PublishError::Auth(format!("invalid service account private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| PublishError::Auth(format!("failed to sign token request: {e}")))
    }

    pub async fn access_token(&self) -> Result<String, PublishError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.assertion(chrono::Utc::now().timestamp())?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PublishError::Unreachable(format!("token endpoint: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "[PUBLISH] Token exchange refused");
            return Err(PublishError::Auth(format!("token exchange returned {status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Auth(format!("unreadable token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        debug!(expires_in = token.expires_in, "[PUBLISH] Obtained Drive access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriveSettings {
    pub folder_id: Option<String>,
    pub shared_drive_id: Option<String>,
    pub timeout: Duration,
}

pub struct DriveClient {
    http: Client,
    tokens: TokenSource,
    settings: DriveSettings,
    file_ids: Mutex<HashMap<String, String>>,
}

/// Drive search expression for a file called `name`, optionally inside `folder_id`.
pub fn search_query(name: &str, folder_id: Option<&str>) -> String {
    let mut q = format!("name = '{}' and trashed = false", escape_literal(name));
    if let Some(folder) = folder_id {
        q.push_str(&format!(" and '{}' in parents", escape_literal(folder)));
    }
    q
}

/// Drive search expression listing the live contents of `folder_id`, or of
/// everything the account can see when no folder is configured.
pub fn folder_listing_query(folder_id: Option<&str>) -> String {
    match folder_id {
        Some(folder) => format!("'{}' in parents and trashed = false", escape_literal(folder)),
        None => "trashed = false".to_string(),
    }
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Maps a non-success Drive response to a publish error.
pub fn status_error(name: &str, status: StatusCode, body: &str) -> PublishError {
    let message = format!("{status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => PublishError::Unreachable(message),
        s if s.is_server_error() => PublishError::Unreachable(message),
        _ => PublishError::Rejected {
            name: name.to_string(),
            message,
        },
    }
}

impl DriveClient {
    pub fn new(key: ServiceAccountKey, settings: DriveSettings) -> Result<Self, PublishError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| PublishError::Unreachable(format!("http client: {e}")))?;
        info!(
            client_email = %key.client_email,
            folder_id = settings.folder_id.as_deref().unwrap_or("root"),
            shared_drive = settings.shared_drive_id.is_some(),
            "Initialised Drive client"
        );
        Ok(Self {
            tokens: TokenSource::new(key, http.clone()),
            http,
            settings,
            file_ids: Mutex::new(HashMap::new()),
        })
    }

    async fn authorised(&self, request: RequestBuilder) -> Result<RequestBuilder, PublishError> {
        let token = self.tokens.access_token().await?;
        let request = request.bearer_auth(token);
        Ok(if self.settings.shared_drive_id.is_some() {
            request.query(&[("supportsAllDrives", "true")])
        } else {
            request
        })
    }

    async fn send(&self, name: &str, request: RequestBuilder) -> Result<reqwest::Response, PublishError> {
        let response = self
            .authorised(request)
            .await?
            .send()
            .await
            .map_err(|e| PublishError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(name, status, &body))
    }

    /// Confirms the service account can see the configured shared drive and
    /// returns its name.
    pub async fn verify_shared_drive(&self) -> Result<Option<String>, PublishError> {
        let Some(drive_id) = self.settings.shared_drive_id.as_deref() else {
            return Ok(None);
        };
        let request = self
            .http
            .get(format!("{DRIVES_URL}/{drive_id}"))
            .query(&[("fields", "id,name")]);
        let response = self.send(drive_id, request).await.map_err(|e| {
            error!(
                drive_id,
                error = %e,
                "Cannot access shared drive; add the service account as a member"
            );
            e
        })?;
        let info: DriveInfo = response
            .json()
            .await
            .map_err(|e| PublishError::Unreachable(format!("drive info: {e}")))?;
        info!(drive_id, name = info.name.as_deref().unwrap_or("unknown"), "Verified shared drive access");
        Ok(info.name)
    }

    /// Exchanges a token, checks the shared drive and lists one file from the
    /// target folder. Nothing is written.
    pub async fn check_access(&self) -> Result<DriveAccess, PublishError> {
        self.tokens.access_token().await?;
        info!(client_email = %self.tokens.key.client_email, "Obtained Drive access token");
        let shared_drive = self.verify_shared_drive().await?;

        let folder = self.settings.folder_id.as_deref();
        let mut params = vec![
            ("q", folder_listing_query(folder)),
            ("pageSize", "1".to_string()),
            ("fields", "files(id,name)".to_string()),
        ];
        if let Some(drive_id) = &self.settings.shared_drive_id {
            params.push(("driveId", drive_id.clone()));
            params.push(("corpora", "drive".to_string()));
            params.push(("includeItemsFromAllDrives", "true".to_string()));
        }
        let target = folder.unwrap_or("root");
        let list: FileList = self
            .send(target, self.http.get(FILES_URL).query(&params))
            .await?
            .json()
            .await
            .map_err(|e| PublishError::Unreachable(format!("unreadable file list: {e}")))?;
        info!(folder_id = target, files = list.files.len(), "Listed target folder");

        Ok(DriveAccess {
            client_email: self.tokens.key.client_email.clone(),
            folder_id: self.settings.folder_id.clone(),
            shared_drive,
            visible_files: list
                .files
                .into_iter()
                .map(|f| f.name.unwrap_or(f.id))
                .collect(),
        })
    }

    async fn find_file(&self, name: &str) -> Result<Option<String>, PublishError> {
        if let Some(id) = self.file_ids.lock().await.get(name) {
            return Ok(Some(id.clone()));
        }
        let mut params = vec![
            ("q", search_query(name, self.settings.folder_id.as_deref())),
            ("fields", "files(id,name)".to_string()),
        ];
        if let Some(drive_id) = &self.settings.shared_drive_id {
            params.push(("driveId", drive_id.clone()));
            params.push(("corpora", "drive".to_string()));
            params.push(("includeItemsFromAllDrives", "true".to_string()));
        }
        let response = self.send(name, self.http.get(FILES_URL).query(&params)).await?;
        let list: FileList = response.json().await.map_err(|e| PublishError::Rejected {
            name: name.to_string(),
            message: format!("unreadable file list: {e}"),
        })?;
        if list.files.len() > 1 {
            warn!(file = name, matches = list.files.len(), "[PUBLISH] Several files share this name, using the first");
        }
        let id = list.files.into_iter().next().map(|f| f.id);
        if let Some(id) = &id {
            self.file_ids.lock().await.insert(name.to_string(), id.clone());
        }
        Ok(id)
    }

    async fn create_file(&self, name: &str) -> Result<String, PublishError> {
        let parent = self
            .settings
            .folder_id
            .as_ref()
            .or(self.settings.shared_drive_id.as_ref());
        let mut metadata = json!({ "name": name, "mimeType": CSV_MIME });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }
        let request = self
            .http
            .post(FILES_URL)
            .query(&[("fields", "id")])
            .json(&metadata);
        let created: FileRef = self
            .send(name, request)
            .await?
            .json()
            .await
            .map_err(|e| PublishError::Rejected {
                name: name.to_string(),
                message: format!("unreadable create response: {e}"),
            })?;
        self.file_ids
            .lock()
            .await
            .insert(name.to_string(), created.id.clone());
        Ok(created.id)
    }

    async fn upload_content(&self, name: &str, file_id: &str, content: &[u8]) -> Result<(), PublishError> {
        let request = self
            .http
            .patch(format!("{UPLOAD_URL}/{file_id}"))
            .query(&[("uploadType", "media"), ("fields", "id")])
            .header(reqwest::header::CONTENT_TYPE, CSV_MIME)
            .body(content.to_vec());
        self.send(name, request).await.map(|_| ())
    }
}

#[async_trait]
impl Publisher for DriveClient {
    async fn publish(&self, name: &str, content: &[u8]) -> Result<PublishReceipt, PublishError> {
        if let Some(file_id) = self.find_file(name).await? {
            match self.upload_content(name, &file_id, content).await {
                Ok(()) => {
                    debug!(file = name, file_id = %file_id, "[PUBLISH] Updated existing file");
                    return Ok(PublishReceipt {
                        file_id,
                        created: false,
                    });
                }
                Err(PublishError::Rejected { message, .. }) if message.starts_with("404") => {
                    // Deleted behind our back; forget the id and recreate.
                    warn!(file = name, file_id = %file_id, "[PUBLISH] Cached file is gone, recreating");
                    self.file_ids.lock().await.remove(name);
                }
                Err(e) => return Err(e),
            }
        }
        let file_id = self.create_file(name).await?;
        self.upload_content(name, &file_id, content).await?;
        debug!(file = name, file_id = %file_id, "[PUBLISH] Created new file");
        Ok(PublishReceipt {
            file_id,
            created: true,
        })
    }
}
