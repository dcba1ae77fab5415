//! JSON-over-HTTPS sync provider.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use url::Url;

use tasksync_common::{Error, Result};
use tasksync_crypto::EncryptionKey;

use crate::config::SyncProviderPrivateCfg;
use crate::provider::{
    DownloadResponse, SnapshotResponse, SnapshotUpload, SyncProvider, UploadRequest,
    UploadResponse,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptionKeyResponse {
    encryption_key: String,
}

/// Provider talking to a sync server over HTTP.
pub struct HttpProvider {
    http: Client,
    base_url: Url,
    access_token: String,
    account: String,
}

impl HttpProvider {
    /// Create a provider from its private config.
    ///
    /// # Errors
    /// - invalid base URL
    /// - HTTP client construction failure
    pub fn new(cfg: &SyncProviderPrivateCfg, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|e| Error::Config(format!("Invalid baseUrl '{}': {}", cfg.base_url, e)))?;
        let http = Client::builder()
            .user_agent("TaskSync/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        let fingerprint: String = Sha256::digest(cfg.access_token.as_bytes())[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let account = format!("{}#{}", base_url.as_str().trim_end_matches('/'), fingerprint);

        Ok(Self {
            http,
            base_url,
            access_token: cfg.access_token.clone(),
            account,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::PAYLOAD_TOO_LARGE {
            Err(Error::PayloadTooLarge(
                "Request exceeds the server payload limit".to_string(),
            ))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Unauthorized("Invalid or expired token".to_string()))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!("{}", response.url())))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!("API error: {} - {}", status, body)))
        }
    }
}

fn send_error(what: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{}: {}", what, e))
    } else {
        Error::Network(format!("{}: {}", what, e))
    }
}

#[async_trait]
impl SyncProvider for HttpProvider {
    fn id(&self) -> &str {
        "http"
    }

    fn account_key(&self) -> String {
        self.account.clone()
    }

    async fn upload_ops(&self, request: &UploadRequest) -> Result<UploadResponse> {
        debug!("Uploading {} ops", request.ops.len());
        let response = self
            .http
            .post(self.endpoint("/api/sync/ops")?)
            .header(header::AUTHORIZATION, self.auth_header())
            .json(request)
            .send()
            .await
            .map_err(|e| send_error("Failed to upload ops", e))?;

        self.handle_response(response).await
    }

    async fn download_ops(&self, since_seq: u64, limit: usize) -> Result<DownloadResponse> {
        let response = self
            .http
            .get(self.endpoint("/api/sync/ops")?)
            .header(header::AUTHORIZATION, self.auth_header())
            .query(&[("since", since_seq.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(|e| send_error("Failed to download ops", e))?;

        self.handle_response(response).await
    }

    async fn upload_snapshot(&self, snapshot: &SnapshotUpload) -> Result<SnapshotResponse> {
        let response = self
            .http
            .post(self.endpoint("/api/sync/snapshot")?)
            .header(header::AUTHORIZATION, self.auth_header())
            .json(snapshot)
            .send()
            .await
            .map_err(|e| send_error("Failed to upload snapshot", e))?;

        self.handle_response(response).await
    }

    async fn delete_all_data(&self) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint("/api/sync/data")?)
            .header(header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| send_error("Failed to delete remote data", e))?;

        if response.status().is_success() {
            return Ok(());
        }
        self.handle_response::<serde_json::Value>(response)
            .await
            .map(|_| ())
    }

    async fn fetch_auto_encryption_key(&self) -> Result<String> {
        let response = self
            .http
            .get(self.endpoint("/user/encryption-key")?)
            .header(header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| send_error("Failed to fetch encryption key", e))?;

        let body: EncryptionKeyResponse = match self.handle_response(response).await {
            Err(Error::NotFound(_)) => {
                return Err(Error::NotSupported(
                    "Server does not provide encryption keys".to_string(),
                ))
            }
            other => other?,
        };
        // Reject anything that is not a 32-byte key before it reaches config.
        EncryptionKey::from_base64(&body.encryption_key)?;
        Ok(body.encryption_key)
    }
}
