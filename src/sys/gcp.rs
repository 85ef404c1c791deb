// src/sys/gcp.rs
//
// Google Secret Manager over its REST surface (v1). Authentication uses the
// metadata server's default service-account token.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::sys::metadata::MetadataClient;
use crate::sys::secrets::payload_checksum;
use crate::sys::traits::{SecretLocator, SecretStore, StoreError, StoredSecret, VersionHandle};

// ==============================================================================
// 1. Wire Types
// ==============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessResponse {
    name: Option<String>,
    payload: AccessPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessPayload {
    data: Option<SecretString>,
    // int64 fields travel as decimal strings in the JSON mapping
    data_crc32c: Option<String>,
}

#[derive(Deserialize)]
struct VersionResponse {
    name: String,
}

#[derive(Serialize)]
struct AddVersionRequest<'a> {
    payload: OutgoingPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingPayload<'a> {
    data: &'a str,
    data_crc32c: String,
}

// ==============================================================================
// 2. Client
// ==============================================================================

pub struct GcpSecretStore {
    http: Client,
    base_url: String,
    metadata: MetadataClient,
}

impl GcpSecretStore {
    pub fn new(http: Client, base_url: impl Into<String>, metadata: MetadataClient) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            metadata,
        }
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let token = self
            .metadata
            .access_token()
            .await
            .map_err(StoreError::Transient)?;

        request
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))
    }

    async fn latest_version_name(&self, locator: &SecretLocator) -> Result<String, StoreError> {
        let url = format!("{}/v1/{}", self.base_url, locator.latest());
        let res = check_status(self.authorized(self.http.get(&url)).await?).await?;
        let version = res
            .json::<VersionResponse>()
            .await
            .map_err(|e| StoreError::Transient(format!("malformed version response: {}", e)))?;
        Ok(version.name)
    }
}

/// Maps a non-2xx response onto the store's error taxonomy.
async fn check_status(res: Response) -> Result<Response, StoreError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(body),
        StatusCode::BAD_REQUEST if mentions_checksum(&body) => StoreError::ChecksumRejected,
        _ => StoreError::Transient(format!("HTTP {}: {}", status, body)),
    })
}

fn mentions_checksum(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("crc32c") || lower.contains("checksum")
}

#[async_trait]
impl SecretStore for GcpSecretStore {
    async fn fetch_latest(&self, locator: &SecretLocator) -> Result<StoredSecret, StoreError> {
        let url = format!("{}/v1/{}:access", self.base_url, locator.latest());
        let res = check_status(self.authorized(self.http.get(&url)).await?).await?;

        let access = res
            .json::<AccessResponse>()
            .await
            .map_err(|e| StoreError::Transient(format!("malformed access response: {}", e)))?;

        let data = match access.payload.data.as_ref() {
            Some(encoded) => Zeroizing::new(
                STANDARD
                    .decode(encoded.expose_secret().as_bytes())
                    .map_err(|e| StoreError::Transient(format!("payload is not base64: {}", e)))?,
            ),
            None => Zeroizing::new(Vec::new()),
        };

        // 🛡️ Transport integrity: verify the store's checksum on the way in too.
        if let Some(raw) = access.payload.data_crc32c.as_deref() {
            let expected: u32 = raw
                .parse()
                .map_err(|_| StoreError::Transient(format!("invalid dataCrc32c '{}'", raw)))?;
            if payload_checksum(&data) != expected {
                return Err(StoreError::Transient(
                    "fetched payload failed CRC32C verification".to_string(),
                ));
            }
        }

        debug!(version = ?access.name, bytes = data.len(), "Fetched latest secret version");
        Ok(StoredSecret {
            data,
            version: access.name,
        })
    }

    async fn add_version(
        &self,
        locator: &SecretLocator,
        payload: &[u8],
        checksum: u32,
        expected_version: Option<&str>,
    ) -> Result<VersionHandle, StoreError> {
        // AddSecretVersion has no precondition field, so the optimistic check
        // compares the current latest version immediately before the write.
        if let Some(expected) = expected_version {
            let actual = self.latest_version_name(locator).await?;
            if actual != expected {
                return Err(StoreError::Conflict {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let encoded = Zeroizing::new(STANDARD.encode(payload));
        let body = AddVersionRequest {
            payload: OutgoingPayload {
                data: encoded.as_str(),
                data_crc32c: checksum.to_string(),
            },
        };

        let url = format!("{}/v1/{}:addVersion", self.base_url, locator.parent());
        let res = check_status(self.authorized(self.http.post(&url).json(&body)).await?).await?;

        let version = res
            .json::<VersionResponse>()
            .await
            .map_err(|e| StoreError::Transient(format!("malformed addVersion response: {}", e)))?;

        Ok(VersionHandle { name: version.name })
    }
}
