// src/sys/metadata.rs
//
// 📡 GCE/Cloud Functions metadata server: project identity and the default
// service account's access token. Every request carries the required
// `Metadata-Flavor: Google` marker header.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::validate_project_id;
use crate::sys::traits::IdentityResolver;

const FLAVOR_HEADER: &str = "Metadata-Flavor";
const FLAVOR_VALUE: &str = "Google";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: SecretString,
}

#[derive(Clone)]
pub struct MetadataClient {
    http: Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, String> {
        let url = format!("{}/computeMetadata/v1/{}", self.base_url, path);
        let res = self
            .http
            .get(&url)
            .header(FLAVOR_HEADER, FLAVOR_VALUE)
            .send()
            .await
            .map_err(|e| format!("metadata request to {} failed: {}", url, e))?;

        if !res.status().is_success() {
            return Err(format!("metadata server returned {} for {}", res.status(), url));
        }
        Ok(res)
    }

    /// Fetches an OAuth access token for the instance's default service account.
    pub async fn access_token(&self) -> Result<SecretString, String> {
        let token = self
            .get("instance/service-accounts/default/token")
            .await?
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("malformed token response: {}", e))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl IdentityResolver for MetadataClient {
    async fn resolve_project_id(&self) -> Result<String, String> {
        let body = self
            .get("project/numeric-project-id")
            .await?
            .text()
            .await
            .map_err(|e| format!("failed to read project id: {}", e))?;

        let project = body.trim().to_string();
        validate_project_id(&project)?;
        Ok(project)
    }
}

/// Picks the project the rotation runs against. An explicitly configured id
/// wins; otherwise the resolver is asked, and on failure the fallback literal
/// is substituted with a warning. Identity resolution never fails the rotation.
pub async fn resolve_project_id(
    configured: Option<&str>,
    fallback: &str,
    resolver: &dyn IdentityResolver,
) -> String {
    if let Some(project) = configured {
        return project.to_string();
    }

    match resolver.resolve_project_id().await {
        Ok(project) => {
            info!(project_id = %project, "ProjectID resolved from metadata server");
            project
        }
        Err(e) => {
            warn!(
                error = %e,
                fallback = %fallback,
                "Failed to retrieve metadata, using fallback project id"
            );
            fallback.to_string()
        }
    }
}
