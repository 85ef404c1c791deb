// src/config.rs

use regex::Regex;
use std::env;
use std::time::Duration;

use crate::sys::rotator::RotationSettings;
use crate::sys::secrets::ParsePolicy;
use crate::sys::traits::SecretLocator;

/// Numeric project id used when neither the environment nor the metadata
/// server can tell us which project we are running in.
pub const DEFAULT_FALLBACK_PROJECT_ID: &str = "122203615305";
pub const DEFAULT_SECRET_NAME: &str = "TEST_JGW";

#[derive(Clone, Debug)]
pub struct RotatorConfig {
    // 🛡️ Identity & Addressing
    pub project_id: Option<String>,
    pub fallback_project_id: String,
    pub secret_name: String,

    // History & write policy
    pub max_history: Option<usize>,
    pub parse_policy: ParsePolicy,
    pub conflict_retries: u32,
    pub timeout: Duration,

    // 📡 Collaborator endpoints (overridable for local emulators)
    pub metadata_url: String,
    pub secret_manager_url: String,

    pub port: u16,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            fallback_project_id: DEFAULT_FALLBACK_PROJECT_ID.to_string(),
            secret_name: DEFAULT_SECRET_NAME.to_string(),
            max_history: None,
            parse_policy: ParsePolicy::Strict,
            conflict_retries: 3,
            timeout: Duration::from_secs(30),
            metadata_url: "http://metadata.google.internal".to_string(),
            secret_manager_url: "https://secretmanager.googleapis.com".to_string(),
            port: 8080,
        }
    }
}

impl RotatorConfig {
    pub fn load() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't have to
    /// mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // 🛡️ Zero-Trust Parsing
        // A malformed number refuses to start instead of silently falling back,
        // so an operator typo can't disable the retention cap or the deadline.
        let max_history = match lookup("ROTATOR_MAX_HISTORY") {
            Some(raw) => {
                let cap = parse_number::<usize>("ROTATOR_MAX_HISTORY", &raw)?;
                if cap == 0 {
                    return Err("ROTATOR_MAX_HISTORY must be at least 1".to_string());
                }
                Some(cap)
            }
            None => None,
        };

        let parse_policy = match lookup("ROTATOR_PARSE_POLICY") {
            Some(raw) => raw.parse::<ParsePolicy>()?,
            None => defaults.parse_policy,
        };

        let conflict_retries = match lookup("ROTATOR_CONFLICT_RETRIES") {
            Some(raw) => parse_number::<u32>("ROTATOR_CONFLICT_RETRIES", &raw)?,
            None => defaults.conflict_retries,
        };

        let timeout = match lookup("ROTATOR_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = parse_number::<u64>("ROTATOR_TIMEOUT_SECS", &raw)?;
                if secs == 0 {
                    return Err("ROTATOR_TIMEOUT_SECS must be at least 1".to_string());
                }
                Duration::from_secs(secs)
            }
            None => defaults.timeout,
        };

        let port = match lookup("PORT") {
            Some(raw) => parse_number::<u16>("PORT", &raw)?,
            None => defaults.port,
        };

        let project_id = lookup("ROTATOR_PROJECT_ID").filter(|p| !p.trim().is_empty());
        if let Some(ref project) = project_id {
            validate_project_id(project)?;
        }

        let fallback_project_id = lookup("ROTATOR_FALLBACK_PROJECT_ID")
            .unwrap_or(defaults.fallback_project_id);
        validate_project_id(&fallback_project_id)?;

        let secret_name = lookup("ROTATOR_SECRET_NAME").unwrap_or(defaults.secret_name);
        validate_secret_name(&secret_name)?;

        Ok(Self {
            project_id,
            fallback_project_id,
            secret_name,
            max_history,
            parse_policy,
            conflict_retries,
            timeout,
            metadata_url: lookup("ROTATOR_METADATA_URL").unwrap_or(defaults.metadata_url),
            secret_manager_url: lookup("ROTATOR_SECRET_MANAGER_URL")
                .unwrap_or(defaults.secret_manager_url),
            port,
        })
    }

    /// Binds the loaded config to the project the rotation will run against.
    pub fn rotation_settings(&self, project: impl Into<String>) -> RotationSettings {
        RotationSettings {
            locator: SecretLocator::new(project, self.secret_name.clone()),
            parse_policy: self.parse_policy,
            max_history: self.max_history,
            conflict_retries: self.conflict_retries,
            timeout: self.timeout,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("{} must be a valid non-negative integer, got '{}'", key, raw))
}

/// 🛡️ Zero-Trust: locator segments are interpolated into request paths, so
/// anything outside the Secret Manager id alphabet is rejected up front.
pub fn validate_secret_name(name: &str) -> Result<(), String> {
    let pattern = Regex::new(r"^[A-Za-z0-9_-]{1,255}$").map_err(|e| e.to_string())?;
    if !pattern.is_match(name) {
        return Err(format!("Invalid secret name: '{}'", name));
    }
    Ok(())
}

pub fn validate_project_id(project: &str) -> Result<(), String> {
    let pattern = Regex::new(r"^[a-z0-9-]{1,64}$").map_err(|e| e.to_string())?;
    if !pattern.is_match(project) {
        return Err(format!("Invalid project id: '{}'", project));
    }
    Ok(())
}
