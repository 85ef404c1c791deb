// src/sys/secrets.rs

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::{CryptoRng, Rng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Length of every generated signing secret, in symbols of `[A-Za-z0-9]`.
pub const SECRET_LEN: usize = 64;

// ==============================================================================
// 1. Credential Record
// ==============================================================================

/// CredentialRecord is one generation of the rotated secret.
///
/// The secret itself lives in a zeroizing `SecretString`:
/// 1. It cannot be accidentally logged (`Debug` prints `[REDACTED]`).
/// 2. When the record is dropped, the heap buffer is scrubbed.
#[derive(Serialize, Deserialize)]
pub struct CredentialRecord {
    pub kid: String,
    #[serde(serialize_with = "serialize_exposed")]
    secret: SecretString,
    pub created_at: i64,
}

impl CredentialRecord {
    pub fn new(kid: String, secret: String, created_at: i64) -> Self {
        Self {
            kid,
            secret: SecretString::new(secret),
            created_at,
        }
    }

    /// Generates a fresh record using the thread-local CSPRNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// 🛡️ The `CryptoRng` bound keeps non-cryptographic generators out of
    /// credential material at compile time.
    pub fn generate_with<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let secret: String = (0..SECRET_LEN)
            .map(|_| char::from(rng.sample::<u8, _>(Alphanumeric)))
            .collect();

        Self::new(Uuid::new_v4().to_string(), secret, Utc::now().timestamp())
    }

    /// Exposes the secret for the duration of `action` only. The borrow cannot
    /// escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.secret.expose_secret())
    }
}

fn serialize_exposed<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Clone for CredentialRecord {
    fn clone(&self) -> Self {
        Self::new(
            self.kid.clone(),
            self.use_secret(str::to_string),
            self.created_at,
        )
    }
}

impl PartialEq for CredentialRecord {
    fn eq(&self, other: &Self) -> bool {
        self.kid == other.kid
            && self.created_at == other.created_at
            && self.use_secret(|a| other.use_secret(|b| a == b))
    }
}

impl Eq for CredentialRecord {}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("kid", &self.kid)
            .field("secret", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ==============================================================================
// 2. Parse Policy
// ==============================================================================

/// What to do when the stored history blob is not a valid record list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePolicy {
    /// Abort the rotation; prior credentials are never overwritten.
    Strict,
    /// Continue with an empty history. Loses every prior credential.
    TreatAsEmpty,
}

impl FromStr for ParsePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "empty" | "treat-as-empty" => Ok(Self::TreatAsEmpty),
            other => Err(format!(
                "Unknown parse policy '{}' (expected 'strict' or 'empty')",
                other
            )),
        }
    }
}

// ==============================================================================
// 3. History (newest-first)
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    records: Vec<CredentialRecord>,
}

impl History {
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        Self { records }
    }

    /// Parses a stored blob. Zero-length, whitespace-only and `null` content
    /// is a secret with no history yet, regardless of policy.
    pub fn parse(blob: &[u8], policy: ParsePolicy) -> Result<Self, String> {
        if blob.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        match serde_json::from_slice::<Option<Vec<CredentialRecord>>>(blob) {
            Ok(records) => Ok(Self::new(records.unwrap_or_default())),
            Err(e) => match policy {
                ParsePolicy::Strict => Err(format!("stored history is not a credential list: {}", e)),
                ParsePolicy::TreatAsEmpty => {
                    warn!(
                        discarded_bytes = blob.len(),
                        error = %e,
                        "⚠️ Stored history is unparsable; continuing with EMPTY history, prior credentials will be dropped"
                    );
                    Ok(Self::default())
                }
            },
        }
    }

    /// Puts `record` at index 0. Existing entries keep their relative order.
    pub fn prepend(&mut self, record: CredentialRecord) {
        self.records.insert(0, record);
    }

    /// Keeps the `max` newest records and returns how many were dropped.
    pub fn retain_latest(&mut self, max: usize) -> usize {
        let dropped = self.records.len().saturating_sub(max);
        self.records.truncate(max);
        dropped
    }

    pub fn to_payload(&self) -> Result<Zeroizing<Vec<u8>>, String> {
        serde_json::to_vec_pretty(&self.records)
            .map(Zeroizing::new)
            .map_err(|e| format!("failed to serialize history: {}", e))
    }

    #[cfg(test)]
    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    pub fn newest(&self) -> Option<&CredentialRecord> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// CRC32C (Castagnoli) over the exact bytes handed to the store.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}
