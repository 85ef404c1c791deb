// 🛡️ Zero-Trust Architecture: the rotator depends on traits, concrete
// collaborators live in their own modules.

pub mod traits;     // Store & identity contracts
pub mod secrets;    // Credential records, history, checksum
pub mod rotator;    // Read-merge-write cycle
pub mod metadata;   // Metadata server (project id, access token)
pub mod gcp;        // Google Secret Manager REST client
