// src/sys/rotator.rs
//
// 🔁 One rotation = generate -> fetch -> merge -> persist. The whole history
// is the unit of storage: it is read in full, extended by exactly one record
// at the front, and written back as a brand-new version.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::sys::secrets::{CredentialRecord, History, ParsePolicy, payload_checksum};
use crate::sys::traits::{SecretLocator, SecretStore, StoreError};

#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub locator: SecretLocator,
    pub parse_policy: ParsePolicy,
    pub max_history: Option<usize>,
    /// Extra attempts allowed after a conditional-write conflict.
    pub conflict_retries: u32,
    /// Deadline for the complete read-merge-write cycle, retries included.
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("failed to retrieve secret: {0}")]
    FetchFailed(StoreError),

    #[error("failed to parse stored history: {0}")]
    ParseFailed(String),

    #[error("{0}")]
    Serialize(String),

    #[error("failed to update secret: {0}")]
    SubmitFailed(StoreError),

    #[error("secret kept changing underneath us, gave up after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("rotation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub kid: String,
    pub version: String,
    pub history_len: usize,
    pub attempts: u32,
}

pub struct Rotator {
    settings: RotationSettings,
    store: Arc<dyn SecretStore>,
}

impl Rotator {
    pub fn new(settings: RotationSettings, store: Arc<dyn SecretStore>) -> Self {
        Self { settings, store }
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    /// Runs one rotation under the configured deadline and logs the outcome.
    pub async fn rotate(&self) -> Result<RotationOutcome, RotationError> {
        let result = match tokio::time::timeout(self.settings.timeout, self.rotate_with_retries()).await {
            Ok(result) => result,
            Err(_) => Err(RotationError::Timeout(self.settings.timeout)),
        };

        match &result {
            Ok(outcome) => info!(
                secret = %self.settings.locator,
                kid = %outcome.kid,
                version = %outcome.version,
                history_len = outcome.history_len,
                attempts = outcome.attempts,
                "Updated secret"
            ),
            Err(e) => error!(secret = %self.settings.locator, error = %e, "Failed to update secret"),
        }

        result
    }

    /// Only write conflicts are retried; every other failure is single-shot.
    async fn rotate_with_retries(&self) -> Result<RotationOutcome, RotationError> {
        let max_attempts = self.settings.conflict_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.rotate_once(attempt).await {
                Err(RotationError::SubmitFailed(StoreError::Conflict { expected, actual })) => {
                    if attempt >= max_attempts {
                        return Err(RotationError::Conflict { attempts: attempt });
                    }
                    warn!(
                        attempt,
                        expected = %expected,
                        actual = %actual,
                        "Concurrent rotation detected, re-reading history"
                    );
                }
                other => return other,
            }
        }
    }

    async fn rotate_once(&self, attempt: u32) -> Result<RotationOutcome, RotationError> {
        let locator = &self.settings.locator;

        // 1. New credential
        let record = CredentialRecord::generate();
        let kid = record.kid.clone();

        // 2. 🛡️ Fetch failure aborts: writing [record] alone would discard history.
        let stored = self
            .store
            .fetch_latest(locator)
            .await
            .map_err(RotationError::FetchFailed)?;

        // 3. Merge newest-first
        let mut history = History::parse(&stored.data, self.settings.parse_policy)
            .map_err(RotationError::ParseFailed)?;
        let fresh_history = history.is_empty();
        history.prepend(record);

        if let Some(newest) = history.newest() {
            info!(
                kid = %newest.kid,
                created_at = newest.created_at,
                fresh_history,
                "Generated credential"
            );
        }

        if let Some(max) = self.settings.max_history {
            let dropped = history.retain_latest(max);
            if dropped > 0 {
                info!(dropped, max, "Trimmed credential history");
            }
        }

        // 4. Persist as a new version, conditional on what we read
        let payload = history.to_payload().map_err(RotationError::Serialize)?;
        let checksum = payload_checksum(&payload);

        let handle = self
            .store
            .add_version(locator, &payload, checksum, stored.version.as_deref())
            .await
            .map_err(RotationError::SubmitFailed)?;

        Ok(RotationOutcome {
            kid,
            version: handle.name,
            history_len: history.len(),
            attempts: attempt,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sys::traits::{StoredSecret, VersionHandle};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use zeroize::Zeroizing;

    /// Versioned in-memory store with real conditional-write semantics.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub versions: Mutex<Vec<Vec<u8>>>,
        pub fetch_error: Mutex<Option<StoreError>>,
        pub submit_error: Mutex<Option<StoreError>>,
        /// Blobs committed by a simulated concurrent writer, one per write,
        /// right before our own write lands.
        pub racing_writes: Mutex<Vec<Vec<u8>>>,
        pub fetch_delay: Option<Duration>,
        pub writes: Mutex<Vec<(Vec<u8>, u32)>>,
    }

    impl MemoryStore {
        pub fn with_blob(blob: &[u8]) -> Self {
            let store = Self::default();
            store.versions.lock().unwrap().push(blob.to_vec());
            store
        }

        fn latest_name(versions: &[Vec<u8>]) -> String {
            format!("projects/p/secrets/s/versions/{}", versions.len())
        }

        pub fn latest_history(&self) -> History {
            let versions = self.versions.lock().unwrap();
            History::parse(versions.last().unwrap(), ParsePolicy::Strict).unwrap()
        }

        pub fn write_attempts(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SecretStore for MemoryStore {
        async fn fetch_latest(&self, _locator: &SecretLocator) -> Result<StoredSecret, StoreError> {
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.fetch_error.lock().unwrap().clone() {
                return Err(err);
            }
            let versions = self.versions.lock().unwrap();
            let latest = versions
                .last()
                .ok_or_else(|| StoreError::NotFound("no versions".into()))?;
            Ok(StoredSecret {
                data: Zeroizing::new(latest.clone()),
                version: Some(Self::latest_name(&versions)),
            })
        }

        async fn add_version(
            &self,
            _locator: &SecretLocator,
            payload: &[u8],
            checksum: u32,
            expected_version: Option<&str>,
        ) -> Result<VersionHandle, StoreError> {
            self.writes.lock().unwrap().push((payload.to_vec(), checksum));
            if let Some(err) = self.submit_error.lock().unwrap().clone() {
                return Err(err);
            }
            if payload_checksum(payload) != checksum {
                return Err(StoreError::ChecksumRejected);
            }

            let mut versions = self.versions.lock().unwrap();
            let mut racing = self.racing_writes.lock().unwrap();
            if !racing.is_empty() {
                versions.push(racing.remove(0));
            }

            let actual = Self::latest_name(&versions);
            if let Some(expected) = expected_version {
                if expected != actual {
                    return Err(StoreError::Conflict {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }

            versions.push(payload.to_vec());
            Ok(VersionHandle {
                name: Self::latest_name(&versions),
            })
        }
    }

    fn settings() -> RotationSettings {
        RotationSettings {
            locator: SecretLocator::new("p", "s"),
            parse_policy: ParsePolicy::Strict,
            max_history: None,
            conflict_retries: 3,
            timeout: Duration::from_secs(5),
        }
    }

    fn record(kid: &str, created_at: i64) -> CredentialRecord {
        CredentialRecord::new(kid.to_string(), format!("{:0>64}", kid), created_at)
    }

    fn blob(records: Vec<CredentialRecord>) -> Vec<u8> {
        History::new(records).to_payload().unwrap().to_vec()
    }

    #[tokio::test]
    async fn empty_history_becomes_single_record() {
        let store = Arc::new(MemoryStore::with_blob(b"[]"));
        let rotator = Rotator::new(settings(), store.clone());

        let outcome = rotator.rotate().await.unwrap();

        let history = store.latest_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history.newest().unwrap().kid, outcome.kid);
        assert_eq!(outcome.history_len, 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.version, "projects/p/secrets/s/versions/2");
    }

    #[tokio::test]
    async fn null_history_becomes_single_record() {
        let store = Arc::new(MemoryStore::with_blob(b"null"));
        let rotator = Rotator::new(settings(), store.clone());

        let outcome = rotator.rotate().await.unwrap();

        assert_eq!(outcome.history_len, 1);
        assert_eq!(store.latest_history().newest().unwrap().kid, outcome.kid);
    }

    #[tokio::test]
    async fn new_record_is_prepended_in_order() {
        let (c1, c2, c3) = (record("c1", 30), record("c2", 20), record("c3", 10));
        let store = Arc::new(MemoryStore::with_blob(&blob(vec![
            c1.clone(),
            c2.clone(),
            c3.clone(),
        ])));
        let rotator = Rotator::new(settings(), store.clone());

        let outcome = rotator.rotate().await.unwrap();

        let history = store.latest_history();
        let records = history.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].kid, outcome.kid);
        records[0].use_secret(|s| {
            assert_eq!(s.len(), 64);
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        });
        assert_eq!(&records[1..], &[c1, c2, c3]);
    }

    #[tokio::test]
    async fn fetch_failure_never_writes() {
        let store = Arc::new(MemoryStore::with_blob(&blob(vec![record("old", 1)])));
        *store.fetch_error.lock().unwrap() = Some(StoreError::Transient("network down".into()));
        let rotator = Rotator::new(settings(), store.clone());

        let err = rotator.rotate().await.unwrap_err();

        assert!(matches!(err, RotationError::FetchFailed(StoreError::Transient(_))));
        assert_eq!(store.write_attempts(), 0);
        assert_eq!(store.latest_history().records(), &[record("old", 1)]);
    }

    #[tokio::test]
    async fn missing_secret_is_fetch_failure() {
        let store = Arc::new(MemoryStore::default());
        let rotator = Rotator::new(settings(), store.clone());

        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(err, RotationError::FetchFailed(StoreError::NotFound(_))));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn attached_checksum_matches_submitted_bytes() {
        let store = Arc::new(MemoryStore::with_blob(&blob(vec![record("a", 1)])));
        let rotator = Rotator::new(settings(), store.clone());
        rotator.rotate().await.unwrap();

        let writes = store.writes.lock().unwrap();
        let (payload, checksum) = &writes[0];
        assert_eq!(crc32c::crc32c(payload), *checksum);
    }

    #[tokio::test]
    async fn stored_history_reads_back_identically() {
        let store = Arc::new(MemoryStore::with_blob(&blob(vec![record("a", 2), record("b", 1)])));
        let rotator = Rotator::new(settings(), store.clone());
        rotator.rotate().await.unwrap();

        let locator = SecretLocator::new("p", "s");
        let first = store.fetch_latest(&locator).await.unwrap();
        let second = store.fetch_latest(&locator).await.unwrap();
        assert_eq!(
            History::parse(&first.data, ParsePolicy::Strict).unwrap(),
            History::parse(&second.data, ParsePolicy::Strict).unwrap()
        );
    }

    #[tokio::test]
    async fn ids_are_unique_across_rotations() {
        let store = Arc::new(MemoryStore::with_blob(b"[]"));
        let rotator = Rotator::new(settings(), store.clone());
        for _ in 0..25 {
            rotator.rotate().await.unwrap();
        }

        let history = store.latest_history();
        let kids: HashSet<&str> = history.records().iter().map(|r| r.kid.as_str()).collect();
        assert_eq!(history.len(), 25);
        assert_eq!(kids.len(), 25);
        let stamps: Vec<i64> = history.records().iter().map(|r| r.created_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] >= w[1]), "newest must come first");
    }

    #[tokio::test]
    async fn strict_policy_refuses_unparsable_history() {
        let store = Arc::new(MemoryStore::with_blob(b"not json"));
        let rotator = Rotator::new(settings(), store.clone());

        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(err, RotationError::ParseFailed(_)));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn empty_policy_replaces_unparsable_history() {
        let store = Arc::new(MemoryStore::with_blob(b"not json"));
        let rotator = Rotator::new(
            RotationSettings {
                parse_policy: ParsePolicy::TreatAsEmpty,
                ..settings()
            },
            store.clone(),
        );

        let outcome = rotator.rotate().await.unwrap();
        assert_eq!(outcome.history_len, 1);
        assert_eq!(store.latest_history().len(), 1);
    }

    #[tokio::test]
    async fn retention_cap_drops_oldest() {
        let store = Arc::new(MemoryStore::with_blob(&blob(vec![
            record("a", 3),
            record("b", 2),
            record("c", 1),
        ])));
        let rotator = Rotator::new(
            RotationSettings {
                max_history: Some(2),
                ..settings()
            },
            store.clone(),
        );

        let outcome = rotator.rotate().await.unwrap();
        let history = store.latest_history();
        let kids: Vec<&str> = history.records().iter().map(|r| r.kid.as_str()).collect();
        assert_eq!(kids, vec![outcome.kid.as_str(), "a"]);
    }

    #[tokio::test]
    async fn submit_failure_is_not_retried() {
        let store = Arc::new(MemoryStore::with_blob(b"[]"));
        *store.submit_error.lock().unwrap() = Some(StoreError::Transient("503".into()));
        let rotator = Rotator::new(settings(), store.clone());

        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(err, RotationError::SubmitFailed(StoreError::Transient(_))));
        assert_eq!(store.write_attempts(), 1);
    }

    #[tokio::test]
    async fn checksum_rejection_surfaces_as_submit_failure() {
        let store = Arc::new(MemoryStore::with_blob(b"[]"));
        *store.submit_error.lock().unwrap() = Some(StoreError::ChecksumRejected);
        let rotator = Rotator::new(settings(), store.clone());

        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(err, RotationError::SubmitFailed(StoreError::ChecksumRejected)));
    }

    #[tokio::test]
    async fn conflict_rereads_and_keeps_racing_credential() {
        let store = Arc::new(MemoryStore::with_blob(&blob(vec![record("base", 1)])));
        store
            .racing_writes
            .lock()
            .unwrap()
            .push(blob(vec![record("racer", 2), record("base", 1)]));
        let rotator = Rotator::new(settings(), store.clone());

        let outcome = rotator.rotate().await.unwrap();

        assert_eq!(outcome.attempts, 2);
        let history = store.latest_history();
        let kids: Vec<&str> = history.records().iter().map(|r| r.kid.as_str()).collect();
        assert_eq!(kids, vec![outcome.kid.as_str(), "racer", "base"]);
    }

    #[tokio::test]
    async fn persistent_conflict_gives_up() {
        let store = Arc::new(MemoryStore::with_blob(b"[]"));
        {
            let mut racing = store.racing_writes.lock().unwrap();
            for _ in 0..5 {
                racing.push(b"[]".to_vec());
            }
        }
        let rotator = Rotator::new(
            RotationSettings {
                conflict_retries: 1,
                ..settings()
            },
            store.clone(),
        );

        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(err, RotationError::Conflict { attempts: 2 }));
        assert_eq!(store.write_attempts(), 2);
    }

    #[tokio::test]
    async fn slow_store_hits_deadline() {
        let store = Arc::new(MemoryStore {
            fetch_delay: Some(Duration::from_secs(5)),
            ..MemoryStore::default()
        });
        let rotator = Rotator::new(
            RotationSettings {
                timeout: Duration::from_millis(50),
                ..settings()
            },
            store.clone(),
        );

        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(err, RotationError::Timeout(_)));
        assert_eq!(store.write_attempts(), 0);
    }
}
