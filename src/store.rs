//! Collaborator boundaries and shared in-memory state plumbing.
//!
//! The core never talks to a database or an identity provider directly;
//! it goes through [`DurableSink`] and [`IdentityLookup`]. In-memory
//! implementations are provided for tests and lightweight embedders.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditEntry;
use crate::ballot::SealedBallot;

/// Failures at the durable-storage boundary. `Duplicate` is the
/// uniqueness violation the sink must detect atomically; everything
/// else is transient unavailability and eligible for retry.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("record already exists")]
    Duplicate,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// What a voter or administrator is allowed to do with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Voter,
    Admin,
}

/// An identity as owned by the external identity collaborator. The
/// secret is bound at enrolment and never transmitted in cleartext;
/// this core only reads it to recompute credential signatures.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub secret: Vec<u8>,
    pub role: Role,
    pub enabled: bool,
}

/// External identity lookup collaborator.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<IdentityRecord>, SinkError>;
}

/// External durable append-only store for audit entries and ballots.
///
/// Both append operations must be atomic per call; `append_ballot` must
/// detect a duplicate (identity, election) pair as [`SinkError::Duplicate`].
/// The read-backs exist for chain verification and resumption only.
#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<(), SinkError>;
    async fn append_ballot(&self, ballot: &SealedBallot) -> Result<(), SinkError>;
    async fn has_ballot(&self, identity: &str, election_id: &str) -> Result<bool, SinkError>;
    async fn audit_entries_from(&self, first_id: u64) -> Result<Vec<AuditEntry>, SinkError>;
    async fn last_audit_entry(&self) -> Result<Option<AuditEntry>, SinkError>;
}

/// How many times a failed sink write is retried before the in-flight
/// operation fails closed.
const SINK_RETRIES: u32 = 3;

/// Retry a sink write with exponential backoff. A write failure is
/// never silently dropped: after the final attempt the error propagates
/// to the caller as a hard failure. `Duplicate` is not transient and is
/// returned immediately.
pub(crate) async fn retry_sink<T, F, Fut>(what: &str, mut op: F) -> Result<T, SinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SinkError>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(SinkError::Duplicate) => return Err(SinkError::Duplicate),
            Err(err) => {
                attempt += 1;
                if attempt > SINK_RETRIES {
                    error!("{what} write failed after {attempt} attempts: {err}");
                    return Err(err);
                }
                warn!("{what} write failed (attempt {attempt}): {err}, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

/// A concurrent map with per-key locking: mutation of one key's record
/// is serialized while different keys proceed in parallel, bounding
/// contention to collisions on the same user or address. Instances are
/// injected into the engines that need them, so tests get isolated
/// state rather than process-wide singletons.
pub(crate) struct KeyedStore<K, V> {
    entries: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &K, default: impl FnOnce() -> V) -> Arc<Mutex<V>> {
        // Fast path: the key already exists and a read lock suffices.
        if let Some(entry) = self.read_lock().get(key) {
            return Arc::clone(entry);
        }
        self.write_lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(default())))
            .clone()
    }

    /// Run `f` against the key's record, creating it from `default`
    /// first if absent. The record's lock is held only for the closure.
    pub fn with_entry<R>(
        &self,
        key: &K,
        default: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let entry = self.entry(key, default);
        let mut guard = entry.lock().expect("keyed store entry lock poisoned");
        f(&mut guard)
    }

    /// Run `f` against the key's record if it exists.
    pub fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let entry = Arc::clone(self.read_lock().get(key)?);
        let mut guard = entry.lock().expect("keyed store entry lock poisoned");
        Some(f(&mut guard))
    }

    /// Drop every record for which `keep` returns false. This is the
    /// explicit pruning path; nothing expires in the background.
    pub fn retain(&self, mut keep: impl FnMut(&K, &mut V) -> bool) {
        self.write_lock().retain(|key, entry| {
            let mut guard = entry.lock().expect("keyed store entry lock poisoned");
            keep(key, &mut guard)
        });
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, Arc<Mutex<V>>>> {
        self.entries.read().expect("keyed store map lock poisoned")
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<K, Arc<Mutex<V>>>> {
        self.entries.write().expect("keyed store map lock poisoned")
    }
}

/// In-memory identity collaborator.
#[derive(Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<String, IdentityRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrol an identity with a bound secret.
    pub fn enrol(&self, identifier: impl Into<String>, record: IdentityRecord) {
        self.identities
            .write()
            .expect("identity map lock poisoned")
            .insert(identifier.into(), record);
    }
}

#[async_trait]
impl IdentityLookup for MemoryIdentityStore {
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<IdentityRecord>, SinkError> {
        Ok(self
            .identities
            .read()
            .expect("identity map lock poisoned")
            .get(identifier)
            .cloned())
    }
}

/// In-memory durable sink. Appends are atomic under a single lock and
/// duplicate ballots are detected exactly like a unique index would.
#[derive(Default)]
pub struct MemorySink {
    audit: Mutex<Vec<AuditEntry>>,
    ballots: Mutex<Vec<SealedBallot>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored ballot, for tallying and inspection.
    pub fn ballots(&self) -> Vec<SealedBallot> {
        self.ballots.lock().expect("ballot log lock poisoned").clone()
    }

    /// Snapshot of the audit log.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().expect("audit log lock poisoned").clone()
    }

    /// Overwrite a stored entry's detail text in place, bypassing the
    /// chain. Exists so tests can demonstrate tamper detection.
    #[cfg(test)]
    pub(crate) fn tamper_audit_detail(&self, entry_id: u64, detail: &str) {
        let mut audit = self.audit.lock().expect("audit log lock poisoned");
        if let Some(entry) = audit.iter_mut().find(|entry| entry.id == entry_id) {
            entry.detail = detail.to_string();
        }
    }
}

#[async_trait]
impl DurableSink for MemorySink {
    async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<(), SinkError> {
        self.audit
            .lock()
            .expect("audit log lock poisoned")
            .push(entry.clone());
        Ok(())
    }

    async fn append_ballot(&self, ballot: &SealedBallot) -> Result<(), SinkError> {
        let mut ballots = self.ballots.lock().expect("ballot log lock poisoned");
        let duplicate = ballots
            .iter()
            .any(|b| b.identity == ballot.identity && b.election_id == ballot.election_id);
        if duplicate {
            return Err(SinkError::Duplicate);
        }
        ballots.push(ballot.clone());
        Ok(())
    }

    async fn has_ballot(&self, identity: &str, election_id: &str) -> Result<bool, SinkError> {
        Ok(self
            .ballots
            .lock()
            .expect("ballot log lock poisoned")
            .iter()
            .any(|b| b.identity == identity && b.election_id == election_id))
    }

    async fn audit_entries_from(&self, first_id: u64) -> Result<Vec<AuditEntry>, SinkError> {
        Ok(self
            .audit
            .lock()
            .expect("audit log lock poisoned")
            .iter()
            .filter(|entry| entry.id >= first_id)
            .cloned()
            .collect())
    }

    async fn last_audit_entry(&self) -> Result<Option<AuditEntry>, SinkError> {
        Ok(self
            .audit
            .lock()
            .expect("audit log lock poisoned")
            .last()
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let failures = AtomicU32::new(2);
        let result = retry_sink("test", || async {
            if failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(SinkError::Unavailable("flaky".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_sink("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Unavailable("down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(SinkError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1 + SINK_RETRIES);
    }

    #[tokio::test]
    async fn retry_does_not_retry_duplicates() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_sink("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Duplicate)
        })
        .await;
        assert!(matches!(result, Err(SinkError::Duplicate)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keyed_store_isolates_keys() {
        let store: KeyedStore<&str, u32> = KeyedStore::new();
        store.with_entry(&"a", || 0, |v| *v += 1);
        store.with_entry(&"b", || 10, |v| *v += 1);
        assert_eq!(store.with_existing(&"a", |v| *v), Some(1));
        assert_eq!(store.with_existing(&"b", |v| *v), Some(11));
        assert_eq!(store.with_existing(&"c", |v| *v), None);

        store.retain(|key, _| *key == "a");
        assert_eq!(store.with_existing(&"b", |v| *v), None);
        assert_eq!(store.with_existing(&"a", |v| *v), Some(1));
    }
}
