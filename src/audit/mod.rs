//! Tamper-evident activity log.
//!
//! Every other component writes here; none read back except the
//! verification path. Entries form a hash chain: each digest depends on
//! the previous one, so recomputing the chain exposes any retroactive
//! edit at the first entry it touches.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::store::{retry_sink, DurableSink};

pub use self::entry::{AuditAction, AuditEntry, ChainDigest};
use self::entry::genesis_digest;

mod entry;

/// Where the chain currently ends.
struct ChainHead {
    next_id: u64,
    digest: ChainDigest,
}

/// Append-only hash-chained audit log over a durable sink.
pub struct AuditChain {
    sink: Arc<dyn DurableSink>,
    head: Mutex<ChainHead>,
}

impl AuditChain {
    /// Start a fresh chain from the genesis digest.
    pub fn new(sink: Arc<dyn DurableSink>) -> Self {
        Self {
            sink,
            head: Mutex::new(ChainHead {
                next_id: 0,
                digest: genesis_digest(),
            }),
        }
    }

    /// Continue the chain from the last durably stored entry, so a
    /// process restart does not fork the chain.
    pub async fn resume(sink: Arc<dyn DurableSink>) -> Result<Self> {
        let head = match sink
            .last_audit_entry()
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?
        {
            Some(last) => ChainHead {
                next_id: last.id + 1,
                digest: last.digest,
            },
            None => ChainHead {
                next_id: 0,
                digest: genesis_digest(),
            },
        };
        Ok(Self {
            sink,
            head: Mutex::new(head),
        })
    }

    /// Append an entry and return its digest.
    ///
    /// This is the one deliberately global critical section in the
    /// core: a chain has no parallelism, since each entry's digest
    /// depends on its predecessor's. The lock is held across the sink
    /// write; audit writes are small and infrequent relative to the
    /// read-heavy paths. The write is retried with backoff, and failure
    /// after retries propagates as a hard error to the caller.
    pub async fn append(
        &self,
        actor: Option<&str>,
        action: AuditAction,
        detail: impl Into<String>,
        origin: &str,
    ) -> Result<ChainDigest> {
        let detail = detail.into();
        let mut head = self.head.lock().await;
        let entry = AuditEntry::new(
            head.next_id,
            actor.map(str::to_string),
            action,
            detail,
            origin.to_string(),
            Utc::now(),
            &head.digest,
        );
        retry_sink("audit entry", || self.sink.append_audit_entry(&entry))
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?;
        head.next_id = entry.id + 1;
        head.digest = entry.digest;
        debug!("audit[{}] {} from {}", entry.id, entry.action, entry.origin);
        Ok(entry.digest)
    }

    /// Walk the stored entries from `from_entry_id` onwards, recomputing
    /// every digest. Verification from a non-zero id anchors on the
    /// stored digest of the entry just before it; verification from zero
    /// anchors on the genesis digest.
    pub async fn verify_chain(&self, from_entry_id: u64) -> Result<ChainVerification> {
        let anchor_id = from_entry_id.saturating_sub(1);
        let entries = self
            .sink
            .audit_entries_from(anchor_id)
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?;

        let mut entries = entries.iter();
        let mut previous = genesis_digest();
        if from_entry_id > 0 {
            match entries.next() {
                Some(anchor) => previous = anchor.digest,
                None => return Ok(ChainVerification::Intact { checked: 0 }),
            }
        }

        let mut checked = 0;
        for entry in entries {
            if entry.expected_digest(&previous) != entry.digest {
                warn!("audit chain broken at entry {}", entry.id);
                return Ok(ChainVerification::Broken { entry_id: entry.id });
            }
            previous = entry.digest;
            checked += 1;
        }
        Ok(ChainVerification::Intact { checked })
    }
}

/// Outcome of a chain walk: either every recomputed digest matched, or
/// the id of the first entry that did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerification {
    Intact { checked: u64 },
    Broken { entry_id: u64 },
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySink;

    async fn chain_with_entries(count: u64) -> (Arc<MemorySink>, AuditChain) {
        let sink = Arc::new(MemorySink::new());
        let chain = AuditChain::new(Arc::clone(&sink) as Arc<dyn DurableSink>);
        for i in 0..count {
            chain
                .append(
                    Some("alice"),
                    AuditAction::CredentialValidated,
                    format!("entry {i}"),
                    "203.0.113.7",
                )
                .await
                .unwrap();
        }
        (sink, chain)
    }

    #[tokio::test]
    async fn appended_entries_verify_intact() {
        let (_, chain) = chain_with_entries(8).await;
        assert_eq!(
            chain.verify_chain(0).await.unwrap(),
            ChainVerification::Intact { checked: 8 }
        );
    }

    #[tokio::test]
    async fn tampered_detail_breaks_the_chain_at_that_entry() {
        let (sink, chain) = chain_with_entries(6).await;
        sink.tamper_audit_detail(3, "rewritten history");
        assert_eq!(
            chain.verify_chain(0).await.unwrap(),
            ChainVerification::Broken { entry_id: 3 }
        );
    }

    #[tokio::test]
    async fn verification_from_an_interior_entry_uses_the_stored_anchor() {
        let (sink, chain) = chain_with_entries(6).await;
        assert!(chain.verify_chain(4).await.unwrap().is_intact());

        // Tampering before the anchor is invisible from there, but
        // visible from the start.
        sink.tamper_audit_detail(1, "rewritten history");
        assert!(chain.verify_chain(4).await.unwrap().is_intact());
        assert_eq!(
            chain.verify_chain(0).await.unwrap(),
            ChainVerification::Broken { entry_id: 1 }
        );
    }

    #[tokio::test]
    async fn resumed_chain_extends_the_stored_one() {
        let (sink, chain) = chain_with_entries(3).await;
        drop(chain);

        let resumed = AuditChain::resume(Arc::clone(&sink) as Arc<dyn DurableSink>)
            .await
            .unwrap();
        resumed
            .append(None, AuditAction::SecurityViolation, "after restart", "-")
            .await
            .unwrap();

        assert_eq!(
            resumed.verify_chain(0).await.unwrap(),
            ChainVerification::Intact { checked: 4 }
        );
        let entries = sink.audit_entries();
        assert_eq!(entries.last().unwrap().id, 3);
    }
}
