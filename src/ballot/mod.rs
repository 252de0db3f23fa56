//! Authenticated encryption and hash verification of ballot payloads.
//!
//! Each election gets its own symmetric key, derived from a master key
//! via HKDF over the election id; a fresh random nonce is generated per
//! seal, never reused under the same key. Decryption fails closed: a
//! bad authentication tag yields an error, never partial data.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::Utc;
use data_encoding::HEXLOWER;
use hkdf::Hkdf;
use log::warn;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::audit::{AuditAction, AuditChain};
use crate::error::{Error, Result};
use crate::store::{retry_sink, DurableSink, SinkError};

pub use self::sealed::{SealedBallot, ALGORITHM, NONCE_LENGTH};

mod sealed;

/// Master ballot key (256-bit). Per-election keys are derived from it;
/// where it is stored is out of scope for this core.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BallotKey([u8; 32]);

impl BallotKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        let mut bytes = [0; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the symmetric key for one election.
    fn election_key(&self, election_id: &str) -> [u8; 32] {
        let hkdf = Hkdf::<Sha256>::new(None, &self.0);
        let mut key = [0; 32];
        hkdf.expand(election_id.as_bytes(), &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        key
    }
}

impl std::fmt::Debug for BallotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BallotKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

pub struct VoteIntegrityEngine {
    key: BallotKey,
    sink: Arc<dyn DurableSink>,
    audit: Arc<AuditChain>,
}

impl VoteIntegrityEngine {
    pub fn new(key: BallotKey, sink: Arc<dyn DurableSink>, audit: Arc<AuditChain>) -> Self {
        Self { key, sink, audit }
    }

    /// Encrypt, integrity-protect, and durably record one ballot.
    ///
    /// The (identity, election) uniqueness invariant is enforced twice:
    /// checked here before any encryption happens, and again atomically
    /// by the sink's uniqueness detection. Encryption failure is
    /// terminal for this cast attempt and is never retried at this
    /// layer. The vote counts as cast only once both the ciphertext and
    /// its audit entry are durably recorded.
    pub async fn seal(
        &self,
        identity: &str,
        election_id: &str,
        plaintext: &[u8],
        origin: &str,
    ) -> Result<SealedBallot> {
        let already_cast = self
            .sink
            .has_ballot(identity, election_id)
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?;
        if already_cast {
            return self.reject_duplicate(identity, election_id, origin).await;
        }

        let ballot = self.encrypt(identity, election_id, plaintext)?;

        match retry_sink("ballot", || self.sink.append_ballot(&ballot)).await {
            Ok(()) => {}
            Err(SinkError::Duplicate) => {
                return self.reject_duplicate(identity, election_id, origin).await;
            }
            Err(err) => {
                self.audit
                    .append(
                        Some(identity),
                        AuditAction::VoteRejected,
                        format!("ballot write failed for election {election_id}"),
                        origin,
                    )
                    .await?;
                return Err(Error::StorageUnavailable(err.to_string()));
            }
        }

        self.audit
            .append(
                Some(identity),
                AuditAction::VoteCast,
                format!(
                    "ballot {} sealed for election {election_id}",
                    ballot.ballot_id
                ),
                origin,
            )
            .await?;
        Ok(ballot)
    }

    /// Decrypt a sealed ballot. Fails closed if the authentication tag
    /// does not verify.
    pub fn open(&self, ballot: &SealedBallot) -> Result<Vec<u8>> {
        let key = self.key.election_key(&ballot.election_id);
        let cipher =
            XChaCha20Poly1305::new_from_slice(&key).expect("key length is always 32");
        let aad = associated_data(&ballot.identity, &ballot.election_id);
        cipher
            .decrypt(
                XNonce::from_slice(&ballot.nonce),
                Payload {
                    msg: &ballot.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                Error::IntegrityViolation(format!(
                    "authentication tag mismatch for ballot {}",
                    ballot.ballot_id
                ))
            })
    }

    /// Tally-time tamper check: decrypt, recompute the plaintext hash,
    /// and compare against the stored one. A flagged ballot is reported
    /// (audited) and excluded by the caller, never silently dropped,
    /// and verification of other ballots continues.
    pub async fn verify(&self, ballot: &SealedBallot, origin: &str) -> Result<bool> {
        let plaintext = match self.open(ballot) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                return self
                    .flag(ballot, "aead authentication failed", origin)
                    .await;
            }
        };
        let recomputed = Sha256::digest(&plaintext);
        let matches: bool = recomputed
            .as_slice()
            .ct_eq(ballot.integrity_hash.as_slice())
            .into();
        if matches {
            Ok(true)
        } else {
            self.flag(ballot, "integrity hash mismatch", origin).await
        }
    }

    fn encrypt(
        &self,
        identity: &str,
        election_id: &str,
        plaintext: &[u8],
    ) -> Result<SealedBallot> {
        let key = self.key.election_key(election_id);
        let cipher =
            XChaCha20Poly1305::new_from_slice(&key).expect("key length is always 32");

        let mut nonce = [0; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut ballot_id = [0; 16];
        rand::thread_rng().fill_bytes(&mut ballot_id);

        let aad = associated_data(identity, election_id);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::IntegrityViolation("ballot encryption failed".to_string()))?;

        Ok(SealedBallot {
            ballot_id: HEXLOWER.encode(&ballot_id),
            identity: identity.to_string(),
            election_id: election_id.to_string(),
            ciphertext,
            nonce,
            integrity_hash: Sha256::digest(plaintext),
            algorithm: ALGORITHM.to_string(),
            cast_at: Utc::now(),
        })
    }

    async fn reject_duplicate(
        &self,
        identity: &str,
        election_id: &str,
        origin: &str,
    ) -> Result<SealedBallot> {
        warn!("duplicate ballot rejected for election {election_id}");
        self.audit
            .append(
                Some(identity),
                AuditAction::VoteRejected,
                format!("duplicate ballot for election {election_id}"),
                origin,
            )
            .await?;
        Err(Error::DuplicateVote)
    }

    async fn flag(&self, ballot: &SealedBallot, detail: &str, origin: &str) -> Result<bool> {
        warn!("ballot {} flagged: {detail}", ballot.ballot_id);
        self.audit
            .append(
                Some(&ballot.identity),
                AuditAction::BallotFlagged,
                format!("ballot {}: {detail}", ballot.ballot_id),
                origin,
            )
            .await?;
        Ok(false)
    }
}

/// Associated data binding a ciphertext to its voter and election, so a
/// sealed ballot cannot be replayed under another pair.
fn associated_data(identity: &str, election_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(identity.len() + election_id.len() + 1);
    aad.extend_from_slice(identity.as_bytes());
    aad.push(0);
    aad.extend_from_slice(election_id.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySink;

    const ORIGIN: &str = "203.0.113.7";

    fn engine() -> (Arc<MemorySink>, VoteIntegrityEngine) {
        let sink = Arc::new(MemorySink::new());
        let audit = Arc::new(AuditChain::new(Arc::clone(&sink) as Arc<dyn DurableSink>));
        let engine = VoteIntegrityEngine::new(
            BallotKey::generate(),
            Arc::clone(&sink) as Arc<dyn DurableSink>,
            audit,
        );
        (sink, engine)
    }

    #[tokio::test]
    async fn seal_open_round_trip() {
        let (_, engine) = engine();
        let ballot = engine
            .seal("alice", "E1", b"candidate X", ORIGIN)
            .await
            .unwrap();

        assert_eq!(ballot.algorithm, ALGORITHM);
        assert_eq!(engine.open(&ballot).unwrap(), b"candidate X");
        assert!(engine.verify(&ballot, ORIGIN).await.unwrap());
    }

    #[tokio::test]
    async fn flipping_any_ciphertext_bit_fails_closed() {
        let (_, engine) = engine();
        let mut ballot = engine
            .seal("alice", "E1", b"candidate X", ORIGIN)
            .await
            .unwrap();
        ballot.ciphertext[0] ^= 0x01;

        assert!(matches!(
            engine.open(&ballot),
            Err(Error::IntegrityViolation(_))
        ));
        assert!(!engine.verify(&ballot, ORIGIN).await.unwrap());
    }

    #[tokio::test]
    async fn second_cast_is_a_duplicate_and_leaves_the_first_intact() {
        let (sink, engine) = engine();
        let first = engine
            .seal("alice", "E1", b"candidate X", ORIGIN)
            .await
            .unwrap();
        assert!(matches!(
            engine.seal("alice", "E1", b"candidate Y", ORIGIN).await,
            Err(Error::DuplicateVote)
        ));

        let stored = sink.ballots();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ballot_id, first.ballot_id);
        assert_eq!(engine.open(&stored[0]).unwrap(), b"candidate X");
    }

    #[tokio::test]
    async fn same_voter_may_cast_in_different_elections() {
        let (_, engine) = engine();
        engine
            .seal("alice", "E1", b"candidate X", ORIGIN)
            .await
            .unwrap();
        engine
            .seal("alice", "E2", b"candidate Y", ORIGIN)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ballots_do_not_open_under_another_election_key() {
        let (_, engine) = engine();
        let mut ballot = engine
            .seal("alice", "E1", b"candidate X", ORIGIN)
            .await
            .unwrap();
        // Re-address the ciphertext to another election: both the
        // derived key and the associated data now disagree.
        ballot.election_id = "E2".to_string();
        assert!(engine.open(&ballot).is_err());
    }

    #[tokio::test]
    async fn tampered_stored_hash_is_flagged_not_erred() {
        let (sink, engine) = engine();
        let mut ballot = engine
            .seal("alice", "E1", b"candidate X", ORIGIN)
            .await
            .unwrap();
        ballot.integrity_hash = Sha256::digest(b"candidate Y");

        assert!(!engine.verify(&ballot, ORIGIN).await.unwrap());
        let flagged: Vec<_> = sink
            .audit_entries()
            .into_iter()
            .filter(|entry| entry.action == AuditAction::BallotFlagged)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].detail.contains("integrity hash mismatch"));
    }
}
