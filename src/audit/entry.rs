use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::digest::Output;
use sha2::{Digest, Sha256};

/// The running integrity digest stored alongside each entry.
pub type ChainDigest = Output<Sha256>;

/// Digest every chain starts from.
pub(crate) fn genesis_digest() -> ChainDigest {
    Sha256::digest(b"ballotguard audit chain genesis")
}

/// What an audit entry records. Tags are deliberately fine-grained:
/// anomaly detection downstream distinguishes attack patterns by tag,
/// never by parsing detail text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    CredentialIssued,
    CredentialValidated,
    CredentialRejected,
    CodeGenerated,
    CodeValidated,
    CodeRejected,
    AuthenticationSucceeded,
    AuthenticationFailed,
    SessionRevoked,
    VoteCast,
    VoteRejected,
    BallotFlagged,
    RateLimitExceeded,
    SecurityViolation,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialIssued => "credential-issued",
            Self::CredentialValidated => "credential-validated",
            Self::CredentialRejected => "credential-rejected",
            Self::CodeGenerated => "code-generated",
            Self::CodeValidated => "code-validated",
            Self::CodeRejected => "code-rejected",
            Self::AuthenticationSucceeded => "authentication-succeeded",
            Self::AuthenticationFailed => "authentication-failed",
            Self::SessionRevoked => "session-revoked",
            Self::VoteCast => "vote-cast",
            Self::VoteRejected => "vote-rejected",
            Self::BallotFlagged => "ballot-flagged",
            Self::RateLimitExceeded => "rate-limit-exceeded",
            Self::SecurityViolation => "security-violation",
        }
    }
}

impl Display for AuditAction {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One tamper-evident log entry. The digest is a function of the
/// entry's own fields plus the previous entry's digest, so a retroactive
/// edit anywhere breaks every digest after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    /// `None` for anonymous or system-originated events.
    pub actor: Option<String>,
    pub action: AuditAction,
    pub detail: String,
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub digest: ChainDigest,
}

/// The digested fields, in fixed order. Serialized with `serde_json`
/// so the byte layout is stable across processes.
#[derive(Serialize)]
struct EntryBody<'a> {
    id: u64,
    actor: Option<&'a str>,
    action: AuditAction,
    detail: &'a str,
    origin: &'a str,
    timestamp_millis: i64,
}

impl AuditEntry {
    pub(crate) fn new(
        id: u64,
        actor: Option<String>,
        action: AuditAction,
        detail: String,
        origin: String,
        timestamp: DateTime<Utc>,
        previous: &ChainDigest,
    ) -> Self {
        let mut entry = Self {
            id,
            actor,
            action,
            detail,
            origin,
            timestamp,
            digest: ChainDigest::default(),
        };
        entry.digest = entry.expected_digest(previous);
        entry
    }

    /// The digest this entry must carry given its predecessor's digest.
    /// Recomputing from the genesis digest must reproduce every stored
    /// digest; a mismatch anywhere signals tampering.
    pub fn expected_digest(&self, previous: &ChainDigest) -> ChainDigest {
        let body = EntryBody {
            id: self.id,
            actor: self.actor.as_deref(),
            action: self.action,
            detail: &self.detail,
            origin: &self.origin,
            timestamp_millis: self.timestamp.timestamp_millis(),
        };
        let encoded =
            serde_json::to_vec(&body).unwrap(); // Valid because `EntryBody` serialization never fails
        Sha256::new()
            .chain_update(previous)
            .chain_update(&encoded)
            .finalize()
    }
}
