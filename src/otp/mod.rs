//! Short-lived numeric codes, the second of the two authentication
//! factors. One active record per identity; a record is superseded on
//! regeneration and deleted on successful validation or expiry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;

use crate::audit::{AuditAction, AuditChain};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::KeyedStore;

pub use self::code::{Code, ParseError, CODE_LENGTH};

mod code;

struct OtpRecord {
    code: Code,
    expires_at: DateTime<Utc>,
    attempts: u32,
}

/// How a validation attempt resolved, before auditing.
enum Outcome {
    Valid,
    NoRecord,
    Expired,
    AttemptsExceeded,
    Mismatch,
}

pub struct OtpEngine {
    records: KeyedStore<String, Option<OtpRecord>>,
    audit: Arc<AuditChain>,
    config: Config,
}

impl OtpEngine {
    pub fn new(audit: Arc<AuditChain>, config: Config) -> Self {
        Self {
            records: KeyedStore::new(),
            audit,
            config,
        }
    }

    /// Generate a fresh code for the identity, superseding any prior
    /// record and resetting the attempt count. Generation flooding is
    /// prevented by the rate limiter at the caller level, not here.
    pub async fn generate(&self, identity: &str, origin: &str) -> Result<Code> {
        let code = Code::random();
        let record = OtpRecord {
            code,
            expires_at: Utc::now() + self.config.otp_ttl(),
            attempts: 0,
        };
        self.records
            .with_entry(&identity.to_string(), || None, |slot| *slot = Some(record));
        // The code itself is never audited or logged.
        self.audit
            .append(
                Some(identity),
                AuditAction::CodeGenerated,
                "one-time code generated",
                origin,
            )
            .await?;
        Ok(code)
    }

    /// Validate a presented code. The attempt count is incremented
    /// before anything else, so probing costs an attempt whether or not
    /// the record turns out to be usable. A successful validation
    /// consumes the record; exceeding the attempt threshold invalidates
    /// it outright, forcing regeneration rather than a temporary block.
    pub async fn validate(&self, identity: &str, code: &Code, origin: &str) -> Result<()> {
        let max_attempts = self.config.otp_max_attempts();
        let now = Utc::now();
        let outcome = self
            .records
            .with_existing(&identity.to_string(), |slot| match slot {
                None => Outcome::NoRecord,
                Some(record) => {
                    record.attempts += 1;
                    if record.attempts > max_attempts {
                        Outcome::AttemptsExceeded
                    } else if now > record.expires_at {
                        *slot = None;
                        Outcome::Expired
                    } else if record.code.constant_time_eq(code) {
                        *slot = None;
                        Outcome::Valid
                    } else {
                        Outcome::Mismatch
                    }
                }
            })
            .unwrap_or(Outcome::NoRecord);

        let (action, detail, result) = match outcome {
            Outcome::Valid => (
                AuditAction::CodeValidated,
                "one-time code validated",
                Ok(()),
            ),
            Outcome::NoRecord => (
                AuditAction::CodeRejected,
                "no active code",
                Err(Error::InvalidCode),
            ),
            Outcome::Expired => (
                AuditAction::CodeRejected,
                "code expired",
                Err(Error::InvalidCode),
            ),
            Outcome::AttemptsExceeded => (
                AuditAction::CodeRejected,
                "attempt limit reached",
                Err(Error::CodeAttemptsExceeded),
            ),
            Outcome::Mismatch => (
                AuditAction::CodeRejected,
                "code mismatch",
                Err(Error::InvalidCode),
            ),
        };
        if result.is_err() {
            warn!("one-time code rejected for {identity}: {detail}");
        }
        self.audit.append(Some(identity), action, detail, origin).await?;
        result
    }

    /// Drop the identity's active record, if any.
    pub fn invalidate(&self, identity: &str) {
        self.records
            .with_existing(&identity.to_string(), |slot| *slot = None);
    }

    /// Remove expired records that were never validated, bounding
    /// memory. Invoked by an external scheduler.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.records.retain(|_, slot| match slot {
            Some(record) => now <= record.expires_at,
            None => false,
        });
    }
}
