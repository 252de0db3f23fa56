//! Issues and validates bound credential tokens, the first of the two
//! authentication factors.

use std::sync::Arc;

use chrono::Utc;
use log::warn;

use crate::audit::{AuditAction, AuditChain};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{IdentityLookup, IdentityRecord};

pub use self::token::{CredentialToken, HmacSha256, TokenParseError};

mod token;

pub struct CredentialEngine {
    identities: Arc<dyn IdentityLookup>,
    audit: Arc<AuditChain>,
    config: Config,
}

impl CredentialEngine {
    pub fn new(
        identities: Arc<dyn IdentityLookup>,
        audit: Arc<AuditChain>,
        config: Config,
    ) -> Self {
        Self {
            identities,
            audit,
            config,
        }
    }

    /// Issue a fresh credential token bound to the identity's enrolment
    /// secret and the current time.
    pub async fn issue(&self, identity: &str, origin: &str) -> Result<String> {
        let record = match self.lookup(identity).await? {
            Some(record) => record,
            None => {
                self.audit
                    .append(
                        Some(identity),
                        AuditAction::CredentialRejected,
                        "issuance refused: unknown identity",
                        origin,
                    )
                    .await?;
                return Err(Error::UnknownIdentity(identity.to_string()));
            }
        };
        if !record.enabled {
            return self
                .reject(identity, "issuance refused: identity disabled", origin)
                .await;
        }

        let token = CredentialToken::sign(identity, Utc::now(), &record.secret);
        self.audit
            .append(
                Some(identity),
                AuditAction::CredentialIssued,
                "credential token issued",
                origin,
            )
            .await?;
        Ok(token.encode())
    }

    /// Validate a presented token for the claimed identity.
    ///
    /// The validity window is the sole defence against replay: there is
    /// no single-use nonce table, so a captured token revalidates until
    /// the window closes.
    ///
    /// Malformed input and legitimate-but-expired/mismatched tokens both
    /// surface as a rejection to the caller, but are audited with
    /// distinct detail for forensics.
    pub async fn validate(&self, token: &str, identity: &str, origin: &str) -> Result<()> {
        let parsed = match CredentialToken::decode(token) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("malformed credential token presented for {identity}");
                return self
                    .reject(identity, format!("malformed token: {err}"), origin)
                    .await;
            }
        };

        if parsed.identity() != identity {
            return self
                .reject(identity, "token bound to a different identity", origin)
                .await;
        }

        let record = match self.lookup(identity).await? {
            Some(record) if record.enabled => record,
            Some(_) => return self.reject(identity, "identity disabled", origin).await,
            None => return self.reject(identity, "unknown identity", origin).await,
        };

        if !parsed.verify_signature(&record.secret) {
            return self.reject(identity, "signature mismatch", origin).await;
        }

        let now = Utc::now();
        if now - parsed.issued_at() > self.config.credential_ttl() {
            self.audit
                .append(
                    Some(identity),
                    AuditAction::CredentialRejected,
                    "token expired",
                    origin,
                )
                .await?;
            return Err(Error::ExpiredCredential);
        }
        if parsed.issued_at() > now + self.config.credential_skew() {
            return self
                .reject(identity, "token dated beyond clock-skew tolerance", origin)
                .await;
        }

        self.audit
            .append(
                Some(identity),
                AuditAction::CredentialValidated,
                "credential token validated",
                origin,
            )
            .await?;
        Ok(())
    }

    async fn lookup(&self, identity: &str) -> Result<Option<IdentityRecord>> {
        self.identities
            .find_by_identifier(identity)
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))
    }

    async fn reject<T>(&self, identity: &str, detail: impl Into<String>, origin: &str) -> Result<T> {
        self.audit
            .append(
                Some(identity),
                AuditAction::CredentialRejected,
                detail,
                origin,
            )
            .await?;
        Err(Error::InvalidCredential)
    }
}
