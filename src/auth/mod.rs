//! Orchestrates the two-factor sequence and session issuance.
//!
//! The external collaborator performs the password check and hands this
//! component only the resulting identity; from there the flow is
//! credential token, then one-time code, then a minted session. Every
//! failure transitions the flow back to `Unauthenticated` with a
//! distinct audited reason, never a generic error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::audit::{AuditAction, AuditChain};
use crate::config::Config;
use crate::credential::CredentialEngine;
use crate::error::{Error, Result};
use crate::otp::{Code, OtpEngine};
use crate::store::IdentityLookup;

pub use self::session::Session;

use self::session::SessionStore;

mod session;

/// Where an authentication attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    FirstFactorVerified,
    SecondFactorPending,
    FullyAuthenticated,
}

/// One in-progress authentication attempt. Dropping a flow abandons the
/// attempt; there is no server-side state to clean up until a session
/// is minted.
#[derive(Debug)]
pub struct AuthFlow {
    identity: String,
    origin: String,
    state: AuthState,
}

impl AuthFlow {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn state(&self) -> AuthState {
        self.state
    }
}

pub struct Authenticator {
    identities: Arc<dyn IdentityLookup>,
    credentials: CredentialEngine,
    codes: OtpEngine,
    sessions: SessionStore,
    audit: Arc<AuditChain>,
    config: Config,
}

impl Authenticator {
    pub fn new(
        identities: Arc<dyn IdentityLookup>,
        credentials: CredentialEngine,
        codes: OtpEngine,
        audit: Arc<AuditChain>,
        config: Config,
    ) -> Self {
        Self {
            identities,
            credentials,
            codes,
            sessions: SessionStore::new(),
            audit,
            config,
        }
    }

    /// The credential engine, for issuing tokens at login start.
    pub fn credentials(&self) -> &CredentialEngine {
        &self.credentials
    }

    /// The one-time-code engine, for generating codes to deliver.
    pub fn codes(&self) -> &OtpEngine {
        &self.codes
    }

    /// Begin a flow for an identity whose password check has already
    /// succeeded at the collaborator.
    pub async fn first_factor(&self, identity: &str, origin: &str) -> Result<AuthFlow> {
        let record = self
            .identities
            .find_by_identifier(identity)
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?;
        match record {
            Some(record) if record.enabled => {
                info!("first factor verified for {identity}");
                Ok(AuthFlow {
                    identity: identity.to_string(),
                    origin: origin.to_string(),
                    state: AuthState::FirstFactorVerified,
                })
            }
            Some(_) => {
                self.audit
                    .append(
                        Some(identity),
                        AuditAction::AuthenticationFailed,
                        "identity disabled",
                        origin,
                    )
                    .await?;
                Err(Error::UnknownIdentity(identity.to_string()))
            }
            None => {
                self.audit
                    .append(
                        Some(identity),
                        AuditAction::AuthenticationFailed,
                        "unknown identity",
                        origin,
                    )
                    .await?;
                Err(Error::UnknownIdentity(identity.to_string()))
            }
        }
    }

    /// Present the credential token for the flow's identity.
    pub async fn verify_credential(&self, flow: &mut AuthFlow, token: &str) -> Result<()> {
        if flow.state != AuthState::FirstFactorVerified {
            return self
                .fail(flow, "credential presented out of sequence", Error::InvalidCredential)
                .await;
        }
        match self
            .credentials
            .validate(token, &flow.identity, &flow.origin)
            .await
        {
            Ok(()) => {
                flow.state = AuthState::SecondFactorPending;
                Ok(())
            }
            Err(err @ Error::ExpiredCredential) => {
                self.fail(flow, "expired-credential", err).await
            }
            Err(err @ Error::StorageUnavailable(_)) => {
                flow.state = AuthState::Unauthenticated;
                Err(err)
            }
            Err(err) => self.fail(flow, "invalid-credential", err).await,
        }
    }

    /// Present the one-time code. On success a session is minted and
    /// any prior session for the identity is invalidated.
    pub async fn verify_code(&self, flow: &mut AuthFlow, code: &Code) -> Result<Session> {
        if flow.state != AuthState::SecondFactorPending {
            return self
                .fail(flow, "code presented out of sequence", Error::InvalidCode)
                .await;
        }
        match self.codes.validate(&flow.identity, code, &flow.origin).await {
            Ok(()) => {}
            Err(err @ Error::CodeAttemptsExceeded) => {
                return self.fail(flow, "code-attempts-exceeded", err).await;
            }
            Err(err @ Error::StorageUnavailable(_)) => {
                flow.state = AuthState::Unauthenticated;
                return Err(err);
            }
            Err(err) => return self.fail(flow, "invalid-code", err).await,
        }

        // The identity could have been disabled mid-flow; re-read it for
        // the role rather than trusting anything client-side.
        let record = self
            .identities
            .find_by_identifier(&flow.identity)
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?;
        let record = match record {
            Some(record) if record.enabled => record,
            _ => {
                let identity = flow.identity.clone();
                return self
                    .fail(
                        flow,
                        "identity vanished or disabled mid-flow",
                        Error::UnknownIdentity(identity),
                    )
                    .await;
            }
        };

        let session = Session::mint(
            &flow.identity,
            record.role,
            &flow.origin,
            self.config.session_ttl(),
        );
        if let Some(prior) = self.sessions.insert(session.clone()) {
            self.audit
                .append(
                    Some(&flow.identity),
                    AuditAction::SessionRevoked,
                    format!("session {} superseded by a new login", prior.id()),
                    &flow.origin,
                )
                .await?;
        }
        flow.state = AuthState::FullyAuthenticated;
        self.audit
            .append(
                Some(&flow.identity),
                AuditAction::AuthenticationSucceeded,
                "two-factor authentication complete",
                &flow.origin,
            )
            .await?;
        Ok(session)
    }

    /// Read a session by id. Expiry is enforced here by timestamp
    /// comparison; there is no background timer.
    pub fn session(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        self.sessions.get(session_id, now)
    }

    /// Explicit logout. Returns whether a session was actually revoked.
    pub async fn logout(&self, session_id: &str, origin: &str) -> Result<bool> {
        match self.sessions.remove(session_id) {
            Some(session) => {
                self.audit
                    .append(
                        Some(session.identity()),
                        AuditAction::SessionRevoked,
                        "logout",
                        origin,
                    )
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sweep expired sessions and one-time-code records. Invoked by an
    /// external scheduler.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.sessions.prune(now);
        self.codes.prune(now);
    }

    /// Reset the flow and audit the distinct failure reason.
    async fn fail<T>(&self, flow: &mut AuthFlow, reason: &str, err: Error) -> Result<T> {
        flow.state = AuthState::Unauthenticated;
        warn!("authentication failed for {}: {reason}", flow.identity);
        self.audit
            .append(
                Some(&flow.identity),
                AuditAction::AuthenticationFailed,
                reason,
                &flow.origin,
            )
            .await?;
        Err(err)
    }
}
