//! Security core for a two-factor authenticated voting service.
//!
//! The crate authenticates voters through a bound credential token plus
//! a time-limited one-time code, encrypts and integrity-protects each
//! cast vote, maintains a tamper-evident hash-chained activity log, and
//! throttles and flags abusive request patterns. Persistence, HTTP
//! routing, election lifecycle management, and the password-based first
//! factor live outside this crate, behind the collaborator traits in
//! [`store`].

pub mod audit;
pub mod auth;
pub mod ballot;
pub mod config;
pub mod credential;
pub mod error;
pub mod limiter;
pub mod otp;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use crate::audit::AuditChain;
    use crate::auth::Authenticator;
    use crate::ballot::{BallotKey, VoteIntegrityEngine};
    use crate::credential::CredentialEngine;
    use crate::limiter::{EndpointClass, RateLimiter};
    use crate::otp::OtpEngine;
    use crate::store::{
        DurableSink, IdentityLookup, IdentityRecord, MemoryIdentityStore, MemorySink, Role,
    };
    use crate::{Config, Error};

    const ALICE_ADDR: &str = "203.0.113.7";

    struct Core {
        sink: Arc<MemorySink>,
        audit: Arc<AuditChain>,
        authenticator: Authenticator,
        votes: VoteIntegrityEngine,
        limiter: RateLimiter,
    }

    fn build_core() -> Core {
        log4rs_test_utils::test_logging::init_logging_once_for(["ballotguard"], None, None);

        let config = Config::default();
        let sink = Arc::new(MemorySink::new());
        let audit = Arc::new(AuditChain::new(Arc::clone(&sink) as Arc<dyn DurableSink>));

        let identities = Arc::new(MemoryIdentityStore::new());
        identities.enrol(
            "alice",
            IdentityRecord {
                secret: b"alice enrolment secret".to_vec(),
                role: Role::Voter,
                enabled: true,
            },
        );

        let credentials = CredentialEngine::new(
            Arc::clone(&identities) as Arc<dyn IdentityLookup>,
            Arc::clone(&audit),
            config.clone(),
        );
        let codes = OtpEngine::new(Arc::clone(&audit), config.clone());
        let authenticator = Authenticator::new(
            Arc::clone(&identities) as Arc<dyn IdentityLookup>,
            credentials,
            codes,
            Arc::clone(&audit),
            config.clone(),
        );
        let votes = VoteIntegrityEngine::new(
            BallotKey::generate(),
            Arc::clone(&sink) as Arc<dyn DurableSink>,
            Arc::clone(&audit),
        );
        let limiter = RateLimiter::new(Arc::clone(&audit), config);

        Core {
            sink,
            audit,
            authenticator,
            votes,
            limiter,
        }
    }

    #[tokio::test]
    async fn alice_authenticates_votes_once_and_everything_is_audited() {
        let core = build_core();
        let auth = &core.authenticator;

        // Every inbound request passes the limiter first.
        core.limiter
            .check(ALICE_ADDR, EndpointClass::Auth, Utc::now())
            .await
            .unwrap();

        // Two-factor sequence: credential token, then one-time code.
        let mut flow = auth.first_factor("alice", ALICE_ADDR).await.unwrap();
        let token = auth.credentials().issue("alice", ALICE_ADDR).await.unwrap();
        auth.verify_credential(&mut flow, &token).await.unwrap();
        let code = auth.codes().generate("alice", ALICE_ADDR).await.unwrap();
        let session = auth.verify_code(&mut flow, &code).await.unwrap();

        assert_eq!(session.identity(), "alice");
        assert_eq!(
            session.expires_at() - session.created_at(),
            Duration::minutes(15)
        );
        assert!(auth.session(session.id(), Utc::now()).is_some());

        // Cast one ballot for candidate X in election E1.
        core.limiter
            .check(ALICE_ADDR, EndpointClass::Vote, Utc::now())
            .await
            .unwrap();
        let ballot = core
            .votes
            .seal("alice", "E1", b"candidate X", ALICE_ADDR)
            .await
            .unwrap();
        assert!(core.votes.verify(&ballot, ALICE_ADDR).await.unwrap());

        // A second ballot in the same election is a duplicate; the
        // first is unaltered.
        assert!(matches!(
            core.votes.seal("alice", "E1", b"candidate Y", ALICE_ADDR).await,
            Err(Error::DuplicateVote)
        ));
        let stored = core.sink.ballots();
        assert_eq!(stored.len(), 1);
        assert_eq!(core.votes.open(&stored[0]).unwrap(), b"candidate X");
        // The plaintext vote never reaches the audit log.
        assert!(core
            .sink
            .audit_entries()
            .iter()
            .all(|entry| !entry.detail.contains("candidate")));

        // Every step above audited something, and the chain holds.
        assert!(core.sink.audit_entries().len() >= 7);
        assert!(core.audit.verify_chain(0).await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn rejected_factors_force_the_sequence_to_restart() {
        let core = build_core();
        let auth = &core.authenticator;

        let mut flow = auth.first_factor("alice", ALICE_ADDR).await.unwrap();
        assert!(matches!(
            auth.verify_credential(&mut flow, "not-a-token").await,
            Err(Error::InvalidCredential)
        ));

        // Restarting the factor sequence recovers.
        let mut flow = auth.first_factor("alice", ALICE_ADDR).await.unwrap();
        let token = auth.credentials().issue("alice", ALICE_ADDR).await.unwrap();
        auth.verify_credential(&mut flow, &token).await.unwrap();
        let code = auth.codes().generate("alice", ALICE_ADDR).await.unwrap();
        auth.verify_code(&mut flow, &code).await.unwrap();

        assert!(core.audit.verify_chain(0).await.unwrap().is_intact());
    }
}
