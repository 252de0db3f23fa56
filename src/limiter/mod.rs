//! Sliding-window request throttling per client address and endpoint
//! class. Rejection is itself an audit event.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;

use crate::audit::{AuditAction, AuditChain};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::KeyedStore;

pub use self::detector::{RequestProfile, SecurityEventDetector, ThreatSignature};

mod detector;

/// Endpoint classes with independent limits: authentication endpoints
/// are probed hardest, vote casting is rarest, everything else is bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Auth,
    Vote,
    General,
}

impl Display for EndpointClass {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            Self::Auth => "auth",
            Self::Vote => "vote",
            Self::General => "general",
        })
    }
}

pub struct RateLimiter {
    windows: KeyedStore<(String, EndpointClass), VecDeque<DateTime<Utc>>>,
    audit: Arc<AuditChain>,
    config: Config,
}

impl RateLimiter {
    pub fn new(audit: Arc<AuditChain>, config: Config) -> Self {
        Self {
            windows: KeyedStore::new(),
            audit,
            config,
        }
    }

    /// Admit or reject a request from `address`. The window holds the
    /// timestamps of admitted requests in the trailing interval; a
    /// request is rejected when the window is already at the class
    /// limit. Rejected requests are not recorded in the window.
    pub async fn check(
        &self,
        address: &str,
        class: EndpointClass,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let limit = match class {
            EndpointClass::Auth => self.config.auth_rate_limit(),
            EndpointClass::Vote => self.config.vote_rate_limit(),
            EndpointClass::General => self.config.general_rate_limit(),
        };
        let horizon = now - self.config.rate_window();

        let key = (address.to_string(), class);
        let admitted = self.windows.with_entry(&key, VecDeque::new, |timestamps| {
            while timestamps.front().is_some_and(|&t| t <= horizon) {
                timestamps.pop_front();
            }
            if timestamps.len() >= limit {
                false
            } else {
                timestamps.push_back(now);
                true
            }
        });

        if admitted {
            Ok(())
        } else {
            warn!("rate limit hit: {class} requests from {address}");
            self.audit
                .append(
                    None,
                    AuditAction::RateLimitExceeded,
                    format!("{class} request limit reached"),
                    address,
                )
                .await?;
            Err(Error::RateLimited)
        }
    }

    /// Drop windows whose most recent activity is older than the
    /// cutoff. Invoked by an external scheduler.
    pub fn prune(&self, now: DateTime<Utc>) {
        let horizon = now - self.config.prune_cutoff();
        self.windows
            .retain(|_, timestamps| timestamps.back().is_some_and(|&t| t > horizon));
    }
}
