use chrono::Duration;
use serde::Deserialize;

/// Security-core configuration: values only, no behaviour. Every field
/// has the documented default, so embedders can deserialize a partial
/// table (or use [`Config::default`]) and override what they need.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    credential_ttl: u32,
    credential_skew: u32,
    otp_ttl: u32,
    otp_max_attempts: u32,
    session_ttl: u32,
    auth_rate_limit: usize,
    vote_rate_limit: usize,
    general_rate_limit: usize,
    rate_window: u32,
    failure_alert_threshold: u32,
    prune_cutoff: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credential_ttl: 300,
            credential_skew: 30,
            otp_ttl: 300,
            otp_max_attempts: 3,
            session_ttl: 900,
            auth_rate_limit: 10,
            vote_rate_limit: 5,
            general_rate_limit: 60,
            rate_window: 60,
            failure_alert_threshold: 5,
            prune_cutoff: 600,
        }
    }
}

impl Config {
    /// Valid lifetime of a credential token in seconds.
    pub fn credential_ttl(&self) -> Duration {
        Duration::seconds(self.credential_ttl.into())
    }

    /// Tolerated clock skew for tokens stamped in the future.
    pub fn credential_skew(&self) -> Duration {
        Duration::seconds(self.credential_skew.into())
    }

    /// Valid lifetime of a one-time code in seconds.
    pub fn otp_ttl(&self) -> Duration {
        Duration::seconds(self.otp_ttl.into())
    }

    /// Validation attempts allowed before a one-time code is invalidated.
    pub fn otp_max_attempts(&self) -> u32 {
        self.otp_max_attempts
    }

    /// Valid lifetime of a session in seconds.
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl.into())
    }

    /// Admitted requests per window for authentication endpoints.
    pub fn auth_rate_limit(&self) -> usize {
        self.auth_rate_limit
    }

    /// Admitted requests per window for vote-casting endpoints.
    pub fn vote_rate_limit(&self) -> usize {
        self.vote_rate_limit
    }

    /// Admitted requests per window for everything else.
    pub fn general_rate_limit(&self) -> usize {
        self.general_rate_limit
    }

    /// Length of the sliding rate-limit window in seconds.
    pub fn rate_window(&self) -> Duration {
        Duration::seconds(self.rate_window.into())
    }

    /// Failed attempts per client before a security violation is raised.
    pub fn failure_alert_threshold(&self) -> u32 {
        self.failure_alert_threshold
    }

    /// Idle age after which pruning removes in-memory tracking state.
    pub fn prune_cutoff(&self) -> Duration {
        Duration::seconds(self.prune_cutoff.into())
    }
}
