use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;

use crate::audit::{AuditAction, AuditChain};
use crate::config::Config;
use crate::error::Result;
use crate::store::KeyedStore;

/// Fixed request signatures. Matching is lowercase substring search;
/// the attack strings below are what scanners actually send, not an
/// attempt at a full grammar.
const SCRIPT_INJECTION_PATTERNS: &[&str] = &["<script", "javascript:", "onerror=", "onload="];
const PATH_TRAVERSAL_PATTERNS: &[&str] = &["../", "..\\", "%2e%2e"];
const SCANNER_USER_AGENTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "dirbuster",
    "gobuster",
    "wpscan",
];

/// Which signature family a request matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatSignature {
    ScriptInjection,
    PathTraversal,
    ScannerUserAgent,
}

impl Display for ThreatSignature {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            Self::ScriptInjection => "script-injection",
            Self::PathTraversal => "path-traversal",
            Self::ScannerUserAgent => "scanner-user-agent",
        })
    }
}

/// The parts of an inbound request this core inspects. The HTTP layer
/// (out of scope) maps its request type into this view.
#[derive(Debug, Clone, Copy)]
pub struct RequestProfile<'a> {
    pub origin: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub user_agent: &'a str,
}

struct FailureCounter {
    count: u32,
    last_failure: DateTime<Utc>,
}

/// Inspects requests for attack signatures and repeated-failure bursts.
/// Detection only flags and audits; admission decisions stay with the
/// rate limiter and the caller.
pub struct SecurityEventDetector {
    failures: KeyedStore<String, FailureCounter>,
    audit: Arc<AuditChain>,
    config: Config,
}

impl SecurityEventDetector {
    pub fn new(audit: Arc<AuditChain>, config: Config) -> Self {
        Self {
            failures: KeyedStore::new(),
            audit,
            config,
        }
    }

    /// Check a request against the signature set. A match is audited as
    /// a security violation and returned to the caller.
    pub async fn inspect(&self, profile: &RequestProfile<'_>) -> Result<Option<ThreatSignature>> {
        let matched = match_signature(profile);
        if let Some(signature) = matched {
            warn!("{signature} signature in request from {}", profile.origin);
            self.audit
                .append(
                    None,
                    AuditAction::SecurityViolation,
                    format!("{signature} signature detected"),
                    profile.origin,
                )
                .await?;
        }
        Ok(matched)
    }

    /// Count one failed attempt for a client. Crossing the threshold
    /// emits a single security-violation audit event and resets the
    /// counter so the same burst does not alert twice.
    pub async fn record_failure(&self, client: &str, now: DateTime<Utc>) -> Result<()> {
        let threshold = self.config.failure_alert_threshold();
        let crossed = self.failures.with_entry(
            &client.to_string(),
            || FailureCounter {
                count: 0,
                last_failure: now,
            },
            |counter| {
                counter.count += 1;
                counter.last_failure = now;
                if counter.count >= threshold {
                    counter.count = 0;
                    true
                } else {
                    false
                }
            },
        );
        if crossed {
            warn!("repeated failures from {client}");
            self.audit
                .append(
                    None,
                    AuditAction::SecurityViolation,
                    format!("{threshold} consecutive failed attempts"),
                    client,
                )
                .await?;
        }
        Ok(())
    }

    /// Drop counters whose most recent failure is older than the
    /// cutoff. Invoked by an external scheduler.
    pub fn prune(&self, now: DateTime<Utc>) {
        let horizon = now - self.config.prune_cutoff();
        self.failures
            .retain(|_, counter| counter.last_failure > horizon);
    }
}

fn match_signature(profile: &RequestProfile<'_>) -> Option<ThreatSignature> {
    let path = profile.path.to_lowercase();
    let query = profile.query.to_lowercase();
    let user_agent = profile.user_agent.to_lowercase();

    let in_request = |pattern: &&str| path.contains(*pattern) || query.contains(*pattern);
    if SCRIPT_INJECTION_PATTERNS.iter().any(in_request) {
        Some(ThreatSignature::ScriptInjection)
    } else if PATH_TRAVERSAL_PATTERNS.iter().any(in_request) {
        Some(ThreatSignature::PathTraversal)
    } else if SCANNER_USER_AGENTS
        .iter()
        .any(|pattern| user_agent.contains(pattern))
    {
        Some(ThreatSignature::ScannerUserAgent)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DurableSink, MemorySink};

    fn detector() -> (Arc<MemorySink>, SecurityEventDetector) {
        let sink = Arc::new(MemorySink::new());
        let audit = Arc::new(AuditChain::new(Arc::clone(&sink) as Arc<dyn DurableSink>));
        (sink, SecurityEventDetector::new(audit, Config::default()))
    }

    fn profile<'a>(path: &'a str, query: &'a str, user_agent: &'a str) -> RequestProfile<'a> {
        RequestProfile {
            origin: "203.0.113.7",
            path,
            query,
            user_agent,
        }
    }

    #[tokio::test]
    async fn signatures_are_detected_and_audited() {
        let (sink, detector) = detector();

        let clean = profile("/elections/1", "page=2", "Mozilla/5.0");
        assert_eq!(detector.inspect(&clean).await.unwrap(), None);

        let injected = profile("/search", "q=<SCRIPT>alert(1)</script>", "Mozilla/5.0");
        assert_eq!(
            detector.inspect(&injected).await.unwrap(),
            Some(ThreatSignature::ScriptInjection)
        );

        let traversal = profile("/files/../../etc/passwd", "", "Mozilla/5.0");
        assert_eq!(
            detector.inspect(&traversal).await.unwrap(),
            Some(ThreatSignature::PathTraversal)
        );

        let scanner = profile("/", "", "sqlmap/1.7");
        assert_eq!(
            detector.inspect(&scanner).await.unwrap(),
            Some(ThreatSignature::ScannerUserAgent)
        );

        let violations = sink
            .audit_entries()
            .into_iter()
            .filter(|entry| entry.action == AuditAction::SecurityViolation)
            .count();
        assert_eq!(violations, 3);
    }

    #[tokio::test]
    async fn failure_threshold_alerts_once_then_resets() {
        let (sink, detector) = detector();
        let now = Utc::now();

        for _ in 0..4 {
            detector.record_failure("203.0.113.7", now).await.unwrap();
        }
        let violations = |sink: &MemorySink| {
            sink.audit_entries()
                .into_iter()
                .filter(|entry| entry.action == AuditAction::SecurityViolation)
                .count()
        };
        assert_eq!(violations(&sink), 0);

        detector.record_failure("203.0.113.7", now).await.unwrap();
        assert_eq!(violations(&sink), 1);

        // The counter was reset: four more failures stay quiet, the
        // fifth alerts again.
        for _ in 0..4 {
            detector.record_failure("203.0.113.7", now).await.unwrap();
        }
        assert_eq!(violations(&sink), 1);
        detector.record_failure("203.0.113.7", now).await.unwrap();
        assert_eq!(violations(&sink), 2);
    }

    #[tokio::test]
    async fn prune_forgets_idle_clients_memory_only() {
        let (sink, detector) = detector();
        let now = Utc::now();

        for _ in 0..3 {
            detector
                .record_failure("203.0.113.7", now - chrono::Duration::minutes(20))
                .await
                .unwrap();
        }
        detector.prune(now);

        // The stale partial count is gone, so a fresh burst needs the
        // full threshold again.
        for _ in 0..4 {
            detector.record_failure("203.0.113.7", now).await.unwrap();
        }
        let violations = sink
            .audit_entries()
            .into_iter()
            .filter(|entry| entry.action == AuditAction::SecurityViolation)
            .count();
        assert_eq!(violations, 0);
    }
}
