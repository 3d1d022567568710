//! Suspicious-activity escalation.
//!
//! Detector and sensitive-path hits are counted per IP. When a count reaches
//! `auto_block_threshold` the IP is banned for `auto_block_duration` and its counter goes
//! back to zero, so escalation is edge-triggered.
//!
//! The whole map is cleared by the hourly activity sweep rather than expiring per entry.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use super::reputation::BanSink;
use super::threat::ThreatCategory;
use crate::config::SharedSecurityConfig;

/// Why an IP was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    Threat(ThreatCategory),
    SensitivePathAccess,
}

impl SuspicionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionReason::Threat(category) => category.as_str(),
            SuspicionReason::SensitivePathAccess => "sensitive_path_access",
        }
    }
}

impl fmt::Display for SuspicionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ThreatCategory> for SuspicionReason {
    fn from(category: ThreatCategory) -> Self {
        SuspicionReason::Threat(category)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Counter after the increment.
    Recorded { count: u32 },
    /// Threshold reached; a ban was issued and the counter reset.
    Banned { count: u32 },
}

/// Aggregates suspicious events per IP and bans on threshold.
#[derive(Clone)]
pub struct Escalator {
    config: SharedSecurityConfig,
    counters: Arc<DashMap<IpAddr, u32>>,
    sink: Arc<dyn BanSink>,
}

impl Escalator {
    pub fn new(config: SharedSecurityConfig, sink: Arc<dyn BanSink>) -> Self {
        Self {
            config,
            counters: Arc::new(DashMap::new()),
            sink,
        }
    }

    /// Record one suspicious event for `ip`.
    pub fn report(&self, ip: IpAddr, reason: SuspicionReason) -> ReportOutcome {
        let config = self.config.snapshot();

        let outcome = {
            let mut count = self.counters.entry(ip).or_insert(0);
            *count = count.saturating_add(1);
            if *count >= config.auto_block_threshold {
                let reached = *count;
                *count = 0;
                ReportOutcome::Banned { count: reached }
            } else {
                ReportOutcome::Recorded { count: *count }
            }
        };

        match outcome {
            ReportOutcome::Recorded { count } => {
                tracing::warn!(ip = %ip, reason = %reason, count, "Suspicious activity detected");
            }
            ReportOutcome::Banned { count } => {
                tracing::error!(
                    ip = %ip,
                    reason = %reason,
                    count,
                    ban_duration_secs = config.auto_block_duration_seconds,
                    "Malicious behaviour threshold reached, banning IP"
                );
                // Counter lock is released before calling into the ban stores
                self.sink
                    .ban(ip, config.auto_block_duration(), reason.as_str());
            }
        }

        outcome
    }

    pub fn count(&self, ip: &IpAddr) -> u32 {
        self.counters.get(ip).map(|count| *count).unwrap_or(0)
    }

    /// Forget every counter. Returns how many addresses were tracked.
    pub fn reset_all(&self) -> usize {
        let tracked = self.counters.len();
        self.counters.clear();
        tracked
    }

    pub fn tracked_ips(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        bans: Mutex<Vec<(IpAddr, Duration, String)>>,
    }

    impl BanSink for RecordingSink {
        fn ban(&self, ip: IpAddr, duration: Duration, reason: &str) {
            self.bans
                .lock()
                .unwrap()
                .push((ip, duration, reason.to_string()));
        }
    }

    fn escalator(threshold: u32) -> (Escalator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = SharedSecurityConfig::new(SecurityConfig {
            auto_block_threshold: threshold,
            auto_block_duration_seconds: 3600,
            ..SecurityConfig::default()
        });
        (Escalator::new(config, sink.clone()), sink)
    }

    #[test]
    fn test_below_threshold_does_not_ban() {
        let (escalator, sink) = escalator(5);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();

        for expected in 1..5 {
            assert_eq!(
                escalator.report(ip, ThreatCategory::SqlInjection.into()),
                ReportOutcome::Recorded { count: expected }
            );
        }
        assert!(sink.bans.lock().unwrap().is_empty());
        assert_eq!(escalator.count(&ip), 4);
    }

    #[test]
    fn test_threshold_bans_and_resets() {
        let (escalator, sink) = escalator(5);
        let ip: IpAddr = "192.168.1.2".parse().unwrap();

        for _ in 0..4 {
            escalator.report(ip, ThreatCategory::Xss.into());
        }
        assert_eq!(
            escalator.report(ip, SuspicionReason::SensitivePathAccess),
            ReportOutcome::Banned { count: 5 }
        );
        assert_eq!(escalator.count(&ip), 0);

        let bans = sink.bans.lock().unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].0, ip);
        assert_eq!(bans[0].1, Duration::from_secs(3600));
        assert_eq!(bans[0].2, "sensitive_path_access");
    }

    #[test]
    fn test_escalation_is_edge_triggered() {
        let (escalator, sink) = escalator(3);
        let ip: IpAddr = "192.168.1.3".parse().unwrap();

        for _ in 0..3 {
            escalator.report(ip, ThreatCategory::SqlInjection.into());
        }
        assert_eq!(sink.bans.lock().unwrap().len(), 1);

        // Starts from zero again; the next ban needs the full threshold
        escalator.report(ip, ThreatCategory::SqlInjection.into());
        escalator.report(ip, ThreatCategory::SqlInjection.into());
        assert_eq!(sink.bans.lock().unwrap().len(), 1);
        escalator.report(ip, ThreatCategory::SqlInjection.into());
        assert_eq!(sink.bans.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_counters_are_per_ip() {
        let (escalator, _) = escalator(10);
        let a: IpAddr = "192.168.1.4".parse().unwrap();
        let b: IpAddr = "192.168.1.5".parse().unwrap();

        escalator.report(a, ThreatCategory::Xss.into());
        escalator.report(a, ThreatCategory::Xss.into());
        escalator.report(b, ThreatCategory::Xss.into());

        assert_eq!(escalator.count(&a), 2);
        assert_eq!(escalator.count(&b), 1);
    }

    #[test]
    fn test_reset_all() {
        let (escalator, _) = escalator(10);
        escalator.report("192.168.1.6".parse().unwrap(), ThreatCategory::Xss.into());
        escalator.report("192.168.1.7".parse().unwrap(), ThreatCategory::Xss.into());

        assert_eq!(escalator.reset_all(), 2);
        assert_eq!(escalator.tracked_ips(), 0);
    }

    #[test]
    fn test_concurrent_reports_ban_exactly_once_per_threshold() {
        let (escalator, sink) = escalator(50);
        let ip: IpAddr = "192.168.1.8".parse().unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let escalator = escalator.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        escalator.report(ip, ThreatCategory::SqlInjection.into());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sink.bans.lock().unwrap().len(), 2);
        assert_eq!(escalator.count(&ip), 0);
    }
}
