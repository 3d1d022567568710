//! Volume-based escalation.
//!
//! Counts requests per IP in fixed one-minute windows. Crossing
//! `connection_rate_per_minute` rejects the request; reaching `quick_ban_threshold` bans the
//! IP outright, once per window. A threshold lowered below the current count mid-window
//! fires on the next request.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::reputation::BanSink;
use crate::config::SharedSecurityConfig;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeDecision {
    Under,
    ConnectionRateExceeded { retry_after: Duration },
    QuickBanned { duration: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
    banned: bool,
}

#[derive(Clone)]
pub struct QuickBan {
    config: SharedSecurityConfig,
    windows: Arc<DashMap<IpAddr, Window>>,
    sink: Arc<dyn BanSink>,
}

impl QuickBan {
    pub fn new(config: SharedSecurityConfig, sink: Arc<dyn BanSink>) -> Self {
        Self {
            config,
            windows: Arc::new(DashMap::new()),
            sink,
        }
    }

    pub fn record(&self, ip: IpAddr) -> VolumeDecision {
        self.record_at(ip, Instant::now())
    }

    pub fn record_at(&self, ip: IpAddr, now: Instant) -> VolumeDecision {
        let config = self.config.snapshot();

        let (count, started, crossed) = {
            let mut window = self.windows.entry(ip).or_insert(Window {
                started: now,
                count: 0,
                banned: false,
            });
            if now.saturating_duration_since(window.started) >= WINDOW {
                window.started = now;
                window.count = 0;
                window.banned = false;
            }
            window.count = window.count.saturating_add(1);
            let crossed = !window.banned && window.count >= config.quick_ban_threshold;
            if crossed {
                window.banned = true;
            }
            (window.count, window.started, crossed)
        };

        if crossed {
            let duration = config.quick_ban_duration();
            tracing::error!(
                ip = %ip,
                requests_per_minute = count,
                ban_duration_secs = duration.as_secs(),
                "Request volume threshold reached, quick-banning IP"
            );
            self.sink.ban(ip, duration, "quick_ban");
            return VolumeDecision::QuickBanned { duration };
        }

        if count > config.connection_rate_per_minute {
            let retry_after = WINDOW.saturating_sub(now.saturating_duration_since(started));
            return VolumeDecision::ConnectionRateExceeded { retry_after };
        }

        VolumeDecision::Under
    }

    /// Drop windows that ended. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.saturating_duration_since(window.started) < WINDOW);
        before - self.windows.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        bans: Mutex<Vec<IpAddr>>,
    }

    impl BanSink for RecordingSink {
        fn ban(&self, ip: IpAddr, _duration: Duration, _reason: &str) {
            self.bans.lock().unwrap().push(ip);
        }
    }

    fn quick_ban(rate_per_minute: u32, ban_threshold: u32) -> (QuickBan, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = SharedSecurityConfig::new(SecurityConfig {
            connection_rate_per_minute: rate_per_minute,
            quick_ban_threshold: ban_threshold,
            quick_ban_duration_seconds: 600,
            ..SecurityConfig::default()
        });
        (QuickBan::new(config, sink.clone()), sink)
    }

    #[test]
    fn test_connection_rate_rejects_excess_in_window() {
        let (tracker, sink) = quick_ban(3, 100);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        let t0 = Instant::now();

        for _ in 0..3 {
            assert_eq!(tracker.record_at(ip, t0), VolumeDecision::Under);
        }
        assert_eq!(
            tracker.record_at(ip, t0 + Duration::from_secs(20)),
            VolumeDecision::ConnectionRateExceeded {
                retry_after: Duration::from_secs(40)
            }
        );
        assert!(sink.bans.lock().unwrap().is_empty());

        // A fresh window starts after one minute
        assert_eq!(
            tracker.record_at(ip, t0 + Duration::from_secs(61)),
            VolumeDecision::Under
        );
    }

    #[test]
    fn test_quick_ban_fires_once_per_window() {
        let (tracker, sink) = quick_ban(2, 4);
        let ip: IpAddr = "192.168.1.2".parse().unwrap();
        let t0 = Instant::now();

        let decisions: Vec<_> = (0..6).map(|_| tracker.record_at(ip, t0)).collect();
        assert_eq!(
            decisions[3],
            VolumeDecision::QuickBanned {
                duration: Duration::from_secs(600)
            }
        );
        assert!(matches!(
            decisions[4],
            VolumeDecision::ConnectionRateExceeded { .. }
        ));
        assert_eq!(sink.bans.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_lowered_threshold_fires_mid_window() {
        let (tracker, sink) = quick_ban(100, 50);
        let ip: IpAddr = "192.168.1.5".parse().unwrap();
        let t0 = Instant::now();

        for _ in 0..10 {
            assert_eq!(tracker.record_at(ip, t0), VolumeDecision::Under);
        }

        tracker
            .config
            .replace(SecurityConfig {
                connection_rate_per_minute: 100,
                quick_ban_threshold: 5,
                quick_ban_duration_seconds: 600,
                ..SecurityConfig::default()
            })
            .unwrap();

        assert!(matches!(
            tracker.record_at(ip, t0 + Duration::from_secs(1)),
            VolumeDecision::QuickBanned { .. }
        ));
        assert_eq!(
            tracker.record_at(ip, t0 + Duration::from_secs(2)),
            VolumeDecision::Under
        );
        assert_eq!(sink.bans.lock().unwrap().len(), 1);

        // The next window may fire again
        for _ in 0..4 {
            tracker.record_at(ip, t0 + Duration::from_secs(61));
        }
        assert!(matches!(
            tracker.record_at(ip, t0 + Duration::from_secs(61)),
            VolumeDecision::QuickBanned { .. }
        ));
        assert_eq!(sink.bans.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_sweep_drops_finished_windows() {
        let (tracker, _) = quick_ban(10, 100);
        let t0 = Instant::now();

        tracker.record_at("192.168.1.3".parse().unwrap(), t0);
        tracker.record_at("192.168.1.4".parse().unwrap(), t0 + Duration::from_secs(50));

        assert_eq!(tracker.sweep_at(t0 + Duration::from_secs(70)), 1);
        assert_eq!(tracker.tracked_ips(), 1);
    }
}
