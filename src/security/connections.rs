//! Per-address in-flight request counter.
//!
//! A successful [`ConnectionCounter::try_admit`] hands out a [`ConnectionPermit`]; dropping
//! the permit releases the slot, so the count is restored on normal return, early return,
//! panic unwinding and future cancellation alike.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::SharedSecurityConfig;

/// Tracks concurrent requests per IP against `max_concurrent_connections`.
#[derive(Clone)]
pub struct ConnectionCounter {
    config: SharedSecurityConfig,
    counts: Arc<DashMap<IpAddr, u32>>,
}

/// Reserved connection slot. Releases on drop.
#[must_use = "dropping the permit releases the connection slot immediately"]
pub struct ConnectionPermit {
    counter: ConnectionCounter,
    ip: IpAddr,
}

impl ConnectionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.counter.release(self.ip);
    }
}

impl ConnectionCounter {
    pub fn new(config: SharedSecurityConfig) -> Self {
        Self {
            config,
            counts: Arc::new(DashMap::new()),
        }
    }

    /// Reserve a slot for `ip`, or `None` when the ceiling is already reached.
    pub fn try_admit(&self, ip: IpAddr) -> Option<ConnectionPermit> {
        let ceiling = self.config.snapshot().max_concurrent_connections;

        let mut count = self.counts.entry(ip).or_insert(0);
        if *count >= ceiling {
            tracing::warn!(ip = %ip, count = *count, ceiling, "Too many concurrent connections");
            return None;
        }
        *count += 1;
        drop(count);

        Some(ConnectionPermit {
            counter: self.clone(),
            ip,
        })
    }

    /// Release one slot for `ip`. Never drops below zero.
    pub fn release(&self, ip: IpAddr) {
        match self.counts.entry(ip) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                if *count <= 1 {
                    entry.remove();
                } else {
                    *count -= 1;
                }
            }
            Entry::Vacant(_) => {
                tracing::warn!(ip = %ip, "Connection released more times than admitted");
            }
        }
    }

    pub fn in_flight(&self, ip: &IpAddr) -> u32 {
        self.counts.get(ip).map(|count| *count).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<IpAddr, u32> {
        self.counts
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn total_in_flight(&self) -> u64 {
        self.counts.iter().map(|entry| u64::from(*entry.value())).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use std::sync::Barrier;

    fn counter(ceiling: u32) -> ConnectionCounter {
        ConnectionCounter::new(SharedSecurityConfig::new(SecurityConfig {
            max_concurrent_connections: ceiling,
            ..SecurityConfig::default()
        }))
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let counter = counter(2);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();

        let first = counter.try_admit(ip);
        let second = counter.try_admit(ip);
        assert!(first.is_some() && second.is_some());
        assert!(counter.try_admit(ip).is_none());
        assert_eq!(counter.in_flight(&ip), 2);

        drop(first);
        assert_eq!(counter.in_flight(&ip), 1);
        assert!(counter.try_admit(ip).is_some());
    }

    #[test]
    fn test_ceiling_is_exact_under_contention() {
        let ceiling = 16;
        let counter = counter(ceiling);
        let ip: IpAddr = "192.168.1.2".parse().unwrap();
        let barrier = Arc::new(Barrier::new(ceiling as usize + 1));

        let handles: Vec<_> = (0..=ceiling)
            .map(|_| {
                let counter = counter.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    counter.try_admit(ip)
                })
            })
            .collect();

        let permits: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = permits.iter().filter(|permit| permit.is_some()).count();
        assert_eq!(admitted, ceiling as usize);
        assert_eq!(permits.len() - admitted, 1);
        assert_eq!(counter.in_flight(&ip), ceiling);

        drop(permits);
        assert_eq!(counter.in_flight(&ip), 0);
    }

    #[test]
    fn test_release_is_clamped_at_zero() {
        let counter = counter(3);
        let ip: IpAddr = "192.168.1.3".parse().unwrap();

        let permit = counter.try_admit(ip).unwrap();
        drop(permit);
        counter.release(ip);
        counter.release(ip);
        assert_eq!(counter.in_flight(&ip), 0);

        // The ceiling still applies in full after spurious releases
        let held: Vec<_> = (0..3).filter_map(|_| counter.try_admit(ip)).collect();
        assert_eq!(held.len(), 3);
        assert!(counter.try_admit(ip).is_none());
    }

    #[test]
    fn test_permit_released_on_panic() {
        let counter = counter(1);
        let ip: IpAddr = "192.168.1.4".parse().unwrap();

        let inner = counter.clone();
        let result = std::thread::spawn(move || {
            let _permit = inner.try_admit(ip).unwrap();
            panic!("handler failed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(counter.in_flight(&ip), 0);
        assert!(counter.try_admit(ip).is_some());
    }

    #[test]
    fn test_snapshot() {
        let counter = counter(5);
        let a: IpAddr = "192.168.1.5".parse().unwrap();
        let b: IpAddr = "192.168.1.6".parse().unwrap();

        let _p1 = counter.try_admit(a).unwrap();
        let _p2 = counter.try_admit(a).unwrap();
        let _p3 = counter.try_admit(b).unwrap();

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.get(&a), Some(&2));
        assert_eq!(snapshot.get(&b), Some(&1));
        assert_eq!(counter.total_in_flight(), 3);
    }
}
