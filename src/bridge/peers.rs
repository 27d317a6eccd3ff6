//! Peer reputation: connections closed for protocol violations, and bans

use dashmap::DashMap;
use std::net::IpAddr;
use tracing::warn;

/// Counts violation closures per peer IP and refuses repeat offenders
#[derive(Debug, Default)]
pub struct PeerRegistry {
    closures: DashMap<IpAddr, u32>,
    /// 0 disables banning
    ban_after_closures: u32,
}

impl PeerRegistry {
    pub fn new(ban_after_closures: u32) -> Self {
        Self {
            closures: DashMap::new(),
            ban_after_closures,
        }
    }

    /// Record a connection closed for violations; true if the peer is now banned
    pub fn record_violation_closure(&self, ip: IpAddr) -> bool {
        let mut count = self.closures.entry(ip).or_insert(0);
        *count += 1;
        let banned = self.ban_after_closures > 0 && *count >= self.ban_after_closures;
        if banned && *count == self.ban_after_closures {
            warn!(peer = %ip, closures = *count, "Peer banned after repeated protocol violations");
        }
        banned
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.ban_after_closures > 0
            && self
                .closures
                .get(ip)
                .is_some_and(|count| *count >= self.ban_after_closures)
    }

    pub fn violation_closures(&self, ip: &IpAddr) -> u32 {
        self.closures.get(ip).map(|count| *count).unwrap_or(0)
    }

    pub fn banned_peers(&self) -> Vec<IpAddr> {
        let mut banned: Vec<IpAddr> = self
            .closures
            .iter()
            .filter(|entry| self.ban_after_closures > 0 && *entry.value() >= self.ban_after_closures)
            .map(|entry| *entry.key())
            .collect();
        banned.sort();
        banned
    }

    /// Forget a peer's record
    pub fn pardon(&self, ip: &IpAddr) -> bool {
        self.closures.remove(ip).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ban_after_threshold() {
        let peers = PeerRegistry::new(2);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

        assert!(!peers.record_violation_closure(ip));
        assert!(!peers.is_banned(&ip));
        assert!(peers.record_violation_closure(ip));
        assert!(peers.is_banned(&ip));
        assert_eq!(peers.banned_peers(), vec![ip]);

        assert!(peers.pardon(&ip));
        assert!(!peers.is_banned(&ip));
    }

    #[test]
    fn test_zero_threshold_never_bans() {
        let peers = PeerRegistry::new(0);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..10 {
            assert!(!peers.record_violation_closure(ip));
        }
        assert_eq!(peers.violation_closures(&ip), 10);
        assert!(peers.banned_peers().is_empty());
    }
}
