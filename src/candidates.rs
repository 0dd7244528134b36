//! Router-candidate discovery strategy.
//!
//! PMP and PCP both probe an unknown home network by guessing the gateway
//! address rather than relying on multicast discovery. [`candidate_waves`]
//! turns the router-IP cache and the host's current LAN IPs into two
//! ordered waves: `matched` (cache entries plus whichever default IPs are
//! on the same LAN segment as a local address) is tried first, and `other`
//! (the remaining defaults) only if nothing in `matched` answers.

use std::collections::HashSet;

use crate::ip_util::longest_prefix_match;

/// A 20-entry list of popular residential gateway default addresses,
/// ordered by rough real-world prevalence. Treated as an immutable,
/// read-only constant shared across every wave computation.
pub const ROUTER_IPS: &[&str] = &[
    "192.168.0.1",
    "192.168.1.1",
    "192.168.1.254",
    "192.168.0.254",
    "192.168.2.1",
    "192.168.8.1",
    "192.168.10.1",
    "192.168.11.1",
    "192.168.15.1",
    "192.168.100.1",
    "10.0.0.1",
    "10.0.0.138",
    "10.0.1.1",
    "10.1.1.1",
    "10.1.10.1",
    "192.168.3.1",
    "192.168.4.1",
    "192.168.5.1",
    "192.168.20.1",
    "192.168.50.1",
];

/// Probe ports reserved for protocol-support detection. These must never
/// be reused as real mapping ports within the same process run.
pub const PMP_PROBE_PORT: u16 = 55555;
pub const PCP_PROBE_PORT: u16 = 55556;
pub const UPNP_PROBE_PORT: u16 = 55557;

/// Two ordered, deduplicated waves of candidate router IPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateWaves {
    /// Cache hits plus LAN-matched defaults, cache entries first.
    pub matched: Vec<String>,
    /// Every remaining default not already in `matched`.
    pub other: Vec<String>,
}

/// Compute the two waves given the current router-IP cache and the host's
/// current local IPv4 addresses.
pub fn candidate_waves(router_ip_cache: &[String], local_ips: &[String]) -> CandidateWaves {
    let router_ips: Vec<String> = ROUTER_IPS.iter().map(|s| s.to_string()).collect();

    let mut matched = Vec::new();
    let mut seen = HashSet::new();
    for ip in router_ip_cache {
        if seen.insert(ip.clone()) {
            matched.push(ip.clone());
        }
    }
    for local in local_ips {
        if let Some(best) = longest_prefix_match(&router_ips, local) {
            if seen.insert(best.to_string()) {
                matched.push(best.to_string());
            }
        }
    }

    let other: Vec<String> = router_ips.into_iter().filter(|ip| !seen.contains(ip)).collect();

    CandidateWaves { matched, other }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_entries_come_first_in_matched() {
        let cache = vec!["10.0.0.1".to_string()];
        let local = vec!["192.168.1.50".to_string()];
        let waves = candidate_waves(&cache, &local);
        assert_eq!(waves.matched[0], "10.0.0.1");
        assert!(waves.matched.contains(&"192.168.1.1".to_string()));
    }

    #[test]
    fn matched_and_other_partition_router_ips_without_overlap() {
        let cache = vec!["192.168.1.1".to_string()];
        let waves = candidate_waves(&cache, &[]);
        for ip in &waves.matched {
            assert!(!waves.other.contains(ip));
        }
        assert_eq!(waves.matched.len() + waves.other.len(), ROUTER_IPS.len());
    }

    #[test]
    fn duplicates_between_cache_and_lan_match_are_collapsed() {
        let cache = vec!["192.168.1.1".to_string()];
        let local = vec!["192.168.1.77".to_string()];
        let waves = candidate_waves(&cache, &local);
        assert_eq!(waves.matched.iter().filter(|ip| *ip == "192.168.1.1").count(), 1);
    }

    #[test]
    fn empty_cache_and_no_local_ips_matches_nothing() {
        let waves = candidate_waves(&[], &[]);
        assert!(waves.matched.is_empty());
        assert_eq!(waves.other.len(), ROUTER_IPS.len());
    }
}
