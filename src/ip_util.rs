//! IPv4 parsing and longest-prefix-match candidate selection.

use std::net::Ipv4Addr;

/// Parse a dotted-quad IPv4 string, rejecting anything else (including
/// IPv6 literals).
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    s.parse::<Ipv4Addr>().ok()
}

/// Return the entry in `list` whose leading bits agree with `target` for
/// the most bits. Ties are broken by list order — the first match wins.
/// Returns `None` if `target` or every entry in `list` fails to parse as
/// IPv4; entries that fail to parse are skipped rather than aborting the
/// whole comparison.
pub fn longest_prefix_match<'a>(list: &'a [String], target: &str) -> Option<&'a str> {
    let target_bits = u32::from(parse_ipv4(target)?);

    let mut best: Option<(&str, u32)> = None;
    for entry in list {
        let Some(ip) = parse_ipv4(entry) else { continue };
        let bits = u32::from(ip);
        let shared = (target_bits ^ bits).leading_zeros();
        if best.map_or(true, |(_, best_shared)| shared > best_shared) {
            best = Some((entry.as_str(), shared));
        }
    }
    best.map(|(entry, _)| entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn returns_member_of_list() {
        let list = strs(&["192.168.1.1", "10.0.0.1", "192.168.0.1"]);
        let m = longest_prefix_match(&list, "192.168.1.42").unwrap();
        assert!(list.iter().any(|e| e == m));
    }

    #[test]
    fn exact_member_matches_itself() {
        let list = strs(&["192.168.1.1", "10.0.0.1"]);
        assert_eq!(longest_prefix_match(&list, "10.0.0.1").unwrap(), "10.0.0.1");
    }

    #[test]
    fn prefers_closer_prefix() {
        let list = strs(&["10.0.0.1", "192.168.1.1"]);
        assert_eq!(
            longest_prefix_match(&list, "192.168.1.200").unwrap(),
            "192.168.1.1"
        );
    }

    #[test]
    fn ties_break_by_list_order() {
        let list = strs(&["172.16.0.1", "172.16.0.2"]);
        // Both share the same prefix length against this target; first wins.
        assert_eq!(longest_prefix_match(&list, "172.16.0.200").unwrap(), "172.16.0.1");
    }

    #[test]
    fn skips_unparseable_entries() {
        let list = strs(&["not-an-ip", "10.0.0.1"]);
        assert_eq!(longest_prefix_match(&list, "10.0.0.5").unwrap(), "10.0.0.1");
    }
}
