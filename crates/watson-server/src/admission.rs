//! Accept-time IP filtering.
//!
//! A pattern matches a candidate when it parses as an exact address
//! equal to it, or as a CIDR network containing it. Blocked patterns
//! always win; a non-empty permit list turns the filter into an allow
//! list.

use std::net::IpAddr;

use ipnet::IpNet;

pub(crate) fn ip_allowed(ip: IpAddr, permitted: &[String], blocked: &[String]) -> bool {
    if blocked.iter().any(|pattern| ip_match(ip, pattern)) {
        return false;
    }
    if !permitted.is_empty() {
        return permitted.iter().any(|pattern| ip_match(ip, pattern));
    }
    true
}

fn ip_match(ip: IpAddr, pattern: &str) -> bool {
    if let Ok(exact) = pattern.parse::<IpAddr>() {
        return ip == exact;
    }
    if let Ok(network) = pattern.parse::<IpNet>() {
        return network.contains(&ip);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn open_by_default() {
        assert!(ip_allowed(ip("203.0.113.9"), &[], &[]));
    }

    #[test]
    fn exact_block_wins() {
        let blocked = patterns(&["127.0.0.1"]);
        assert!(!ip_allowed(ip("127.0.0.1"), &[], &blocked));
        assert!(ip_allowed(ip("127.0.0.2"), &[], &blocked));
    }

    #[test]
    fn cidr_block_contains() {
        let blocked = patterns(&["10.0.0.0/8"]);
        assert!(!ip_allowed(ip("10.42.0.1"), &[], &blocked));
        assert!(ip_allowed(ip("11.0.0.1"), &[], &blocked));
    }

    #[test]
    fn permit_list_restricts() {
        let permitted = patterns(&["192.168.1.0/24"]);
        assert!(ip_allowed(ip("192.168.1.77"), &permitted, &[]));
        assert!(!ip_allowed(ip("192.168.2.77"), &permitted, &[]));
    }

    #[test]
    fn block_overrides_permit() {
        let permitted = patterns(&["192.168.1.0/24"]);
        let blocked = patterns(&["192.168.1.77"]);
        assert!(!ip_allowed(ip("192.168.1.77"), &permitted, &blocked));
        assert!(ip_allowed(ip("192.168.1.78"), &permitted, &blocked));
    }

    #[test]
    fn unparseable_pattern_never_matches() {
        let blocked = patterns(&["not-an-ip"]);
        assert!(ip_allowed(ip("127.0.0.1"), &[], &blocked));
        let permitted = patterns(&["also bad"]);
        assert!(!ip_allowed(ip("127.0.0.1"), &permitted, &[]));
    }

    #[test]
    fn ipv6_patterns() {
        let blocked = patterns(&["::1"]);
        assert!(!ip_allowed(ip("::1"), &[], &blocked));
        let permitted = patterns(&["2001:db8::/32"]);
        assert!(ip_allowed(ip("2001:db8::5"), &permitted, &[]));
        assert!(!ip_allowed(ip("2001:db9::5"), &permitted, &[]));
    }
}
