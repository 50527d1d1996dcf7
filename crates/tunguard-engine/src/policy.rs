use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

use crate::host::{FlowDescriptor, Host, PacketRecord, ResolvedRecord, UsageRecord, Verdict};

/// An IPv4 or IPv6 CIDR block (e.g. `10.0.0.0/8`, `2001:db8::/32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    network: IpAddr,
    prefix_len: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseCidrError {
    #[error("invalid address in CIDR {0:?}")]
    Address(String),
    #[error("invalid prefix length in CIDR {0:?}")]
    PrefixLen(String),
}

impl IpCidr {
    pub const fn new(network: IpAddr, prefix_len: u8) -> Self {
        Self {
            network,
            prefix_len,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let prefix_len = self.prefix_len.min(32);
                let mask = if prefix_len == 0 {
                    0u32
                } else {
                    u32::MAX << (32 - prefix_len)
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let prefix_len = self.prefix_len.min(128);
                let mask = if prefix_len == 0 {
                    0u128
                } else {
                    u128::MAX << (128 - prefix_len)
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpCidr {
    type Err = ParseCidrError;

    /// Accepts `addr/len` or a bare address, which covers exactly that host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| ParseCidrError::Address(s.to_string()))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match len {
            None => max,
            Some(len) => len
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max)
                .ok_or_else(|| ParseCidrError::PrefixLen(s.to_string()))?,
        };
        Ok(Self::new(network, prefix_len))
    }
}

/// A [`Host`] driven by fixed allow/deny lists.
///
/// Every flow is allowed unless its destination matches `deny_ips`, `allow_ips` is non-empty
/// and does not match, or its inspected server name matches `deny_domains`. DNS answers for
/// names under `deny_domains` are rewritten to the configured block response code.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    /// If non-empty, only destinations matching at least one CIDR are allowed.
    pub allow_ips: Vec<IpCidr>,
    /// Destinations matching any CIDR here are denied.
    pub deny_ips: Vec<IpCidr>,

    /// DNS name suffix denylist.
    ///
    /// Entries should be in lower-case without a trailing dot (e.g. `"example.com"`). Matching is
    /// done on `name == suffix || name.ends_with("." + suffix)`.
    pub deny_domains: Vec<String>,

    /// Original destination to replacement destination.
    pub redirects: HashMap<SocketAddr, SocketAddr>,

    /// Emit every packet record at info level on the `tunguard::packets` target.
    pub log_packets: bool,
}

impl StaticPolicy {
    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        if self.deny_ips.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        if !self.allow_ips.is_empty() {
            return self.allow_ips.iter().any(|cidr| cidr.contains(ip));
        }
        true
    }

    pub fn allows_domain(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        !self
            .deny_domains
            .iter()
            .any(|suffix| domain_matches(&name, suffix))
    }
}

impl Host for StaticPolicy {
    fn is_address_allowed(&self, flow: &FlowDescriptor) -> Verdict {
        if !self.allows_ip(flow.dst) {
            return Verdict::Blocked;
        }
        if let Some(name) = &flow.server_name {
            if !self.allows_domain(name) {
                return Verdict::Blocked;
            }
        }
        let target = SocketAddr::new(flow.dst, flow.dport);
        Verdict::Allowed(self.redirects.get(&target).copied())
    }

    fn is_domain_blocked(&self, name: &str, _uid: Option<u32>) -> bool {
        !self.allows_domain(name)
    }

    fn log_packet(&self, record: &PacketRecord) {
        if !self.log_packets {
            return;
        }
        tracing::info!(
            target: "tunguard::packets",
            direction = ?record.direction,
            uid = ?record.uid,
            allowed = record.allowed,
            "{} {} {}/{} > {}/{} {} {}",
            record.version,
            record.protocol,
            record.src,
            record.sport,
            record.dst,
            record.dport,
            record.flags,
            record.data,
        );
    }

    fn dns_resolved(&self, record: &ResolvedRecord) {
        tracing::debug!(
            qname = %record.qname,
            aname = %record.aname,
            resource = %record.resource,
            ttl = record.ttl,
            "resolved"
        );
    }

    fn sni_resolved(&self, server_name: &str, dst: IpAddr) {
        tracing::debug!(%dst, "server name {server_name}");
    }

    fn account_usage(&self, usage: &UsageRecord) {
        tracing::debug!(
            protocol = %usage.protocol,
            dst = %usage.dst,
            dport = usage.dport,
            uid = ?usage.uid,
            sent = usage.sent,
            received = usage.received,
            "usage"
        );
    }
}

fn domain_matches(name: &str, suffix: &str) -> bool {
    if name == suffix {
        return true;
    }
    let Some(rest) = name.strip_suffix(suffix) else {
        return false;
    };
    rest.ends_with('.')
}

#[cfg(test)]
mod tests {
    use tunguard_packet::IpVersion;

    use super::*;
    use crate::flow::Protocol;

    #[test]
    fn domain_matches_requires_suffix_boundary() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("sub.example.com", "example.com"));
        assert!(!domain_matches("notexample.com", "example.com"));
        assert!(!domain_matches("example.com.evil", "example.com"));
        assert!(!domain_matches("evilcom", "com"));
        assert!(domain_matches("example.com", "com"));
    }

    #[test]
    fn cidr_parsing_and_matching() {
        let v4: IpCidr = "10.0.0.0/8".parse().unwrap();
        assert!(v4.contains("10.200.1.1".parse().unwrap()));
        assert!(!v4.contains("11.0.0.1".parse().unwrap()));
        assert!(!v4.contains("::ffff:10.0.0.1".parse().unwrap()));

        let v6: IpCidr = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains("2001:db8:1::7".parse().unwrap()));
        assert!(!v6.contains("2001:db9::1".parse().unwrap()));

        let host: IpCidr = "192.0.2.7".parse().unwrap();
        assert!(host.contains("192.0.2.7".parse().unwrap()));
        assert!(!host.contains("192.0.2.8".parse().unwrap()));

        assert!(matches!(
            "10.0.0.0/33".parse::<IpCidr>(),
            Err(ParseCidrError::PrefixLen(_))
        ));
        assert!(matches!(
            "ten/8".parse::<IpCidr>(),
            Err(ParseCidrError::Address(_))
        ));
    }

    fn flow(dst: &str, dport: u16) -> FlowDescriptor {
        let dst: IpAddr = dst.parse().unwrap();
        FlowDescriptor {
            protocol: Protocol::Tcp,
            version: IpVersion::of(&dst),
            src: "10.1.10.2".parse().unwrap(),
            sport: 40000,
            dst,
            dport,
            uid: Some(10_123),
            server_name: None,
        }
    }

    #[test]
    fn verdicts_follow_lists_and_redirects() {
        let mut policy = StaticPolicy {
            deny_ips: vec!["198.51.100.0/24".parse().unwrap()],
            deny_domains: vec!["ads.example".into()],
            ..StaticPolicy::default()
        };
        let redirect: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        policy
            .redirects
            .insert("93.184.216.34:80".parse().unwrap(), redirect);

        assert_eq!(
            policy.is_address_allowed(&flow("93.184.216.34", 80)),
            Verdict::Allowed(Some(redirect))
        );
        assert_eq!(
            policy.is_address_allowed(&flow("93.184.216.34", 443)),
            Verdict::Allowed(None)
        );
        assert_eq!(
            policy.is_address_allowed(&flow("198.51.100.9", 80)),
            Verdict::Blocked
        );

        let mut named = flow("93.184.216.34", 443);
        named.server_name = Some("tracker.ads.example".into());
        assert_eq!(policy.is_address_allowed(&named), Verdict::Blocked);

        assert!(policy.is_domain_blocked("Tracker.Ads.Example.", None));
        assert!(!policy.is_domain_blocked("example.org", None));

        policy.allow_ips = vec!["2001:db8::/32".parse().unwrap()];
        assert_eq!(
            policy.is_address_allowed(&flow("93.184.216.34", 443)),
            Verdict::Blocked
        );
        assert!(policy.is_address_allowed(&flow("2001:db8::1", 443)).is_allowed());
    }
}
