use core::fmt;
use std::net::IpAddr;

use mio::Token;
use tunguard_packet::{IpVersion, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
}

impl Protocol {
    /// IP protocol number; ICMP maps to ICMPv6 on IPv6.
    pub fn number(self, version: IpVersion) -> u8 {
        match (self, version) {
            (Protocol::Icmp, IpVersion::V4) => IPPROTO_ICMP,
            (Protocol::Icmp, IpVersion::V6) => IPPROTO_ICMPV6,
            (Protocol::Udp, _) => IPPROTO_UDP,
            (Protocol::Tcp, _) => IPPROTO_TCP,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            IPPROTO_ICMP | IPPROTO_ICMPV6 => Some(Protocol::Icmp),
            IPPROTO_UDP => Some(Protocol::Udp),
            IPPROTO_TCP => Some(Protocol::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Icmp => "ICMP",
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        })
    }
}

/// Identity of a flow as seen from the tun side. ICMP flows use zero ports, so a single
/// session covers every echo exchange between two addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub version: IpVersion,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

impl FlowKey {
    pub fn icmp(src: IpAddr, dst: IpAddr) -> Self {
        Self {
            protocol: Protocol::Icmp,
            version: IpVersion::of(&src),
            src,
            sport: 0,
            dst,
            dport: 0,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} > {}/{}",
            self.protocol, self.src, self.sport, self.dst, self.dport
        )
    }
}

/// Stable identifier of a session in the table; doubles as its readiness token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FlowId(pub(crate) usize);

pub(crate) const TUN_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

impl FlowId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Option<Self> {
        (token != TUN_TOKEN && token != WAKE_TOKEN).then_some(FlowId(token.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_except_reserved() {
        let id = FlowId(7);
        assert_eq!(FlowId::from_token(id.token()), Some(id));
        assert_eq!(FlowId::from_token(TUN_TOKEN), None);
        assert_eq!(FlowId::from_token(WAKE_TOKEN), None);
    }

    #[test]
    fn display_and_protocol_numbers() {
        let key = FlowKey {
            protocol: Protocol::Tcp,
            version: IpVersion::V4,
            src: "10.0.0.2".parse().unwrap(),
            sport: 40000,
            dst: "93.184.216.34".parse().unwrap(),
            dport: 80,
        };
        assert_eq!(key.to_string(), "TCP 10.0.0.2/40000 > 93.184.216.34/80");
        assert_eq!(Protocol::Icmp.number(IpVersion::V6), IPPROTO_ICMPV6);
        assert_eq!(Protocol::from_number(IPPROTO_ICMPV6), Some(Protocol::Icmp));
        assert_eq!(Protocol::from_number(47), None);
    }
}
