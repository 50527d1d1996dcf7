//! The boundary between the engine and the embedding host.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;

use tunguard_packet::IpVersion;

use crate::flow::Protocol;

/// A flow attempt submitted for a policy decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowDescriptor {
    pub protocol: Protocol,
    pub version: IpVersion,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    /// Owning application, when the connection tables could attribute the flow.
    pub uid: Option<u32>,
    /// Host name inspected from the first payload (TLS SNI), if any.
    pub server_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Blocked,
    /// Allowed, optionally redirected to another destination.
    Allowed(Option<SocketAddr>),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }

    /// The redirect target, ignoring targets with an unspecified address or port 0.
    pub fn redirect(&self) -> Option<SocketAddr> {
        match self {
            Verdict::Allowed(Some(addr)) if !addr.ip().is_unspecified() && addr.port() != 0 => {
                Some(*addr)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Read from the tun device.
    Outbound,
    /// Written to the tun device.
    Inbound,
}

/// Packet-level telemetry record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketRecord {
    pub direction: Direction,
    pub version: IpVersion,
    pub protocol: Protocol,
    /// TCP flags in `SAPFR` notation, empty for other protocols.
    pub flags: String,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    /// Free-form detail, e.g. the blocked DNS question.
    pub data: String,
    pub uid: Option<u32>,
    pub allowed: bool,
}

/// One address record seen in a DNS response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub qname: String,
    pub aname: String,
    pub resource: IpAddr,
    pub ttl: u32,
    pub uid: Option<u32>,
}

/// Bytes exchanged by one flow since it was last accounted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageRecord {
    pub version: IpVersion,
    pub protocol: Protocol,
    pub dst: IpAddr,
    pub dport: u16,
    pub uid: Option<u32>,
    pub sent: u64,
    pub received: u64,
}

/// Services the engine consumes from its embedder.
///
/// Every method is called from the engine thread while the session table is locked, so
/// implementations must not call back into [`crate::EngineHandle::stats`].
pub trait Host: Send + Sync {
    fn is_address_allowed(&self, flow: &FlowDescriptor) -> Verdict;

    fn is_domain_blocked(&self, _name: &str, _uid: Option<u32>) -> bool {
        false
    }

    /// Exempt a freshly created outbound socket from being routed into the tunnel. Returning
    /// false aborts the flow.
    fn protect_socket(&self, _fd: RawFd) -> bool {
        true
    }

    fn log_packet(&self, _record: &PacketRecord) {}

    fn dns_resolved(&self, _record: &ResolvedRecord) {}

    fn sni_resolved(&self, _server_name: &str, _dst: IpAddr) {}

    fn account_usage(&self, _usage: &UsageRecord) {}

    fn report_error(&self, code: i32, message: &str) {
        tracing::warn!(code, "{message}");
    }

    fn report_exit(&self, message: &str) {
        tracing::error!("{message}");
    }
}
