//! Version-agnostic wrappers over [`Ipv4Packet`] and [`Ipv6Packet`].

use core::net::IpAddr;

use super::{
    ipv4::{Ipv4Packet, Ipv4PacketBuilder},
    ipv6::{Ipv6Packet, Ipv6PacketBuilder},
    PacketError, DEFAULT_TTL,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Fixed IP header length used for every packet this crate builds.
    pub fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => Ipv4Packet::MIN_HEADER_LEN,
            IpVersion::V6 => Ipv6Packet::HEADER_LEN,
        }
    }
}

impl core::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

/// The network-layer part of a datagram read from the tun device.
#[derive(Clone, Copy, Debug)]
pub struct IpPacket<'a> {
    pub version: IpVersion,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol, after skipping IPv6 extension headers.
    pub protocol: u8,
    /// Whether the datagram is a piece of a fragmented datagram.
    pub fragmented: bool,
    /// Transport header and payload.
    pub payload: &'a [u8],
    /// Whole datagram, trimmed to its advertised length.
    pub bytes: &'a [u8],
}

impl<'a> IpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let first = *data.first().ok_or(PacketError::Truncated {
            needed: 1,
            actual: 0,
        })?;
        match first >> 4 {
            4 => {
                let pkt = Ipv4Packet::parse(data)?;
                Ok(Self {
                    version: IpVersion::V4,
                    src: IpAddr::V4(pkt.src()),
                    dst: IpAddr::V4(pkt.dst()),
                    protocol: pkt.protocol(),
                    fragmented: pkt.is_fragment(),
                    payload: pkt.payload(),
                    bytes: pkt.as_bytes(),
                })
            }
            6 => {
                let pkt = Ipv6Packet::parse(data)?;
                let transport = pkt.transport()?;
                let bytes = pkt.as_bytes();
                Ok(Self {
                    version: IpVersion::V6,
                    src: IpAddr::V6(pkt.src()),
                    dst: IpAddr::V6(pkt.dst()),
                    protocol: transport.protocol,
                    fragmented: transport.fragmented,
                    payload: &bytes[transport.offset..],
                    bytes,
                })
            }
            _ => Err(PacketError::Unsupported("unknown IP version")),
        }
    }
}

/// Wraps an already-built transport segment in an IPv4 or IPv6 header.
pub struct IpPacketBuilder<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

impl<'a> IpPacketBuilder<'a> {
    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        match (self.src, self.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Ipv4PacketBuilder {
                src,
                dst,
                protocol: self.protocol,
                identification: 0,
                ttl: DEFAULT_TTL,
                payload: self.payload,
            }
            .build_vec(),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Ipv6PacketBuilder {
                src,
                dst,
                next_header: self.protocol,
                hop_limit: DEFAULT_TTL,
                payload: self.payload,
            }
            .build_vec(),
            _ => Err(PacketError::Malformed("mixed IPv4/IPv6 addresses")),
        }
    }
}
