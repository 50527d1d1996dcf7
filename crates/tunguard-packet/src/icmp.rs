//! ICMP and ICMPv6 echo messages.

use core::net::Ipv6Addr;

use super::{checksum, ensure_len, PacketError, IPPROTO_ICMPV6};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Clone, Copy, Debug)]
pub struct IcmpEcho<'a> {
    data: &'a [u8],
}

impl<'a> IcmpEcho<'a> {
    pub const HEADER_LEN: usize = 8;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        Ok(Self { data })
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..]
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == ICMP_ECHO_REQUEST || self.icmp_type() == ICMPV6_ECHO_REQUEST
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// How the checksum of an echo message is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EchoChecksum {
    /// ICMPv4: plain checksum over the message.
    V4,
    /// ICMPv6: checksum over a pseudo header built from the given addresses.
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

/// Replace the echo identifier of `message` in place and recompute its checksum.
pub fn rewrite_echo_identifier(
    message: &mut [u8],
    identifier: u16,
    csum: EchoChecksum,
) -> Result<(), PacketError> {
    ensure_len(message, IcmpEcho::HEADER_LEN)?;
    message[4..6].copy_from_slice(&identifier.to_be_bytes());
    message[2..4].copy_from_slice(&0u16.to_be_bytes());
    let value = match csum {
        EchoChecksum::V4 => checksum::internet_checksum(message),
        EchoChecksum::V6 { src, dst } => {
            checksum::transport_checksum_ipv6(src, dst, IPPROTO_ICMPV6, message)
        }
    };
    message[2..4].copy_from_slice(&value.to_be_bytes());
    Ok(())
}
