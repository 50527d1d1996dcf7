#![forbid(unsafe_code)]

//! Bounds-checked packet views and builders for the traffic that crosses a tun device.
//!
//! Every parser in this crate operates on a borrowed byte slice and validates lengths before any
//! multi-byte read; accessors on a successfully parsed view never panic. Builders write into a
//! caller-provided buffer (`write`) or allocate one (`build_vec`).

pub mod checksum;
pub mod dhcp;
pub mod dns;
pub mod icmp;
pub mod ip;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use ip::{IpPacket, IpPacketBuilder, IpVersion};

pub const IPPROTO_HOPOPTS: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ROUTING: u8 = 43;
pub const IPPROTO_FRAGMENT: u8 = 44;
pub const IPPROTO_ESP: u8 = 50;
pub const IPPROTO_AH: u8 = 51;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_DSTOPTS: u8 = 60;
pub const IPPROTO_MH: u8 = 135;

/// Hop limit / TTL used for every packet written back to the tun device.
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),
    #[error("output buffer too small: need {needed} bytes, have {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_buf_len(out: &[u8], needed: usize) -> Result<(), PacketError> {
    if out.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            actual: out.len(),
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn read_u16(data: &[u8], off: usize) -> Result<u16, PacketError> {
    ensure_len(data, off + 2)?;
    Ok(u16::from_be_bytes([data[off], data[off + 1]]))
}

#[inline]
pub(crate) fn read_u32(data: &[u8], off: usize) -> Result<u32, PacketError> {
    ensure_len(data, off + 4)?;
    Ok(u32::from_be_bytes([
        data[off],
        data[off + 1],
        data[off + 2],
        data[off + 3],
    ]))
}
