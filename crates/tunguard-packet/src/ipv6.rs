use core::net::Ipv6Addr;

use super::{ensure_len, ensure_out_buf_len, PacketError};
use crate::{
    IPPROTO_AH, IPPROTO_DSTOPTS, IPPROTO_FRAGMENT, IPPROTO_HOPOPTS, IPPROTO_MH,
    IPPROTO_ROUTING,
};

/// Upper bound on chained extension headers; anything longer is treated as malformed.
const MAX_EXTENSION_HEADERS: usize = 16;

#[derive(Clone, Copy, Debug)]
pub struct Ipv6Packet<'a> {
    data: &'a [u8],
    total_len: usize,
}

/// Result of walking the extension-header chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv6Transport {
    /// Upper-layer protocol number.
    pub protocol: u8,
    /// Offset of the upper-layer header from the start of the packet.
    pub offset: usize,
    /// Whether a fragment header marked this packet as a non-initial or non-final fragment.
    pub fragmented: bool,
}

impl<'a> Ipv6Packet<'a> {
    pub const HEADER_LEN: usize = 40;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        if data[0] >> 4 != 6 {
            return Err(PacketError::Malformed("IPv6 version != 6"));
        }
        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let total_len = Self::HEADER_LEN + payload_len;
        ensure_len(data, total_len)?;
        Ok(Self { data, total_len })
    }

    pub fn payload_len(&self) -> usize {
        self.total_len - Self::HEADER_LEN
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn next_header(&self) -> u8 {
        self.data[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn src(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(octets)
    }

    pub fn dst(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(octets)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        &self.data[..self.total_len]
    }

    /// Skip over extension headers to find the transport protocol.
    ///
    /// ESP terminates the walk: everything after it is encrypted, so ESP itself is reported as
    /// the transport protocol.
    pub fn transport(&self) -> Result<Ipv6Transport, PacketError> {
        let data = self.as_bytes();
        let mut protocol = self.next_header();
        let mut offset = Self::HEADER_LEN;
        let mut fragmented = false;
        for _ in 0..MAX_EXTENSION_HEADERS {
            let ext_len = match protocol {
                IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS | IPPROTO_MH => {
                    ensure_len(data, offset + 2)?;
                    (data[offset + 1] as usize + 1) * 8
                }
                IPPROTO_AH => {
                    ensure_len(data, offset + 2)?;
                    (data[offset + 1] as usize + 2) * 4
                }
                IPPROTO_FRAGMENT => {
                    ensure_len(data, offset + 8)?;
                    let frag = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                    if (frag & 0xfff8) != 0 || (frag & 0x0001) != 0 {
                        fragmented = true;
                    }
                    8
                }
                // ESP and every upper-layer protocol end the chain.
                _ => {
                    return Ok(Ipv6Transport {
                        protocol,
                        offset,
                        fragmented,
                    })
                }
            };
            ensure_len(data, offset + ext_len)?;
            protocol = data[offset];
            offset += ext_len;
        }
        Err(PacketError::Malformed("IPv6 extension header chain too long"))
    }
}

pub struct Ipv6PacketBuilder<'a> {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload: &'a [u8],
}

impl<'a> Ipv6PacketBuilder<'a> {
    pub fn len(&self) -> Result<usize, PacketError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv6 payload length > 65535"));
        }
        Ok(Ipv6Packet::HEADER_LEN + self.payload.len())
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        out[0..4].copy_from_slice(&[0x60, 0, 0, 0]);
        out[4..6].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out[6] = self.next_header;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.src.octets());
        out[24..40].copy_from_slice(&self.dst.octets());
        out[Ipv6Packet::HEADER_LEN..len].copy_from_slice(self.payload);
        Ok(len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        self.write(&mut buf)?;
        Ok(buf)
    }
}
