use core::net::Ipv4Addr;

use super::{checksum::ipv4_header_checksum, ensure_len, ensure_out_buf_len, PacketError};

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

#[derive(Clone, Copy, Debug)]
pub struct Ipv4Packet<'a> {
    data: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4Packet<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::Malformed("IPv4 version != 4"));
        }
        let ihl = (data[0] & 0x0f) as usize;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 IHL < 5"));
        }
        let header_len = ihl * 4;
        ensure_len(data, header_len)?;
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(data, total_len)?;
        Ok(Self {
            data,
            header_len,
            total_len,
        })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    fn flags_fragment(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment() & FLAG_DF != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_fragment() & FLAG_MF != 0
    }

    pub fn fragment_offset(&self) -> u16 {
        self.flags_fragment() & FRAGMENT_OFFSET_MASK
    }

    /// True for any piece of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn header_checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    pub fn header_checksum_valid(&self) -> bool {
        ipv4_header_checksum(&self.data[..self.header_len]) == 0
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[Self::MIN_HEADER_LEN..self.header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..self.total_len]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        &self.data[..self.total_len]
    }
}

pub struct Ipv4PacketBuilder<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

impl<'a> Ipv4PacketBuilder<'a> {
    pub fn len(&self) -> Result<usize, PacketError> {
        let len = Ipv4Packet::MIN_HEADER_LEN + self.payload.len();
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        Ok(len)
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        let header = &mut out[..Ipv4Packet::MIN_HEADER_LEN];
        header[0] = (4u8 << 4) | 5;
        header[1] = 0;
        header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        header[4..6].copy_from_slice(&self.identification.to_be_bytes());
        header[6..8].copy_from_slice(&FLAG_DF.to_be_bytes());
        header[8] = self.ttl;
        header[9] = self.protocol;
        header[10..12].copy_from_slice(&0u16.to_be_bytes());
        header[12..16].copy_from_slice(&self.src.octets());
        header[16..20].copy_from_slice(&self.dst.octets());
        let csum = ipv4_header_checksum(header);
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        out[Ipv4Packet::MIN_HEADER_LEN..len].copy_from_slice(self.payload);
        Ok(len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        let written = self.write(&mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse() {
        let payload = [1u8, 2, 3, 4];
        let pkt = Ipv4PacketBuilder {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            protocol: crate::IPPROTO_UDP,
            identification: 7,
            ttl: 64,
            payload: &payload,
        }
        .build_vec()
        .unwrap();

        let parsed = Ipv4Packet::parse(&pkt).unwrap();
        assert_eq!(parsed.src(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.dst(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parsed.protocol(), crate::IPPROTO_UDP);
        assert_eq!(parsed.identification(), 7);
        assert!(parsed.dont_fragment());
        assert!(!parsed.is_fragment());
        assert!(parsed.header_checksum_valid());
        assert_eq!(parsed.payload(), &payload);
    }

    #[test]
    fn trailing_bytes_beyond_total_len_are_ignored() {
        let mut pkt = Ipv4PacketBuilder {
            src: Ipv4Addr::LOCALHOST,
            dst: Ipv4Addr::LOCALHOST,
            protocol: crate::IPPROTO_TCP,
            identification: 0,
            ttl: 1,
            payload: b"abc",
        }
        .build_vec()
        .unwrap();
        pkt.extend_from_slice(&[0xee; 5]);
        let parsed = Ipv4Packet::parse(&pkt).unwrap();
        assert_eq!(parsed.payload(), b"abc");
        assert_eq!(parsed.total_len(), 23);
    }

    #[test]
    fn rejects_short_and_bad_ihl() {
        assert!(matches!(
            Ipv4Packet::parse(&[0x45; 10]),
            Err(PacketError::Truncated { .. })
        ));
        let mut hdr = [0u8; 20];
        hdr[0] = 0x44;
        assert!(matches!(
            Ipv4Packet::parse(&hdr),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn detects_fragments() {
        let mut pkt = Ipv4PacketBuilder {
            src: Ipv4Addr::LOCALHOST,
            dst: Ipv4Addr::LOCALHOST,
            protocol: crate::IPPROTO_UDP,
            identification: 0,
            ttl: 1,
            payload: &[0; 8],
        }
        .build_vec()
        .unwrap();
        pkt[6] = 0x20; // MF
        assert!(Ipv4Packet::parse(&pkt).unwrap().is_fragment());
        pkt[6] = 0x00;
        pkt[7] = 0x10; // offset only
        assert!(Ipv4Packet::parse(&pkt).unwrap().is_fragment());
    }
}
