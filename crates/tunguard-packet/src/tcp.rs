use core::net::IpAddr;

use super::{checksum, ensure_len, ensure_out_buf_len, PacketError, IPPROTO_TCP};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x0001);
    pub const SYN: TcpFlags = TcpFlags(0x0002);
    pub const RST: TcpFlags = TcpFlags(0x0004);
    pub const PSH: TcpFlags = TcpFlags(0x0008);
    pub const ACK: TcpFlags = TcpFlags(0x0010);
    pub const URG: TcpFlags = TcpFlags(0x0020);
    pub const ECE: TcpFlags = TcpFlags(0x0040);
    pub const CWR: TcpFlags = TcpFlags(0x0080);
    pub const NS: TcpFlags = TcpFlags(0x0100);

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl core::fmt::Display for TcpFlags {
    /// Compact `SAPFRU` rendering used in packet logs.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (flag, c) in [
            (TcpFlags::SYN, 'S'),
            (TcpFlags::ACK, 'A'),
            (TcpFlags::PSH, 'P'),
            (TcpFlags::FIN, 'F'),
            (TcpFlags::RST, 'R'),
            (TcpFlags::URG, 'U'),
        ] {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Options a SYN may carry that matter to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
}

pub const TCPOPT_EOL: u8 = 0;
pub const TCPOPT_NOP: u8 = 1;
pub const TCPOPT_MSS: u8 = 2;
pub const TCPOPT_WINDOW_SCALE: u8 = 3;

/// Largest shift RFC 7323 allows for the window scale option.
pub const MAX_WINDOW_SCALE: u8 = 14;

impl TcpOptions {
    /// Decode an options block. Parsing stops at end-of-list or at the first option whose
    /// length is inconsistent; options decoded before that point are kept.
    pub fn parse(mut options: &[u8]) -> Self {
        let mut out = TcpOptions::default();
        while let Some(&kind) = options.first() {
            match kind {
                TCPOPT_EOL => break,
                TCPOPT_NOP => {
                    options = &options[1..];
                    continue;
                }
                _ => {}
            }
            let Some(&len) = options.get(1) else {
                break;
            };
            let len = len as usize;
            if len < 2 || len > options.len() {
                break;
            }
            match (kind, len) {
                (TCPOPT_MSS, 4) => out.mss = Some(u16::from_be_bytes([options[2], options[3]])),
                (TCPOPT_WINDOW_SCALE, 3) => {
                    out.window_scale = Some(options[2].min(MAX_WINDOW_SCALE))
                }
                _ => {}
            }
            options = &options[len..];
        }
        out
    }

    /// Encode MSS and window scale as sent on a SYN+ACK (8 bytes, end-of-list padded).
    pub fn syn_ack_block(mss: u16, window_scale: u8) -> [u8; 8] {
        let mss = mss.to_be_bytes();
        [
            TCPOPT_MSS,
            4,
            mss[0],
            mss[1],
            TCPOPT_WINDOW_SCALE,
            3,
            window_scale,
            TCPOPT_EOL,
        ]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpSegment<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;
        Ok(Self { data, header_len })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn seq_number(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ack_number(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn flags(&self) -> TcpFlags {
        let ns = (self.data[12] & 0x01) as u16;
        let flags = self.data[13] as u16;
        TcpFlags((ns << 8) | flags)
    }

    pub fn window_size(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[16], self.data[17]])
    }

    pub fn urgent_pointer(&self) -> u16 {
        u16::from_be_bytes([self.data[18], self.data[19]])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[Self::MIN_HEADER_LEN..self.header_len]
    }

    pub fn parsed_options(&self) -> TcpOptions {
        TcpOptions::parse(self.options())
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn checksum_valid(&self, src_ip: IpAddr, dst_ip: IpAddr) -> bool {
        checksum::transport_checksum(src_ip, dst_ip, IPPROTO_TCP, self.as_bytes()) == 0
    }
}

pub struct TcpSegmentBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub urgent_pointer: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags,
            window_size: 0,
            urgent_pointer: 0,
            options: &[],
            payload: &[],
        }
    }

    pub fn rst(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32) -> Self {
        Self::new(
            src_port,
            dst_port,
            seq_number,
            ack_number,
            TcpFlags::RST | TcpFlags::ACK,
        )
    }

    pub fn window_size(mut self, window_size: u16) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn options(mut self, options: &'a [u8]) -> Self {
        self.options = options;
        self
    }

    pub fn payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    pub fn header_len(&self) -> Result<usize, PacketError> {
        if !self.options.is_empty() && self.options.len() % 4 != 0 {
            return Err(PacketError::Malformed("TCP options length not multiple of 4"));
        }
        let header_len = TcpSegment::MIN_HEADER_LEN + self.options.len();
        if header_len / 4 > 0x0f {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        Ok(header_len)
    }

    pub fn len(&self) -> Result<usize, PacketError> {
        Ok(self.header_len()? + self.payload.len())
    }

    pub fn build_vec(&self, src_ip: IpAddr, dst_ip: IpAddr) -> Result<Vec<u8>, PacketError> {
        let len = self.len()?;
        let mut buf = vec![0u8; len];
        let written = self.write(src_ip, dst_ip, &mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }

    pub fn write(&self, src_ip: IpAddr, dst_ip: IpAddr, out: &mut [u8]) -> Result<usize, PacketError> {
        let header_len = self.header_len()?;
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;

        // Without ACK the acknowledgment field carries no meaning and is zeroed.
        let ack_number = if self.flags.contains(TcpFlags::ACK) {
            self.ack_number
        } else {
            0
        };

        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&ack_number.to_be_bytes());

        let data_offset = (header_len / 4) as u8;
        let ns = if self.flags.contains(TcpFlags::NS) { 1u8 } else { 0u8 };
        out[12] = (data_offset << 4) | ns;
        out[13] = (self.flags.0 & 0xff) as u8;

        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..18].copy_from_slice(&0u16.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        out[20..header_len].copy_from_slice(self.options);
        out[header_len..len].copy_from_slice(self.payload);

        // Unlike UDP, TCP has no "checksum disabled" sentinel value; a computed checksum
        // of 0x0000 is valid and must be written as-is.
        let csum = checksum::transport_checksum(src_ip, dst_ip, IPPROTO_TCP, &out[..len]);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }
}
