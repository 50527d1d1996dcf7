//! DNS message parsing (RFC 1035) for response inspection.
//!
//! Only what is needed to observe resolutions and to neuter a response is implemented: the fixed
//! header, names with compression pointers, the question section and the answer section.

use core::net::{Ipv4Addr, Ipv6Addr};

use super::{ensure_len, read_u16, read_u32, PacketError};

pub const DNS_HEADER_LEN: usize = 12;

pub const DNS_TYPE_A: u16 = 1;
pub const DNS_TYPE_AAAA: u16 = 28;
pub const DNS_TYPE_SVCB: u16 = 64;
pub const DNS_TYPE_HTTPS: u16 = 65;
pub const DNS_CLASS_IN: u16 = 1;

pub const DNS_RCODE_NOERROR: u8 = 0;
pub const DNS_RCODE_NXDOMAIN: u8 = 3;
pub const DNS_RCODE_REFUSED: u8 = 5;

/// RFC 1035: names are limited to 255 bytes.
pub const DNS_MAX_NAME_LEN: usize = 255;
/// Compression pointers followed before a name is rejected.
pub const DNS_MAX_POINTER_JUMPS: usize = 25;

const FLAG_QR: u16 = 0x8000;

#[derive(Clone, Copy, Debug)]
pub struct DnsMessage<'a> {
    data: &'a [u8],
}

impl<'a> DnsMessage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, DNS_HEADER_LEN)?;
        Ok(Self { data })
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn is_response(&self) -> bool {
        self.flags() & FLAG_QR != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags() >> 11) & 0x0f) as u8
    }

    pub fn rcode(&self) -> u8 {
        (self.flags() & 0x0f) as u8
    }

    pub fn question_count(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn answer_count(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn authority_count(&self) -> u16 {
        u16::from_be_bytes([self.data[8], self.data[9]])
    }

    pub fn additional_count(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// Decode the (possibly compressed) name starting at `off`.
///
/// Returns the dotted name and the offset just past the name as it appears at `off` (i.e. past
/// the first compression pointer if one was followed).
pub fn decode_name(msg: &[u8], off: usize) -> Result<(String, usize), PacketError> {
    let mut name = String::new();
    let mut wire_len = 0usize;
    let mut ptr = off;
    let mut resume: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        ensure_len(msg, ptr + 1)?;
        let len = msg[ptr];
        match len & 0xc0 {
            0x00 => {}
            0xc0 => {
                jumps += 1;
                if jumps > DNS_MAX_POINTER_JUMPS {
                    return Err(PacketError::Malformed("DNS compression loop"));
                }
                ensure_len(msg, ptr + 2)?;
                let target = (((len & 0x3f) as usize) << 8) | msg[ptr + 1] as usize;
                if target >= msg.len() {
                    return Err(PacketError::Malformed("DNS compression pointer out of range"));
                }
                resume.get_or_insert(ptr + 2);
                ptr = target;
                continue;
            }
            _ => return Err(PacketError::Malformed("DNS label has reserved bits set")),
        }

        let len = len as usize;
        if len == 0 {
            if name.is_empty() {
                return Err(PacketError::Malformed("DNS name is empty"));
            }
            return Ok((name, resume.unwrap_or(ptr + 1)));
        }
        wire_len += len + 1;
        if wire_len > DNS_MAX_NAME_LEN {
            return Err(PacketError::Malformed("DNS name too long"));
        }
        ensure_len(msg, ptr + 1 + len)?;
        let label = core::str::from_utf8(&msg[ptr + 1..ptr + 1 + len])
            .map_err(|_| PacketError::Malformed("DNS label is not UTF-8"))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        ptr += 1 + len;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DnsRecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// SVCB or HTTPS service binding; contents are not decoded.
    ServiceBinding,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: DnsRecordData,
}

/// The parts of a response the inspector cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    /// Name of the first question.
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset just past the question section.
    pub question_end: usize,
    pub answers: Vec<DnsAnswer>,
}

impl DnsResponse {
    pub fn has_service_binding(&self) -> bool {
        self.answers
            .iter()
            .any(|answer| answer.data == DnsRecordData::ServiceBinding)
    }
}

/// Parse the question and answer sections of `msg`.
///
/// The message must carry at least one question. Authority and additional sections are not
/// examined.
pub fn parse_response(msg: &[u8]) -> Result<DnsResponse, PacketError> {
    let header = DnsMessage::parse(msg)?;
    let qdcount = header.question_count();
    if qdcount == 0 {
        return Err(PacketError::Unsupported("DNS message without question"));
    }

    let mut off = DNS_HEADER_LEN;
    let mut first: Option<(String, u16, u16)> = None;
    for _ in 0..qdcount {
        let (name, next) = decode_name(msg, off)?;
        let qtype = read_u16(msg, next)?;
        let qclass = read_u16(msg, next + 2)?;
        off = next + 4;
        if first.is_none() {
            first = Some((name, qtype, qclass));
        }
    }
    let question_end = off;
    let Some((qname, qtype, qclass)) = first else {
        return Err(PacketError::Unsupported("DNS message without question"));
    };

    let mut answers = Vec::with_capacity(header.answer_count().min(32) as usize);
    for _ in 0..header.answer_count() {
        let (name, next) = decode_name(msg, off)?;
        let rtype = read_u16(msg, next)?;
        let class = read_u16(msg, next + 2)?;
        let ttl = read_u32(msg, next + 4)?;
        let rdlength = read_u16(msg, next + 8)? as usize;
        let rdata_off = next + 10;
        ensure_len(msg, rdata_off + rdlength)?;
        let rdata = &msg[rdata_off..rdata_off + rdlength];

        let data = match (class, rtype, rdata.len()) {
            (DNS_CLASS_IN, DNS_TYPE_A, 4) => {
                DnsRecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            (DNS_CLASS_IN, DNS_TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                DnsRecordData::Aaaa(Ipv6Addr::from(octets))
            }
            (DNS_CLASS_IN, DNS_TYPE_A | DNS_TYPE_AAAA, _) => {
                return Err(PacketError::Malformed("DNS address record with bad length"))
            }
            (DNS_CLASS_IN, DNS_TYPE_SVCB | DNS_TYPE_HTTPS, _) => DnsRecordData::ServiceBinding,
            _ => DnsRecordData::Other,
        };

        answers.push(DnsAnswer {
            name,
            rtype,
            class,
            ttl,
            data,
        });
        off = rdata_off + rdlength;
    }

    Ok(DnsResponse {
        id: header.id(),
        qname,
        qtype,
        qclass,
        question_end,
        answers,
    })
}

/// Turn a response into an empty answer carrying `rcode`.
///
/// Header flags become `QR | rcode`, answer/authority/additional counts are zeroed and the
/// message is cut just past the question section. Returns the new length.
pub fn rewrite_as_blocked(
    msg: &mut [u8],
    question_end: usize,
    rcode: u8,
) -> Result<usize, PacketError> {
    ensure_len(msg, question_end.max(DNS_HEADER_LEN))?;
    let flags = FLAG_QR | (rcode & 0x0f) as u16;
    msg[2..4].copy_from_slice(&flags.to_be_bytes());
    msg[6..12].fill(0);
    Ok(question_end)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a response for `name` with one answer per address, using a compression pointer to
    /// the question name in each answer.
    pub(crate) fn build_response(name: &str, qtype: u16, answers: &[(u16, &[u8])]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0xbeefu16.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        for label in name.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
        for (rtype, rdata) in answers {
            msg.extend_from_slice(&[0xc0, 0x0c]);
            msg.extend_from_slice(&rtype.to_be_bytes());
            msg.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
            msg.extend_from_slice(&300u32.to_be_bytes());
            msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            msg.extend_from_slice(rdata);
        }
        // One OPT-like additional record so truncation has something to remove.
        msg.extend_from_slice(&[0, 0, 41, 0x10, 0, 0, 0, 0, 0, 0, 0]);
        msg
    }

    #[test]
    fn parses_a_and_aaaa_answers() {
        let v6 = "2606:2800:220:1::".parse::<Ipv6Addr>().unwrap().octets();
        let msg = build_response(
            "example.com",
            DNS_TYPE_A,
            &[(DNS_TYPE_A, &[93, 184, 216, 34]), (DNS_TYPE_AAAA, &v6)],
        );
        let resp = parse_response(&msg).unwrap();
        assert_eq!(resp.id, 0xbeef);
        assert_eq!(resp.qname, "example.com");
        assert_eq!(resp.qtype, DNS_TYPE_A);
        assert_eq!(resp.question_end, 12 + 13 + 4);
        assert_eq!(resp.answers.len(), 2);
        assert_eq!(resp.answers[0].name, "example.com");
        assert_eq!(resp.answers[0].ttl, 300);
        assert_eq!(
            resp.answers[0].data,
            DnsRecordData::A(Ipv4Addr::new(93, 184, 216, 34))
        );
        assert_eq!(
            resp.answers[1].data,
            DnsRecordData::Aaaa(Ipv6Addr::from(v6))
        );
        assert!(!resp.has_service_binding());
    }

    #[test]
    fn recognizes_https_records() {
        let msg = build_response("example.com", DNS_TYPE_HTTPS, &[(DNS_TYPE_HTTPS, &[0, 1, 0])]);
        assert!(parse_response(&msg).unwrap().has_service_binding());
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut msg = vec![0u8; 12];
        msg[5] = 1;
        // Name at offset 12 points to itself.
        msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
        assert!(matches!(
            decode_name(&msg, 12),
            Err(PacketError::Malformed("DNS compression loop"))
        ));
    }

    #[test]
    fn pointer_out_of_range_is_rejected() {
        let msg = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xc0, 0xff];
        assert!(decode_name(&msg, 12).is_err());
    }

    #[test]
    fn overlong_name_is_rejected() {
        let mut msg = vec![0u8; 12];
        for _ in 0..5 {
            msg.push(63);
            msg.extend_from_slice(&[b'a'; 63]);
        }
        msg.push(0);
        assert!(matches!(
            decode_name(&msg, 12),
            Err(PacketError::Malformed("DNS name too long"))
        ));
    }

    #[test]
    fn blocked_rewrite_truncates_after_question() {
        let mut msg = build_response(
            "ads.example.net",
            DNS_TYPE_A,
            &[
                (DNS_TYPE_A, &[1, 2, 3, 4]),
                (DNS_TYPE_A, &[5, 6, 7, 8]),
                (DNS_TYPE_A, &[9, 9, 9, 9]),
            ],
        );
        let resp = parse_response(&msg).unwrap();
        let new_len = rewrite_as_blocked(&mut msg, resp.question_end, DNS_RCODE_NXDOMAIN).unwrap();
        msg.truncate(new_len);

        assert_eq!(new_len, 12 + 17 + 4);
        let header = DnsMessage::parse(&msg).unwrap();
        assert!(header.is_response());
        assert_eq!(header.rcode(), DNS_RCODE_NXDOMAIN);
        assert_eq!(header.question_count(), 1);
        assert_eq!(header.answer_count(), 0);
        assert_eq!(header.authority_count(), 0);
        assert_eq!(header.additional_count(), 0);
        let reparsed = parse_response(&msg).unwrap();
        assert_eq!(reparsed.qname, "ads.example.net");
        assert!(reparsed.answers.is_empty());
    }
}
