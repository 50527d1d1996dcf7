//! Minimal DHCP (RFC 2131/2132) support: parse a client request and build the matching
//! OFFER/ACK.

use core::net::Ipv4Addr;

use super::{ensure_len, PacketError};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const DHCP_MAGIC_COOKIE: u32 = 0x6382_5363;

pub const DHCP_MSG_DISCOVER: u8 = 1;
pub const DHCP_MSG_OFFER: u8 = 2;
pub const DHCP_MSG_REQUEST: u8 = 3;
pub const DHCP_MSG_ACK: u8 = 5;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

/// Fixed BOOTP header plus the magic cookie.
pub const DHCP_HEADER_LEN: usize = 240;
/// Replies are padded to the classic BOOTP minimum message size.
const MIN_REPLY_LEN: usize = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Request,
    Other(u8),
}

impl From<u8> for DhcpMessageType {
    fn from(value: u8) -> Self {
        match value {
            DHCP_MSG_DISCOVER => DhcpMessageType::Discover,
            DHCP_MSG_REQUEST => DhcpMessageType::Request,
            other => DhcpMessageType::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DhcpMessage<'a> {
    data: &'a [u8],
}

impl<'a> DhcpMessage<'a> {
    /// Accepts only Ethernet BOOTREQUESTs carrying the DHCP magic cookie.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, DHCP_HEADER_LEN)?;
        if data[0] != BOOTREQUEST {
            return Err(PacketError::Unsupported("DHCP op is not BOOTREQUEST"));
        }
        if data[1] != HTYPE_ETHERNET || data[2] != 6 {
            return Err(PacketError::Unsupported("DHCP hardware type is not Ethernet"));
        }
        let magic = u32::from_be_bytes([data[236], data[237], data[238], data[239]]);
        if magic != DHCP_MAGIC_COOKIE {
            return Err(PacketError::Malformed("DHCP magic cookie mismatch"));
        }
        Ok(Self { data })
    }

    pub fn xid(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn client_hw_addr(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[28..34]);
        mac
    }

    /// Walks the options area for option 53.
    pub fn message_type(&self) -> Option<DhcpMessageType> {
        let mut opts = &self.data[DHCP_HEADER_LEN..];
        while let Some(&code) = opts.first() {
            match code {
                OPT_END => return None,
                OPT_PAD => {
                    opts = &opts[1..];
                    continue;
                }
                _ => {}
            }
            let len = *opts.get(1)? as usize;
            let body = opts.get(2..2 + len)?;
            if code == OPT_MESSAGE_TYPE && len == 1 {
                return Some(DhcpMessageType::from(body[0]));
            }
            opts = &opts[2 + len..];
        }
        None
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// Lease parameters handed out in replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpLease {
    pub server: Ipv4Addr,
    pub client: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub lease_secs: u32,
}

pub struct DhcpOfferAckBuilder<'a> {
    pub request: &'a DhcpMessage<'a>,
    pub message_type: u8,
    pub lease: DhcpLease,
}

impl<'a> DhcpOfferAckBuilder<'a> {
    /// Reply matching the request type: OFFER for DISCOVER, ACK for REQUEST.
    pub fn for_request(request: &'a DhcpMessage<'a>, lease: DhcpLease) -> Option<Self> {
        let message_type = match request.message_type()? {
            DhcpMessageType::Discover => DHCP_MSG_OFFER,
            DhcpMessageType::Request => DHCP_MSG_ACK,
            DhcpMessageType::Other(_) => return None,
        };
        Some(Self {
            request,
            message_type,
            lease,
        })
    }

    pub fn build_vec(&self) -> Vec<u8> {
        let req = self.request.as_bytes();
        let mut out = Vec::with_capacity(MIN_REPLY_LEN);
        out.extend_from_slice(&req[..DHCP_HEADER_LEN]);
        out[0] = BOOTREPLY;
        out[3] = 0; // hops
        out[8..12].fill(0); // secs, flags
        out[12..16].fill(0); // ciaddr
        out[16..20].copy_from_slice(&self.lease.client.octets());
        out[20..24].copy_from_slice(&self.lease.server.octets());
        out[24..28].fill(0); // giaddr
        out[44..236].fill(0); // sname, file

        let server = self.lease.server.octets();
        out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, self.message_type]);
        out.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
        out.extend_from_slice(&self.lease.netmask.octets());
        out.extend_from_slice(&[OPT_ROUTER, 4]);
        out.extend_from_slice(&server);
        out.extend_from_slice(&[OPT_LEASE_TIME, 4]);
        out.extend_from_slice(&self.lease.lease_secs.to_be_bytes());
        out.extend_from_slice(&[OPT_SERVER_ID, 4]);
        out.extend_from_slice(&server);
        out.extend_from_slice(&[OPT_DNS, 4]);
        out.extend_from_slice(&self.lease.dns.octets());
        out.push(OPT_END);
        if out.len() < MIN_REPLY_LEN {
            out.resize(MIN_REPLY_LEN, OPT_PAD);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(message_type: u8) -> Vec<u8> {
        let mut msg = vec![0u8; DHCP_HEADER_LEN];
        msg[0] = BOOTREQUEST;
        msg[1] = HTYPE_ETHERNET;
        msg[2] = 6;
        msg[4..8].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        msg[10] = 0x80; // broadcast flag
        msg[28..34].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
        msg[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&[OPT_PAD, OPT_MESSAGE_TYPE, 1, message_type, 55, 2, 1, 3, OPT_END]);
        msg
    }

    fn lease() -> DhcpLease {
        DhcpLease {
            server: Ipv4Addr::new(10, 1, 10, 1),
            client: Ipv4Addr::new(10, 1, 10, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns: Ipv4Addr::new(8, 8, 8, 8),
            lease_secs: 3600,
        }
    }

    #[test]
    fn discover_gets_offer() {
        let raw = request(DHCP_MSG_DISCOVER);
        let msg = DhcpMessage::parse(&raw).unwrap();
        assert_eq!(msg.message_type(), Some(DhcpMessageType::Discover));
        assert_eq!(msg.xid(), 0xdead_beef);

        let reply = DhcpOfferAckBuilder::for_request(&msg, lease())
            .unwrap()
            .build_vec();
        assert_eq!(reply.len(), MIN_REPLY_LEN);
        assert_eq!(reply[0], BOOTREPLY);
        assert_eq!(&reply[4..8], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&reply[10..12], &[0, 0]);
        assert_eq!(&reply[16..20], &[10, 1, 10, 2]);
        assert_eq!(&reply[20..24], &[10, 1, 10, 1]);
        assert_eq!(&reply[28..34], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&reply[236..240], &DHCP_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&reply[240..243], &[OPT_MESSAGE_TYPE, 1, DHCP_MSG_OFFER]);
        // Lease time is big-endian.
        assert_eq!(&reply[255..261], &[OPT_LEASE_TIME, 4, 0, 0, 0x0e, 0x10]);
    }

    #[test]
    fn request_gets_ack() {
        let raw = request(DHCP_MSG_REQUEST);
        let msg = DhcpMessage::parse(&raw).unwrap();
        let reply = DhcpOfferAckBuilder::for_request(&msg, lease())
            .unwrap()
            .build_vec();
        assert_eq!(&reply[240..243], &[OPT_MESSAGE_TYPE, 1, DHCP_MSG_ACK]);
    }

    #[test]
    fn other_types_and_bad_headers_are_not_answered() {
        let raw = request(7); // RELEASE
        let msg = DhcpMessage::parse(&raw).unwrap();
        assert!(DhcpOfferAckBuilder::for_request(&msg, lease()).is_none());

        let mut raw = request(DHCP_MSG_DISCOVER);
        raw[236] = 0;
        assert!(DhcpMessage::parse(&raw).is_err());

        let mut raw = request(DHCP_MSG_DISCOVER);
        raw[0] = BOOTREPLY;
        assert!(DhcpMessage::parse(&raw).is_err());

        assert!(DhcpMessage::parse(&[0u8; 100]).is_err());
    }
}
