use proptest::prelude::*;
use tunguard_packet::dhcp::DhcpMessage;
use tunguard_packet::dns::{self, DnsMessage, DNS_CLASS_IN, DNS_HEADER_LEN, DNS_TYPE_A};
use tunguard_packet::icmp::IcmpEcho;
use tunguard_packet::tcp::{TcpOptions, TcpSegment};
use tunguard_packet::udp::UdpPacket;
use tunguard_packet::{tls, IpPacket, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// Response to an A query for `labels` with one answer per address, each answer name a
/// compression pointer to the question.
fn response(labels: &[String], addresses: &[[u8; 4]]) -> (Vec<u8>, usize) {
    let mut msg = vec![0x42, 0x42, 0x81, 0x80, 0, 1];
    msg.extend_from_slice(&(addresses.len() as u16).to_be_bytes());
    msg.extend_from_slice(&[0, 1, 0, 1]);
    for label in labels {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
    msg.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
    let question_end = msg.len();
    for address in addresses {
        msg.extend_from_slice(&[0xc0, 0x0c]);
        msg.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
        msg.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
        msg.extend_from_slice(&60u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(address);
    }
    // Authority and additional records are not walked; any trailing bytes will do.
    msg.extend_from_slice(&[0xde, 0xad]);
    (msg, question_end)
}

proptest! {
    #[test]
    fn parsers_never_panic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        if let Ok(ip) = IpPacket::parse(&data) {
            prop_assert!(ip.payload.len() <= ip.bytes.len());
            match ip.protocol {
                IPPROTO_TCP => {
                    if let Ok(seg) = TcpSegment::parse(ip.payload) {
                        let _ = seg.parsed_options();
                        let _ = seg.checksum_valid(ip.src, ip.dst);
                        let _ = tls::client_hello_server_name(seg.payload());
                    }
                }
                IPPROTO_UDP => {
                    if let Ok(udp) = UdpPacket::parse(ip.payload) {
                        let _ = udp.checksum_valid(ip.src, ip.dst);
                        let _ = dns::parse_response(udp.payload());
                        let _ = DhcpMessage::parse(udp.payload()).map(|m| m.message_type());
                    }
                }
                IPPROTO_ICMP | IPPROTO_ICMPV6 => {
                    if let Ok(echo) = IcmpEcho::parse(ip.payload) {
                        let _ = (echo.identifier(), echo.sequence(), echo.payload().len());
                    }
                }
                _ => {}
            }
        }
        let _ = TcpOptions::parse(&data);
        let _ = tls::client_hello_server_name(&data);
        if let Ok(response) = dns::parse_response(&data) {
            prop_assert!(response.question_end <= data.len());
        }
    }

    #[test]
    fn blocked_rewrite_keeps_only_the_question(
        labels in proptest::collection::vec("[a-z0-9]{1,20}", 1..5),
        addresses in proptest::collection::vec(any::<[u8; 4]>(), 0..8),
        rcode in 0u8..16,
    ) {
        let (mut msg, question_end) = response(&labels, &addresses);
        let parsed = dns::parse_response(&msg).unwrap();
        prop_assert_eq!(&parsed.qname, &labels.join("."));
        prop_assert_eq!(parsed.answers.len(), addresses.len());
        prop_assert_eq!(parsed.question_end, question_end);

        let len = dns::rewrite_as_blocked(&mut msg, parsed.question_end, rcode).unwrap();
        prop_assert_eq!(len, question_end);
        prop_assert!(len > DNS_HEADER_LEN);

        let rewritten = DnsMessage::parse(&msg[..len]).unwrap();
        prop_assert_eq!(rewritten.id(), 0x4242);
        prop_assert!(rewritten.is_response());
        prop_assert_eq!(rewritten.rcode(), rcode);
        prop_assert_eq!(rewritten.question_count(), 1);
        prop_assert_eq!(rewritten.answer_count(), 0);
        prop_assert_eq!(rewritten.authority_count(), 0);
        prop_assert_eq!(rewritten.additional_count(), 0);
    }
}
