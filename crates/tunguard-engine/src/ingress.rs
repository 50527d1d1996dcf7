//! Demultiplexing of datagrams read from the tun device.

use tracing::{debug, trace, warn};
use tunguard_packet::icmp::IcmpEcho;
use tunguard_packet::ipv4::Ipv4Packet;
use tunguard_packet::tcp::{TcpFlags, TcpSegment};
use tunguard_packet::udp::UdpPacket;
use tunguard_packet::{
    IpPacket, IpVersion, PacketError, IPPROTO_ESP, IPPROTO_HOPOPTS,
};

use crate::engine::Context;
use crate::flow::{FlowKey, Protocol};
use crate::host::{Direction, FlowDescriptor, PacketRecord, Verdict};
use crate::session::SessionTable;
use crate::{icmp, tcp, udp};

const IPPROTO_IGMP: u8 = 2;

enum Transport<'a> {
    Icmp(IcmpEcho<'a>),
    Udp(UdpPacket<'a>),
    Tcp(TcpSegment<'a>),
}

impl Transport<'_> {
    /// Ports used for owner lookup and telemetry; ICMP reports its echo identifier.
    fn ports(&self) -> (u16, u16) {
        match self {
            Transport::Icmp(echo) => (echo.identifier(), echo.identifier()),
            Transport::Udp(udp) => (udp.src_port(), udp.dst_port()),
            Transport::Tcp(seg) => (seg.src_port(), seg.dst_port()),
        }
    }
}

/// TCP flags in the `SAPFR` notation used by packet records.
pub(crate) fn flag_string(flags: TcpFlags) -> String {
    [
        (TcpFlags::SYN, 'S'),
        (TcpFlags::ACK, 'A'),
        (TcpFlags::PSH, 'P'),
        (TcpFlags::FIN, 'F'),
        (TcpFlags::RST, 'R'),
    ]
    .iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, c)| *c)
    .collect()
}

fn drop_malformed(ctx: &Context, len: usize, err: PacketError) {
    match err {
        PacketError::Unsupported(what) => {
            debug!(len, "unsupported packet: {what}");
            ctx.metrics.packet_unsupported();
        }
        err => {
            warn!(len, "malformed packet: {err}");
            ctx.metrics.packet_malformed();
        }
    }
}

/// Process one datagram from the tun device.
pub(crate) fn handle_packet(ctx: &mut Context, table: &mut SessionTable, packet: &[u8]) {
    ctx.metrics.packet_rx(packet.len());

    let ip = match IpPacket::parse(packet) {
        Ok(ip) => ip,
        Err(err) => return drop_malformed(ctx, packet.len(), err),
    };
    if ip.version == IpVersion::V4 {
        if ip.bytes.len() != packet.len() {
            warn!(len = packet.len(), total = ip.bytes.len(), "IPv4 length mismatch");
            ctx.metrics.packet_malformed();
            return;
        }
        if ctx.config.verify_checksums
            && !Ipv4Packet::parse(packet).is_ok_and(|hdr| hdr.header_checksum_valid())
        {
            warn!(src = %ip.src, dst = %ip.dst, "invalid IPv4 header checksum");
            ctx.metrics.packet_malformed();
            return;
        }
    }
    if ip.fragmented {
        warn!(src = %ip.src, dst = %ip.dst, "dropping IP fragment");
        ctx.metrics.packet_unsupported();
        return;
    }

    let Some(protocol) = Protocol::from_number(ip.protocol) else {
        if matches!(ip.protocol, IPPROTO_HOPOPTS | IPPROTO_IGMP | IPPROTO_ESP) {
            trace!(protocol = ip.protocol, "ignoring protocol");
        } else {
            warn!(protocol = ip.protocol, src = %ip.src, dst = %ip.dst, "unknown protocol");
        }
        ctx.metrics.packet_unsupported();
        return;
    };

    let parsed = match protocol {
        Protocol::Icmp => IcmpEcho::parse(ip.payload).map(Transport::Icmp),
        Protocol::Udp => UdpPacket::parse(ip.payload).map(Transport::Udp),
        Protocol::Tcp => TcpSegment::parse(ip.payload).map(Transport::Tcp),
    };
    let transport = match parsed {
        Ok(transport) => transport,
        Err(err) => return drop_malformed(ctx, packet.len(), err),
    };
    let (sport, dport) = transport.ports();

    let key = match &transport {
        Transport::Icmp(_) => FlowKey::icmp(ip.src, ip.dst),
        _ => FlowKey {
            protocol,
            version: ip.version,
            src: ip.src,
            sport,
            dst: ip.dst,
            dport,
        },
    };

    let (flags, data) = match &transport {
        Transport::Icmp(echo) => (
            String::new(),
            format!("type {}/{}", echo.icmp_type(), echo.code()),
        ),
        Transport::Tcp(seg) => (flag_string(seg.flags()), String::new()),
        Transport::Udp(_) => (String::new(), String::new()),
    };
    trace!(flow = %key, %flags, len = packet.len(), "from tun");

    if let Transport::Icmp(echo) = &transport {
        if !echo.is_echo_request() {
            warn!(flow = %key, kind = echo.icmp_type(), code = echo.code(), "ICMP type not supported");
            ctx.metrics.packet_unsupported();
            return;
        }
    }

    let existing = table.find(&key);
    let live_existing = existing
        .and_then(|id| table.get(id))
        .is_some_and(|session| session.is_live());
    let syn = matches!(&transport, Transport::Tcp(seg) if seg.flags().contains(TcpFlags::SYN));
    let dns_unpoliced = protocol == Protocol::Udp && dport == 53 && !ctx.config.forward_dns;
    let known_udp = protocol == Protocol::Udp && (existing.is_some() || dns_unpoliced);

    // Packets that would start a flow need a permission check.
    let starts_flow = match protocol {
        Protocol::Icmp => !live_existing,
        Protocol::Udp => !known_udp,
        Protocol::Tcp => syn && existing.is_none(),
    };

    if starts_flow {
        let live = table.counts().total();
        if live >= ctx.max_sessions {
            warn!(flow = %key, live, max = ctx.max_sessions, "session limit reached, dropping");
            ctx.metrics.capacity_dropped();
            return;
        }
    }

    let uid = if starts_flow || protocol == Protocol::Icmp {
        let now = ctx.now();
        ctx.uids.resolve(protocol, ip.src, sport, ip.dst, dport, now)
    } else {
        None
    };

    let verdict = if known_udp
        || (protocol == Protocol::Tcp && (existing.is_some() || !syn))
        || (syn && uid == Some(0) && dport == 53)
    {
        Verdict::Allowed(None)
    } else {
        let verdict = ctx.host.is_address_allowed(&FlowDescriptor {
            protocol,
            version: ip.version,
            src: ip.src,
            sport,
            dst: ip.dst,
            dport,
            uid,
            server_name: None,
        });
        ctx.host.log_packet(&PacketRecord {
            direction: Direction::Outbound,
            version: ip.version,
            protocol,
            flags,
            src: ip.src,
            sport,
            dst: ip.dst,
            dport,
            data,
            uid,
            allowed: verdict.is_allowed(),
        });
        verdict
    };

    let ctx = &*ctx;
    match transport {
        Transport::Icmp(echo) => {
            if verdict.is_allowed() {
                icmp::forward_echo(ctx, table, key, uid, &echo);
            } else {
                warn!(flow = %key, uid = ?uid, "ICMP not allowed");
                ctx.metrics.policy_denied();
            }
        }
        Transport::Udp(datagram) => {
            if verdict.is_allowed() {
                udp::forward_datagram(ctx, table, key, uid, verdict, datagram.payload());
            } else {
                warn!(flow = %key, uid = ?uid, "UDP not allowed");
                ctx.metrics.policy_denied();
                udp::block(ctx, table, key, uid);
            }
        }
        Transport::Tcp(seg) => {
            if let Some(session) = existing.and_then(|id| table.get_mut(id)) {
                tcp::handle_segment(ctx, session, &seg);
            } else if !syn {
                debug!(flow = %key, flags = %seg.flags(), "segment for unknown flow");
                tcp::reset_stateless(ctx, &key, &seg);
            } else if verdict.is_allowed() {
                tcp::open(ctx, table, key, &seg, uid, verdict);
            } else {
                warn!(flow = %key, uid = ?uid, "TCP not allowed");
                ctx.metrics.policy_denied();
                tcp::reset_stateless(ctx, &key, &seg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;

    use tunguard_packet::tcp::TcpSegmentBuilder;
    use tunguard_packet::udp::UdpPacketBuilder;
    use tunguard_packet::{IpPacketBuilder, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

    use super::*;
    use crate::engine::test_context;
    use crate::policy::{IpCidr, StaticPolicy};
    use crate::session::{FlowState, Session};
    use crate::tcp::{TcpFlow, TcpState};
    use crate::udp::UdpState;

    const CLIENT: &str = "10.1.10.2";

    fn ip(dst: &str, protocol: u8, payload: &[u8]) -> Vec<u8> {
        IpPacketBuilder {
            src: CLIENT.parse().unwrap(),
            dst: dst.parse().unwrap(),
            protocol,
            payload,
        }
        .build_vec()
        .unwrap()
    }

    fn tcp(dst: &str, dport: u16, seq: u32, ack: u32, flags: TcpFlags) -> Vec<u8> {
        let seg = TcpSegmentBuilder::new(40000, dport, seq, ack, flags)
            .window_size(65535)
            .build_vec(CLIENT.parse().unwrap(), dst.parse().unwrap())
            .unwrap();
        ip(dst, IPPROTO_TCP, &seg)
    }

    fn udp(dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
        let datagram = UdpPacketBuilder {
            src_port: 41000,
            dst_port: dport,
            payload,
        }
        .build_vec(CLIENT.parse().unwrap(), dst.parse().unwrap())
        .unwrap();
        ip(dst, IPPROTO_UDP, &datagram)
    }

    fn echo(dst: &str, kind: u8) -> Vec<u8> {
        let mut msg = vec![kind, 0, 0, 0, 0, 7, 0, 1];
        let csum = tunguard_packet::checksum::internet_checksum(&msg);
        msg[2..4].copy_from_slice(&csum.to_be_bytes());
        ip(dst, IPPROTO_ICMP, &msg)
    }

    fn deny(cidr: &str) -> Arc<StaticPolicy> {
        Arc::new(StaticPolicy {
            deny_ips: vec![cidr.parse::<IpCidr>().unwrap()],
            ..StaticPolicy::default()
        })
    }

    fn reply(tun: &UnixDatagram) -> (IpAddr, TcpFlags, u32, u32) {
        let mut buf = [0u8; 2048];
        let len = tun.recv(&mut buf).unwrap();
        let packet = IpPacket::parse(&buf[..len]).unwrap();
        let seg = TcpSegment::parse(packet.payload).unwrap();
        (packet.dst, seg.flags(), seg.seq_number(), seg.ack_number())
    }

    #[test]
    fn flags_use_sapfr_notation() {
        assert_eq!(flag_string(TcpFlags::SYN | TcpFlags::ACK), "SA");
        assert_eq!(flag_string(TcpFlags::FIN | TcpFlags::PSH | TcpFlags::ACK), "APF");
        assert_eq!(flag_string(TcpFlags::empty()), "");
    }

    #[test]
    fn malformed_and_unsupported_packets_are_counted() {
        let (mut ctx, _tun) = test_context(Arc::new(StaticPolicy::default()));
        let mut table = SessionTable::new();

        handle_packet(&mut ctx, &mut table, &[0x45, 0, 0]);
        handle_packet(&mut ctx, &mut table, &[0x75; 40]);

        let mut padded = udp("192.0.2.1", 9, b"x");
        padded.push(0);
        handle_packet(&mut ctx, &mut table, &padded);

        let mut gre = ip("192.0.2.1", 47, &[0; 8]);
        handle_packet(&mut ctx, &mut table, &gre);

        // More-fragments bit.
        gre = udp("192.0.2.1", 9, b"x");
        gre[6] = 0x20;
        handle_packet(&mut ctx, &mut table, &gre);

        handle_packet(&mut ctx, &mut table, &echo("192.0.2.1", 13));

        let snapshot = ctx.metrics.snapshot();
        assert_eq!(snapshot.packets_rx_total, 6);
        assert_eq!(snapshot.packets_malformed_total, 2);
        assert_eq!(snapshot.packets_unsupported_total, 4);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn bad_header_checksums_are_dropped_when_verifying() {
        let (mut ctx, _tun) = test_context(deny("0.0.0.0/0"));
        ctx.config.verify_checksums = true;
        let mut table = SessionTable::new();

        let mut packet = udp("192.0.2.1", 9, b"x");
        packet[10] ^= 0xff;
        handle_packet(&mut ctx, &mut table, &packet);
        assert_eq!(ctx.metrics.snapshot().packets_malformed_total, 1);
        assert_eq!(table.len(), 0);

        handle_packet(&mut ctx, &mut table, &udp("192.0.2.1", 9, b"x"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_tcp_flows_are_reset() {
        let (mut ctx, tun) = test_context(Arc::new(StaticPolicy::default()));
        let mut table = SessionTable::new();

        handle_packet(
            &mut ctx,
            &mut table,
            &tcp("93.184.216.34", 80, 1000, 777, TcpFlags::ACK),
        );
        let (dst, flags, seq, ack) = reply(&tun);
        assert_eq!(dst, CLIENT.parse::<IpAddr>().unwrap());
        assert_eq!(flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!((seq, ack), (777, 1000));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn blocked_syn_gets_reset_without_a_session() {
        let (mut ctx, tun) = test_context(deny("93.184.216.0/24"));
        let mut table = SessionTable::new();

        handle_packet(
            &mut ctx,
            &mut table,
            &tcp("93.184.216.34", 443, 5000, 0, TcpFlags::SYN),
        );
        let (_, flags, seq, ack) = reply(&tun);
        assert_eq!(flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!((seq, ack), (0, 5001));
        assert_eq!(table.len(), 0);
        assert_eq!(ctx.metrics.snapshot().policy_denied_total, 1);
    }

    #[test]
    fn blocked_udp_leaves_a_placeholder() {
        let (mut ctx, _tun) = test_context(deny("198.51.100.0/24"));
        let mut table = SessionTable::new();

        handle_packet(&mut ctx, &mut table, &udp("198.51.100.7", 443, b"quic"));
        handle_packet(&mut ctx, &mut table, &udp("198.51.100.7", 443, b"quic"));

        assert_eq!(table.len(), 1);
        let (_, session) = table.iter().next().unwrap();
        assert!(matches!(&session.state, FlowState::Udp(flow) if flow.state == UdpState::Blocked));
        assert_eq!(ctx.metrics.snapshot().policy_denied_total, 1);
    }

    #[test]
    fn blocked_icmp_is_dropped() {
        let (mut ctx, _tun) = test_context(deny("192.0.2.0/24"));
        let mut table = SessionTable::new();
        handle_packet(&mut ctx, &mut table, &echo("192.0.2.1", 8));
        assert_eq!(table.len(), 0);
        assert_eq!(ctx.metrics.snapshot().policy_denied_total, 1);
    }

    #[test]
    fn full_table_refuses_new_flows_only() {
        let (mut ctx, _tun) = test_context(Arc::new(StaticPolicy::default()));
        ctx.max_sessions = 1;
        let mut table = SessionTable::new();

        let key = FlowKey {
            protocol: Protocol::Udp,
            version: IpVersion::V4,
            src: CLIENT.parse().unwrap(),
            sport: 41000,
            dst: "192.0.2.1".parse().unwrap(),
            dport: 9,
        };
        udp::block(&ctx, &mut table, key, None);
        let id = table.find(&key).unwrap();
        if let Some(FlowState::Udp(flow)) = table.get_mut(id).map(|s| &mut s.state) {
            flow.state = UdpState::Active;
        }
        assert_eq!(table.counts().total(), 1);

        handle_packet(&mut ctx, &mut table, &echo("192.0.2.2", 8));
        handle_packet(
            &mut ctx,
            &mut table,
            &tcp("192.0.2.2", 80, 1, 0, TcpFlags::SYN),
        );
        handle_packet(&mut ctx, &mut table, &udp("192.0.2.2", 9, b"new"));
        assert_eq!(ctx.metrics.snapshot().capacity_dropped_total, 3);
        assert_eq!(table.len(), 1);

        // The existing flow keeps flowing.
        handle_packet(&mut ctx, &mut table, &udp("192.0.2.1", 9, b"more"));
        assert_eq!(ctx.metrics.snapshot().capacity_dropped_total, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn existing_tcp_sessions_skip_the_policy() {
        let (mut ctx, tun) = test_context(deny("0.0.0.0/0"));
        let mut table = SessionTable::new();
        let key = FlowKey {
            protocol: Protocol::Tcp,
            version: IpVersion::V4,
            src: CLIENT.parse().unwrap(),
            sport: 40000,
            dst: "93.184.216.34".parse().unwrap(),
            dport: 80,
        };
        let mut flow = TcpFlow::new(1000, 5000, 1460, 0, 65535);
        flow.state = TcpState::Close;
        table.insert(Session::new(key, None, 0, FlowState::Tcp(Box::new(flow))));

        handle_packet(
            &mut ctx,
            &mut table,
            &tcp("93.184.216.34", 80, 1000, 1, TcpFlags::ACK),
        );
        assert!(reply(&tun).1.contains(TcpFlags::RST));
        assert_eq!(ctx.metrics.snapshot().policy_denied_total, 0);
    }
}
