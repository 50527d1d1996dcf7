//! UDP forwarding: one connected-less outbound socket per 5-tuple.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use mio::Interest;
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, info, warn};
use tunguard_packet::dhcp::{
    DhcpMessage, DhcpOfferAckBuilder, DHCP_CLIENT_PORT, DHCP_SERVER_PORT,
};
use tunguard_packet::udp::UdpPacketBuilder;
use tunguard_packet::IPPROTO_UDP;

use crate::config::{udp_max_message, UDP_KEEP_TIMEOUT, UDP_TIMEOUT_53, UDP_TIMEOUT_ANY, UDP_YIELD};
use crate::dns;
use crate::engine::Context;
use crate::flow::{FlowKey, Protocol};
use crate::host::{UsageRecord, Verdict};
use crate::session::{
    release_socket, remaining, scale_timeout, FlowState, Monitor, Session, SessionTable, Sweep,
};
use crate::Millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UdpState {
    Active,
    /// Socket to be closed on the next sweep.
    Finishing,
    Closed,
    /// Refused by policy; repeats are dropped without asking again.
    Blocked,
}

pub(crate) struct UdpFlow {
    pub state: UdpState,
    /// Where datagrams are sent: the original destination or its redirect.
    target: SocketAddr,
    max_message: usize,
    sent: u64,
    received: u64,
}

impl UdpFlow {
    pub(crate) fn new(state: UdpState, target: SocketAddr) -> Self {
        Self {
            state,
            target,
            max_message: udp_max_message(tunguard_packet::IpVersion::of(&target.ip())),
            sent: 0,
            received: 0,
        }
    }
}

fn timeout_for(key: &FlowKey) -> Millis {
    if key.dport == 53 {
        UDP_TIMEOUT_53
    } else {
        UDP_TIMEOUT_ANY
    }
}

fn open_socket(ctx: &Context, key: &FlowKey, target: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(target),
        Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if !ctx.protect(&socket) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "host refused to protect socket",
        ));
    }
    socket.set_nonblocking(true)?;

    match key.dst {
        IpAddr::V4(dst) if dst == Ipv4Addr::BROADCAST => {
            debug!(flow = %key, "broadcast");
            if let Err(err) = socket.set_broadcast(true) {
                warn!(flow = %key, "SO_BROADCAST: {err}");
            }
        }
        IpAddr::V6(dst) if dst.is_multicast() => {
            debug!(flow = %key, "multicast");
            if let Err(err) = socket.set_multicast_loop_v6(true) {
                warn!(flow = %key, "IPV6_MULTICAST_LOOP: {err}");
            }
            if let Err(err) = socket.join_multicast_v6(&dst, 0) {
                warn!(flow = %key, "IPV6_ADD_MEMBERSHIP: {err}");
            }
        }
        _ => {}
    }
    Ok(socket)
}

/// Record a refused flow so repeats are recognised without another policy query.
pub(crate) fn block(ctx: &Context, table: &mut SessionTable, key: FlowKey, uid: Option<u32>) {
    info!(flow = %key, uid = ?uid, "UDP flow blocked");
    let target = SocketAddr::new(key.dst, key.dport);
    table.insert(Session::new(
        key,
        uid,
        ctx.now(),
        FlowState::Udp(UdpFlow::new(UdpState::Blocked, target)),
    ));
}

/// Answer a DHCP DISCOVER or REQUEST from the configured lease. Returns whether a reply was
/// written.
pub(crate) fn answer_dhcp(ctx: &Context, key: &FlowKey, payload: &[u8]) -> bool {
    if key.sport != DHCP_CLIENT_PORT && key.dport != DHCP_SERVER_PORT {
        return false;
    }
    let Ok(request) = DhcpMessage::parse(payload) else {
        return false;
    };
    let Some(builder) = DhcpOfferAckBuilder::for_request(&request, ctx.config.dhcp) else {
        return false;
    };
    let reply = builder.build_vec();
    let server = IpAddr::V4(ctx.config.dhcp.server);
    let broadcast = IpAddr::V4(Ipv4Addr::BROADCAST);
    let datagram = UdpPacketBuilder {
        src_port: DHCP_SERVER_PORT,
        dst_port: DHCP_CLIENT_PORT,
        payload: &reply,
    }
    .build_vec(server, broadcast);
    let written = match datagram {
        Ok(datagram) => ctx.emit(server, broadcast, IPPROTO_UDP, &datagram),
        Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
    };
    match written {
        Ok(()) => {
            info!(
                flow = %key,
                xid = request.xid(),
                kind = builder.message_type,
                "DHCP reply"
            );
            ctx.metrics.dhcp_reply();
            true
        }
        Err(err) => {
            warn!(flow = %key, "DHCP reply failed: {err}");
            false
        }
    }
}

/// Forward a datagram from the client, opening a session for a new 5-tuple.
pub(crate) fn forward_datagram(
    ctx: &Context,
    table: &mut SessionTable,
    key: FlowKey,
    uid: Option<u32>,
    verdict: Verdict,
    payload: &[u8],
) {
    if answer_dhcp(ctx, &key, payload) {
        return;
    }

    let id = match table.find(&key) {
        Some(id) => id,
        None => {
            let target = verdict
                .redirect()
                .unwrap_or_else(|| SocketAddr::new(key.dst, key.dport));
            let socket = match open_socket(ctx, &key, target) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(flow = %key, %target, "UDP socket failed: {err}");
                    ctx.host
                        .report_error(3, &format!("UDP socket for {target} failed: {err}"));
                    return;
                }
            };
            let session = Session::new(
                key,
                uid,
                ctx.now(),
                FlowState::Udp(UdpFlow::new(UdpState::Active, target)),
            );
            match table.insert_with_socket(session, socket, &ctx.registry, Interest::READABLE) {
                Ok(id) => {
                    info!(flow = %key, %target, uid = ?uid, "new UDP session");
                    ctx.metrics.session_opened(Protocol::Udp);
                    id
                }
                Err(err) => {
                    warn!(flow = %key, "socket registration failed: {err}");
                    return;
                }
            }
        }
    };
    let Some(session) = table.get_mut(id) else {
        return;
    };
    let FlowState::Udp(flow) = &mut session.state else {
        return;
    };
    if flow.state != UdpState::Active {
        debug!(flow = %key, state = ?flow.state, "dropping datagram for inactive session");
        return;
    }
    let Some(socket) = session.socket.as_ref() else {
        return;
    };

    session.time = ctx.now();
    debug!(flow = %key, target = %flow.target, len = payload.len(), "UDP forward");
    let target = SockAddr::from(flow.target);
    match socket.send_to_with_flags(payload, &target, libc::MSG_NOSIGNAL) {
        Ok(sent) => flow.sent += sent as u64,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            debug!(flow = %key, "UDP send deferred: {err}");
        }
        Err(err) => {
            warn!(flow = %key, "UDP send failed: {err}");
            flow.state = UdpState::Finishing;
        }
    }
}

/// Relay pending datagrams from the outbound socket to the client.
pub(crate) fn service(ctx: &Context, session: &mut Session) {
    let Session {
        key,
        uid,
        time,
        socket,
        ready,
        state: FlowState::Udp(flow),
    } = session
    else {
        return;
    };
    let Some(mut socket) = socket.as_ref() else {
        return;
    };

    if ready.error {
        ready.error = false;
        *time = ctx.now();
        let err = socket.take_error().ok().flatten();
        warn!(flow = %key, "UDP socket error: {err:?}");
        flow.state = UdpState::Finishing;
        return;
    }

    let mut buf = vec![0u8; flow.max_message];
    for _ in 0..UDP_YIELD {
        if flow.state != UdpState::Active || !ready.readable {
            break;
        }
        let mut len = match socket.read(&mut buf) {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                ready.readable = false;
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(flow = %key, "UDP recv failed: {err}");
                flow.state = UdpState::Finishing;
                break;
            }
        };
        *time = ctx.now();
        flow.received += len as u64;
        debug!(flow = %key, len, "UDP reply");

        if key.dport == 53 {
            if let Some(blocked) = dns::inspect_response(ctx, key, *uid, &mut buf[..len]) {
                len = blocked;
            }
        }

        let datagram = UdpPacketBuilder {
            src_port: key.dport,
            dst_port: key.sport,
            payload: &buf[..len],
        }
        .build_vec(key.dst, key.src);
        let written = match datagram {
            Ok(datagram) => ctx.emit(key.dst, key.src, IPPROTO_UDP, &datagram),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
        };
        if let Err(err) = written {
            warn!(flow = %key, "UDP tun write failed: {err}");
            flow.state = UdpState::Finishing;
            break;
        }

        // One answer per lookup; release the descriptor early.
        if key.dport == 53 {
            flow.state = UdpState::Finishing;
        }
    }
}

pub(crate) fn monitor(session: &Session) -> Monitor {
    let mut out = Monitor::default();
    if let FlowState::Udp(flow) = &session.state {
        out.service = flow.state == UdpState::Active
            && session.socket.is_some()
            && (session.ready.readable || session.ready.error);
    }
    out
}

pub(crate) fn sweep(ctx: &Context, session: &mut Session, sessions: usize, now: Millis) -> Sweep {
    let key = session.key;
    let timeout = scale_timeout(timeout_for(&key), sessions, ctx.max_sessions);
    let FlowState::Udp(flow) = &mut session.state else {
        return Sweep::Remove;
    };

    if flow.state == UdpState::Active && session.time + timeout < now {
        warn!(flow = %key, idle_ms = now - session.time, timeout, "UDP idle");
        flow.state = UdpState::Finishing;
    }

    if flow.state == UdpState::Finishing {
        info!(flow = %key, "UDP close");
        release_socket(&mut session.socket, &mut session.ready, &ctx.registry, &key);
        session.time = now;
        flow.state = UdpState::Closed;
    }

    if flow.state == UdpState::Closed && (flow.sent > 0 || flow.received > 0) {
        ctx.host.account_usage(&UsageRecord {
            version: key.version,
            protocol: Protocol::Udp,
            dst: key.dst,
            dport: key.dport,
            uid: session.uid,
            sent: flow.sent,
            received: flow.received,
        });
        flow.sent = 0;
        flow.received = 0;
    }

    match flow.state {
        UdpState::Active => Sweep::Keep {
            deadline: remaining(session.time, timeout, now),
        },
        _ if session.time + UDP_KEEP_TIMEOUT < now => Sweep::Remove,
        _ => Sweep::Keep {
            deadline: remaining(session.time, UDP_KEEP_TIMEOUT, now),
        },
    }
}

/// Stop forwarding an active flow; returns true for blocked placeholders, which the caller
/// drops outright.
pub(crate) fn finish(session: &mut Session) -> bool {
    let FlowState::Udp(flow) = &mut session.state else {
        return false;
    };
    match flow.state {
        UdpState::Active => {
            flow.state = UdpState::Finishing;
            false
        }
        UdpState::Blocked => true,
        _ => false,
    }
}
