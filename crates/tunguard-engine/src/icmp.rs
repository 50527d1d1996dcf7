//! ICMP echo forwarding over unprivileged ping sockets.
//!
//! The kernel assigns its own echo identifier to every request sent through a ping socket,
//! so the client's identifier is remembered per session and written back into each reply.

use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};

use mio::Interest;
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, info, warn};
use tunguard_packet::icmp::{rewrite_echo_identifier, EchoChecksum, IcmpEcho};

use crate::config::{udp_max_message, ICMP_TIMEOUT, UDP_YIELD};
use crate::engine::Context;
use crate::flow::{FlowKey, Protocol};
use crate::session::{
    release_socket, remaining, scale_timeout, FlowState, Monitor, Session, SessionTable, Sweep,
};
use crate::Millis;

pub(crate) struct IcmpFlow {
    /// Identifier of the client's most recent request.
    pub id: u16,
    pub stop: bool,
}

impl IcmpFlow {
    pub(crate) fn new(id: u16) -> Self {
        Self { id, stop: false }
    }
}

fn echo_checksum(src: IpAddr, dst: IpAddr) -> EchoChecksum {
    match (src, dst) {
        (IpAddr::V6(src), IpAddr::V6(dst)) => EchoChecksum::V6 { src, dst },
        _ => EchoChecksum::V4,
    }
}

fn open_socket(ctx: &Context, key: &FlowKey) -> io::Result<Socket> {
    let (domain, protocol) = match key.dst {
        IpAddr::V4(_) => (Domain::IPV4, socket2::Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, socket2::Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    if !ctx.protect(&socket) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "host refused to protect socket",
        ));
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Forward an echo request from the client, opening a session for a new address pair.
pub(crate) fn forward_echo(
    ctx: &Context,
    table: &mut SessionTable,
    key: FlowKey,
    uid: Option<u32>,
    echo: &IcmpEcho<'_>,
) {
    let live = table.find(&key).filter(|id| {
        matches!(
            table.get(*id).map(|s| &s.state),
            Some(FlowState::Icmp(flow)) if !flow.stop
        )
    });
    let id = match live {
        Some(id) => id,
        None => {
            let socket = match open_socket(ctx, &key) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(flow = %key, "ICMP socket failed: {err}");
                    ctx.host
                        .report_error(2, &format!("ICMP socket for {} failed: {err}", key.dst));
                    return;
                }
            };
            let session = Session::new(
                key,
                uid,
                ctx.now(),
                FlowState::Icmp(IcmpFlow::new(echo.identifier())),
            );
            match table.insert_with_socket(session, socket, &ctx.registry, Interest::READABLE) {
                Ok(id) => {
                    info!(flow = %key, uid = ?uid, id = echo.identifier(), "new ICMP session");
                    ctx.metrics.session_opened(Protocol::Icmp);
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
    let FlowState::Icmp(flow) = &mut session.state else {
        return;
    };
    let Some(socket) = session.socket.as_ref() else {
        return;
    };

    session.time = ctx.now();
    flow.id = echo.identifier();

    let mut message = echo.as_bytes().to_vec();
    if let Err(err) =
        rewrite_echo_identifier(&mut message, !flow.id, echo_checksum(key.src, key.dst))
    {
        warn!(flow = %key, "ICMP rewrite failed: {err}");
        return;
    }
    debug!(
        flow = %key,
        id = flow.id,
        seq = echo.sequence(),
        len = message.len(),
        "ICMP forward"
    );

    let target = SockAddr::from(SocketAddr::new(key.dst, 0));
    match socket.send_to_with_flags(&message, &target, libc::MSG_NOSIGNAL) {
        Ok(sent) if sent == message.len() => {}
        Ok(sent) => warn!(flow = %key, sent, len = message.len(), "short ICMP send"),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            debug!(flow = %key, "ICMP send deferred: {err}");
        }
        Err(err) => {
            warn!(flow = %key, "ICMP send failed: {err}");
            flow.stop = true;
        }
    }
}

/// Relay pending echo replies back to the client.
pub(crate) fn service(ctx: &Context, session: &mut Session) {
    let Session {
        key,
        time,
        socket,
        ready,
        state: FlowState::Icmp(flow),
        ..
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
        warn!(flow = %key, "ICMP socket error: {err:?}");
        flow.stop = true;
        return;
    }

    let mut buf = vec![0u8; udp_max_message(key.version)];
    for _ in 0..UDP_YIELD {
        if flow.stop || !ready.readable {
            break;
        }
        let len = match socket.read(&mut buf) {
            Ok(0) => {
                warn!(flow = %key, "ICMP socket EOF");
                flow.stop = true;
                break;
            }
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                ready.readable = false;
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(flow = %key, "ICMP recv failed: {err}");
                flow.stop = true;
                break;
            }
        };
        *time = ctx.now();

        let reply = &mut buf[..len];
        if let Ok(echo) = IcmpEcho::parse(reply) {
            debug!(
                flow = %key,
                kind = echo.icmp_type(),
                code = echo.code(),
                id = echo.identifier(),
                seq = echo.sequence(),
                len,
                "ICMP reply"
            );
        }
        // Replies travel from the remote host to the client.
        if let Err(err) = rewrite_echo_identifier(reply, flow.id, echo_checksum(key.dst, key.src)) {
            warn!(flow = %key, len, "dropping short ICMP reply: {err}");
            continue;
        }
        let protocol = Protocol::Icmp.number(key.version);
        if let Err(err) = ctx.emit(key.dst, key.src, protocol, reply) {
            warn!(flow = %key, "ICMP tun write failed: {err}");
            flow.stop = true;
        }
    }
}

pub(crate) fn monitor(session: &Session) -> Monitor {
    let mut out = Monitor::default();
    if let FlowState::Icmp(flow) = &session.state {
        out.service = !flow.stop
            && session.socket.is_some()
            && (session.ready.readable || session.ready.error);
    }
    out
}

pub(crate) fn sweep(ctx: &Context, session: &mut Session, sessions: usize, now: Millis) -> Sweep {
    let timeout = scale_timeout(ICMP_TIMEOUT, sessions, ctx.max_sessions);
    let FlowState::Icmp(flow) = &session.state else {
        return Sweep::Remove;
    };
    if flow.stop || session.time + timeout < now {
        info!(
            flow = %session.key,
            idle_ms = now.saturating_sub(session.time),
            timeout,
            stop = flow.stop,
            "ICMP session done"
        );
        release_socket(
            &mut session.socket,
            &mut session.ready,
            &ctx.registry,
            &session.key,
        );
        return Sweep::Remove;
    }
    Sweep::Keep {
        deadline: remaining(session.time, timeout, now),
    }
}

/// Stop the session so the next sweep removes it.
pub(crate) fn stop(session: &mut Session) {
    if let FlowState::Icmp(flow) = &mut session.state {
        flow.stop = true;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;

    use tunguard_packet::checksum::{internet_checksum, transport_checksum};
    use tunguard_packet::icmp::{ICMPV6_ECHO_REPLY, ICMP_ECHO_REPLY};
    use tunguard_packet::{IpPacket, IPPROTO_ICMP, IPPROTO_ICMPV6};

    use super::*;
    use crate::engine::test_context;
    use crate::policy::StaticPolicy;

    fn echo(kind: u8, id: u16, seq: u16) -> Vec<u8> {
        let mut msg = vec![kind, 0, 0, 0];
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&seq.to_be_bytes());
        msg.extend_from_slice(b"abcdefgh");
        msg
    }

    /// A session whose "socket" is one end of a datagram pair.
    fn session_with_pair(key: FlowKey, id: u16) -> (Session, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut session = Session::new(key, Some(10123), 0, FlowState::Icmp(IcmpFlow::new(id)));
        session.socket = Some(Socket::from(OwnedFd::from(ours)));
        (session, theirs)
    }

    #[test]
    fn replies_get_the_client_identifier_back() {
        let (ctx, tun) = test_context(Arc::new(StaticPolicy::default()));
        let key = FlowKey::icmp("10.1.10.2".parse().unwrap(), "1.1.1.1".parse().unwrap());
        let (mut session, remote) = session_with_pair(key, 0x4242);

        remote.send(&echo(ICMP_ECHO_REPLY, 0x0017, 3)).unwrap();
        session.ready.readable = true;
        service(&ctx, &mut session);

        let mut buf = [0u8; 256];
        let len = tun.recv(&mut buf).unwrap();
        let ip = IpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(ip.protocol, IPPROTO_ICMP);
        assert_eq!(ip.src, key.dst);
        assert_eq!(ip.dst, key.src);
        let reply = IcmpEcho::parse(ip.payload).unwrap();
        assert_eq!(reply.identifier(), 0x4242);
        assert_eq!(reply.sequence(), 3);
        assert_eq!(internet_checksum(ip.payload), 0);

        assert!(!session.ready.readable);
        assert!(!monitor(&session).service);
        assert!(matches!(&session.state, FlowState::Icmp(flow) if !flow.stop));
    }

    #[test]
    fn ipv6_replies_use_the_pseudo_header() {
        let (ctx, tun) = test_context(Arc::new(StaticPolicy::default()));
        let client: Ipv6Addr = "fd00::2".parse().unwrap();
        let remote_ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let key = FlowKey::icmp(client.into(), remote_ip.into());
        let (mut session, remote) = session_with_pair(key, 7);

        remote.send(&echo(ICMPV6_ECHO_REPLY, 99, 1)).unwrap();
        session.ready.readable = true;
        service(&ctx, &mut session);

        let mut buf = [0u8; 256];
        let len = tun.recv(&mut buf).unwrap();
        let ip = IpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(ip.protocol, IPPROTO_ICMPV6);
        assert_eq!(IcmpEcho::parse(ip.payload).unwrap().identifier(), 7);
        assert_eq!(
            transport_checksum(ip.src, ip.dst, IPPROTO_ICMPV6, ip.payload),
            0
        );
    }

    #[test]
    fn socket_errors_stop_the_session() {
        let (ctx, _tun) = test_context(Arc::new(StaticPolicy::default()));
        let key = FlowKey::icmp("10.1.10.2".parse().unwrap(), "1.1.1.1".parse().unwrap());
        let (mut session, _remote) = session_with_pair(key, 1);
        session.ready.error = true;
        assert!(monitor(&session).service);
        service(&ctx, &mut session);
        assert!(!session.is_live());
        assert_eq!(sweep(&ctx, &mut session, 0, 1), Sweep::Remove);
        assert!(session.socket.is_none());
    }

    #[test]
    fn idle_sessions_expire_sooner_under_load() {
        let (ctx, _tun) = test_context(Arc::new(StaticPolicy::default()));
        let key = FlowKey::icmp("10.1.10.2".parse().unwrap(), "1.1.1.1".parse().unwrap());
        let mut session = Session::new(key, None, 1_000, FlowState::Icmp(IcmpFlow::new(1)));

        assert_eq!(
            sweep(&ctx, &mut session, 0, 2_000),
            Sweep::Keep {
                deadline: Some(ICMP_TIMEOUT - 1_000 + 1)
            }
        );
        let half = ctx.max_sessions / 2;
        let scaled = scale_timeout(ICMP_TIMEOUT, half, ctx.max_sessions);
        assert!(scaled < ICMP_TIMEOUT);
        assert_eq!(
            sweep(&ctx, &mut session, half, 1_000 + scaled + 1),
            Sweep::Remove
        );
    }
}
