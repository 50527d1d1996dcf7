//! TCP termination: the client's connection is terminated here and its byte stream is
//! replayed over an ordinary outbound socket.
//!
//! Sequence numbers toward the client are our own (`local_seq`, random ISN); sequence numbers
//! from the client (`remote_seq`) advance only as bytes are written to the outbound socket, so
//! every ACK we send acknowledges data that has really left the engine.

mod queue;
mod socks5;
mod state;

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use mio::Interest;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, trace, warn};
use tunguard_packet::tcp::{TcpFlags, TcpOptions, TcpSegment, TcpSegmentBuilder, MAX_WINDOW_SCALE};
use tunguard_packet::{tls, IPPROTO_TCP};

use crate::config::{
    MIN_CHECK_INTERVAL, SEND_BUF_DEFAULT, TCP_CLOSE_TIMEOUT, TCP_HEADER_MARGIN, TCP_IDLE_TIMEOUT,
    TCP_INIT_TIMEOUT, TCP_KEEP_TIMEOUT,
};
use crate::dns;
use crate::engine::Context;
use crate::flow::{FlowKey, Protocol};
use crate::host::{FlowDescriptor, UsageRecord, Verdict};
use crate::session::{
    release_socket, remaining, scale_timeout, FlowState, Monitor, Readiness, Session,
    SessionTable, Sweep,
};
use crate::sys;
use crate::Millis;

use queue::{seq_before, ForwardQueue, Pending};
pub(crate) use state::Socks5Phase;
pub use state::TcpState;

pub(crate) struct TcpFlow {
    pub state: TcpState,
    socks5: Socks5Phase,
    via_socks5: bool,
    /// Segment size the client accepts.
    mss: u16,
    recv_scale: u8,
    send_scale: u8,
    /// Window we advertise, in bytes.
    recv_window: u32,
    /// Window the client advertised, in bytes.
    send_window: u32,
    /// Data segments sent since the client's last segment.
    unconfirmed: u32,
    remote_seq: u32,
    local_seq: u32,
    remote_start: u32,
    local_start: u32,
    acked: u32,
    /// Sequence number of the client's FIN, once seen.
    remote_fin: Option<u32>,
    fin_confirmed: bool,
    last_keep_alive: Millis,
    sni_checked: bool,
    sent: u64,
    received: u64,
    forward: ForwardQueue,
}

impl TcpFlow {
    pub(crate) fn new(remote_isn: u32, local_isn: u32, mss: u16, scale: u8, window: u16) -> Self {
        let scale = scale.min(MAX_WINDOW_SCALE);
        Self {
            state: TcpState::Listen,
            socks5: Socks5Phase::None,
            via_socks5: false,
            mss,
            recv_scale: scale,
            send_scale: scale,
            recv_window: 0,
            // Window fields on SYN segments are never scaled.
            send_window: u32::from(window),
            unconfirmed: 0,
            remote_seq: remote_isn,
            local_seq: local_isn,
            remote_start: remote_isn,
            local_start: local_isn,
            acked: 0,
            remote_fin: None,
            fin_confirmed: false,
            last_keep_alive: 0,
            sni_checked: false,
            sent: 0,
            received: 0,
            forward: ForwardQueue::default(),
        }
    }

    /// Bytes we may still send toward the client.
    fn send_window(&self) -> u32 {
        let in_flight = u64::from(self.local_seq.wrapping_sub(self.acked));
        let headers = (u64::from(self.unconfirmed) + 1) * u64::from(TCP_HEADER_MARGIN);
        u64::from(self.send_window).saturating_sub(in_flight + headers) as u32
    }

    /// Window to advertise: free outbound send buffer, capped by what the scale can express,
    /// minus data still queued.
    fn receive_window(&self, socket: &Socket) -> u32 {
        let max = 0xFFFFu32 << self.recv_scale;
        let window = receive_buffer(socket).min(max);
        window.saturating_sub(self.forward.unsent_bytes(self.remote_seq) as u32)
    }

    fn set_state(&mut self, key: &FlowKey, next: TcpState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition(next) {
            tracing::error!(flow = %key, from = %self.state, to = %next, "invalid TCP transition");
            return;
        }
        debug!(flow = %key, from = %self.state, to = %next, "state");
        self.state = next;
    }

    /// Record the client's FIN as received once every byte before it has been forwarded.
    fn confirm_remote_fin(&mut self) -> bool {
        match self.remote_fin {
            Some(fin) if !self.fin_confirmed && self.remote_seq == fin => {
                self.remote_seq = fin.wrapping_add(1);
                self.fin_confirmed = true;
                true
            }
            _ => false,
        }
    }

    fn write(&self, ctx: &Context, key: &FlowKey, flags: TcpFlags, payload: &[u8]) -> io::Result<()> {
        let syn = flags.contains(TcpFlags::SYN);
        let syn_options = TcpOptions::syn_ack_block(ctx.config.mss(key.version), self.recv_scale);
        let options: &[u8] = if syn { &syn_options } else { &[] };
        let scale = if syn { 0 } else { self.recv_scale };
        let window = (self.recv_window >> scale).min(0xFFFF) as u16;
        let segment = TcpSegmentBuilder::new(
            key.dport,
            key.sport,
            self.local_seq,
            self.remote_seq,
            flags,
        )
        .window_size(window)
        .options(options)
        .payload(payload)
        .build_vec(key.dst, key.src)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        trace!(
            flow = %key,
            %flags,
            seq = self.local_seq.wrapping_sub(self.local_start),
            ack = self.remote_seq.wrapping_sub(self.remote_start),
            len = payload.len(),
            window,
            "to client"
        );
        ctx.emit(key.dst, key.src, IPPROTO_TCP, &segment)
    }

    /// Write a segment, moving the flow to `Closing` when the tun write fails.
    fn send(&mut self, ctx: &Context, key: &FlowKey, flags: TcpFlags, payload: &[u8]) -> bool {
        match self.write(ctx, key, flags, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(flow = %key, %flags, "tun write failed: {err}");
                self.set_state(key, TcpState::Closing);
                false
            }
        }
    }

    fn write_rst(&mut self, ctx: &Context, key: &FlowKey) {
        let mut flags = TcpFlags::RST;
        if self.state == TcpState::Listen {
            // The client's SYN was never acknowledged.
            flags = flags | TcpFlags::ACK;
            self.remote_seq = self.remote_seq.wrapping_add(1);
        }
        if let Err(err) = self.write(ctx, key, flags, &[]) {
            warn!(flow = %key, "RST write failed: {err}");
        }
        ctx.metrics.tcp_reset();
        if self.state != TcpState::Close {
            self.set_state(key, TcpState::Closing);
        }
    }

    fn advance_connect(
        &mut self,
        ctx: &Context,
        key: &FlowKey,
        socket: &Socket,
        ready: &mut Readiness,
        time: &mut Millis,
        now: Millis,
    ) {
        match self.socks5 {
            Socks5Phase::None => {
                if !ready.writable {
                    return;
                }
                match socket.take_error() {
                    Ok(None) => {}
                    Ok(Some(err)) | Err(err) => {
                        warn!(flow = %key, "connect failed: {err}");
                        self.write_rst(ctx, key);
                        return;
                    }
                }
                info!(flow = %key, relay = self.via_socks5, "connected");
                if self.via_socks5 {
                    self.socks5 = Socks5Phase::Hello;
                    if !self.send_to_relay(ctx, key, socket, &socks5::hello()) {
                        return;
                    }
                } else {
                    self.socks5 = Socks5Phase::Connected;
                }
            }
            Socks5Phase::Hello | Socks5Phase::Auth | Socks5Phase::Connect => {
                if !ready.readable {
                    return;
                }
                let mut reply = [0u8; 262];
                let len = match read_socket(socket, &mut reply) {
                    Ok(0) => {
                        warn!(flow = %key, phase = ?self.socks5, "relay closed during handshake");
                        self.write_rst(ctx, key);
                        return;
                    }
                    Ok(len) => len,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        ready.readable = false;
                        return;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
                    Err(err) => {
                        warn!(flow = %key, phase = ?self.socks5, "relay read failed: {err}");
                        self.write_rst(ctx, key);
                        return;
                    }
                };
                debug!(flow = %key, phase = ?self.socks5, "relay reply {:02x?}", &reply[..len]);
                match socks5::on_reply(self.socks5, &reply[..len]) {
                    Ok(next) => self.socks5 = next,
                    Err(err) => {
                        warn!(flow = %key, "SOCKS5 handshake failed: {err}");
                        self.write_rst(ctx, key);
                        return;
                    }
                }
                let request = match (self.socks5, &ctx.config.socks5) {
                    (Socks5Phase::Auth, Some(relay)) => {
                        socks5::auth_request(&relay.username, &relay.password)
                    }
                    (Socks5Phase::Connect, _) => {
                        socks5::connect_request(SocketAddr::new(key.dst, key.dport))
                    }
                    _ => Vec::new(),
                };
                if !request.is_empty() && !self.send_to_relay(ctx, key, socket, &request) {
                    return;
                }
            }
            Socks5Phase::Connected => {}
        }

        if self.socks5 == Socks5Phase::Connected {
            self.remote_seq = self.remote_seq.wrapping_add(1);
            self.recv_window = self.receive_window(socket);
            if self.send(ctx, key, TcpFlags::SYN | TcpFlags::ACK, &[]) {
                *time = now;
                self.local_seq = self.local_seq.wrapping_add(1);
                self.set_state(key, TcpState::SynRecv);
            }
        }
    }

    fn send_to_relay(&mut self, ctx: &Context, key: &FlowKey, socket: &Socket, request: &[u8]) -> bool {
        debug!(flow = %key, phase = ?self.socks5, "relay request {:02x?}", request);
        match socket.send_with_flags(request, libc::MSG_NOSIGNAL) {
            Ok(_) => true,
            Err(err) => {
                warn!(flow = %key, phase = ?self.socks5, "relay write failed: {err}");
                self.write_rst(ctx, key);
                false
            }
        }
    }

    /// Move queued client data to the socket and socket data to the client. Returns whether
    /// the outbound socket reached end of file and must be closed.
    #[allow(clippy::too_many_arguments)]
    fn exchange(
        &mut self,
        ctx: &Context,
        key: &FlowKey,
        uid: Option<u32>,
        socket: &Socket,
        ready: &mut Readiness,
        time: &mut Millis,
        now: Millis,
    ) -> bool {
        let mut forwarded = false;
        if ready.writable {
            let mut buffer = receive_buffer(socket);
            while let Some((chunk, psh)) = self.forward.next_chunk(self.remote_seq) {
                let len = chunk.len();
                if len as u32 >= buffer {
                    break;
                }
                let flags = libc::MSG_NOSIGNAL | if psh { 0 } else { libc::MSG_MORE };
                let result = socket.send_with_flags(chunk, flags);
                match result {
                    Ok(sent) => {
                        forwarded = true;
                        buffer -= sent as u32;
                        self.sent += sent as u64;
                        self.remote_seq = self.remote_seq.wrapping_add(sent as u32);
                        if sent < len {
                            debug!(flow = %key, sent, len, "partial send");
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        ready.writable = false;
                        break;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => break,
                    Err(err) => {
                        warn!(flow = %key, "send failed: {err}");
                        self.write_rst(ctx, key);
                        return false;
                    }
                }
            }
        }

        let window = self.receive_window(socket);
        let reopened = self.recv_window == 0 && window > 0;
        self.recv_window = window;
        if forwarded || reopened {
            if self.confirm_remote_fin() {
                half_close(key, socket);
            }
            if self.send(ctx, key, TcpFlags::ACK, &[]) {
                *time = now;
            }
        }

        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) || !ready.readable {
            return false;
        }
        let window = self.send_window();
        if window == 0 {
            return false;
        }

        *time = now;
        let mut buf = vec![0u8; window.min(u32::from(self.mss)) as usize];
        match read_socket(socket, &mut buf) {
            Ok(0) => {
                self.on_socket_eof(ctx, key);
                true
            }
            Ok(len) => {
                buf.truncate(len);
                self.deliver(ctx, key, uid, buf);
                false
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                ready.readable = false;
                false
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => false,
            Err(err) => {
                warn!(flow = %key, "recv failed: {err}");
                self.write_rst(ctx, key);
                false
            }
        }
    }

    fn on_socket_eof(&mut self, ctx: &Context, key: &FlowKey) {
        if self.forward.pending(self.remote_seq) != Pending::Empty {
            warn!(flow = %key, queued = self.forward.len(), "outbound closed with data queued");
            self.write_rst(ctx, key);
            return;
        }
        info!(flow = %key, state = %self.state, "outbound closed");
        if self.send(ctx, key, TcpFlags::FIN | TcpFlags::ACK, &[]) {
            self.local_seq = self.local_seq.wrapping_add(1);
            let next = if self.state == TcpState::CloseWait {
                TcpState::LastAck
            } else {
                TcpState::FinWait1
            };
            self.set_state(key, next);
        }
    }

    fn deliver(&mut self, ctx: &Context, key: &FlowKey, uid: Option<u32>, mut data: Vec<u8>) {
        self.received += data.len() as u64;

        // DNS over TCP: inspect when the read holds exactly one length-prefixed message.
        if key.dport == 53 && data.len() > 2 {
            let declared = u16::from_be_bytes([data[0], data[1]]) as usize;
            if declared == data.len() - 2 {
                if let Some(len) = dns::inspect_response(ctx, key, uid, &mut data[2..]) {
                    data[..2].copy_from_slice(&(len as u16).to_be_bytes());
                    data.truncate(len + 2);
                }
            }
        }

        if self.send(ctx, key, TcpFlags::ACK, &data) {
            self.local_seq = self.local_seq.wrapping_add(data.len() as u32);
            self.unconfirmed += 1;
        }
    }

    fn on_segment(
        &mut self,
        ctx: &Context,
        key: &FlowKey,
        uid: Option<u32>,
        socket: Option<&Socket>,
        time: &mut Millis,
        seg: &TcpSegment<'_>,
    ) {
        let flags = seg.flags();
        let payload = seg.payload();
        trace!(
            flow = %key,
            state = %self.state,
            %flags,
            seq = seg.seq_number().wrapping_sub(self.remote_start),
            ack = seg.ack_number().wrapping_sub(self.local_start),
            len = payload.len(),
            window = seg.window_size(),
            "from client"
        );

        if matches!(self.state, TcpState::Closing | TcpState::Close) {
            debug!(flow = %key, state = %self.state, "segment for closed flow");
            self.write_rst(ctx, key);
            return;
        }
        if flags.contains(TcpFlags::URG) {
            warn!(flow = %key, "dropping urgent data");
            return;
        }

        if !flags.contains(TcpFlags::SYN) {
            *time = ctx.now();
        }
        self.send_window = u32::from(seg.window_size()) << self.send_scale;
        self.unconfirmed = 0;

        if !payload.is_empty() {
            let Some(socket) = socket else {
                warn!(flow = %key, "data after outbound close");
                self.write_rst(ctx, key);
                return;
            };
            let end = seg.seq_number().wrapping_add(payload.len() as u32);
            if let Some(fin) = self.remote_fin {
                if seq_before(fin, end) {
                    warn!(flow = %key, "data beyond FIN");
                    self.write_rst(ctx, key);
                    return;
                }
            }
            if !self.sni_checked && self.state != TcpState::Listen {
                self.sni_checked = true;
                if !self.check_server_name(ctx, key, uid, payload) {
                    self.write_rst(ctx, key);
                    return;
                }
            }
            let queued = self.forward.insert(
                seg.seq_number(),
                payload,
                flags.contains(TcpFlags::PSH),
                self.remote_seq,
            );
            debug!(flow = %key, ?queued, segments = self.forward.len(), "queued");
            self.recv_window = self.receive_window(socket);
        }

        if flags.contains(TcpFlags::RST) {
            warn!(flow = %key, state = %self.state, "received reset");
            self.set_state(key, TcpState::Closing);
            return;
        }

        if flags.contains(TcpFlags::ACK) {
            let ack = seg.ack_number();
            if ack == self.local_seq {
                self.acked = ack;
                match self.state {
                    TcpState::SynRecv => self.set_state(key, TcpState::Established),
                    TcpState::LastAck => self.set_state(key, TcpState::Closing),
                    _ => {}
                }
            } else if ack.wrapping_add(1) == self.local_seq {
                if self.state == TcpState::Established {
                    match socket.map(|s| s.set_keepalive(true)) {
                        Some(Err(err)) => warn!(flow = %key, "SO_KEEPALIVE failed: {err}"),
                        Some(Ok(())) => debug!(flow = %key, "keep-alive enabled"),
                        None => {}
                    }
                }
            } else if seq_before(ack, self.local_seq) {
                if seq_before(self.acked, ack) {
                    debug!(flow = %key, behind = self.local_seq.wrapping_sub(ack), "previous ACK");
                    self.acked = ack;
                } else {
                    debug!(flow = %key, "repeated ACK");
                }
            } else {
                warn!(flow = %key, ahead = ack.wrapping_sub(self.local_seq), "future ACK");
                self.write_rst(ctx, key);
                return;
            }
        }

        if flags.contains(TcpFlags::SYN) {
            debug!(flow = %key, state = %self.state, "repeated SYN");
            return;
        }

        if flags.contains(TcpFlags::FIN) {
            let fin = seg.seq_number().wrapping_add(payload.len() as u32);
            match self.state {
                TcpState::Established => {
                    info!(flow = %key, "FIN received");
                    self.remote_fin = Some(fin);
                    self.set_state(key, TcpState::CloseWait);
                    if self.confirm_remote_fin() {
                        if let Some(socket) = socket {
                            half_close(key, socket);
                        }
                        self.send(ctx, key, TcpFlags::ACK, &[]);
                    }
                }
                TcpState::FinWait1 => {
                    if fin == self.remote_seq {
                        self.remote_seq = fin.wrapping_add(1);
                        if self.send(ctx, key, TcpFlags::ACK, &[]) {
                            self.set_state(key, TcpState::Close);
                        }
                    } else {
                        warn!(flow = %key, "FIN out of order");
                    }
                }
                TcpState::CloseWait | TcpState::LastAck => debug!(flow = %key, "repeated FIN"),
                state => warn!(flow = %key, %state, "unexpected FIN"),
            }
        }
    }

    /// Report the TLS server name of the first data segment and re-check the flow with it.
    fn check_server_name(
        &self,
        ctx: &Context,
        key: &FlowKey,
        uid: Option<u32>,
        payload: &[u8],
    ) -> bool {
        let Some(name) = tls::client_hello_server_name(payload) else {
            return true;
        };
        info!(flow = %key, server_name = name, "TLS server name");
        ctx.host.sni_resolved(name, key.dst);
        let descriptor = FlowDescriptor {
            protocol: Protocol::Tcp,
            version: key.version,
            src: key.src,
            sport: key.sport,
            dst: key.dst,
            dport: key.dport,
            uid,
            server_name: Some(name.to_string()),
        };
        if ctx.host.is_address_allowed(&descriptor).is_allowed() {
            return true;
        }
        warn!(flow = %key, server_name = name, "server name not allowed");
        ctx.metrics.policy_denied();
        false
    }
}

/// Pass the client's FIN on to the destination.
fn half_close(key: &FlowKey, socket: &Socket) {
    if let Err(err) = socket.shutdown(std::net::Shutdown::Write) {
        debug!(flow = %key, "shutdown failed: {err}");
    }
}

fn read_socket(socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    let mut socket = socket;
    socket.read(buf)
}

/// Free space in the socket's send buffer.
fn receive_buffer(socket: &Socket) -> u32 {
    let size = match socket.send_buffer_size() {
        Ok(0) => SEND_BUF_DEFAULT,
        Ok(size) => size.min(u32::MAX as usize) as u32,
        Err(err) => {
            warn!("SO_SNDBUF: {err}");
            SEND_BUF_DEFAULT
        }
    };
    let unsent = sys::unsent_bytes(socket.as_raw_fd()).unwrap_or_else(|err| {
        warn!("SIOCOUTQ: {err}");
        0
    });
    size.saturating_sub(unsent)
}

fn connect_socket(ctx: &Context, target: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(target),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    if !ctx.protect(&socket) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "host refused to protect socket",
        ));
    }
    if let Err(err) = socket.set_nodelay(true) {
        warn!(%target, "TCP_NODELAY: {err}");
    }
    socket.set_nonblocking(true)?;
    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => return Err(err),
    }
    Ok(socket)
}

/// Start a flow for a SYN from an unseen 5-tuple.
pub(crate) fn open(
    ctx: &Context,
    table: &mut SessionTable,
    key: FlowKey,
    seg: &TcpSegment<'_>,
    uid: Option<u32>,
    verdict: Verdict,
) {
    let options = seg.parsed_options();
    let mss = options
        .mss
        .filter(|mss| *mss > 0)
        .unwrap_or_else(|| ctx.config.mss(key.version));
    let isn = seg.seq_number();
    let mut flow = TcpFlow::new(
        isn,
        rand::random(),
        mss,
        options.window_scale.unwrap_or(0),
        seg.window_size(),
    );

    let target = match (verdict.redirect(), &ctx.config.socks5) {
        (Some(redirect), _) => redirect,
        (None, Some(relay)) => {
            flow.via_socks5 = true;
            relay.addr
        }
        (None, None) => SocketAddr::new(key.dst, key.dport),
    };

    let payload = seg.payload();
    if !payload.is_empty() {
        let first = isn.wrapping_add(1);
        flow.forward
            .insert(first, payload, seg.flags().contains(TcpFlags::PSH), first);
        debug!(flow = %key, len = payload.len(), "SYN carries data");
    }

    let socket = match connect_socket(ctx, target) {
        Ok(socket) => socket,
        Err(err) => {
            // No session: the client retries the SYN.
            warn!(flow = %key, %target, "outbound connect failed: {err}");
            ctx.host.report_error(1, &format!("TCP connect to {target} failed: {err}"));
            return;
        }
    };
    flow.recv_window = flow.receive_window(&socket);
    info!(
        flow = %key,
        %target,
        uid = ?uid,
        mss,
        scale = flow.send_scale,
        window = flow.send_window,
        "new TCP session"
    );

    let session = Session::new(key, uid, ctx.now(), FlowState::Tcp(Box::new(flow)));
    match table.insert_with_socket(
        session,
        socket,
        &ctx.registry,
        Interest::READABLE | Interest::WRITABLE,
    ) {
        Ok(_) => ctx.metrics.session_opened(Protocol::Tcp),
        Err(err) => warn!(flow = %key, "socket registration failed: {err}"),
    }
}

/// Feed a client segment to its existing session.
pub(crate) fn handle_segment(ctx: &Context, session: &mut Session, seg: &TcpSegment<'_>) {
    let Session {
        key,
        uid,
        time,
        socket,
        state: FlowState::Tcp(flow),
        ..
    } = session
    else {
        return;
    };
    flow.on_segment(ctx, key, *uid, socket.as_ref(), time, seg);
}

/// Answer a segment that has no session (or was refused) with a reset.
pub(crate) fn reset_stateless(ctx: &Context, key: &FlowKey, seg: &TcpSegment<'_>) {
    let flags = seg.flags();
    if flags.contains(TcpFlags::RST) {
        return;
    }
    let consumed = u32::from(flags.contains(TcpFlags::SYN) || flags.contains(TcpFlags::FIN));
    let ack = seg
        .seq_number()
        .wrapping_add(seg.payload().len() as u32)
        .wrapping_add(consumed);
    let seq = if flags.contains(TcpFlags::ACK) {
        seg.ack_number()
    } else {
        0
    };
    let segment = TcpSegmentBuilder::rst(key.dport, key.sport, seq, ack).build_vec(key.dst, key.src);
    let written = match segment {
        Ok(segment) => ctx.emit(key.dst, key.src, IPPROTO_TCP, &segment),
        Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
    };
    match written {
        Ok(()) => {
            debug!(flow = %key, %flags, "reset unknown flow");
            ctx.metrics.tcp_reset();
        }
        Err(err) => warn!(flow = %key, "RST write failed: {err}"),
    }
}

/// Reset a live flow, e.g. when the policy changed underneath it.
pub(crate) fn reset(ctx: &Context, session: &mut Session) {
    let key = session.key;
    if let FlowState::Tcp(flow) = &mut session.state {
        if !matches!(flow.state, TcpState::Closing | TcpState::Close) {
            flow.write_rst(ctx, &key);
        }
    }
}

/// Act on cached readiness.
pub(crate) fn service(ctx: &Context, session: &mut Session) {
    let now = ctx.now();
    let Session {
        key,
        uid,
        time,
        socket,
        ready,
        state: FlowState::Tcp(flow),
    } = session
    else {
        return;
    };
    let Some(sock) = socket.as_ref() else {
        *ready = Readiness::default();
        return;
    };

    if ready.error {
        ready.error = false;
        let err = sock.take_error().ok().flatten();
        warn!(flow = %key, state = %flow.state, "socket error: {err:?}");
        flow.write_rst(ctx, key);
        return;
    }

    let eof = match flow.state {
        TcpState::Listen => {
            flow.advance_connect(ctx, key, sock, ready, time, now);
            false
        }
        TcpState::Closing | TcpState::Close => false,
        _ => flow.exchange(ctx, key, *uid, sock, ready, time, now),
    };
    if eof {
        release_socket(socket, ready, &ctx.registry, key);
    }
}

/// Decide whether the flow can progress now, sending a keep-alive ACK when the client's window
/// is closed.
pub(crate) fn monitor(ctx: &Context, session: &mut Session, now: Millis) -> Monitor {
    let mut out = Monitor::default();
    let Session {
        key,
        socket,
        ready,
        state: FlowState::Tcp(flow),
        ..
    } = session
    else {
        return out;
    };
    let Some(sock) = socket.as_ref() else {
        return out;
    };
    if ready.error {
        out.service = true;
        return out;
    }

    match flow.state {
        TcpState::Listen => {
            out.service = match flow.socks5 {
                Socks5Phase::None => ready.writable,
                Socks5Phase::Connected => true,
                _ => ready.readable,
            };
        }
        TcpState::Established | TcpState::CloseWait => {
            if flow.send_window() > 0 {
                out.service |= ready.readable;
            } else {
                out.recheck = true;
                if now.saturating_sub(flow.last_keep_alive) > MIN_CHECK_INTERVAL {
                    flow.last_keep_alive = now;
                    debug!(flow = %key, "probing closed window");
                    flow.remote_seq = flow.remote_seq.wrapping_sub(1);
                    flow.send(ctx, key, TcpFlags::ACK, &[]);
                    flow.remote_seq = flow.remote_seq.wrapping_add(1);
                }
            }

            match flow.forward.pending(flow.remote_seq) {
                Pending::Empty => {}
                Pending::Ready(len) if (len as u32) < receive_buffer(sock) => {
                    out.service |= ready.writable;
                }
                _ => out.recheck = true,
            }

            if flow.recv_window == 0 {
                out.recheck = true;
                out.service |= flow.receive_window(sock) > 0;
            }
        }
        _ => {}
    }
    out
}

pub(crate) fn sweep(ctx: &Context, session: &mut Session, sessions: usize, now: Millis) -> Sweep {
    let key = session.key;
    let FlowState::Tcp(flow) = &mut session.state else {
        return Sweep::Remove;
    };

    let base = match flow.state {
        TcpState::Listen | TcpState::SynRecv => TCP_INIT_TIMEOUT,
        TcpState::Established => TCP_IDLE_TIMEOUT,
        _ => TCP_CLOSE_TIMEOUT,
    };
    let timeout = scale_timeout(base, sessions, ctx.max_sessions);
    let live = !matches!(flow.state, TcpState::Closing | TcpState::Close);

    if live && session.time + timeout < now {
        warn!(flow = %key, state = %flow.state, idle_ms = now - session.time, "idle timeout");
        if flow.state == TcpState::Listen {
            flow.set_state(&key, TcpState::Closing);
        } else {
            flow.write_rst(ctx, &key);
        }
    }

    if flow.state == TcpState::Closing {
        release_socket(&mut session.socket, &mut session.ready, &ctx.registry, &key);
        session.time = now;
        flow.set_state(&key, TcpState::Close);
    }

    if flow.state == TcpState::Close && (flow.sent > 0 || flow.received > 0) {
        ctx.host.account_usage(&UsageRecord {
            version: key.version,
            protocol: Protocol::Tcp,
            dst: key.dst,
            dport: key.dport,
            uid: session.uid,
            sent: flow.sent,
            received: flow.received,
        });
        flow.sent = 0;
        flow.received = 0;
    }

    if flow.state == TcpState::Close {
        if session.time + TCP_KEEP_TIMEOUT < now {
            return Sweep::Remove;
        }
        return Sweep::Keep {
            deadline: remaining(session.time, TCP_KEEP_TIMEOUT, now),
        };
    }
    Sweep::Keep {
        deadline: remaining(session.time, timeout, now),
    }
}
