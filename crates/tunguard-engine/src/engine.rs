//! The readiness loop and the cross-thread control surface.

use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Waker};
use socket2::Socket;
use tracing::{debug, error, info, trace, warn};
use tunguard_packet::IpPacketBuilder;

use crate::config::{
    EngineConfig, DEFAULT_POLL_TIMEOUT, MIN_CHECK_INTERVAL, SESSION_LIMIT_PERCENT, SESSION_MAX,
    TUN_YIELD,
};
use crate::error::{ConfigError, EngineError};
use crate::flow::{FlowId, Protocol, TUN_TOKEN, WAKE_TOKEN};
use crate::host::{FlowDescriptor, Host};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::session::{FlowState, Monitor, Session, SessionTable, Sweep};
use crate::tun::Tun;
use crate::uid::UidResolver;
use crate::udp::UdpState;
use crate::{icmp, ingress, sys, tcp, udp, Millis};

const EVENTS_CAPACITY: usize = 256;
const MIN_MTU: u16 = 1280;

/// Everything the protocol handlers share for the lifetime of an engine.
pub(crate) struct Context {
    pub config: EngineConfig,
    pub host: Arc<dyn Host>,
    pub registry: Registry,
    pub tun: Tun,
    pub uids: UidResolver,
    pub metrics: Metrics,
    /// Capacity bound on live sessions, fixed when the loop starts.
    pub max_sessions: usize,
    clock: Instant,
}

impl Context {
    pub(crate) fn now(&self) -> Millis {
        self.clock.elapsed().as_millis() as Millis
    }

    /// Wrap a transport segment in an IP header and write it to the tun device.
    pub(crate) fn emit(
        &self,
        src: IpAddr,
        dst: IpAddr,
        protocol: u8,
        segment: &[u8],
    ) -> io::Result<()> {
        let packet = IpPacketBuilder {
            src,
            dst,
            protocol,
            payload: segment,
        }
        .build_vec()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        match self.tun.write(&packet) {
            Ok(()) => {
                trace!(%src, %dst, protocol, len = packet.len(), "to tun");
                self.metrics.packet_tx(packet.len());
                Ok(())
            }
            Err(err) => {
                self.metrics.tun_write_failed();
                Err(err)
            }
        }
    }

    pub(crate) fn protect(&self, socket: &Socket) -> bool {
        self.host.protect_socket(socket.as_raw_fd())
    }
}

/// Live session counts and descriptor usage, as returned by [`EngineHandle::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub icmp: usize,
    pub udp: usize,
    pub tcp: usize,
    /// Descriptors open in this process, if they could be counted.
    pub open_fds: Option<usize>,
    /// Soft `RLIMIT_NOFILE`, if it could be read.
    pub fd_limit: Option<u64>,
}

struct Shared {
    stop: AtomicBool,
    waker: Waker,
}

/// Cloneable control surface for an [`Engine`] running on another thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    table: Arc<Mutex<SessionTable>>,
    metrics: Metrics,
}

impl EngineHandle {
    /// Ask the loop to exit at its next iteration.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            warn!("failed to wake engine: {err}");
        }
    }

    pub fn stats(&self) -> EngineStats {
        let counts = lock(&self.table).counts();
        EngineStats {
            icmp: counts.icmp,
            udp: counts.udp,
            tcp: counts.tcp,
            open_fds: sys::open_fd_count().ok(),
            fd_limit: sys::nofile_soft_limit().ok(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Counters and active-session gauges in the Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        self.metrics.render_prometheus()
    }
}

/// One tunnel instance: a tun device, its sessions and the loop that drives them.
pub struct Engine {
    poll: Poll,
    ctx: Context,
    table: Arc<Mutex<SessionTable>>,
    shared: Arc<Shared>,
}

fn lock(table: &Mutex<SessionTable>) -> MutexGuard<'_, SessionTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The session bound: a share of the descriptor limit, capped.
pub(crate) fn session_limit(nofile: Option<u64>, configured: Option<usize>) -> usize {
    let by_fds = nofile
        .map(|limit| (limit * SESSION_LIMIT_PERCENT / 100) as usize)
        .unwrap_or(SESSION_MAX);
    let limit = by_fds.min(SESSION_MAX);
    configured.map_or(limit, |max| limit.min(max))
}

impl Engine {
    pub fn new(config: EngineConfig, host: Arc<dyn Host>, tun: OwnedFd) -> Result<Self, EngineError> {
        if config.mtu < MIN_MTU {
            return Err(ConfigError::TooSmall("mtu", u64::from(MIN_MTU)).into());
        }

        let poll = Poll::new().map_err(EngineError::Poll)?;
        let tun = Tun::new(tun).map_err(EngineError::TunSetup)?;
        poll.registry()
            .register(&mut SourceFd(&tun.raw_fd()), TUN_TOKEN, Interest::READABLE)
            .map_err(EngineError::RegisterTun)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(EngineError::Poll)?;
        let registry = poll.registry().try_clone().map_err(EngineError::Poll)?;

        let ctx = Context {
            uids: UidResolver::new(config.proc_net_dir.clone()),
            config,
            host,
            registry,
            tun,
            metrics: Metrics::new(),
            max_sessions: SESSION_MAX,
            clock: Instant::now(),
        };
        Ok(Self {
            poll,
            ctx,
            table: Arc::new(Mutex::new(SessionTable::new())),
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                waker,
            }),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
            table: self.table.clone(),
            metrics: self.ctx.metrics.clone(),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.ctx.config.mtu
    }

    /// Close every socket and forget every session.
    pub fn clear(&mut self) {
        let mut table = lock(&self.table);
        let mut cleared = 0usize;
        for mut session in table.drain() {
            session.close_socket(&self.ctx.registry);
            cleared += 1;
        }
        self.ctx.metrics.set_active(0, 0, 0);
        debug!(cleared, "sessions cleared");
    }

    /// Drive the tunnel until [`EngineHandle::stop`] is called or the tun device fails.
    ///
    /// Sessions surviving from a previous run are checked against the current policy first.
    /// A stop requested before `run` is entered makes it return immediately.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let nofile = match sys::nofile_soft_limit() {
            Ok(limit) => Some(limit),
            Err(err) => {
                warn!("cannot read descriptor limit: {err}");
                None
            }
        };
        self.ctx.max_sessions = session_limit(nofile, self.ctx.config.max_sessions);
        info!(
            max_sessions = self.ctx.max_sessions,
            mtu = self.ctx.config.mtu,
            socks5 = ?self.ctx.config.socks5.as_ref().map(|relay| relay.addr),
            "engine starting"
        );

        enforce_policy(&self.ctx, &mut lock(&self.table));

        let result = self.event_loop();
        self.shared.stop.store(false, Ordering::Release);
        match &result {
            Ok(()) => info!("engine stopped"),
            Err(err) => {
                error!("engine failed: {err}");
                self.ctx.host.report_exit(&err.to_string());
            }
        }
        result
    }

    fn event_loop(&mut self) -> Result<(), EngineError> {
        let Self {
            poll,
            ctx,
            table,
            shared,
        } = self;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut buf = vec![0u8; usize::from(ctx.config.mtu)];
        // Readiness is edge-triggered: the tun stays pending until a read would block.
        let mut tun_pending = true;
        let mut last_sweep: Option<Millis> = None;
        let mut wake_at: Option<Millis> = None;
        let mut timeout: Millis = 0;

        loop {
            if shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            trace!(timeout, "waiting");
            match poll.poll(&mut events, Some(Duration::from_millis(timeout))) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(EngineError::Wait(err)),
            }
            if shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let mut sessions = lock(table);
            for event in events.iter() {
                match event.token() {
                    TUN_TOKEN => tun_pending = true,
                    WAKE_TOKEN => {}
                    token => {
                        let session =
                            FlowId::from_token(token).and_then(|id| sessions.get_mut(id));
                        match session {
                            Some(session) => session.ready.merge(event),
                            None => trace!(?token, "event for removed session"),
                        }
                    }
                }
            }

            if tun_pending {
                tun_pending = !drain_tun(ctx, &mut sessions, &mut buf)?;
            }

            let now = ctx.now();
            let mut recheck = false;
            let mut busy = false;
            for id in sessions.ids() {
                let Some(session) = sessions.get_mut(id) else {
                    continue;
                };
                let status = monitor(ctx, session, now);
                recheck |= status.recheck;
                if status.service {
                    service(ctx, session);
                    // Batch limits may leave work behind.
                    let after = monitor(ctx, session, now);
                    busy |= after.service;
                    recheck |= after.recheck;
                }
            }

            let swept = last_sweep.map_or(true, |at| now >= at + MIN_CHECK_INTERVAL);
            if swept {
                let next = sweep(ctx, &mut sessions, now);
                last_sweep = Some(now);
                wake_at = next.map(|left| now + left);
            }

            timeout = if busy || tun_pending {
                0
            } else {
                next_timeout(now, last_sweep, wake_at, swept, recheck)
            };
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.clear();
    }
}

/// How long to wait for readiness.
///
/// A skipped sweep has not seen what this iteration changed (finished flows, new short
/// deadlines), so the wait ends when the next sweep is due.
fn next_timeout(
    now: Millis,
    last_sweep: Option<Millis>,
    wake_at: Option<Millis>,
    swept: bool,
    recheck: bool,
) -> Millis {
    let sweep_due = last_sweep.map_or(0, |at| (at + MIN_CHECK_INTERVAL).saturating_sub(now));
    let mut timeout = if swept {
        let expiry = wake_at.map_or(DEFAULT_POLL_TIMEOUT, |at| at.saturating_sub(now));
        expiry.max(sweep_due)
    } else {
        sweep_due
    };
    if recheck {
        timeout = timeout.min(MIN_CHECK_INTERVAL);
    }
    timeout
}

/// Read up to a batch of datagrams from the tun device; returns whether it was drained.
fn drain_tun(ctx: &mut Context, table: &mut SessionTable, buf: &mut [u8]) -> Result<bool, EngineError> {
    let mut reads = 0;
    while reads < TUN_YIELD {
        match ctx.tun.read(buf) {
            Ok(0) => return Err(EngineError::TunClosed),
            Ok(len) => {
                reads += 1;
                ingress::handle_packet(ctx, table, &buf[..len]);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(EngineError::TunRead(err)),
        }
    }
    Ok(false)
}

fn monitor(ctx: &Context, session: &mut Session, now: Millis) -> Monitor {
    match session.protocol() {
        Protocol::Icmp => icmp::monitor(session),
        Protocol::Udp => udp::monitor(session),
        Protocol::Tcp => tcp::monitor(ctx, session, now),
    }
}

fn service(ctx: &Context, session: &mut Session) {
    match session.protocol() {
        Protocol::Icmp => icmp::service(ctx, session),
        Protocol::Udp => udp::service(ctx, session),
        Protocol::Tcp => tcp::service(ctx, session),
    }
}

/// Expire idle sessions and drop finished ones. Returns the time until the nearest expiry.
fn sweep(ctx: &Context, table: &mut SessionTable, now: Millis) -> Option<Millis> {
    let live = table.counts().total();
    let mut next: Option<Millis> = None;
    for id in table.ids() {
        let Some(session) = table.get_mut(id) else {
            continue;
        };
        let outcome = match session.protocol() {
            Protocol::Icmp => icmp::sweep(ctx, session, live, now),
            Protocol::Udp => udp::sweep(ctx, session, live, now),
            Protocol::Tcp => tcp::sweep(ctx, session, live, now),
        };
        match outcome {
            Sweep::Remove => remove(ctx, table, id),
            Sweep::Keep {
                deadline: Some(deadline),
            } => next = Some(next.map_or(deadline, |next| next.min(deadline))),
            Sweep::Keep { deadline: None } => {}
        }
    }
    let counts = table.counts();
    ctx.metrics.set_active(counts.icmp, counts.udp, counts.tcp);
    next
}

fn remove(ctx: &Context, table: &mut SessionTable, id: FlowId) {
    if let Some(mut session) = table.remove(id) {
        session.close_socket(&ctx.registry);
        debug!(flow = %session.key, "session removed");
        ctx.metrics.session_removed();
    }
}

/// Re-evaluate surviving sessions against the current policy.
fn enforce_policy(ctx: &Context, table: &mut SessionTable) {
    for id in table.ids() {
        let Some(session) = table.get_mut(id) else {
            continue;
        };
        let placeholder =
            matches!(&session.state, FlowState::Udp(flow) if flow.state == UdpState::Blocked);
        if !placeholder && (!session.is_live() || still_allowed(ctx, session)) {
            continue;
        }
        info!(flow = %session.key, uid = ?session.uid, "session no longer allowed");
        let drop = match session.protocol() {
            Protocol::Icmp => {
                icmp::stop(session);
                false
            }
            Protocol::Udp => udp::finish(session),
            Protocol::Tcp => {
                tcp::reset(ctx, session);
                false
            }
        };
        if drop {
            remove(ctx, table, id);
        }
    }
}

fn still_allowed(ctx: &Context, session: &Session) -> bool {
    let key = &session.key;
    ctx.host
        .is_address_allowed(&FlowDescriptor {
            protocol: key.protocol,
            version: key.version,
            src: key.src,
            sport: key.sport,
            dst: key.dst,
            dport: key.dport,
            uid: session.uid,
            server_name: None,
        })
        .is_allowed()
}

#[cfg(test)]
pub(crate) fn test_context(host: Arc<dyn Host>) -> (Context, std::os::unix::net::UnixDatagram) {
    let (ours, theirs) = std::os::unix::net::UnixDatagram::pair().unwrap();
    let poll = Poll::new().unwrap();
    let config = EngineConfig {
        proc_net_dir: "/nonexistent/tunguard".into(),
        ..EngineConfig::default()
    };
    let ctx = Context {
        uids: UidResolver::new(config.proc_net_dir.clone()),
        config,
        host,
        registry: poll.registry().try_clone().unwrap(),
        tun: Tun::new(OwnedFd::from(ours)).unwrap(),
        metrics: Metrics::new(),
        max_sessions: 100,
        clock: Instant::now(),
    };
    (ctx, theirs)
}
