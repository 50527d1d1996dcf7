//! The session table: every tracked flow, keyed by a stable [`FlowId`].

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::AsRawFd;

use mio::unix::SourceFd;
use mio::{Interest, Registry};
use socket2::Socket;

use crate::flow::{FlowId, FlowKey, Protocol};
use crate::icmp::IcmpFlow;
use crate::tcp::{TcpFlow, TcpState};
use crate::udp::{UdpFlow, UdpState};
use crate::Millis;

/// Readiness reported by the multiplexer and not yet consumed.
///
/// Sockets are registered edge-triggered, so a flag stays set until an operation on the socket
/// returns `WouldBlock`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub(crate) fn merge(&mut self, event: &mio::event::Event) {
        self.readable |= event.is_readable() || event.is_read_closed();
        self.writable |= event.is_writable() || event.is_write_closed();
        self.error |= event.is_error();
    }
}

pub(crate) enum FlowState {
    Icmp(IcmpFlow),
    Udp(UdpFlow),
    Tcp(Box<TcpFlow>),
}

pub(crate) struct Session {
    pub key: FlowKey,
    pub uid: Option<u32>,
    /// Last activity on the engine clock.
    pub time: Millis,
    pub socket: Option<Socket>,
    pub ready: Readiness,
    pub state: FlowState,
}

impl Session {
    pub(crate) fn new(key: FlowKey, uid: Option<u32>, time: Millis, state: FlowState) -> Self {
        Self {
            key,
            uid,
            time,
            socket: None,
            ready: Readiness::default(),
            state,
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    /// Whether the session counts against the capacity bound.
    pub(crate) fn is_live(&self) -> bool {
        match &self.state {
            FlowState::Icmp(flow) => !flow.stop,
            FlowState::Udp(flow) => flow.state == UdpState::Active,
            FlowState::Tcp(flow) => !matches!(flow.state, TcpState::Closing | TcpState::Close),
        }
    }

    pub(crate) fn attach_socket(
        &mut self,
        socket: Socket,
        registry: &Registry,
        id: FlowId,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut SourceFd(&socket.as_raw_fd()), id.token(), interest)?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Deregister and close the outbound socket, if still open.
    pub(crate) fn close_socket(&mut self, registry: &Registry) {
        release_socket(&mut self.socket, &mut self.ready, registry, &self.key);
    }
}

/// Field-level form of [`Session::close_socket`] for callers already holding a borrow of the
/// flow state.
pub(crate) fn release_socket(
    socket: &mut Option<Socket>,
    ready: &mut Readiness,
    registry: &Registry,
    key: &FlowKey,
) {
    if let Some(socket) = socket.take() {
        if let Err(err) = registry.deregister(&mut SourceFd(&socket.as_raw_fd())) {
            tracing::debug!(flow = %key, "deregister failed: {err}");
        }
    }
    *ready = Readiness::default();
}

/// What the per-iteration scan found for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Monitor {
    /// Cached readiness allows progress now.
    pub service: bool,
    /// Progress depends on something readiness events do not report (window space, buffer
    /// drain), so the loop must poll again soon.
    pub recheck: bool,
}

/// Live session counts per protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SessionCounts {
    pub icmp: usize,
    pub udp: usize,
    pub tcp: usize,
}

impl SessionCounts {
    pub(crate) fn total(&self) -> usize {
        self.icmp + self.udp + self.tcp
    }
}

/// Outcome of sweeping one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Sweep {
    /// Still tracked; `deadline` is the time left before its timeout, for live sessions.
    Keep { deadline: Option<Millis> },
    Remove,
}

/// Idle timeout shrunk linearly as the table fills up.
pub(crate) fn scale_timeout(timeout: Millis, sessions: usize, max_sessions: usize) -> Millis {
    let max = max_sessions.max(1) as u64;
    let used = (sessions as u64 * 100 / max).min(100);
    timeout * (100 - used) / 100
}

/// Remaining time before `time + timeout`, rounded up so the sweep runs after expiry.
pub(crate) fn remaining(time: Millis, timeout: Millis, now: Millis) -> Option<Millis> {
    (time + timeout).checked_sub(now).map(|left| left + 1)
}

pub(crate) struct SessionTable {
    sessions: BTreeMap<FlowId, Session>,
    index: HashMap<FlowKey, FlowId>,
    next_id: usize,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    /// Track `session`; a previous session with the same key stays in the table but is no
    /// longer found by [`SessionTable::find`].
    pub(crate) fn insert(&mut self, session: Session) -> FlowId {
        let id = FlowId(self.next_id);
        self.next_id += 1;
        self.index.insert(session.key, id);
        self.sessions.insert(id, session);
        id
    }

    /// Register `socket` under the id the session is about to receive, then track the session.
    pub(crate) fn insert_with_socket(
        &mut self,
        mut session: Session,
        socket: Socket,
        registry: &Registry,
        interest: Interest,
    ) -> io::Result<FlowId> {
        session.attach_socket(socket, registry, FlowId(self.next_id), interest)?;
        Ok(self.insert(session))
    }

    pub(crate) fn find(&self, key: &FlowKey) -> Option<FlowId> {
        self.index.get(key).copied()
    }

    pub(crate) fn get(&self, id: FlowId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: FlowId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: FlowId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        if self.index.get(&session.key) == Some(&id) {
            self.index.remove(&session.key);
        }
        Some(session)
    }

    pub(crate) fn ids(&self) -> Vec<FlowId> {
        self.sessions.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (FlowId, &Session)> {
        self.sessions.iter().map(|(id, session)| (*id, session))
    }

    pub(crate) fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for session in self.sessions.values().filter(|s| s.is_live()) {
            match session.protocol() {
                Protocol::Icmp => counts.icmp += 1,
                Protocol::Udp => counts.udp += 1,
                Protocol::Tcp => counts.tcp += 1,
            }
        }
        counts
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Session> {
        self.index.clear();
        std::mem::take(&mut self.sessions).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp(src: &str, dst: &str) -> Session {
        Session::new(
            FlowKey::icmp(src.parse().unwrap(), dst.parse().unwrap()),
            None,
            0,
            FlowState::Icmp(IcmpFlow::new(1)),
        )
    }

    #[test]
    fn replaced_key_keeps_index_on_old_removal() {
        let mut table = SessionTable::new();
        let old = table.insert(icmp("10.0.0.2", "1.1.1.1"));
        if let Some(FlowState::Icmp(flow)) = table.get_mut(old).map(|s| &mut s.state) {
            flow.stop = true;
        }
        let new = table.insert(icmp("10.0.0.2", "1.1.1.1"));
        assert_ne!(old, new);
        assert_eq!(table.len(), 2);
        assert_eq!(table.counts().icmp, 1);

        table.remove(old);
        let key = FlowKey::icmp("10.0.0.2".parse().unwrap(), "1.1.1.1".parse().unwrap());
        assert_eq!(table.find(&key), Some(new));

        table.remove(new);
        assert_eq!(table.find(&key), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn ids_follow_creation_order() {
        let mut table = SessionTable::new();
        let a = table.insert(icmp("10.0.0.2", "1.1.1.1"));
        let b = table.insert(icmp("10.0.0.2", "8.8.8.8"));
        assert_eq!(table.ids(), vec![a, b]);
        assert_eq!(table.drain().count(), 2);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn timeouts_shrink_with_load() {
        assert_eq!(scale_timeout(300_000, 0, 100), 300_000);
        assert_eq!(scale_timeout(300_000, 50, 100), 150_000);
        assert_eq!(scale_timeout(300_000, 100, 100), 0);
        assert_eq!(scale_timeout(300_000, 150, 100), 0);
        assert_eq!(scale_timeout(5_000, 1, 0), 0);

        assert_eq!(remaining(1_000, 5_000, 2_000), Some(4_001));
        assert_eq!(remaining(1_000, 5_000, 6_000), Some(1));
        assert_eq!(remaining(1_000, 5_000, 6_001), None);
    }
}
