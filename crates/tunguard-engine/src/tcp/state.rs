use core::fmt;

/// Lifecycle of a TCP flow as seen by the client behind the tun device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// SYN received, outbound connect (and SOCKS5 handshake) in progress.
    Listen,
    /// SYN+ACK sent, waiting for the client's ACK.
    SynRecv,
    Established,
    /// Outbound socket reached EOF and our FIN was sent.
    FinWait1,
    /// Client FIN seen.
    CloseWait,
    /// Client FIN seen, then our FIN sent.
    LastAck,
    /// Reset or timed out; the socket is released on the next sweep.
    Closing,
    /// Inert until the keep period elapses.
    Close,
}

impl TcpState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition(self, next: TcpState) -> bool {
        use TcpState::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Listen, SynRecv)
                | (SynRecv, Established)
                | (Established, FinWait1 | CloseWait)
                | (FinWait1, Close)
                | (CloseWait, LastAck)
                | (Listen | SynRecv | Established | FinWait1 | CloseWait | LastAck, Closing)
                | (Closing, Close)
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closing => "CLOSING",
            TcpState::Close => "CLOSE",
        })
    }
}

/// Progress of the relay handshake on the outbound socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Socks5Phase {
    /// Outbound connect not completed yet.
    None,
    Hello,
    Auth,
    Connect,
    /// Outbound path ready (directly or through the relay).
    Connected,
}
