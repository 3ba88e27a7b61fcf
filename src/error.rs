use std::fmt::{Display, Formatter};
use std::io;

/// Per-socket I/O outcome classification. `WouldBlock` and `Interrupted` are
///  regular states of the non-blocking state machine, not failures - callers
///  retry later resp. immediately.
#[derive(Debug)]
pub enum SockError {
    /// no progress possible right now, retry on the next readiness event
    WouldBlock,
    /// syscall interrupted, retry immediately
    Interrupted,
    /// the peer closed the connection (read / write of 0 bytes)
    PeerClosed,
    /// the byte stream violates the wire protocol - the socket is closed
    ProtocolError(String),
    /// no free socket context / message buffer available
    ResourceExhausted,
    /// enqueue against a socket incarnation that no longer exists
    StaleSession,
    /// any other socket level error - the socket is closed
    Io(io::Error),
}

impl SockError {
    /// transient states that leave the socket usable
    pub fn is_transient(&self) -> bool {
        matches!(self, SockError::WouldBlock | SockError::Interrupted)
    }
}

impl Display for SockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SockError::WouldBlock => write!(f, "operation would block"),
            SockError::Interrupted => write!(f, "interrupted, retry"),
            SockError::PeerClosed => write!(f, "connection closed by peer"),
            SockError::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            SockError::ResourceExhausted => write!(f, "resource exhausted"),
            SockError::StaleSession => write!(f, "stale session version"),
            SockError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for SockError {}

impl From<io::Error> for SockError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => SockError::WouldBlock,
            io::ErrorKind::Interrupted => SockError::Interrupted,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => SockError::PeerClosed,
            _ => SockError::Io(e),
        }
    }
}
