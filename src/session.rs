use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::machine::ClusterMachine;
use crate::sock::context::SocketContext;
use crate::wire::{MsgHeader, SessionId};

/// Opaque per-session payload the session layer attaches to a response and
///  wants back in the `deal` callback.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// How an inbound frame is to be handed over, decided by the session layer.
pub enum SessionDisposition {
    /// invoke the registered `deal` callback synchronously on the worker
    Deliver { user_data: Option<UserData> },
    /// queue into the session's in-queue via `push_in_message`
    Queue,
}

/// Seam to the session layer above the engine: session id assignment,
///  request/response correlation and per-session queues live there. The
///  engine only resolves inbound frames and reports lifecycle events.
#[cfg_attr(test, automock)]
pub trait SessionStore: Send + Sync + 'static {
    /// called when a peer gets its first connection (idempotent)
    fn init_machine_sessions(&self, machine: &Arc<ClusterMachine>);

    /// resolve the session an inbound frame belongs to; an `Err` drops the
    ///  frame
    fn get_response_session(
        &self,
        header: &MsgHeader,
        sock: &Arc<SocketContext>,
    ) -> anyhow::Result<SessionDisposition>;

    fn push_in_message(
        &self,
        session_id: SessionId,
        func_id: i32,
        blocks: Vec<Bytes>,
        data_len: usize,
    );

    /// a socket closed; every queued message on it was dropped and its
    ///  version advanced
    fn notify_connection_closed(&self, sock: &Arc<SocketContext>);
}

/// Application-side callbacks, registered once at engine creation.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    /// a successfully framed, well-versioned message for the application.
    ///  `blocks` concatenate to exactly `data_len` bytes.
    fn deal(
        &self,
        session_id: SessionId,
        user_data: Option<UserData>,
        func_id: i32,
        blocks: &[Bytes],
        data_len: usize,
    );

    /// peer liveness transition, emitted once per up resp. down
    fn machine_change(&self, ip: Ipv4Addr, up: bool);
}
