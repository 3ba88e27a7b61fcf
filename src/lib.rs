//! Intra-cluster messaging I/O engine for a peer-to-peer cluster of service
//!  nodes.
//!
//! Every node keeps persistent bidirectional TCP connections to every other
//!  node and exchanges variable-length framed messages - small inline
//!  payloads or scatter-gather chained buffers. This crate owns the I/O
//!  side of that:
//!
//! * establishing and re-establishing peer connections, with a version
//!   handshake and reconnect back-off
//! * multiplexing many logical sessions over a bounded set of sockets per
//!   peer, spread round-robin for outbound sends
//! * a per-socket outbound pump blending three priorities into vectored
//!   writes, with a time-based write throttle derived from observed
//!   throughput
//! * a read-side framer that reassembles messages whose headers or bodies
//!   span buffer boundaries, delivering reference-counted body blocks
//!   without copying payload
//! * in-band ping liveness with retry-bounded tear-down
//!
//! The engine runs plain OS threads: one connection-setup thread owning
//!  the listener and every pre-handshake socket, plus N workers each
//!  driving its own poll set. There is no async runtime; `WouldBlock` and
//!  `Interrupted` are ordinary states of the per-socket state machines.
//!
//! Session tracking, request/response correlation and the application
//!  callback live above this crate, behind the [`SessionStore`] and
//!  [`MessageHandler`] seams.

pub mod config;
pub mod error;
pub mod machine;
pub mod session;
pub mod stats;
pub mod wire;

mod conn;
mod engine;
mod nio;
mod sock;

pub use config::ClusterConfig;
pub use engine::ClusterEngine;
pub use error::SockError;
pub use machine::ClusterMachine;
pub use nio::out_message::{MessagePriority, MsgPayload, OutMessage, MINI_MESSAGE_SIZE};
pub use session::{MessageHandler, SessionDisposition, SessionStore, UserData};
pub use sock::context::{ConnectType, SocketContext};
pub use wire::{MsgHeader, SessionId};
