use mio::net::TcpStream;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::machine::ClusterMachine;
use crate::nio::read_framer::ReaderManager;
use crate::nio::send_queue::SendQueue;
use crate::nio::out_message::PRIORITY_COUNT;

/// Which side initiated the connection this context carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectType {
    /// we initiated the connect and reconnect after failures
    Client,
    /// the peer connected to our listener; on failure the context returns
    ///  to the accept free list
    Server,
}

/// Per-connection state record. Contexts are allocated once at engine init
///  and recycled through the role-specific free lists; the `version` counter
///  advances on every close so senders holding a binding to a previous
///  incarnation are rejected.
///
/// Thread model: exactly one thread owns the socket at any time (the
///  manager pre-handshake, one worker afterwards). The send queues are the
///  only cross-thread entry point and carry their own locks. The reader and
///  the stream are only ever locked by the owning thread; their mutexes
///  exist to make the handoff at promotion safe.
pub struct SocketContext {
    slot: usize,
    role: ConnectType,
    worker_index: usize,

    pub(crate) machine: Mutex<Option<Arc<ClusterMachine>>>,
    pub(crate) stream: Mutex<Option<TcpStream>>,
    pub(crate) connected: AtomicBool,
    pub(crate) version: AtomicU64,

    pub(crate) send_queues: [Mutex<SendQueue>; PRIORITY_COUNT],
    pub(crate) reader: Mutex<ReaderManager>,

    /// priority queue holding the partially-sent message a writev batch
    ///  resumes from; 0 when nothing is in flight
    pub(crate) queue_index: AtomicUsize,

    /// engine-relative nanos of the outstanding ping, 0 when none
    pub(crate) ping_start_time: AtomicU64,
    pub(crate) ping_fail_count: AtomicU32,
    pub(crate) next_write_time: AtomicU64,
    pub(crate) next_ping_time: AtomicU64,
    pub(crate) connected_time: AtomicU64,
}

impl SocketContext {
    pub(crate) fn new(slot: usize, role: ConnectType, worker_index: usize) -> SocketContext {
        SocketContext {
            slot,
            role,
            worker_index,
            machine: Mutex::new(None),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            version: AtomicU64::new(0),
            send_queues: [
                Mutex::new(SendQueue::default()),
                Mutex::new(SendQueue::default()),
                Mutex::new(SendQueue::default()),
            ],
            reader: Mutex::new(ReaderManager::new()),
            queue_index: AtomicUsize::new(0),
            ping_start_time: AtomicU64::new(0),
            ping_fail_count: AtomicU32::new(0),
            next_write_time: AtomicU64::new(0),
            next_ping_time: AtomicU64::new(0),
            connected_time: AtomicU64::new(0),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn role(&self) -> ConnectType {
        self.role
    }

    pub(crate) fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// current incarnation of this context; capture this when binding a
    ///  session to the socket and pass it to every enqueue
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn machine(&self) -> Option<Arc<ClusterMachine>> {
        self.machine.lock().unwrap().clone()
    }

    /// "host:port" of the peer, for log lines
    pub(crate) fn peer_label(&self) -> String {
        match self.machine() {
            Some(m) => format!("{}:{}", m.hostname, m.cluster_port),
            None => "<unbound>".to_string(),
        }
    }

    pub(crate) fn peer_ip(&self) -> Option<Ipv4Addr> {
        self.machine().map(|m| m.ip)
    }
}
