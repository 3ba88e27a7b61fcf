use anyhow::bail;
use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::config::ClusterConfig;
use crate::conn::manager::{ConnectionManager, ManagerCmd, LISTENER_TOKEN, WAKER_TOKEN};
use crate::error::SockError;
use crate::machine::{ClusterMachine, MachineRegistry};
use crate::nio::flow::FlowControl;
use crate::nio::out_message::{MessagePriority, OutMessage};
use crate::nio::send_queue;
use crate::nio::worker::{worker_loop, WorkerShared};
use crate::session::{MessageHandler, SessionStore};
use crate::sock::context::SocketContext;
use crate::sock::pool::SocketPool;
use crate::stats::{reduce, SocketStats, StatsSnapshot};
use crate::wire::SessionId;

/// Everything the manager thread, the workers and the API surface share.
pub(crate) struct Shared {
    pub(crate) config: ClusterConfig,
    pub(crate) my_ip: Ipv4Addr,
    epoch: Instant,
    pub(crate) registry: MachineRegistry,
    pub(crate) pool: SocketPool,
    pub(crate) flow: FlowControl,
    pub(crate) workers: Vec<WorkerShared>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    manager_tx: Sender<ManagerCmd>,
    manager_waker: Waker,
}

impl Shared {
    /// monotonic nanos since engine creation
    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// wall-clock seconds, for session id timestamps on the wire
    pub(crate) fn unix_now(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    pub(crate) fn send_manager_cmd(&self, cmd: ManagerCmd) {
        // send can only fail at teardown, when nobody cares any more
        let _ = self.manager_tx.send(cmd);
        let _ = self.manager_waker.wake();
    }

    pub(crate) fn worker_stats(&self, sock: &SocketContext) -> &SocketStats {
        &self.workers[sock.worker_index()].stats
    }

    pub(crate) fn stats_snapshot(&self) -> StatsSnapshot {
        let sources: Vec<&SocketStats> = self.workers.iter().map(|w| &w.stats).collect();
        reduce(&sources)
    }
}

/// resources handed to the threads at `start`
struct StartSeeds {
    manager_poll: Poll,
    listener: TcpListener,
    rx: Receiver<ManagerCmd>,
    worker_polls: Vec<Poll>,
}

/// The cluster I/O engine. Create it once with the node's own address and
///  the two collaborator seams, then `start` the manager and worker
///  threads. All further interaction goes through the machine and send
///  queue methods. The engine is start-once; there is no teardown beyond
///  process exit.
pub struct ClusterEngine {
    shared: Arc<Shared>,
    seeds: Mutex<Option<StartSeeds>>,
}

impl ClusterEngine {
    pub fn new(
        config: ClusterConfig,
        my_ip: Ipv4Addr,
        sessions: Arc<dyn SessionStore>,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<ClusterEngine> {
        config.validate()?;

        let registry = MachineRegistry::new(config.max_machines);
        let pool = SocketPool::new(&config, &registry);
        let flow = FlowControl::new(&config);

        let mut worker_polls = Vec::with_capacity(config.worker_threads);
        let mut workers = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads {
            let poll = Poll::new()?;
            workers.push(WorkerShared {
                index,
                registry: poll.registry().try_clone()?,
                active: Mutex::new(Vec::new()),
                stats: SocketStats::default(),
            });
            worker_polls.push(poll);
        }

        let manager_poll = Poll::new()?;
        let manager_waker = Waker::new(manager_poll.registry(), WAKER_TOKEN)?;

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(my_ip, config.cluster_port));
        let mut listener = TcpListener::bind(bind_addr)?;
        manager_poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        info!("cluster engine listening on {}", bind_addr);

        // the local node occupies a regular registry slot
        registry.add_machine(my_ip, config.cluster_port)?;

        let (manager_tx, rx) = channel();

        let shared = Arc::new(Shared {
            config,
            my_ip,
            epoch: Instant::now(),
            registry,
            pool,
            flow,
            workers,
            sessions,
            handler,
            manager_tx,
            manager_waker,
        });

        Ok(ClusterEngine {
            shared,
            seeds: Mutex::new(Some(StartSeeds {
                manager_poll,
                listener,
                rx,
                worker_polls,
            })),
        })
    }

    /// Spawn the manager thread and the worker threads. May be called once.
    pub fn start(&self) -> anyhow::Result<()> {
        let Some(seeds) = self.seeds.lock().unwrap().take() else {
            bail!("cluster engine is already started");
        };

        let manager = ConnectionManager::new(
            self.shared.clone(),
            seeds.manager_poll,
            seeds.listener,
            seeds.rx,
        );
        std::thread::Builder::new()
            .name("cluster-conn".to_string())
            .spawn(move || manager.run())?;

        for (index, poll) in seeds.worker_polls.into_iter().enumerate() {
            let shared = self.shared.clone();
            std::thread::Builder::new()
                .name(format!("cluster-io-{}", index))
                .spawn(move || worker_loop(shared, index, poll))?;
        }
        Ok(())
    }

    pub fn my_ip(&self) -> Ipv4Addr {
        self.shared.my_ip
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.shared.config
    }

    /// register a peer in the roster
    pub fn add_machine(
        &self,
        ip: Ipv4Addr,
        cluster_port: u16,
    ) -> anyhow::Result<Arc<ClusterMachine>> {
        self.shared.registry.add_machine(ip, cluster_port)
    }

    pub fn get_machine(&self, ip: Ipv4Addr) -> Option<Arc<ClusterMachine>> {
        self.shared.registry.get_machine(ip)
    }

    /// open the client half of the connections to a peer (asynchronous;
    ///  the peer shows up via the machine-change callback once reachable)
    pub fn machine_make_connections(&self, machine: &Arc<ClusterMachine>) {
        self.shared
            .send_manager_cmd(ManagerCmd::MakeConnections(machine.clone()));
    }

    /// stop reconnecting to a peer; its pending connect contexts return to
    ///  the free list
    pub fn machine_stop_reconnect(&self, machine: &Arc<ClusterMachine>) {
        self.shared
            .send_manager_cmd(ManagerCmd::StopReconnect(machine.ip));
    }

    /// one of the peer's connected sockets, round-robin across calls - the
    ///  send-side load spreading entry point
    pub fn get_socket_context(&self, machine: &ClusterMachine) -> Option<Arc<SocketContext>> {
        let slot = self.shared.registry.round_robin_connection(machine.ip)?;
        Some(self.shared.pool.get(slot).clone())
    }

    /// Enqueue a message on a socket. `session_version` must be the value
    ///  of `sock.version()` captured when the session was bound to the
    ///  socket; a mismatch (the socket was closed in between) rejects with
    ///  `StaleSession`.
    pub fn push_to_send_queue(
        &self,
        sock: &Arc<SocketContext>,
        msg: OutMessage,
        priority: MessagePriority,
        session_version: u64,
    ) -> Result<(), SockError> {
        send_queue::push_to_send_queue(
            sock,
            self.shared.worker_stats(sock),
            msg,
            priority,
            session_version,
            self.shared.now_ns(),
        )
    }

    /// Insert an urgent frame at the head of a queue, behind an in-flight
    ///  head message if there is one.
    pub fn insert_into_send_queue_head(
        &self,
        sock: &Arc<SocketContext>,
        msg: OutMessage,
        priority: MessagePriority,
    ) {
        send_queue::insert_into_send_queue_head(
            sock,
            self.shared.worker_stats(sock),
            msg,
            priority,
            self.shared.now_ns(),
        );
    }

    /// a fresh session id originating from this node
    pub fn new_session_id(&self, seq: u32) -> SessionId {
        SessionId {
            ip: self.shared.my_ip,
            timestamp: self.shared.unix_now(),
            seq,
        }
    }

    /// reduction of all workers' I/O counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockMessageHandler, MockSessionStore};

    fn test_engine() -> ClusterEngine {
        let config = ClusterConfig {
            cluster_port: 0, // ephemeral
            worker_threads: 1,
            max_machines: 4,
            connections_per_machine: 2,
            ..ClusterConfig::default()
        };
        ClusterEngine::new(
            config,
            Ipv4Addr::new(127, 0, 0, 1),
            Arc::new(MockSessionStore::new()),
            Arc::new(MockMessageHandler::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_engine_is_start_once() {
        let engine = test_engine();
        engine.start().unwrap();
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_machine_roster() {
        let engine = test_engine();
        let machine = engine.add_machine(Ipv4Addr::new(127, 0, 0, 9), 9999).unwrap();
        assert_eq!(machine.cluster_port, 9999);
        assert!(engine.get_machine(Ipv4Addr::new(127, 0, 0, 9)).is_some());
        assert!(engine.get_machine(Ipv4Addr::new(127, 0, 0, 8)).is_none());

        // no connection yet - no socket context to hand out
        assert!(engine.get_socket_context(&machine).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClusterConfig {
            connections_per_machine: 3,
            ..ClusterConfig::default()
        };
        let result = ClusterEngine::new(
            config,
            Ipv4Addr::new(127, 0, 0, 1),
            Arc::new(MockSessionStore::new()),
            Arc::new(MockMessageHandler::new()),
        );
        assert!(result.is_err());
    }
}
