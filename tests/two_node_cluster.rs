//! End-to-end scenarios: two engines on distinct loopback addresses
//!  (127.0.0.1 / 127.0.0.2) forming a real TCP mesh.

use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clustermesh::wire::hello::{CLUSTER_MAJOR_VERSION, CLUSTER_MINOR_VERSION};
use clustermesh::{
    ClusterConfig, ClusterEngine, ClusterMachine, MessageHandler, MessagePriority, MsgHeader,
    OutMessage, SessionDisposition, SessionId, SessionStore, SockError, SocketContext, UserData,
};

/// session layer stub: every frame is delivered synchronously
struct PassThroughSessions;

impl SessionStore for PassThroughSessions {
    fn init_machine_sessions(&self, _machine: &Arc<ClusterMachine>) {}

    fn get_response_session(
        &self,
        _header: &MsgHeader,
        _sock: &Arc<SocketContext>,
    ) -> anyhow::Result<SessionDisposition> {
        Ok(SessionDisposition::Deliver { user_data: None })
    }

    fn push_in_message(
        &self,
        _session_id: SessionId,
        _func_id: i32,
        _blocks: Vec<Bytes>,
        _data_len: usize,
    ) {
    }

    fn notify_connection_closed(&self, _sock: &Arc<SocketContext>) {}
}

#[derive(Default)]
struct RecordingHandler {
    messages: Mutex<Vec<(i32, Vec<u8>)>>,
    machine_events: Mutex<Vec<(Ipv4Addr, bool)>>,
}

impl MessageHandler for RecordingHandler {
    fn deal(
        &self,
        _session_id: SessionId,
        _user_data: Option<UserData>,
        func_id: i32,
        blocks: &[Bytes],
        data_len: usize,
    ) {
        let mut payload = Vec::with_capacity(data_len);
        for block in blocks {
            payload.extend_from_slice(block);
        }
        assert_eq!(payload.len(), data_len);
        self.messages.lock().unwrap().push((func_id, payload));
    }

    fn machine_change(&self, ip: Ipv4Addr, up: bool) {
        self.machine_events.lock().unwrap().push((ip, up));
    }
}

impl RecordingHandler {
    fn message(&self, func_id: i32) -> Option<Vec<u8>> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|(f, _)| *f == func_id)
            .map(|(_, p)| p.clone())
    }
}

fn free_port(ip: Ipv4Addr) -> u16 {
    std::net::TcpListener::bind((ip, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn node(ip: Ipv4Addr, port: u16) -> (ClusterEngine, Arc<RecordingHandler>) {
    let config = ClusterConfig {
        worker_threads: 2,
        connections_per_machine: 2,
        cluster_port: port,
        max_machines: 8,
        ping_send_interval: Duration::from_millis(200),
        ping_latency_threshold: Duration::from_secs(2),
        ..ClusterConfig::default()
    };
    let handler = Arc::new(RecordingHandler::default());
    let engine = ClusterEngine::new(config, ip, Arc::new(PassThroughSessions), handler.clone())
        .expect("engine creation");
    (engine, handler)
}

fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn test_two_node_cluster() {
    let ip_a = Ipv4Addr::new(127, 0, 0, 1);
    let ip_b = Ipv4Addr::new(127, 0, 0, 2);
    let port_a = free_port(ip_a);
    let port_b = free_port(ip_b);

    let (engine_a, _handler_a) = node(ip_a, port_a);
    let (engine_b, handler_b) = node(ip_b, port_b);

    let machine_b = engine_a.add_machine(ip_b, port_b).unwrap();
    let machine_a_on_b = engine_b.add_machine(ip_a, port_a).unwrap();

    engine_a.start().unwrap();
    engine_b.start().unwrap();

    // --- scenario: basic handshake ---
    engine_a.machine_make_connections(&machine_b);

    wait_until("both peers up", Duration::from_secs(10), || {
        machine_b.is_up() && machine_a_on_b.is_up()
    });
    assert_eq!(
        machine_b.proto_version(),
        (CLUSTER_MAJOR_VERSION, CLUSTER_MINOR_VERSION)
    );
    assert_eq!(
        machine_a_on_b.proto_version(),
        (CLUSTER_MAJOR_VERSION, CLUSTER_MINOR_VERSION)
    );

    let sock = engine_a
        .get_socket_context(&machine_b)
        .expect("a connected socket context");

    // --- small inline message ---
    let msg = OutMessage::new(7, engine_a.new_session_id(1), 1, b"hello cluster");
    engine_a
        .push_to_send_queue(&sock, msg, MessagePriority::High, sock.version())
        .unwrap();

    wait_until("small message delivery", Duration::from_secs(5), || {
        handler_b.message(7).is_some()
    });
    assert_eq!(handler_b.message(7).unwrap(), b"hello cluster");

    // --- scenario: fragmented body ---
    // 1.5 MiB, forced through the 2 MiB reader as a multi-buffer body
    let payload: Vec<u8> = (0..1_572_864usize).map(|i| (i % 251) as u8).collect();
    let blocks: Vec<Bytes> = payload
        .chunks(64 * 1024)
        .map(Bytes::copy_from_slice)
        .collect();
    let msg = OutMessage::with_blocks(9, engine_a.new_session_id(2), 2, blocks);
    let sock = engine_a.get_socket_context(&machine_b).unwrap();
    engine_a
        .push_to_send_queue(&sock, msg, MessagePriority::Low, sock.version())
        .unwrap();

    // a small follow-up on the same priority arrives right after it
    let msg = OutMessage::new(10, engine_a.new_session_id(3), 3, b"right behind");
    engine_a
        .push_to_send_queue(&sock, msg, MessagePriority::Low, sock.version())
        .unwrap();

    wait_until("large message delivery", Duration::from_secs(10), || {
        handler_b.message(10).is_some()
    });
    assert_eq!(handler_b.message(9).unwrap(), payload);
    assert_eq!(handler_b.message(10).unwrap(), b"right behind");

    // --- stale version is rejected ---
    let msg = OutMessage::new(11, engine_a.new_session_id(4), 4, b"stale");
    let result =
        engine_a.push_to_send_queue(&sock, msg, MessagePriority::High, sock.version() + 1);
    assert!(matches!(result, Err(SockError::StaleSession)));

    // --- in-band ping liveness ---
    wait_until("successful pings", Duration::from_secs(5), || {
        engine_a.stats().ping_success_count > 0 && engine_b.stats().ping_success_count > 0
    });

    // the up-notification fired exactly once per peer on both sides
    let events_b = handler_b.machine_events.lock().unwrap();
    assert_eq!(
        events_b.iter().filter(|(ip, up)| *ip == ip_a && *up).count(),
        1
    );
}

#[test]
fn test_unknown_peer_is_rejected() {
    let ip_b = Ipv4Addr::new(127, 0, 0, 2);
    let port_b = free_port(ip_b);

    let (engine_b, handler_b) = node(ip_b, port_b);
    engine_b.start().unwrap();

    // a raw connect from an address B has never heard of: B must drop it
    // without ever reporting a machine up
    let _stream = std::net::TcpStream::connect((ip_b, port_b)).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    assert!(handler_b.machine_events.lock().unwrap().is_empty());
}
