use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::error::SockError;
use crate::engine::Shared;
use crate::machine::ClusterMachine;
use crate::nio::worker::promote_sock;
use crate::sock::context::{ConnectType, SocketContext};
use crate::wire::hello::{negotiate, HelloMessage};
use crate::wire::{
    MsgHeader, SessionId, FUNC_ID_HELLO_REQUEST, FUNC_ID_HELLO_RESPONSE, MSG_SEQ_NO_SESSION,
};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// per sweep, at most this many timed-out handshakes are reaped
const MAX_TIMEOUT_SOCKET_COUNT: usize = 64;
/// first reconnect delay; doubles per attempt
const INITIAL_RECONNECT_INTERVAL_MS: u64 = 100;
/// back-off cap while the peer is considered dead
const DEAD_RECONNECT_CAP_MS: u64 = 1000;
/// back-off cap while the peer is (still) considered alive
const ALIVE_RECONNECT_CAP_MS: u64 = 30_000;
/// a peer that sent nothing within this window after connecting is dropped
const HELLO_RECV_TIMEOUT_MS: u64 = 1000;

const HELLO_FRAME_LEN: usize = MsgHeader::SERIALIZED_LEN + HelloMessage::SERIALIZED_LEN;

/// Work routed to the manager thread from the engine API and the workers.
pub(crate) enum ManagerCmd {
    /// open the client half of the connections to a peer
    MakeConnections(Arc<ClusterMachine>),
    /// a worker closed a client-role socket; re-enter the connect cycle
    Reconnect(usize),
    /// stop reconnecting to a peer; pending contexts are released
    StopReconnect(std::net::Ipv4Addr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectState {
    NotConnect,
    Connecting,
    Connected,
    SendData,
    RecvData,
}

/// Pre-handshake state of one socket, owned by the manager thread. A
///  client-role context survives failures (for reconnect back-off); a
///  server-role context is released on any failure.
struct ConnectContext {
    sock: Arc<SocketContext>,
    stream: Option<TcpStream>,
    state: ConnectState,
    buf: [u8; HELLO_FRAME_LEN],
    send_bytes: usize,
    recv_bytes: usize,
    connect_start: u64,
    server_start: u64,
    reconnect_interval: u64,
    connect_count: u32,
    need_reconnect: bool,
    need_check_timeout: bool,
    registered: bool,
}

impl ConnectContext {
    fn new(sock: Arc<SocketContext>) -> ConnectContext {
        ConnectContext {
            sock,
            stream: None,
            state: ConnectState::NotConnect,
            buf: [0u8; HELLO_FRAME_LEN],
            send_bytes: 0,
            recv_bytes: 0,
            connect_start: 0,
            server_start: 0,
            reconnect_interval: INITIAL_RECONNECT_INTERVAL_MS,
            connect_count: 0,
            need_reconnect: false,
            need_check_timeout: false,
            registered: false,
        }
    }
}

/// what the state machine wants next for a context
enum HandshakeAction {
    /// wait for the next event with this interest
    Arm(Interest),
    /// handshake complete - hand the socket to its worker
    Promote,
    /// tear the attempt down
    Fail(SockError),
    /// nothing to do right now
    Pending,
}

/// The connection-setup thread: owns the listening socket and every socket
///  between `connect`/`accept` and the end of the hello exchange. Once per
///  second it also reduces the worker counters and re-derives the flow
///  control scalars.
pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
    poll: Poll,
    listener: TcpListener,
    rx: Receiver<ManagerCmd>,
    contexts: Vec<Option<ConnectContext>>,
    max_contexts: usize,
    last_stat_ms: u64,
}

impl ConnectionManager {
    pub(crate) fn new(
        shared: Arc<Shared>,
        poll: Poll,
        listener: TcpListener,
        rx: Receiver<ManagerCmd>,
    ) -> ConnectionManager {
        let max_contexts =
            shared.config.max_machines * shared.config.connections_per_machine + 1;
        ConnectionManager {
            shared,
            poll,
            listener,
            rx,
            contexts: Vec::new(),
            max_contexts,
            last_stat_ms: 0,
        }
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        debug!("connection manager started");

        loop {
            let now = self.shared.now_ms();
            if now.saturating_sub(self.last_stat_ms) >= 1000 {
                let snapshot = self.shared.stats_snapshot();
                snapshot.log();
                self.shared
                    .flow
                    .recalc(&self.shared.config, snapshot.send_bytes, now);
                self.last_stat_ms = now;
            }

            while let Ok(cmd) = self.rx.try_recv() {
                self.handle_cmd(cmd);
            }

            self.do_reconnect();

            if let Err(e) = self.poll.poll(&mut events, Some(Duration::from_millis(100))) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("connection manager: event poll fail: {}", e);
                std::process::abort();
            }

            let ready: Vec<(Token, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_error()))
                .collect();
            for (token, is_error) in ready {
                match token {
                    LISTENER_TOKEN => self.accept_loop(),
                    WAKER_TOKEN => {} // commands are drained at the top of the loop
                    Token(idx) => {
                        if is_error {
                            if let Some(ctx) = self.contexts.get(idx).and_then(|c| c.as_ref()) {
                                debug!(
                                    "connect {} {} fail, connection closed",
                                    if ctx.sock.role() == ConnectType::Server { "from" } else { "to" },
                                    ctx.sock.peer_label()
                                );
                            }
                            self.release_connection(idx);
                        } else {
                            self.connection_handler(idx);
                        }
                    }
                }
            }

            self.close_timeout_connections();
        }
    }

    fn handle_cmd(&mut self, cmd: ManagerCmd) {
        match cmd {
            ManagerCmd::MakeConnections(machine) => {
                self.shared.sessions.init_machine_sessions(&machine);
                for _ in 0..self.shared.config.half_connections() {
                    let Some(sock) = self
                        .shared
                        .pool
                        .alloc_connect_context(&self.shared.registry, machine.ip)
                    else {
                        warn!("no free connect context for {}", machine.ip);
                        break;
                    };
                    self.make_connection(sock);
                }
            }
            ManagerCmd::Reconnect(slot) => {
                let sock = self.shared.pool.get(slot).clone();
                self.make_connection(sock);
            }
            ManagerCmd::StopReconnect(ip) => {
                let mut count = 0;
                for ctx in self.contexts.iter_mut().flatten() {
                    if ctx.sock.peer_ip() == Some(ip) {
                        ctx.need_reconnect = false;
                        count += 1;
                    }
                }
                debug!("stop reconnect to {}: {} pending contexts", ip, count);
            }
        }
    }

    fn find_context(&self, sock_slot: usize) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.as_ref().is_some_and(|ctx| ctx.sock.slot() == sock_slot))
    }

    fn alloc_context_index(&mut self) -> Option<usize> {
        if let Some(idx) = self.contexts.iter().position(|c| c.is_none()) {
            return Some(idx);
        }
        if self.contexts.len() < self.max_contexts {
            self.contexts.push(None);
            return Some(self.contexts.len() - 1);
        }
        debug!("exceeds max connection count: {}", self.max_contexts);
        None
    }

    fn make_connection(&mut self, sock: Arc<SocketContext>) {
        if self.find_context(sock.slot()).is_some() {
            debug!("connection for slot {} already exists", sock.slot());
            return;
        }
        let Some(idx) = self.alloc_context_index() else {
            warn!("no free connect context slot for {}", sock.peer_label());
            return;
        };

        let mut ctx = ConnectContext::new(sock);
        ctx.need_reconnect = true;
        self.contexts[idx] = Some(ctx);
        self.do_connect(idx);
    }

    fn do_connect(&mut self, idx: usize) {
        let now = self.shared.now_ms();
        let registry = self.poll.registry();

        let Some(ctx) = self.contexts[idx].as_mut() else {
            return;
        };
        let Some(machine) = ctx.sock.machine() else {
            warn!("connect context {} has no machine", idx);
            return;
        };

        ctx.connect_count += 1;
        ctx.state = ConnectState::Connecting;
        ctx.connect_start = now;
        ctx.need_check_timeout = true;
        ctx.registered = false;

        let addr = SocketAddr::V4(SocketAddrV4::new(machine.ip, machine.cluster_port));
        match start_connect(self.shared.my_ip, addr) {
            Ok(mut stream) => {
                match registry.register(&mut stream, Token(idx), Interest::WRITABLE) {
                    Ok(()) => {
                        ctx.registered = true;
                        ctx.stream = Some(stream);
                    }
                    Err(e) => {
                        // stream drops closed; do_reconnect retries later
                        error!("event poll attach fail: {}", e);
                    }
                }
            }
            Err(e) => {
                debug!(
                    "connect to {}:{} failed: {}",
                    machine.hostname, machine.cluster_port, e
                );
            }
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.deal_income_connection(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn deal_income_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            error!("setsockopt failed: {}", e);
        }

        let IpAddr::V4(ip) = addr.ip() else {
            debug!("rejecting non-IPv4 peer {}", addr);
            return;
        };
        if self.shared.registry.get_machine(ip).is_none() {
            debug!("client {} not in my machine list", ip);
            return;
        }
        let Some(sock) = self
            .shared
            .pool
            .alloc_accept_context(&self.shared.registry, ip)
        else {
            debug!(
                "client {}: too many income connections, exceeds {}",
                ip,
                self.shared.config.half_connections()
            );
            return;
        };

        let Some(idx) = self.alloc_context_index() else {
            self.shared.pool.free_context(&self.shared.registry, &sock);
            return;
        };

        let mut ctx = ConnectContext::new(sock);
        ctx.stream = Some(stream);
        ctx.state = ConnectState::Connected;
        ctx.need_check_timeout = true;
        self.contexts[idx] = Some(ctx);

        self.connection_handler(idx);
    }

    fn connection_handler(&mut self, idx: usize) {
        match self.advance_state(idx) {
            HandshakeAction::Pending => {}
            HandshakeAction::Arm(interest) => {
                let registry = self.poll.registry();
                let Some(ctx) = self.contexts[idx].as_mut() else {
                    return;
                };
                let Some(stream) = ctx.stream.as_mut() else {
                    return;
                };
                let result = if ctx.registered {
                    registry.reregister(stream, Token(idx), interest)
                } else {
                    registry.register(stream, Token(idx), interest)
                };
                match result {
                    Ok(()) => ctx.registered = true,
                    Err(e) => {
                        error!("event poll control fail: {}", e);
                        self.release_connection(idx);
                    }
                }
            }
            HandshakeAction::Promote => self.finish_handshake(idx),
            HandshakeAction::Fail(e) => {
                if let Some(ctx) = self.contexts[idx].as_ref() {
                    debug!(
                        "connect {} {} fail: {}",
                        if ctx.sock.role() == ConnectType::Server { "from" } else { "to" },
                        ctx.sock.peer_label(),
                        e
                    );
                }
                self.release_connection(idx);
            }
        }
    }

    /// Drive the handshake state machine as far as the socket allows.
    ///  Role conditions the transitions: the client sends the hello request
    ///  and awaits the response; the acceptor awaits the request, validates
    ///  it and answers.
    fn advance_state(&mut self, idx: usize) -> HandshakeAction {
        let shared = self.shared.clone();
        let now_ms = shared.now_ms();
        let unix_now = shared.unix_now();

        let Some(ctx) = self.contexts[idx].as_mut() else {
            return HandshakeAction::Pending;
        };
        let role = ctx.sock.role();

        loop {
            match ctx.state {
                ConnectState::NotConnect => return HandshakeAction::Pending,

                ConnectState::Connecting => {
                    let Some(stream) = ctx.stream.as_ref() else {
                        return HandshakeAction::Pending;
                    };
                    match stream.take_error() {
                        Ok(None) => {}
                        Ok(Some(e)) => return HandshakeAction::Fail(e.into()),
                        Err(e) => return HandshakeAction::Fail(e.into()),
                    }
                    match stream.peer_addr() {
                        Ok(_) => ctx.state = ConnectState::Connected,
                        Err(e) if e.kind() == ErrorKind::NotConnected => {
                            // spurious wakeup, the connect is still in flight
                            return HandshakeAction::Pending;
                        }
                        Err(e) => return HandshakeAction::Fail(e.into()),
                    }
                }

                ConnectState::Connected => {
                    if role == ConnectType::Client {
                        fill_hello_frame(
                            &mut ctx.buf,
                            FUNC_ID_HELLO_REQUEST,
                            shared.my_ip,
                            unix_now,
                        );
                        ctx.send_bytes = 0;
                        ctx.state = ConnectState::SendData;
                        return HandshakeAction::Arm(Interest::WRITABLE);
                    }
                    ctx.recv_bytes = 0;
                    ctx.server_start = now_ms;
                    ctx.state = ConnectState::RecvData;
                    return HandshakeAction::Arm(Interest::READABLE);
                }

                ConnectState::SendData => {
                    let Some(stream) = ctx.stream.as_mut() else {
                        return HandshakeAction::Fail(SockError::PeerClosed);
                    };
                    while ctx.send_bytes < HELLO_FRAME_LEN {
                        match stream.write(&ctx.buf[ctx.send_bytes..]) {
                            Ok(0) => return HandshakeAction::Fail(SockError::PeerClosed),
                            Ok(n) => ctx.send_bytes += n,
                            Err(e) => match SockError::from(e) {
                                SockError::Interrupted => continue,
                                SockError::WouldBlock => {
                                    return HandshakeAction::Arm(Interest::WRITABLE)
                                }
                                other => return HandshakeAction::Fail(other),
                            },
                        }
                    }

                    if role == ConnectType::Client {
                        ctx.recv_bytes = 0;
                        ctx.server_start = now_ms;
                        ctx.state = ConnectState::RecvData;
                        return HandshakeAction::Arm(Interest::READABLE);
                    }
                    // the acceptor's hello response is out - handshake done
                    return HandshakeAction::Promote;
                }

                ConnectState::RecvData => {
                    let Some(stream) = ctx.stream.as_mut() else {
                        return HandshakeAction::Fail(SockError::PeerClosed);
                    };
                    while ctx.recv_bytes < HELLO_FRAME_LEN {
                        match stream.read(&mut ctx.buf[ctx.recv_bytes..]) {
                            Ok(0) => return HandshakeAction::Fail(SockError::PeerClosed),
                            Ok(n) => ctx.recv_bytes += n,
                            Err(e) => match SockError::from(e) {
                                SockError::Interrupted => continue,
                                SockError::WouldBlock => {
                                    return HandshakeAction::Arm(Interest::READABLE)
                                }
                                other => return HandshakeAction::Fail(other),
                            },
                        }
                    }

                    if let Err(e) = deal_hello_frame(&ctx.buf, role, &ctx.sock) {
                        return HandshakeAction::Fail(SockError::ProtocolError(e.to_string()));
                    }

                    if role == ConnectType::Client {
                        return HandshakeAction::Promote;
                    }
                    fill_hello_frame(
                        &mut ctx.buf,
                        FUNC_ID_HELLO_RESPONSE,
                        shared.my_ip,
                        unix_now,
                    );
                    ctx.send_bytes = 0;
                    ctx.state = ConnectState::SendData;
                    return HandshakeAction::Arm(Interest::WRITABLE);
                }
            }
        }
    }

    /// Promotion: take the socket off the manager's poll and hand it to its
    ///  worker. The client-role connect context is consumed on success.
    fn finish_handshake(&mut self, idx: usize) {
        let Some(mut ctx) = self.contexts[idx].take() else {
            return;
        };
        let Some(mut stream) = ctx.stream.take() else {
            return;
        };
        if ctx.registered {
            let _ = self.poll.registry().deregister(&mut stream);
            ctx.registered = false;
        }

        match promote_sock(&self.shared, &ctx.sock, stream) {
            Ok(()) => {
                trace!("{} handshake complete, socket promoted", ctx.sock.peer_label());
            }
            Err(e) => {
                error!("promoting {} failed: {}", ctx.sock.peer_label(), e);
                match ctx.sock.role() {
                    ConnectType::Server => {
                        self.shared.pool.free_context(&self.shared.registry, &ctx.sock);
                    }
                    ConnectType::Client => {
                        // keep the context; the back-off cycle re-connects
                        ctx.state = ConnectState::NotConnect;
                        self.contexts[idx] = Some(ctx);
                    }
                }
            }
        }
    }

    /// Failure path short of promotion: close the socket. A server-role
    ///  context goes back to the accept free list; a client-role context
    ///  stays for the reconnect cycle.
    fn release_connection(&mut self, idx: usize) {
        let registry = self.poll.registry();
        let Some(ctx) = self.contexts.get_mut(idx).and_then(|c| c.as_mut()) else {
            return;
        };

        if let Some(mut stream) = ctx.stream.take() {
            if ctx.registered {
                let _ = registry.deregister(&mut stream);
            }
            ctx.registered = false;
        }
        ctx.state = ConnectState::NotConnect;

        if ctx.sock.role() == ConnectType::Server {
            let ctx = self.contexts[idx].take().unwrap();
            self.shared.pool.free_context(&self.shared.registry, &ctx.sock);
        }
    }

    /// Revive failed client-role contexts whose back-off elapsed, doubling
    ///  the interval each attempt (capped at 1 s for dead peers, 30 s
    ///  otherwise). Contexts told to stop reconnecting are released.
    fn do_reconnect(&mut self) {
        let now = self.shared.now_ms();
        let mut to_connect = Vec::new();
        let mut to_free = Vec::new();

        for (idx, entry) in self.contexts.iter_mut().enumerate() {
            let Some(ctx) = entry.as_mut() else {
                continue;
            };
            if ctx.stream.is_some() {
                continue;
            }

            if !ctx.need_reconnect {
                to_free.push(idx);
                continue;
            }
            if ctx.connect_count == 0 {
                to_connect.push(idx);
                continue;
            }
            if now.saturating_sub(ctx.connect_start) < ctx.reconnect_interval {
                continue;
            }

            let cap = if ctx.sock.machine().map(|m| m.is_dead()).unwrap_or(true) {
                DEAD_RECONNECT_CAP_MS
            } else {
                ALIVE_RECONNECT_CAP_MS
            };
            ctx.reconnect_interval = (ctx.reconnect_interval * 2).min(cap);
            ctx.need_check_timeout = false;
            to_connect.push(idx);
        }

        for idx in to_free {
            if let Some(ctx) = self.contexts[idx].take() {
                self.shared.pool.free_context(&self.shared.registry, &ctx.sock);
            }
        }
        for idx in to_connect {
            self.do_connect(idx);
        }
    }

    /// Reap handshakes stuck in CONNECTING (connect timeout) or RECV_DATA
    ///  (silent peer), up to 64 per sweep.
    fn close_timeout_connections(&mut self) {
        let now = self.shared.now_ms();
        let connect_timeout_ms = self.shared.config.connect_timeout.as_millis() as u64;

        let mut timed_out = Vec::new();
        for (idx, entry) in self.contexts.iter().enumerate() {
            let Some(ctx) = entry.as_ref() else {
                continue;
            };
            if !ctx.need_check_timeout || ctx.stream.is_none() {
                continue;
            }

            let is_timeout = match ctx.state {
                ConnectState::RecvData => {
                    now.saturating_sub(ctx.server_start) >= HELLO_RECV_TIMEOUT_MS
                }
                ConnectState::Connecting => {
                    now.saturating_sub(ctx.connect_start) >= connect_timeout_ms
                }
                _ => false,
            };
            if is_timeout {
                timed_out.push(idx);
                if timed_out.len() == MAX_TIMEOUT_SOCKET_COUNT {
                    break;
                }
            }
        }

        for idx in timed_out {
            if let Some(ctx) = self.contexts[idx].as_ref() {
                debug!(
                    "close timeout {} connection to {}",
                    if ctx.state == ConnectState::RecvData { "recv" } else { "connect" },
                    ctx.sock.peer_label()
                );
            }
            self.release_connection(idx);
        }
    }
}

/// Begin a non-blocking connect, with the source explicitly bound to the
///  node's own address - the peer identifies us by the source ip.
fn start_connect(my_ip: std::net::Ipv4Addr, addr: SocketAddr) -> std::io::Result<TcpStream> {
    use socket2::{Domain, SockAddr, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(my_ip, 0)))?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from_std(std::net::TcpStream::from(socket)))
}

/// serialize a hello frame (header + version payload) into the handshake
///  scratch buffer
fn fill_hello_frame(
    buf: &mut [u8; HELLO_FRAME_LEN],
    func_id: i32,
    my_ip: std::net::Ipv4Addr,
    unix_now: u32,
) {
    let header = MsgHeader::for_body(
        func_id,
        HelloMessage::SERIALIZED_LEN as u32,
        SessionId {
            ip: my_ip,
            timestamp: unix_now,
            seq: 0,
        },
        MSG_SEQ_NO_SESSION,
    );

    let mut cursor = &mut buf[..];
    header.ser(&mut cursor);
    HelloMessage::local().ser(&mut cursor);
}

/// validate a received hello frame and record the negotiated protocol
///  version on the peer record
fn deal_hello_frame(
    buf: &[u8; HELLO_FRAME_LEN],
    role: ConnectType,
    sock: &Arc<SocketContext>,
) -> anyhow::Result<()> {
    let mut slice = &buf[..];
    let header = MsgHeader::deser(&mut slice)?;

    if header.data_len as usize != HelloMessage::SERIALIZED_LEN {
        anyhow::bail!(
            "hello message length {} != {}",
            header.data_len,
            HelloMessage::SERIALIZED_LEN
        );
    }
    let expected_func_id = if role == ConnectType::Client {
        FUNC_ID_HELLO_RESPONSE
    } else {
        FUNC_ID_HELLO_REQUEST
    };
    if header.func_id != expected_func_id {
        anyhow::bail!(
            "invalid function id: {} != {}",
            header.func_id,
            expected_func_id
        );
    }

    let peer_hello = HelloMessage::deser(&mut slice)?;
    let (major, minor) = negotiate(&HelloMessage::local(), &peer_hello)?;

    if let Some(machine) = sock.machine() {
        machine.set_proto_version(major, minor);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::context::SocketContext;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_hello_frame_round_trip() {
        let mut buf = [0u8; HELLO_FRAME_LEN];
        fill_hello_frame(&mut buf, FUNC_ID_HELLO_REQUEST, Ipv4Addr::new(10, 0, 0, 1), 1234);

        let sock = Arc::new(SocketContext::new(1, ConnectType::Server, 0));
        deal_hello_frame(&buf, ConnectType::Server, &sock).unwrap();
    }

    #[test]
    fn test_hello_frame_wrong_direction_rejected() {
        let mut buf = [0u8; HELLO_FRAME_LEN];
        fill_hello_frame(&mut buf, FUNC_ID_HELLO_REQUEST, Ipv4Addr::new(10, 0, 0, 1), 1234);

        // a client expects a response, not a request
        let sock = Arc::new(SocketContext::new(1, ConnectType::Client, 0));
        assert!(deal_hello_frame(&buf, ConnectType::Client, &sock).is_err());
    }

    #[test]
    fn test_hello_records_negotiated_version() {
        let registry = crate::machine::MachineRegistry::new(4);
        let machine = registry.add_machine(Ipv4Addr::new(10, 0, 0, 1), 8086).unwrap();

        let sock = SocketContext::new(1, ConnectType::Server, 0);
        *sock.machine.lock().unwrap() = Some(machine.clone());
        sock.connected.store(false, Ordering::Release);
        let sock = Arc::new(sock);

        let mut buf = [0u8; HELLO_FRAME_LEN];
        fill_hello_frame(&mut buf, FUNC_ID_HELLO_REQUEST, Ipv4Addr::new(10, 0, 0, 1), 1234);
        deal_hello_frame(&buf, ConnectType::Server, &sock).unwrap();

        let local = HelloMessage::local();
        assert_eq!(machine.proto_version(), (local.major, local.minor));
    }
}
