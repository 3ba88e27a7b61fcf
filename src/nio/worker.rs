use anyhow::anyhow;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{ErrorKind, Read};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::conn::manager::ManagerCmd;
use crate::engine::Shared;
use crate::error::SockError;
use crate::nio::dispatch::deal_message;
use crate::nio::out_message::{MessagePriority, OutMessage};
use crate::nio::send_queue::{clear_send_queue, insert_into_send_queue_head};
use crate::nio::send_scheduler::{deal_write_event, WriteBatch, IoProgress};
use crate::sock::context::{ConnectType, SocketContext};
use crate::stats::SocketStats;
use crate::wire::{MsgHeader, SessionId, FUNC_ID_PING_REQUEST, MSG_SEQ_NO_SESSION};

/// at most this many sockets are torn down per write pass
const MAX_FAIL_SOCK_COUNT: usize = 32;
/// loop pacing below this is not worth a sleep syscall
const MIN_USLEEP_US: u64 = 100;

/// Cross-thread face of one worker: the handle other threads use to
///  register sockets with its poll, its share of the active set and its
///  counters. The `Poll` itself stays with the worker thread.
pub(crate) struct WorkerShared {
    pub(crate) index: usize,
    pub(crate) registry: Registry,
    pub(crate) active: Mutex<Vec<usize>>,
    pub(crate) stats: SocketStats,
}

/// Thread body of one I/O worker: a write pass over the active sockets, a
///  short blocking poll, a read drain per ready socket, then loop pacing.
pub(crate) fn worker_loop(shared: Arc<Shared>, index: usize, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);
    let mut batch = WriteBatch::new();
    let mut frames: Vec<(MsgHeader, Vec<Bytes>)> = Vec::new();

    debug!("cluster worker {} started", index);
    loop {
        let loop_start = shared.now_ns();
        let worker = &shared.workers[index];

        schedule_sock_write(&shared, index, &mut batch);

        let poll_start = shared.now_ns();
        worker.stats.incr(|s| &s.epoll_wait_count);
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(1))) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            // a broken poll set is not recoverable
            error!("worker {}: event poll fail: {}", index, e);
            std::process::abort();
        }
        worker
            .stats
            .add(|s| &s.epoll_wait_time_used, shared.now_ns() - poll_start);

        for event in events.iter() {
            let slot = event.token().0;
            if slot >= shared.pool.len() {
                continue;
            }
            let sock = shared.pool.get(slot).clone();
            if !sock.is_connected() {
                continue;
            }

            if event.is_error() {
                debug!("connection {} closed (socket error)", sock.peer_label());
                close_socket(&shared, &sock);
                continue;
            }

            loop {
                match deal_read_event(&shared, index, &sock, &mut frames) {
                    Ok(IoProgress::Progress) => continue,
                    Ok(IoProgress::Idle) => break,
                    Err(e) => {
                        match &e {
                            SockError::PeerClosed => {
                                debug!("connection {} closed", sock.peer_label())
                            }
                            other => error!("read from {} fail: {}", sock.peer_label(), other),
                        }
                        close_socket(&shared, &sock);
                        break;
                    }
                }
            }
        }

        // pace the loop if flow control stretched the interval
        let interval_us = shared.flow.io_loop_interval_us();
        if interval_us > MIN_USLEEP_US {
            let elapsed_us = (shared.now_ns() - loop_start) / 1000;
            let remain = interval_us.saturating_sub(elapsed_us);
            if remain >= MIN_USLEEP_US {
                worker.stats.incr(|s| &s.loop_usleep_count);
                worker.stats.add(|s| &s.loop_usleep_time, remain);
                std::thread::sleep(Duration::from_micros(remain));
            }
        }
    }
}

/// The per-iteration write pass: for every active socket past its write
///  deadline, account ping liveness, then drain its queues until the
///  socket blocks. Failed sockets are collected and closed at the end.
fn schedule_sock_write(shared: &Arc<Shared>, index: usize, batch: &mut WriteBatch) {
    let worker = &shared.workers[index];
    let config = &shared.config;

    let now = shared.now_ns();
    let send_wait = shared.flow.send_wait_time_ns();
    let ping_interval = config.ping_send_interval.as_nanos() as u64;
    let latency_threshold = config.ping_latency_threshold.as_nanos() as u64;

    let active: Vec<usize> = worker.active.lock().unwrap().clone();
    let mut fail_socks: Vec<Arc<SocketContext>> = Vec::new();

    for slot in active {
        let sock = shared.pool.get(slot).clone();
        if !sock.is_connected() {
            continue;
        }
        if now < sock.next_write_time.load(Ordering::Relaxed) {
            continue;
        }

        let ping_start = sock.ping_start_time.load(Ordering::Relaxed);
        if ping_start > 0 {
            // a ping is in flight - check it against the latency threshold
            if now.saturating_sub(ping_start) > latency_threshold {
                sock.ping_start_time.store(0, Ordering::Relaxed);
                let fails = sock.ping_fail_count.fetch_add(1, Ordering::Relaxed) + 1;
                if fails > config.ping_retries {
                    if fail_socks.len() < MAX_FAIL_SOCK_COUNT {
                        error!(
                            "ping server {} timeout more than {} times, closing socket",
                            sock.peer_label(),
                            config.ping_retries
                        );
                        fail_socks.push(sock.clone());
                    }
                    continue;
                }
                warn!(
                    "ping server {} timeout, fail count: {}",
                    sock.peer_label(),
                    fails
                );
            }
        } else if ping_interval > 0 && now >= sock.next_ping_time.load(Ordering::Relaxed) {
            worker.stats.incr(|s| &s.ping_total_count);
            sock.ping_start_time.store(now, Ordering::Relaxed);
            sock.next_ping_time
                .store(now + ping_interval, Ordering::Relaxed);
            send_ping_message(shared, &sock, &worker.stats, now);
        }

        let outcome = loop {
            match deal_write_event(&sock, &worker.stats, batch, shared.now_ns()) {
                Ok(IoProgress::Progress) => continue,
                other => break other,
            }
        };
        match outcome {
            Ok(IoProgress::Idle) => {
                sock.next_write_time.store(now + send_wait, Ordering::Relaxed);
            }
            Ok(IoProgress::Progress) => unreachable!(),
            Err(e) => {
                match &e {
                    SockError::PeerClosed => debug!("connection {} closed", sock.peer_label()),
                    other => error!("write to {} fail: {}", sock.peer_label(), other),
                }
                if fail_socks.len() < MAX_FAIL_SOCK_COUNT {
                    fail_socks.push(sock.clone());
                }
            }
        }
    }

    for sock in fail_socks {
        close_socket(shared, &sock);
    }
}

/// ping frames are untracked (sentinel msg_seq) and jump the HIGH queue
fn send_ping_message(
    shared: &Arc<Shared>,
    sock: &Arc<SocketContext>,
    stats: &SocketStats,
    now_ns: u64,
) {
    let session = SessionId {
        ip: shared.my_ip,
        timestamp: shared.unix_now(),
        seq: 0,
    };
    let msg = OutMessage::new(FUNC_ID_PING_REQUEST, session, MSG_SEQ_NO_SESSION, &[]);
    insert_into_send_queue_head(sock, stats, msg, MessagePriority::High, now_ns);
}

/// One read opportunity: fill the framer's buffer, extract every complete
///  frame and dispatch it. `Progress` means the buffer was filled to the
///  brim and more data is likely pending.
fn deal_read_event(
    shared: &Arc<Shared>,
    index: usize,
    sock: &Arc<SocketContext>,
    frames: &mut Vec<(MsgHeader, Vec<Bytes>)>,
) -> Result<IoProgress, SockError> {
    let worker = &shared.workers[index];
    worker.stats.incr(|s| &s.call_read_count);

    let mut reader = sock.reader.lock().unwrap();
    let read_result = {
        let guard = sock.stream.lock().unwrap();
        let Some(stream) = guard.as_ref() else {
            return Err(SockError::PeerClosed);
        };
        (&*stream).read(reader.writable_slice())
    };

    let n = match read_result {
        Ok(0) => return Err(SockError::PeerClosed),
        Err(e) => match SockError::from(e) {
            SockError::WouldBlock => return Ok(IoProgress::Idle),
            SockError::Interrupted => return Ok(IoProgress::Progress),
            other => return Err(other),
        },
        Ok(n) => n,
    };

    worker.stats.add(|s| &s.recv_bytes, n as u64);
    reader.advance_written(n);
    let result = if reader.is_full() {
        IoProgress::Progress
    } else {
        IoProgress::Idle
    };

    frames.clear();
    reader.extract_frames(frames)?;
    drop(reader);

    for (header, blocks) in frames.drain(..) {
        worker.stats.incr(|s| &s.recv_msg_count);
        deal_message(
            &shared.config,
            &shared.sessions,
            &shared.handler,
            sock,
            &worker.stats,
            header,
            blocks,
            shared.now_ns(),
            shared.unix_now(),
        )?;
    }

    Ok(result)
}

/// Tear a socket down: detach and close the fd, withdraw it from the
///  active set and the peer's load list, drop everything queued (advancing
///  the version), tell the session layer, and finally either schedule a
///  reconnect (client role) or return the context to the accept free list.
pub(crate) fn close_socket(shared: &Arc<Shared>, sock: &Arc<SocketContext>) {
    let worker = &shared.workers[sock.worker_index()];

    sock.connected.store(false, Ordering::Release);
    {
        let mut guard = sock.stream.lock().unwrap();
        if let Some(mut stream) = guard.take() {
            if let Err(e) = worker.registry.deregister(&mut stream) {
                error!("event poll detach fail: {}", e);
            }
            // dropping the stream closes the fd
        }
    }

    worker.active.lock().unwrap().retain(|&s| s != sock.slot());

    if let Some(ip) = sock.peer_ip() {
        if shared.registry.remove_connection(ip, sock.slot()) {
            debug!("machine {} down", ip);
            shared.handler.machine_change(ip, false);
        }
    }

    sock.reader.lock().unwrap().clear();
    clear_send_queue(sock, &worker.stats, false);
    shared.sessions.notify_connection_closed(sock);

    match sock.role() {
        ConnectType::Client => shared.send_manager_cmd(ManagerCmd::Reconnect(sock.slot())),
        ConnectType::Server => shared.pool.free_context(&shared.registry, sock),
    }
}

/// Handoff of a post-handshake socket from the manager to its worker:
///  apply socket buffer sizing, reset the per-connection state, publish to
///  the peer's load list and attach read-only to the worker's poll. The
///  machine-up notification fires here, once per peer.
pub(crate) fn promote_sock(
    shared: &Arc<Shared>,
    sock: &Arc<SocketContext>,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let worker = &shared.workers[sock.worker_index()];
    let config = &shared.config;

    let sref = socket2::SockRef::from(&stream);
    if config.send_buffer_size > 0 {
        sref.set_send_buffer_size(config.send_buffer_size)?;
    }
    if config.receive_buffer_size > 0 {
        sref.set_recv_buffer_size(config.receive_buffer_size)?;
    }

    let now = shared.now_ns();
    sock.connected_time.store(now, Ordering::Relaxed);
    clear_send_queue(sock, &worker.stats, true);
    sock.queue_index.store(0, Ordering::Relaxed);
    sock.ping_start_time.store(0, Ordering::Relaxed);
    sock.ping_fail_count.store(0, Ordering::Relaxed);
    sock.next_write_time
        .store(now + shared.flow.send_wait_time_ns(), Ordering::Relaxed);
    sock.next_ping_time.store(
        now + config.ping_send_interval.as_nanos() as u64,
        Ordering::Relaxed,
    );
    sock.reader.lock().unwrap().reset(config.read_buffer_size);

    let machine = sock
        .machine()
        .ok_or_else(|| anyhow!("socket context {} has no machine", sock.slot()))?;
    shared.sessions.init_machine_sessions(&machine);
    let became_up = shared.registry.add_connection(machine.ip, sock.slot())?;

    {
        let mut guard = sock.stream.lock().unwrap();
        *guard = Some(stream);
        sock.connected.store(true, Ordering::Release);
        if let Err(e) = worker.registry.register(
            guard.as_mut().unwrap(),
            Token(sock.slot()),
            Interest::READABLE,
        ) {
            sock.connected.store(false, Ordering::Release);
            *guard = None;
            shared.registry.remove_connection(machine.ip, sock.slot());
            return Err(e.into());
        }
    }
    worker.active.lock().unwrap().push(sock.slot());

    if became_up {
        debug!("machine {} up", machine.ip);
        shared.handler.machine_change(machine.ip, true);
    }
    Ok(())
}
