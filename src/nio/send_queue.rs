use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::error::SockError;
use crate::nio::out_message::{MessagePriority, OutMessage, PRIORITY_COUNT};
use crate::sock::context::SocketContext;
use crate::stats::SocketStats;

/// One FIFO of outbound frames. Three of these live in every socket
///  context, one per priority; the lock sits outside (in the context) so
///  the scheduler can hold it exactly for head/tail edits.
#[derive(Default)]
pub struct SendQueue {
    pub(crate) messages: VecDeque<OutMessage>,
}

/// Append a message for sending. Rejected with `StaleSession` when the
///  caller's captured socket version no longer matches (the socket was
///  closed since the session was bound to it) or the socket is not
///  connected - both checks happen under the queue lock so a concurrent
///  close cannot slip a message onto a dead queue.
pub(crate) fn push_to_send_queue(
    sock: &SocketContext,
    stats: &SocketStats,
    mut msg: OutMessage,
    priority: MessagePriority,
    session_version: u64,
    now_ns: u64,
) -> Result<(), SockError> {
    let frame_len = msg.frame_len() as u64;

    if msg.header.aligned_data_len > crate::wire::MAX_MSG_LENGTH {
        stats.incr(|s| &s.fail_msg_count);
        stats.add(|s| &s.fail_msg_bytes, frame_len);
        return Err(SockError::ProtocolError(format!(
            "message length {} exceeds {}",
            msg.header.aligned_data_len,
            crate::wire::MAX_MSG_LENGTH
        )));
    }

    {
        let mut queue = sock.send_queues[priority.index()].lock().unwrap();

        let current_version = sock.version.load(Ordering::Acquire);
        if current_version != session_version {
            debug!(
                "session version {} != socket context version {}",
                session_version, current_version
            );
            drop(queue);
            stats.incr(|s| &s.fail_msg_count);
            stats.add(|s| &s.fail_msg_bytes, frame_len);
            return Err(SockError::StaleSession);
        }
        if !sock.connected.load(Ordering::Acquire) {
            debug!("sock context {} is not connected", sock.slot());
            drop(queue);
            stats.incr(|s| &s.fail_msg_count);
            stats.add(|s| &s.fail_msg_bytes, frame_len);
            return Err(SockError::StaleSession);
        }

        msg.in_queue_time = now_ns;
        queue.messages.push_back(msg);
    }

    stats.incr(|s| &s.push_msg_count);
    stats.add(|s| &s.push_msg_bytes, frame_len);
    Ok(())
}

/// Insert an urgent internal frame (ping, control) at the front of its
///  queue. A head message with bytes already on the wire must stay the head
///  until complete, so the insert lands right behind it in that case.
///
/// Only the thread owning the socket may call this - it runs unversioned
///  and never observes a concurrent writev batch.
pub(crate) fn insert_into_send_queue_head(
    sock: &SocketContext,
    stats: &SocketStats,
    mut msg: OutMessage,
    priority: MessagePriority,
    now_ns: u64,
) {
    let frame_len = msg.frame_len() as u64;
    msg.in_queue_time = now_ns;

    {
        let mut queue = sock.send_queues[priority.index()].lock().unwrap();
        match queue.messages.front() {
            Some(head) if head.bytes_sent > 0 => {
                queue.messages.insert(1, msg);
            }
            _ => {
                queue.messages.push_front(msg);
            }
        }
    }

    stats.incr(|s| &s.push_msg_count);
    stats.add(|s| &s.push_msg_bytes, frame_len);
}

/// Drop everything still queued on the socket, advancing the version under
///  each queue lock first so concurrent enqueues are fenced out. Called on
///  promotion (anything left over is from a previous incarnation, `warning`)
///  and on close.
pub(crate) fn clear_send_queue(sock: &SocketContext, stats: &SocketStats, warning: bool) {
    let mut count = 0u64;
    let mut drop_bytes = 0u64;

    for i in 0..PRIORITY_COUNT {
        let mut queue = sock.send_queues[i].lock().unwrap();
        sock.version.fetch_add(1, Ordering::AcqRel);
        while let Some(msg) = queue.messages.pop_front() {
            drop_bytes += msg.frame_len() as u64;
            count += 1;
        }
    }

    if count > 0 {
        if warning {
            warn!("release {} message count: {}", sock.peer_label(), count);
        } else {
            debug!("release {} message count: {}", sock.peer_label(), count);
        }
        stats.add(|s| &s.drop_msg_count, count);
        stats.add(|s| &s.drop_bytes, drop_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::context::ConnectType;
    use crate::wire::SessionId;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;

    fn session() -> SessionId {
        SessionId {
            ip: Ipv4Addr::new(10, 0, 0, 1),
            timestamp: 100,
            seq: 1,
        }
    }

    fn connected_sock() -> SocketContext {
        let sock = SocketContext::new(1, ConnectType::Client, 0);
        sock.connected.store(true, Ordering::Release);
        sock
    }

    fn msg(tag: u8) -> OutMessage {
        OutMessage::new(tag as i32, session(), 0, &[tag; 16])
    }

    #[test]
    fn test_push_and_fifo_order() {
        let sock = connected_sock();
        let stats = SocketStats::default();

        push_to_send_queue(&sock, &stats, msg(1), MessagePriority::Mid, 0, 7).unwrap();
        push_to_send_queue(&sock, &stats, msg(2), MessagePriority::Mid, 0, 8).unwrap();

        let queue = sock.send_queues[1].lock().unwrap();
        let funcs: Vec<i32> = queue.messages.iter().map(|m| m.header.func_id).collect();
        assert_eq!(funcs, vec![1, 2]);
        assert_eq!(queue.messages[0].in_queue_time, 7);
        assert_eq!(stats.push_msg_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_stale_version_rejected() {
        let sock = connected_sock();
        let stats = SocketStats::default();

        let result = push_to_send_queue(&sock, &stats, msg(1), MessagePriority::High, 99, 0);
        assert!(matches!(result, Err(SockError::StaleSession)));
        assert_eq!(stats.fail_msg_count.load(Ordering::Relaxed), 1);
        assert!(sock.send_queues[0].lock().unwrap().messages.is_empty());
    }

    #[test]
    fn test_closed_socket_rejected() {
        let sock = SocketContext::new(1, ConnectType::Client, 0);
        let stats = SocketStats::default();

        let result = push_to_send_queue(&sock, &stats, msg(1), MessagePriority::High, 0, 0);
        assert!(matches!(result, Err(SockError::StaleSession)));
    }

    #[test]
    fn test_head_insert_before_unsent_head() {
        let sock = connected_sock();
        let stats = SocketStats::default();

        push_to_send_queue(&sock, &stats, msg(1), MessagePriority::High, 0, 0).unwrap();
        insert_into_send_queue_head(&sock, &stats, msg(2), MessagePriority::High, 0);

        let queue = sock.send_queues[0].lock().unwrap();
        let funcs: Vec<i32> = queue.messages.iter().map(|m| m.header.func_id).collect();
        assert_eq!(funcs, vec![2, 1]);
    }

    #[test]
    fn test_head_insert_lands_behind_inflight_head() {
        let sock = connected_sock();
        let stats = SocketStats::default();

        push_to_send_queue(&sock, &stats, msg(1), MessagePriority::High, 0, 0).unwrap();
        push_to_send_queue(&sock, &stats, msg(2), MessagePriority::High, 0, 0).unwrap();
        sock.send_queues[0].lock().unwrap().messages[0].bytes_sent = 10;

        insert_into_send_queue_head(&sock, &stats, msg(3), MessagePriority::High, 0);

        let queue = sock.send_queues[0].lock().unwrap();
        let funcs: Vec<i32> = queue.messages.iter().map(|m| m.header.func_id).collect();
        assert_eq!(funcs, vec![1, 3, 2]);
    }

    #[test]
    fn test_clear_bumps_version_and_counts_drops() {
        let sock = connected_sock();
        let stats = SocketStats::default();

        push_to_send_queue(&sock, &stats, msg(1), MessagePriority::High, 0, 0).unwrap();
        push_to_send_queue(&sock, &stats, msg(2), MessagePriority::Low, 0, 0).unwrap();

        let version_before = sock.version();
        clear_send_queue(&sock, &stats, false);

        assert!(sock.version() > version_before);
        assert_eq!(stats.drop_msg_count.load(Ordering::Relaxed), 2);
        for i in 0..PRIORITY_COUNT {
            assert!(sock.send_queues[i].lock().unwrap().messages.is_empty());
        }

        // a sender still holding the old version is now fenced out
        let result =
            push_to_send_queue(&sock, &stats, msg(3), MessagePriority::High, version_before, 0);
        assert!(matches!(result, Err(SockError::StaleSession)));
    }
}
