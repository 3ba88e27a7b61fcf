use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::SockError;
use crate::nio::out_message::{MessagePriority, OutMessage};
use crate::nio::send_queue::insert_into_send_queue_head;
use crate::session::{MessageHandler, SessionDisposition, SessionStore};
use crate::sock::context::SocketContext;
use crate::stats::SocketStats;
use crate::wire::{
    MsgHeader, FUNC_ID_HELLO_REQUEST, FUNC_ID_HELLO_RESPONSE, FUNC_ID_PING_REQUEST,
    FUNC_ID_PING_RESPONSE, MSG_SEQ_NO_SESSION,
};

/// Route one decoded frame: pings are answered resp. accounted in-band,
///  hello frames are out of place on a promoted socket, everything else
///  goes to the session layer and from there (synchronously) to the
///  application callback or the session's in-queue.
#[allow(clippy::too_many_arguments)]
pub(crate) fn deal_message(
    config: &ClusterConfig,
    sessions: &Arc<dyn SessionStore>,
    handler: &Arc<dyn MessageHandler>,
    sock: &Arc<SocketContext>,
    stats: &SocketStats,
    header: MsgHeader,
    blocks: Vec<Bytes>,
    now_ns: u64,
    unix_now: u32,
) -> Result<(), SockError> {
    match header.func_id {
        FUNC_ID_PING_REQUEST => {
            let time_pass = unix_now.saturating_sub(header.session_id.timestamp);
            if time_pass > 1 {
                debug!(
                    "recv client {} ping, time pass: {} s",
                    sock.peer_label(),
                    time_pass
                );
            }

            let response =
                OutMessage::new(FUNC_ID_PING_RESPONSE, header.session_id, MSG_SEQ_NO_SESSION, &[]);
            insert_into_send_queue_head(sock, stats, response, MessagePriority::High, now_ns);
            Ok(())
        }

        FUNC_ID_PING_RESPONSE => {
            let ping_start = sock.ping_start_time.load(Ordering::Relaxed);
            if ping_start > 0 {
                let time_used = now_ns.saturating_sub(ping_start);
                stats.incr(|s| &s.ping_success_count);
                stats.add(|s| &s.ping_time_used, time_used);
                if time_used > config.ping_latency_threshold.as_nanos() as u64 {
                    warn!(
                        "server {} ping response time: {} us > threshold: {} us",
                        sock.peer_label(),
                        time_used / 1000,
                        config.ping_latency_threshold.as_micros()
                    );
                }
                sock.ping_start_time.store(0, Ordering::Relaxed);
            } else {
                warn!(
                    "unexpected ping response from server {}, time used: {} s",
                    sock.peer_label(),
                    unix_now.saturating_sub(header.session_id.timestamp)
                );
            }

            if sock.ping_fail_count.load(Ordering::Relaxed) > 0 {
                sock.ping_fail_count.store(0, Ordering::Relaxed);
            }
            Ok(())
        }

        FUNC_ID_HELLO_REQUEST | FUNC_ID_HELLO_RESPONSE => Err(SockError::ProtocolError(format!(
            "hello frame (func_id {}) on an established connection",
            header.func_id
        ))),

        func_id => {
            let disposition = match sessions.get_response_session(&header, sock) {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "no session for {:?} from {}: {}",
                        header.session_id,
                        sock.peer_label(),
                        e
                    );
                    return Ok(());
                }
            };

            match disposition {
                SessionDisposition::Deliver { user_data } => {
                    handler.deal(
                        header.session_id,
                        user_data,
                        func_id,
                        &blocks,
                        header.data_len as usize,
                    );
                }
                SessionDisposition::Queue => {
                    sessions.push_in_message(
                        header.session_id,
                        func_id,
                        blocks,
                        header.data_len as usize,
                    );
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockMessageHandler, MockSessionStore};
    use crate::sock::context::ConnectType;
    use crate::wire::SessionId;
    use std::net::Ipv4Addr;

    fn session_id() -> SessionId {
        SessionId {
            ip: Ipv4Addr::new(10, 0, 0, 1),
            timestamp: 1000,
            seq: 5,
        }
    }

    fn header(func_id: i32, data_len: u32) -> MsgHeader {
        MsgHeader::for_body(func_id, data_len, session_id(), 1)
    }

    fn sock() -> Arc<SocketContext> {
        let sock = SocketContext::new(1, ConnectType::Client, 0);
        sock.connected.store(true, Ordering::Release);
        Arc::new(sock)
    }

    fn no_sessions() -> Arc<dyn SessionStore> {
        Arc::new(MockSessionStore::new())
    }

    fn no_handler() -> Arc<dyn MessageHandler> {
        Arc::new(MockMessageHandler::new())
    }

    #[test]
    fn test_ping_request_elicits_head_response() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();

        deal_message(
            &config,
            &no_sessions(),
            &no_handler(),
            &sock,
            &stats,
            header(FUNC_ID_PING_REQUEST, 0),
            vec![],
            100,
            1000,
        )
        .unwrap();

        let queue = sock.send_queues[0].lock().unwrap();
        assert_eq!(queue.messages.len(), 1);
        assert_eq!(queue.messages[0].header.func_id, FUNC_ID_PING_RESPONSE);
        assert_eq!(queue.messages[0].header.session_id, session_id());
        assert_eq!(queue.messages[0].header.msg_seq, MSG_SEQ_NO_SESSION);
    }

    #[test]
    fn test_ping_response_resets_counters() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();
        sock.ping_start_time.store(1000, Ordering::Relaxed);
        sock.ping_fail_count.store(2, Ordering::Relaxed);

        deal_message(
            &config,
            &no_sessions(),
            &no_handler(),
            &sock,
            &stats,
            header(FUNC_ID_PING_RESPONSE, 0),
            vec![],
            5000,
            1000,
        )
        .unwrap();

        assert_eq!(sock.ping_start_time.load(Ordering::Relaxed), 0);
        assert_eq!(sock.ping_fail_count.load(Ordering::Relaxed), 0);
        assert_eq!(stats.ping_success_count.load(Ordering::Relaxed), 1);
        assert_eq!(stats.ping_time_used.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_unsolicited_ping_response_is_harmless() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();

        deal_message(
            &config,
            &no_sessions(),
            &no_handler(),
            &sock,
            &stats,
            header(FUNC_ID_PING_RESPONSE, 0),
            vec![],
            5000,
            1000,
        )
        .unwrap();

        assert_eq!(stats.ping_success_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_hello_out_of_phase_is_protocol_error() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();

        let result = deal_message(
            &config,
            &no_sessions(),
            &no_handler(),
            &sock,
            &stats,
            header(FUNC_ID_HELLO_REQUEST, 16),
            vec![Bytes::from(vec![0u8; 16])],
            100,
            1000,
        );
        assert!(matches!(result, Err(SockError::ProtocolError(_))));
    }

    #[test]
    fn test_application_frame_delivered_synchronously() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();

        let mut sessions = MockSessionStore::new();
        sessions
            .expect_get_response_session()
            .once()
            .returning(|_, _| Ok(SessionDisposition::Deliver { user_data: None }));
        let sessions: Arc<dyn SessionStore> = Arc::new(sessions);

        let mut handler = MockMessageHandler::new();
        handler
            .expect_deal()
            .once()
            .withf(|sid, _, func_id, blocks, data_len| {
                *func_id == 42
                    && *data_len == 5
                    && blocks.len() == 1
                    && sid.seq == 5
            })
            .return_const(());
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        deal_message(
            &config,
            &sessions,
            &handler,
            &sock,
            &stats,
            header(42, 5),
            vec![Bytes::from_static(b"hello")],
            100,
            1000,
        )
        .unwrap();
    }

    #[test]
    fn test_application_frame_queued() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();

        let mut sessions = MockSessionStore::new();
        sessions
            .expect_get_response_session()
            .once()
            .returning(|_, _| Ok(SessionDisposition::Queue));
        sessions
            .expect_push_in_message()
            .once()
            .withf(|_, func_id, blocks, data_len| {
                *func_id == 42 && *data_len == 5 && blocks.len() == 1
            })
            .return_const(());
        let sessions: Arc<dyn SessionStore> = Arc::new(sessions);

        deal_message(
            &config,
            &sessions,
            &no_handler(),
            &sock,
            &stats,
            header(42, 5),
            vec![Bytes::from_static(b"hello")],
            100,
            1000,
        )
        .unwrap();
    }

    #[test]
    fn test_unresolved_session_drops_frame() {
        let sock = sock();
        let stats = SocketStats::default();
        let config = ClusterConfig::default();

        let mut sessions = MockSessionStore::new();
        sessions
            .expect_get_response_session()
            .once()
            .returning(|_, _| Err(anyhow::anyhow!("session expired")));
        let sessions: Arc<dyn SessionStore> = Arc::new(sessions);

        let result = deal_message(
            &config,
            &sessions,
            &no_handler(),
            &sock,
            &stats,
            header(42, 5),
            vec![Bytes::from_static(b"hello")],
            100,
            1000,
        );
        assert!(result.is_ok());
    }
}
