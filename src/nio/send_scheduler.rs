use bytes::Bytes;
use std::io::{IoSlice, Write};
use std::sync::atomic::Ordering;
use tracing::{debug, error};

use crate::error::SockError;
use crate::nio::out_message::{MsgPayload, PRIORITY_COUNT};
use crate::sock::context::SocketContext;
use crate::stats::SocketStats;
use crate::wire::MsgHeader;

/// iovec slots per writev batch
pub(crate) const WRITEV_ARRAY_SIZE: usize = 128;
/// messages per writev batch
pub(crate) const WRITEV_ITEM_ONCE: usize = 64;
/// byte budget per writev batch
pub(crate) const WRITE_MAX_COMBINE_BYTES: usize = 256 * 1024;

/// zeroed scratch region backing alignment padding on the wire
static PADDING: [u8; crate::wire::ALIGN_BYTES as usize] = [0u8; 8];

/// one iovec-to-be: a slice of a message's header, body or padding
struct Seg {
    priority: usize,
    /// index of the owning message within its queue (== batch position)
    msg_index: usize,
    bytes: Bytes,
}

/// Reusable scratch for one socket's writev round. The segments snapshot
///  cheap `Bytes` clones under the queue locks, so the syscall itself runs
///  with no lock held; the deltas are folded back under the locks afterwards.
pub(crate) struct WriteBatch {
    segs: Vec<Seg>,
    counts: [usize; PRIORITY_COUNT],
    deltas: [Vec<usize>; PRIORITY_COUNT],
}

impl WriteBatch {
    pub(crate) fn new() -> WriteBatch {
        WriteBatch {
            segs: Vec::with_capacity(WRITEV_ARRAY_SIZE),
            counts: [0; PRIORITY_COUNT],
            deltas: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    fn clear(&mut self) {
        self.segs.clear();
        self.counts = [0; PRIORITY_COUNT];
    }
}

struct BuildSummary {
    total_bytes: usize,
    total_msgs: usize,
    /// batch was cut by one of the limits - more work is queued
    fetch_done: bool,
    /// the last inspected message's data is fully covered by the batch
    last_msg_complete: bool,
}

/// Did a write round make progress (call again) or is the socket drained /
///  blocked for now?
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IoProgress {
    Progress,
    Idle,
}

/// Collect the next scatter-gather batch. Scan order: if a previous round
///  left a partially-sent message, its queue's head is fetched first (alone)
///  so it completes before anything else on this socket; then HIGH, MID,
///  LOW. Each message contributes its remaining header bytes, body bytes
///  and terminal padding as separate segments.
fn build_batch(sock: &SocketContext, batch: &mut WriteBatch) -> BuildSummary {
    batch.clear();

    let resume = sock.queue_index.load(Ordering::Relaxed);
    let mut summary = BuildSummary {
        total_bytes: 0,
        total_msgs: 0,
        fetch_done: false,
        last_msg_complete: false,
    };

    let start = if resume == 0 { 1 } else { 0 };
    let mut priority = resume;
    for i in start..=PRIORITY_COUNT {
        {
            let queue = sock.send_queues[priority].lock().unwrap();
            // counts doubles as the skip offset: on the second visit of the
            // resume queue it steps over the already-fetched in-flight head
            let mut pos = batch.counts[priority];
            while let Some(msg) = queue.messages.get(pos) {
                append_msg_segs(batch, priority, pos, msg, &mut summary);
                batch.counts[priority] = pos + 1;
                summary.total_msgs += 1;

                if summary.total_msgs == WRITEV_ITEM_ONCE
                    || batch.segs.len() >= WRITEV_ARRAY_SIZE - 2
                    || summary.total_bytes >= WRITE_MAX_COMBINE_BYTES
                {
                    summary.fetch_done = true;
                    break;
                }
                if i == 0 {
                    // the resume pass fetches only the in-flight head
                    break;
                }
                pos += 1;
            }
        }

        if summary.fetch_done {
            break;
        }
        priority = if i == 0 { 0 } else { priority + 1 };
    }

    summary
}

fn append_msg_segs(
    batch: &mut WriteBatch,
    priority: usize,
    msg_index: usize,
    msg: &crate::nio::out_message::OutMessage,
    summary: &mut BuildSummary,
) {
    let header_len = MsgHeader::SERIALIZED_LEN;
    let aligned_len = msg.header.aligned_data_len as usize;
    let data_len = msg.header.data_len as usize;

    let remain_len = if msg.bytes_sent < header_len {
        let slice = msg.header_bytes().slice(msg.bytes_sent..);
        summary.total_bytes += slice.len();
        batch.segs.push(Seg {
            priority,
            msg_index,
            bytes: slice,
        });
        aligned_len
    } else {
        (aligned_len + header_len) - msg.bytes_sent
    };

    let mut msg_complete = true;
    if remain_len > 0 {
        let pad_len = aligned_len - data_len;
        let remain_data_len = remain_len as isize - pad_len as isize;

        if remain_data_len > 0 {
            let body_offset = data_len - remain_data_len as usize;
            match msg.payload() {
                MsgPayload::Inline(data) => {
                    let slice = data.slice(body_offset..);
                    summary.total_bytes += slice.len();
                    batch.segs.push(Seg {
                        priority,
                        msg_index,
                        bytes: slice,
                    });
                }
                MsgPayload::Blocks(blocks) => {
                    let mut skipped = 0usize;
                    let mut appended = 0usize;
                    for block in blocks {
                        if batch.segs.len() >= WRITEV_ARRAY_SIZE - 1 {
                            break;
                        }
                        if block.is_empty() {
                            continue;
                        }
                        if skipped + block.len() <= body_offset {
                            skipped += block.len();
                            continue;
                        }
                        let slice = block.slice(body_offset.saturating_sub(skipped)..);
                        skipped += block.len();
                        appended += slice.len();
                        batch.segs.push(Seg {
                            priority,
                            msg_index,
                            bytes: slice,
                        });
                    }
                    summary.total_bytes += appended;
                    msg_complete = appended == remain_data_len as usize;
                }
            }
        }

        if pad_len > 0 && msg_complete {
            let pad_remaining = if remain_data_len > 0 {
                pad_len
            } else {
                // only (part of) the padding is left to send
                remain_len
            };
            summary.total_bytes += pad_remaining;
            batch.segs.push(Seg {
                priority,
                msg_index,
                bytes: Bytes::from_static(&PADDING[..pad_remaining]),
            });
        }
    }

    summary.last_msg_complete = msg_complete;
}

/// Fold `written` bytes back into the queues: advance each message's
///  cursor in segment order, detach the contiguous done prefix of every
///  queue, and update the resume index to the priority of the first
///  unfinished segment (the priority of the last one when the batch was
///  fully consumed but its final message is incomplete).
fn apply_written(
    sock: &SocketContext,
    stats: &SocketStats,
    batch: &mut WriteBatch,
    written: usize,
    summary: &BuildSummary,
    now_ns: u64,
) {
    for p in 0..PRIORITY_COUNT {
        batch.deltas[p].clear();
        batch.deltas[p].resize(batch.counts[p], 0);
    }

    let mut remaining = written;
    let mut first_incomplete = None;
    for (i, seg) in batch.segs.iter().enumerate() {
        if remaining >= seg.bytes.len() {
            remaining -= seg.bytes.len();
            batch.deltas[seg.priority][seg.msg_index] += seg.bytes.len();
        } else {
            batch.deltas[seg.priority][seg.msg_index] += remaining;
            first_incomplete = Some(i);
            break;
        }
    }

    let resume = if written == summary.total_bytes && summary.last_msg_complete {
        0
    } else if let Some(i) = first_incomplete {
        batch.segs[i].priority
    } else {
        match batch.segs.last() {
            Some(seg) => seg.priority,
            None => 0,
        }
    };
    sock.queue_index.store(resume, Ordering::Relaxed);

    let mut total_done = 0u64;
    for p in 0..PRIORITY_COUNT {
        if batch.counts[p] == 0 {
            continue;
        }
        let mut queue = sock.send_queues[p].lock().unwrap();
        for i in 0..batch.counts[p] {
            queue.messages[i].bytes_sent += batch.deltas[p][i];
        }
        let mut done = 0;
        while done < batch.counts[p] {
            match queue.messages.front() {
                Some(msg) if msg.is_done() => {
                    let msg = queue.messages.pop_front().unwrap();
                    stats.add(
                        |s| &s.send_delayed_time,
                        now_ns.saturating_sub(msg.in_queue_time),
                    );
                    done += 1;
                }
                _ => break,
            }
        }
        total_done += done as u64;
    }
    stats.add(|s| &s.send_msg_count, total_done);
}

/// One write opportunity on a socket: build a batch, issue a single
///  vectored write, distribute the result. `Progress` means more queued
///  data may go out immediately; `Idle` means drained or flow-blocked.
pub(crate) fn deal_write_event(
    sock: &SocketContext,
    stats: &SocketStats,
    batch: &mut WriteBatch,
    now_ns: u64,
) -> Result<IoProgress, SockError> {
    let summary = build_batch(sock, batch);
    if batch.segs.is_empty() {
        return Ok(IoProgress::Idle);
    }

    stats.add(|s| &s.send_retry_count, summary.total_msgs as u64);
    stats.incr(|s| &s.call_writev_count);

    let written = {
        let guard = sock.stream.lock().unwrap();
        let Some(stream) = guard.as_ref() else {
            return Err(SockError::PeerClosed);
        };

        let mut iovs = [IoSlice::new(&[]); WRITEV_ARRAY_SIZE];
        let count = batch.segs.len().min(WRITEV_ARRAY_SIZE);
        for (i, seg) in batch.segs.iter().take(count).enumerate() {
            iovs[i] = IoSlice::new(&seg.bytes);
        }
        (&*stream).write_vectored(&iovs[..count])
    };

    match written {
        Ok(0) => {
            debug!("write to {} fail, connection closed", sock.peer_label());
            Err(SockError::PeerClosed)
        }
        Err(e) => match SockError::from(e) {
            SockError::WouldBlock => Ok(IoProgress::Idle),
            SockError::Interrupted => Ok(IoProgress::Progress),
            other => {
                error!("write to {} fail: {}", sock.peer_label(), other);
                Err(other)
            }
        },
        Ok(n) => {
            stats.add(|s| &s.send_bytes, n as u64);
            apply_written(sock, stats, batch, n, &summary, now_ns);

            if n == summary.total_bytes && summary.fetch_done {
                Ok(IoProgress::Progress)
            } else {
                Ok(IoProgress::Idle)
            }
        }
    }
}
