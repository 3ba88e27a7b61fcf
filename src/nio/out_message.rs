use bytes::{Bytes, BytesMut};

use crate::wire::{MsgHeader, SessionId};

/// Messages up to this size are copied into an inline buffer at creation;
///  larger payloads travel as a reference-counted block chain.
pub const MINI_MESSAGE_SIZE: usize = 128;

pub const PRIORITY_COUNT: usize = 3;

/// Scheduling preference among outbound frames on the same socket. Lower
///  numeric value is scanned first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessagePriority {
    High = 0,
    Mid = 1,
    Low = 2,
}

impl MessagePriority {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Body of an outbound frame: either a small inline copy or a chain of
///  reference-counted blocks handed in by the caller (no copy).
#[derive(Debug, Clone)]
pub enum MsgPayload {
    Inline(Bytes),
    Blocks(Vec<Bytes>),
}

/// An outbound buffered frame. The header is serialized once at creation so
///  the scheduler can hand out cheap slices of it; `bytes_sent` advances
///  through header, body and padding as `writev` makes progress.
pub struct OutMessage {
    pub header: MsgHeader,
    header_bytes: Bytes,
    payload: MsgPayload,
    pub(crate) bytes_sent: usize,
    /// engine-relative nanos of the enqueue, for the send-delay counter
    pub(crate) in_queue_time: u64,
}

impl OutMessage {
    /// Copying constructor for small messages. Payloads above
    ///  `MINI_MESSAGE_SIZE` still work but are stored as a single block.
    pub fn new(func_id: i32, session_id: SessionId, msg_seq: u32, data: &[u8]) -> OutMessage {
        let payload = if data.len() <= MINI_MESSAGE_SIZE {
            MsgPayload::Inline(Bytes::copy_from_slice(data))
        } else {
            MsgPayload::Blocks(vec![Bytes::copy_from_slice(data)])
        };
        Self::assemble(func_id, session_id, msg_seq, data.len() as u32, payload)
    }

    /// Zero-copy constructor: the frame body is the concatenation of
    ///  `blocks`, which stay shared with the caller until fully sent.
    pub fn with_blocks(
        func_id: i32,
        session_id: SessionId,
        msg_seq: u32,
        blocks: Vec<Bytes>,
    ) -> OutMessage {
        let data_len: usize = blocks.iter().map(|b| b.len()).sum();
        Self::assemble(
            func_id,
            session_id,
            msg_seq,
            data_len as u32,
            MsgPayload::Blocks(blocks),
        )
    }

    fn assemble(
        func_id: i32,
        session_id: SessionId,
        msg_seq: u32,
        data_len: u32,
        payload: MsgPayload,
    ) -> OutMessage {
        let header = MsgHeader::for_body(func_id, data_len, session_id, msg_seq);
        let mut buf = BytesMut::with_capacity(MsgHeader::SERIALIZED_LEN);
        header.ser(&mut buf);

        OutMessage {
            header,
            header_bytes: buf.freeze(),
            payload,
            bytes_sent: 0,
            in_queue_time: 0,
        }
    }

    pub(crate) fn header_bytes(&self) -> &Bytes {
        &self.header_bytes
    }

    pub(crate) fn payload(&self) -> &MsgPayload {
        &self.payload
    }

    /// total bytes this message occupies on the wire
    pub fn frame_len(&self) -> usize {
        self.header.frame_len()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.bytes_sent >= self.frame_len()
    }
}
