use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::SockError;
use crate::wire::{MsgHeader, ALIGN_BYTES};

/// Tail sizes below this are not worth reading into: a partial frame is
///  relocated to the head of a fresh buffer instead.
const RELOCATE_THRESHOLD: usize = 4 * 1024;

/// Streaming reassembly state of one socket: turns the byte stream into
///  `(header, body blocks)` deliveries without copying body payload.
///
/// The in-progress frame always starts at offset 0 of the primary buffer -
///  completed frames are split off the front, which keeps the remainder of
///  the allocation shared with the delivered `Bytes` blocks. When a body
///  outgrows the buffer, the part at hand is detached into the block chain
///  and a fresh primary buffer takes over; `parsed` then carries the header
///  across buffers.
pub(crate) struct ReaderManager {
    buf: BytesMut,
    /// write cursor; `buf[..current]` is received, `buf[current..]` is free
    current: usize,
    /// header of a frame whose body spans buffers; `None` means the frame
    ///  at offset 0 (if any) still has its header bytes in `buf`
    parsed: Option<MsgHeader>,
    /// body bytes of the in-progress frame already moved into `blocks`
    recv_body_bytes: usize,
    blocks: Vec<Bytes>,
    buffer_size: usize,
}

impl ReaderManager {
    pub(crate) fn new() -> ReaderManager {
        ReaderManager {
            buf: BytesMut::new(),
            current: 0,
            parsed: None,
            recv_body_bytes: 0,
            blocks: Vec::new(),
            buffer_size: 0,
        }
    }

    /// arm the reader for a freshly promoted socket
    pub(crate) fn reset(&mut self, buffer_size: usize) {
        debug_assert!(buffer_size % ALIGN_BYTES as usize == 0);
        self.buffer_size = buffer_size;
        self.buf = BytesMut::zeroed(buffer_size);
        self.current = 0;
        self.parsed = None;
        self.recv_body_bytes = 0;
        self.blocks.clear();
    }

    /// release all buffers on close
    pub(crate) fn clear(&mut self) {
        self.buf = BytesMut::new();
        self.current = 0;
        self.parsed = None;
        self.recv_body_bytes = 0;
        self.blocks.clear();
    }

    /// the free tail of the primary buffer, for the next `read`
    pub(crate) fn writable_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.current..]
    }

    pub(crate) fn is_full(&self) -> bool {
        self.current == self.buf.len()
    }

    /// account `n` bytes appended by a successful `read`
    pub(crate) fn advance_written(&mut self, n: usize) {
        debug_assert!(self.current + n <= self.buf.len());
        self.current += n;
    }

    fn alloc_fresh(&mut self) {
        self.buf = BytesMut::zeroed(self.buffer_size);
        self.current = 0;
    }

    /// copy the partial frame at the buffer head into a fresh full-size
    ///  buffer (header bytes must stay contiguous)
    fn relocate(&mut self, msg_bytes: usize) {
        if msg_bytes == 0 {
            self.alloc_fresh();
            return;
        }
        let mut fresh = BytesMut::zeroed(self.buffer_size);
        fresh[..msg_bytes].copy_from_slice(&self.buf[..msg_bytes]);
        self.buf = fresh;
        self.current = msg_bytes;
    }

    /// Scan the received bytes and move every completed frame into `frames`.
    ///  Returns with free buffer space available unless it fails; protocol
    ///  violations surface as `SockError::ProtocolError` and close the
    ///  socket upstream.
    pub(crate) fn extract_frames(
        &mut self,
        frames: &mut Vec<(MsgHeader, Vec<Bytes>)>,
    ) -> Result<(), SockError> {
        loop {
            let first_block = self.parsed.is_none();

            let (header, recv_body_bytes) = if let Some(header) = &self.parsed {
                (header.clone(), self.recv_body_bytes + self.current)
            } else {
                let msg_bytes = self.current;
                if msg_bytes < MsgHeader::SERIALIZED_LEN {
                    // no full header yet
                    if self.buf.len() - self.current < RELOCATE_THRESHOLD {
                        self.relocate(msg_bytes);
                    }
                    return Ok(());
                }

                let header = MsgHeader::deser(&mut &self.buf[..MsgHeader::SERIALIZED_LEN])
                    .map_err(|e| SockError::ProtocolError(e.to_string()))?;
                if header.func_id < 0 && header.frame_len() > self.buffer_size {
                    return Err(SockError::ProtocolError(format!(
                        "func_id {}: frame of {} bytes cannot fit a single read buffer of {}",
                        header.func_id,
                        header.frame_len(),
                        self.buffer_size
                    )));
                }
                (header, msg_bytes - MsgHeader::SERIALIZED_LEN)
            };

            let aligned_len = header.aligned_data_len as usize;
            let data_len = header.data_len as usize;
            let body_start = if first_block {
                MsgHeader::SERIALIZED_LEN
            } else {
                0
            };

            if recv_body_bytes < aligned_len {
                // frame incomplete
                if recv_body_bytes + (self.buf.len() - self.current) >= aligned_len {
                    // the free tail can hold the rest
                    return Ok(());
                }

                if header.func_id < 0 {
                    // internal frames must stay contiguous
                    if !first_block {
                        return Err(SockError::ProtocolError(format!(
                            "func_id {}: data length {} spans read buffers",
                            header.func_id, data_len
                        )));
                    }
                    self.relocate(self.current);
                    return Ok(());
                }

                if self.buf.len() - self.current >= RELOCATE_THRESHOLD {
                    // still plenty of tail, keep filling before spilling
                    return Ok(());
                }

                if recv_body_bytes % ALIGN_BYTES as usize != 0 {
                    // body spills must happen on aligned offsets
                    trace!(
                        "recv_body_bytes {} not aligned with {}, waiting",
                        recv_body_bytes,
                        ALIGN_BYTES
                    );
                    if self.is_full() {
                        return Err(SockError::ProtocolError(
                            "unaligned body spill with exhausted buffer".to_string(),
                        ));
                    }
                    return Ok(());
                }

                let in_buf_body = self.current - body_start;
                let recv_padding = recv_body_bytes.saturating_sub(data_len);
                let current_true_body = in_buf_body.saturating_sub(recv_padding);

                if first_block && current_true_body == 0 {
                    // header only so far - keep it in one piece
                    self.relocate(self.current);
                    return Ok(());
                }

                // detach this buffer's part of the body, start a fresh buffer
                let mut part = self.buf.split_to(self.current);
                self.current = 0;
                if body_start > 0 {
                    part.advance(body_start);
                }
                part.truncate(current_true_body);
                if !part.is_empty() {
                    self.blocks.push(part.freeze());
                }
                self.recv_body_bytes = recv_body_bytes;
                self.parsed = Some(header);
                self.alloc_fresh();
                return Ok(());
            }

            // frame complete: split it off the front of the buffer
            let in_buf_body = if first_block {
                aligned_len
            } else {
                aligned_len - self.recv_body_bytes
            };
            let padding_len = aligned_len - data_len;
            let current_true_body = if padding_len > 0 {
                in_buf_body.saturating_sub(padding_len)
            } else {
                in_buf_body
            };

            let consumed = body_start + in_buf_body;
            let mut part = self.buf.split_to(consumed);
            self.current -= consumed;
            if body_start > 0 {
                part.advance(body_start);
            }
            part.truncate(current_true_body);
            if !part.is_empty() {
                self.blocks.push(part.freeze());
            }

            let blocks = std::mem::take(&mut self.blocks);
            self.parsed = None;
            self.recv_body_bytes = 0;
            frames.push((header, blocks));
            // loop on: the buffer may hold further complete frames
        }
    }
}
