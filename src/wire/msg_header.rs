use anyhow::bail;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;

use crate::wire::{byte_align, MAX_MSG_LENGTH};

pub const MAGIC_NUMBER: u32 = 0x6373_6d31; // "csm1"

/// Identifier of a logical session tracked by the session layer above the
///  engine: the requesting node's address, a wall-clock second and a
///  sequence number. The engine treats it as opaque except for hello / ping
///  frames which carry a fixed sentinel sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub ip: Ipv4Addr,
    pub timestamp: u32,
    pub seq: u32,
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}#{}]", self.ip, self.timestamp, self.seq)
    }
}

impl SessionId {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_ne(u32::from(self.ip));
        buf.put_u32_ne(self.timestamp);
        buf.put_u32_ne(self.seq);
    }

    pub fn deser(buf: &mut impl Buf) -> SessionId {
        SessionId {
            ip: Ipv4Addr::from(buf.get_u32_ne()),
            timestamp: buf.get_u32_ne(),
            seq: buf.get_u32_ne(),
        }
    }
}

/// The fixed frame header preceding every message on the wire:
///  `[header | body | padding]` with the body padded up to `ALIGN_BYTES`.
///
/// All fields are emitted in host byte order - peers negotiate a compatible
///  major version during the hello exchange, and endianness agreement is
///  part of that contract.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MsgHeader {
    pub func_id: i32,
    pub data_len: u32,
    pub aligned_data_len: u32,
    pub session_id: SessionId,
    pub msg_seq: u32,
}

const _: () = assert!(MsgHeader::SERIALIZED_LEN % 16 == 0);

impl MsgHeader {
    pub const SERIALIZED_LEN: usize = 32;

    /// header for a frame with `data_len` body bytes; the aligned length is
    ///  derived, never supplied by the caller
    pub fn for_body(func_id: i32, data_len: u32, session_id: SessionId, msg_seq: u32) -> MsgHeader {
        MsgHeader {
            func_id,
            data_len,
            aligned_data_len: byte_align(data_len),
            session_id,
            msg_seq,
        }
    }

    pub fn padding_len(&self) -> usize {
        (self.aligned_data_len - self.data_len) as usize
    }

    /// total wire length of the frame including header and padding
    pub fn frame_len(&self) -> usize {
        Self::SERIALIZED_LEN + self.aligned_data_len as usize
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_ne(MAGIC_NUMBER);
        buf.put_i32_ne(self.func_id);
        buf.put_u32_ne(self.data_len);
        buf.put_u32_ne(self.aligned_data_len);
        self.session_id.ser(buf);
        buf.put_u32_ne(self.msg_seq);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MsgHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!(
                "message header needs {} bytes, got {}",
                Self::SERIALIZED_LEN,
                buf.remaining()
            );
        }

        let magic = buf.get_u32_ne();
        if magic != MAGIC_NUMBER {
            bail!("magic number {:08x} != {:08x}", magic, MAGIC_NUMBER);
        }

        let func_id = buf.get_i32_ne();
        let data_len = buf.get_u32_ne();
        let aligned_data_len = buf.get_u32_ne();
        let session_id = SessionId::deser(buf);
        let msg_seq = buf.get_u32_ne();

        if aligned_data_len > MAX_MSG_LENGTH {
            bail!(
                "message length {} is too large, exceeds {}",
                aligned_data_len,
                MAX_MSG_LENGTH
            );
        }
        if aligned_data_len != byte_align(data_len) {
            bail!(
                "aligned length {} does not match data length {}",
                aligned_data_len,
                data_len
            );
        }

        Ok(MsgHeader {
            func_id,
            data_len,
            aligned_data_len,
            session_id,
            msg_seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn session(seq: u32) -> SessionId {
        SessionId {
            ip: Ipv4Addr::new(10, 0, 0, 1),
            timestamp: 1_700_000_000,
            seq,
        }
    }

    #[rstest]
    #[case(0, 0)]
    #[case(7, 1)]
    #[case(100, 17)]
    #[case(-3, 0)]
    fn test_ser_deser(#[case] func_id: i32, #[case] data_len: u32) {
        let original = MsgHeader::for_body(func_id, data_len, session(42), 9);

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), MsgHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = MsgHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let original = MsgHeader::for_body(1, 8, session(1), 2);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        buf[0] ^= 0xff;

        assert!(MsgHeader::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_oversized_rejected() {
        let mut header = MsgHeader::for_body(1, 8, session(1), 2);
        header.data_len = MAX_MSG_LENGTH + 8;
        header.aligned_data_len = MAX_MSG_LENGTH + 8;
        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert!(MsgHeader::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_inconsistent_alignment_rejected() {
        let mut header = MsgHeader::for_body(1, 9, session(1), 2);
        header.aligned_data_len = 8;
        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert!(MsgHeader::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let original = MsgHeader::for_body(1, 8, session(1), 2);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        assert!(MsgHeader::deser(&mut &buf[..MsgHeader::SERIALIZED_LEN - 1]).is_err());
    }
}
