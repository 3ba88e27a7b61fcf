pub mod hello;
pub mod msg_header;

pub use msg_header::{MsgHeader, SessionId};

/// body alignment on the wire; padding fills up to the next multiple
pub const ALIGN_BYTES: u32 = 8;

/// upper bound for `aligned_data_len` of a single frame
pub const MAX_MSG_LENGTH: u32 = 16 * 1024 * 1024;

/// marker in `msg_seq` for frames that are not tracked by any session
///  (hello, ping)
pub const MSG_SEQ_NO_SESSION: u32 = 11111;

// function ids below zero are reserved for the engine itself; such frames
// must be received into a single contiguous buffer
pub const FUNC_ID_HELLO_REQUEST: i32 = -1;
pub const FUNC_ID_HELLO_RESPONSE: i32 = -2;
pub const FUNC_ID_PING_REQUEST: i32 = -3;
pub const FUNC_ID_PING_RESPONSE: i32 = -4;

/// round up to the wire alignment
pub fn byte_align(len: u32) -> u32 {
    (len + (ALIGN_BYTES - 1)) & !(ALIGN_BYTES - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 8)]
    #[case(7, 8)]
    #[case(8, 8)]
    #[case(9, 16)]
    #[case(1024, 1024)]
    fn test_byte_align(#[case] len: u32, #[case] expected: u32) {
        assert_eq!(byte_align(len), expected);
    }
}
