use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::warn;

pub const CLUSTER_MAJOR_VERSION: u32 = 3;
pub const CLUSTER_MINOR_VERSION: u32 = 1;
pub const MIN_CLUSTER_MAJOR_VERSION: u32 = 3;
pub const MIN_CLUSTER_MINOR_VERSION: u32 = 0;

/// First frame in each direction on a fresh connection: the version range
///  a node speaks. Carried as the body of a `FUNC_ID_HELLO_*` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloMessage {
    pub major: u32,
    pub minor: u32,
    pub min_major: u32,
    pub min_minor: u32,
}

impl HelloMessage {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn local() -> HelloMessage {
        HelloMessage {
            major: CLUSTER_MAJOR_VERSION,
            minor: CLUSTER_MINOR_VERSION,
            min_major: MIN_CLUSTER_MAJOR_VERSION,
            min_minor: MIN_CLUSTER_MINOR_VERSION,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_ne(self.major);
        buf.put_u32_ne(self.minor);
        buf.put_u32_ne(self.min_major);
        buf.put_u32_ne(self.min_minor);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HelloMessage> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!(
                "hello message needs {} bytes, got {}",
                Self::SERIALIZED_LEN,
                buf.remaining()
            );
        }
        Ok(HelloMessage {
            major: buf.get_u32_ne(),
            minor: buf.get_u32_ne(),
            min_major: buf.get_u32_ne(),
            min_minor: buf.get_u32_ne(),
        })
    }
}

/// Pick the protocol version to speak with a peer: the highest major in the
///  overlap of both nodes' supported ranges. The minor is the peer's minor
///  iff the chosen major is the peer's current one (a differing minor is
///  tolerated with a warning), otherwise zero. An empty overlap fails the
///  handshake.
pub fn negotiate(local: &HelloMessage, peer: &HelloMessage) -> anyhow::Result<(u32, u32)> {
    let mut chosen_major = None;
    for major in (peer.min_major..=peer.major).rev() {
        if major >= local.min_major && major <= local.major {
            chosen_major = Some(major);
            break;
        }
    }

    let Some(major) = chosen_major else {
        bail!(
            "no overlap between peer versions {}-{} and local versions {}-{}",
            peer.min_major,
            peer.major,
            local.min_major,
            local.major
        );
    };

    let minor = if major == peer.major {
        if peer.minor != local.minor {
            warn!(
                "different clustering minor versions ({}, {}), continuing",
                peer.minor, local.minor
            );
        }
        peer.minor
    } else {
        0
    };

    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[test]
    fn test_ser_deser() {
        let original = HelloMessage {
            major: 3,
            minor: 1,
            min_major: 2,
            min_minor: 0,
        };
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), HelloMessage::SERIALIZED_LEN);

        let deser = HelloMessage::deser(&mut &buf[..]).unwrap();
        assert_eq!(deser, original);
    }

    fn hello(major: u32, minor: u32, min_major: u32) -> HelloMessage {
        HelloMessage {
            major,
            minor,
            min_major,
            min_minor: 0,
        }
    }

    #[rstest]
    #[case::same_version(hello(3, 1, 3), hello(3, 1, 3), Some((3, 1)))]
    #[case::minor_mismatch(hello(3, 1, 3), hello(3, 0, 3), Some((3, 0)))]
    #[case::peer_newer(hello(3, 1, 3), hello(5, 2, 2), Some((3, 0)))]
    #[case::local_range(hello(4, 0, 2), hello(3, 7, 3), Some((3, 7)))]
    #[case::major_mismatch(hello(3, 0, 3), hello(2, 0, 2), None)]
    #[case::inverted_peer_range(hello(3, 0, 3), hello(2, 0, 4), None)]
    fn test_negotiate(
        #[case] local: HelloMessage,
        #[case] peer: HelloMessage,
        #[case] expected: Option<(u32, u32)>,
    ) {
        let result = negotiate(&local, &peer).ok();
        assert_eq!(result, expected);
    }

    #[test]
    fn test_highest_overlap_wins() {
        // peer speaks 2..=4, local speaks 3..=5: the overlap is {3, 4} and
        // the negotiated major must be 4, not 3
        let local = HelloMessage {
            major: 5,
            minor: 9,
            min_major: 3,
            min_minor: 0,
        };
        let peer = HelloMessage {
            major: 4,
            minor: 2,
            min_major: 2,
            min_minor: 0,
        };
        assert_eq!(negotiate(&local, &peer).unwrap(), (4, 2));
    }
}
