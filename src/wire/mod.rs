//! The byte-level protocol: banner, handshake records, per-frame tags and the
//! message header/footer framing. Everything is little-endian and fixed-size
//! so both sides can read exact lengths without lookahead.

use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod connect;
pub mod framing;

pub use connect::{ConnectFrame, ConnectReply};
pub use framing::{Footer, MsgHeader};

/// Written by both sides before anything else; no length prefix.
pub const BANNER: &[u8] = b"stonewire v010";

/// Protocol revision negotiated in the handshake; a mismatch is answered with
///  `Tag::BadProtoVer` and the connecting side gives up.
pub const PROTOCOL_VERSION: u32 = 1;

/// Feature bits advertised in `ConnectFrame::features` and intersected at
///  session open.
pub mod feature {
    /// the message header does not embed the source address
    pub const NOSRCADDR: u64 = 1 << 0;
    /// the peer understands the `SEQ` reply and its in-seq/acked-seq exchange
    pub const RECONNECT_SEQ: u64 = 1 << 1;
    /// message footers carry a signature
    pub const MSG_AUTH: u64 = 1 << 2;

    pub const ALL: u64 = NOSRCADDR | RECONNECT_SEQ | MSG_AUTH;
}

/// Authorizer protocol ids carried in the connect record.
pub mod auth_proto {
    pub const NONE: u32 = 0;
    /// the session-key protocol; the only one that can satisfy MSG_AUTH
    pub const SESSION: u32 = 2;
}

/// `ConnectFrame::flags` / `ConnectReply::flags`
pub const CONNECT_LOSSY: u8 = 1;

/// `Footer::flags`
pub const FOOTER_COMPLETE: u8 = 1;
/// the sender skipped the data checksum; receivers must not verify it
pub const FOOTER_NODATACRC: u8 = 2;

/// Tag bytes: values 1..=9 are connect replies, 10..=13 frame the open
///  session. The values are wire contract; do not renumber.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Tag {
    Ready = 1,
    ResetSession = 2,
    Wait = 3,
    RetrySession = 4,
    RetryGlobal = 5,
    BadProtoVer = 6,
    BadAuthorizer = 7,
    Features = 8,
    Seq = 9,

    Msg = 10,
    Ack = 11,
    Keepalive = 12,
    Close = 13,
}

pub(crate) const CRC32C: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// checksum over a segmented buffer, as if the segments were contiguous
pub fn crc32c_segments<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut digest = CRC32C.digest();
    for segment in segments {
        digest.update(segment);
    }
    digest.finalize()
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, Some(Tag::Ready))]
    #[case(9, Some(Tag::Seq))]
    #[case(10, Some(Tag::Msg))]
    #[case(13, Some(Tag::Close))]
    #[case(0, None)]
    #[case(14, None)]
    #[case(255, None)]
    fn test_tag_from_wire(#[case] raw: u8, #[case] expected: Option<Tag>) {
        assert_eq!(Tag::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_crc32c_known_value() {
        // CRC-32C of "123456789" is the standard check value
        assert_eq!(crc32c(b"123456789"), 0xe3069283);
    }

    #[test]
    fn test_crc32c_segments_matches_contiguous() {
        let whole = b"the quick brown fox";
        assert_eq!(
            crc32c_segments([&whole[..7], &whole[7..12], &whole[12..]]),
            crc32c(whole)
        );
    }
}
