use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::wire::Tag;

/// Sent by the connecting side, once per handshake round. Followed on the
///  wire by `authorizer_len` opaque bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectFrame {
    pub features: u64,
    pub global_seq: u64,
    pub connect_seq: u64,
    pub protocol_version: u32,
    pub authorizer_protocol: u32,
    pub authorizer_len: u32,
    pub flags: u8,
    pub host_type: u8,
}

impl ConnectFrame {
    pub const WIRE_LEN: usize = 38;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.features);
        buf.put_u64_le(self.global_seq);
        buf.put_u64_le(self.connect_seq);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.authorizer_protocol);
        buf.put_u32_le(self.authorizer_len);
        buf.put_u8(self.flags);
        buf.put_u8(self.host_type);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectFrame> {
        Ok(ConnectFrame {
            features: buf.try_get_u64_le()?,
            global_seq: buf.try_get_u64_le()?,
            connect_seq: buf.try_get_u64_le()?,
            protocol_version: buf.try_get_u32_le()?,
            authorizer_protocol: buf.try_get_u32_le()?,
            authorizer_len: buf.try_get_u32_le()?,
            flags: buf.try_get_u8()?,
            host_type: buf.try_get_u8()?,
        })
    }
}

/// The accepting side's answer. Followed by `authorizer_len` opaque bytes,
///  and - when `tag == Tag::Seq` - by the two u64 sequence exchange: the
///  accepting side writes its in-seq, then reads the peer's newly-acked seq.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectReply {
    pub tag: u8,
    pub features: u64,
    pub global_seq: u64,
    pub connect_seq: u64,
    pub protocol_version: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}

impl ConnectReply {
    pub const WIRE_LEN: usize = 34;

    pub fn new(protocol_version: u32) -> ConnectReply {
        ConnectReply {
            tag: 0,
            features: 0,
            global_seq: 0,
            connect_seq: 0,
            protocol_version,
            authorizer_len: 0,
            flags: 0,
        }
    }

    pub fn tagged(&self) -> anyhow::Result<Tag> {
        Tag::try_from(self.tag).map_err(|_| anyhow!("unknown connect reply tag {}", self.tag))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag);
        buf.put_u64_le(self.features);
        buf.put_u64_le(self.global_seq);
        buf.put_u64_le(self.connect_seq);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectReply> {
        Ok(ConnectReply {
            tag: buf.try_get_u8()?,
            features: buf.try_get_u64_le()?,
            global_seq: buf.try_get_u64_le()?,
            connect_seq: buf.try_get_u64_le()?,
            protocol_version: buf.try_get_u32_le()?,
            authorizer_len: buf.try_get_u32_le()?,
            flags: buf.try_get_u8()?,
        })
    }
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plain(ConnectFrame {
        features: 0x7, global_seq: 42, connect_seq: 3, protocol_version: 1,
        authorizer_protocol: 0, authorizer_len: 0, flags: 0, host_type: 2,
    })]
    #[case::extremes(ConnectFrame {
        features: u64::MAX, global_seq: u64::MAX, connect_seq: 0, protocol_version: u32::MAX,
        authorizer_protocol: 2, authorizer_len: 512, flags: 1, host_type: 255,
    })]
    fn test_connect_roundtrip(#[case] frame: ConnectFrame) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.len(), ConnectFrame::WIRE_LEN);
        assert_eq!(ConnectFrame::try_deser(&mut buf.freeze()).unwrap(), frame);
    }

    #[rstest]
    #[case::ready(ConnectReply {
        tag: 1, features: 0x7, global_seq: 9, connect_seq: 4,
        protocol_version: 1, authorizer_len: 0, flags: 0,
    })]
    #[case::retry(ConnectReply {
        tag: 4, features: 0, global_seq: 0, connect_seq: 17,
        protocol_version: 1, authorizer_len: 0, flags: 1,
    })]
    fn test_reply_roundtrip(#[case] reply: ConnectReply) {
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        assert_eq!(buf.len(), ConnectReply::WIRE_LEN);
        assert_eq!(ConnectReply::try_deser(&mut buf.freeze()).unwrap(), reply);
    }

    #[test]
    fn test_truncated_is_error() {
        let mut buf = BytesMut::new();
        ConnectFrame {
            features: 1, global_seq: 2, connect_seq: 3, protocol_version: 1,
            authorizer_protocol: 0, authorizer_len: 0, flags: 0, host_type: 1,
        }
        .ser(&mut buf);
        let mut short = buf.freeze().slice(..ConnectFrame::WIRE_LEN - 2);
        assert!(ConnectFrame::try_deser(&mut short).is_err());

        let mut empty: &[u8] = &[];
        assert!(ConnectReply::try_deser(&mut empty).is_err());
    }
}
