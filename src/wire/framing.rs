use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::peer_addr::PeerAddr;
use crate::wire::crc32c;

/// receive-side data buffers are laid out on this granularity
pub const PAGE_SIZE: usize = 4096;

/// The per-message envelope, preceding the payload sections on the wire.
///
/// Two variants exist: the current one, and a legacy one for peers that did
///  not negotiate `NOSRCADDR`, which additionally embeds the sender's
///  address. Both end in a CRC-32C over all preceding header bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MsgHeader {
    pub seq: u64,
    pub tid: u64,
    pub msg_type: u16,
    pub priority: u8,
    pub version: u8,
    pub front_len: u32,
    pub middle_len: u32,
    pub data_len: u32,
    pub data_off: u16,
    pub src_type: u8,
    pub src_num: u64,
    /// only on the wire in the legacy variant
    pub src_addr: Option<PeerAddr>,
    pub reserved: u16,
}

impl MsgHeader {
    pub const WIRE_LEN: usize = 49;
    pub const WIRE_LEN_LEGACY: usize = Self::WIRE_LEN + PeerAddr::WIRE_LEN;

    pub fn wire_len(legacy: bool) -> usize {
        if legacy {
            Self::WIRE_LEN_LEGACY
        } else {
            Self::WIRE_LEN
        }
    }

    pub fn encode(&self, legacy: bool, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.tid);
        buf.put_u16_le(self.msg_type);
        buf.put_u8(self.priority);
        buf.put_u8(self.version);
        buf.put_u32_le(self.front_len);
        buf.put_u32_le(self.middle_len);
        buf.put_u32_le(self.data_len);
        buf.put_u16_le(self.data_off);
        buf.put_u8(self.src_type);
        buf.put_u64_le(self.src_num);
        if legacy {
            self.src_addr
                .unwrap_or(PeerAddr::new(([0, 0, 0, 0], 0).into(), 0))
                .ser(buf);
        }
        buf.put_u16_le(self.reserved);

        let crc = crc32c(&buf[start..]);
        buf.put_u32_le(crc);
    }

    /// Parses and checks the trailing CRC; `raw` must be exactly
    ///  `wire_len(legacy)` bytes.
    pub fn try_parse(raw: &[u8], legacy: bool) -> anyhow::Result<MsgHeader> {
        if raw.len() != Self::wire_len(legacy) {
            bail!(
                "message header: got {} bytes, expected {}",
                raw.len(),
                Self::wire_len(legacy)
            );
        }

        let computed = crc32c(&raw[..raw.len() - 4]);

        let buf = &mut &raw[..];
        let header = MsgHeader {
            seq: buf.try_get_u64_le()?,
            tid: buf.try_get_u64_le()?,
            msg_type: buf.try_get_u16_le()?,
            priority: buf.try_get_u8()?,
            version: buf.try_get_u8()?,
            front_len: buf.try_get_u32_le()?,
            middle_len: buf.try_get_u32_le()?,
            data_len: buf.try_get_u32_le()?,
            data_off: buf.try_get_u16_le()?,
            src_type: buf.try_get_u8()?,
            src_num: buf.try_get_u64_le()?,
            src_addr: if legacy {
                Some(PeerAddr::try_deser(buf)?)
            } else {
                None
            },
            reserved: buf.try_get_u16_le()?,
        };

        let wire_crc = buf.try_get_u32_le()?;
        if wire_crc != computed {
            return Err(anyhow!(
                "message header crc mismatch: {:08x} on the wire, {:08x} computed",
                wire_crc,
                computed
            ));
        }
        Ok(header)
    }
}

/// Trails the payload sections. The current variant carries a signature slot
///  for sessions that negotiated `MSG_AUTH`; the legacy variant omits it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Footer {
    pub front_crc: u32,
    pub middle_crc: u32,
    pub data_crc: u32,
    pub sig: u64,
    pub flags: u8,
}

impl Footer {
    pub const WIRE_LEN: usize = 21;
    pub const WIRE_LEN_LEGACY: usize = 13;

    pub fn wire_len(signed: bool) -> usize {
        if signed {
            Self::WIRE_LEN
        } else {
            Self::WIRE_LEN_LEGACY
        }
    }

    pub fn encode(&self, signed: bool, buf: &mut impl BufMut) {
        buf.put_u32_le(self.front_crc);
        buf.put_u32_le(self.middle_crc);
        buf.put_u32_le(self.data_crc);
        if signed {
            buf.put_u64_le(self.sig);
        }
        buf.put_u8(self.flags);
    }

    pub fn try_parse(raw: &[u8], signed: bool) -> anyhow::Result<Footer> {
        if raw.len() != Self::wire_len(signed) {
            bail!(
                "message footer: got {} bytes, expected {}",
                raw.len(),
                Self::wire_len(signed)
            );
        }
        let buf = &mut &raw[..];
        Ok(Footer {
            front_crc: buf.try_get_u32_le()?,
            middle_crc: buf.try_get_u32_le()?,
            data_crc: buf.try_get_u32_le()?,
            sig: if signed { buf.try_get_u64_le()? } else { 0 },
            flags: buf.try_get_u8()?,
        })
    }
}

/// Sizes of the receive buffers for a data section of `len` bytes at
///  alignment offset `off`: a head piece that ends on a page boundary, one
///  page-multiple middle piece, and the remainder. At most three pieces, any
///  of which may be absent.
pub fn aligned_chunk_sizes(len: usize, off: usize) -> Vec<usize> {
    let mut chunks = Vec::with_capacity(3);
    let mut left = len;

    let misalign = off % PAGE_SIZE;
    if misalign != 0 {
        let head = (PAGE_SIZE - misalign).min(left);
        if head > 0 {
            chunks.push(head);
            left -= head;
        }
    }
    let middle = left - (left % PAGE_SIZE);
    if middle > 0 {
        chunks.push(middle);
        left -= middle;
    }
    if left > 0 {
        chunks.push(left);
    }
    chunks
}


#[cfg(test)]
mod test {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    fn header() -> MsgHeader {
        MsgHeader {
            seq: 7,
            tid: 0x1122334455667788,
            msg_type: 42,
            priority: 127,
            version: 1,
            front_len: 11,
            middle_len: 0,
            data_len: 8192,
            data_off: 512,
            src_type: 2,
            src_num: 5,
            src_addr: None,
            reserved: 0,
        }
    }

    #[rstest]
    #[case::current(false)]
    #[case::legacy(true)]
    fn test_header_roundtrip(#[case] legacy: bool) {
        let mut original = header();
        if legacy {
            original.src_addr = Some(PeerAddr::new(
                std::net::SocketAddr::from_str("10.0.0.3:7801").unwrap(),
                99,
            ));
        }

        let mut buf = BytesMut::new();
        original.encode(legacy, &mut buf);
        assert_eq!(buf.len(), MsgHeader::wire_len(legacy));

        let decoded = MsgHeader::try_parse(&buf, legacy).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_header_crc_detects_corruption() {
        let mut buf = BytesMut::new();
        header().encode(false, &mut buf);
        let mut raw = buf.to_vec();
        raw[3] ^= 0x40;
        let err = MsgHeader::try_parse(&raw, false).unwrap_err();
        assert!(err.to_string().contains("crc mismatch"));
    }

    #[test]
    fn test_header_wrong_length() {
        let mut buf = BytesMut::new();
        header().encode(false, &mut buf);
        assert!(MsgHeader::try_parse(&buf[..buf.len() - 1], false).is_err());
        // a current-variant buffer is not parseable as legacy
        assert!(MsgHeader::try_parse(&buf, true).is_err());
    }

    #[rstest]
    #[case::signed(true)]
    #[case::unsigned(false)]
    fn test_footer_roundtrip(#[case] signed: bool) {
        let original = Footer {
            front_crc: 0xdead_beef,
            middle_crc: 0,
            data_crc: 0x0102_0304,
            sig: if signed { 0xaabb_ccdd_eeff_0011 } else { 0 },
            flags: crate::wire::FOOTER_COMPLETE,
        };
        let mut buf = BytesMut::new();
        original.encode(signed, &mut buf);
        assert_eq!(buf.len(), Footer::wire_len(signed));
        assert_eq!(Footer::try_parse(&buf, signed).unwrap(), original);
    }

    #[rstest]
    #[case::zero(0, 0, vec![])]
    #[case::aligned_single_page(4096, 0, vec![4096])]
    #[case::aligned_partial(100, 0, vec![100])]
    #[case::aligned_pages_and_tail(10000, 0, vec![8192, 1808])]
    #[case::head_only(100, 512, vec![100])]
    #[case::head_crossing_page(4000, 512, vec![3584, 416])]
    #[case::three_pieces(13000, 512, vec![3584, 8192, 1224])]
    #[case::off_beyond_page(5000, 4608, vec![3584, 1416])]
    fn test_aligned_chunk_sizes(#[case] len: usize, #[case] off: usize, #[case] expected: Vec<usize>) {
        let chunks = aligned_chunk_sizes(len, off);
        assert_eq!(chunks, expected);
        assert_eq!(chunks.iter().sum::<usize>(), len);
        // interior boundaries must land on page boundaries
        let mut pos = off;
        for (i, chunk) in chunks.iter().enumerate() {
            pos += chunk;
            if i + 1 < chunks.len() {
                assert_eq!(pos % PAGE_SIZE, 0, "piece {} ends off-page", i);
            }
        }
    }
}
