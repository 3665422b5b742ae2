use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The kind of process on the other end of a pipe. Drives policy lookup and
///  the signature-requirement knobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HostType {
    Unknown = 0,
    Client = 1,
    Store = 2,
    Meta = 3,
    Admin = 4,
}

impl HostType {
    pub fn name(&self) -> &'static str {
        match self {
            HostType::Unknown => "unknown",
            HostType::Client => "client",
            HostType::Store => "store",
            HostType::Meta => "meta",
            HostType::Admin => "admin",
        }
    }

    /// cluster-internal peers, as opposed to service peers
    pub fn is_cluster(&self) -> bool {
        matches!(self, HostType::Store | HostType::Meta)
    }
}

/// A peer's identity on the wire: socket address plus a nonce that
///  disambiguates successive incarnations of a process on the same address.
///  Two racing connection attempts between the same pair of peers are settled
///  by comparing the serialized form, so `Ord` is defined over exactly those
///  bytes.
#[derive(Clone, Copy)]
pub struct PeerAddr {
    pub nonce: u32,
    pub addr: SocketAddr,
}

impl PeerAddr {
    pub const WIRE_LEN: usize = 23;

    pub fn new(addr: SocketAddr, nonce: u32) -> PeerAddr {
        PeerAddr { nonce, addr }
    }

    /// Fixed-size encoding: family (u8), ip (16 bytes, v4 in the leading 4),
    ///  port (u16 LE), nonce (u32 LE).
    pub fn wire_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                out[0] = 4;
                out[1..5].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out[0] = 6;
                out[1..17].copy_from_slice(&ip.octets());
            }
        }
        out[17..19].copy_from_slice(&self.addr.port().to_le_bytes());
        out[19..23].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.wire_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddr> {
        let family = buf.try_get_u8()?;
        let mut ip = [0u8; 16];
        buf.try_copy_to_slice(&mut ip)?;
        let port = buf.try_get_u16_le()?;
        let nonce = buf.try_get_u32_le()?;

        let ip = match family {
            4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            6 => IpAddr::V6(Ipv6Addr::from(ip)),
            n => {
                return Err(anyhow!("invalid address family discriminator: {}", n));
            }
        };
        Ok(PeerAddr {
            nonce,
            addr: SocketAddr::new(ip, port),
        })
    }

    /// A wildcard IP: the peer bound to 0.0.0.0 / :: and does not know its
    ///  externally visible address yet.
    pub fn is_blank_ip(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn with_ip_of(&self, other: SocketAddr) -> PeerAddr {
        PeerAddr {
            nonce: self.nonce,
            addr: SocketAddr::new(other.ip(), self.addr.port()),
        }
    }
}

impl PartialEq for PeerAddr {
    fn eq(&self, other: &Self) -> bool {
        self.wire_bytes() == other.wire_bytes()
    }
}
impl Eq for PeerAddr {}

impl Hash for PeerAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.wire_bytes().hash(state);
    }
}

impl Ord for PeerAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wire_bytes().cmp(&other.wire_bytes())
    }
}
impl PartialOrd for PeerAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}]", self.addr, self.nonce)
    }
}


#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    fn peer(addr: &str, nonce: u32) -> PeerAddr {
        PeerAddr::new(SocketAddr::from_str(addr).unwrap(), nonce)
    }

    #[rstest]
    #[case::v4("1.2.3.4:5678", 9)]
    #[case::v4_blank("0.0.0.0:80", 1)]
    #[case::v6("[2001:db8::17]:443", 0xffff_ffff)]
    #[case::v6_blank("[::]:0", 0)]
    fn test_wire_roundtrip(#[case] addr: &str, #[case] nonce: u32) {
        let original = peer(addr, nonce);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PeerAddr::WIRE_LEN);

        let decoded = PeerAddr::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.addr, original.addr);
        assert_eq!(decoded.nonce, original.nonce);
    }

    #[test]
    fn test_truncated() {
        let mut buf = BytesMut::new();
        peer("1.2.3.4:5678", 9).ser(&mut buf);
        let mut short = buf.freeze().slice(..PeerAddr::WIRE_LEN - 1);
        assert!(PeerAddr::try_deser(&mut short).is_err());
    }

    #[test]
    fn test_bad_family() {
        let mut buf = BytesMut::new();
        peer("1.2.3.4:5678", 9).ser(&mut buf);
        let mut raw = buf.to_vec();
        raw[0] = 7;
        assert!(PeerAddr::try_deser(&mut raw.as_slice()).is_err());
    }

    #[rstest]
    #[case::blank_v4("0.0.0.0:80", true)]
    #[case::blank_v6("[::]:80", true)]
    #[case::concrete("127.0.0.1:80", false)]
    fn test_blank_ip(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(peer(addr, 0).is_blank_ip(), expected);
    }

    /// ordering must match byte-lexicographic comparison of the wire form -
    ///  both ends of a connection race rely on agreeing about this
    #[rstest]
    #[case::by_family("1.2.3.4:1", 5, "[::1]:1", 5)]
    #[case::by_ip("1.2.3.4:9999", 0, "2.0.0.1:1", 0)]
    #[case::by_port("1.2.3.4:80", 7, "1.2.3.4:81", 7)]
    #[case::by_nonce("1.2.3.4:80", 1, "1.2.3.4:80", 2)]
    fn test_ordering(#[case] lo: &str, #[case] lo_nonce: u32, #[case] hi: &str, #[case] hi_nonce: u32) {
        let lo = peer(lo, lo_nonce);
        let hi = peer(hi, hi_nonce);
        assert!(lo < hi);
        assert_eq!(
            lo.wire_bytes().cmp(&hi.wire_bytes()),
            Ordering::Less,
        );
    }
}
