use std::hash::Hasher;

use bytes::Bytes;
use siphasher::sip::SipHasher24;

use crate::peer_addr::HostType;
use crate::wire::{auth_proto, feature, Footer, MsgHeader};

pub const SESSION_KEY_LEN: usize = 16;

/// An outbound credential: sent in the connect record, verified by the
///  accepting side's [`Authenticator`]. The session key seeds the per-message
///  signatures when `MSG_AUTH` is negotiated.
#[derive(Clone)]
pub struct Authorizer {
    pub protocol: u32,
    pub blob: Bytes,
    pub session_key: [u8; SESSION_KEY_LEN],
}

/// Outcome of verifying a peer's authorizer blob.
pub struct AuthorizerAccept {
    pub valid: bool,
    pub reply: Bytes,
    pub session_key: [u8; SESSION_KEY_LEN],
}

impl AuthorizerAccept {
    pub fn reject() -> AuthorizerAccept {
        AuthorizerAccept {
            valid: false,
            reply: Bytes::new(),
            session_key: [0; SESSION_KEY_LEN],
        }
    }
}

/// The crypto seam. The messenger calls the outbound pair when dialing and
///  `verify_authorizer` when accepting; everything else (key distribution,
///  ticket formats) lives behind this trait.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// `force_new` is set after the peer rejected a previously issued
    ///  authorizer, to bypass any cache
    async fn get_authorizer(&self, peer_type: HostType, force_new: bool) -> Option<Authorizer>;

    async fn verify_reply(&self, authorizer: &Authorizer, reply: &[u8]) -> bool;

    async fn verify_authorizer(
        &self,
        peer_type: HostType,
        protocol: u32,
        blob: &[u8],
    ) -> AuthorizerAccept;
}

/// No credentials: offers nothing when dialing and accepts exactly the peers
///  that present nothing.
pub struct NoneAuthenticator;

#[async_trait::async_trait]
impl Authenticator for NoneAuthenticator {
    async fn get_authorizer(&self, _peer_type: HostType, _force_new: bool) -> Option<Authorizer> {
        None
    }

    async fn verify_reply(&self, _authorizer: &Authorizer, _reply: &[u8]) -> bool {
        true
    }

    async fn verify_authorizer(
        &self,
        _peer_type: HostType,
        protocol: u32,
        blob: &[u8],
    ) -> AuthorizerAccept {
        if protocol == auth_proto::NONE && blob.is_empty() {
            AuthorizerAccept {
                valid: true,
                reply: Bytes::new(),
                session_key: [0; SESSION_KEY_LEN],
            }
        } else {
            AuthorizerAccept::reject()
        }
    }
}

/// Per-session message signing, installed at session open when the peer
///  authenticated with the session protocol and `MSG_AUTH` was negotiated.
///  The signature is a keyed SipHash-2-4 over the identifying header fields
///  and the three payload checksums, so it covers the message contents
///  without a second pass over the payload.
#[derive(Clone)]
pub struct SessionSecurity {
    key: [u8; SESSION_KEY_LEN],
}

impl SessionSecurity {
    /// None when the negotiated protocol/features do not call for signing.
    pub fn for_session(
        protocol: u32,
        session_key: [u8; SESSION_KEY_LEN],
        features: u64,
    ) -> Option<SessionSecurity> {
        if protocol == auth_proto::SESSION && features & feature::MSG_AUTH != 0 {
            Some(SessionSecurity { key: session_key })
        } else {
            None
        }
    }

    pub fn sign(&self, header: &MsgHeader, footer: &Footer) -> u64 {
        let mut hasher = SipHasher24::new_with_key(&self.key);
        hasher.write_u64(header.seq);
        hasher.write_u64(header.tid);
        hasher.write_u16(header.msg_type);
        hasher.write_u32(header.front_len);
        hasher.write_u32(header.middle_len);
        hasher.write_u32(header.data_len);
        hasher.write_u32(footer.front_crc);
        hasher.write_u32(footer.middle_crc);
        hasher.write_u32(footer.data_crc);
        hasher.finish()
    }

    pub fn check(&self, header: &MsgHeader, footer: &Footer) -> bool {
        self.sign(header, footer) == footer.sig
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn header() -> MsgHeader {
        MsgHeader {
            seq: 3,
            tid: 17,
            msg_type: 5,
            priority: 127,
            version: 1,
            front_len: 10,
            middle_len: 0,
            data_len: 0,
            data_off: 0,
            src_type: 1,
            src_num: 0,
            src_addr: None,
            reserved: 0,
        }
    }

    #[test]
    fn test_sign_and_check() {
        let security = SessionSecurity::for_session(auth_proto::SESSION, [7; 16], feature::ALL)
            .unwrap();

        let header = header();
        let mut footer = Footer {
            front_crc: 0x1234,
            middle_crc: 0,
            data_crc: 0,
            sig: 0,
            flags: crate::wire::FOOTER_COMPLETE,
        };
        footer.sig = security.sign(&header, &footer);
        assert!(security.check(&header, &footer));

        // a different key must not validate
        let other = SessionSecurity::for_session(auth_proto::SESSION, [8; 16], feature::ALL)
            .unwrap();
        assert!(!other.check(&header, &footer));

        // tampering with a covered field must not validate
        let mut tampered = header;
        tampered.seq += 1;
        assert!(!security.check(&tampered, &footer));
    }

    #[test]
    fn test_for_session_requires_protocol_and_feature() {
        assert!(SessionSecurity::for_session(auth_proto::NONE, [0; 16], feature::ALL).is_none());
        assert!(
            SessionSecurity::for_session(auth_proto::SESSION, [0; 16], feature::NOSRCADDR)
                .is_none()
        );
        assert!(
            SessionSecurity::for_session(auth_proto::SESSION, [0; 16], feature::MSG_AUTH)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_none_authenticator() {
        let auth = NoneAuthenticator;
        assert!(auth.get_authorizer(HostType::Store, false).await.is_none());
        assert!(auth.verify_authorizer(HostType::Store, 0, b"").await.valid);
        assert!(!auth.verify_authorizer(HostType::Store, 0, b"x").await.valid);
        assert!(
            !auth
                .verify_authorizer(HostType::Store, auth_proto::SESSION, b"")
                .await
                .valid
        );
    }
}
