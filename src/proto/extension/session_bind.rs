//! The `session-bind@openssh.com` message extension.
//!
//! Binds an agent connection to a particular SSH session. The server
//! proves possession of the host key by signing the session identifier;
//! decoding therefore parses the host key and, when a signature is
//! present, verifies it — a bind that fails verification must never enter
//! the session's binding chain.
//!
//! Spec: [OpenSSH `PROTOCOL.agent` § 1](https://github.com/openssh/openssh-portable/blob/master/PROTOCOL.agent)

use std::sync::Arc;

use tracing::debug;

use super::ExtensionPayload;
use crate::error::AgentResult;
use crate::key::factory;
use crate::proto::de::Deserializer;
use crate::proto::error::ProtoResult;
use crate::proto::ser::Serializer;

/// Wire name of the extension.
pub const NAME: &str = "session-bind@openssh.com";

/// A decoded (and verified) session binding.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SessionBind {
    /// Server host public key blob.
    pub host_key: Vec<u8>,

    /// Hash derived from the session's initial key exchange.
    pub session_id: Vec<u8>,

    /// Server's signature over the session identifier, made with the
    /// private host key. May be empty on rebinds.
    pub signature: Vec<u8>,

    /// Whether the connection is bound for forwarding rather than for
    /// user authentication.
    pub is_forwarding: bool,
}

impl SessionBind {
    /// Decode and verify a binding.
    ///
    /// The host key must parse under a registered key family; a non-empty
    /// signature must verify over the session identifier.
    pub fn decode(d: &mut Deserializer<'_>) -> AgentResult<Self> {
        let host_key = d.read_blob()?;
        let session_id = d.read_blob()?;
        let signature = d.read_blob()?;
        let is_forwarding = d.read_byte()? != 0;

        let pubkey = factory::create_public_key(&host_key)?;
        debug!(
            key_type = pubkey.key_type(),
            session_id_len = session_id.len(),
            is_forwarding,
            "parsed session bind"
        );

        if !signature.is_empty() {
            pubkey.verify(&session_id, &signature)?;
            debug!("session bind signature verified");
        }

        Ok(Self {
            host_key,
            session_id,
            signature,
            is_forwarding,
        })
    }
}

impl ExtensionPayload for SessionBind {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_blob(&self.host_key)?;
        s.write_blob(&self.session_id)?;
        s.write_blob(&self.signature)?;
        s.write_byte(u8::from(self.is_forwarding))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Registry entry point.
pub(super) fn decode(d: &mut Deserializer<'_>) -> AgentResult<Arc<dyn ExtensionPayload>> {
    Ok(Arc::new(SessionBind::decode(d)?))
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::error::AgentError;
    use crate::key::test_support::ed25519_fixture;

    #[test]
    fn roundtrips_a_signed_bind() -> TestResult {
        let fixture = ed25519_fixture();
        let session_id = vec![0x5A; 32];
        let signature = fixture.sign(&session_id)?;

        let bind = SessionBind {
            host_key: fixture.public_blob.clone(),
            session_id,
            signature,
            is_forwarding: false,
        };

        let mut s = Serializer::new();
        bind.encode(&mut s)?;
        let bytes = s.into_vec();

        let decoded = SessionBind::decode(&mut Deserializer::new(&bytes))?;
        assert_eq!(decoded, bind);
        Ok(())
    }

    #[test]
    fn bad_signature_is_rejected() -> TestResult {
        let fixture = ed25519_fixture();
        let session_id = vec![0x5A; 32];
        let mut signature = fixture.sign(&session_id)?;
        let tail = signature.len() - 1;
        signature[tail] ^= 0x01;

        let bind = SessionBind {
            host_key: fixture.public_blob.clone(),
            session_id,
            signature,
            is_forwarding: false,
        };
        let mut s = Serializer::new();
        bind.encode(&mut s)?;
        let bytes = s.into_vec();

        assert!(matches!(
            SessionBind::decode(&mut Deserializer::new(&bytes)),
            Err(AgentError::Crypto(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_signature_skips_verification() -> TestResult {
        let fixture = ed25519_fixture();
        let bind = SessionBind {
            host_key: fixture.public_blob.clone(),
            session_id: vec![0x5A; 32],
            signature: vec![],
            is_forwarding: true,
        };
        let mut s = Serializer::new();
        bind.encode(&mut s)?;
        let bytes = s.into_vec();

        let decoded = SessionBind::decode(&mut Deserializer::new(&bytes))?;
        assert!(decoded.is_forwarding);
        Ok(())
    }
}
