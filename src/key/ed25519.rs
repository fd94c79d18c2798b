//! Ed25519 key family.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::factory::{CreatePublicKeyFn, KeyTypeHandlers};
use super::{PrivateKey, PublicKey};
use crate::error::{AgentError, AgentResult};
use crate::proto::de::Deserializer;
use crate::proto::error::ProtoResult;
use crate::proto::ser::Serializer;
use crate::secure::SecureBytes;

/// Wire name of the family.
pub const KEY_TYPE: &str = "ssh-ed25519";

const PUBLIC_LEN: usize = 32;
const SEED_LEN: usize = 32;

pub(super) fn register(
    private: &mut HashMap<String, KeyTypeHandlers>,
    public: &mut HashMap<String, CreatePublicKeyFn>,
) {
    private.insert(
        KEY_TYPE.to_string(),
        KeyTypeHandlers {
            create,
            extract_public,
            skip,
        },
    );
    public.insert(KEY_TYPE.to_string(), create_public);
}

fn public_blob_from(public: &[u8]) -> AgentResult<Vec<u8>> {
    let mut s = Serializer::new();
    s.write_string(KEY_TYPE)?;
    s.write_blob(public)?;
    Ok(s.into_vec())
}

/// Wire fields: `blob public ‖ blob private`, where private is the 32-byte
/// seed followed by the public key (the OpenSSH 64-byte form), or just the
/// seed.
fn create(blob: &SecureBytes) -> AgentResult<Box<dyn PrivateKey>> {
    let mut d = Deserializer::new(blob);
    let public = d.read_blob()?;
    let private = d.read_blob_secure()?;

    if public.len() != PUBLIC_LEN {
        return Err(AgentError::crypto("ed25519: bad public key length"));
    }
    if private.len() != SEED_LEN && private.len() != SEED_LEN + PUBLIC_LEN {
        return Err(AgentError::crypto("ed25519: bad private key length"));
    }

    let seed: [u8; SEED_LEN] = private[..SEED_LEN]
        .try_into()
        .map_err(|_| AgentError::crypto("ed25519: bad seed length"))?;
    let signing = SigningKey::from_bytes(&seed);
    if signing.verifying_key().to_bytes() != public.as_slice() {
        return Err(AgentError::crypto(
            "ed25519: public key does not match private seed",
        ));
    }

    let public_blob = public_blob_from(&public)?;
    Ok(Box::new(Ed25519Key {
        signing,
        public_blob,
    }))
}

fn extract_public(blob: &SecureBytes) -> AgentResult<Vec<u8>> {
    let mut d = Deserializer::new(blob);
    let public = d.read_blob()?;
    public_blob_from(&public)
}

fn skip(d: &mut Deserializer<'_>) -> ProtoResult<()> {
    d.discard_blob()?; // public
    d.discard_blob() // private
}

fn create_public(blob: &[u8]) -> AgentResult<Box<dyn PublicKey>> {
    let mut d = Deserializer::new(blob);
    let key_type = d.read_string()?;
    if key_type != KEY_TYPE {
        return Err(AgentError::crypto("ed25519: wrong key type in blob"));
    }
    let public = d.read_blob()?;
    let bytes: [u8; PUBLIC_LEN] = public
        .as_slice()
        .try_into()
        .map_err(|_| AgentError::crypto("ed25519: bad public key length"))?;
    let verifying =
        VerifyingKey::from_bytes(&bytes).map_err(AgentError::crypto)?;
    Ok(Box::new(Ed25519Pub {
        blob: blob.to_vec(),
        verifying,
    }))
}

struct Ed25519Key {
    signing: SigningKey,
    public_blob: Vec<u8>,
}

impl std::fmt::Debug for Ed25519Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ed25519Key({} byte public blob)", self.public_blob.len())
    }
}

impl PrivateKey for Ed25519Key {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    fn sign(&self, data: &[u8], _flags: u32) -> AgentResult<Vec<u8>> {
        let signature = self.signing.sign(data);
        let mut s = Serializer::new();
        s.write_string(KEY_TYPE)?;
        s.write_blob(&signature.to_bytes())?;
        Ok(s.into_vec())
    }

    fn encode_private(&self) -> AgentResult<SecureBytes> {
        let public = self.signing.verifying_key().to_bytes();
        let mut keypair = Vec::with_capacity(SEED_LEN + PUBLIC_LEN);
        keypair.extend_from_slice(&self.signing.to_bytes());
        keypair.extend_from_slice(&public);

        let mut s = Serializer::new();
        s.write_blob(&public)?;
        s.write_blob(&keypair)?;
        keypair.iter_mut().for_each(|b| *b = 0);
        Ok(s.into_secure())
    }
}

struct Ed25519Pub {
    blob: Vec<u8>,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for Ed25519Pub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ed25519Pub({} byte blob)", self.blob.len())
    }
}

impl PublicKey for Ed25519Pub {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn blob(&self) -> &[u8] {
        &self.blob
    }

    fn bits(&self) -> usize {
        256
    }

    fn family(&self) -> &'static str {
        "ED25519"
    }

    fn verify(&self, data: &[u8], signature_blob: &[u8]) -> AgentResult<()> {
        let mut d = Deserializer::new(signature_blob);
        let sig_type = d.read_string()?;
        if sig_type != KEY_TYPE {
            return Err(AgentError::crypto(format!(
                "ed25519: unexpected signature type {sig_type}"
            )));
        }
        let bytes = d.read_blob()?;
        let bytes: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AgentError::crypto("ed25519: bad signature length"))?;
        let signature = Signature::from_bytes(&bytes);
        self.verifying
            .verify(data, &signature)
            .map_err(|_| AgentError::crypto("ed25519: signature verification failed"))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::key::test_support::ed25519_fixture;
    use crate::key::FingerprintFormat;

    #[test]
    fn create_sign_verify() -> TestResult {
        let fixture = ed25519_fixture();
        let key = create(&fixture.private_section)?;
        assert_eq!(key.key_type(), KEY_TYPE);
        assert_eq!(key.public_blob(), fixture.public_blob.as_slice());

        let signature = key.sign(b"hello", 0)?;
        let pubkey = create_public(key.public_blob())?;
        pubkey.verify(b"hello", &signature)?;
        assert!(pubkey.verify(b"other", &signature).is_err());
        Ok(())
    }

    #[test]
    fn extract_public_matches_create() -> TestResult {
        let fixture = ed25519_fixture();
        assert_eq!(
            extract_public(&fixture.private_section)?,
            fixture.public_blob
        );
        Ok(())
    }

    #[test]
    fn skip_covers_exactly_the_key_fields() -> TestResult {
        let fixture = ed25519_fixture();
        let mut d = Deserializer::new(&fixture.private_section);
        skip(&mut d)?;
        assert!(d.is_finished());
        Ok(())
    }

    #[test]
    fn mismatched_public_is_rejected() {
        let fixture = ed25519_fixture();
        let mut bytes = fixture.private_section.as_slice().to_vec();
        bytes[4] ^= 0xFF; // corrupt the public key
        assert!(create(&SecureBytes::new(bytes)).is_err());
    }

    #[test]
    fn private_section_roundtrips_through_encode() -> TestResult {
        let fixture = ed25519_fixture();
        let key = create(&fixture.private_section)?;
        let encoded = key.encode_private()?;
        assert_eq!(encoded.as_slice(), fixture.private_section.as_slice());
        Ok(())
    }

    #[test]
    fn public_key_presentation() -> TestResult {
        let fixture = ed25519_fixture();
        let pubkey = create_public(&fixture.public_blob)?;
        assert!(pubkey
            .fingerprint(FingerprintFormat::Sha256Base64)
            .starts_with("SHA256:"));
        assert!(pubkey.authorized_key_line("k1").starts_with("ssh-ed25519 "));
        assert!(pubkey.randomart()[0].contains("[ED25519 256]"));
        Ok(())
    }
}
