//! Ed448 key family.
//!
//! Same wire shape as Ed25519 with the curve-448 sizes: 57-byte public
//! keys, 57-byte seeds and 114-byte signatures.

use std::collections::HashMap;

use ed448_goldilocks::signature::{Signer, Verifier};
use ed448_goldilocks::{Signature, SigningKey, VerifyingKey};

use super::factory::{CreatePublicKeyFn, KeyTypeHandlers};
use super::{PrivateKey, PublicKey};
use crate::error::{AgentError, AgentResult};
use crate::proto::de::Deserializer;
use crate::proto::error::ProtoResult;
use crate::proto::ser::Serializer;
use crate::secure::SecureBytes;

/// Wire name of the family.
pub const KEY_TYPE: &str = "ssh-ed448";

const PUBLIC_LEN: usize = 57;
const SEED_LEN: usize = 57;
const SIGNATURE_LEN: usize = 114;

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

/// Wire fields: `blob public ‖ blob private`, where private is the 57-byte
/// seed optionally followed by the public key.
fn create(blob: &SecureBytes) -> AgentResult<Box<dyn PrivateKey>> {
    let mut d = Deserializer::new(blob);
    let public = d.read_blob()?;
    let private = d.read_blob_secure()?;

    if public.len() != PUBLIC_LEN {
        return Err(AgentError::crypto("ed448: bad public key length"));
    }
    if private.len() != SEED_LEN && private.len() != SEED_LEN + PUBLIC_LEN {
        return Err(AgentError::crypto("ed448: bad private key length"));
    }

    let seed = SecureBytes::from_slice(&private[..SEED_LEN]);
    let signing = SigningKey::try_from(seed.as_slice())
        .map_err(|_| AgentError::crypto("ed448: invalid private seed"))?;

    let public_blob = public_blob_from(&public)?;
    Ok(Box::new(Ed448Key {
        seed,
        signing,
        public,
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
        return Err(AgentError::crypto("ed448: wrong key type in blob"));
    }
    let public = d.read_blob()?;
    let public_array: [u8; PUBLIC_LEN] = public
        .as_slice()
        .try_into()
        .map_err(|_| AgentError::crypto("ed448: invalid public key"))?;
    let verifying = VerifyingKey::from_bytes(&public_array)
        .map_err(|_| AgentError::crypto("ed448: invalid public key"))?;
    Ok(Box::new(Ed448Pub {
        blob: blob.to_vec(),
        verifying,
    }))
}

struct Ed448Key {
    seed: SecureBytes,
    signing: SigningKey,
    public: Vec<u8>,
    public_blob: Vec<u8>,
}

impl std::fmt::Debug for Ed448Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ed448Key({} byte public blob)", self.public_blob.len())
    }
}

impl PrivateKey for Ed448Key {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    fn sign(&self, data: &[u8], _flags: u32) -> AgentResult<Vec<u8>> {
        let signature: Signature = self
            .signing
            .try_sign(data)
            .map_err(|_| AgentError::crypto("ed448: signing failed"))?;
        let mut s = Serializer::new();
        s.write_string(KEY_TYPE)?;
        s.write_blob(&signature.to_bytes())?;
        Ok(s.into_vec())
    }

    fn encode_private(&self) -> AgentResult<SecureBytes> {
        let mut keypair = Vec::with_capacity(SEED_LEN + PUBLIC_LEN);
        keypair.extend_from_slice(&self.seed);
        keypair.extend_from_slice(&self.public);

        let mut s = Serializer::new();
        s.write_blob(&self.public)?;
        s.write_blob(&keypair)?;
        keypair.iter_mut().for_each(|b| *b = 0);
        Ok(s.into_secure())
    }
}

struct Ed448Pub {
    blob: Vec<u8>,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for Ed448Pub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ed448Pub({} byte blob)", self.blob.len())
    }
}

impl PublicKey for Ed448Pub {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn blob(&self) -> &[u8] {
        &self.blob
    }

    fn bits(&self) -> usize {
        456
    }

    fn family(&self) -> &'static str {
        "ED448"
    }

    fn verify(&self, data: &[u8], signature_blob: &[u8]) -> AgentResult<()> {
        let mut d = Deserializer::new(signature_blob);
        let sig_type = d.read_string()?;
        if sig_type != KEY_TYPE {
            return Err(AgentError::crypto(format!(
                "ed448: unexpected signature type {sig_type}"
            )));
        }
        let bytes = d.read_blob()?;
        if bytes.len() != SIGNATURE_LEN {
            return Err(AgentError::crypto("ed448: bad signature length"));
        }
        let signature = Signature::try_from(bytes.as_slice())
            .map_err(|_| AgentError::crypto("ed448: malformed signature"))?;
        self.verifying
            .verify(data, &signature)
            .map_err(|_| AgentError::crypto("ed448: signature verification failed"))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn private_section(seed_byte: u8) -> SecureBytes {
        let seed = [seed_byte; SEED_LEN];
        let signing = SigningKey::try_from(seed.as_slice()).unwrap();
        let public = signing.verifying_key();
        let public_bytes = public.to_bytes();

        let mut s = Serializer::new();
        s.write_blob(public_bytes.as_slice()).unwrap();
        let mut keypair = seed.to_vec();
        keypair.extend_from_slice(public_bytes.as_slice());
        s.write_blob(&keypair).unwrap();
        s.into_secure()
    }

    #[test]
    fn create_sign_verify() -> TestResult {
        let section = private_section(0x07);
        let key = create(&section)?;
        assert_eq!(key.key_type(), KEY_TYPE);

        let signature = key.sign(b"hello", 0)?;
        let pubkey = create_public(key.public_blob())?;
        pubkey.verify(b"hello", &signature)?;
        assert!(pubkey.verify(b"other", &signature).is_err());
        Ok(())
    }

    #[test]
    fn skip_covers_exactly_the_key_fields() -> TestResult {
        let section = private_section(0x07);
        let mut d = Deserializer::new(&section);
        skip(&mut d)?;
        assert!(d.is_finished());
        Ok(())
    }

    #[test]
    fn private_section_roundtrips_through_encode() -> TestResult {
        let section = private_section(0x07);
        let key = create(&section)?;
        let encoded = key.encode_private()?;
        assert_eq!(encoded.as_slice(), section.as_slice());
        Ok(())
    }
}
