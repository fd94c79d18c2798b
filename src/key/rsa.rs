//! RSA key family.
//!
//! The one family where sign flags matter: bit 2 requests `rsa-sha2-256`,
//! bit 4 `rsa-sha2-512` (512 wins if both are set), and no flag falls back
//! to legacy SHA-1 `ssh-rsa` signatures.

use std::collections::HashMap;

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use super::factory::{CreatePublicKeyFn, KeyTypeHandlers};
use super::{PrivateKey, PublicKey};
use crate::error::{AgentError, AgentResult};
use crate::proto::de::Deserializer;
use crate::proto::error::ProtoResult;
use crate::proto::message::{RSA_SHA2_256, RSA_SHA2_512};
use crate::proto::ser::Serializer;
use crate::secure::SecureBytes;

/// Wire name of the family.
pub const KEY_TYPE: &str = "ssh-rsa";

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

fn public_blob_from(e: &[u8], n: &[u8]) -> AgentResult<Vec<u8>> {
    let mut s = Serializer::new();
    s.write_string(KEY_TYPE)?;
    s.write_mpint(e)?;
    s.write_mpint(n)?;
    Ok(s.into_vec())
}

/// Wire fields: `mpint n ‖ mpint e ‖ mpint d ‖ mpint iqmp ‖ mpint p ‖ mpint q`.
fn create(blob: &SecureBytes) -> AgentResult<Box<dyn PrivateKey>> {
    let mut de = Deserializer::new(blob);
    let n = de.read_mpint()?;
    let e = de.read_mpint()?;
    let d = de.read_mpint_secure()?;
    let iqmp = de.read_mpint_secure()?;
    let p = de.read_mpint_secure()?;
    let q = de.read_mpint_secure()?;

    let key = RsaPrivateKey::from_components(
        BigUint::from_bytes_be(&n),
        BigUint::from_bytes_be(&e),
        BigUint::from_bytes_be(&d),
        vec![BigUint::from_bytes_be(&p), BigUint::from_bytes_be(&q)],
    )
    .map_err(AgentError::crypto)?;

    let public_blob = public_blob_from(&e, &n)?;
    Ok(Box::new(RsaKey {
        key,
        iqmp,
        public_blob,
    }))
}

fn extract_public(blob: &SecureBytes) -> AgentResult<Vec<u8>> {
    let mut de = Deserializer::new(blob);
    let n = de.read_mpint()?;
    let e = de.read_mpint()?;
    public_blob_from(&e, &n)
}

fn skip(d: &mut Deserializer<'_>) -> ProtoResult<()> {
    for _ in 0..6 {
        d.discard_blob()?; // n, e, d, iqmp, p, q
    }
    Ok(())
}

fn create_public(blob: &[u8]) -> AgentResult<Box<dyn PublicKey>> {
    let mut d = Deserializer::new(blob);
    let key_type = d.read_string()?;
    if key_type != KEY_TYPE {
        return Err(AgentError::crypto("rsa: wrong key type in blob"));
    }
    let e = d.read_mpint()?;
    let n = d.read_mpint()?;
    let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(AgentError::crypto)?;
    Ok(Box::new(RsaPub {
        blob: blob.to_vec(),
        key,
    }))
}

/// Digest choice and signature type for a set of sign flags.
fn algorithm_for_flags(flags: u32) -> &'static str {
    if flags & RSA_SHA2_512 != 0 {
        "rsa-sha2-512"
    } else if flags & RSA_SHA2_256 != 0 {
        "rsa-sha2-256"
    } else {
        KEY_TYPE
    }
}

struct RsaKey {
    key: RsaPrivateKey,
    iqmp: SecureBytes,
    public_blob: Vec<u8>,
}

impl std::fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsaKey({} bits)", self.key.n().bits())
    }
}

impl PrivateKey for RsaKey {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    fn sign(&self, data: &[u8], flags: u32) -> AgentResult<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let failed = |e: rsa::signature::Error| AgentError::crypto(e);

        let algorithm = algorithm_for_flags(flags);
        let signature: Signature = match algorithm {
            "rsa-sha2-512" => SigningKey::<Sha512>::new(self.key.clone())
                .try_sign_with_rng(&mut rng, data)
                .map_err(failed)?,
            "rsa-sha2-256" => SigningKey::<Sha256>::new(self.key.clone())
                .try_sign_with_rng(&mut rng, data)
                .map_err(failed)?,
            _ => SigningKey::<Sha1>::new(self.key.clone())
                .try_sign_with_rng(&mut rng, data)
                .map_err(failed)?,
        };

        let mut s = Serializer::new();
        s.write_string(algorithm)?;
        s.write_blob(&signature.to_bytes())?;
        Ok(s.into_vec())
    }

    fn encode_private(&self) -> AgentResult<SecureBytes> {
        let primes = self.key.primes();
        if primes.len() < 2 {
            return Err(AgentError::crypto("rsa: key has no prime factors"));
        }
        let mut s = Serializer::new();
        s.write_mpint(&self.key.n().to_bytes_be())?;
        s.write_mpint(&self.key.e().to_bytes_be())?;
        s.write_mpint(&self.key.d().to_bytes_be())?;
        s.write_mpint(&self.iqmp)?;
        s.write_mpint(&primes[0].to_bytes_be())?;
        s.write_mpint(&primes[1].to_bytes_be())?;
        Ok(s.into_secure())
    }
}

struct RsaPub {
    blob: Vec<u8>,
    key: RsaPublicKey,
}

impl std::fmt::Debug for RsaPub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsaPub({} bits)", self.key.n().bits())
    }
}

impl PublicKey for RsaPub {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn blob(&self) -> &[u8] {
        &self.blob
    }

    fn bits(&self) -> usize {
        self.key.n().bits()
    }

    fn family(&self) -> &'static str {
        "RSA"
    }

    fn verify(&self, data: &[u8], signature_blob: &[u8]) -> AgentResult<()> {
        let mut d = Deserializer::new(signature_blob);
        let sig_type = d.read_string()?;
        let bytes = d.read_blob()?;
        let signature =
            Signature::try_from(bytes.as_slice()).map_err(AgentError::crypto)?;

        let rejected = |_| AgentError::crypto("rsa: signature verification failed");
        match sig_type.as_str() {
            "rsa-sha2-512" => VerifyingKey::<Sha512>::new(self.key.clone())
                .verify(data, &signature)
                .map_err(rejected),
            "rsa-sha2-256" => VerifyingKey::<Sha256>::new(self.key.clone())
                .verify(data, &signature)
                .map_err(rejected),
            "ssh-rsa" => VerifyingKey::<Sha1>::new(self.key.clone())
                .verify(data, &signature)
                .map_err(rejected),
            other => Err(AgentError::crypto(format!(
                "rsa: unexpected signature type {other}"
            ))),
        }
    }
}
