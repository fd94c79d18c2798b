//! Key families, the key-type registry and the key store.
//!
//! Polymorphism over key families is expressed as registries of factory
//! functions keyed by the wire name ([`factory`]); the protocol state
//! machine never changes when a family is added. The live material behind
//! a family is a [`PrivateKey`] trait object; host keys parsed out of
//! session binds are [`PublicKey`] trait objects.

pub mod ecdsa;
pub mod ed25519;
pub mod ed448;
pub mod factory;
pub mod lock;
pub mod manager;
pub mod public;
pub mod rsa;

use crate::error::AgentResult;
use crate::secure::SecureBytes;

pub use self::public::FingerprintFormat;

/// A live private key of one family.
///
/// Implementations hold the signing material; metadata (comment, lifetime,
/// constraints) lives on the owning [`manager::KeyEntry`].
pub trait PrivateKey: Send + Sync + std::fmt::Debug {
    /// Wire name of the key family.
    fn key_type(&self) -> &'static str;

    /// Canonical public-key blob (`string keytype ‖ type-specific fields`).
    fn public_blob(&self) -> &[u8];

    /// Sign `data`, returning the signature blob
    /// (`string sig-type ‖ blob signature-bytes`).
    ///
    /// `flags` selects the RSA digest ([`crate::proto::message::RSA_SHA2_256`],
    /// [`crate::proto::message::RSA_SHA2_512`]); other families ignore it.
    fn sign(&self, data: &[u8], flags: u32) -> AgentResult<Vec<u8>>;

    /// Re-encode the type-specific private fields as they appear in an
    /// ADD_IDENTITY message. Used to seal the key when the agent locks.
    fn encode_private(&self) -> AgentResult<SecureBytes>;
}

/// A public key, typically parsed out of a wire blob.
pub trait PublicKey: Send + Sync + std::fmt::Debug {
    /// Wire name of the key family.
    fn key_type(&self) -> &'static str;

    /// The canonical public-key blob.
    fn blob(&self) -> &[u8];

    /// Key size in bits, as reported in the randomart header.
    fn bits(&self) -> usize;

    /// Short family label for display (`RSA`, `ECDSA`, `ED25519`, …).
    fn family(&self) -> &'static str;

    /// Verify `signature_blob` (`string sig-type ‖ blob bytes`) over `data`.
    fn verify(&self, data: &[u8], signature_blob: &[u8]) -> AgentResult<()>;

    /// SHA-256 fingerprint of the key blob.
    fn fingerprint(&self, format: FingerprintFormat) -> String {
        public::fingerprint(self.blob(), format)
    }

    /// OpenSSH "drunken bishop" visual key, one row per line.
    fn randomart(&self) -> Vec<String> {
        public::randomart(self.blob(), self.family(), self.bits())
    }

    /// The `authorized_keys` line for this key.
    fn authorized_key_line(&self, comment: &str) -> String {
        public::authorized_key_line(self.key_type(), self.blob(), comment)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Deterministic key fixtures shared by unit tests.

    use ed25519_dalek::{Signer, SigningKey};

    use super::*;
    use crate::proto::Serializer;

    /// An ed25519 key pair plus its wire encodings.
    pub(crate) struct Ed25519Fixture {
        signing: SigningKey,
        /// `string "ssh-ed25519" ‖ blob pub`.
        pub public_blob: Vec<u8>,
        /// The ADD_IDENTITY private section: `blob pub ‖ blob (seed ‖ pub)`.
        pub private_section: SecureBytes,
    }

    impl Ed25519Fixture {
        /// Raw signature over `data` wrapped in the SSH signature blob.
        pub fn sign(&self, data: &[u8]) -> AgentResult<Vec<u8>> {
            let sig = self.signing.sign(data);
            let mut s = Serializer::new();
            s.write_string("ssh-ed25519")?;
            s.write_blob(&sig.to_bytes())?;
            Ok(s.into_vec())
        }
    }

    /// Build a fixture from a fixed seed byte.
    pub(crate) fn ed25519_fixture_with_seed(seed_byte: u8) -> Ed25519Fixture {
        let seed = [seed_byte; 32];
        let signing = SigningKey::from_bytes(&seed);
        let public = signing.verifying_key().to_bytes();

        let mut blob = Serializer::new();
        blob.write_string("ssh-ed25519").unwrap();
        blob.write_blob(&public).unwrap();
        let public_blob = blob.into_vec();

        let mut private = Serializer::new();
        private.write_blob(&public).unwrap();
        let mut keypair = Vec::with_capacity(64);
        keypair.extend_from_slice(&seed);
        keypair.extend_from_slice(&public);
        private.write_blob(&keypair).unwrap();

        Ed25519Fixture {
            signing,
            public_blob,
            private_section: private.into_secure(),
        }
    }

    pub(crate) fn ed25519_fixture() -> Ed25519Fixture {
        ed25519_fixture_with_seed(0x42)
    }
}
