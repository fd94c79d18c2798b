//! Agent-wide lock support.
//!
//! Two pieces cooperate when the agent locks: a [`LockProvider`] stores a
//! verifier for the passphrase (so an agent with zero keys can still be
//! locked), and every key seals its private material into a [`SealedKey`]
//! so no plaintext survives until a matching unlock.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{AgentError, AgentResult};
use crate::secure::SecureBytes;

/// Passphrase verifier installed when the agent locks.
pub trait LockProvider: Send + Sync + std::fmt::Debug {
    /// Derive and store a verifier for `passphrase`.
    fn lock(&mut self, passphrase: &SecureBytes) -> AgentResult<()>;

    /// Check `passphrase` against the stored verifier.
    fn verify(&self, passphrase: &SecureBytes) -> AgentResult<bool>;
}

/// [`LockProvider`] backed by an Argon2id password hash.
#[derive(Debug, Default)]
pub struct Argon2LockProvider {
    hash: Option<String>,
}

impl LockProvider for Argon2LockProvider {
    fn lock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(passphrase, &salt)
            .map_err(AgentError::crypto)?;
        self.hash = Some(hash.to_string());
        Ok(())
    }

    fn verify(&self, passphrase: &SecureBytes) -> AgentResult<bool> {
        let hash = self
            .hash
            .as_deref()
            .ok_or_else(|| AgentError::invalid_state("no passphrase verifier installed"))?;
        let parsed = PasswordHash::new(hash).map_err(AgentError::crypto)?;
        match Argon2::default().verify_password(passphrase, &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AgentError::crypto(e)),
        }
    }
}

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Private key material encrypted under a passphrase.
///
/// The cipher key is derived with Argon2id from the passphrase and a fresh
/// salt; the material itself is sealed with AES-256-GCM, so tampering and
/// wrong passphrases are both caught by the tag check.
pub struct SealedKey {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedKey({} bytes)", self.ciphertext.len())
    }
}

impl SealedKey {
    fn derive_key(
        passphrase: &SecureBytes,
        salt: &[u8; SALT_LEN],
    ) -> AgentResult<Zeroizing<[u8; KEY_LEN]>> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::default()
            .hash_password_into(passphrase, salt, &mut *key)
            .map_err(AgentError::crypto)?;
        Ok(key)
    }

    /// Encrypt `plain` under `passphrase`.
    pub fn seal(plain: &SecureBytes, passphrase: &SecureBytes) -> AgentResult<Self> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = Self::derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&*key)
            .map_err(|_| AgentError::crypto("sealing key has the wrong length"))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| AgentError::crypto("failed to seal private key"))?;

        Ok(Self {
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with `passphrase`. A wrong passphrase fails the GCM tag
    /// check and surfaces as a `Crypto` error.
    pub fn open(&self, passphrase: &SecureBytes) -> AgentResult<SecureBytes> {
        let key = Self::derive_key(passphrase, &self.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&*key)
            .map_err(|_| AgentError::crypto("sealing key has the wrong length"))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| AgentError::crypto("incorrect passphrase"))?;
        Ok(SecureBytes::new(plain))
    }
}
