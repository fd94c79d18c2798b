//! The key-type registry.
//!
//! Each key family registers three private-key operations (create, extract
//! public blob, skip blob) and a public-key constructor under its wire
//! name. Dispatch is purely data-driven: supporting a new family is one
//! [`register_key_type`]/[`register_public_key_type`] call.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use super::{ecdsa, ed25519, ed448, rsa, PrivateKey, PublicKey};
use crate::error::{AgentError, AgentResult};
use crate::proto::de::Deserializer;
use crate::proto::error::{ProtoError, ProtoResult};
use crate::secure::SecureBytes;

/// Construct a live private key from the type-specific wire fields.
pub type CreateKeyFn = fn(&SecureBytes) -> AgentResult<Box<dyn PrivateKey>>;

/// Derive the canonical public blob from the private wire fields.
pub type ExtractPublicFn = fn(&SecureBytes) -> AgentResult<Vec<u8>>;

/// Walk over the type-specific wire fields without interpreting them.
///
/// Used while parsing ADD_IDENTITY so the caller learns the byte range the
/// key material occupies.
pub type SkipBlobFn = fn(&mut Deserializer<'_>) -> ProtoResult<()>;

/// Construct a public key from a canonical public blob.
pub type CreatePublicKeyFn = fn(&[u8]) -> AgentResult<Box<dyn PublicKey>>;

/// The three private-key operations of one family.
#[derive(Clone, Copy)]
pub struct KeyTypeHandlers {
    /// See [`CreateKeyFn`].
    pub create: CreateKeyFn,

    /// See [`ExtractPublicFn`].
    pub extract_public: ExtractPublicFn,

    /// See [`SkipBlobFn`].
    pub skip: SkipBlobFn,
}

impl std::fmt::Debug for KeyTypeHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyTypeHandlers")
    }
}

struct Registry {
    private: RwLock<HashMap<String, KeyTypeHandlers>>,
    public: RwLock<HashMap<String, CreatePublicKeyFn>>,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let mut private = HashMap::new();
    let mut public = HashMap::new();
    rsa::register(&mut private, &mut public);
    ecdsa::register(&mut private, &mut public);
    ed25519::register(&mut private, &mut public);
    ed448::register(&mut private, &mut public);
    Registry {
        private: RwLock::new(private),
        public: RwLock::new(public),
    }
});

/// Register a key family under its wire name.
///
/// Fails with `InvalidState` when the name is already taken.
pub fn register_key_type(name: &str, handlers: KeyTypeHandlers) -> AgentResult<()> {
    let mut table = REGISTRY
        .private
        .write()
        .map_err(|_| AgentError::invalid_state("key registry lock poisoned"))?;
    if table.contains_key(name) {
        return Err(AgentError::invalid_state(format!(
            "key type already registered: {name}"
        )));
    }
    table.insert(name.to_string(), handlers);
    Ok(())
}

/// Register a public-key constructor under its wire name.
pub fn register_public_key_type(name: &str, create: CreatePublicKeyFn) -> AgentResult<()> {
    let mut table = REGISTRY
        .public
        .write()
        .map_err(|_| AgentError::invalid_state("key registry lock poisoned"))?;
    if table.contains_key(name) {
        return Err(AgentError::invalid_state(format!(
            "public key type already registered: {name}"
        )));
    }
    table.insert(name.to_string(), create);
    Ok(())
}

fn private_handlers(key_type: &str) -> ProtoResult<KeyTypeHandlers> {
    REGISTRY
        .private
        .read()
        .map_err(|_| ProtoError::bad_format("key registry lock poisoned"))?
        .get(key_type)
        .copied()
        .ok_or_else(|| ProtoError::UnknownType(key_type.to_string()))
}

/// Create a private key from its type name and wire fields.
pub fn create_key(key_type: &str, blob: &SecureBytes) -> AgentResult<Box<dyn PrivateKey>> {
    (private_handlers(key_type)?.create)(blob)
}

/// Derive the canonical public blob from private wire fields.
pub fn extract_public(key_type: &str, blob: &SecureBytes) -> AgentResult<Vec<u8>> {
    (private_handlers(key_type)?.extract_public)(blob)
}

/// Skip the type-specific wire fields of `key_type`.
pub fn skip_key_blob(key_type: &str, d: &mut Deserializer<'_>) -> ProtoResult<()> {
    (private_handlers(key_type)?.skip)(d)
}

/// Parse a canonical public blob into a [`PublicKey`].
///
/// The blob's leading `string keytype` selects the constructor.
pub fn create_public_key(blob: &[u8]) -> AgentResult<Box<dyn PublicKey>> {
    let mut d = Deserializer::new(blob);
    let key_type = d.read_string()?;
    let create = *REGISTRY
        .public
        .read()
        .map_err(|_| AgentError::invalid_state("key registry lock poisoned"))?
        .get(&key_type)
        .ok_or_else(|| ProtoError::UnknownType(key_type.clone()))?;
    create(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_families_are_registered() {
        for name in [
            "ssh-rsa",
            "ecdsa-sha2-nistp256",
            "ecdsa-sha2-nistp384",
            "ecdsa-sha2-nistp521",
            "ssh-ed25519",
            "ssh-ed448",
        ] {
            assert!(private_handlers(name).is_ok(), "missing family {name}");
        }
    }

    #[test]
    fn unknown_family_is_unknown_type() {
        assert!(matches!(
            private_handlers("ssh-unsupported"),
            Err(ProtoError::UnknownType(_))
        ));

        let blob = {
            let mut s = crate::proto::Serializer::new();
            s.write_string("ssh-unsupported").unwrap();
            s.into_vec()
        };
        assert!(matches!(
            create_public_key(&blob),
            Err(AgentError::Proto(ProtoError::UnknownType(_)))
        ));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let handlers = KeyTypeHandlers {
            create: |_| Err(AgentError::NotFound),
            extract_public: |_| Err(AgentError::NotFound),
            skip: |_| Ok(()),
        };
        assert!(matches!(
            register_key_type("ssh-ed25519", handlers),
            Err(AgentError::InvalidState(_))
        ));
    }
}
