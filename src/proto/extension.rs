//! Protocol extension registries.
//!
//! The protocol keeps two open sets of named extensions: *message*
//! extensions carried in type-27 frames, and *constraint* extensions
//! attached to keys under constraint tag 255. Both sets are name→factory
//! tables; adding an extension is a registration, never a change to the
//! dispatcher.

pub mod restrict_destination;
pub mod session_bind;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use super::de::Deserializer;
use super::error::{ProtoError, ProtoResult};
use super::ser::Serializer;
use crate::error::AgentResult;

pub use self::restrict_destination::{
    DestinationConstraint, HopDescriptor, HopKey, MatchInfo, RestrictDestination,
};
pub use self::session_bind::SessionBind;

/// A decoded extension payload.
///
/// Payloads are held behind `Arc<dyn ExtensionPayload>`; consumers that
/// need the concrete type downcast through [`as_any`](Self::as_any).
pub trait ExtensionPayload: std::fmt::Debug + Send + Sync {
    /// The extension name this payload belongs to.
    fn name(&self) -> &'static str;

    /// Serialize the payload body (the bytes following the name).
    fn encode(&self, s: &mut Serializer) -> ProtoResult<()>;

    /// Downcasting hook.
    fn as_any(&self) -> &dyn Any;
}

/// Factory decoding a message-extension body.
///
/// Message extensions may perform cryptographic checks while decoding
/// (`session-bind` verifies the host-key signature), hence the wider error
/// type.
pub type MessageExtensionDecodeFn =
    fn(&mut Deserializer<'_>) -> AgentResult<Arc<dyn ExtensionPayload>>;

/// Factory decoding a constraint-extension body.
pub type ConstraintExtensionDecodeFn =
    fn(&mut Deserializer<'_>) -> ProtoResult<Arc<dyn ExtensionPayload>>;

struct Registry {
    message: RwLock<HashMap<String, MessageExtensionDecodeFn>>,
    constraint: RwLock<HashMap<String, ConstraintExtensionDecodeFn>>,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let mut message: HashMap<String, MessageExtensionDecodeFn> = HashMap::new();
    message.insert(session_bind::NAME.to_string(), session_bind::decode);

    let mut constraint: HashMap<String, ConstraintExtensionDecodeFn> = HashMap::new();
    constraint.insert(
        restrict_destination::NAME.to_string(),
        restrict_destination::decode,
    );

    Registry {
        message: RwLock::new(message),
        constraint: RwLock::new(constraint),
    }
});

fn poisoned() -> ProtoError {
    ProtoError::bad_format("extension registry lock poisoned")
}

/// Register a decoder for a message extension name.
pub fn register_message_extension(name: &str, decode: MessageExtensionDecodeFn) {
    if let Ok(mut table) = REGISTRY.message.write() {
        table.insert(name.to_string(), decode);
    }
}

/// Register a decoder for a constraint extension name.
pub fn register_constraint_extension(name: &str, decode: ConstraintExtensionDecodeFn) {
    if let Ok(mut table) = REGISTRY.constraint.write() {
        table.insert(name.to_string(), decode);
    }
}

/// Decode a message-extension body via the registered factory.
///
/// Fails with [`ProtoError::UnknownType`] when the name is not registered.
pub fn decode_message_extension(
    name: &str,
    d: &mut Deserializer<'_>,
) -> AgentResult<Arc<dyn ExtensionPayload>> {
    let decode = *REGISTRY
        .message
        .read()
        .map_err(|_| poisoned())?
        .get(name)
        .ok_or_else(|| ProtoError::UnknownType(name.to_string()))?;
    decode(d)
}

/// Decode a constraint-extension body via the registered factory.
///
/// Fails with [`ProtoError::UnknownType`] when the name is not registered.
pub fn decode_constraint_extension(
    name: &str,
    d: &mut Deserializer<'_>,
) -> ProtoResult<Arc<dyn ExtensionPayload>> {
    let decode = *REGISTRY
        .constraint
        .read()
        .map_err(|_| poisoned())?
        .get(name)
        .ok_or_else(|| ProtoError::UnknownType(name.to_string()))?;
    decode(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_are_rejected() {
        let mut d = Deserializer::new(&[]);
        assert!(matches!(
            decode_constraint_extension("nope@example.com", &mut d),
            Err(ProtoError::UnknownType(_))
        ));
        let mut d = Deserializer::new(&[]);
        assert!(matches!(
            decode_message_extension("nope@example.com", &mut d),
            Err(crate::error::AgentError::Proto(ProtoError::UnknownType(_)))
        ));
    }

    #[test]
    fn builtins_are_registered() {
        assert!(REGISTRY
            .message
            .read()
            .unwrap()
            .contains_key(session_bind::NAME));
        assert!(REGISTRY
            .constraint
            .read()
            .unwrap()
            .contains_key(restrict_destination::NAME));
    }
}
