//! Typed request and response frames.
//!
//! Each message is a 1-byte type followed by a type-specific body; on the
//! wire the body is wrapped in `uint32 length ‖ body` framing. [`Request`]
//! covers messages sent *to* an agent, [`Response`] the replies, per
//! [draft-miller-ssh-agent-14 § 6.1](https://www.ietf.org/archive/id/draft-miller-ssh-agent-14.html#section-6.1).

use std::sync::Arc;

use super::de::Deserializer;
use super::error::{ProtoError, ProtoResult};
use super::extension::{self, ExtensionPayload};
use super::ser::Serializer;
use crate::key::factory;
use crate::secure::SecureBytes;

/// Sign-request flag requesting an RSA SHA-256 signature.
pub const RSA_SHA2_256: u32 = 0x02;
/// Sign-request flag requesting an RSA SHA-512 signature.
pub const RSA_SHA2_512: u32 = 0x04;

/// A public key / comment pair as advertised in an identities answer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Identity {
    /// Canonical public-key blob (`string keytype ‖ type-specific fields`).
    pub pubkey_blob: Vec<u8>,

    /// Free-form comment attached when the key was added.
    pub comment: String,
}

impl Identity {
    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let pubkey_blob = d.read_blob()?;
        let comment = d.read_string()?;
        Ok(Self {
            pubkey_blob,
            comment,
        })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_blob(&self.pubkey_blob)?;
        s.write_string(&self.comment)
    }
}

/// Body of a `SSH_AGENTC_SIGN_REQUEST` message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignRequest {
    /// Public-key blob selecting the signing key.
    pub key_blob: Vec<u8>,

    /// Bytes to be signed.
    pub data: Vec<u8>,

    /// Signature flags ([`RSA_SHA2_256`], [`RSA_SHA2_512`]).
    pub flags: u32,
}

impl SignRequest {
    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let key_blob = d.read_blob()?;
        let data = d.read_blob()?;
        let flags = d.read_u32()?;
        Ok(Self {
            key_blob,
            data,
            flags,
        })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_blob(&self.key_blob)?;
        s.write_blob(&self.data)?;
        s.write_u32(self.flags)
    }
}

/// Body of a `SSH_AGENTC_ADD_IDENTITY` message.
///
/// The private key material is not interpreted here: the registered
/// key-type skipper walks the type-specific fields so the byte range can be
/// captured verbatim (into pinned storage) and handed to the key factory.
#[derive(Clone, Debug)]
pub struct AddIdentity {
    /// Wire name of the key family (`ssh-ed25519`, `ssh-rsa`, …).
    pub key_type: String,

    /// The type-specific private-key fields, uninterpreted.
    pub key_blob: SecureBytes,

    /// Free-form comment.
    pub comment: String,
}

impl AddIdentity {
    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let key_type = d.read_string()?;
        let start = d.offset();
        factory::skip_key_blob(&key_type, d)?;
        let key_blob = d.slice_secure(start, d.offset())?;
        let comment = d.read_string()?;
        Ok(Self {
            key_type,
            key_blob,
            comment,
        })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_string(&self.key_type)?;
        s.write_raw(&self.key_blob)?;
        s.write_string(&self.comment)
    }
}

/// A key-use constraint attached via `SSH_AGENTC_ADD_ID_CONSTRAINED`.
#[derive(Clone, Debug)]
pub enum KeyConstraint {
    /// Delete the key after this many seconds.
    Lifetime(u32),

    /// Require explicit user confirmation for every use of the key.
    Confirm,

    /// A named constraint extension with a decoded payload.
    ///
    /// Unknown extension names fail the whole message: an agent that
    /// ignored a constraint it does not understand would hold the key
    /// under weaker rules than the client asked for.
    Extension {
        /// Extension name, e.g. `restrict-destination-v00@openssh.com`.
        name: String,
        /// Payload decoded by the registered constraint-extension factory.
        payload: Arc<dyn ExtensionPayload>,
    },
}

impl KeyConstraint {
    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let tag = d.read_byte()?;
        // see: https://www.ietf.org/archive/id/draft-miller-ssh-agent-14.html#section-3.2.7
        Ok(match tag {
            1 => KeyConstraint::Lifetime(d.read_u32()?),
            2 => KeyConstraint::Confirm,
            255 => {
                let name = d.read_string()?;
                let payload = extension::decode_constraint_extension(&name, d)?;
                KeyConstraint::Extension { name, payload }
            }
            tag => {
                return Err(ProtoError::bad_format(format!(
                    "unknown key constraint tag {tag}"
                )))
            }
        })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        match self {
            Self::Lifetime(seconds) => {
                s.write_byte(1)?;
                s.write_u32(*seconds)
            }
            Self::Confirm => s.write_byte(2),
            Self::Extension { name, payload } => {
                s.write_byte(255)?;
                s.write_string(name)?;
                payload.encode(s)
            }
        }
    }
}

/// Body of a `SSH_AGENTC_ADD_ID_CONSTRAINED` message: an [`AddIdentity`]
/// followed by constraints until the body ends.
#[derive(Clone, Debug)]
pub struct AddIdentityConstrained {
    /// The identity to add.
    pub identity: AddIdentity,

    /// Constraints placed on the identity.
    pub constraints: Vec<KeyConstraint>,
}

impl AddIdentityConstrained {
    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let identity = AddIdentity::decode(d)?;
        let mut constraints = vec![];
        while !d.is_finished() {
            constraints.push(KeyConstraint::decode(d)?);
        }
        Ok(Self {
            identity,
            constraints,
        })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        self.identity.encode(s)?;
        for constraint in &self.constraints {
            constraint.encode(s)?;
        }
        Ok(())
    }
}

/// Body of a `SSH_AGENTC_REMOVE_IDENTITY` message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RemoveIdentity {
    /// Public-key blob of the key to remove.
    pub key_blob: Vec<u8>,
}

impl RemoveIdentity {
    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        Ok(Self {
            key_blob: d.read_blob()?,
        })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_blob(&self.key_blob)
    }
}

/// Body of a `SSH_AGENTC_EXTENSION` message.
///
/// Only the extension name is interpreted at this layer; the rest of the
/// body is kept verbatim so the embedder gets first refusal before the
/// built-in handlers run.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExtensionMessage {
    /// Extension name, e.g. `session-bind@openssh.com`.
    pub name: String,

    /// Extension-specific bytes. Note that on the wire these are *not*
    /// length-prefixed; they run to the end of the frame.
    pub body: Vec<u8>,
}

impl ExtensionMessage {
    /// Build an extension message from a payload, serializing its body.
    pub fn from_payload(payload: &dyn ExtensionPayload) -> ProtoResult<Self> {
        let mut s = Serializer::new();
        payload.encode(&mut s)?;
        Ok(Self {
            name: payload.name().to_string(),
            body: s.into_vec(),
        })
    }

    fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let name = d.read_string()?;
        let body = d.read_remaining().to_vec();
        Ok(Self { name, body })
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_string(&self.name)?;
        s.write_raw(&self.body)
    }
}

/// Messages sent from a client to an agent.
#[derive(Clone, Debug)]
pub enum Request {
    /// Request the list of identities the agent will offer. (11)
    RequestIdentities,

    /// Perform a signature with a held key. (13)
    SignRequest(SignRequest),

    /// Add an identity. (17)
    AddIdentity(AddIdentity),

    /// Remove a single identity. (18)
    RemoveIdentity(RemoveIdentity),

    /// Remove every identity. (19)
    RemoveAllIdentities,

    /// Deprecated protocol-1 variant of remove-all; treated identically. (9)
    RemoveAllRsaIdentities,

    /// Lock the agent under a passphrase. (22)
    Lock(SecureBytes),

    /// Unlock a locked agent. (23)
    Unlock(SecureBytes),

    /// Add an identity with use constraints. (25)
    AddIdConstrained(AddIdentityConstrained),

    /// A named protocol extension. (27)
    Extension(ExtensionMessage),
}

impl Request {
    /// The protocol message identifier for this request.
    pub fn message_id(&self) -> u8 {
        match self {
            Self::RemoveAllRsaIdentities => 9,
            Self::RequestIdentities => 11,
            Self::SignRequest(_) => 13,
            Self::AddIdentity(_) => 17,
            Self::RemoveIdentity(_) => 18,
            Self::RemoveAllIdentities => 19,
            Self::Lock(_) => 22,
            Self::Unlock(_) => 23,
            Self::AddIdConstrained(_) => 25,
            Self::Extension(_) => 27,
        }
    }

    /// Human-readable name of the message type, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RemoveAllRsaIdentities => "SSH_AGENTC_REMOVE_ALL_RSA_IDENTITIES",
            Self::RequestIdentities => "SSH_AGENTC_REQUEST_IDENTITIES",
            Self::SignRequest(_) => "SSH_AGENTC_SIGN_REQUEST",
            Self::AddIdentity(_) => "SSH_AGENTC_ADD_IDENTITY",
            Self::RemoveIdentity(_) => "SSH_AGENTC_REMOVE_IDENTITY",
            Self::RemoveAllIdentities => "SSH_AGENTC_REMOVE_ALL_IDENTITIES",
            Self::Lock(_) => "SSH_AGENTC_LOCK",
            Self::Unlock(_) => "SSH_AGENTC_UNLOCK",
            Self::AddIdConstrained(_) => "SSH_AGENTC_ADD_ID_CONSTRAINED",
            Self::Extension(_) => "SSH_AGENTC_EXTENSION",
        }
    }

    /// Decode a request body (the bytes after the outer length prefix).
    pub fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let message_type = d.read_byte()?;
        match message_type {
            9 => Ok(Self::RemoveAllRsaIdentities),
            11 => Ok(Self::RequestIdentities),
            13 => SignRequest::decode(d).map(Self::SignRequest),
            17 => AddIdentity::decode(d).map(Self::AddIdentity),
            18 => RemoveIdentity::decode(d).map(Self::RemoveIdentity),
            19 => Ok(Self::RemoveAllIdentities),
            22 => Ok(Self::Lock(d.read_blob_secure()?)),
            23 => Ok(Self::Unlock(d.read_blob_secure()?)),
            25 => AddIdentityConstrained::decode(d).map(Self::AddIdConstrained),
            27 => ExtensionMessage::decode(d).map(Self::Extension),
            other => Err(ProtoError::bad_format(format!(
                "unsupported message type {other}"
            ))),
        }
    }

    /// Encode the body (type byte plus payload, no outer length).
    pub fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_byte(self.message_id())?;
        match self {
            Self::RequestIdentities | Self::RemoveAllIdentities | Self::RemoveAllRsaIdentities => {
                Ok(())
            }
            Self::SignRequest(request) => request.encode(s),
            Self::AddIdentity(identity) => identity.encode(s),
            Self::RemoveIdentity(identity) => identity.encode(s),
            Self::Lock(passphrase) | Self::Unlock(passphrase) => s.write_blob(passphrase),
            Self::AddIdConstrained(identity) => identity.encode(s),
            Self::Extension(extension) => extension.encode(s),
        }
    }

    /// Encode with outer framing. Returned in pinned storage because
    /// add-identity and lock requests carry secrets.
    pub fn to_frame(&self) -> ProtoResult<SecureBytes> {
        let mut s = Serializer::new();
        s.write_u32(0)?;
        self.encode(&mut s)?;
        s.finalize()?;
        Ok(s.into_secure())
    }
}

/// Messages sent from an agent back to a client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Response {
    /// Generic refusal. (5)
    Failure,

    /// Generic acknowledgement. (6)
    Success,

    /// The identities held (and permitted) by the agent. (12)
    IdentitiesAnswer(Vec<Identity>),

    /// A completed signature (`string sig-type ‖ blob signature`). (14)
    SignResponse(Vec<u8>),

    /// Refusal specific to an extension request. (28)
    ExtensionFailure,
}

impl Response {
    /// The protocol message identifier for this response.
    pub fn message_id(&self) -> u8 {
        match self {
            Self::Failure => 5,
            Self::Success => 6,
            Self::IdentitiesAnswer(_) => 12,
            Self::SignResponse(_) => 14,
            Self::ExtensionFailure => 28,
        }
    }

    /// Decode a response body (the bytes after the outer length prefix).
    pub fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let message_type = d.read_byte()?;
        match message_type {
            5 => Ok(Self::Failure),
            6 => Ok(Self::Success),
            12 => {
                let count = d.read_u32()?;
                let mut identities = vec![];
                for _ in 0..count {
                    identities.push(Identity::decode(d)?);
                }
                Ok(Self::IdentitiesAnswer(identities))
            }
            14 => Ok(Self::SignResponse(d.read_blob()?)),
            28 => Ok(Self::ExtensionFailure),
            other => Err(ProtoError::bad_format(format!(
                "unsupported message type {other}"
            ))),
        }
    }

    /// Encode the body (type byte plus payload, no outer length).
    pub fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_byte(self.message_id())?;
        match self {
            Self::Failure | Self::Success | Self::ExtensionFailure => Ok(()),
            Self::IdentitiesAnswer(identities) => {
                s.write_u32(identities.len() as u32)?;
                for identity in identities {
                    identity.encode(s)?;
                }
                Ok(())
            }
            Self::SignResponse(signature) => s.write_blob(signature),
        }
    }

    /// Encode with outer framing, ready to hand to the transport.
    pub fn to_frame(&self) -> ProtoResult<Vec<u8>> {
        let mut s = Serializer::new();
        s.write_u32(0)?;
        self.encode(&mut s)?;
        s.finalize()?;
        Ok(s.into_vec())
    }
}
