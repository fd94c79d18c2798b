//! SSH agent protocol structures and wire codec.

pub mod de;
pub mod error;
pub mod extension;
pub mod message;
pub mod ser;
pub mod userauth;

/// Upper bound on a serialized agent frame, matching the message limits
/// agents in the wild enforce.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

pub use self::de::Deserializer;
pub use self::error::{ProtoError, ProtoResult};
pub use self::message::{
    AddIdentity, AddIdentityConstrained, ExtensionMessage, Identity, KeyConstraint, RemoveIdentity,
    Request, Response, SignRequest,
};
pub use self::ser::Serializer;
