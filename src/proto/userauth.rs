//! Hostbound user-authentication payload.
//!
//! When a key carries destination constraints, the agent refuses to sign
//! opaque bytes: the to-be-signed data must be a
//! `publickey-hostbound-v00@openssh.com` user-auth request, which carries
//! the session identifier and the server host key the client is talking
//! to. Those fields anchor the constraint checks in the sign path.

use super::de::Deserializer;
use super::error::{ProtoError, ProtoResult};

const SSH_MSG_USERAUTH_REQUEST: u8 = 50;

/// Parsed fields of a hostbound `SSH_MSG_USERAUTH_REQUEST` signature
/// payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UserAuthRequest {
    /// Session identifier from the client's key exchange.
    pub session_id: Vec<u8>,

    /// User the client is authenticating as.
    pub username: String,

    /// Wire name of the public-key algorithm in the request.
    pub key_type: String,

    /// Public-key blob the client presented.
    pub public_key: Vec<u8>,

    /// Host key of the server the session is bound towards.
    pub server_host_key: Vec<u8>,
}

impl UserAuthRequest {
    /// Parse the data of a sign request as a hostbound user-auth payload.
    pub fn parse(data: &[u8]) -> ProtoResult<Self> {
        let mut d = Deserializer::new(data);

        let session_id = d.read_blob()?;
        if session_id.is_empty() {
            return Err(ProtoError::bad_format("userauth request: empty session id"));
        }

        let msg_type = d.read_byte()?;
        if msg_type != SSH_MSG_USERAUTH_REQUEST {
            return Err(ProtoError::bad_format(format!(
                "userauth request: unexpected message type {msg_type}"
            )));
        }

        let username = d.read_string()?;
        let service_name = d.read_string()?;
        let method_name = d.read_string()?;
        let has_signature = d.read_byte()? != 0;
        if service_name != "ssh-connection"
            || method_name != "publickey-hostbound-v00@openssh.com"
            || !has_signature
        {
            return Err(ProtoError::bad_format(format!(
                "userauth request: unsupported service/method/signature: \
                 {service_name}/{method_name}/{has_signature}"
            )));
        }

        let key_type = d.read_string()?;
        let public_key = d.read_blob()?;
        let server_host_key = d.read_blob()?;

        Ok(Self {
            session_id,
            username,
            key_type,
            public_key,
            server_host_key,
        })
    }
}
