//! Per-connection protocol handling.
//!
//! The embedder owns the transport: it reads bytes from a Unix socket, a
//! named pipe or a test harness and feeds them to
//! [`Session::process`](session::Session::process); replies come back
//! through the [`Connection`] it supplies. Everything protocol-shaped —
//! framing, dispatch, the lock gate, the session-bind chain — lives in
//! [`session`].

pub mod session;

use async_trait::async_trait;

use crate::key::manager::PubKeyItem;
use crate::proto::message::ExtensionMessage;

pub use self::session::{Session, SessionBinding};

/// Embedder-supplied hooks for one connection.
///
/// `confirm_request` and `send` are the session's suspension points: both
/// may block (a UI prompt can take seconds) and are awaited. The
/// transport must keep requests on one session serial — never feed the
/// session another request before the previous one has been answered.
#[async_trait]
pub trait Connection: Send {
    /// Blocking yes/no prompt shown before a guarded key is used.
    ///
    /// The default accepts, for embedders without any UI.
    async fn confirm_request(&mut self, _key: &PubKeyItem) -> bool {
        true
    }

    /// Additional confirmation policy on top of the per-key confirm flag.
    fn requires_confirmation(&self, _key: &PubKeyItem) -> bool {
        false
    }

    /// First refusal on extension messages. Return `true` to signal the
    /// extension was consumed; the session then replies with success.
    async fn process_extension_message(&mut self, _msg: &ExtensionMessage) -> bool {
        false
    }

    /// Write a framed reply to the transport. Returns whether the write
    /// succeeded.
    async fn send(&mut self, data: &[u8]) -> bool;

    /// Human-readable peer label, used in logs and prompts.
    fn client(&self) -> String;
}
