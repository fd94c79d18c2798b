#![doc = include_str!("../README.md")]
#![deny(missing_debug_implementations)]
#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod agent;
pub mod error;
pub mod key;
pub mod logging;
pub mod proto;
pub mod secure;

pub use async_trait::async_trait;

pub use self::error::{AgentError, AgentResult};
pub use self::secure::SecureBytes;
