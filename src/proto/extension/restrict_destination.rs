//! The `restrict-destination-v00@openssh.com` constraint extension.
//!
//! A destination constraint limits where a key may be used: each constraint
//! is a `(from-hop, to-hop)` pair and a hop names a user, a hostname and
//! the host keys that identify it. Evaluation against a session's binding
//! chain happens in [`DestinationConstraint::matches`] and in the key-level
//! walk in [`crate::key::manager`].

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::ExtensionPayload;
use crate::proto::de::Deserializer;
use crate::proto::error::{ProtoError, ProtoResult};
use crate::proto::ser::Serializer;

/// Wire name of the extension.
pub const NAME: &str = "restrict-destination-v00@openssh.com";

/// A host key entry inside a hop.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HopKey {
    /// Public-key blob identifying the host.
    pub key: Vec<u8>,

    /// Whether the key is a certification authority key.
    pub is_ca: bool,
}

/// One hop in a destination constraint: `(user, hostname, keys)`.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct HopDescriptor {
    /// User the constraint applies to; empty acts as a wildcard.
    pub user: String,

    /// Hostname of the hop; empty only in the "from anywhere" form.
    pub hostname: String,

    /// Host keys identifying the hop.
    pub keys: Vec<HopKey>,
}

impl HopDescriptor {
    /// Parse a hop from the contents of a hop blob.
    pub fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let user = d.read_string()?;
        let hostname = d.read_string()?;
        let extensions = d.read_blob()?;
        if !extensions.is_empty() {
            return Err(ProtoError::bad_format(
                "hop extensions are not supported",
            ));
        }
        let mut keys = vec![];
        while !d.is_finished() {
            let key = d.read_blob()?;
            let is_ca = d.read_byte()? != 0;
            keys.push(HopKey { key, is_ca });
        }
        Ok(Self {
            user,
            hostname,
            keys,
        })
    }

    /// Serialize the hop (the contents of a hop blob).
    pub fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        s.write_string(&self.user)?;
        s.write_string(&self.hostname)?;
        // no extensions
        s.write_blob(&[])?;
        for hop_key in &self.keys {
            s.write_blob(&hop_key.key)?;
            s.write_byte(u8::from(hop_key.is_ca))?;
        }
        Ok(())
    }

    /// Whether `key` identifies this hop.
    ///
    /// CA entries never match: certificate-based host identification is
    /// deferred, so a CA-only hop matches nothing rather than everything.
    pub fn matches_key(&self, key: &[u8]) -> bool {
        for hop_key in &self.keys {
            if hop_key.key.is_empty() {
                warn!("empty key in hop descriptor");
                return false;
            }
            if hop_key.is_ca {
                warn!("CA hop keys are not supported yet, skipping");
                continue;
            }
            if hop_key.key == key {
                return true;
            }
        }
        false
    }
}

impl fmt::Display for HopDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.is_empty() && self.keys.is_empty() && self.user.is_empty() {
            return write!(f, "Any");
        }
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}", self.hostname)?;
        if !self.keys.is_empty() {
            write!(f, " ({} keys)", self.keys.len())?;
        }
        Ok(())
    }
}

/// Details of a successful constraint match, recorded for prompts and logs.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct MatchInfo {
    /// Hostname of the hop the request came from.
    pub from: String,

    /// Hostname the key is being used towards.
    pub to: String,

    /// User the match was evaluated for.
    pub user: String,
}

/// A single `(from-hop, to-hop)` destination constraint.
///
/// Construction validates the structural invariants: the from-hop carries
/// either no hostname and no keys or both, and never a user; the to-hop
/// always carries a hostname and keys.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DestinationConstraint {
    from: HopDescriptor,
    to: HopDescriptor,
}

impl DestinationConstraint {
    /// Build a constraint from validated hops.
    pub fn new(from: HopDescriptor, to: HopDescriptor) -> ProtoResult<Self> {
        if from.hostname.is_empty() != from.keys.is_empty() || !from.user.is_empty() {
            return Err(ProtoError::bad_format(
                "invalid from-hop in destination constraint",
            ));
        }
        if to.hostname.is_empty() || to.keys.is_empty() {
            return Err(ProtoError::bad_format(
                "invalid to-hop in destination constraint",
            ));
        }
        Ok(Self { from, to })
    }

    /// Parse a constraint from the contents of a constraint blob.
    pub fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let from_blob = d.read_blob()?;
        let to_blob = d.read_blob()?;
        let extensions = d.read_blob()?;
        if !extensions.is_empty() {
            return Err(ProtoError::bad_format(
                "constraint extensions are not supported",
            ));
        }
        let from = HopDescriptor::decode(&mut Deserializer::new(&from_blob))?;
        let to = HopDescriptor::decode(&mut Deserializer::new(&to_blob))?;
        Self::new(from, to)
    }

    /// Serialize the constraint (the contents of a constraint blob).
    pub fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        let mut from = Serializer::new();
        self.from.encode(&mut from)?;
        let mut to = Serializer::new();
        self.to.encode(&mut to)?;
        s.write_blob(from.as_bytes())?;
        s.write_blob(to.as_bytes())?;
        // no extensions
        s.write_blob(&[])
    }

    /// The source hop.
    pub fn from_hop(&self) -> &HopDescriptor {
        &self.from
    }

    /// The destination hop.
    pub fn to_hop(&self) -> &HopDescriptor {
        &self.to
    }

    /// Evaluate the constraint for one step of a binding chain.
    ///
    /// An empty `from_key` stands for the origin of the chain and only
    /// matches the "from anywhere" hop form. `user` is checked only when
    /// both the to-hop's user and the supplied user are non-empty (either
    /// side empty is a wildcard); the comparison is exact.
    pub fn matches(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        user: &str,
        match_info: Option<&mut MatchInfo>,
    ) -> bool {
        if from_key.is_empty() {
            if !self.from.hostname.is_empty() || !self.from.keys.is_empty() {
                return false;
            }
        } else if !self.from.matches_key(from_key) {
            return false;
        }

        if !to_key.is_empty() && !self.to.matches_key(to_key) {
            return false;
        }

        if !self.to.user.is_empty() && !user.is_empty() && self.to.user != user {
            return false;
        }

        if let Some(info) = match_info {
            info.from = self.from.hostname.clone();
            info.to = self.to.hostname.clone();
            info.user = user.to_string();
        }

        debug!(to = %self.to.hostname, "allowed to host");
        true
    }
}

impl fmt::Display for DestinationConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > {}", self.from, self.to)
    }
}

/// The decoded `restrict-destination-v00@openssh.com` payload: a list of
/// destination constraints.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct RestrictDestination {
    /// The constraints, in wire order.
    pub constraints: Vec<DestinationConstraint>,
}

impl RestrictDestination {
    /// Parse the extension body: a blob holding a sequence of constraint
    /// blobs.
    pub fn decode_body(d: &mut Deserializer<'_>) -> ProtoResult<Self> {
        let data = d.read_blob()?;
        let mut inner = Deserializer::new(&data);
        let mut constraints = vec![];
        while !inner.is_finished() {
            let blob = inner.read_blob()?;
            constraints.push(DestinationConstraint::decode(&mut Deserializer::new(
                &blob,
            ))?);
        }
        Ok(Self { constraints })
    }
}

impl ExtensionPayload for RestrictDestination {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&self, s: &mut Serializer) -> ProtoResult<()> {
        let mut list = Serializer::new();
        for constraint in &self.constraints {
            let mut c = Serializer::new();
            constraint.encode(&mut c)?;
            list.write_blob(c.as_bytes())?;
        }
        s.write_blob(list.as_bytes())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Registry entry point.
pub(super) fn decode(d: &mut Deserializer<'_>) -> ProtoResult<Arc<dyn ExtensionPayload>> {
    Ok(Arc::new(RestrictDestination::decode_body(d)?))
}
