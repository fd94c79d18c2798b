//! The in-memory key store.
//!
//! A [`KeyManager`] owns every key the agent holds, keyed by public-key
//! blob. It enforces lifetime expiry, the agent-wide lock with its
//! brute-force back-off, and fans events out to registered observers.
//!
//! The manager is shared process-wide behind a single mutex
//! ([`SharedKeyManager`]); all mutations and queries serialize under it.
//! Observer callbacks run synchronously while the lock is held and must
//! not call back into the manager.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::factory;
use super::lock::{LockProvider, SealedKey};
use super::public;
use super::{FingerprintFormat, PrivateKey};
use crate::agent::SessionBinding;
use crate::error::{AgentError, AgentResult};
use crate::proto::extension::restrict_destination::RestrictDestination;
use crate::proto::extension::{DestinationConstraint, MatchInfo};
use crate::proto::message::{AddIdentity, KeyConstraint};
use crate::secure::SecureBytes;

/// Shared handle to the process-wide key store.
pub type SharedKeyManager = Arc<Mutex<KeyManager>>;

/// Acquire the store lock, recovering from a poisoned mutex (a panicking
/// observer must not brick the agent).
pub(crate) fn lock_shared(manager: &SharedKeyManager) -> MutexGuard<'_, KeyManager> {
    manager.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listing entry for one key, also used as the key summary handed to
/// confirmation prompts.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PubKeyItem {
    /// `SHA256:` fingerprint of the public blob.
    pub fingerprint: String,

    /// Wire name of the key family.
    pub key_type: String,

    /// Comment attached when the key was added.
    pub comment: String,

    /// Canonical public-key blob.
    pub blob: Vec<u8>,
}

/// Callback surface for key-store events.
///
/// Emissions are synchronous, run in registration order under the store
/// lock, and must not re-enter the [`KeyManager`].
pub trait KeyManagerObserver: Send + Sync {
    /// A key was installed (after constraints were applied).
    fn on_key_added(&self, _key: &KeyEntry) {}

    /// A key is about to be removed and is still queryable.
    fn on_key_pre_remove(&self, _key: &KeyEntry) {}

    /// A key was removed; only its fingerprint survives.
    fn on_key_removed(&self, _fingerprint: &str) {}

    /// Every key was removed at once.
    fn on_keys_cleared(&self) {}

    /// A key produced a signature for `client`.
    fn on_key_used(&self, _key: &KeyEntry, _client: &str) {}

    /// A signature with the key was refused by the user.
    fn on_key_declined(&self, _key: &KeyEntry, _client: &str) {}

    /// The agent locked.
    fn on_locked(&self) {}

    /// The agent unlocked.
    fn on_unlocked(&self) {}
}

enum KeyState {
    /// Live signing material.
    Unlocked(Box<dyn PrivateKey>),

    /// Passphrase-encrypted material, present while the agent is locked.
    Locked(SealedKey),
}

/// One key held by the store, together with its metadata and constraints.
pub struct KeyEntry {
    key_type: String,
    public_blob: Vec<u8>,
    comment: String,
    fingerprint: String,
    added_at: Instant,
    lifetime_seconds: u32,
    confirm_required: bool,
    dest_constraints: Vec<DestinationConstraint>,
    state: KeyState,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("key_type", &self.key_type)
            .field("fingerprint", &self.fingerprint)
            .field("comment", &self.comment)
            .field("confirm_required", &self.confirm_required)
            .field("constraints", &self.dest_constraints.len())
            .finish_non_exhaustive()
    }
}

impl KeyEntry {
    fn new(key: Box<dyn PrivateKey>, comment: String) -> Self {
        let public_blob = key.public_blob().to_vec();
        let fingerprint = public::fingerprint(&public_blob, FingerprintFormat::Sha256Base64);
        Self {
            key_type: key.key_type().to_string(),
            public_blob,
            comment,
            fingerprint,
            added_at: Instant::now(),
            lifetime_seconds: 0,
            confirm_required: false,
            dest_constraints: vec![],
            state: KeyState::Unlocked(key),
        }
    }

    /// Wire name of the key family.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Canonical public-key blob.
    pub fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    /// Comment attached when the key was added.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// `SHA256:` fingerprint of the public blob.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether each use of the key needs user confirmation.
    pub fn confirm_required(&self) -> bool {
        self.confirm_required
    }

    /// Require (or stop requiring) confirmation per use.
    pub fn set_confirm_required(&mut self, confirm_required: bool) {
        self.confirm_required = confirm_required;
    }

    /// Destination constraints attached to the key.
    pub fn dest_constraints(&self) -> &[DestinationConstraint] {
        &self.dest_constraints
    }

    /// Whether any destination constraints are attached.
    pub fn has_dest_constraints(&self) -> bool {
        !self.dest_constraints.is_empty()
    }

    /// Replace the destination constraints.
    pub fn set_dest_constraints(&mut self, constraints: Vec<DestinationConstraint>) {
        self.dest_constraints = constraints;
    }

    /// Limit the key's lifetime; the clock restarts now. `0` clears the
    /// limit.
    pub fn set_lifetime(&mut self, seconds: u32) {
        self.lifetime_seconds = seconds;
        self.added_at = Instant::now();
    }

    /// Remaining lifetime in seconds, or `None` when the key does not
    /// expire.
    pub fn expire_in_seconds(&self) -> Option<i64> {
        if self.lifetime_seconds == 0 {
            return None;
        }
        let elapsed = self.added_at.elapsed().as_secs() as i64;
        Some(i64::from(self.lifetime_seconds) - elapsed)
    }

    /// Whether the lifetime has elapsed.
    pub fn expired(&self) -> bool {
        self.lifetime_seconds != 0
            && self.added_at.elapsed() >= Duration::from_secs(u64::from(self.lifetime_seconds))
    }

    /// Sign `data` with the key.
    pub fn sign(&self, data: &[u8], flags: u32) -> AgentResult<Vec<u8>> {
        match &self.state {
            KeyState::Unlocked(key) => key.sign(data, flags),
            KeyState::Locked(_) => Err(AgentError::invalid_state("key is locked")),
        }
    }

    /// A listing/prompt summary of the key.
    pub fn item(&self) -> PubKeyItem {
        PubKeyItem {
            fingerprint: self.fingerprint.clone(),
            key_type: self.key_type.clone(),
            comment: self.comment.clone(),
            blob: self.public_blob.clone(),
        }
    }

    fn lock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        let KeyState::Unlocked(key) = &self.state else {
            return Err(AgentError::invalid_state("key is already locked"));
        };
        let plain = key.encode_private()?;
        let sealed = SealedKey::seal(&plain, passphrase)?;
        self.state = KeyState::Locked(sealed);
        Ok(())
    }

    fn unlock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        let KeyState::Locked(sealed) = &self.state else {
            return Err(AgentError::invalid_state("key is not locked"));
        };
        let plain = sealed.open(passphrase)?;
        let key = factory::create_key(&self.key_type, &plain)?;
        self.state = KeyState::Unlocked(key);
        Ok(())
    }

    fn permitted_by_constraints(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        user: &str,
        mut match_info: Option<&mut MatchInfo>,
    ) -> bool {
        for constraint in &self.dest_constraints {
            if constraint.matches(from_key, to_key, user, match_info.as_deref_mut()) {
                debug!(key = %self.comment, "permitted by destination constraint");
                return true;
            }
        }
        info!(key = %self.comment, "not permitted by any destination constraint");
        false
    }

    /// Decide whether this key may be used on a session with the given
    /// binding chain.
    ///
    /// Walks the chain: every intermediate binding must be a forwarding
    /// bind, the final binding is the signing hop (checked against `user`),
    /// and every step must be covered by at least one constraint.
    pub fn permitted(
        &self,
        bindings: &[SessionBinding],
        binding_failed: bool,
        user: &str,
        mut match_info: Option<&mut MatchInfo>,
    ) -> bool {
        if self.dest_constraints.is_empty() {
            debug!(key = %self.comment, "no destination constraints, permitted by default");
            return true;
        }

        if binding_failed {
            warn!(key = %self.comment, "previous binding failed, refusing");
            return false;
        }

        if bindings.is_empty() {
            return true;
        }

        let mut from_key: &[u8] = &[];
        let last = bindings.len() - 1;

        for (i, binding) in bindings.iter().enumerate() {
            if binding.host_key.is_empty() {
                warn!(key = %self.comment, "session binding has empty host key, refusing");
                return false;
            }

            let mut user_to_check = "";
            if i == last {
                user_to_check = user;
                if binding.forwarded && !user.is_empty() {
                    warn!(key = %self.comment, "tried to sign on forwarding hop, refusing");
                    return false;
                }
            } else if !binding.forwarded {
                warn!(key = %self.comment, "tried to forward through a signing bind, refusing");
                return false;
            }

            if !self.permitted_by_constraints(
                from_key,
                &binding.host_key,
                user_to_check,
                match_info.as_deref_mut(),
            ) {
                info!(key = %self.comment, binding = i, "refused by constraints at binding");
                return false;
            }

            from_key = &binding.host_key;
        }

        // A chain ending in a forwarding bind must also permit onward use.
        let last_binding = &bindings[last];
        if last_binding.forwarded
            && user.is_empty()
            && !self.permitted_by_constraints(&last_binding.host_key, &[], "", None)
        {
            debug!(key = %self.comment, "permitted at host but not after, refusing");
            return false;
        }

        true
    }
}

/// The key store. See the [module docs](self) for the sharing model.
pub struct KeyManager {
    keys: Vec<KeyEntry>,
    observers: Vec<Weak<dyn KeyManagerObserver>>,
    lock_provider: Box<dyn LockProvider>,
    locked: bool,
    failed_attempts: u32,
    locked_until: Option<Instant>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("keys", &self.keys.len())
            .field("observers", &self.observers.len())
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Create a store guarding its keys with `lock_provider`.
    ///
    /// The provider is mandatory at construction: an agent that could hit
    /// its first LOCK request without one would be misconfigured beyond
    /// recovery.
    pub fn new(lock_provider: Box<dyn LockProvider>) -> SharedKeyManager {
        Arc::new(Mutex::new(Self {
            keys: vec![],
            observers: vec![],
            lock_provider,
            locked: false,
            failed_attempts: 0,
            locked_until: None,
        }))
    }

    fn find(&self, public_blob: &[u8]) -> Option<usize> {
        self.keys.iter().position(|k| k.public_blob == public_blob)
    }

    fn install(
        &mut self,
        key_type: &str,
        blob: &SecureBytes,
        comment: &str,
    ) -> AgentResult<usize> {
        // Extract first: an unsupported type must fail before any state
        // changes.
        let public_blob = factory::extract_public(key_type, blob)?;
        if let Some(existing) = self.find(&public_blob) {
            info!("key already present, replacing the old instance");
            self.keys.remove(existing);
        }

        let key = factory::create_key(key_type, blob)?;
        self.keys.push(KeyEntry::new(key, comment.to_string()));
        Ok(self.keys.len() - 1)
    }

    /// Add a key from its wire fields. Any existing key with the same
    /// public blob is replaced silently. Returns the public blob.
    pub fn add_key(
        &mut self,
        key_type: &str,
        blob: &SecureBytes,
        comment: &str,
    ) -> AgentResult<Vec<u8>> {
        let index = self.install(key_type, blob, comment)?;
        self.emit_key_added(index);
        Ok(self.keys[index].public_blob.clone())
    }

    /// Add a key from an ADD_IDENTITY message, applying its constraints.
    pub fn add_from_message(
        &mut self,
        identity: &AddIdentity,
        constraints: &[KeyConstraint],
    ) -> AgentResult<Vec<u8>> {
        let index = self.install(&identity.key_type, &identity.key_blob, &identity.comment)?;

        for constraint in constraints {
            match constraint {
                KeyConstraint::Lifetime(seconds) if *seconds > 0 => {
                    self.keys[index].set_lifetime(*seconds);
                }
                KeyConstraint::Lifetime(_) => {}
                KeyConstraint::Confirm => self.keys[index].set_confirm_required(true),
                KeyConstraint::Extension { name, payload } => {
                    if let Some(restrict) =
                        payload.as_any().downcast_ref::<RestrictDestination>()
                    {
                        self.keys[index].set_dest_constraints(restrict.constraints.clone());
                    } else {
                        debug!(extension = %name, "constraint extension not interpreted by the store");
                    }
                }
            }
        }

        self.emit_key_added(index);
        Ok(self.keys[index].public_blob.clone())
    }

    /// Remove the key with this public blob; a miss is a no-op.
    pub fn remove_key(&mut self, public_blob: &[u8]) {
        let Some(index) = self.find(public_blob) else {
            return;
        };
        self.emit_key_pre_remove(&self.keys[index]);
        let entry = self.keys.remove(index);
        self.emit_key_removed(&entry.fingerprint);
    }

    /// Remove every key, firing per-key events then the cleared event.
    pub fn remove_all_keys(&mut self) {
        let mut fingerprints = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            self.emit_key_pre_remove(key);
            fingerprints.push(key.fingerprint.clone());
        }
        self.keys.clear();
        for fingerprint in &fingerprints {
            self.emit_key_removed(fingerprint);
        }
        self.emit_keys_cleared();
    }

    /// Remove keys whose lifetime has elapsed.
    ///
    /// Expected to be driven by an external ticker at least once per
    /// second ([`spawn_expiry_sweeper`]).
    pub fn cleanup_expired_keys(&mut self) {
        let mut index = 0;
        while index < self.keys.len() {
            if self.keys[index].expired() {
                debug!(fingerprint = %self.keys[index].fingerprint, "removing expired key");
                self.emit_key_pre_remove(&self.keys[index]);
                let entry = self.keys.remove(index);
                self.emit_key_removed(&entry.fingerprint);
            } else {
                index += 1;
            }
        }
    }

    /// The keys a session is allowed to see, in insertion order.
    pub fn list_keys(
        &self,
        bindings: &[SessionBinding],
        binding_failed: bool,
    ) -> Vec<PubKeyItem> {
        let items: Vec<PubKeyItem> = self
            .keys
            .iter()
            .filter(|k| k.permitted(bindings, binding_failed, "", None))
            .map(KeyEntry::item)
            .collect();
        debug!(listed = items.len(), held = self.keys.len(), "listing identities");
        items
    }

    /// Sign `data` with the key owning `public_blob`.
    pub fn sign_data(&self, public_blob: &[u8], data: &[u8], flags: u32) -> AgentResult<Vec<u8>> {
        let index = self.find(public_blob).ok_or(AgentError::NotFound)?;
        self.keys[index].sign(data, flags)
    }

    /// Look up a key by public blob.
    pub fn get_key(&self, public_blob: &[u8]) -> Option<&KeyEntry> {
        self.find(public_blob).map(|i| &self.keys[i])
    }

    /// Look up a key by fingerprint. Linear: agents hold few keys.
    pub fn get_key_by_fingerprint(&self, fingerprint: &str) -> Option<&KeyEntry> {
        self.keys.iter().find(|k| k.fingerprint == fingerprint)
    }

    /// Restart the lifetime clock of a key. `0` clears the limit.
    pub fn set_lifetime(&mut self, public_blob: &[u8], seconds: u32) -> AgentResult<()> {
        let index = self.find(public_blob).ok_or(AgentError::NotFound)?;
        self.keys[index].set_lifetime(seconds);
        Ok(())
    }

    /// Toggle per-use confirmation of a key.
    pub fn set_confirm_required(&mut self, public_blob: &[u8], confirm: bool) -> AgentResult<()> {
        let index = self.find(public_blob).ok_or(AgentError::NotFound)?;
        self.keys[index].set_confirm_required(confirm);
        Ok(())
    }

    /// Replace the destination constraints of a key.
    pub fn set_dest_constraints(
        &mut self,
        public_blob: &[u8],
        constraints: Vec<DestinationConstraint>,
    ) -> AgentResult<()> {
        let index = self.find(public_blob).ok_or(AgentError::NotFound)?;
        self.keys[index].set_dest_constraints(constraints);
        Ok(())
    }

    /// Whether the agent is locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Lock the agent: install the passphrase verifier and seal every key.
    pub fn lock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        if self.locked {
            return Err(AgentError::invalid_state("agent is already locked"));
        }

        // Installed even with zero keys held, so the lock still guards
        // later additions.
        self.lock_provider.lock(passphrase)?;

        for key in &mut self.keys {
            key.lock(passphrase)?;
        }

        self.emit_locked();
        self.locked = true;
        Ok(())
    }

    /// Unlock the agent.
    ///
    /// Failed attempts count towards an exponential back-off: after the
    /// third failure, attempts (even with the right passphrase) are
    /// refused for ⌊1.8ⁿ⌋ seconds.
    pub fn unlock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        if !self.locked {
            return Err(AgentError::invalid_state("agent is not locked"));
        }

        if let Some(until) = self.locked_until {
            let now = Instant::now();
            if now < until {
                self.failed_attempts += 1;
                let remaining = (until - now).as_secs().max(1);
                return Err(AgentError::Throttled { remaining });
            }
        }

        let result = self.try_unlock(passphrase);
        if let Err(e) = result {
            self.failed_attempts += 1;
            if self.failed_attempts > 2 {
                let wait = (1.8f64.powi(self.failed_attempts as i32)).floor() as u64;
                warn!(wait, "too many failed unlock attempts, backing off");
                self.locked_until = Some(Instant::now() + Duration::from_secs(wait));
            }
            return Err(e);
        }

        self.emit_unlocked();
        self.locked = false;
        self.failed_attempts = 0;
        self.locked_until = None;
        Ok(())
    }

    fn try_unlock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        if !self.lock_provider.verify(passphrase)? {
            return Err(AgentError::crypto("incorrect passphrase"));
        }
        for key in &mut self.keys {
            key.unlock(passphrase)?;
        }
        Ok(())
    }

    /// Register an observer. Duplicates are suppressed; the manager holds
    /// only a weak reference, so dropping the observer unregisters it.
    pub fn register_observer(&mut self, observer: &Arc<dyn KeyManagerObserver>) {
        let weak = Arc::downgrade(observer);
        if self.observers.iter().any(|o| o.ptr_eq(&weak)) {
            return;
        }
        self.observers.push(weak);
    }

    /// Remove an observer registration.
    pub fn unregister_observer(&mut self, observer: &Arc<dyn KeyManagerObserver>) {
        let weak = Arc::downgrade(observer);
        self.observers.retain(|o| !o.ptr_eq(&weak));
    }

    /// Report a signature produced with the key owning `public_blob`.
    pub fn notify_key_used(&self, public_blob: &[u8], client: &str) {
        if let Some(entry) = self.get_key(public_blob) {
            for observer in self.live_observers() {
                observer.on_key_used(entry, client);
            }
        }
    }

    /// Report a declined signature with the key owning `public_blob`.
    pub fn notify_key_declined(&self, public_blob: &[u8], client: &str) {
        if let Some(entry) = self.get_key(public_blob) {
            for observer in self.live_observers() {
                observer.on_key_declined(entry, client);
            }
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn KeyManagerObserver>> {
        self.observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn emit_key_added(&self, index: usize) {
        for observer in self.live_observers() {
            observer.on_key_added(&self.keys[index]);
        }
    }

    fn emit_key_pre_remove(&self, key: &KeyEntry) {
        for observer in self.live_observers() {
            observer.on_key_pre_remove(key);
        }
    }

    fn emit_key_removed(&self, fingerprint: &str) {
        for observer in self.live_observers() {
            observer.on_key_removed(fingerprint);
        }
    }

    fn emit_keys_cleared(&self) {
        for observer in self.live_observers() {
            observer.on_keys_cleared();
        }
    }

    fn emit_locked(&self) {
        for observer in self.live_observers() {
            observer.on_locked();
        }
    }

    fn emit_unlocked(&self) {
        for observer in self.live_observers() {
            observer.on_unlocked();
        }
    }
}

/// Drive [`KeyManager::cleanup_expired_keys`] once per second until the
/// store is dropped.
pub fn spawn_expiry_sweeper(manager: &SharedKeyManager) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(manager) => lock_shared(&manager).cleanup_expired_keys(),
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use testresult::TestResult;

    use super::*;
    use crate::key::lock::Argon2LockProvider;
    use crate::key::test_support::{ed25519_fixture, ed25519_fixture_with_seed};

    fn manager() -> SharedKeyManager {
        KeyManager::new(Box::<Argon2LockProvider>::default())
    }

    #[test]
    fn add_list_and_lookup() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let fixture = ed25519_fixture();
        let blob = km.add_key("ssh-ed25519", &fixture.private_section, "test-key")?;
        assert_eq!(blob, fixture.public_blob);

        let list = km.list_keys(&[], false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].blob, fixture.public_blob);
        assert_eq!(list[0].comment, "test-key");

        let entry = km.get_key(&fixture.public_blob).expect("key present");
        assert_eq!(entry.comment(), "test-key");
        assert!(km.get_key_by_fingerprint(entry.fingerprint()).is_some());
        Ok(())
    }

    #[test]
    fn duplicate_add_replaces_old_instance() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let fixture = ed25519_fixture();
        km.add_key("ssh-ed25519", &fixture.private_section, "first")?;
        km.add_key("ssh-ed25519", &fixture.private_section, "second")?;
        let list = km.list_keys(&[], false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].comment, "second");
        Ok(())
    }

    #[test]
    fn unsupported_type_fails_without_side_effects() {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let blob = SecureBytes::from_slice(&[0x02; 32]);
        assert!(km.add_key("ssh-unsupported", &blob, "bad").is_err());
        assert!(km.list_keys(&[], false).is_empty());
    }

    #[test]
    fn remove_key_and_missing_remove() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let fixture = ed25519_fixture();
        km.add_key("ssh-ed25519", &fixture.private_section, "k")?;

        km.remove_key(&[0xFF; 8]); // unknown blob, no-op
        assert_eq!(km.list_keys(&[], false).len(), 1);

        km.remove_key(&fixture.public_blob);
        assert!(km.list_keys(&[], false).is_empty());
        Ok(())
    }

    #[test]
    fn sign_data_roundtrip_and_not_found() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let fixture = ed25519_fixture();
        km.add_key("ssh-ed25519", &fixture.private_section, "signer")?;

        let signature = km.sign_data(&fixture.public_blob, b"hello", 0)?;
        let pubkey = factory::create_public_key(&fixture.public_blob)?;
        pubkey.verify(b"hello", &signature)?;

        assert!(matches!(
            km.sign_data(&[0xFF; 8], b"hello", 0),
            Err(AgentError::NotFound)
        ));
        Ok(())
    }

    #[test]
    fn expiry_sweep_removes_only_elapsed_keys() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let short = ed25519_fixture_with_seed(0x01);
        let long = ed25519_fixture_with_seed(0x02);
        let short_blob = km.add_key("ssh-ed25519", &short.private_section, "short")?;
        km.add_key("ssh-ed25519", &long.private_section, "long")?;
        km.set_lifetime(&short_blob, 1)?;

        km.cleanup_expired_keys();
        assert_eq!(km.list_keys(&[], false).len(), 2, "nothing expired yet");

        std::thread::sleep(Duration::from_millis(1100));
        km.cleanup_expired_keys();
        let list = km.list_keys(&[], false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].comment, "long");
        Ok(())
    }

    #[test]
    fn expire_in_seconds_reports_remaining_time() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let fixture = ed25519_fixture();
        let blob = km.add_key("ssh-ed25519", &fixture.private_section, "k")?;
        assert_eq!(km.get_key(&blob).unwrap().expire_in_seconds(), None);
        km.set_lifetime(&blob, 600)?;
        let remaining = km.get_key(&blob).unwrap().expire_in_seconds().unwrap();
        assert!(remaining > 590 && remaining <= 600);
        Ok(())
    }

    #[test]
    fn lock_unlock_cycle_restores_signing() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let fixture = ed25519_fixture();
        let blob = km.add_key("ssh-ed25519", &fixture.private_section, "k")?;
        let before = km.sign_data(&blob, b"data", 0)?;

        let pw = SecureBytes::from_slice(b"pw");
        km.lock(&pw)?;
        assert!(km.is_locked());
        assert!(km.sign_data(&blob, b"data", 0).is_err());
        assert!(matches!(km.lock(&pw), Err(AgentError::InvalidState(_))));

        km.unlock(&pw)?;
        assert!(!km.is_locked());
        let after = km.sign_data(&blob, b"data", 0)?;
        // Ed25519 is deterministic, so the signatures match bit for bit.
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn unlock_with_wrong_passphrase_then_backoff() -> TestResult {
        let manager = manager();
        let mut km = lock_shared(&manager);
        let pw = SecureBytes::from_slice(b"pw");
        let bad = SecureBytes::from_slice(b"bad");
        km.lock(&pw)?;

        assert!(matches!(km.unlock(&bad), Err(AgentError::Crypto(_))));
        assert!(matches!(km.unlock(&bad), Err(AgentError::Crypto(_))));
        // Third failure arms the back-off window.
        assert!(matches!(km.unlock(&bad), Err(AgentError::Crypto(_))));
        // Now even the correct passphrase is throttled.
        assert!(matches!(
            km.unlock(&pw),
            Err(AgentError::Throttled { remaining }) if remaining > 0
        ));
        Ok(())
    }

    #[test]
    fn unlock_when_not_locked_is_invalid_state() {
        let manager = manager();
        let mut km = lock_shared(&manager);
        assert!(matches!(
            km.unlock(&SecureBytes::from_slice(b"pw")),
            Err(AgentError::InvalidState(_))
        ));
    }

    #[derive(Default)]
    struct CountingObserver {
        added: AtomicUsize,
        removed: AtomicUsize,
        cleared: AtomicUsize,
    }

    impl KeyManagerObserver for CountingObserver {
        fn on_key_added(&self, _key: &KeyEntry) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
        fn on_key_removed(&self, _fingerprint: &str) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_keys_cleared(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observers_deduplicate_and_drop_out_when_released() -> TestResult {
        let manager = manager();
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn KeyManagerObserver> = observer.clone();
        {
            let mut km = lock_shared(&manager);
            km.register_observer(&as_dyn);
            km.register_observer(&as_dyn); // duplicate, suppressed
        }

        let fixture = ed25519_fixture();
        lock_shared(&manager).add_key("ssh-ed25519", &fixture.private_section, "k")?;
        assert_eq!(observer.added.load(Ordering::SeqCst), 1);

        lock_shared(&manager).remove_all_keys();
        assert_eq!(observer.removed.load(Ordering::SeqCst), 1);
        assert_eq!(observer.cleared.load(Ordering::SeqCst), 1);

        drop(as_dyn);
        drop(observer);
        lock_shared(&manager).add_key("ssh-ed25519", &fixture.private_section, "again")?;
        // No panic: the dead observer was pruned on emission.
        Ok(())
    }

    #[tokio::test]
    async fn sweeper_task_expires_keys() -> TestResult {
        let manager = manager();
        let fixture = ed25519_fixture();
        {
            let mut km = lock_shared(&manager);
            let blob = km.add_key("ssh-ed25519", &fixture.private_section, "ephemeral")?;
            km.set_lifetime(&blob, 1)?;
        }
        let handle = spawn_expiry_sweeper(&manager);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(lock_shared(&manager).list_keys(&[], false).is_empty());
        handle.abort();
        Ok(())
    }
}
