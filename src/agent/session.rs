//! The per-connection protocol state machine.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BytesMut};
use tracing::{debug, error, info, warn};

use super::Connection;
use crate::error::{AgentError, AgentResult};
use crate::key::manager::{lock_shared, KeyManager, PubKeyItem, SharedKeyManager};
use crate::proto::extension::{self, MatchInfo, SessionBind};
use crate::proto::message::{
    AddIdentity, ExtensionMessage, Identity, KeyConstraint, Request, Response, SignRequest,
};
use crate::proto::userauth::UserAuthRequest;
use crate::proto::{Deserializer, ProtoError, MAX_FRAME_SIZE};
use crate::secure::SecureBytes;

/// A `(host-key, session-id, forwarded)` triple appended by a successful
/// `session-bind@openssh.com` extension.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SessionBinding {
    /// Host key of the server the connection was bound to.
    pub host_key: Vec<u8>,

    /// Session identifier from that server's key exchange.
    pub session_id: Vec<u8>,

    /// Whether the bind was made for forwarding.
    pub forwarded: bool,
}

/// One client connection to the agent.
///
/// Feed raw transport bytes to [`process`](Self::process); replies go out
/// through the [`Connection`]. Within a session, requests are handled and
/// answered strictly in order. The binding chain is append-only for the
/// session's lifetime, and a failed bind poisons the session for every
/// later constrained signature.
pub struct Session<C: Connection> {
    manager: SharedKeyManager,
    conn: C,
    buffer: BytesMut,
    bindings: Vec<SessionBinding>,
    binding_failed: bool,
    is_forwarded: bool,
    match_info: Option<MatchInfo>,
    waiting_for_confirmation: bool,
    waiting_for_key_selection: bool,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.conn.client())
            .field("bindings", &self.bindings.len())
            .field("binding_failed", &self.binding_failed)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a session for one connection.
    pub fn new(manager: SharedKeyManager, conn: C) -> Self {
        Self {
            manager,
            conn,
            buffer: BytesMut::new(),
            bindings: vec![],
            binding_failed: false,
            is_forwarded: false,
            match_info: None,
            waiting_for_confirmation: false,
            waiting_for_key_selection: false,
        }
    }

    /// The session-bind chain accumulated so far.
    pub fn bindings(&self) -> &[SessionBinding] {
        &self.bindings
    }

    /// Whether a session-bind ever failed on this session. Sticky.
    pub fn binding_failed(&self) -> bool {
        self.binding_failed
    }

    /// Whether any binding was made for forwarding.
    pub fn is_forwarded(&self) -> bool {
        self.is_forwarded
    }

    /// Constraint-match details of the signature currently in flight.
    pub fn match_info(&self) -> Option<&MatchInfo> {
        self.match_info.as_ref()
    }

    /// Consume transport bytes, dispatching every complete frame.
    ///
    /// Bytes are buffered until a full `uint32 length ‖ body` frame is
    /// available; a chunk may carry part of a frame or several frames.
    /// Protocol-level problems are answered with `SSH_AGENT_FAILURE` and
    /// `Ok(())`; an `Err` (oversized frame, transport write failure,
    /// misuse of a suspended session) means the session should be torn
    /// down.
    pub async fn process(&mut self, data: &[u8]) -> AgentResult<()> {
        self.buffer.extend_from_slice(data);
        loop {
            if self.buffer.len() < 4 {
                return Ok(());
            }
            let mut header = &self.buffer[..4];
            let declared = header.read_u32::<BigEndian>()? as usize;
            if declared == 0 {
                return Err(ProtoError::bad_format("zero-length frame").into());
            }
            if declared > MAX_FRAME_SIZE {
                return Err(ProtoError::TooLarge.into());
            }
            if self.buffer.len() < 4 + declared {
                return Ok(());
            }
            let frame = self.buffer.split_to(4 + declared);
            let mut body = frame.freeze();
            body.advance(4);
            self.dispatch(&body).await?;
        }
    }

    async fn dispatch(&mut self, body: &[u8]) -> AgentResult<()> {
        let request = match Request::decode(&mut Deserializer::new(body)) {
            Ok(request) => request,
            Err(e) => {
                error!(client = %self.conn.client(), error = %e, "failed to parse request");
                return self.send_failure().await;
            }
        };

        let locked = lock_shared(&self.manager).is_locked();
        if locked && !matches!(request, Request::Unlock(_)) {
            warn!(
                message = request.type_name(),
                "agent is locked; rejecting message"
            );
            return self.send_failure().await;
        }

        debug!(
            client = %self.conn.client(),
            message = request.type_name(),
            id = request.message_id(),
            "processing message"
        );

        match request {
            Request::AddIdentity(identity) => self.process_add_identity(identity, vec![]).await,
            Request::AddIdConstrained(add) => {
                self.process_add_identity(add.identity, add.constraints).await
            }
            Request::RemoveIdentity(remove) => {
                lock_shared(&self.manager).remove_key(&remove.key_blob);
                self.send_success().await
            }
            Request::RemoveAllIdentities | Request::RemoveAllRsaIdentities => {
                info!("removing all identities");
                lock_shared(&self.manager).remove_all_keys();
                self.send_success().await
            }
            Request::RequestIdentities => self.process_request_identities().await,
            Request::SignRequest(request) => self.process_sign_request(request).await,
            Request::Extension(message) => self.process_extension(message).await,
            Request::Lock(passphrase) => self.process_lock(&passphrase).await,
            Request::Unlock(passphrase) => self.process_unlock(&passphrase).await,
        }
    }

    async fn process_add_identity(
        &mut self,
        identity: AddIdentity,
        constraints: Vec<KeyConstraint>,
    ) -> AgentResult<()> {
        debug!(
            key_type = %identity.key_type,
            comment = %identity.comment,
            constraints = constraints.len(),
            "adding identity"
        );
        let result = lock_shared(&self.manager).add_from_message(&identity, &constraints);
        match result {
            Ok(_) => self.send_success().await,
            Err(e) => {
                error!(error = %e, "failed to add identity");
                self.send_failure().await
            }
        }
    }

    /// Validate a sign request against the store and the binding chain.
    ///
    /// Returns the key summary and its confirm flag; runs entirely under
    /// the store lock, so it must not block.
    fn precheck_sign(
        &self,
        km: &KeyManager,
        request: &SignRequest,
        match_info: &mut MatchInfo,
    ) -> AgentResult<(PubKeyItem, bool)> {
        let key = km.get_key(&request.key_blob).ok_or(AgentError::NotFound)?;

        if key.has_dest_constraints() {
            debug!(
                bindings = self.bindings.len(),
                "key has destination constraints, checking against session bindings"
            );
            if self.bindings.is_empty() {
                return Err(AgentError::denied("session has no bindings"));
            }

            let userauth = UserAuthRequest::parse(&request.data)?;

            if !key.permitted(
                &self.bindings,
                self.binding_failed,
                &userauth.username,
                Some(match_info),
            ) {
                return Err(AgentError::denied(
                    "key not permitted by destination constraints",
                ));
            }

            let last = &self.bindings[self.bindings.len() - 1];
            if userauth.session_id != last.session_id {
                return Err(AgentError::denied(
                    "session id does not match the last binding",
                ));
            }
            debug!("session id matches the last binding");
        } else {
            debug!("key has no destination constraints");
        }

        Ok((key.item(), key.confirm_required()))
    }

    async fn process_sign_request(&mut self, request: SignRequest) -> AgentResult<()> {
        if self.waiting_for_confirmation {
            return Err(AgentError::invalid_state(
                "sign request while a confirmation is outstanding on this session",
            ));
        }

        debug!(
            key_blob = request.key_blob.len(),
            data = request.data.len(),
            flags = request.flags,
            "processing sign request"
        );

        let mut match_info = MatchInfo::default();
        let precheck = {
            let km = lock_shared(&self.manager);
            self.precheck_sign(&km, &request, &mut match_info)
        };
        let (item, confirm_flag) = match precheck {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "refusing sign request");
                return self.send_failure().await;
            }
        };
        self.match_info = Some(match_info);

        if confirm_flag || self.conn.requires_confirmation(&item) {
            self.waiting_for_confirmation = true;
            let confirmed = self.conn.confirm_request(&item).await;
            self.waiting_for_confirmation = false;

            if !confirmed {
                warn!(fingerprint = %item.fingerprint, "sign request not confirmed by user");
                let client = self.conn.client();
                lock_shared(&self.manager).notify_key_declined(&request.key_blob, &client);
                self.match_info = None;
                return self.send_failure().await;
            }
        }

        let client = self.conn.client();
        let signature = {
            let km = lock_shared(&self.manager);
            let result = km.sign_data(&request.key_blob, &request.data, request.flags);
            if result.is_ok() {
                km.notify_key_used(&request.key_blob, &client);
            }
            result
        };
        self.match_info = None;

        match signature {
            Ok(signature) => self.send_response(&Response::SignResponse(signature)).await,
            Err(e) => {
                error!(error = %e, "failed to sign");
                self.send_failure().await
            }
        }
    }

    async fn process_request_identities(&mut self) -> AgentResult<()> {
        if self.waiting_for_key_selection {
            return Err(AgentError::invalid_state(
                "identities request while one is outstanding on this session",
            ));
        }

        let identities: Vec<Identity> = lock_shared(&self.manager)
            .list_keys(&self.bindings, self.binding_failed)
            .into_iter()
            .map(|item| Identity {
                pubkey_blob: item.blob,
                comment: item.comment,
            })
            .collect();

        self.waiting_for_key_selection = true;
        let result = self
            .send_response(&Response::IdentitiesAnswer(identities))
            .await;
        self.waiting_for_key_selection = false;
        result
    }

    async fn process_extension(&mut self, message: ExtensionMessage) -> AgentResult<()> {
        debug!(extension = %message.name, "processing extension");

        if self.conn.process_extension_message(&message).await {
            return self.send_success().await;
        }

        if message.name != extension::session_bind::NAME {
            warn!(extension = %message.name, "unsupported extension");
            return self.send_failure().await;
        }

        let payload =
            extension::decode_message_extension(&message.name, &mut Deserializer::new(&message.body));
        let bind = payload.as_ref().ok().and_then(|p| {
            p.as_any()
                .downcast_ref::<SessionBind>()
                .cloned()
        });

        match bind {
            Some(bind) => {
                debug!(
                    host_key = bind.host_key.len(),
                    session_id = bind.session_id.len(),
                    forwarded = bind.is_forwarding,
                    "session bound"
                );
                self.is_forwarded |= bind.is_forwarding;
                self.bindings.push(SessionBinding {
                    host_key: bind.host_key,
                    session_id: bind.session_id,
                    forwarded: bind.is_forwarding,
                });
                self.send_success().await
            }
            None => {
                if let Err(e) = payload {
                    error!(error = %e, "failed to process session bind");
                }
                // The chain cannot be trusted any more.
                self.binding_failed = true;
                self.bindings.clear();
                self.send_failure().await
            }
        }
    }

    async fn process_lock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        debug!("processing lock request");
        let result = lock_shared(&self.manager).lock(passphrase);
        match result {
            Ok(()) => self.send_success().await,
            Err(e) => {
                error!(error = %e, "failed to lock");
                self.send_failure().await
            }
        }
    }

    async fn process_unlock(&mut self, passphrase: &SecureBytes) -> AgentResult<()> {
        debug!("processing unlock request");
        let result = lock_shared(&self.manager).unlock(passphrase);
        match result {
            Ok(()) => self.send_success().await,
            Err(e) => {
                error!(error = %e, "failed to unlock");
                self.send_failure().await
            }
        }
    }

    async fn send_response(&mut self, response: &Response) -> AgentResult<()> {
        let frame = response.to_frame()?;
        if !self.conn.send(&frame).await {
            return Err(AgentError::Io(std::io::Error::other(
                "transport write failed",
            )));
        }
        Ok(())
    }

    async fn send_success(&mut self) -> AgentResult<()> {
        self.send_response(&Response::Success).await
    }

    async fn send_failure(&mut self) -> AgentResult<()> {
        self.send_response(&Response::Failure).await
    }
}
