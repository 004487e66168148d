//! Call session coordination for Huddle.
//!
//! The coordinator owns the signaling state machine per user pair and is the
//! only component allowed to forward call negotiation events. The session
//! table is the source of truth: a relay that merely forwards by destination
//! identity cannot detect duplicate call requests, signals arriving after
//! one side hung up, or sessions leaked by a mid-negotiation disconnect.
//!
//! Sessions are keyed by the unordered user pair; at most one non-terminal
//! session exists per pair. `Ended` is implicit: the row is removed and the
//! pair returns to idle. Transitions serialize per pair through the table's
//! entry locking, so concurrent request/accept/hangup races resolve
//! deterministically; whichever arrives first wins and the loser observes
//! the documented rejection.

use crate::error::CoreError;
use crate::registry::Registry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_protocol::{ServerEvent, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a call may stay ringing before it times out. Bounds the
    /// lifetime of sessions whose callee never answers.
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of a call session. `Ended` is not represented; a terminal
/// session is removed from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Request sent, awaiting accept or reject.
    Ringing,
    /// Accepted, awaiting the offer/answer exchange.
    Negotiating,
    /// First negotiation round observed.
    Active,
}

/// An in-progress call negotiation between two users.
#[derive(Debug, Clone)]
pub struct CallSession {
    id: u64,
    initiator: UserId,
    responder: UserId,
    state: CallState,
    created_at: Instant,
    last_activity: Instant,
}

impl CallSession {
    fn new(id: u64, initiator: UserId, responder: UserId) -> Self {
        let now = Instant::now();
        Self {
            id,
            initiator,
            responder,
            state: CallState::Ringing,
            created_at: now,
            last_activity: now,
        }
    }

    /// The user that requested the call.
    #[must_use]
    pub fn initiator(&self) -> UserId {
        self.initiator
    }

    /// The user that was called.
    #[must_use]
    pub fn responder(&self) -> UserId {
        self.responder
    }

    /// Current signaling state.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// When the session was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the session last saw a valid signaling event.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn involves(&self, user_id: UserId) -> bool {
        self.initiator == user_id || self.responder == user_id
    }

    fn other(&self, user_id: UserId) -> UserId {
        if self.initiator == user_id {
            self.responder
        } else {
            self.initiator
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Unordered user pair, the session table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    lo: UserId,
    hi: UserId,
}

impl PairKey {
    /// Normalize a pair so `{a, b}` and `{b, a}` map to the same key.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }
}

/// The call session coordinator.
pub struct CallCoordinator {
    registry: Arc<Registry>,
    /// Non-terminal sessions indexed by unordered pair. Shared with the
    /// ringing watchdog tasks.
    sessions: Arc<DashMap<PairKey, CallSession>>,
    config: CallConfig,
    next_session_id: AtomicU64,
}

impl CallCoordinator {
    /// Create a coordinator over the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, config: CallConfig) -> Self {
        Self {
            registry,
            sessions: Arc::new(DashMap::new()),
            config,
            next_session_id: AtomicU64::new(0),
        }
    }

    /// Number of non-terminal sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State of the session between two users, if one exists.
    #[must_use]
    pub fn session_state(&self, a: UserId, b: UserId) -> Option<CallState> {
        self.sessions.get(&PairKey::new(a, b)).map(|s| s.state)
    }

    /// Start a call from `caller` to `callee`.
    ///
    /// Creates the ringing session, forwards the request to the callee, and
    /// arms the ringing watchdog.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTarget`] for a self-call or an offline callee,
    /// [`CoreError::AlreadyInProgress`] when a non-terminal session for the
    /// pair exists; the existing session is left untouched.
    pub fn request(&self, caller: UserId, callee: UserId) -> Result<u64, CoreError> {
        if caller == callee || !self.registry.is_online(callee) {
            return Err(CoreError::InvalidTarget(callee));
        }

        let key = PairKey::new(caller, callee);
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;

        match self.sessions.entry(key) {
            Entry::Occupied(_) => return Err(CoreError::AlreadyInProgress(callee)),
            Entry::Vacant(slot) => {
                slot.insert(CallSession::new(session_id, caller, callee));
            }
        }

        self.registry
            .send_to_user(callee, &ServerEvent::CallRequest { from: caller });
        debug!(session = session_id, caller, callee, "Call ringing");

        // Ringing watchdog: a callee that never answers must not leave an
        // orphaned row behind. The id guard keeps the watchdog from firing
        // on a later session of the same pair.
        let sessions = Arc::clone(&self.sessions);
        let registry = Arc::clone(&self.registry);
        let ring_timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            expire_ringing(&sessions, &registry, key, session_id);
        });

        Ok(session_id)
    }

    /// Accept a ringing call. Only the responder may accept.
    ///
    /// # Errors
    ///
    /// [`CoreError::SessionStateViolation`] when no session exists for the
    /// pair, the session is not ringing, or the acceptor is not the
    /// responder.
    pub fn accept(&self, acceptor: UserId, caller: UserId) -> Result<(), CoreError> {
        let key = PairKey::new(acceptor, caller);
        {
            let mut session = self
                .sessions
                .get_mut(&key)
                .ok_or(CoreError::SessionStateViolation)?;
            if session.state != CallState::Ringing || session.responder != acceptor {
                return Err(CoreError::SessionStateViolation);
            }
            session.state = CallState::Negotiating;
            session.touch();
        }

        self.registry
            .send_to_user(caller, &ServerEvent::CallAccept { from: acceptor });
        debug!(acceptor, caller, "Call accepted");
        Ok(())
    }

    /// Reject a ringing call, ending the session. Only the responder may
    /// reject.
    ///
    /// # Errors
    ///
    /// [`CoreError::SessionStateViolation`] as for [`Self::accept`].
    pub fn reject(&self, rejecter: UserId, caller: UserId) -> Result<(), CoreError> {
        let key = PairKey::new(rejecter, caller);
        let removed = self
            .sessions
            .remove_if(&key, |_, s| {
                s.state == CallState::Ringing && s.responder == rejecter
            });
        if removed.is_none() {
            return Err(CoreError::SessionStateViolation);
        }

        self.registry
            .send_to_user(caller, &ServerEvent::CallReject { from: rejecter });
        debug!(rejecter, caller, "Call rejected");
        Ok(())
    }

    /// Forward an SDP offer from the session initiator.
    ///
    /// The first offer completes the first negotiation round and moves the
    /// session to `Active`.
    ///
    /// # Errors
    ///
    /// [`CoreError::SessionStateViolation`] when the session is missing,
    /// not negotiating, or the sender is not the initiator.
    pub fn offer(&self, sender: UserId, peer: UserId, sdp: String) -> Result<(), CoreError> {
        let key = PairKey::new(sender, peer);
        {
            let mut session = self
                .sessions
                .get_mut(&key)
                .ok_or(CoreError::SessionStateViolation)?;
            if session.state != CallState::Negotiating || session.initiator != sender {
                return Err(CoreError::SessionStateViolation);
            }
            session.state = CallState::Active;
            session.touch();
        }

        self.registry
            .send_to_user(peer, &ServerEvent::CallOffer { from: sender, sdp });
        debug!(sender, peer, "Offer forwarded");
        Ok(())
    }

    /// Forward an SDP answer from the session responder.
    ///
    /// # Errors
    ///
    /// [`CoreError::SessionStateViolation`] when the session is missing,
    /// still ringing, or the sender is not the responder.
    pub fn answer(&self, sender: UserId, peer: UserId, sdp: String) -> Result<(), CoreError> {
        let key = PairKey::new(sender, peer);
        {
            let mut session = self
                .sessions
                .get_mut(&key)
                .ok_or(CoreError::SessionStateViolation)?;
            if session.state == CallState::Ringing || session.responder != sender {
                return Err(CoreError::SessionStateViolation);
            }
            session.touch();
        }

        self.registry
            .send_to_user(peer, &ServerEvent::CallAnswer { from: sender, sdp });
        debug!(sender, peer, "Answer forwarded");
        Ok(())
    }

    /// Forward an ICE candidate to the other party.
    ///
    /// # Errors
    ///
    /// [`CoreError::StaleSignal`] when no session exists for the pair; late
    /// candidates after a hangup are routine and the caller should drop
    /// them silently. [`CoreError::SessionStateViolation`] for a session
    /// that has not been accepted yet.
    pub fn candidate(
        &self,
        sender: UserId,
        peer: UserId,
        candidate: serde_json::Value,
    ) -> Result<(), CoreError> {
        let key = PairKey::new(sender, peer);
        {
            let mut session = self.sessions.get_mut(&key).ok_or(CoreError::StaleSignal)?;
            if session.state == CallState::Ringing {
                return Err(CoreError::SessionStateViolation);
            }
            session.touch();
        }

        self.registry.send_to_user(
            peer,
            &ServerEvent::CallIceCandidate {
                from: sender,
                candidate,
            },
        );
        Ok(())
    }

    /// Hang up the call between `sender` and `peer`, ending the session in
    /// any non-terminal state.
    ///
    /// # Errors
    ///
    /// [`CoreError::StaleSignal`] when no session exists (double hangup);
    /// dropped silently by callers.
    pub fn end(&self, sender: UserId, peer: UserId) -> Result<(), CoreError> {
        let key = PairKey::new(sender, peer);
        if self.sessions.remove(&key).is_none() {
            return Err(CoreError::StaleSignal);
        }

        self.registry
            .send_to_user(peer, &ServerEvent::CallEnd { from: sender });
        debug!(sender, peer, "Call ended");
        Ok(())
    }

    /// Force-end every session a disconnecting user participates in, as if
    /// an end event arrived from them. The remaining party of each session
    /// is notified. Returns the number of sessions ended.
    pub fn handle_disconnect(&self, user_id: UserId) -> usize {
        let affected: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.involves(user_id))
            .map(|entry| *entry.key())
            .collect();

        let mut ended = 0;
        for key in affected {
            if let Some((_, session)) = self.sessions.remove(&key) {
                let peer = session.other(user_id);
                self.registry
                    .send_to_user(peer, &ServerEvent::CallEnd { from: user_id });
                warn!(
                    user = user_id,
                    peer,
                    state = ?session.state,
                    "Session force-ended by disconnect"
                );
                ended += 1;
            }
        }
        ended
    }
}

/// Expire a session that is still ringing, notifying the initiator.
/// The id guard makes this a no-op for answered, ended, or replaced
/// sessions.
fn expire_ringing(
    sessions: &DashMap<PairKey, CallSession>,
    registry: &Registry,
    key: PairKey,
    session_id: u64,
) {
    let Some((_, session)) = sessions.remove_if(&key, |_, s| {
        s.id == session_id && s.state == CallState::Ringing
    }) else {
        return;
    };

    registry.send_to_user(
        session.initiator,
        &ServerEvent::CallTimeout {
            peer_id: session.responder,
        },
    );
    debug!(
        caller = session.initiator,
        callee = session.responder,
        "Ringing call timed out"
    );
}
