//! # Call Session
//!
//! Shared state for one bridged call: two legs (client and operator), the
//! rendezvous that gates streaming, and the completion flag that makes
//! teardown idempotent.
//!
//! ## State Machine:
//! ```text
//! Pending ──(second leg attaches)──► Rendezvoused ──(both bridges run)──► Active
//!    │                                    │                                  │
//!    └────────────(disconnect / terminate from either leg)──────────────────┘
//!                                         ▼
//!                                    Completing ──► Completed
//! ```
//!
//! ## Signals:
//! Every "wait until X" in this module is a `tokio::sync::watch` channel, so
//! late subscribers see the current value immediately and nothing is missed
//! between a check and a wait:
//! - **rendezvous**: flips once when the second leg attaches
//! - **answered**: flips once when the operator picks up
//! - **stream id** (per leg): set when the leg's media stream starts
//! - **completed**: flips once on the first disconnect notification
//!
//! ## Locking:
//! Only this call's own tasks and its webhook handlers touch a session.
//! The state mutex is always taken before a leg's sink mutex.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BridgeError, SessionError};

/// Which side of the bridged call a leg is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegRole {
    /// The caller who dialled in
    Client,
    /// The party the bridge dials out to
    Operator,
}

impl LegRole {
    pub fn opposite(self) -> Self {
        match self {
            LegRole::Client => LegRole::Operator,
            LegRole::Operator => LegRole::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LegRole::Client => "client",
            LegRole::Operator => "operator",
        }
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LegRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(LegRole::Client),
            "operator" => Ok(LegRole::Operator),
            other => Err(format!("unknown leg role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Rendezvoused,
    Active,
    Completing,
    Completed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Rendezvoused => "rendezvoused",
            SessionState::Active => "active",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
        }
    }

    fn is_closing(self) -> bool {
        matches!(self, SessionState::Completing | SessionState::Completed)
    }
}

/// Outbound side of a leg transport.
///
/// The network layer owns the socket; the session only keeps this handle to
/// write media to it. Writes never block: an implementation queues the frame
/// or reports the transport as closed.
pub trait LegSink: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), BridgeError>;

    /// Ask the transport to close. Closing twice is harmless.
    fn close(&self) {}
}

struct LegRecord {
    sink: Mutex<Option<Arc<dyn LegSink>>>,
    stream_id: watch::Sender<Option<String>>,
    call_id: Mutex<Option<String>>,
    bridge_started: AtomicBool,
    finished: AtomicBool,
}

impl LegRecord {
    fn new() -> Self {
        let (stream_id, _) = watch::channel(None);
        Self {
            sink: Mutex::new(None),
            stream_id,
            call_id: Mutex::new(None),
            bridge_started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    fn is_attached(&self) -> bool {
        self.sink.lock().is_some()
    }
}

/// What the first disconnect notification must do.
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownPlan {
    pub initiator: LegRole,
    /// Call id of the opposite leg, if it is known, to be terminated
    pub terminate_call_id: Option<String>,
}

/// One bridged call.
pub struct CallSession {
    id: Uuid,
    source_number: String,
    target_number: String,
    created_at: DateTime<Utc>,
    client: LegRecord,
    operator: LegRecord,
    state: Mutex<SessionState>,
    rendezvous: watch::Sender<bool>,
    answered: watch::Sender<bool>,
    completed: watch::Sender<bool>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Serializable view of a session for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub state: SessionState,
    pub source_number: String,
    pub target_number: String,
    pub created_at: DateTime<Utc>,
    pub client_attached: bool,
    pub operator_attached: bool,
}

impl CallSession {
    pub fn new(source_number: impl Into<String>, target_number: impl Into<String>) -> Self {
        let (rendezvous, _) = watch::channel(false);
        let (answered, _) = watch::channel(false);
        let (completed, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            source_number: source_number.into(),
            target_number: target_number.into(),
            created_at: Utc::now(),
            client: LegRecord::new(),
            operator: LegRecord::new(),
            state: Mutex::new(SessionState::Pending),
            rendezvous,
            answered,
            completed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_number(&self) -> &str {
        &self.source_number
    }

    pub fn target_number(&self) -> &str {
        &self.target_number
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn leg(&self, role: LegRole) -> &LegRecord {
        match role {
            LegRole::Client => &self.client,
            LegRole::Operator => &self.operator,
        }
    }

    /// Bind a leg's transport to the session.
    ///
    /// The second successful attach moves the session to `Rendezvoused` and
    /// releases everyone waiting in `wait_rendezvous`.
    ///
    /// ## Errors:
    /// - `LegAlreadyAttached` when the role already has a transport
    /// - `SessionClosed` once teardown has started
    pub fn attach_leg(&self, role: LegRole, sink: Arc<dyn LegSink>) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.is_closing() {
            return Err(SessionError::SessionClosed(self.id.to_string()));
        }

        {
            let mut slot = self.leg(role).sink.lock();
            if slot.is_some() {
                return Err(SessionError::LegAlreadyAttached(role));
            }
            *slot = Some(sink);
        }
        debug!(session_id = %self.id, role = %role, "leg attached");

        if self.leg(role.opposite()).is_attached() {
            *state = SessionState::Rendezvoused;
            self.rendezvous.send_replace(true);
            info!(session_id = %self.id, "both legs attached, rendezvous reached");
        }
        Ok(())
    }

    pub fn is_attached(&self, role: LegRole) -> bool {
        self.leg(role).is_attached()
    }

    pub fn sink(&self, role: LegRole) -> Option<Arc<dyn LegSink>> {
        self.leg(role).sink.lock().clone()
    }

    /// Wait until both legs are attached.
    pub async fn wait_rendezvous(&self, role: LegRole, timeout: Duration) -> Result<(), BridgeError> {
        let rendezvous = self.rendezvous.subscribe();
        self.wait_signal(rendezvous, role, timeout).await
    }

    /// Record that the operator answered the outbound call.
    pub fn mark_answered(&self, call_id: Option<String>) {
        if let Some(call_id) = call_id {
            self.set_call_id(LegRole::Operator, call_id);
        }
        if !self.answered.send_replace(true) {
            info!(session_id = %self.id, "operator answered");
        }
    }

    pub fn is_answered(&self) -> bool {
        *self.answered.borrow()
    }

    /// Wait until the operator answers.
    pub async fn wait_answered(&self, role: LegRole, timeout: Duration) -> Result<(), BridgeError> {
        let answered = self.answered.subscribe();
        self.wait_signal(answered, role, timeout).await
    }

    async fn wait_signal(
        &self,
        mut signal: watch::Receiver<bool>,
        role: LegRole,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        let mut completed = self.completed.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                _ = wait_flag(&mut signal) => Ok(()),
                _ = wait_flag(&mut completed) => {
                    Err(BridgeError::Session(SessionError::SessionClosed(self.id.to_string())))
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(BridgeError::RendezvousTimeout {
                role,
                waited_secs: timeout.as_secs(),
            }),
        }
    }

    /// Record the provider stream id a leg's media stream announced.
    pub fn set_stream_id(&self, role: LegRole, stream_id: String) {
        debug!(session_id = %self.id, role = %role, stream_id = %stream_id, "stream started");
        self.leg(role).stream_id.send_replace(Some(stream_id));
    }

    pub fn stream_id(&self, role: LegRole) -> Option<String> {
        self.leg(role).stream_id.borrow().clone()
    }

    /// Wait for `role`'s stream id.
    ///
    /// Returns at once if it is already known; otherwise waits at most
    /// `timeout`. Never arriving is `RendezvousTimeout`, never a silent drop.
    pub async fn wait_stream_id(&self, role: LegRole, timeout: Duration) -> Result<String, BridgeError> {
        let mut stream_id = self.leg(role).stream_id.subscribe();
        let mut completed = self.completed.subscribe();

        let wait = async {
            loop {
                let current = stream_id.borrow_and_update().clone();
                if let Some(id) = current {
                    return Some(id);
                }
                if stream_id.changed().await.is_err() {
                    return None;
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                id = wait => id,
                _ = wait_flag(&mut completed) => None,
            }
        })
        .await;

        match outcome {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(BridgeError::Session(SessionError::SessionClosed(
                self.id.to_string(),
            ))),
            Err(_) => Err(BridgeError::RendezvousTimeout {
                role,
                waited_secs: timeout.as_secs(),
            }),
        }
    }

    pub fn set_call_id(&self, role: LegRole, call_id: String) {
        *self.leg(role).call_id.lock() = Some(call_id);
    }

    pub fn call_id(&self, role: LegRole) -> Option<String> {
        self.leg(role).call_id.lock().clone()
    }

    /// Which leg, if any, a provider call id belongs to.
    pub fn role_for_call(&self, call_id: &str) -> Option<LegRole> {
        [LegRole::Client, LegRole::Operator]
            .into_iter()
            .find(|role| self.call_id(*role).as_deref() == Some(call_id))
    }

    /// Note that a leg's relay loop is running. Once both are, the session
    /// is `Active`.
    pub fn mark_bridge_started(&self, role: LegRole) {
        let mut state = self.state.lock();
        self.leg(role).bridge_started.store(true, Ordering::SeqCst);

        let both = self.client.bridge_started.load(Ordering::SeqCst)
            && self.operator.bridge_started.load(Ordering::SeqCst);
        if both && *state == SessionState::Rendezvoused {
            *state = SessionState::Active;
            info!(session_id = %self.id, "both bridges active");
        }
    }

    /// Handle a disconnect notification from `initiator`.
    ///
    /// Only the first call returns a plan; later notifications for the same
    /// session get `None` and must do nothing.
    pub fn begin_teardown(&self, initiator: LegRole) -> Option<TeardownPlan> {
        let mut state = self.state.lock();
        if state.is_closing() {
            debug!(session_id = %self.id, role = %initiator, "duplicate disconnect ignored");
            return None;
        }

        *state = SessionState::Completing;
        self.completed.send_replace(true);
        info!(session_id = %self.id, initiator = %initiator, "teardown started");

        Some(TeardownPlan {
            initiator,
            terminate_call_id: self.call_id(initiator.opposite()),
        })
    }

    /// Mark teardown finished once the opposite leg has been told to hang up.
    pub fn finish_teardown(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Completing {
            *state = SessionState::Completed;
            debug!(session_id = %self.id, "teardown completed");
        }
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// Resolves once teardown has begun.
    pub async fn wait_completed(&self) {
        let mut completed = self.completed.subscribe();
        wait_flag(&mut completed).await;
    }

    /// Record that a leg's coordinator is done with the session.
    ///
    /// Returns `true` when the session can leave the registry: teardown has
    /// begun and every attached leg has finished.
    pub fn mark_leg_finished(&self, role: LegRole) -> bool {
        let state = self.state.lock();
        self.leg(role).finished.store(true, Ordering::SeqCst);

        let settled = |leg: &LegRecord| leg.finished.load(Ordering::SeqCst) || !leg.is_attached();
        state.is_closing() && settled(&self.client) && settled(&self.operator)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            state: self.state(),
            source_number: self.source_number.clone(),
            target_number: self.target_number.clone(),
            created_at: self.created_at,
            client_attached: self.client.is_attached(),
            operator_attached: self.operator.is_attached(),
        }
    }
}

/// Resolve once a boolean watch flag is `true`. Returns early if the sender
/// is gone, since the flag can then never change.
async fn wait_flag(flag: &mut watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}
