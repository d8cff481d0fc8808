//! # Leg Coordinator
//!
//! Drives one leg of a call from the moment its media socket is attached
//! until the session leaves the registry.
//!
//! ## Client leg:
//! 1. Dial the operator; the TwiML points the operator's media stream at
//!    `wss://{public_host}/voice/operator/{session_id}`
//! 2. Wait for the operator to answer
//! 3. Wait for both legs to be attached
//! 4. Connect to the translation service and run the bridge
//!
//! ## Operator leg:
//! Steps 3 and 4 only.
//!
//! ## Shutdown:
//! Whatever ends the leg (its socket closing, a fatal bridge error, or the
//! session being torn down elsewhere), the coordinator runs `teardown`,
//! closes its own socket and removes the session once both legs are done.
//! `teardown` acts only for the first caller, so the paired leg's call is
//! hung up exactly once.
//!
//! While waiting for the bridge to start, leg frames are consumed: `start`
//! is recorded, audio is discarded and `stop` ends the leg.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::control::{CallControl, OutboundCall};
use super::session::{CallSession, LegRole};
use super::twiml::stream_twiml;
use crate::bridge::{AudioBridge, BridgeSettings, StopReason};
use crate::error::BridgeError;
use crate::state::AppState;
use crate::translation::settings::task_settings;
use crate::translation::{LegEvent, TranslationStream};

/// Run `role`'s side of `session` to completion.
///
/// `frames` yields the leg's raw websocket text frames and closes when the
/// socket does.
pub async fn serve_leg(
    state: Arc<AppState>,
    session: Arc<CallSession>,
    role: LegRole,
    frames: UnboundedReceiver<String>,
) {
    match run_leg(&state, &session, role, frames).await {
        Ok(reason) => info!(session_id = %session.id(), role = %role, ?reason, "leg finished"),
        Err(e) => {
            state.metrics.bridge_failed();
            warn!(session_id = %session.id(), role = %role, "leg failed: {}", e);
        }
    }

    if teardown(state.call_control.as_ref(), &session, role).await {
        state.metrics.teardown();
    }

    if let Some(sink) = session.sink(role) {
        sink.close();
    }
    if session.mark_leg_finished(role) {
        state.sessions.remove(&session.id());
    }
}

async fn run_leg(
    state: &AppState,
    session: &Arc<CallSession>,
    role: LegRole,
    mut frames: UnboundedReceiver<String>,
) -> Result<StopReason, BridgeError> {
    let timeout = state.rendezvous_timeout();

    if role == LegRole::Client {
        let placing = place_operator_call(state, session);
        hold_leg(session, role, &mut frames, placing).await?;
        hold_leg(session, role, &mut frames, session.wait_answered(role, timeout)).await?;
    }
    hold_leg(session, role, &mut frames, session.wait_rendezvous(role, timeout)).await?;

    // Connect in its own task; a stream that arrives after the leg has
    // gone is closed by `close_abandoned`
    let translator = Arc::clone(&state.translator);
    let settings = task_settings(&state.config, role);
    let mut connecting = tokio::spawn(async move { translator.connect(settings).await });
    let joined = hold_leg(session, role, &mut frames, async {
        Ok::<_, BridgeError>((&mut connecting).await)
    })
    .await;
    let translation = match joined {
        Ok(joined) => joined
            .map_err(|e| BridgeError::Translation(format!("connect task failed: {e}")))??,
        Err(e) => {
            tokio::spawn(close_abandoned(session.id(), connecting));
            return Err(e);
        }
    };

    state.metrics.bridge_started();
    let bridge = AudioBridge::new(
        Arc::clone(session),
        role,
        Arc::clone(&state.pools),
        state.transcripts.clone(),
        BridgeSettings::from_config(&state.config),
    );

    bridge.run(frames, translation).await
}

/// Dial the operator leg for `session`.
async fn place_operator_call(state: &AppState, session: &CallSession) -> Result<(), BridgeError> {
    let session_id = session.id();
    let call = OutboundCall {
        to: session.target_number().to_string(),
        from: state.config.telephony.caller_id.clone(),
        twiml: stream_twiml(&state.stream_url(&format!("/voice/operator/{session_id}"))),
        status_callback: state.webhook_url(&format!("/voice/callback/{session_id}")),
    };

    let call_id = state.call_control.place_call(call).await?;
    if session.call_id(LegRole::Operator).is_none() {
        session.set_call_id(LegRole::Operator, call_id);
    }
    Ok(())
}

/// Close a translation stream whose leg went away before it connected.
async fn close_abandoned(session_id: Uuid, connecting: JoinHandle<Result<TranslationStream, BridgeError>>) {
    if let Ok(Ok(stream)) = connecting.await {
        debug!(session_id = %session_id, "closing translation stream of a departed leg");
        stream.sink.close().await;
    }
}

/// Await `ready` while consuming the leg's frames.
async fn hold_leg<T, F>(
    session: &CallSession,
    role: LegRole,
    frames: &mut UnboundedReceiver<String>,
    ready: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    tokio::pin!(ready);
    loop {
        tokio::select! {
            biased;
            result = &mut ready => return result,
            frame = frames.recv() => {
                let closed = || BridgeError::TransportClosed(format!("{role} leg closed before the bridge started"));
                let Some(text) = frame else {
                    return Err(closed());
                };
                match LegEvent::parse(&text) {
                    Ok(LegEvent::Start { start }) => {
                        if let Some(call_sid) = start.call_sid {
                            if session.call_id(role).is_none() {
                                session.set_call_id(role, call_sid);
                            }
                        }
                        session.set_stream_id(role, start.stream_sid);
                    }
                    Ok(LegEvent::Stop) => return Err(closed()),
                    Ok(_) => {}
                    Err(e) => debug!(session_id = %session.id(), role = %role, "bad leg frame: {}", e),
                }
            }
        }
    }
}

/// Drop `session` if its client leg has not attached within the
/// rendezvous timeout.
///
/// Spawned when the incoming-call webhook registers the session. A caller
/// who hangs up before the media stream connects never reaches
/// `serve_leg`, so this is the only path that frees its registry slot.
pub async fn expire_unattached(state: Arc<AppState>, session: Arc<CallSession>) {
    tokio::time::sleep(state.rendezvous_timeout()).await;
    if session.is_attached(LegRole::Client) {
        return;
    }

    warn!(session_id = %session.id(), "client leg never attached, dropping session");
    // Hangs up the client call if it is somehow still up
    if teardown(state.call_control.as_ref(), &session, LegRole::Operator).await {
        state.metrics.teardown();
    }
    if !session.is_attached(LegRole::Operator) {
        state.sessions.remove(&session.id());
    }
}

/// Tear `session` down on behalf of `initiator`.
///
/// The first call for a session hangs up the opposite leg's call (if its
/// call id is known) and returns `true`; every later call does nothing and
/// returns `false`.
pub async fn teardown(call_control: &dyn CallControl, session: &CallSession, initiator: LegRole) -> bool {
    let Some(plan) = session.begin_teardown(initiator) else {
        return false;
    };

    match plan.terminate_call_id {
        Some(call_id) => match call_control.terminate(&call_id).await {
            Ok(()) => info!(
                session_id = %session.id(),
                role = %initiator.opposite(),
                call_id = %call_id,
                "paired call terminated"
            ),
            Err(e) => warn!(
                session_id = %session.id(),
                call_id = %call_id,
                "failed to terminate paired call: {}",
                e
            ),
        },
        None => debug!(session_id = %session.id(), "paired call id unknown, nothing to hang up"),
    }

    session.finish_teardown();
    true
}
