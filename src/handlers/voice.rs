//! # Telephony Webhooks
//!
//! ## Endpoints:
//! - `POST /twiml/client`: a client calls in. Creates the session and
//!   answers with TwiML that streams the call's audio to
//!   `wss://{public_host}/voice/client/{session_id}`
//! - `POST /voice/callback/{session_id}`: status events of the outbound
//!   operator call. `in-progress` means the operator answered; a terminal
//!   status is a disconnect of that leg
//!
//! Both receive `application/x-www-form-urlencoded` bodies with the
//! provider's PascalCase field names.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::call::coordinator::{expire_unattached, teardown};
use crate::call::session::LegRole;
use crate::call::twiml::stream_twiml;
use crate::error::{AppError, SessionError};
use crate::state::AppState;

const TERMINAL_STATUSES: [&str; 5] = ["completed", "busy", "failed", "no-answer", "canceled"];

#[derive(Debug, Deserialize)]
pub struct IncomingCall {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct CallStatusUpdate {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
}

fn twiml_response(body: String) -> HttpResponse {
    HttpResponse::Ok().content_type("application/xml").body(body)
}

/// Incoming-call webhook for the client leg.
pub async fn incoming_call(
    state: web::Data<AppState>,
    form: web::Form<IncomingCall>,
) -> Result<HttpResponse, AppError> {
    let call = form.into_inner();
    state.metrics.call_received();

    let operator_number = &state.config.telephony.operator_number;
    let session = state
        .sessions
        .create(&call.from, operator_number)
        .map_err(|e| {
            state.metrics.call_rejected();
            warn!(call_id = %call.call_sid, "rejecting incoming call: {}", e);
            AppError::from(e)
        })?;
    session.set_call_id(LegRole::Client, call.call_sid.clone());
    tokio::spawn(expire_unattached(state.clone().into_inner(), session.clone()));

    info!(
        session_id = %session.id(),
        call_id = %call.call_sid,
        from = %call.from,
        to = %call.to,
        "incoming call"
    );

    let stream_url = state.stream_url(&format!("/voice/client/{}", session.id()));
    Ok(twiml_response(stream_twiml(&stream_url)))
}

/// Status webhook for the outbound operator call.
pub async fn status_callback(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Form<CallStatusUpdate>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let update = form.into_inner();

    let session = match state.sessions.find(&session_id) {
        Ok(session) => session,
        Err(SessionError::NotFound(_)) => {
            debug!(session_id = %session_id, status = %update.call_status, "status for a finished session");
            return Ok(HttpResponse::Ok().finish());
        }
        Err(e) => return Err(e.into()),
    };

    let status = update.call_status.as_str();
    if status == "in-progress" {
        session.mark_answered(Some(update.call_sid));
    } else if TERMINAL_STATUSES.contains(&status) {
        let role = session
            .role_for_call(&update.call_sid)
            .unwrap_or(LegRole::Operator);
        info!(session_id = %session.id(), role = %role, status, "leg disconnected");

        if teardown(state.call_control.as_ref(), &session, role).await {
            state.metrics.teardown();
        }
        // No coordinator will ever remove a session nobody attached to
        if !session.is_attached(LegRole::Client) && !session.is_attached(LegRole::Operator) {
            state.sessions.remove(&session.id());
        }
    } else {
        debug!(session_id = %session.id(), status, "call status");
    }

    Ok(HttpResponse::Ok().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::control::{CallControl, OutboundCall};
    use crate::config::AppConfig;
    use crate::error::CallControlError;
    use crate::translation::PalabraConnector;
    use actix_web::{http::StatusCode, test, App};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeCallControl {
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CallControl for FakeCallControl {
        async fn place_call(&self, _call: OutboundCall) -> Result<String, CallControlError> {
            Ok("CA-op".to_string())
        }

        async fn terminate(&self, call_id: &str) -> Result<(), CallControlError> {
            self.terminated.lock().push(call_id.to_string());
            Ok(())
        }
    }

    fn app_state(max_sessions: usize, control: Arc<FakeCallControl>) -> web::Data<AppState> {
        app_state_with_timeout(max_sessions, 120, control)
    }

    fn app_state_with_timeout(
        max_sessions: usize,
        rendezvous_timeout_secs: u64,
        control: Arc<FakeCallControl>,
    ) -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.pool.workers = 1;
        config.session.max_concurrent_sessions = max_sessions;
        config.session.rendezvous_timeout_secs = rendezvous_timeout_secs;
        config.server.public_host = "bridge.example".to_string();
        config.telephony.operator_number = "+1666".to_string();
        let translator = Arc::new(PalabraConnector::new(&config.translation));
        web::Data::new(AppState::with_services(config, control, translator).unwrap())
    }

    #[actix_web::test]
    async fn test_incoming_call_answers_with_stream() {
        let state = app_state(1, Arc::new(FakeCallControl::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/twiml/client", web::post().to(incoming_call)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/twiml/client")
            .set_form([("CallSid", "CA-client"), ("From", "+1555"), ("To", "+1000")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();

        let session = state.sessions.sessions().pop().unwrap();
        assert_eq!(session.source_number(), "+1555");
        assert_eq!(session.target_number(), "+1666");
        assert_eq!(session.call_id(LegRole::Client).as_deref(), Some("CA-client"));
        assert!(body.contains(&format!("wss://bridge.example/voice/client/{}", session.id())));

        // Registry is full now
        let req = test::TestRequest::post()
            .uri("/twiml/client")
            .set_form([("CallSid", "CA-2"), ("From", "+1777"), ("To", "+1000")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.metrics.snapshot().calls_rejected, 1);
    }

    #[actix_web::test]
    async fn test_session_without_client_stream_expires() {
        let control = Arc::new(FakeCallControl::default());
        let state = app_state_with_timeout(1, 1, control.clone());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/twiml/client", web::post().to(incoming_call)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/twiml/client")
            .set_form([("CallSid", "CA-client"), ("From", "+1555"), ("To", "+1000")])
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(state.sessions.active_count(), 1);

        // The media stream never connects
        for _ in 0..60 {
            if state.sessions.active_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(state.sessions.active_count(), 0);
        assert_eq!(*control.terminated.lock(), vec!["CA-client".to_string()]);

        // The slot is free for the next caller
        let req = test::TestRequest::post()
            .uri("/twiml/client")
            .set_form([("CallSid", "CA-2"), ("From", "+1777"), ("To", "+1000")])
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_status_callback_answer_and_hangup() {
        let control = Arc::new(FakeCallControl::default());
        let state = app_state(4, control.clone());
        let session = state.sessions.create("+1555", "+1666").unwrap();
        session.set_call_id(LegRole::Client, "CA-client".to_string());

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/voice/callback/{session_id}", web::post().to(status_callback)),
        )
        .await;
        let uri = format!("/voice/callback/{}", session.id());

        let answered = test::TestRequest::post()
            .uri(&uri)
            .set_form([("CallSid", "CA-op"), ("CallStatus", "in-progress")])
            .to_request();
        assert_eq!(test::call_service(&app, answered).await.status(), StatusCode::OK);
        assert!(session.is_answered());
        assert_eq!(session.call_id(LegRole::Operator).as_deref(), Some("CA-op"));

        for _ in 0..2 {
            let hangup = test::TestRequest::post()
                .uri(&uri)
                .set_form([("CallSid", "CA-op"), ("CallStatus", "completed")])
                .to_request();
            assert_eq!(test::call_service(&app, hangup).await.status(), StatusCode::OK);
        }

        assert!(session.is_completed());
        // The operator hung up, so the client call is the one terminated, once
        assert_eq!(*control.terminated.lock(), vec!["CA-client".to_string()]);
        assert_eq!(state.sessions.active_count(), 0);
    }
}
