//! # Translation Service Client
//!
//! A bridge talks to the translation service through two halves:
//! - **TranslationSink**: sends `ServiceRequest`s and closes the session
//! - **TranslationSource**: yields raw text messages as they arrive
//!
//! `TranslationConnector::connect` produces both halves for one leg. The
//! Palabra implementation:
//! 1. creates a session over REST (`POST /session-storage/session`)
//! 2. opens the websocket at `{ws_url}?token={publisher}`
//! 3. sends `set_task` with the leg's pipeline settings
//!
//! Closing the sink sends `end_task`, closes the socket and deletes the
//! REST session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::ServiceRequest;
use crate::config::TranslationConfig;
use crate::error::BridgeError;

#[async_trait]
pub trait TranslationSink: Send + Sync {
    async fn send(&self, request: &ServiceRequest) -> Result<(), BridgeError>;

    /// End the task and release the service session. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait TranslationSource: Send {
    /// Next text message, `Some(Err(_))` on a transport failure, `None` once
    /// the socket has closed.
    async fn recv(&mut self) -> Option<Result<String, BridgeError>>;
}

pub struct TranslationStream {
    pub sink: Arc<dyn TranslationSink>,
    pub source: Box<dyn TranslationSource>,
}

#[async_trait]
pub trait TranslationConnector: Send + Sync {
    /// Open a translation session configured with `settings` (the `set_task`
    /// payload).
    async fn connect(&self, settings: Value) -> Result<TranslationStream, BridgeError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    data: SessionInfo,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
    ws_url: String,
    publisher: String,
}

/// Credentials and endpoints shared by the connector and its sinks.
#[derive(Clone)]
struct PalabraApi {
    http: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
}

impl PalabraApi {
    async fn create_session(&self) -> Result<SessionInfo, BridgeError> {
        let response = self
            .http
            .post(format!("{}/session-storage/session", self.api_base))
            .header("ClientId", &self.client_id)
            .header("ClientSecret", &self.client_secret)
            .json(&json!({
                "data": { "subscriber_count": 0, "publisher_can_subscribe": true }
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BridgeError::Translation(format!("create session: {e}")))?;

        let envelope: SessionEnvelope = response
            .json()
            .await
            .map_err(|e| BridgeError::Translation(format!("session response: {e}")))?;
        Ok(envelope.data)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), BridgeError> {
        self.http
            .delete(format!("{}/session-storage/sessions/{}", self.api_base, session_id))
            .header("ClientId", &self.client_id)
            .header("ClientSecret", &self.client_secret)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BridgeError::Translation(format!("delete session: {e}")))?;
        Ok(())
    }
}

pub struct PalabraConnector {
    api: PalabraApi,
}

impl PalabraConnector {
    pub fn new(config: &TranslationConfig) -> Self {
        Self {
            api: PalabraApi {
                http: reqwest::Client::new(),
                api_base: config.api_base.trim_end_matches('/').to_string(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
        }
    }
}

#[async_trait]
impl TranslationConnector for PalabraConnector {
    async fn connect(&self, settings: Value) -> Result<TranslationStream, BridgeError> {
        let session = self.api.create_session().await?;
        let url = format!("{}?token={}", session.ws_url, session.publisher);

        let socket = match connect_async(url.as_str()).await {
            Ok((socket, _response)) => socket,
            Err(e) => {
                if let Err(cleanup) = self.api.delete_session(&session.id).await {
                    warn!("failed to release translation session: {}", cleanup);
                }
                return Err(BridgeError::Translation(format!("websocket connect: {e}")));
            }
        };
        info!(translation_session = %session.id, "translation socket connected");

        let (writer, reader) = socket.split();
        let sink = Arc::new(PalabraSink {
            writer: Mutex::new(writer),
            api: self.api.clone(),
            session_id: session.id,
            closed: AtomicBool::new(false),
        });

        if let Err(e) = sink.send(&ServiceRequest::SetTask(settings)).await {
            sink.close().await;
            return Err(e);
        }

        Ok(TranslationStream {
            sink,
            source: Box::new(PalabraSource { reader }),
        })
    }
}

struct PalabraSink {
    writer: Mutex<SplitSink<WsStream, Message>>,
    api: PalabraApi,
    session_id: String,
    closed: AtomicBool,
}

#[async_trait]
impl TranslationSink for PalabraSink {
    async fn send(&self, request: &ServiceRequest) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportClosed("translation socket closed".to_string()));
        }
        let text = request.to_json()?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::TransportClosed(format!("translation socket: {e}")))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let end_task = ServiceRequest::EndTask { force: false };
        let mut writer = self.writer.lock().await;
        if let Ok(text) = end_task.to_json() {
            if let Err(e) = writer.send(Message::Text(text)).await {
                debug!("end_task not delivered: {}", e);
            }
        }
        if let Err(e) = writer.close().await {
            debug!("translation socket close: {}", e);
        }
        drop(writer);

        match self.api.delete_session(&self.session_id).await {
            Ok(()) => info!(translation_session = %self.session_id, "translation session released"),
            Err(e) => warn!(translation_session = %self.session_id, "{}", e),
        }
    }
}

struct PalabraSource {
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl TranslationSource for PalabraSource {
    async fn recv(&mut self) -> Option<Result<String, BridgeError>> {
        loop {
            match self.reader.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "translation socket closed by peer");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(BridgeError::TransportClosed(format!(
                        "translation socket: {e}"
                    ))))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_envelope_parses() {
        let body = r#"{"ok": true, "data": {"id": "s-1", "ws_url": "wss://streaming.example/ws", "publisher": "tok", "subscriber": []}}"#;
        let envelope: SessionEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.data.id, "s-1");
        assert_eq!(envelope.data.ws_url, "wss://streaming.example/ws");
        assert_eq!(envelope.data.publisher, "tok");
    }

    #[test]
    fn test_connector_trims_api_base() {
        let mut config = crate::config::AppConfig::default().translation;
        config.api_base = "https://api.palabra.ai/".to_string();
        let connector = PalabraConnector::new(&config);
        assert_eq!(connector.api.api_base, "https://api.palabra.ai");
    }
}
