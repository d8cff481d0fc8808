//! # Audio Bridge
//!
//! The relay loop bound to one leg of a call. It runs two directions at once
//! and stops both as soon as either ends:
//!
//! ## Inbound (leg → translation service):
//! 1. Parse each media-stream event from the leg
//! 2. `start`: record the leg's stream id on the session
//! 3. `media`: base64-decode the mu-law payload into the frame buffer
//! 4. Every full chunk goes through the `mulaw -> pcm` pool and out to the
//!    translation socket as `input_audio_data`
//! 5. When the leg's stream ends, the partial remainder is flushed the same way
//!
//! ## Outbound (translation service → opposite leg):
//! 1. Receive with a timeout; a timeout just retries
//! 2. `output_audio_data`: split into 20 ms blocks, convert them with one
//!    `submit_batch` (order preserved), then send each block as a `media`
//!    event addressed to the *opposite* leg's stream id
//! 3. `*transcription*`: feed the transcript tracker and broadcast
//!
//! ## Optional mixing:
//! With `mix_original` on, inbound PCM is also queued in blocks and each
//! translated block is mixed with the next queued original block before
//! re-encoding, so the listener hears the speaker faintly under the
//! translation.

pub mod transcript;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{FrameBuffer, MixRequest};
use crate::call::session::{CallSession, LegRole};
use crate::config::AppConfig;
use crate::error::{BridgeError, PoolError};
use crate::pool::TransformPools;
use crate::transcript::TranscriptSink;
use crate::translation::messages::media_message;
use crate::translation::{LegEvent, ServiceEvent, ServiceRequest, TranslationSink, TranslationSource, TranslationStream};
use transcript::TranscriptTracker;

/// Tunables a bridge needs, derived from `AppConfig`.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Inbound mu-law chunk size in bytes
    pub chunk_bytes: usize,
    /// Outbound PCM block size in bytes
    pub block_bytes: usize,
    pub batch_size: usize,
    pub receive_timeout: Duration,
    pub stream_id_timeout: Duration,
    pub mix_original: bool,
    pub original_gain: f32,
    pub translated_gain: f32,
    /// Original-audio blocks kept for mixing, about one second
    pub backlog_blocks: usize,
}

impl BridgeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_bytes: config.chunk_bytes(),
            block_bytes: config.block_bytes(),
            batch_size: config.pool.batch_size,
            receive_timeout: Duration::from_secs(config.translation.receive_timeout_secs),
            stream_id_timeout: Duration::from_secs(config.session.stream_id_timeout_secs),
            mix_original: config.audio.mix_original,
            original_gain: config.audio.original_gain,
            translated_gain: config.audio.translated_gain,
            backlog_blocks: (1000 / config.audio.block_duration_ms.max(1)).max(1) as usize,
        }
    }
}

/// Why a bridge stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The leg's media stream closed or sent `stop`
    LegClosed,
    /// The translation socket closed
    TranslationClosed,
    /// Teardown was requested for the session
    SessionCompleted,
}

type OriginalBacklog = Mutex<VecDeque<Vec<u8>>>;

pub struct AudioBridge {
    session: Arc<CallSession>,
    role: LegRole,
    pools: Arc<TransformPools>,
    transcripts: Arc<dyn TranscriptSink>,
    settings: BridgeSettings,
}

impl AudioBridge {
    pub fn new(
        session: Arc<CallSession>,
        role: LegRole,
        pools: Arc<TransformPools>,
        transcripts: Arc<dyn TranscriptSink>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            session,
            role,
            pools,
            transcripts,
            settings,
        }
    }

    /// Relay until the leg, the translation socket or the session ends.
    ///
    /// `frames` carries the leg's raw text frames; the channel closing means
    /// the leg's socket closed. The translation sink is closed before
    /// returning, whatever the outcome.
    pub async fn run(
        &self,
        mut frames: tokio::sync::mpsc::UnboundedReceiver<String>,
        translation: TranslationStream,
    ) -> Result<StopReason, BridgeError> {
        let TranslationStream { sink, mut source } = translation;
        let backlog: OriginalBacklog = Mutex::new(VecDeque::new());

        self.session.mark_bridge_started(self.role);
        info!(session_id = %self.session.id(), role = %self.role, "bridge started");

        let outcome = tokio::select! {
            result = self.pump_inbound(&mut frames, sink.as_ref(), &backlog) => result,
            result = self.pump_outbound(source.as_mut(), &backlog) => result,
            _ = self.session.wait_completed() => Ok(StopReason::SessionCompleted),
        };

        sink.close().await;

        match &outcome {
            Ok(reason) => {
                info!(session_id = %self.session.id(), role = %self.role, ?reason, "bridge stopped")
            }
            Err(e) => {
                warn!(session_id = %self.session.id(), role = %self.role, "bridge failed: {}", e)
            }
        }
        outcome
    }

    async fn pump_inbound(
        &self,
        frames: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
        sink: &dyn TranslationSink,
        backlog: &OriginalBacklog,
    ) -> Result<StopReason, BridgeError> {
        let mut buffer = FrameBuffer::new(self.settings.chunk_bytes);

        let result = loop {
            let Some(text) = frames.recv().await else {
                break Ok(StopReason::LegClosed);
            };

            let event = match LegEvent::parse(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(session_id = %self.session.id(), role = %self.role, "bad leg frame: {}", e);
                    continue;
                }
            };

            match event {
                LegEvent::Start { start } => {
                    if let Some(call_sid) = start.call_sid {
                        if self.session.call_id(self.role).is_none() {
                            self.session.set_call_id(self.role, call_sid);
                        }
                    }
                    self.session.set_stream_id(self.role, start.stream_sid);
                }
                LegEvent::Media { media } => {
                    let audio = match media.decode() {
                        Ok(audio) => audio,
                        Err(e) => {
                            warn!(session_id = %self.session.id(), role = %self.role, "{}", e);
                            continue;
                        }
                    };
                    buffer.push(&audio);

                    let mut failed = None;
                    while let Some(chunk) = buffer.next_chunk() {
                        if let Err(e) = self.forward_chunk(chunk, sink, backlog).await {
                            failed = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = failed {
                        break Err(e);
                    }
                }
                LegEvent::Stop => break Ok(StopReason::LegClosed),
                LegEvent::Connected | LegEvent::Mark | LegEvent::Unknown => {}
            }
        };

        debug!(
            session_id = %self.session.id(),
            role = %self.role,
            bytes = buffer.total_pushed(),
            "leg audio received"
        );
        if result.is_ok() {
            if let Some(remainder) = buffer.take_remainder() {
                debug!(
                    session_id = %self.session.id(),
                    role = %self.role,
                    bytes = remainder.len(),
                    "flushing partial chunk"
                );
                if let Err(e) = self.forward_chunk(remainder, sink, backlog).await {
                    warn!(session_id = %self.session.id(), role = %self.role, "flush failed: {}", e);
                }
            }
        }
        result
    }

    /// Convert one mu-law chunk and send it to the translation service.
    async fn forward_chunk(
        &self,
        chunk: Vec<u8>,
        sink: &dyn TranslationSink,
        backlog: &OriginalBacklog,
    ) -> Result<(), BridgeError> {
        let pcm = match self.pools.mulaw_to_pcm.submit(chunk).await {
            Ok(pcm) => pcm,
            Err(PoolError::Transform(e)) => {
                warn!(session_id = %self.session.id(), role = %self.role, "dropping chunk: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if self.settings.mix_original {
            let mut queue = backlog.lock();
            for block in pcm.chunks(self.settings.block_bytes) {
                if queue.len() >= self.settings.backlog_blocks {
                    queue.pop_front();
                }
                queue.push_back(block.to_vec());
            }
        }

        sink.send(&ServiceRequest::audio(&pcm)).await
    }

    async fn pump_outbound(
        &self,
        source: &mut dyn TranslationSource,
        backlog: &OriginalBacklog,
    ) -> Result<StopReason, BridgeError> {
        let mut tracker = TranscriptTracker::new(self.role);

        loop {
            let text = match tokio::time::timeout(self.settings.receive_timeout, source.recv()).await {
                Err(_) => {
                    debug!(session_id = %self.session.id(), role = %self.role, "translation receive timeout");
                    continue;
                }
                Ok(None) => return Ok(StopReason::TranslationClosed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(text))) => text,
            };

            let event = match ServiceEvent::parse(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(session_id = %self.session.id(), role = %self.role, "bad service message: {}", e);
                    continue;
                }
            };

            match event {
                ServiceEvent::TaskConfirmed => {
                    info!(session_id = %self.session.id(), role = %self.role, "translation task confirmed")
                }
                ServiceEvent::OutputAudio(pcm) => self.relay_translated(pcm, backlog).await?,
                ServiceEvent::Transcription(update) => {
                    if let Some(event) = tracker.on_update(update) {
                        self.transcripts.broadcast(event);
                    }
                }
                ServiceEvent::Error(detail) => {
                    warn!(session_id = %self.session.id(), role = %self.role, "translation service error: {}", detail)
                }
                ServiceEvent::Other(kind) => {
                    debug!(session_id = %self.session.id(), role = %self.role, message_type = %kind, "ignored")
                }
            }
        }
    }

    /// Convert translated PCM and deliver it to the opposite leg.
    async fn relay_translated(&self, pcm: Vec<u8>, backlog: &OriginalBacklog) -> Result<(), BridgeError> {
        if pcm.is_empty() {
            return Ok(());
        }

        let blocks: Vec<Vec<u8>> = pcm
            .chunks(self.settings.block_bytes.max(2))
            .map(|block| block.to_vec())
            .collect();

        let encoded = if self.settings.mix_original {
            let requests: Vec<MixRequest> = {
                let mut queue = backlog.lock();
                blocks
                    .into_iter()
                    .map(|block| MixRequest {
                        primary: block,
                        secondary: queue.pop_front(),
                        primary_gain: self.settings.translated_gain,
                        secondary_gain: self.settings.original_gain,
                    })
                    .collect()
            };
            self.pools
                .mixer
                .submit_batch(requests, self.settings.batch_size)
                .await?
        } else {
            self.pools
                .pcm_to_mulaw
                .submit_batch(blocks, self.settings.batch_size)
                .await?
        };

        let target = self.role.opposite();
        let stream_sid = self
            .session
            .wait_stream_id(target, self.settings.stream_id_timeout)
            .await?;
        let leg = self.session.sink(target).ok_or_else(|| {
            BridgeError::TransportClosed(format!("{target} leg is not attached"))
        })?;

        for (index, block) in encoded.into_iter().enumerate() {
            if self.session.is_completed() {
                break;
            }
            match block {
                Ok(mulaw) => leg.send_text(media_message(&stream_sid, &mulaw)?)?,
                Err(PoolError::Transform(e)) => {
                    warn!(session_id = %self.session.id(), role = %self.role, block = index, "skipping block: {}", e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::LegSink;
    use crate::transcript::{TranscriptAction, TranscriptEvent};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingLeg {
        sent: Mutex<Vec<String>>,
    }

    impl LegSink for RecordingLeg {
        fn send_text(&self, text: String) -> Result<(), BridgeError> {
            self.sent.lock().push(text);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTranslation {
        sent: Mutex<Vec<ServiceRequest>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl TranslationSink for RecordingTranslation {
        async fn send(&self, request: &ServiceRequest) -> Result<(), BridgeError> {
            self.sent.lock().push(request.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ChannelSource(mpsc::UnboundedReceiver<String>);

    #[async_trait]
    impl TranslationSource for ChannelSource {
        async fn recv(&mut self) -> Option<Result<String, BridgeError>> {
            self.0.recv().await.map(Ok)
        }
    }

    #[derive(Default)]
    struct RecordingTranscripts {
        events: Mutex<Vec<TranscriptEvent>>,
    }

    impl TranscriptSink for RecordingTranscripts {
        fn broadcast(&self, event: TranscriptEvent) {
            self.events.lock().push(event);
        }
    }

    struct Harness {
        session: Arc<CallSession>,
        pools: Arc<TransformPools>,
        client_leg: Arc<RecordingLeg>,
        operator_leg: Arc<RecordingLeg>,
        translation: Arc<RecordingTranslation>,
        transcripts: Arc<RecordingTranscripts>,
        config: AppConfig,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = AppConfig::default();
            config.pool.workers = 1;
            config.session.stream_id_timeout_secs = 1;

            let session = Arc::new(CallSession::new("+1555", "+1666"));
            let client_leg = Arc::new(RecordingLeg::default());
            let operator_leg = Arc::new(RecordingLeg::default());
            session.attach_leg(LegRole::Client, client_leg.clone()).unwrap();
            session.attach_leg(LegRole::Operator, operator_leg.clone()).unwrap();

            Self {
                session,
                pools: Arc::new(TransformPools::new(&config.audio, &config.pool).unwrap()),
                client_leg,
                operator_leg,
                translation: Arc::new(RecordingTranslation::default()),
                transcripts: Arc::new(RecordingTranscripts::default()),
                config,
            }
        }

        fn bridge(&self, role: LegRole) -> AudioBridge {
            AudioBridge::new(
                Arc::clone(&self.session),
                role,
                Arc::clone(&self.pools),
                self.transcripts.clone(),
                BridgeSettings::from_config(&self.config),
            )
        }

        fn stream(&self, source: mpsc::UnboundedReceiver<String>) -> TranslationStream {
            TranslationStream {
                sink: self.translation.clone(),
                source: Box::new(ChannelSource(source)),
            }
        }
    }

    fn media_frame(bytes: &[u8]) -> String {
        json!({"event": "media", "media": {"track": "inbound", "payload": BASE64.encode(bytes)}}).to_string()
    }

    fn start_frame(stream_sid: &str) -> String {
        json!({"event": "start", "start": {"streamSid": stream_sid, "callSid": "CA-leg"}}).to_string()
    }

    fn decoded_audio(request: &ServiceRequest) -> Vec<u8> {
        match request {
            ServiceRequest::InputAudioData { data } => BASE64.decode(data).unwrap(),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_one_chunk_of_frames_is_one_submit_and_one_message() {
        let harness = Harness::new();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (_service_tx, service_rx) = mpsc::unbounded_channel();

        frames_tx.send(start_frame("MZ-client")).unwrap();
        for _ in 0..10 {
            frames_tx.send(media_frame(&[0xFF; 256])).unwrap();
        }
        drop(frames_tx);

        let reason = harness
            .bridge(LegRole::Client)
            .run(frames_rx, harness.stream(service_rx))
            .await
            .unwrap();
        assert_eq!(reason, StopReason::LegClosed);

        assert_eq!(harness.pools.mulaw_to_pcm.stats().submitted, 1);
        let sent = harness.translation.sent.lock();
        assert_eq!(sent.len(), 1);
        // 2560 mu-law bytes at 8 kHz → 7680 PCM samples at 24 kHz
        assert_eq!(decoded_audio(&sent[0]).len(), 15360);
        assert!(harness.translation.closed.load(Ordering::SeqCst));

        assert_eq!(harness.session.stream_id(LegRole::Client).as_deref(), Some("MZ-client"));
        assert_eq!(harness.session.call_id(LegRole::Client).as_deref(), Some("CA-leg"));
    }

    #[tokio::test]
    async fn test_remainder_is_flushed_when_leg_stops() {
        let harness = Harness::new();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (_service_tx, service_rx) = mpsc::unbounded_channel();

        frames_tx.send(media_frame(&[0xFF; 2560 + 100])).unwrap();
        frames_tx.send(json!({"event": "stop"}).to_string()).unwrap();

        let reason = harness
            .bridge(LegRole::Client)
            .run(frames_rx, harness.stream(service_rx))
            .await
            .unwrap();
        assert_eq!(reason, StopReason::LegClosed);

        let sent = harness.translation.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(decoded_audio(&sent[0]).len(), 15360);
        assert_eq!(decoded_audio(&sent[1]).len(), 600);
    }

    #[tokio::test]
    async fn test_translated_audio_goes_to_opposite_leg() {
        let harness = Harness::new();
        harness.session.set_stream_id(LegRole::Operator, "MZ-op".to_string());
        harness.session.set_stream_id(LegRole::Client, "MZ-client".to_string());

        let (_frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (service_tx, service_rx) = mpsc::unbounded_channel();
        let pcm = vec![0u8; 1920];
        service_tx
            .send(json!({"message_type": "output_audio_data", "data": {"data": BASE64.encode(&pcm)}}).to_string())
            .unwrap();
        drop(service_tx);

        let reason = harness
            .bridge(LegRole::Client)
            .run(frames_rx, harness.stream(service_rx))
            .await
            .unwrap();
        assert_eq!(reason, StopReason::TranslationClosed);

        let sent = harness.operator_leg.sent.lock();
        assert_eq!(sent.len(), 2);
        for message in sent.iter() {
            let value: Value = serde_json::from_str(message).unwrap();
            assert_eq!(value["event"], "media");
            assert_eq!(value["streamSid"], "MZ-op");
            let payload = BASE64.decode(value["media"]["payload"].as_str().unwrap()).unwrap();
            // 960 PCM bytes at 24 kHz → 160 mu-law bytes at 8 kHz
            assert_eq!(payload.len(), 160);
        }
        assert!(harness.client_leg.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_stream_id_is_fatal() {
        let harness = Harness::new();
        let (_frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (service_tx, service_rx) = mpsc::unbounded_channel();
        service_tx
            .send(json!({"message_type": "output_audio_data", "data": {"data": BASE64.encode([0u8; 960])}}).to_string())
            .unwrap();

        let err = harness
            .bridge(LegRole::Operator)
            .run(frames_rx, harness.stream(service_rx))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::RendezvousTimeout { role: LegRole::Client, .. }));
        assert!(harness.client_leg.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transcripts_are_broadcast() {
        let harness = Harness::new();
        let (_frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (service_tx, service_rx) = mpsc::unbounded_channel();

        for (kind, text, lang) in [
            ("partial_transcription", "hola", "es"),
            ("translated_transcription", "hello", "en"),
        ] {
            service_tx
                .send(json!({"message_type": kind, "data": {"transcription": {"text": text, "language": lang}}}).to_string())
                .unwrap();
        }
        drop(service_tx);

        harness
            .bridge(LegRole::Operator)
            .run(frames_rx, harness.stream(service_rx))
            .await
            .unwrap();

        let events = harness.transcripts.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, TranscriptAction::New);
        assert_eq!(events[1].action, TranscriptAction::Replace);
        assert_eq!(events[1].original_text, "hola");
        assert_eq!(events[1].translated_text, "hello");
        assert_eq!(events[1].role, LegRole::Operator);
    }

    #[tokio::test]
    async fn test_teardown_stops_bridge() {
        let harness = Harness::new();
        let (_frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (_service_tx, service_rx) = mpsc::unbounded_channel();

        let bridge = harness.bridge(LegRole::Client);
        let stream = harness.stream(service_rx);
        let task = tokio::spawn(async move { bridge.run(frames_rx, stream).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.session.begin_teardown(LegRole::Operator);

        assert_eq!(task.await.unwrap().unwrap(), StopReason::SessionCompleted);
        assert!(harness.translation.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_mixing_uses_queued_original_audio() {
        let mut harness = Harness::new();
        harness.config.audio.mix_original = true;
        harness.session.set_stream_id(LegRole::Operator, "MZ-op".to_string());

        let bridge = harness.bridge(LegRole::Client);
        let backlog: OriginalBacklog = Mutex::new(VecDeque::new());
        let sink = RecordingTranslation::default();

        bridge.forward_chunk(vec![0xFF; 320], &sink, &backlog).await.unwrap();
        // 320 mu-law bytes → 1920 PCM bytes → two 960-byte blocks
        assert_eq!(backlog.lock().len(), 2);

        bridge.relay_translated(vec![0u8; 960], &backlog).await.unwrap();
        assert_eq!(backlog.lock().len(), 1);
        assert_eq!(harness.pools.mixer.stats().submitted, 1);
        assert_eq!(harness.operator_leg.sent.lock().len(), 1);
    }
}
