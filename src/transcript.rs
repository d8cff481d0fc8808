//! # Transcript Broadcaster
//!
//! Fans transcript updates from every bridge out to the connected observer
//! pages. Delivery is best-effort: an observer that cannot take a message is
//! dropped after the fan-out pass, and nobody waits for acknowledgements.
//!
//! ## Message Format:
//! ```json
//! {
//!   "type": "transcription",
//!   "role": "client",
//!   "original_text": "hello there",
//!   "translated_text": "",
//!   "original_language": "en",
//!   "action": "update",
//!   "timestamp": 1718000000.123
//! }
//! ```
//!
//! ## Actions:
//! - **new**: start a new sentence bubble
//! - **update**: replace the text of the open sentence
//! - **replace**: final version with the translation; the sentence closes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::call::session::LegRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptAction {
    New,
    Update,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: LegRole,
    pub original_text: String,
    pub translated_text: String,
    pub original_language: String,
    pub action: TranscriptAction,
    pub timestamp: f64,
}

impl TranscriptEvent {
    pub fn new(
        role: LegRole,
        original_text: impl Into<String>,
        translated_text: impl Into<String>,
        original_language: impl Into<String>,
        action: TranscriptAction,
    ) -> Self {
        Self {
            kind: "transcription",
            role,
            original_text: original_text.into(),
            translated_text: translated_text.into(),
            original_language: original_language.into(),
            action,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Where bridges publish transcript updates.
pub trait TranscriptSink: Send + Sync {
    fn broadcast(&self, event: TranscriptEvent);
}

/// One connected observer. `deliver` returns `false` when the observer is
/// gone and should be removed.
pub trait ObserverHandle: Send + Sync {
    fn deliver(&self, message: &str) -> bool;
}

/// Process-wide observer set.
#[derive(Default)]
pub struct TranscriptHub {
    observers: RwLock<HashMap<Uuid, Arc<dyn ObserverHandle>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl TranscriptHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn ObserverHandle>) -> Uuid {
        let id = Uuid::new_v4();
        self.observers.write().insert(id, observer);
        debug!(observer_id = %id, "transcript observer subscribed");
        id
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        if self.observers.write().remove(id).is_some() {
            debug!(observer_id = %id, "transcript observer unsubscribed");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TranscriptSink for TranscriptHub {
    fn broadcast(&self, event: TranscriptEvent) {
        let message = match serde_json::to_string(&event) {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to serialize transcript event: {}", e);
                return;
            }
        };

        // Deliver from a snapshot so observers can (un)subscribe meanwhile
        let snapshot: Vec<(Uuid, Arc<dyn ObserverHandle>)> = self
            .observers
            .read()
            .iter()
            .map(|(id, observer)| (*id, Arc::clone(observer)))
            .collect();

        let mut failed = Vec::new();
        for (id, observer) in snapshot {
            if observer.deliver(&message) {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut observers = self.observers.write();
            for id in &failed {
                observers.remove(id);
            }
            self.dropped.fetch_add(failed.len() as u64, Ordering::Relaxed);
            debug!(removed = failed.len(), "dropped unreachable transcript observers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        broken: bool,
    }

    impl ObserverHandle for Recorder {
        fn deliver(&self, message: &str) -> bool {
            if self.broken {
                return false;
            }
            self.messages.lock().push(message.to_string());
            true
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let event = TranscriptEvent::new(LegRole::Operator, "привет", "hello", "ru", TranscriptAction::Replace);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "transcription");
        assert_eq!(value["role"], "operator");
        assert_eq!(value["action"], "replace");
        assert_eq!(value["translated_text"], "hello");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_failed_observer_does_not_block_others() {
        let hub = TranscriptHub::new();
        let good = Arc::new(Recorder::default());
        let bad = Arc::new(Recorder { broken: true, ..Recorder::default() });
        let also_good = Arc::new(Recorder::default());

        hub.subscribe(good.clone());
        hub.subscribe(bad);
        hub.subscribe(also_good.clone());

        hub.broadcast(TranscriptEvent::new(LegRole::Client, "hi", "", "en", TranscriptAction::New));

        assert_eq!(good.messages.lock().len(), 1);
        assert_eq!(also_good.messages.lock().len(), 1);
        assert_eq!(hub.observer_count(), 2);
        assert_eq!(hub.delivered_count(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = TranscriptHub::new();
        let observer = Arc::new(Recorder::default());
        let id = hub.subscribe(observer.clone());
        hub.unsubscribe(&id);

        hub.broadcast(TranscriptEvent::new(LegRole::Client, "hi", "", "en", TranscriptAction::New));
        assert!(observer.messages.lock().is_empty());
    }
}
