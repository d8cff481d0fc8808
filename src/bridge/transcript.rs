//! Turns the translation service's transcription stream into observer
//! actions.
//!
//! One tracker per bridge keeps the sentence currently being spoken:
//! - `partial_transcription` opens it (`new`) or revises it (`update`)
//! - `validated_transcription` revises it (`update`)
//! - `translated_transcription` closes it, pairing the open original with
//!   its translation (`replace`)
//!
//! Empty texts and other transcription kinds produce nothing.

use crate::call::session::LegRole;
use crate::transcript::{TranscriptAction, TranscriptEvent};
use crate::translation::messages::{TranscriptionKind, TranscriptionUpdate};

pub struct TranscriptTracker {
    role: LegRole,
    open_original: String,
    open_language: String,
}

impl TranscriptTracker {
    pub fn new(role: LegRole) -> Self {
        Self {
            role,
            open_original: String::new(),
            open_language: String::new(),
        }
    }

    pub fn on_update(&mut self, update: TranscriptionUpdate) -> Option<TranscriptEvent> {
        if update.text.is_empty() {
            return None;
        }

        match update.kind {
            TranscriptionKind::Partial => {
                let action = if self.open_original.is_empty() {
                    TranscriptAction::New
                } else {
                    TranscriptAction::Update
                };
                self.open_original = update.text.clone();
                self.open_language = update.language.clone();
                Some(TranscriptEvent::new(self.role, update.text, "", update.language, action))
            }
            TranscriptionKind::Validated => {
                self.open_original = update.text.clone();
                self.open_language = update.language.clone();
                Some(TranscriptEvent::new(
                    self.role,
                    update.text,
                    "",
                    update.language,
                    TranscriptAction::Update,
                ))
            }
            TranscriptionKind::Translated => {
                let original = std::mem::take(&mut self.open_original);
                let language = std::mem::take(&mut self.open_language);
                Some(TranscriptEvent::new(
                    self.role,
                    original,
                    update.text,
                    language,
                    TranscriptAction::Replace,
                ))
            }
            TranscriptionKind::Other => None,
        }
    }
}
