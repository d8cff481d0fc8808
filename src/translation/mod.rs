//! # Translation Service
//!
//! Everything the bridge needs to talk to the speech-translation service:
//! the wire protocol (`messages`), the per-leg pipeline configuration
//! (`settings`) and the session/socket client (`client`).

pub mod client;
pub mod messages;
pub mod settings;

pub use client::{
    PalabraConnector, TranslationConnector, TranslationSink, TranslationSource, TranslationStream,
};
pub use messages::{LegEvent, ServiceEvent, ServiceRequest};
