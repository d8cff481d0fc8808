//! # Calls
//!
//! Call sessions and everything that moves them through their lifecycle:
//! the per-call state machine (`session`), the process-wide registry
//! (`registry`), the telephony REST client (`control`), the TwiML documents
//! handed to the provider (`twiml`) and the per-leg driver (`coordinator`).

pub mod control;
pub mod coordinator;
pub mod registry;
pub mod session;
pub mod twiml;

