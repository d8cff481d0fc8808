//! # Audio Module
//!
//! Pure, CPU-bound audio conversions used by the call bridge. Nothing in here
//! touches the network or the event loop; every function is deterministic and
//! safe to run on an offload worker thread.
//!
//! ## Key Components:
//! - **codec**: G.711 mu-law companding (8-bit telephony samples ↔ 16-bit PCM)
//!   plus little-endian PCM byte packing
//! - **resample**: linear-interpolation sample-rate conversion
//! - **mix**: gain-weighted, length-reconciling mix of two PCM streams
//! - **buffer**: per-leg frame accumulator that drains fixed-size chunks
//! - **transform**: the three offloadable transforms the worker pool runs
//!
//! ## Audio Formats:
//! - **Telephony legs**: mu-law, 8 kHz, mono, 1 byte per sample
//! - **Translation service**: signed 16-bit little-endian PCM, 24 kHz, mono

pub mod buffer;
pub mod codec;
pub mod mix;
pub mod resample;
pub mod transform;

pub use buffer::FrameBuffer;
pub use transform::{MixRequest, MixToMulaw, MulawToPcm, PcmToMulaw, Transform};
