//! # Offloadable Transforms
//!
//! The three byte-level conversions the bridge runs on the offload pool:
//!
//! | Transform      | Input                          | Output                 |
//! |----------------|--------------------------------|------------------------|
//! | `MulawToPcm`   | mu-law @ leg rate              | PCM s16le @ service rate |
//! | `PcmToMulaw`   | PCM s16le @ service rate       | mu-law @ leg rate      |
//! | `MixToMulaw`   | two PCM s16le @ service rate   | mu-law @ leg rate      |
//!
//! Each worker thread owns its own clone of a transform, so implementations
//! only need to be cheap to clone and free of shared mutable state.

use serde::{Deserialize, Serialize};

use super::codec::{decode_mulaw, encode_mulaw, pcm_from_le_bytes, pcm_to_le_bytes};
use super::mix::mix_pcm;
use super::resample::resample;
use crate::error::TransformError;

/// A stateless, CPU-bound conversion that a pool worker can run.
///
/// ## Rust Concepts:
/// - **Associated types**: each transform names its own input/output payloads
/// - **Associated const**: `NAME` labels the pool's worker threads and logs
/// - **Send + 'static**: payloads cross from the event loop to worker threads
pub trait Transform: Clone + Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    const NAME: &'static str;

    fn apply(&self, input: Self::Input) -> Result<Self::Output, TransformError>;
}

/// Decode mu-law bytes and resample to the service rate.
pub fn mulaw_to_pcm(bytes: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    let samples = decode_mulaw(bytes);
    pcm_to_le_bytes(&resample(&samples, from_rate, to_rate))
}

/// Resample PCM bytes down to the leg rate and encode as mu-law.
pub fn pcm_to_mulaw(bytes: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, TransformError> {
    let samples = pcm_from_le_bytes(bytes)?;
    Ok(encode_mulaw(&resample(&samples, from_rate, to_rate)))
}

/// Mix two PCM byte streams at `from_rate`, then resample to `to_rate` and
/// encode as mu-law.
pub fn mix(
    primary: &[u8],
    secondary: Option<&[u8]>,
    primary_gain: f32,
    secondary_gain: f32,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<u8>, TransformError> {
    let a = pcm_from_le_bytes(primary)?;
    let b = secondary.map(pcm_from_le_bytes).transpose()?;
    let mixed = mix_pcm(&a, b.as_deref(), primary_gain, secondary_gain)?;
    Ok(encode_mulaw(&resample(&mixed, from_rate, to_rate)))
}

#[derive(Debug, Clone, Copy)]
pub struct MulawToPcm {
    pub leg_rate: u32,
    pub service_rate: u32,
}

impl Transform for MulawToPcm {
    type Input = Vec<u8>;
    type Output = Vec<u8>;

    const NAME: &'static str = "mulaw-to-pcm";

    fn apply(&self, input: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        Ok(mulaw_to_pcm(&input, self.leg_rate, self.service_rate))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PcmToMulaw {
    pub service_rate: u32,
    pub leg_rate: u32,
}

impl Transform for PcmToMulaw {
    type Input = Vec<u8>;
    type Output = Vec<u8>;

    const NAME: &'static str = "pcm-to-mulaw";

    fn apply(&self, input: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        pcm_to_mulaw(&input, self.service_rate, self.leg_rate)
    }
}

/// One mixing job: the primary stream plus an optional secondary stream,
/// both PCM s16le at the service rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixRequest {
    pub primary: Vec<u8>,
    pub secondary: Option<Vec<u8>>,
    pub primary_gain: f32,
    pub secondary_gain: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct MixToMulaw {
    pub service_rate: u32,
    pub leg_rate: u32,
}

impl Transform for MixToMulaw {
    type Input = MixRequest;
    type Output = Vec<u8>;

    const NAME: &'static str = "mixer";

    fn apply(&self, input: MixRequest) -> Result<Vec<u8>, TransformError> {
        mix(
            &input.primary,
            input.secondary.as_deref(),
            input.primary_gain,
            input.secondary_gain,
            self.service_rate,
            self.leg_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_to_pcm_output_length() {
        // 2560 mu-law bytes at 8 kHz → 7680 samples at 24 kHz → 15360 bytes
        let pcm = mulaw_to_pcm(&vec![0xFF; 2560], 8000, 24000);
        assert_eq!(pcm.len(), 15360);
        assert!(pcm.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_round_trip_keeps_duration() {
        let mulaw: Vec<u8> = (0..=255u8).cycle().take(800).collect();
        let pcm = mulaw_to_pcm(&mulaw, 8000, 24000);
        let back = pcm_to_mulaw(&pcm, 24000, 8000).unwrap();
        assert!((back.len() as i64 - mulaw.len() as i64).abs() <= 1);
    }

    #[test]
    fn test_pcm_to_mulaw_rejects_odd_length() {
        let transform = PcmToMulaw { service_rate: 24000, leg_rate: 8000 };
        assert!(transform.apply(vec![0u8; 961]).is_err());
    }

    #[test]
    fn test_mixer_encodes_at_leg_rate() {
        let transform = MixToMulaw { service_rate: 24000, leg_rate: 8000 };
        let output = transform
            .apply(MixRequest {
                primary: vec![0u8; 960],
                secondary: Some(vec![0u8; 480]),
                primary_gain: 0.7,
                secondary_gain: 0.3,
            })
            .unwrap();
        // 480 samples at 24 kHz → 160 samples at 8 kHz
        assert_eq!(output.len(), 160);
        assert!(output.iter().all(|&b| b == 0xFF));
    }
}
