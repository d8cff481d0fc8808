//! # PCM Mixing
//!
//! Combines two 16-bit PCM streams with independent gains. The shorter input
//! is padded with silence so trailing audio from the longer one is never
//! dropped, and every output sample is saturated to the i16 range.
//!
//! ## Formula:
//! `mixed[i] = (a[i] * gain_a + b[i] * gain_b) / (gain_a + gain_b)`
//!
//! With no second input the primary is simply scaled by `gain_a`.

use crate::error::TransformError;

/// Mix `primary` with an optional `secondary` stream.
///
/// ## Errors:
/// Gains must be finite and non-negative, and when a secondary stream is
/// present their sum must be positive.
pub fn mix_pcm(
    primary: &[i16],
    secondary: Option<&[i16]>,
    gain_a: f32,
    gain_b: f32,
) -> Result<Vec<i16>, TransformError> {
    check_gain("gain_a", gain_a)?;
    check_gain("gain_b", gain_b)?;

    let Some(secondary) = secondary else {
        return Ok(primary
            .iter()
            .map(|&a| saturate(a as f32 * gain_a))
            .collect());
    };

    let total = gain_a + gain_b;
    if total <= 0.0 {
        return Err(TransformError::InvalidGain(
            "gains must not both be zero when mixing two inputs".to_string(),
        ));
    }

    let len = primary.len().max(secondary.len());
    let sample_at = |samples: &[i16], i: usize| samples.get(i).copied().unwrap_or(0) as f32;

    Ok((0..len)
        .map(|i| {
            let a = sample_at(primary, i);
            let b = sample_at(secondary, i);
            saturate((a * gain_a + b * gain_b) / total)
        })
        .collect())
}

fn check_gain(name: &str, gain: f32) -> Result<(), TransformError> {
    if !gain.is_finite() || gain < 0.0 {
        return Err(TransformError::InvalidGain(format!("{name} = {gain}")));
    }
    Ok(())
}

fn saturate(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
