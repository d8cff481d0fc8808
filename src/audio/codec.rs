//! # G.711 mu-law Codec
//!
//! Table-free mu-law companding plus helpers for packing 16-bit samples into
//! the little-endian byte layout the translation service expects.
//!
//! ## Encoding Notes:
//! - Samples are clipped to ±32635 before the bias is added so the segment
//!   search never overflows on full-scale input.
//! - Encoded bytes are stored inverted, as G.711 requires.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::TransformError;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Decode one mu-law byte into a linear 16-bit sample.
pub fn mulaw_to_linear16(byte: u8) -> i16 {
    let value = !byte;
    let sign = value & 0x80;
    let exponent = (value >> 4) & 0x07;
    let mantissa = value & 0x0F;

    let magnitude = (((mantissa as i32) << 3) + BIAS) << exponent;
    let sample = magnitude - BIAS;

    if sign != 0 {
        (-sample) as i16
    } else {
        sample as i16
    }
}

/// Encode one linear 16-bit sample as a mu-law byte.
pub fn linear16_to_mulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };

    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((pcm >> (exponent as i32 + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode a run of mu-law bytes. Every byte is a complete sample, so any
/// length is valid.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_to_linear16(b)).collect()
}

/// Encode linear samples to mu-law bytes.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear16_to_mulaw(s)).collect()
}

/// Interpret little-endian bytes as signed 16-bit samples.
///
/// ## Errors:
/// An odd byte count cannot be a whole number of samples and is rejected
/// instead of silently truncated.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, TransformError> {
    if bytes.len() % 2 != 0 {
        return Err(TransformError::MalformedInput(format!(
            "PCM payload of {} bytes is not a multiple of 2",
            bytes.len()
        )));
    }

    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);
    Ok(samples)
}

/// Pack signed 16-bit samples as little-endian bytes.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}
