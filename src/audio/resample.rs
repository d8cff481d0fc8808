//! # Sample-Rate Conversion
//!
//! Telephony legs run at 8 kHz while the translation service wants 24 kHz.
//! Upsampling uses linear interpolation between neighbouring samples;
//! downsampling averages every input sample that falls into an output slot,
//! which doubles as a cheap anti-alias filter.
//!
//! The output always holds `input.len() * to / from` samples (integer
//! division), so chunk durations survive a round trip.

/// Convert `samples` from `from_rate` to `to_rate`.
///
/// Equal rates, an empty input or a zero rate return the input unchanged.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = output_len(samples.len(), from_rate, to_rate);
    if to_rate > from_rate {
        upsample(samples, from_rate, to_rate, out_len)
    } else {
        downsample(samples, out_len)
    }
}

/// Number of samples `resample` produces for an input of `len` samples.
pub fn output_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return len;
    }
    (len as u64 * to_rate as u64 / from_rate as u64) as usize
}

fn upsample(samples: &[i16], from_rate: u32, to_rate: u32, out_len: usize) -> Vec<i16> {
    let last = samples.len() - 1;
    let (from, to) = (from_rate as u64, to_rate as u64);

    (0..out_len)
        .map(|i| {
            // Exact rational position i * from / to
            let scaled = i as u64 * from;
            let idx = ((scaled / to) as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (scaled % to) as f64 / to as f64;
            let a = samples[idx] as f64;
            let b = samples[next] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

fn downsample(samples: &[i16], out_len: usize) -> Vec<i16> {
    let n = samples.len();

    (0..out_len)
        .map(|i| {
            let start = i * n / out_len;
            let end = ((i + 1) * n / out_len).max(start + 1).min(n);
            let window = &samples[start..end];
            let sum: i64 = window.iter().map(|&s| s as i64).sum();
            (sum / window.len() as i64) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsample_triples_length() {
        let input: Vec<i16> = (0..160).map(|i| (i * 10) as i16).collect();
        let output = resample(&input, 8000, 24000);
        assert_eq!(output.len(), 480);
        // Interpolated points sit between their neighbours
        assert_eq!(output[0], 0);
        assert_eq!(output[3], 10);
        assert!(output[1] > 0 && output[1] < 10);
    }

    #[test]
    fn test_downsample_averages_windows() {
        let input = vec![3i16, 6, 9, 30, 30, 30];
        let output = resample(&input, 24000, 8000);
        assert_eq!(output, vec![6, 30]);
    }

    #[test]
    fn test_length_scales_by_rate_ratio() {
        for len in [1usize, 7, 160, 2560, 4801] {
            let input = vec![100i16; len];
            let up = resample(&input, 8000, 24000);
            assert_eq!(up.len(), len * 3);
            let down = resample(&up, 24000, 8000);
            assert!((down.len() as i64 - len as i64).abs() <= 1);
        }
    }

    #[test]
    fn test_constant_signal_survives_round_trip() {
        let input = vec![-1234i16; 320];
        let back = resample(&resample(&input, 8000, 24000), 24000, 8000);
        assert!(back.iter().all(|&s| s == -1234));
    }

    #[test]
    fn test_same_rate_is_identity() {
        let input = vec![1i16, 2, 3];
        assert_eq!(resample(&input, 8000, 8000), input);
    }
}
