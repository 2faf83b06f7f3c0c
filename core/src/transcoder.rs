//! PCM16 transcoding: stereo↔mono and sample-rate conversion.
//!
//! All PCM is 16-bit signed little-endian. Every entry point truncates a
//! trailing odd byte before processing (and logs a warning), mirroring the
//! resampling approach in the capture pipeline this is grounded on: a
//! stateful FFT resampler is the preferred path, with a permanent scalar
//! fallback when resampler construction or processing fails.

use rubato::{FftFixedIn, Resampler};

fn truncate_odd_byte(buf: &[u8]) -> &[u8] {
    if buf.len() % 2 == 1 {
        log::warn!("[Transcoder] dropping trailing odd byte ({} bytes)", buf.len());
        &buf[..buf.len() - 1]
    } else {
        buf
    }
}

fn bytes_to_i16(buf: &[u8]) -> Vec<i16> {
    buf.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Averages interleaved stereo PCM16 into mono, with rounding.
pub fn stereo_to_mono(buf: &[u8]) -> Vec<u8> {
    let samples = bytes_to_i16(truncate_odd_byte(buf));
    let mono: Vec<i16> = samples
        .chunks(2)
        .map(|pair| {
            let l = pair[0] as i32;
            let r = *pair.get(1).unwrap_or(&pair[0]) as i32;
            ((l + r + 1) / 2) as i16
        })
        .collect();
    i16_to_bytes(&mono)
}

/// Duplicates each mono PCM16 sample into an interleaved stereo pair.
pub fn mono_to_stereo(buf: &[u8]) -> Vec<u8> {
    let samples = bytes_to_i16(truncate_odd_byte(buf));
    let mut stereo = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        stereo.push(s);
        stereo.push(s);
    }
    i16_to_bytes(&stereo)
}

/// Scalar 3:1 decimation fallback for 48k mono -> 16k mono.
fn downsample_48k_to_16k_scalar(mono48k: &[i16]) -> Vec<i16> {
    mono48k.iter().step_by(3).copied().collect()
}

/// Scalar linear-interpolation fallback for 24k mono -> 48k mono.
/// Each input sample yields itself followed by the midpoint with its
/// successor; the terminal sample's "successor" is duplicated.
fn upsample_24k_to_48k_scalar(mono24k: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(mono24k.len() * 2);
    for (i, &s) in mono24k.iter().enumerate() {
        out.push(s);
        let next = mono24k.get(i + 1).copied().unwrap_or(s);
        let midpoint = ((s as i32 + next as i32) / 2) as i16;
        out.push(midpoint);
    }
    out
}

/// A stateful resampler wrapping `rubato`'s FFT-based resampler, buffering
/// leftover input samples across calls so chunk boundaries never introduce
/// zero-padding artifacts except on an explicit final flush.
struct SimdResampler {
    resampler: FftFixedIn<f32>,
    chunk_size: usize,
    leftover_in: Vec<f32>,
}

impl SimdResampler {
    fn new(from_hz: usize, to_hz: usize, chunk_size: usize) -> Option<Self> {
        match FftFixedIn::<f32>::new(from_hz, to_hz, chunk_size, 2, 1) {
            Ok(resampler) => Some(Self {
                resampler,
                chunk_size,
                leftover_in: Vec::new(),
            }),
            Err(e) => {
                log::warn!(
                    "[Transcoder] SIMD resampler init failed ({from_hz}->{to_hz}): {e}; using scalar fallback"
                );
                None
            }
        }
    }

    /// Processes as many full chunks as available; buffers the remainder.
    fn process(&mut self, input: &[i16]) -> Option<Vec<i16>> {
        self.leftover_in
            .extend(input.iter().map(|&s| f32::from(s) / 32768.0));

        let mut out_f32 = Vec::new();
        while self.leftover_in.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.leftover_in.drain(..self.chunk_size).collect();
            match self.resampler.process(&[&chunk], None) {
                Ok(result) => {
                    if let Some(channel) = result.first() {
                        out_f32.extend_from_slice(channel);
                    }
                }
                Err(e) => {
                    log::warn!("[Transcoder] SIMD resampler process failed: {e}; falling back");
                    return None;
                }
            }
        }

        Some(
            out_f32
                .into_iter()
                .map(|f| (f.clamp(-1.0, 1.0) * 32767.0) as i16)
                .collect(),
        )
    }
}

/// Which conversion ratio a transcoder instance is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleDirection {
    /// 24 kHz mono -> 48 kHz mono (TTS upstream -> SFU).
    Upsample24To48,
    /// 48 kHz mono -> 16 kHz mono (SFU -> STT upstream).
    Downsample48To16,
}

/// Owns the one stateful resampler relevant to a session's flavor.
/// Initialization failure never blocks the session: the scalar fallback is
/// a permanent alternative, exercised per-call with no shared state.
pub struct AudioTranscoder {
    direction: ResampleDirection,
    simd: Option<SimdResampler>,
}

impl AudioTranscoder {
    pub fn new(direction: ResampleDirection) -> Self {
        const CHUNK_SIZE: usize = 1024;
        let simd = match direction {
            ResampleDirection::Upsample24To48 => SimdResampler::new(24_000, 48_000, CHUNK_SIZE),
            ResampleDirection::Downsample48To16 => SimdResampler::new(48_000, 16_000, CHUNK_SIZE),
        };
        Self { direction, simd }
    }

    /// Runs the configured resample direction over PCM16 mono input bytes.
    pub fn resample(&mut self, mono_pcm16: &[u8]) -> Vec<u8> {
        let samples = bytes_to_i16(truncate_odd_byte(mono_pcm16));
        if let Some(simd) = self.simd.as_mut() {
            if let Some(out) = simd.process(&samples) {
                return i16_to_bytes(&out);
            }
            // Processing failed; drop the SIMD path for the rest of this session.
            self.simd = None;
        }
        let out = match self.direction {
            ResampleDirection::Upsample24To48 => upsample_24k_to_48k_scalar(&samples),
            ResampleDirection::Downsample48To16 => downsample_48k_to_16k_scalar(&samples),
        };
        i16_to_bytes(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_to_mono_averages_with_rounding() {
        // L=10, R=11 -> (10+11+1)/2 = 11
        let input = i16_to_bytes(&[10, 11]);
        let mono = bytes_to_i16(&stereo_to_mono(&input));
        assert_eq!(mono, vec![11]);
    }

    #[test]
    fn mono_to_stereo_duplicates_each_sample() {
        let input = i16_to_bytes(&[5, -5]);
        let stereo = bytes_to_i16(&mono_to_stereo(&input));
        assert_eq!(stereo, vec![5, 5, -5, -5]);
    }

    #[test]
    fn downsample_scalar_is_3_to_1_decimation() {
        let input = vec![0, 1, 2, 3, 4, 5, 6, 7, 8];
        let out = downsample_48k_to_16k_scalar(&input);
        assert_eq!(out, vec![0, 3, 6]);
    }

    #[test]
    fn upsample_scalar_duplicates_terminal_sample() {
        let input = vec![10, 20];
        let out = upsample_24k_to_48k_scalar(&input);
        // sample 0, midpoint(0,1)=15, sample 1, midpoint(1, duplicate 1)=20
        assert_eq!(out, vec![10, 15, 20, 20]);
    }

    #[test]
    fn odd_trailing_byte_is_truncated() {
        let mut buf = i16_to_bytes(&[1, 2, 3]);
        buf.push(0xAB);
        let mono = stereo_to_mono(&buf);
        assert_eq!(bytes_to_i16(&mono).len(), 1);
    }

    #[test]
    fn transcoder_resample_never_panics_on_short_input() {
        let mut t = AudioTranscoder::new(ResampleDirection::Downsample48To16);
        let input = i16_to_bytes(&[1, 2, 3]);
        let out = t.resample(&input);
        // Too short for a full FFT chunk; buffered internally, producing no output yet.
        assert!(out.len() % 2 == 0);
    }

    #[test]
    fn transcoder_drains_once_chunk_size_reached() {
        let mut t = AudioTranscoder::new(ResampleDirection::Downsample48To16);
        let input = i16_to_bytes(&vec![100i16; 4096]);
        let out = t.resample(&input);
        assert!(!out.is_empty(), "a full chunk should have produced resampled output");
    }
}
