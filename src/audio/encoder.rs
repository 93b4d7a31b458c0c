//! In-memory PCM buffer with a minimal WAV encoder
//!
//! 16-bit PCM with at most two channels gets a plain 44-byte header:
//! RIFF size = 36 + data length, data length = frames × channels × 2.

use std::io::Cursor;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};

use super::AudioError;

pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Clone)]
pub struct AudioCaptureEncoder {
    sample_rate: u32,
    channels: u16,
    /// Interleaved samples
    samples: Vec<i16>,
}

impl AudioCaptureEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.clamp(1, 2),
            samples: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Append interleaved samples.
    pub fn push_frame(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }

    /// Sample frames buffered (one sample per channel each).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Encode everything buffered into a WAV container.
    pub fn encode_wav(&self) -> Result<Vec<u8>, AudioError> {
        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let complete = self.frame_count() * self.channels as usize;
        let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + complete * 2));
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
            for &sample in &self.samples[..complete] {
                writer
                    .write_sample(sample)
                    .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        }
        Ok(cursor.into_inner())
    }

    /// Encode and reset the buffer for the next window.
    pub fn take_wav(&mut self) -> Result<Vec<u8>, AudioError> {
        let wav = self.encode_wav()?;
        self.clear();
        Ok(wav)
    }
}
