//! Capture frames → Realtime session
//!
//! ```text
//! capture thread ──try_send──▶ AudioStreamer::run()
//!                                ├─ downsample to 24 kHz
//!                                ├─ chunk (100 ms)
//!                                └─ input_audio_buffer.append
//! ```

use tokio::sync::mpsc;

use super::protocol::REALTIME_SAMPLE_RATE;
use super::realtime_client::RealtimeSession;
use super::StreamingError;
use crate::audio::Frame;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub source_sample_rate: u32,
    pub target_sample_rate: u32,
    pub chunk_duration_ms: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 48_000,
            target_sample_rate: REALTIME_SAMPLE_RATE,
            chunk_duration_ms: 100,
        }
    }
}

impl StreamerConfig {
    pub fn samples_per_chunk(&self) -> usize {
        (self.target_sample_rate * self.chunk_duration_ms / 1000) as usize
    }
}

pub struct AudioStreamer {
    config: StreamerConfig,
    frames: mpsc::Receiver<Frame>,
    session: RealtimeSession,
    buffer: Vec<i16>,
    samples_per_chunk: usize,
    chunks_sent: u64,
}

impl AudioStreamer {
    pub fn new(session: RealtimeSession, frames: mpsc::Receiver<Frame>, config: StreamerConfig) -> Self {
        let samples_per_chunk = config.samples_per_chunk().max(1);
        if config.source_sample_rate % config.target_sample_rate != 0 {
            log::warn!(
                "AudioStreamer: {}Hz is not a multiple of {}Hz, sending audio unresampled",
                config.source_sample_rate,
                config.target_sample_rate
            );
        }
        Self {
            config,
            frames,
            session,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
            samples_per_chunk,
            chunks_sent: 0,
        }
    }

    /// Stream until the capture closes. Returns chunks sent.
    pub async fn run(mut self) -> Result<u64, StreamingError> {
        while let Some(frame) = self.frames.recv().await {
            let resampled = downsample(
                &frame,
                self.config.source_sample_rate,
                self.config.target_sample_rate,
            );
            self.buffer.extend(resampled);

            while self.buffer.len() >= self.samples_per_chunk {
                let chunk: Vec<i16> = self.buffer.drain(..self.samples_per_chunk).collect();
                self.session.send_audio(&chunk).await?;
                self.chunks_sent += 1;
                if self.chunks_sent % 600 == 0 {
                    log::debug!("AudioStreamer: sent {} chunks", self.chunks_sent);
                }
            }
        }

        log::info!("AudioStreamer: capture closed after {} chunks", self.chunks_sent);
        self.session.disconnect().await;
        Ok(self.chunks_sent)
    }
}

/// Integer-ratio decimation by averaging. Non-integer ratios pass through.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0
        || source_rate == 0
        || source_rate == target_rate
        || source_rate % target_rate != 0
    {
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;
    samples
        .chunks(ratio)
        .map(|chunk| {
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}
