use webrtc_vad::{SampleRate, Vad, VadMode};

use super::AudioError;

/// Minimum 30 ms speech frames before a window counts as speech
const MIN_SPEECH_FRAMES: usize = 2;
/// Peak/RMS above this looks like a click or knock, not a voice
const MAX_CREST_FACTOR: f32 = 15.0;

#[derive(Debug, Clone)]
pub struct VadStats {
    pub total_frames: usize,
    pub speech_frames: usize,
    pub total_samples: u64,
    pub peak_abs: i32,
    pub rms: f32,
    pub ignored_samples: u64,
}

impl VadStats {
    pub fn speech_ratio(&self) -> f32 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.speech_frames as f32 / self.total_frames as f32
    }

    pub fn crest_factor(&self) -> f32 {
        if self.rms <= 0.0 {
            return f32::INFINITY;
        }
        self.peak_abs as f32 / self.rms
    }

    /// Enough speech frames, and not dominated by a transient.
    pub fn has_speech(&self) -> bool {
        self.speech_frames >= MIN_SPEECH_FRAMES && self.crest_factor() <= MAX_CREST_FACTOR
    }
}

/// Trailing silence that counts as a pause between words
const PAUSE_MS: usize = 90;

/// WebRTC VAD only runs at these rates.
pub fn is_supported_rate(sample_rate: u32) -> bool {
    matches!(sample_rate, 8000 | 16000 | 32000 | 48000)
}

/// Run VAD over a mono 16-bit window.
pub fn analyze_samples(
    samples: &[i16],
    sample_rate: u32,
    ignore_start_ms: u64,
) -> Result<VadStats, AudioError> {
    if !is_supported_rate(sample_rate) {
        return Err(AudioError::UnsupportedFormat(format!(
            "VAD sample rate {}Hz",
            sample_rate
        )));
    }
    let rate = SampleRate::try_from(sample_rate as i32)
        .map_err(|_| AudioError::UnsupportedFormat(format!("VAD sample rate {}Hz", sample_rate)))?;

    // Aggressive mode to keep background noise out of the transcription queue
    let mut vad = Vad::new_with_rate_and_mode(rate, VadMode::VeryAggressive);

    // WebRTC VAD supports only 10/20/30ms frames
    let frame_len = (sample_rate as usize * 30) / 1000;

    let ignored = ((sample_rate as u64).saturating_mul(ignore_start_ms) / 1000)
        .min(samples.len() as u64) as usize;
    let body = &samples[ignored..];

    let mut total_frames = 0;
    let mut speech_frames = 0;
    for frame in body.chunks_exact(frame_len) {
        total_frames += 1;
        if vad.is_voice_segment(frame).unwrap_or(false) {
            speech_frames += 1;
        }
    }

    let mut sum_squares: u128 = 0;
    let mut peak_abs: i32 = 0;
    for &sample in body {
        let s = i32::from(sample);
        peak_abs = peak_abs.max(s.abs());
        sum_squares += (s * s) as u128;
    }
    let rms = if body.is_empty() {
        0.0
    } else {
        (sum_squares as f64 / body.len() as f64).sqrt() as f32
    };

    let stats = VadStats {
        total_frames,
        speech_frames,
        total_samples: body.len() as u64,
        peak_abs,
        rms,
        ignored_samples: ignored as u64,
    };

    log::debug!(
        "VAD: speech_frames={}, total_frames={}, ratio={:.2}, rms={:.0}, peak_abs={}, crest_factor={:.1}",
        stats.speech_frames,
        stats.total_frames,
        stats.speech_ratio(),
        stats.rms,
        stats.peak_abs,
        stats.crest_factor()
    );

    Ok(stats)
}

/// True when the last few 30 ms frames hold no voice. Rates VAD cannot
/// handle always count as a pause.
pub fn ends_in_pause(samples: &[i16], sample_rate: u32) -> bool {
    if !is_supported_rate(sample_rate) {
        return true;
    }
    let Ok(rate) = SampleRate::try_from(sample_rate as i32) else {
        return true;
    };
    let frame_len = (sample_rate as usize * 30) / 1000;
    let tail_len = frame_len * (PAUSE_MS / 30);
    if samples.len() < tail_len {
        return false;
    }

    let mut vad = Vad::new_with_rate_and_mode(rate, VadMode::VeryAggressive);
    samples[samples.len() - tail_len..]
        .chunks_exact(frame_len)
        .all(|frame| !vad.is_voice_segment(frame).unwrap_or(false))
}
