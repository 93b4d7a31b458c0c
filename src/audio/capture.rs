//! Microphone capture
//!
//! `cpal::Stream` is not `Send`, so the stream lives on its own OS thread for
//! its whole life. The only thing crossing threads is the frame queue: the
//! CPAL callback converts to mono i16 and `try_send`s into a tokio channel.
//! A full queue drops the frame rather than blocking the audio callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample as _;
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::AudioError;

/// A buffer of mono 16-bit PCM samples as delivered by the device.
pub type Frame = Vec<i16>;

/// Frames buffered between the audio thread and the consumer
const FRAME_QUEUE_CAPACITY: usize = 256;

/// Exclusive claim on an input device. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    flag: Arc<AtomicBool>,
}

impl DeviceLease {
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Keeps a capture running. Dropping it stops the capture thread, waits for
/// the stream to close, then releases the device lease.
#[derive(Default)]
pub struct CaptureGuard {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    lease: Option<DeviceLease>,
}

impl CaptureGuard {
    pub fn new(lease: Option<DeviceLease>) -> Self {
        Self {
            stop_tx: None,
            thread: None,
            lease,
        }
    }

    fn with_thread(mut self, stop_tx: std::sync::mpsc::Sender<()>, thread: JoinHandle<()>) -> Self {
        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        self
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        // Closing the channel wakes the capture thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Audio capture thread panicked");
            }
        }
        self.lease.take();
    }
}

impl std::fmt::Debug for CaptureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureGuard")
            .field("running", &self.thread.is_some())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

/// An open capture: a frame stream plus the guard that keeps it alive.
#[derive(Debug)]
pub struct CaptureStream {
    frames: mpsc::Receiver<Frame>,
    sample_rate: u32,
    guard: CaptureGuard,
}

impl CaptureStream {
    pub fn new(frames: mpsc::Receiver<Frame>, sample_rate: u32, guard: CaptureGuard) -> Self {
        Self {
            frames,
            sample_rate,
            guard,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames are always downmixed to mono.
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn into_parts(self) -> (mpsc::Receiver<Frame>, u32, CaptureGuard) {
        (self.frames, self.sample_rate, self.guard)
    }
}

/// Capability to open an audio input.
pub trait AudioSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Open the input. Fails with `DeviceBusy` while another capture holds it.
    fn open(&self) -> Result<CaptureStream, AudioError>;
}

/// The default CPAL input device.
pub struct MicrophoneSource {
    in_use: Arc<AtomicBool>,
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrophoneSource {
    pub fn new() -> Self {
        Self {
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

impl AudioSource for MicrophoneSource {
    fn name(&self) -> &str {
        "microphone"
    }

    fn open(&self) -> Result<CaptureStream, AudioError> {
        let lease = DeviceLease::try_acquire(&self.in_use).ok_or(AudioError::DeviceBusy)?;

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<u32, AudioError>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("lark-capture".to_string())
            .spawn(move || {
                let stream = match open_default_input(frame_tx) {
                    Ok((stream, rate)) => {
                        let _ = init_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the guard drops its sender
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Audio capture thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(format!("spawn capture thread: {}", e)))?;

        let sample_rate = match init_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamCreationFailed(
                    "capture thread exited during init".to_string(),
                ));
            }
        };

        log::info!("Microphone capture started at {} Hz", sample_rate);
        let guard = CaptureGuard::new(Some(lease)).with_thread(stop_tx, thread);
        Ok(CaptureStream::new(frame_rx, sample_rate, guard))
    }
}

fn classify_backend_message(message: String) -> AudioError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        AudioError::PermissionDenied(message)
    } else if lower.contains("busy") || lower.contains("in use") {
        AudioError::DeviceBusy
    } else {
        AudioError::StreamCreationFailed(message)
    }
}

fn open_default_input(frame_tx: mpsc::Sender<Frame>) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => AudioError::NoInputDevice,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => AudioError::NoSupportedConfig,
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_message(err.description)
        }
        #[allow(unreachable_patterns)]
        other => AudioError::StreamCreationFailed(other.to_string()),
    })?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, frame_tx),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, frame_tx),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, frame_tx),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => AudioError::NoInputDevice,
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_message(err.description),
        #[allow(unreachable_patterns)]
        other => AudioError::StreamCreationFailed(other.to_string()),
    })?;

    Ok((stream, sample_rate))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frame_tx: mpsc::Sender<Frame>,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frame = downmix_to_mono(data, channels);
                if frame_tx.try_send(frame).is_err() && !frame_tx.is_closed() {
                    log::trace!("Frame queue full, dropping frame");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::NoInputDevice,
            cpal::BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
            cpal::BuildStreamError::BackendSpecific { err } => {
                classify_backend_message(err.description)
            }
            other => AudioError::StreamCreationFailed(other.to_string()),
        })
}

/// Average interleaved channels into one i16 channel.
fn downmix_to_mono<T: cpal::Sample>(data: &[T], channels: usize) -> Frame {
    if channels <= 1 {
        return data.iter().map(|&s| sample_to_i16(s)).collect();
    }
    data.chunks(channels)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| i32::from(sample_to_i16(s))).sum();
            (sum / chunk.len() as i32) as i16
        })
        .collect()
}

/// Convert any sample type to i16.
pub fn sample_to_i16<T: cpal::Sample>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample().to_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [0.5f32, -0.5, 1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0, i16::MAX]);
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = DeviceLease::try_acquire(&flag).expect("first lease");
        assert!(DeviceLease::try_acquire(&flag).is_none());

        drop(first);
        assert!(DeviceLease::try_acquire(&flag).is_some());
    }

    #[test]
    fn guard_releases_lease_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = CaptureGuard::new(DeviceLease::try_acquire(&flag));
        assert!(flag.load(Ordering::Acquire));
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn microphone_rejects_second_open_while_leased() {
        let mic = MicrophoneSource::new();
        let _held = DeviceLease::try_acquire(&mic.in_use).unwrap();
        assert_eq!(mic.open().unwrap_err(), AudioError::DeviceBusy);
    }

    #[test]
    fn backend_messages_are_classified() {
        assert!(matches!(
            classify_backend_message("Permission denied by user".into()),
            AudioError::PermissionDenied(_)
        ));
        assert_eq!(
            classify_backend_message("Device or resource busy".into()),
            AudioError::DeviceBusy
        );
    }
}
