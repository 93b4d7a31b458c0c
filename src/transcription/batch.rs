use futures_util::stream::{FuturesOrdered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use super::{
    BackendKind, BackendSink, BatchTranscriber, BatchTranscript, TranscriptionBackend,
    TranscriptionError,
};
use crate::audio::vad::{analyze_samples, ends_in_pause, is_supported_rate};
use crate::audio::{AudioCaptureEncoder, AudioSource, CaptureGuard, Frame};
use crate::error::{ErrorKind, VoiceError};
use crate::events::TranscriptEvent;

/// A window still in speech may grow to this many times its nominal length
const MAX_WINDOW_STRETCH: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Nominal length of each clip sent for transcription
    pub window: Duration,
    /// Skip windows WebRTC VAD finds no speech in, and cut windows at pauses
    pub vad_enabled: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(4000),
            vad_enabled: true,
        }
    }
}

/// Offline recognizer: capture is cut into windows, each encoded to WAV and
/// transcribed on its own task while capture continues.
///
/// With VAD enabled a full window is held open until speech pauses, so a
/// phrase is not split across two clips. Submissions overlap, but their
/// results reach the sink in capture order. `stop` drops whatever is still
/// in flight.
pub struct BatchRecognizer {
    source: Arc<dyn AudioSource>,
    transcriber: Arc<dyn BatchTranscriber>,
    config: BatchConfig,
    capture: Option<CaptureGuard>,
    pump: Option<JoinHandle<()>>,
}

impl BatchRecognizer {
    pub fn new(
        source: Arc<dyn AudioSource>,
        transcriber: Arc<dyn BatchTranscriber>,
        config: BatchConfig,
    ) -> Self {
        Self {
            source,
            transcriber,
            config,
            capture: None,
            pump: None,
        }
    }
}

impl TranscriptionBackend for BatchRecognizer {
    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    fn start(&mut self, sink: BackendSink) -> Result<(), VoiceError> {
        self.stop();

        let stream = self.source.open()?;
        let (frames, sample_rate, guard) = stream.into_parts();
        log::info!(
            "Batch recognizer: capture open on {} at {}Hz, {}ms windows (generation {})",
            self.source.name(),
            sample_rate,
            self.config.window.as_millis(),
            sink.generation()
        );

        self.capture = Some(guard);
        self.pump = Some(tokio::spawn(run_windows(
            frames,
            sample_rate,
            self.config.clone(),
            self.transcriber.clone(),
            sink,
        )));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.capture.take().is_some() {
            log::info!("Batch recognizer: capture released");
        }
    }
}

impl Drop for BatchRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

type Submission = JoinHandle<Result<BatchTranscript, TranscriptionError>>;

async fn run_windows(
    mut frames: mpsc::Receiver<Frame>,
    sample_rate: u32,
    config: BatchConfig,
    transcriber: Arc<dyn BatchTranscriber>,
    sink: BackendSink,
) {
    if !sink.ready().await {
        return;
    }

    let window_frames = ((sample_rate as u128 * config.window.as_millis()) / 1000).max(1) as usize;
    let mut encoder = AudioCaptureEncoder::new(sample_rate, 1);
    let mut windows = 0u64;
    let mut in_flight: FuturesOrdered<Submission> = FuturesOrdered::new();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                encoder.push_frame(&frame);
                let complete = window_complete(
                    encoder.frame_count(),
                    window_frames,
                    config.vad_enabled,
                    || ends_in_pause(encoder.samples(), sample_rate),
                );
                if !complete {
                    continue;
                }
                windows += 1;

                if config.vad_enabled && !window_has_speech(encoder.samples(), sample_rate) {
                    log::debug!("Batch recognizer: window {} has no speech, skipped", windows);
                    encoder.clear();
                    continue;
                }

                let wav = match encoder.take_wav() {
                    Ok(wav) => wav,
                    Err(e) => {
                        log::error!("Batch recognizer: {}", e);
                        sink.error(ErrorKind::from(&e), e.to_string()).await;
                        return;
                    }
                };
                in_flight.push_back(tokio::spawn(transcriber.transcribe(wav)));
            }
            Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                deliver(joined, &sink).await;
            }
        }
    }

    // The capture thread went away underneath us
    log::warn!("Batch recognizer: capture closed after {} windows", windows);
    while let Some(joined) = in_flight.next().await {
        deliver(joined, &sink).await;
    }
    sink.ended().await;
}

/// A window closes at its nominal length once speech pauses, and at
/// `MAX_WINDOW_STRETCH` times that length regardless.
fn window_complete(
    len: usize,
    window: usize,
    cut_at_pause: bool,
    paused: impl FnOnce() -> bool,
) -> bool {
    if len < window {
        return false;
    }
    if !cut_at_pause || len >= window * MAX_WINDOW_STRETCH {
        return true;
    }
    paused()
}

async fn deliver(
    joined: Result<Result<BatchTranscript, TranscriptionError>, JoinError>,
    sink: &BackendSink,
) {
    match joined {
        Ok(Ok(result)) => match result.accepted_text() {
            Some(text) => {
                sink.transcript(TranscriptEvent::final_result(text, result.confidence))
                    .await;
            }
            None => log::debug!(
                "Batch recognizer: dropped empty/no-speech result (no_speech_prob={:?})",
                result.no_speech_prob
            ),
        },
        Ok(Err(e)) => {
            log::warn!("Batch recognizer: transcription failed: {}", e);
            sink.error(ErrorKind::from(&e), e.to_string()).await;
        }
        Err(e) => log::error!("Batch recognizer: transcription task failed: {}", e),
    }
}

/// Windows at rates VAD cannot handle are always submitted.
fn window_has_speech(samples: &[i16], sample_rate: u32) -> bool {
    if !is_supported_rate(sample_rate) {
        return true;
    }
    match analyze_samples(samples, sample_rate, 0) {
        Ok(stats) => {
            log::debug!(
                "Batch VAD: {}/{} speech frames, crest {:.1}",
                stats.speech_frames,
                stats.total_frames,
                stats.crest_factor()
            );
            stats.has_speech()
        }
        Err(e) => {
            log::warn!("Batch VAD failed, submitting window: {}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, CaptureStream};
    use crate::state_machine::Event;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ChannelSource {
        frames: Mutex<Option<mpsc::Receiver<Frame>>>,
    }

    impl AudioSource for ChannelSource {
        fn name(&self) -> &str {
            "channel"
        }

        fn open(&self) -> Result<CaptureStream, AudioError> {
            let rx = self.frames.lock().unwrap().take().ok_or(AudioError::DeviceBusy)?;
            Ok(CaptureStream::new(rx, 16_000, CaptureGuard::default()))
        }
    }

    struct FixedTranscriber(BatchTranscript);

    impl BatchTranscriber for FixedTranscriber {
        fn transcribe(
            &self,
            wav: Vec<u8>,
        ) -> BoxFuture<'static, Result<BatchTranscript, TranscriptionError>> {
            // 100 ms at 16 kHz mono
            assert_eq!(wav.len(), 44 + 1600 * 2);
            let result = self.0.clone();
            Box::pin(async move { Ok(result) })
        }
    }

    /// Answers each call with the next scripted text after its delay.
    struct ScriptedTranscriber {
        replies: Vec<(&'static str, Duration)>,
        calls: AtomicUsize,
    }

    impl BatchTranscriber for ScriptedTranscriber {
        fn transcribe(
            &self,
            _wav: Vec<u8>,
        ) -> BoxFuture<'static, Result<BatchTranscript, TranscriptionError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (text, delay) = self.replies[call];
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(BatchTranscript {
                    text: text.to_string(),
                    confidence: 0.8,
                    no_speech_prob: None,
                })
            })
        }
    }

    fn with_transcriber(
        transcriber: Arc<dyn BatchTranscriber>,
    ) -> (BatchRecognizer, mpsc::Sender<Frame>) {
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let source = ChannelSource {
            frames: Mutex::new(Some(frame_rx)),
        };
        let config = BatchConfig {
            window: Duration::from_millis(100),
            vad_enabled: false,
        };
        (
            BatchRecognizer::new(Arc::new(source), transcriber, config),
            frame_tx,
        )
    }

    fn recognizer(
        text: &str,
        no_speech_prob: Option<f32>,
    ) -> (BatchRecognizer, mpsc::Sender<Frame>) {
        with_transcriber(Arc::new(FixedTranscriber(BatchTranscript {
            text: text.to_string(),
            confidence: 0.75,
            no_speech_prob,
        })))
    }

    fn final_text(event: Option<Event>) -> String {
        match event {
            Some(Event::Transcript { transcript, .. }) => transcript.text,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_window_yields_one_final_transcript() {
        let (mut recognizer, frame_tx) = recognizer("hey lark", None);
        let (tx, mut rx) = mpsc::channel(16);
        recognizer.start(BackendSink::new(2, tx)).unwrap();
        assert!(matches!(rx.recv().await, Some(Event::BackendReady { generation: 2 })));

        frame_tx.send(vec![100; 800]).await.unwrap();
        frame_tx.send(vec![100; 800]).await.unwrap();

        match rx.recv().await {
            Some(Event::Transcript {
                generation,
                transcript,
            }) => {
                assert_eq!(generation, 2);
                assert!(transcript.is_final);
                assert_eq!(transcript.text, "hey lark");
                assert_eq!(transcript.confidence, 0.75);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_speech_result_is_dropped_and_capture_end_reported() {
        let (mut recognizer, frame_tx) = recognizer("you", Some(0.95));
        let (tx, mut rx) = mpsc::channel(16);
        recognizer.start(BackendSink::new(1, tx)).unwrap();
        assert!(matches!(rx.recv().await, Some(Event::BackendReady { .. })));

        frame_tx.send(vec![0; 1600]).await.unwrap();
        drop(frame_tx);

        assert!(matches!(rx.recv().await, Some(Event::BackendEnded { .. })));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_window_still_arrives_first() {
        let transcriber = ScriptedTranscriber {
            replies: vec![
                ("hey lark", Duration::from_millis(500)),
                ("request backup", Duration::from_millis(50)),
            ],
            calls: AtomicUsize::new(0),
        };
        let (mut recognizer, frame_tx) = with_transcriber(Arc::new(transcriber));
        let (tx, mut rx) = mpsc::channel(16);
        recognizer.start(BackendSink::new(1, tx)).unwrap();
        assert!(matches!(rx.recv().await, Some(Event::BackendReady { .. })));

        frame_tx.send(vec![100; 1600]).await.unwrap();
        frame_tx.send(vec![100; 1600]).await.unwrap();

        assert_eq!(final_text(rx.recv().await), "hey lark");
        assert_eq!(final_text(rx.recv().await), "request backup");
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_results_precede_capture_end() {
        let transcriber = ScriptedTranscriber {
            replies: vec![("lock the door", Duration::from_millis(300))],
            calls: AtomicUsize::new(0),
        };
        let (mut recognizer, frame_tx) = with_transcriber(Arc::new(transcriber));
        let (tx, mut rx) = mpsc::channel(16);
        recognizer.start(BackendSink::new(1, tx)).unwrap();
        assert!(matches!(rx.recv().await, Some(Event::BackendReady { .. })));

        frame_tx.send(vec![100; 1600]).await.unwrap();
        drop(frame_tx);

        assert_eq!(final_text(rx.recv().await), "lock the door");
        assert!(matches!(rx.recv().await, Some(Event::BackendEnded { .. })));
    }

    #[test]
    fn window_waits_for_a_pause_up_to_twice_its_length() {
        assert!(!window_complete(1599, 1600, true, || true));
        assert!(window_complete(1600, 1600, true, || true));
        assert!(!window_complete(1600, 1600, true, || false));
        assert!(!window_complete(3199, 1600, true, || false));
        assert!(window_complete(3200, 1600, true, || false));
        // Without VAD the length alone decides
        assert!(window_complete(1600, 1600, false, || false));
    }

    #[test]
    fn silence_has_no_speech() {
        assert!(!window_has_speech(&vec![0i16; 16_000], 16_000));
        // VAD cannot judge 44.1 kHz; let it through
        assert!(window_has_speech(&vec![0i16; 44_100], 44_100));
    }
}
