//! Effect runner
//!
//! Executes the effects produced by the state machine. Backend and timer
//! effects are applied in order, synchronously, so a stop always releases
//! the device before the next start takes it. Opening or closing a device
//! can block, so on a multi-threaded runtime those run under
//! `block_in_place` and other tasks move off the worker meanwhile. Anything
//! that waits (permission prompts, timers, staggered dispatch) runs on its
//! own task and reports back as an event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::diagnostics::{ErrorEntry, ErrorLog};
use crate::events::VoiceEvent;
use crate::permission::PermissionGate;
use crate::state_machine::{Effect, Event, Timer, TimerSlot};
use crate::transcription::{BackendFactory, BackendKind, BackendSink, TranscriptionBackend};

/// Runs effects; completion events go back through `tx`.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

pub struct VoiceEffectRunner {
    factory: Arc<dyn BackendFactory>,
    backend: Mutex<Option<Box<dyn TranscriptionBackend>>>,
    timers: Mutex<HashMap<TimerSlot, CancellationToken>>,
    bus: Arc<EventBus>,
    gate: Arc<PermissionGate>,
    error_log: Arc<ErrorLog>,
}

/// State here is only touched from the state loop; a poisoned lock still holds valid data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run device work that may block without stalling the worker thread.
fn blocking_section<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl VoiceEffectRunner {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        bus: Arc<EventBus>,
        gate: Arc<PermissionGate>,
        error_log: Arc<ErrorLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            backend: Mutex::new(None),
            timers: Mutex::new(HashMap::new()),
            bus,
            gate,
            error_log,
        })
    }

    fn start_backend(&self, kind: BackendKind, generation: u64, reinit: bool, tx: mpsc::Sender<Event>) {
        let mut slot = lock(&self.backend);

        if let Some(current) = slot.as_mut() {
            current.stop();
        }
        let reuse = !reinit && slot.as_ref().is_some_and(|b| b.kind() == kind);
        if !reuse {
            if reinit {
                log::info!("Rebuilding {} backend", kind);
            }
            // Drop the old instance before the new one exists
            *slot = None;
            *slot = Some(self.factory.create(kind));
        }

        let Some(backend) = slot.as_mut() else {
            return;
        };
        let sink = BackendSink::new(generation, tx);
        log::info!("Starting {} backend (generation {})", kind, generation);
        if let Err(e) = backend.start(sink.clone()) {
            log::warn!("Backend failed to start: {}", e);
            tokio::spawn(async move {
                sink.error(e.kind(), e.to_string()).await;
            });
        }
    }

    fn stop_backend(&self) {
        if let Some(backend) = lock(&self.backend).as_mut() {
            backend.stop();
        }
    }

    fn start_timer(&self, timer: Timer, after: Duration, tx: mpsc::Sender<Event>) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.timers).insert(timer.slot(), token.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    log::debug!("Timer {:?} elapsed", timer);
                    let _ = tx.send(timer.event()).await;
                }
            }
        });
    }

    fn cancel_timer(&self, slot: TimerSlot) {
        if let Some(token) = lock(&self.timers).remove(&slot) {
            token.cancel();
        }
    }

    fn cancel_all_timers(&self) {
        for (_, token) in lock(&self.timers).drain() {
            token.cancel();
        }
    }

    /// First command goes out now; the rest follow `stagger` apart unless cancelled.
    fn dispatch(&self, commands: Vec<String>, stagger: Duration) {
        let mut commands = commands.into_iter();
        let Some(first) = commands.next() else {
            return;
        };
        log::info!("Command detected: {}", first);
        self.bus.emit(VoiceEvent::CommandDetected { command: first });

        let rest: Vec<String> = commands.collect();
        if rest.is_empty() {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.timers).insert(TimerSlot::Dispatch, token.clone()) {
            previous.cancel();
        }
        let bus = self.bus.clone();
        tokio::spawn(async move {
            for command in rest {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        log::debug!("Command dispatch cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(stagger) => {}
                }
                log::info!("Command detected: {}", command);
                bus.emit(VoiceEvent::CommandDetected { command });
            }
        });
    }
}

impl EffectRunner for VoiceEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::RequestPermission { generation } => {
                let gate = self.gate.clone();
                tokio::spawn(async move {
                    let outcome = gate.request().await;
                    let _ = tx
                        .send(Event::PermissionResolved {
                            generation,
                            outcome,
                        })
                        .await;
                });
            }

            Effect::StartBackend {
                kind,
                generation,
                reinit,
            } => blocking_section(|| self.start_backend(kind, generation, reinit, tx)),

            Effect::StopBackend => blocking_section(|| self.stop_backend()),

            Effect::StartTimer { timer, after } => self.start_timer(timer, after, tx),
            Effect::CancelTimer(slot) => self.cancel_timer(slot),
            Effect::CancelAllTimers => self.cancel_all_timers(),

            Effect::DispatchCommands { commands, stagger } => self.dispatch(commands, stagger),

            Effect::PublishTranscript(transcript) => self.bus.publish_transcript(transcript),
            Effect::Recognition(state) => self.bus.publish_recognition(state),
            Effect::WakeState(state) => self.bus.publish_wake(state),
            Effect::Emit(event) => self.bus.emit(event),

            Effect::RecordError {
                kind,
                message,
                attempts,
                successes,
            } => {
                let entry = ErrorEntry::new(kind, message, attempts, successes);
                if let Err(e) = self.error_log.append(entry) {
                    log::warn!("Failed to write error log: {}", e);
                }
            }

            Effect::Respond { reply, result } => {
                let _ = reply.send(result);
            }
        }
    }
}

impl Drop for VoiceEffectRunner {
    fn drop(&mut self) {
        self.cancel_all_timers();
        self.stop_backend();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, VoiceError};
    use crate::events::{MicPermission, RecognitionState};
    use crate::permission::PermissionProvider;
    use futures_util::future::{self, BoxFuture};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Counts {
        created: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct CountingBackend {
        kind: BackendKind,
        counts: Arc<Counts>,
        fail_start: bool,
    }

    impl TranscriptionBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn start(&mut self, _sink: BackendSink) -> Result<(), VoiceError> {
            self.counts.started.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(VoiceError::backend(ErrorKind::DeviceBusy, "in use"));
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.counts.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        counts: Arc<Counts>,
        fail_start: bool,
    }

    impl BackendFactory for CountingFactory {
        fn create(&self, kind: BackendKind) -> Box<dyn TranscriptionBackend> {
            self.counts.created.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingBackend {
                kind,
                counts: self.counts.clone(),
                fail_start: self.fail_start,
            })
        }
    }

    struct AlwaysGranted;

    impl PermissionProvider for AlwaysGranted {
        fn query(&self) -> BoxFuture<'static, Option<MicPermission>> {
            Box::pin(future::ready(Some(MicPermission::Granted)))
        }

        fn prompt(&self) -> BoxFuture<'static, Result<MicPermission, ErrorKind>> {
            Box::pin(future::ready(Ok(MicPermission::Granted)))
        }
    }

    fn runner_with(factory: Arc<dyn BackendFactory>) -> (Arc<VoiceEffectRunner>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(PermissionGate::new(
            Arc::new(AlwaysGranted),
            bus.clone(),
            Duration::from_secs(10),
        ));
        let runner = VoiceEffectRunner::new(factory, bus.clone(), gate, Arc::new(ErrorLog::in_memory()));
        (runner, bus)
    }

    fn make_runner(fail_start: bool) -> (Arc<VoiceEffectRunner>, Arc<Counts>, Arc<EventBus>) {
        let counts = Arc::new(Counts::default());
        let factory = CountingFactory {
            counts: counts.clone(),
            fail_start,
        };
        let (runner, bus) = runner_with(Arc::new(factory));
        (runner, counts, bus)
    }

    /// Device open that blocks until another task lets it through.
    struct SlowOpenBackend {
        entered: Option<tokio::sync::oneshot::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        opened: Arc<AtomicBool>,
    }

    impl TranscriptionBackend for SlowOpenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Batch
        }

        fn start(&mut self, _sink: BackendSink) -> Result<(), VoiceError> {
            if let Some(entered) = self.entered.take() {
                let _ = entered.send(());
            }
            let release = lock(&self.release).recv_timeout(Duration::from_secs(5));
            self.opened.store(release.is_ok(), Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct SlowOpenFactory(Mutex<Option<SlowOpenBackend>>);

    impl BackendFactory for SlowOpenFactory {
        fn create(&self, _kind: BackendKind) -> Box<dyn TranscriptionBackend> {
            let backend = lock(&self.0).take().expect("single backend");
            Box::new(backend)
        }
    }

    fn start(kind: BackendKind, generation: u64, reinit: bool) -> Effect {
        Effect::StartBackend {
            kind,
            generation,
            reinit,
        }
    }

    #[tokio::test]
    async fn soft_restart_reuses_instance_and_reinit_rebuilds() {
        let (runner, counts, _bus) = make_runner(false);
        let (tx, _rx) = mpsc::channel(8);

        runner.spawn(start(BackendKind::Batch, 1, false), tx.clone());
        runner.spawn(start(BackendKind::Batch, 2, false), tx.clone());
        assert_eq!(counts.created.load(Ordering::SeqCst), 1);
        assert_eq!(counts.started.load(Ordering::SeqCst), 2);

        runner.spawn(start(BackendKind::Batch, 3, true), tx.clone());
        assert_eq!(counts.created.load(Ordering::SeqCst), 2);

        runner.spawn(start(BackendKind::Streaming, 4, false), tx);
        assert_eq!(counts.created.load(Ordering::SeqCst), 3);
        // Every start stopped the previous capture first
        assert_eq!(counts.stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn blocking_device_open_leaves_other_tasks_running() {
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let opened = Arc::new(AtomicBool::new(false));
        let factory = SlowOpenFactory(Mutex::new(Some(SlowOpenBackend {
            entered: Some(entered_tx),
            release: Mutex::new(release_rx),
            opened: opened.clone(),
        })));
        let (runner, _bus) = runner_with(Arc::new(factory));

        // Only runs if the single worker is not stuck inside the open
        let releaser = tokio::spawn(async move {
            let _ = entered_rx.await;
            let _ = release_tx.send(());
        });
        let (tx, _rx) = mpsc::channel(8);
        tokio::spawn(async move {
            runner.spawn(start(BackendKind::Batch, 1, false), tx);
        })
        .await
        .unwrap();
        releaser.await.unwrap();

        assert!(opened.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_start_reports_through_sink() {
        let (runner, _counts, _bus) = make_runner(true);
        let (tx, mut rx) = mpsc::channel(8);
        runner.spawn(start(BackendKind::Batch, 5, false), tx);

        match rx.recv().await {
            Some(Event::BackendError {
                generation, kind, ..
            }) => {
                assert_eq!(generation, 5);
                assert_eq!(kind, ErrorKind::DeviceBusy);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (runner, _counts, _bus) = make_runner(false);
        let (tx, mut rx) = mpsc::channel(8);
        let episode = Uuid::new_v4();

        runner.spawn(
            Effect::StartTimer {
                timer: Timer::CommandCapture(episode),
                after: Duration::from_millis(5000),
            },
            tx.clone(),
        );
        runner.spawn(Effect::CancelTimer(TimerSlot::CommandCapture), tx.clone());

        let ticket = Uuid::new_v4();
        runner.spawn(
            Effect::StartTimer {
                timer: Timer::Cooldown(ticket),
                after: Duration::from_millis(1000),
            },
            tx,
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(rx.try_recv(), Ok(Event::CooldownElapsed { ticket: t }) if t == ticket));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_staggers_commands_in_order() {
        let (runner, _counts, bus) = make_runner(false);
        let mut events = bus.subscribe_events();
        let (tx, _rx) = mpsc::channel(8);

        runner.spawn(
            Effect::DispatchCommands {
                commands: vec!["read miranda rights".into(), "request backup".into()],
                stagger: Duration::from_millis(300),
            },
            tx,
        );
        assert_eq!(
            events.try_recv(),
            Some(VoiceEvent::CommandDetected {
                command: "read miranda rights".into()
            })
        );
        assert_eq!(events.try_recv(), None);

        let started = tokio::time::Instant::now();
        assert_eq!(
            events.recv().await,
            Some(VoiceEvent::CommandDetected {
                command: "request backup".into()
            })
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(310));
    }

    #[tokio::test]
    async fn state_effects_publish_on_bus() {
        let (runner, _counts, bus) = make_runner(false);
        let mut events = bus.subscribe_events();
        let (tx, _rx) = mpsc::channel(8);
        runner.spawn(Effect::Recognition(RecognitionState::Listening), tx);
        assert_eq!(bus.recognition(), RecognitionState::Listening);
        assert_eq!(
            events.try_recv(),
            Some(VoiceEvent::StateChange {
                state: RecognitionState::Listening
            })
        );
    }
}
