//! `VoiceService`: the owned handle around the state loop
//!
//! `init` spawns the single state loop task; every inbound operation becomes
//! an [`Event`] on its channel. Outbound streams come straight from the
//! [`EventBus`]. `dispose` stops capture and waits for the loop to exit.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, StateSubscription, Subscription};
use crate::diagnostics::{Diagnostics, ErrorEntry, ErrorLog};
use crate::effects::{EffectRunner, VoiceEffectRunner};
use crate::error::VoiceError;
use crate::events::{MicPermission, RecognitionState, TranscriptEvent, VoiceEvent, WakeWordState};
use crate::permission::{PermissionGate, PermissionProvider};
use crate::settings::{OptionsUpdate, VoiceSettings};
use crate::state_machine::{reduce, Event, MachineState};
use crate::transcription::BackendFactory;

/// Queue depth for the state loop
const EVENT_QUEUE_CAPACITY: usize = 100;
/// How often a denied microphone is checked for a grant made elsewhere
const PERMISSION_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Collaborators the service is built from.
pub struct ServiceDeps {
    pub factory: Arc<dyn BackendFactory>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub error_log: Arc<ErrorLog>,
    /// Connectivity at startup
    pub online: bool,
}

struct Tasks {
    state_loop: Option<JoinHandle<()>>,
    permission_forwarder: Option<JoinHandle<()>>,
    permission_monitor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Cloneable handle to a running recognition service.
#[derive(Clone)]
pub struct VoiceService {
    tx: mpsc::Sender<Event>,
    bus: Arc<EventBus>,
    gate: Arc<PermissionGate>,
    error_log: Arc<ErrorLog>,
    tasks: Arc<Mutex<Tasks>>,
}

impl VoiceService {
    /// Build the service and spawn its state loop. Must run inside a tokio runtime.
    pub fn init(settings: VoiceSettings, deps: ServiceDeps) -> Self {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(PermissionGate::new(
            deps.permissions,
            bus.clone(),
            settings.permission_timeout(),
        ));
        let runner = VoiceEffectRunner::new(
            deps.factory,
            bus.clone(),
            gate.clone(),
            deps.error_log.clone(),
        );

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let state = MachineState::new(settings, deps.online);
        let state_loop = tokio::spawn(run_state_loop(state, rx, tx.clone(), runner, bus.clone()));
        let permission_forwarder =
            tokio::spawn(forward_permission_changes(bus.watch_permission(), tx.clone()));
        let cancel = CancellationToken::new();
        let permission_monitor = gate.spawn_monitor(PERMISSION_RECHECK_INTERVAL, cancel.clone());

        log::info!("Voice service initialized (online={})", deps.online);
        Self {
            tx,
            bus,
            gate,
            error_log: deps.error_log,
            tasks: Arc::new(Mutex::new(Tasks {
                state_loop: Some(state_loop),
                permission_forwarder: Some(permission_forwarder),
                permission_monitor: Some(permission_monitor),
                cancel,
            })),
        }
    }

    async fn send(&self, event: Event) -> Result<(), VoiceError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| VoiceError::ServiceClosed)
    }

    /// Arm capture. Returns once the request is accepted; later failures
    /// arrive as state changes and events.
    pub async fn start_listening(&self) -> Result<(), VoiceError> {
        let (reply, response) = oneshot::channel();
        self.send(Event::StartListening { reply: Some(reply) })
            .await?;
        response.await.map_err(|_| VoiceError::ServiceClosed)?
    }

    pub async fn stop_listening(&self) {
        if self.send(Event::StopListening).await.is_err() {
            log::debug!("stop_listening after dispose");
        }
    }

    /// Ask for microphone access. True if granted.
    pub async fn request_microphone_permission(&self) -> bool {
        matches!(self.gate.request().await, Ok(MicPermission::Granted))
    }

    /// Report a permission change observed outside the service.
    pub fn notify_permission_change(&self, permission: MicPermission) {
        self.gate.notify_change(permission);
    }

    pub async fn update_options(&self, update: OptionsUpdate) {
        let _ = self.send(Event::UpdateOptions { update }).await;
    }

    /// Speech synthesis must bracket playback with this.
    pub async fn set_system_speaking(&self, speaking: bool) {
        let _ = self.send(Event::SetSystemSpeaking { speaking }).await;
    }

    pub async fn force_wake_word_detection(&self) {
        let _ = self.send(Event::ForceWakeWord).await;
    }

    pub async fn set_connectivity(&self, online: bool) {
        let _ = self.send(Event::ConnectivityChanged { online }).await;
    }

    pub fn subscribe_events(&self) -> Subscription<VoiceEvent> {
        self.bus.subscribe_events()
    }

    pub fn subscribe_transcripts(&self) -> Subscription<TranscriptEvent> {
        self.bus.subscribe_transcripts()
    }

    pub fn watch_recognition_state(&self) -> StateSubscription<RecognitionState> {
        self.bus.watch_recognition()
    }

    pub fn watch_wake_state(&self) -> StateSubscription<WakeWordState> {
        self.bus.watch_wake()
    }

    pub fn watch_permission(&self) -> StateSubscription<MicPermission> {
        self.bus.watch_permission()
    }

    pub fn watch_diagnostics(&self) -> StateSubscription<Diagnostics> {
        self.bus.watch_diagnostics()
    }

    pub fn recognition_state(&self) -> RecognitionState {
        self.bus.recognition()
    }

    pub fn wake_state(&self) -> WakeWordState {
        self.bus.wake()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.bus.diagnostics()
    }

    /// Most recent logged failures, newest first.
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log.recent()
    }

    /// Stop capture and shut the state loop down. Safe to call more than once.
    pub async fn dispose(&self) {
        let (state_loop, forwarder, monitor) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.cancel.cancel();
            (
                tasks.state_loop.take(),
                tasks.permission_forwarder.take(),
                tasks.permission_monitor.take(),
            )
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        let Some(state_loop) = state_loop else {
            return;
        };
        let _ = self.tx.send(Event::Dispose).await;
        if let Err(e) = state_loop.await {
            log::error!("State loop ended abnormally: {}", e);
        }
        log::info!("Voice service disposed");
    }
}

/// Single entry point for every state transition.
pub async fn run_state_loop(
    mut state: MachineState,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    bus: Arc<EventBus>,
) {
    bus.publish_diagnostics(state.diagnostics());
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);
        let exit = matches!(event, Event::Dispose);

        let (next, effects) = reduce(&state, event);
        if next.recognition != state.recognition {
            log::info!(
                "Recognition: {} -> {}",
                state.recognition,
                next.recognition
            );
        }
        if next.wake != state.wake {
            log::info!("Wake word: {:?} -> {:?}", state.wake, next.wake);
        }
        state = next;

        for effect in effects {
            effect_runner.spawn(effect, tx.clone());
        }
        bus.publish_diagnostics(state.diagnostics());

        if exit {
            log::info!("Dispose requested, shutting down state loop");
            break;
        }
    }

    log::info!("State loop ended");
}

async fn forward_permission_changes(
    mut updates: StateSubscription<MicPermission>,
    tx: mpsc::Sender<Event>,
) {
    while let Some(permission) = updates.changed().await {
        if tx
            .send(Event::PermissionChanged { permission })
            .await
            .is_err()
        {
            break;
        }
    }
}
