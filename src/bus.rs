//! Fan-out of pipeline state and events to external subscribers
//!
//! State-valued streams (recognition, wake, permission, diagnostics) are
//! `watch` channels: a subscriber always sees the latest value. Event streams
//! (transcripts, `VoiceEvent`s) are `broadcast` channels. Every publish is a
//! synchronous send and never blocks the state loop.

use tokio::sync::{broadcast, watch};

use crate::diagnostics::Diagnostics;
use crate::events::{MicPermission, RecognitionState, TranscriptEvent, VoiceEvent, WakeWordState};

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

pub struct EventBus {
    recognition: watch::Sender<RecognitionState>,
    wake: watch::Sender<WakeWordState>,
    permission: watch::Sender<MicPermission>,
    diagnostics: watch::Sender<Diagnostics>,
    transcripts: broadcast::Sender<TranscriptEvent>,
    events: broadcast::Sender<VoiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            recognition: watch::Sender::new(RecognitionState::default()),
            wake: watch::Sender::new(WakeWordState::default()),
            permission: watch::Sender::new(MicPermission::default()),
            diagnostics: watch::Sender::new(Diagnostics::default()),
            transcripts: broadcast::channel(EVENT_CAPACITY).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    /// Publish a recognition state and the matching `StateChange` event.
    pub fn publish_recognition(&self, state: RecognitionState) {
        let previous = self.recognition.send_replace(state);
        if previous != state {
            self.emit(VoiceEvent::StateChange { state });
        }
    }

    pub fn publish_wake(&self, state: WakeWordState) {
        self.wake.send_replace(state);
    }

    /// Returns the previous value.
    pub fn publish_permission(&self, permission: MicPermission) -> MicPermission {
        self.permission.send_replace(permission)
    }

    pub fn publish_diagnostics(&self, diagnostics: Diagnostics) {
        self.diagnostics.send_if_modified(|current| {
            if *current == diagnostics {
                false
            } else {
                *current = diagnostics;
                true
            }
        });
    }

    pub fn publish_transcript(&self, transcript: TranscriptEvent) {
        // No receivers is fine
        let _ = self.transcripts.send(transcript);
    }

    pub fn emit(&self, event: VoiceEvent) {
        log::debug!("Event: {}", event);
        let _ = self.events.send(event);
    }

    pub fn recognition(&self) -> RecognitionState {
        *self.recognition.borrow()
    }

    pub fn wake(&self) -> WakeWordState {
        *self.wake.borrow()
    }

    pub fn permission(&self) -> MicPermission {
        *self.permission.borrow()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        *self.diagnostics.borrow()
    }

    pub fn subscribe_events(&self) -> Subscription<VoiceEvent> {
        Subscription::new(self.events.subscribe())
    }

    pub fn subscribe_transcripts(&self) -> Subscription<TranscriptEvent> {
        Subscription::new(self.transcripts.subscribe())
    }

    pub fn watch_recognition(&self) -> StateSubscription<RecognitionState> {
        StateSubscription::new(self.recognition.subscribe())
    }

    pub fn watch_wake(&self) -> StateSubscription<WakeWordState> {
        StateSubscription::new(self.wake.subscribe())
    }

    pub fn watch_permission(&self) -> StateSubscription<MicPermission> {
        StateSubscription::new(self.permission.subscribe())
    }

    pub fn watch_diagnostics(&self) -> StateSubscription<Diagnostics> {
        StateSubscription::new(self.diagnostics.subscribe())
    }
}

/// Handle on an event stream. Dropping it (or calling `unsubscribe`) detaches.
#[derive(Debug)]
pub struct Subscription<T: Clone> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything delivered so far.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

/// Handle on a state stream.
#[derive(Debug)]
pub struct StateSubscription<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> StateSubscription<T> {
    fn new(rx: watch::Receiver<T>) -> Self {
        Self { rx }
    }

    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new value, or `None` once the bus is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the value satisfies `pred`.
    pub async fn wait_for(&mut self, pred: impl FnMut(&T) -> bool) -> Option<T> {
        self.rx.wait_for(pred).await.ok().map(|v| v.clone())
    }

    pub fn unsubscribe(self) {}
}
