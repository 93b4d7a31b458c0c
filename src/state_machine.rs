//! Recognition state machine
//!
//! Single-writer design: every input (API calls, backend reports, timers,
//! permission changes) becomes an [`Event`] on one channel, and `reduce()`
//! turns `(state, event)` into the next state plus a list of [`Effect`]s for
//! the effect runner. `reduce()` never performs I/O.
//!
//! Backend events carry the generation they were started under. The
//! generation moves on every start, stop, failure, restart and backend
//! switch, so anything a previous backend delivers late is dropped.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backoff::{AttemptStats, BackoffPolicy, RestartPlan, RetryTracker};
use crate::diagnostics::Diagnostics;
use crate::error::{ErrorKind, VoiceError};
use crate::events::{MicPermission, RecognitionState, TranscriptEvent, VoiceEvent, WakeWordState};
use crate::segmenter::CommandSegmenter;
use crate::settings::{OptionsUpdate, VoiceSettings};
use crate::transcription::{select_backend, BackendKind};
use crate::wake_word::{contains_phrase, WakeWordMatcher};

pub type Reply = oneshot::Sender<Result<(), VoiceError>>;

#[derive(Debug)]
pub enum Event {
    StartListening {
        reply: Option<Reply>,
    },
    StopListening,
    /// Shut down: stop everything, then the state loop exits
    Dispose,

    /// Outcome of a permission request started for `generation`
    PermissionResolved {
        generation: u64,
        outcome: Result<MicPermission, ErrorKind>,
    },
    /// Permission changed outside of our own request
    PermissionChanged {
        permission: MicPermission,
    },

    // Backend reports
    BackendReady {
        generation: u64,
    },
    Transcript {
        generation: u64,
        transcript: TranscriptEvent,
    },
    BackendError {
        generation: u64,
        kind: ErrorKind,
        message: String,
    },
    BackendEnded {
        generation: u64,
    },

    // Timers (ids prevent stale firings)
    CommandTimeout {
        episode: Uuid,
    },
    RetryElapsed {
        retry: Uuid,
    },
    CooldownElapsed {
        ticket: Uuid,
    },

    SetSystemSpeaking {
        speaking: bool,
    },
    ConnectivityChanged {
        online: bool,
    },
    UpdateOptions {
        update: OptionsUpdate,
    },
    /// Test hook: behave as if the wake phrase was just heard
    ForceWakeWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    CommandCapture,
    Retry,
    Cooldown,
    /// Staggered delivery of a multi-command batch
    Dispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    CommandCapture(Uuid),
    Retry(Uuid),
    Cooldown(Uuid),
}

impl Timer {
    pub fn slot(&self) -> TimerSlot {
        match self {
            Timer::CommandCapture(_) => TimerSlot::CommandCapture,
            Timer::Retry(_) => TimerSlot::Retry,
            Timer::Cooldown(_) => TimerSlot::Cooldown,
        }
    }

    /// The event delivered when the timer fires.
    pub fn event(&self) -> Event {
        match *self {
            Timer::CommandCapture(episode) => Event::CommandTimeout { episode },
            Timer::Retry(retry) => Event::RetryElapsed { retry },
            Timer::Cooldown(ticket) => Event::CooldownElapsed { ticket },
        }
    }
}

#[derive(Debug)]
pub enum Effect {
    RequestPermission {
        generation: u64,
    },
    /// Start capture on a backend of `kind`. `reinit` discards the current
    /// instance and builds a fresh one.
    StartBackend {
        kind: BackendKind,
        generation: u64,
        reinit: bool,
    },
    StopBackend,
    StartTimer {
        timer: Timer,
        after: Duration,
    },
    CancelTimer(TimerSlot),
    CancelAllTimers,
    /// Emit one `CommandDetected` per command, `stagger` apart
    DispatchCommands {
        commands: Vec<String>,
        stagger: Duration,
    },
    PublishTranscript(TranscriptEvent),
    Recognition(RecognitionState),
    WakeState(WakeWordState),
    Emit(VoiceEvent),
    RecordError {
        kind: ErrorKind,
        message: String,
        attempts: u32,
        successes: u32,
    },
    Respond {
        reply: Reply,
        result: Result<(), VoiceError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Restart,
    Reinitialize,
    Reprompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRetry {
    pub id: Uuid,
    pub action: RetryAction,
}

#[derive(Debug, Clone)]
pub struct MachineState {
    pub recognition: RecognitionState,
    pub wake: WakeWordState,
    pub permission: MicPermission,
    pub online: bool,
    /// Backend kind currently started, if any
    pub backend: Option<BackendKind>,
    pub generation: u64,
    /// Set by `StopListening`; blocks every automatic restart
    pub manual_stop: bool,
    pub system_speaking: bool,
    /// Current command-capture window
    pub episode: Option<Uuid>,
    /// Processing guard ticket
    pub processing: Option<Uuid>,
    pub stats: AttemptStats,
    pub retry: RetryTracker,
    pub pending_retry: Option<PendingRetry>,
    /// `PermissionRequired` was surfaced; an out-of-band grant re-arms capture
    pub awaiting_grant: bool,
    pub settings: VoiceSettings,
    pub matcher: WakeWordMatcher,
    pub segmenter: CommandSegmenter,
    policy: BackoffPolicy,
}

impl MachineState {
    pub fn new(settings: VoiceSettings, online: bool) -> Self {
        let matcher = WakeWordMatcher::new(
            &settings.wake_words,
            settings.sensitivity,
            settings.duplicate_window_ms,
        );
        Self {
            recognition: RecognitionState::Inactive,
            wake: WakeWordState::Inactive,
            permission: MicPermission::Unknown,
            online,
            backend: None,
            generation: 0,
            manual_stop: false,
            system_speaking: false,
            episode: None,
            processing: None,
            stats: AttemptStats::default(),
            retry: RetryTracker::default(),
            pending_retry: None,
            awaiting_grant: false,
            policy: settings.backoff_policy(),
            matcher,
            segmenter: CommandSegmenter::default(),
            settings,
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            stats: self.stats,
            reinit_count: self.retry.reinit_count(),
            generation: self.generation,
        }
    }

    fn preferred_backend(&self) -> BackendKind {
        select_backend(self.online, self.settings.offline_mode)
    }

    fn set_recognition(&mut self, next: RecognitionState, effects: &mut Vec<Effect>) {
        if self.recognition != next {
            self.recognition = next;
            effects.push(Effect::Recognition(next));
        }
    }

    /// Leave any wake episode, cancelling its timer first.
    fn end_episode(&mut self, effects: &mut Vec<Effect>) {
        if self.episode.take().is_some() {
            effects.push(Effect::CancelTimer(TimerSlot::CommandCapture));
        }
        if self.wake != WakeWordState::Inactive {
            self.wake = WakeWordState::Inactive;
            effects.push(Effect::WakeState(WakeWordState::Inactive));
        }
    }

    fn release_processing(&mut self, effects: &mut Vec<Effect>) {
        if self.processing.take().is_some() {
            effects.push(Effect::CancelTimer(TimerSlot::Cooldown));
            effects.push(Effect::CancelTimer(TimerSlot::Dispatch));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.recognition.is_running() && !self.manual_stop
    }

    fn has_priority_keyword(&self, text: &str) -> bool {
        self.settings
            .priority_keywords
            .iter()
            .any(|k| contains_phrase(text, k))
    }
}

/// Reducer: `(state, event) -> (next_state, effects)`.
pub fn reduce(state: &MachineState, event: Event) -> (MachineState, Vec<Effect>) {
    let mut next = state.clone();
    let mut effects = Vec::new();

    match event {
        Event::StartListening { reply } => {
            let result = start(&mut next, &mut effects);
            if let Some(reply) = reply {
                effects.push(Effect::Respond { reply, result });
            }
        }

        Event::StopListening | Event::Dispose => stop(&mut next, &mut effects),

        Event::PermissionResolved {
            generation,
            outcome,
        } => {
            if !next.is_current(generation) || next.recognition != RecognitionState::Active {
                log::debug!("Dropping stale permission result (generation {})", generation);
                return (next, effects);
            }
            match outcome {
                Ok(MicPermission::Granted) => {
                    next.permission = MicPermission::Granted;
                    let kind = next.preferred_backend();
                    next.backend = Some(kind);
                    effects.push(Effect::StartBackend {
                        kind,
                        generation: next.generation,
                        reinit: false,
                    });
                }
                Ok(other) => {
                    next.permission = other;
                    fail(
                        &mut next,
                        &mut effects,
                        ErrorKind::PermissionDenied,
                        format!("microphone permission is {:?}", other),
                        false,
                    );
                }
                Err(kind) => fail(
                    &mut next,
                    &mut effects,
                    kind,
                    format!("microphone permission request failed: {}", kind),
                    false,
                ),
            }
        }

        Event::PermissionChanged { permission } => {
            next.permission = permission;
            match permission {
                MicPermission::Granted
                    if next.awaiting_grant
                        && !next.manual_stop
                        && next.recognition == RecognitionState::Error =>
                {
                    log::info!("Microphone access granted, resuming capture");
                    next.awaiting_grant = false;
                    next.generation += 1;
                    next.stats.attempts = 0;
                    next.retry.reset();
                    next.set_recognition(RecognitionState::Active, &mut effects);
                    let kind = next.preferred_backend();
                    next.backend = Some(kind);
                    effects.push(Effect::StartBackend {
                        kind,
                        generation: next.generation,
                        reinit: false,
                    });
                }
                MicPermission::Denied if next.recognition.is_running() && !next.manual_stop => {
                    fail(
                        &mut next,
                        &mut effects,
                        ErrorKind::PermissionDenied,
                        "microphone permission revoked".to_string(),
                        false,
                    );
                }
                _ => {}
            }
        }

        Event::BackendReady { generation } => {
            if next.is_current(generation) {
                log::info!("Backend ready (generation {})", generation);
                if next.recognition == RecognitionState::Active {
                    next.set_recognition(RecognitionState::Listening, &mut effects);
                }
            }
        }

        Event::Transcript {
            generation,
            transcript,
        } => {
            if !next.is_current(generation) {
                log::debug!(
                    "Dropping transcript from generation {} (current {})",
                    generation,
                    next.generation
                );
                return (next, effects);
            }
            on_transcript(&mut next, &mut effects, transcript);
        }

        Event::BackendError {
            generation,
            kind,
            message,
        } => {
            if next.is_current(generation) {
                fail(&mut next, &mut effects, kind, message, false);
            }
        }

        Event::BackendEnded { generation } => {
            if next.is_current(generation) {
                fail(
                    &mut next,
                    &mut effects,
                    ErrorKind::Aborted,
                    "recognition stream ended".to_string(),
                    true,
                );
            }
        }

        Event::CommandTimeout { episode } => {
            if next.episode == Some(episode) {
                // Silent by design: no event, only the wake state goes back
                log::debug!("Command window {} elapsed without a command", episode);
                next.episode = None;
                next.wake = WakeWordState::Inactive;
                effects.push(Effect::WakeState(WakeWordState::Inactive));
            }
        }

        Event::RetryElapsed { retry } => {
            let Some(pending) = next.pending_retry.filter(|p| p.id == retry) else {
                return (next, effects);
            };
            next.pending_retry = None;
            if next.manual_stop || next.recognition != RecognitionState::Active {
                return (next, effects);
            }
            next.generation += 1;
            match pending.action {
                RetryAction::Reprompt => {
                    effects.push(Effect::RequestPermission {
                        generation: next.generation,
                    });
                }
                RetryAction::Restart | RetryAction::Reinitialize => {
                    let kind = next.preferred_backend();
                    next.backend = Some(kind);
                    effects.push(Effect::StartBackend {
                        kind,
                        generation: next.generation,
                        reinit: pending.action == RetryAction::Reinitialize,
                    });
                }
            }
        }

        Event::CooldownElapsed { ticket } => {
            if next.processing == Some(ticket) {
                next.processing = None;
                if next.recognition == RecognitionState::Processing {
                    next.set_recognition(RecognitionState::Listening, &mut effects);
                }
            }
        }

        Event::SetSystemSpeaking { speaking } => {
            next.system_speaking = speaking;
        }

        Event::ConnectivityChanged { online } => {
            next.online = online;
            switch_backend_if_needed(&mut next, &mut effects);
        }

        Event::UpdateOptions { update } => {
            let offline_changed = next.settings.apply(update);
            next.matcher.reconfigure(
                &next.settings.wake_words,
                next.settings.sensitivity,
                next.settings.duplicate_window_ms,
            );
            if offline_changed {
                switch_backend_if_needed(&mut next, &mut effects);
            }
        }

        Event::ForceWakeWord => {
            if next.recognition == RecognitionState::Listening {
                next.matcher.mark_accepted(Utc::now());
                wake_detected(&mut next, &mut effects);
            } else {
                log::debug!("Forced wake ignored in {:?}", next.recognition);
            }
        }
    }

    (next, effects)
}

fn start(state: &mut MachineState, effects: &mut Vec<Effect>) -> Result<(), VoiceError> {
    if !matches!(
        state.recognition,
        RecognitionState::Inactive | RecognitionState::Error
    ) {
        return Err(VoiceError::AlreadyListening);
    }

    state.generation += 1;
    state.manual_stop = false;
    state.awaiting_grant = false;
    state.pending_retry = None;
    state.stats.attempts = 0;
    state.retry.reset();
    state.set_recognition(RecognitionState::Active, effects);
    effects.push(Effect::RequestPermission {
        generation: state.generation,
    });
    Ok(())
}

fn stop(state: &mut MachineState, effects: &mut Vec<Effect>) {
    state.manual_stop = true;
    state.generation += 1;
    state.pending_retry = None;
    state.awaiting_grant = false;
    state.episode = None;
    state.processing = None;
    state.backend = None;

    effects.push(Effect::StopBackend);
    effects.push(Effect::CancelAllTimers);
    if state.wake != WakeWordState::Inactive {
        state.wake = WakeWordState::Inactive;
        effects.push(Effect::WakeState(WakeWordState::Inactive));
    }
    state.set_recognition(RecognitionState::Inactive, effects);
}

fn on_transcript(state: &mut MachineState, effects: &mut Vec<Effect>, transcript: TranscriptEvent) {
    let text = transcript.text.trim();
    if text.is_empty() {
        return;
    }

    let wake_present = state.matcher.contains_wake_phrase(text);
    let urgent = state.has_priority_keyword(text);

    // Keep the assistant from hearing its own voice. An open command window
    // means the operator already interrupted it.
    let episode_open = state.wake != WakeWordState::Inactive;
    if state.system_speaking && !episode_open && !wake_present && !urgent {
        log::debug!("Suppressed transcript while system is speaking");
        return;
    }

    if state.recognition == RecognitionState::Active {
        state.set_recognition(RecognitionState::Listening, effects);
    }
    state.stats.record_success(transcript.confidence);
    state.retry.reset();

    effects.push(Effect::PublishTranscript(transcript.clone()));
    effects.push(Effect::Emit(VoiceEvent::InterimTranscript {
        text: text.to_string(),
        confidence: transcript.confidence,
        is_final: transcript.is_final,
    }));

    if !transcript.is_final {
        return;
    }

    if state.processing.is_some() {
        log::debug!("Final transcript ignored while a command is processing");
        return;
    }

    // Operator interrupting synthesized speech
    if state.system_speaking && urgent && !wake_present {
        log::info!("Priority command while system is speaking");
        process_command(state, effects, text);
        return;
    }

    match state.wake {
        WakeWordState::Inactive => {
            let Some(found) = state
                .matcher
                .detect(text, transcript.confidence, transcript.timestamp)
            else {
                return;
            };
            log::info!(
                "Wake phrase '{}' detected (score {:.2}{})",
                found.phrase,
                found.score,
                if found.emergency { ", emergency" } else { "" }
            );
            wake_detected(state, effects);
            if !found.remainder.is_empty() {
                process_command(state, effects, &found.remainder);
            }
        }
        WakeWordState::Detected | WakeWordState::ListeningForCommand => {
            let command = state.matcher.strip_wake_phrase(text);
            if command.is_empty() {
                log::debug!("Repeated wake phrase ignored");
                return;
            }
            process_command(state, effects, &command);
        }
    }
}

fn wake_detected(state: &mut MachineState, effects: &mut Vec<Effect>) {
    if state.wake != WakeWordState::Inactive {
        return;
    }
    let episode = Uuid::new_v4();
    state.episode = Some(episode);
    state.wake = WakeWordState::ListeningForCommand;

    effects.push(Effect::WakeState(WakeWordState::Detected));
    effects.push(Effect::Emit(VoiceEvent::WakeWordDetected));
    effects.push(Effect::WakeState(WakeWordState::ListeningForCommand));
    effects.push(Effect::StartTimer {
        timer: Timer::CommandCapture(episode),
        after: state.settings.command_timeout(),
    });
}

fn process_command(state: &mut MachineState, effects: &mut Vec<Effect>, command: &str) {
    if state.processing.is_some() {
        log::debug!("Duplicate command '{}' dropped", command);
        return;
    }

    let commands = state.segmenter.segment(command);
    if commands.is_empty() {
        return;
    }
    state.end_episode(effects);

    let ticket = Uuid::new_v4();
    state.processing = Some(ticket);
    state.set_recognition(RecognitionState::Processing, effects);

    let stagger = state.settings.command_stagger();
    let hold = stagger * (commands.len() as u32 - 1) + state.settings.processing_cooldown();
    log::info!("Dispatching {} command(s)", commands.len());

    effects.push(Effect::DispatchCommands { commands, stagger });
    effects.push(Effect::StartTimer {
        timer: Timer::Cooldown(ticket),
        after: hold,
    });
}

/// Classify a failure and schedule recovery.
///
/// `silent` failures (a stream that simply ended) are retried without an
/// `Error` event or a log entry.
fn fail(
    state: &mut MachineState,
    effects: &mut Vec<Effect>,
    kind: ErrorKind,
    message: String,
    silent: bool,
) {
    let attempts = state.stats.record_failure();
    let plan = state.retry.plan(kind, attempts, &state.policy);

    state.generation += 1;
    state.end_episode(effects);
    state.release_processing(effects);
    if state.backend.take().is_some() {
        effects.push(Effect::StopBackend);
    }
    if let Some(prev) = state.pending_retry.take() {
        log::debug!("Superseding pending retry {}", prev.id);
        effects.push(Effect::CancelTimer(TimerSlot::Retry));
    }

    if silent {
        log::info!("{}; restarting", message);
    } else {
        log::warn!("Recognition failed ({}): {} [plan {:?}]", kind, message, plan);
        effects.push(Effect::RecordError {
            kind,
            message: message.clone(),
            attempts,
            successes: state.stats.successes,
        });
    }

    let (action, delay) = match plan {
        RestartPlan::Surface => {
            state.set_recognition(RecognitionState::Error, effects);
            if kind.is_permission() {
                state.awaiting_grant = true;
                effects.push(Effect::Emit(VoiceEvent::PermissionRequired));
            } else {
                effects.push(Effect::Emit(VoiceEvent::Error {
                    kind,
                    message,
                    recoverable: false,
                }));
            }
            return;
        }
        RestartPlan::Restart { delay } => (RetryAction::Restart, delay),
        RestartPlan::Reinitialize { delay } => (RetryAction::Reinitialize, delay),
        RestartPlan::Reprompt { delay } => (RetryAction::Reprompt, delay),
    };

    state.set_recognition(RecognitionState::Active, effects);
    if !silent {
        let event = if kind.is_permission() {
            VoiceEvent::PermissionRequired
        } else {
            VoiceEvent::Error {
                kind,
                message,
                recoverable: true,
            }
        };
        effects.push(Effect::Emit(event));
    }

    let id = Uuid::new_v4();
    state.pending_retry = Some(PendingRetry { id, action });
    effects.push(Effect::StartTimer {
        timer: Timer::Retry(id),
        after: delay,
    });
}

/// Restart capture on the other backend when connectivity or offline mode
/// changes the preferred one. Never hot-swaps: full stop, then start.
fn switch_backend_if_needed(state: &mut MachineState, effects: &mut Vec<Effect>) {
    let preferred = state.preferred_backend();
    let Some(current) = state.backend else {
        return;
    };
    if current == preferred || !state.recognition.is_running() || state.manual_stop {
        return;
    }

    log::info!("Switching backend {} -> {}", current, preferred);
    state.generation += 1;
    state.end_episode(effects);
    state.release_processing(effects);
    state.set_recognition(RecognitionState::Active, effects);
    state.backend = Some(preferred);
    effects.push(Effect::StopBackend);
    effects.push(Effect::StartBackend {
        kind: preferred,
        generation: state.generation,
        reinit: true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listening() -> MachineState {
        let state = MachineState::new(VoiceSettings::default(), true);
        let (state, _) = reduce(&state, Event::StartListening { reply: None });
        let (state, _) = reduce(
            &state,
            Event::PermissionResolved {
                generation: state.generation,
                outcome: Ok(MicPermission::Granted),
            },
        );
        let (state, _) = reduce(
            &state,
            Event::BackendReady {
                generation: state.generation,
            },
        );
        assert_eq!(state.recognition, RecognitionState::Listening);
        state
    }

    fn transcript(state: &MachineState, text: &str, is_final: bool) -> (MachineState, Vec<Effect>) {
        let transcript = if is_final {
            TranscriptEvent::final_result(text, 0.9)
        } else {
            TranscriptEvent::interim(text, 0.9)
        };
        reduce(
            state,
            Event::Transcript {
                generation: state.generation,
                transcript,
            },
        )
    }

    fn emitted(effects: &[Effect]) -> Vec<&VoiceEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn dispatched(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::DispatchCommands { commands, .. } => Some(commands.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn start_arms_and_requests_permission() {
        let state = MachineState::new(VoiceSettings::default(), true);
        let (next, effects) = reduce(&state, Event::StartListening { reply: None });
        assert_eq!(next.recognition, RecognitionState::Active);
        assert_eq!(next.generation, 1);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::RequestPermission { generation: 1 })));
    }

    #[test]
    fn start_while_running_is_rejected() {
        let state = listening();
        let (tx, mut rx) = oneshot::channel();
        let (next, effects) = reduce(&state, Event::StartListening { reply: Some(tx) });
        assert_eq!(next.generation, state.generation);
        for effect in effects {
            if let Effect::Respond { reply, result } = effect {
                let _ = reply.send(result);
            }
        }
        assert_eq!(rx.try_recv().unwrap(), Err(VoiceError::AlreadyListening));
    }

    #[test]
    fn grant_starts_preferred_backend() {
        let state = MachineState::new(VoiceSettings::default(), false);
        let (state, _) = reduce(&state, Event::StartListening { reply: None });
        let (next, effects) = reduce(
            &state,
            Event::PermissionResolved {
                generation: state.generation,
                outcome: Ok(MicPermission::Granted),
            },
        );
        assert_eq!(next.backend, Some(BackendKind::Batch));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartBackend {
                kind: BackendKind::Batch,
                reinit: false,
                ..
            }
        )));
    }

    #[test]
    fn interim_transcript_never_wakes() {
        let state = listening();
        let (next, effects) = transcript(&state, "hey lark", false);
        assert_eq!(next.wake, WakeWordState::Inactive);
        assert_eq!(
            emitted(&effects),
            vec![&VoiceEvent::InterimTranscript {
                text: "hey lark".into(),
                confidence: 0.9,
                is_final: false
            }]
        );
    }

    #[test]
    fn final_wake_phrase_opens_command_window() {
        let state = listening();
        let (next, effects) = transcript(&state, "hey lark", true);
        assert_eq!(next.wake, WakeWordState::ListeningForCommand);
        assert!(next.episode.is_some());
        assert!(emitted(&effects).contains(&&VoiceEvent::WakeWordDetected));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartTimer {
                timer: Timer::CommandCapture(_),
                after
            } if *after == Duration::from_millis(5000)
        )));
    }

    #[test]
    fn wake_and_command_in_one_utterance() {
        let state = listening();
        let (next, effects) = transcript(&state, "hey lark request backup", true);
        assert_eq!(dispatched(&effects), vec!["request backup".to_string()]);
        assert_eq!(next.wake, WakeWordState::Inactive);
        assert_eq!(next.recognition, RecognitionState::Processing);
    }

    #[test]
    fn multi_command_is_segmented_and_guarded() {
        let state = listening();
        let (state, _) = transcript(&state, "hey lark", true);
        let (next, effects) = transcript(&state, "read miranda rights and request backup", true);
        assert_eq!(
            dispatched(&effects),
            vec!["read miranda rights".to_string(), "request backup".to_string()]
        );
        // Guard covers one stagger plus the cooldown
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartTimer {
                timer: Timer::Cooldown(_),
                after
            } if *after == Duration::from_millis(1300)
        )));
        // Timer cancelled before leaving ListeningForCommand
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelTimer(TimerSlot::CommandCapture))));

        let (again, effects) = transcript(&next, "request backup", true);
        assert!(dispatched(&effects).is_empty());
        assert_eq!(again.recognition, RecognitionState::Processing);
    }

    #[test]
    fn command_timeout_is_silent() {
        let state = listening();
        let (state, _) = transcript(&state, "hey lark", true);
        let episode = state.episode.unwrap();
        let (next, effects) = reduce(&state, Event::CommandTimeout { episode });
        assert_eq!(next.wake, WakeWordState::Inactive);
        assert!(emitted(&effects).is_empty());
    }

    #[test]
    fn stale_command_timeout_is_ignored() {
        let state = listening();
        let (state, _) = transcript(&state, "hey lark", true);
        let (next, effects) = reduce(
            &state,
            Event::CommandTimeout {
                episode: Uuid::new_v4(),
            },
        );
        assert_eq!(next.wake, WakeWordState::ListeningForCommand);
        assert!(effects.is_empty());
    }

    #[test]
    fn system_speech_is_suppressed_except_priority() {
        let state = listening();
        let (state, _) = reduce(&state, Event::SetSystemSpeaking { speaking: true });

        let (_, effects) = transcript(&state, "please stand by", true);
        assert!(effects.is_empty());

        let (_, effects) = transcript(&state, "read miranda rights", true);
        assert_eq!(dispatched(&effects), vec!["read miranda rights".to_string()]);
    }

    #[test]
    fn wake_phrase_interrupts_system_speech() {
        let state = listening();
        let (state, _) = reduce(&state, Event::SetSystemSpeaking { speaking: true });

        let (state, effects) = transcript(&state, "hey lark", true);
        assert_eq!(state.wake, WakeWordState::ListeningForCommand);
        assert!(emitted(&effects).contains(&&VoiceEvent::WakeWordDetected));
        assert!(state.system_speaking);

        let (next, effects) = transcript(&state, "lock the door", true);
        assert_eq!(dispatched(&effects), vec!["lock the door".to_string()]);
        assert_eq!(next.recognition, RecognitionState::Processing);
    }

    #[test]
    fn stale_generation_transcript_is_dropped() {
        let state = listening();
        let (next, effects) = reduce(
            &state,
            Event::Transcript {
                generation: state.generation - 1,
                transcript: TranscriptEvent::final_result("hey lark", 0.9),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(next.wake, WakeWordState::Inactive);
    }

    #[test]
    fn network_errors_back_off_then_reinitialize() {
        let mut state = listening();
        let mut delays = Vec::new();

        for _ in 0..4 {
            let (next, effects) = reduce(
                &state,
                Event::BackendError {
                    generation: state.generation,
                    kind: ErrorKind::NetworkError,
                    message: "connection reset".into(),
                },
            );
            assert_eq!(next.recognition, RecognitionState::Active);
            assert!(emitted(&effects).iter().any(|e| matches!(
                e,
                VoiceEvent::Error {
                    recoverable: true,
                    ..
                }
            )));
            let delay = effects
                .iter()
                .find_map(|e| match e {
                    Effect::StartTimer {
                        timer: Timer::Retry(_),
                        after,
                    } => Some(*after),
                    _ => None,
                })
                .unwrap();
            delays.push(delay);

            let retry = next.pending_retry.unwrap();
            let (next, effects) = reduce(&next, Event::RetryElapsed { retry: retry.id });
            let reinit = effects.iter().any(|e| {
                matches!(
                    e,
                    Effect::StartBackend {
                        reinit: true,
                        ..
                    }
                )
            });
            assert_eq!(reinit, retry.action == RetryAction::Reinitialize);
            state = next;
        }

        assert!(delays[0] < delays[1] && delays[1] < delays[2]);
        assert_eq!(state.retry.reinit_count(), 1);
        assert_eq!(state.diagnostics().reinit_count, 1);
    }

    #[test]
    fn stream_end_restarts_silently() {
        let state = listening();
        let (next, effects) = reduce(
            &state,
            Event::BackendEnded {
                generation: state.generation,
            },
        );
        assert!(emitted(&effects).is_empty());
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::RecordError { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartTimer {
                timer: Timer::Retry(_),
                after
            } if after.is_zero()
        )));
        assert_eq!(next.recognition, RecognitionState::Active);
    }

    #[test]
    fn permission_denied_is_terminal_and_regrant_resumes() {
        let state = MachineState::new(VoiceSettings::default(), true);
        let (state, _) = reduce(&state, Event::StartListening { reply: None });
        let (state, effects) = reduce(
            &state,
            Event::PermissionResolved {
                generation: state.generation,
                outcome: Ok(MicPermission::Denied),
            },
        );
        assert_eq!(state.recognition, RecognitionState::Error);
        assert_eq!(emitted(&effects), vec![&VoiceEvent::PermissionRequired]);
        assert!(state.pending_retry.is_none());

        let (next, effects) = reduce(
            &state,
            Event::PermissionChanged {
                permission: MicPermission::Granted,
            },
        );
        assert_eq!(next.recognition, RecognitionState::Active);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartBackend { .. })));
    }

    #[test]
    fn device_not_found_surfaces_unrecoverable_error() {
        let state = listening();
        let (next, effects) = reduce(
            &state,
            Event::BackendError {
                generation: state.generation,
                kind: ErrorKind::DeviceNotFound,
                message: "no input device".into(),
            },
        );
        assert_eq!(next.recognition, RecognitionState::Error);
        assert!(matches!(
            emitted(&effects)[..],
            [VoiceEvent::Error {
                recoverable: false,
                ..
            }]
        ));
    }

    #[test]
    fn stop_cancels_everything_and_blocks_retry() {
        let state = listening();
        let (state, _) = transcript(&state, "hey lark", true);
        let (failed, _) = reduce(
            &state,
            Event::BackendError {
                generation: state.generation,
                kind: ErrorKind::NetworkError,
                message: "reset".into(),
            },
        );
        let retry = failed.pending_retry.unwrap();

        let (stopped, effects) = reduce(&failed, Event::StopListening);
        assert_eq!(stopped.recognition, RecognitionState::Inactive);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelAllTimers)));

        let (after, effects) = reduce(&stopped, Event::RetryElapsed { retry: retry.id });
        assert!(effects.is_empty());
        assert_eq!(after.recognition, RecognitionState::Inactive);
    }

    #[test]
    fn going_offline_switches_to_batch() {
        let state = listening();
        assert_eq!(state.backend, Some(BackendKind::Streaming));
        let (next, effects) = reduce(&state, Event::ConnectivityChanged { online: false });
        assert_eq!(next.backend, Some(BackendKind::Batch));
        assert_eq!(next.recognition, RecognitionState::Active);
        assert!(next.generation > state.generation);
        // Full stop before the other backend takes the device
        let order: Vec<bool> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::StopBackend => Some(false),
                Effect::StartBackend { reinit, .. } => Some(*reinit),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![false, true]);
    }

    #[test]
    fn options_update_reconfigures_matcher() {
        let state = listening();
        let update = OptionsUpdate {
            wake_words: Some(vec!["falcon".into()]),
            ..Default::default()
        };
        let (state, _) = reduce(&state, Event::UpdateOptions { update });
        let (_, effects) = transcript(&state, "hey lark", true);
        assert!(!emitted(&effects).contains(&&VoiceEvent::WakeWordDetected));
        let (next, _) = transcript(&state, "hey falcon", true);
        assert_eq!(next.wake, WakeWordState::ListeningForCommand);
    }
}
