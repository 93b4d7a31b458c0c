//! Microphone permission negotiation
//!
//! The gate prefers a status query, falls back to a prompt under a timeout,
//! and caches a grant so later requests do not re-prompt. Every change is
//! published on the bus; the service forwards those to the state machine so
//! an out-of-band grant can re-arm capture. Grants made outside the app reach
//! the gate through [`PermissionGate::spawn_monitor`].

use futures_util::future::{self, BoxFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioError, AudioSource};
use crate::bus::EventBus;
use crate::error::ErrorKind;
use crate::events::MicPermission;

/// Platform capability for microphone access.
pub trait PermissionProvider: Send + Sync + 'static {
    /// Current status without prompting, or `None` if the platform cannot tell.
    fn query(&self) -> BoxFuture<'static, Option<MicPermission>>;
    /// Trigger the platform prompt and wait for the answer.
    fn prompt(&self) -> BoxFuture<'static, Result<MicPermission, ErrorKind>>;

    /// Change notifications pushed by the platform, if it has any.
    fn changes(&self) -> Option<mpsc::Receiver<MicPermission>> {
        None
    }

    /// Check access again without user interaction.
    fn recheck(&self) -> BoxFuture<'static, Option<MicPermission>> {
        self.query()
    }
}

/// Desktop provider: there is no status API, so prompting means opening the
/// input briefly and releasing it right away.
pub struct DevicePermissionProvider {
    source: Arc<dyn AudioSource>,
}

impl DevicePermissionProvider {
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self { source }
    }
}

async fn probe_device(source: Arc<dyn AudioSource>) -> Result<MicPermission, ErrorKind> {
    let probe = tokio::task::spawn_blocking(move || source.open().map(drop)).await;
    match probe {
        Ok(Ok(())) => Ok(MicPermission::Granted),
        // Someone holds the device, so access itself works
        Ok(Err(AudioError::DeviceBusy)) => Ok(MicPermission::Granted),
        Ok(Err(AudioError::PermissionDenied(reason))) => {
            log::warn!("Microphone access denied: {}", reason);
            Ok(MicPermission::Denied)
        }
        Ok(Err(e)) => Err(ErrorKind::from(&e)),
        Err(e) => {
            log::error!("Permission probe task failed: {}", e);
            Err(ErrorKind::Unknown)
        }
    }
}

impl PermissionProvider for DevicePermissionProvider {
    fn query(&self) -> BoxFuture<'static, Option<MicPermission>> {
        Box::pin(future::ready(None))
    }

    fn prompt(&self) -> BoxFuture<'static, Result<MicPermission, ErrorKind>> {
        Box::pin(probe_device(self.source.clone()))
    }

    /// Opening the device never shows a prompt here, so a recheck is a probe.
    fn recheck(&self) -> BoxFuture<'static, Option<MicPermission>> {
        let source = self.source.clone();
        Box::pin(async move { probe_device(source).await.ok() })
    }
}

pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    bus: Arc<EventBus>,
    timeout: Duration,
    granted: AtomicBool,
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn PermissionProvider>, bus: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            provider,
            bus,
            timeout,
            granted: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> MicPermission {
        self.bus.permission()
    }

    /// Resolve microphone access, prompting only when needed.
    pub async fn request(&self) -> Result<MicPermission, ErrorKind> {
        if let Some(status) = self.provider.query().await {
            log::debug!("Permission query: {:?}", status);
            match status {
                MicPermission::Granted | MicPermission::Denied => {
                    self.record(status);
                    return Ok(status);
                }
                MicPermission::Unknown | MicPermission::Prompt => {}
            }
        } else if self.granted.load(Ordering::Acquire) {
            return Ok(MicPermission::Granted);
        }

        let previous = self.bus.publish_permission(MicPermission::Prompt);
        match tokio::time::timeout(self.timeout, self.provider.prompt()).await {
            Ok(Ok(status)) => {
                log::info!("Microphone permission: {:?}", status);
                self.record(status);
                Ok(status)
            }
            Ok(Err(kind)) => {
                self.bus.publish_permission(previous);
                Err(kind)
            }
            Err(_) => {
                log::warn!(
                    "Permission prompt unanswered after {}ms",
                    self.timeout.as_millis()
                );
                self.bus.publish_permission(previous);
                Err(ErrorKind::PermissionTimeout)
            }
        }
    }

    /// Out-of-band permission change (system settings, OS notification).
    pub fn notify_change(&self, permission: MicPermission) {
        log::info!("Permission changed externally: {:?}", permission);
        self.record(permission);
    }

    /// Watch for grants made outside the app until `cancel` fires.
    ///
    /// Platform notifications are forwarded as they arrive. While access is
    /// denied the provider is also rechecked every `recheck_every`, and a
    /// grant found that way is recorded like any other change.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        recheck_every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = self.clone();
        let mut changes = self.provider.changes();
        let mut changes_open = changes.is_some();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recheck_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    change = next_change(&mut changes), if changes_open => match change {
                        Some(permission) => gate.notify_change(permission),
                        None => {
                            log::debug!("Platform permission notifications closed");
                            changes_open = false;
                        }
                    },
                    _ = ticker.tick() => {
                        if gate.current() != MicPermission::Denied {
                            continue;
                        }
                        if gate.provider.recheck().await == Some(MicPermission::Granted) {
                            gate.notify_change(MicPermission::Granted);
                        }
                    }
                }
            }
            log::debug!("Permission monitor stopped");
        })
    }

    fn record(&self, permission: MicPermission) {
        self.granted
            .store(permission == MicPermission::Granted, Ordering::Release);
        self.bus.publish_permission(permission);
    }
}

async fn next_change(changes: &mut Option<mpsc::Receiver<MicPermission>>) -> Option<MicPermission> {
    match changes {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}
