//! Network reachability probe
//!
//! Periodically opens a TCP connection to a well-known host and reports
//! transitions to the service, which switches between streaming and batch
//! backends accordingly.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::service::VoiceService;

/// Default probe target: the realtime API host
pub const DEFAULT_PROBE_TARGET: &str = "api.openai.com:443";

#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TARGET)
    }
}

impl ConnectivityProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// One reachability check.
    pub async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                log::debug!("Probe {} failed: {}", self.target, e);
                false
            }
            Err(_) => {
                log::debug!("Probe {} timed out", self.target);
                false
            }
        }
    }

    /// Probe until `cancel` fires, reporting changes to `service`.
    ///
    /// The first result is always reported so the service's startup guess
    /// gets corrected.
    pub fn spawn(
        self,
        service: VoiceService,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut last: Option<bool> = None;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        log::info!("Connectivity probe cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        let online = self.is_reachable().await;
                        if last != Some(online) {
                            log::info!(
                                "Connectivity: {} ({})",
                                if online { "online" } else { "offline" },
                                self.target
                            );
                            service.set_connectivity(online).await;
                            last = Some(online);
                        }
                    }
                }
            }
        })
    }
}
