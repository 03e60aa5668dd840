use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::alert_dispatcher::AlertDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Re-sends pending alerts on reconnect and on a timer that backs off
/// while sweeps keep failing.
pub struct RetrySweep {
    dispatcher: Arc<AlertDispatcher>,
    base_interval: Duration,
    max_backoff: Duration,
}

impl RetrySweep {
    pub fn new(dispatcher: Arc<AlertDispatcher>, base_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            dispatcher,
            base_interval,
            max_backoff: max_backoff.max(base_interval),
        }
    }

    fn delay_after(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_failures.min(16)).unwrap_or(u32::MAX);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn spawn(self, mut connectivity: mpsc::Receiver<ConnectivityEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retry sweep started (every {:?}, backoff up to {:?})", self.base_interval, self.max_backoff);

            let mut consecutive_failures = 0u32;
            let mut online = true;
            let mut events_open = true;
            let mut next_sweep = Instant::now() + self.base_interval;

            loop {
                let run_sweep = tokio::select! {
                    event = connectivity.recv(), if events_open => match event {
                        Some(ConnectivityEvent::Online) => {
                            info!("Connectivity restored, sweeping pending alerts");
                            online = true;
                            consecutive_failures = 0;
                            true
                        }
                        Some(ConnectivityEvent::Offline) => {
                            warn!("Connectivity lost, timed retries paused");
                            online = false;
                            false
                        }
                        None => {
                            debug!("Connectivity events closed, relying on timer only");
                            events_open = false;
                            false
                        }
                    },
                    _ = tokio::time::sleep_until(next_sweep) => {
                        next_sweep = Instant::now() + self.delay_after(consecutive_failures);
                        online
                    }
                    _ = self.dispatcher.retry_requested() => {
                        // A fresh alert just failed; come back at the base interval.
                        consecutive_failures = 0;
                        next_sweep = next_sweep.min(Instant::now() + self.base_interval);
                        false
                    }
                };

                if !run_sweep {
                    continue;
                }

                let report = self.dispatcher.retry_pending().await;
                if report.still_pending > 0 {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.delay_after(consecutive_failures);
                    warn!(
                        "{} alert(s) still pending ({} failed sweeps), next retry in {:?}",
                        report.still_pending, consecutive_failures, delay
                    );
                    next_sweep = Instant::now() + delay;
                } else {
                    consecutive_failures = 0;
                    next_sweep = Instant::now() + self.base_interval;
                }
            }
        })
    }
}
