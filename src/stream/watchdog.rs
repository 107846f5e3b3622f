use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Passive no-data check. Reports silence once per episode and never acts
/// on the connection itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Watchdog {
    silence: Duration,
    check_interval: Duration,
}

impl Watchdog {
    pub(crate) fn new(silence: Duration, check_interval: Duration) -> Self {
        Self {
            silence,
            check_interval,
        }
    }

    /// Run until cancelled. `last_activity` returns the most recent frame
    /// arrival (or connect time); `on_silence` receives the silent duration.
    pub(crate) async fn run<A, S>(self, last_activity: A, on_silence: S, cancel: CancellationToken)
    where
        A: Fn() -> Option<Instant>,
        S: Fn(Duration),
    {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut warned_for: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stream watchdog stopped");
                    return;
                }
                _ = interval.tick() => {
                    let Some(last) = last_activity() else {
                        continue;
                    };

                    let silent_for = last.elapsed();
                    if silent_for < self.silence {
                        continue;
                    }

                    // One warning per silence episode
                    if warned_for != Some(last) {
                        warned_for = Some(last);
                        on_silence(silent_for);
                    }
                }
            }
        }
    }
}
