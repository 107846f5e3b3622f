use crate::config::ReconnectConfig;
use crate::error::{EyecapError, StreamError};
use crate::events::{EventBus, EyecapEvent};
use crate::stream::DeviceStreamClient;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// The part of a stream client the supervisor drives
pub trait StreamLink: Send + Sync + 'static {
    /// Start connecting again with the configured candidates
    fn restart(&self) -> Result<(), StreamError>;
    /// Drop the connection
    fn shutdown(&self);
    /// Signal that a reconnect is pending
    fn mark_reconnecting(&self);
}

impl StreamLink for DeviceStreamClient {
    fn restart(&self) -> Result<(), StreamError> {
        self.start()
    }

    fn shutdown(&self) {
        self.stop()
    }

    fn mark_reconnecting(&self) {
        DeviceStreamClient::mark_reconnecting(self)
    }
}

/// Bounded, fixed-delay reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        }
    }
}

/// Supervisor phase. Disconnects are only acted on in `Idle` and `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    /// No connection requested
    Idle,
    /// Connection requested by the owner (connecting or connected)
    Live,
    /// Waiting out the backoff before reconnect attempt `attempt`
    Backoff { attempt: u32 },
    /// Owner-initiated disconnect in progress
    TearingDown,
}

/// What the owner should do about a lost link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLostOutcome {
    /// Teardown or reconnect already in progress
    Ignored,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The disconnect stands; stop the recording if `stop_recording`
    Propagated { stop_recording: bool },
}

struct SupervisorState {
    phase: SupervisorPhase,
    attempts: u32,
    recording_active: bool,
    /// Bumped on connect/disconnect so pending reconnects can tell they are stale
    epoch: u64,
}

type GiveUpObserver = Arc<dyn Fn() + Send + Sync>;

struct SupervisorInner<L> {
    link: L,
    policy: ReconnectPolicy,
    event_bus: Arc<EventBus>,
    state: Mutex<SupervisorState>,
    give_up: RwLock<Vec<GiveUpObserver>>,
}

/// Reconnects a dropped stream while a recording is active.
///
/// Attempts are counted across consecutive failures and reset whenever a
/// connection succeeds. The delay is fixed, not exponential.
pub struct ReconnectSupervisor<L: StreamLink> {
    inner: Arc<SupervisorInner<L>>,
}

impl<L: StreamLink> Clone for ReconnectSupervisor<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: StreamLink> ReconnectSupervisor<L> {
    pub fn new(link: L, policy: ReconnectPolicy, event_bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                link,
                policy,
                event_bus,
                state: Mutex::new(SupervisorState {
                    phase: SupervisorPhase::Idle,
                    attempts: 0,
                    recording_active: false,
                    epoch: 0,
                }),
                give_up: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn link(&self) -> &L {
        &self.inner.link
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.inner.state.lock().phase
    }

    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    /// Called when a scheduled reconnect cannot be carried out, after the
    /// supervisor has already given up.
    pub fn on_give_up<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.give_up.write().push(Arc::new(observer));
    }

    /// Owner-requested connect
    pub fn connect(&self) -> Result<(), StreamError> {
        {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.phase = SupervisorPhase::Live;
            state.attempts = 0;
        }
        self.inner.link.restart()
    }

    /// Owner-requested disconnect. Any pending reconnect is abandoned and
    /// the resulting disconnect notification is ignored.
    pub fn disconnect(&self) {
        self.begin_teardown();
        self.inner.link.shutdown();
        self.finish_teardown();
    }

    /// Enter teardown; link-lost notifications are ignored until
    /// `finish_teardown`.
    pub fn begin_teardown(&self) {
        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.phase = SupervisorPhase::TearingDown;
    }

    pub fn finish_teardown(&self) {
        let mut state = self.inner.state.lock();
        state.phase = SupervisorPhase::Idle;
        state.attempts = 0;
    }

    /// A connection succeeded; the attempt budget starts over
    pub fn on_connected(&self) {
        let mut state = self.inner.state.lock();
        if state.attempts > 0 {
            info!("Reconnected after {} attempts", state.attempts);
        }
        state.attempts = 0;
        if state.phase == SupervisorPhase::Idle {
            state.phase = SupervisorPhase::Live;
        }
    }

    pub fn set_recording_active(&self, active: bool) {
        self.inner.state.lock().recording_active = active;
    }

    pub fn is_recording_active(&self) -> bool {
        self.inner.state.lock().recording_active
    }

    /// Decide what to do about an unexpected disconnect or failed connect
    pub fn handle_link_lost(&self) -> LinkLostOutcome {
        let (attempt, epoch) = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SupervisorPhase::TearingDown | SupervisorPhase::Backoff { .. } => {
                    debug!("Ignoring link loss during {:?}", state.phase);
                    return LinkLostOutcome::Ignored;
                }
                SupervisorPhase::Idle | SupervisorPhase::Live => {}
            }

            if !state.recording_active {
                state.phase = SupervisorPhase::Idle;
                return LinkLostOutcome::Propagated {
                    stop_recording: false,
                };
            }

            if state.attempts >= self.inner.policy.max_attempts {
                let attempts = state.attempts;
                state.phase = SupervisorPhase::Idle;
                state.attempts = 0;
                drop(state);

                error!("Giving up on device stream after {} reconnect attempts", attempts);
                let _ = self
                    .inner
                    .event_bus
                    .publish(EyecapEvent::ReconnectExhausted { attempts });
                return LinkLostOutcome::Propagated {
                    stop_recording: true,
                };
            }

            state.attempts += 1;
            state.phase = SupervisorPhase::Backoff {
                attempt: state.attempts,
            };
            (state.attempts, state.epoch)
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                error!("No async runtime to schedule reconnect on");
                self.abandon();
                return LinkLostOutcome::Propagated {
                    stop_recording: true,
                };
            }
        };

        let delay = self.inner.policy.backoff;
        self.inner.link.mark_reconnecting();
        let _ = self.inner.event_bus.publish(EyecapEvent::ReconnectScheduled {
            attempt,
            max_attempts: self.inner.policy.max_attempts,
            delay_ms: delay.as_millis() as u64,
        });

        let supervisor = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.run_reconnect(attempt, epoch);
        });

        LinkLostOutcome::ReconnectScheduled { attempt, delay }
    }

    fn run_reconnect(&self, attempt: u32, epoch: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch || state.phase != (SupervisorPhase::Backoff { attempt }) {
                debug!("Reconnect attempt {} abandoned", attempt);
                return;
            }
            state.phase = SupervisorPhase::Live;
        }

        info!(
            "Reconnect attempt {}/{}",
            attempt, self.inner.policy.max_attempts
        );

        if let Err(e) = self.inner.link.restart() {
            let e = EyecapError::from(e);
            warn!("Reconnect attempt {} failed to start: {}", attempt, e);

            let gave_up = if e.is_recoverable() {
                matches!(
                    self.handle_link_lost(),
                    LinkLostOutcome::Propagated {
                        stop_recording: true
                    }
                )
            } else {
                self.abandon();
                true
            };

            if gave_up {
                let observers = self.inner.give_up.read().clone();
                for observer in observers {
                    observer();
                }
            }
        }
    }

    fn abandon(&self) {
        let attempts = {
            let mut state = self.inner.state.lock();
            let attempts = state.attempts;
            state.phase = SupervisorPhase::Idle;
            state.attempts = 0;
            attempts
        };
        let _ = self
            .inner
            .event_bus
            .publish(EyecapEvent::ReconnectExhausted { attempts });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingLink {
        restarts: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        reconnecting: Arc<AtomicUsize>,
        refuse: Arc<AtomicBool>,
    }

    impl StreamLink for CountingLink {
        fn restart(&self) -> Result<(), StreamError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(StreamError::NotConfigured);
            }
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn mark_reconnecting(&self) {
            self.reconnecting.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supervisor(max_attempts: u32) -> (ReconnectSupervisor<CountingLink>, CountingLink) {
        let link = CountingLink::default();
        let supervisor = ReconnectSupervisor::new(
            link.clone(),
            ReconnectPolicy {
                max_attempts,
                backoff: Duration::from_millis(5000),
            },
            Arc::new(EventBus::new(16)),
        );
        (supervisor, link)
    }

    async fn past_backoff() {
        tokio::time::sleep(Duration::from_millis(5001)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_attempts_then_forced_stop() {
        let (supervisor, link) = supervisor(2);
        supervisor.connect().unwrap();
        supervisor.set_recording_active(true);
        assert_eq!(link.restarts.load(Ordering::SeqCst), 1);

        assert_eq!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(5000)
            }
        );
        past_backoff().await;
        assert_eq!(link.restarts.load(Ordering::SeqCst), 2);

        assert!(matches!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::ReconnectScheduled { attempt: 2, .. }
        ));
        past_backoff().await;
        assert_eq!(link.restarts.load(Ordering::SeqCst), 3);

        assert_eq!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::Propagated {
                stop_recording: true
            }
        );
        past_backoff().await;

        // Two reconnects on top of the initial connect, never a third
        assert_eq!(link.restarts.load(Ordering::SeqCst), 3);
        assert_eq!(link.reconnecting.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.phase(), SupervisorPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let (supervisor, link) = supervisor(1);
        supervisor.connect().unwrap();
        supervisor.set_recording_active(true);

        assert!(matches!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::ReconnectScheduled { attempt: 1, .. }
        ));
        past_backoff().await;
        supervisor.on_connected();
        assert_eq!(supervisor.attempts(), 0);

        assert!(matches!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::ReconnectScheduled { attempt: 1, .. }
        ));
        past_backoff().await;
        assert_eq!(link.restarts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_recording_propagates_without_retry() {
        let (supervisor, link) = supervisor(5);
        supervisor.connect().unwrap();

        assert_eq!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::Propagated {
                stop_recording: false
            }
        );
        past_backoff().await;
        assert_eq!(link.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_cancels_pending_reconnect() {
        let (supervisor, link) = supervisor(5);
        supervisor.connect().unwrap();
        supervisor.set_recording_active(true);

        assert!(matches!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::ReconnectScheduled { .. }
        ));
        supervisor.disconnect();
        past_backoff().await;

        assert_eq!(link.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(link.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.phase(), SupervisorPhase::Idle);
    }

    #[test]
    fn test_link_loss_during_teardown_is_ignored() {
        let (supervisor, _link) = supervisor(5);
        supervisor.set_recording_active(true);

        supervisor.begin_teardown();
        assert_eq!(supervisor.handle_link_lost(), LinkLostOutcome::Ignored);
        assert_eq!(supervisor.handle_link_lost(), LinkLostOutcome::Ignored);
        supervisor.finish_teardown();

        assert_eq!(supervisor.phase(), SupervisorPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_restart_gives_up() {
        let (supervisor, link) = supervisor(5);
        supervisor.connect().unwrap();
        supervisor.set_recording_active(true);

        let gave_up = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&gave_up);
        supervisor.on_give_up(move || flag.store(true, Ordering::SeqCst));

        link.refuse.store(true, Ordering::SeqCst);
        assert!(matches!(
            supervisor.handle_link_lost(),
            LinkLostOutcome::ReconnectScheduled { .. }
        ));
        past_backoff().await;

        assert!(gave_up.load(Ordering::SeqCst));
        assert_eq!(supervisor.phase(), SupervisorPhase::Idle);
    }
}
