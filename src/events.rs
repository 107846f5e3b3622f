use crate::error::EventBusError;
use crate::status::StatusEvent;
use crate::stream::ConnectionState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events observable by the presentation layer (GUI, CLI or tests)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EyecapEvent {
    /// Stream client changed connection state
    ConnectionStateChanged {
        state: ConnectionState,
        endpoint: Option<String>,
    },
    /// Every connection candidate failed
    ConnectFailed { attempted: Vec<String> },
    /// Transport error surfaced by the receive loop
    StreamError { message: String },
    /// Status message parsed from the device
    Status(StatusEvent),
    /// No frame has arrived for a while (observational only)
    WatchdogSilence { silent_for_secs: u64 },
    /// A reconnect attempt was scheduled after an unexpected disconnect
    ReconnectScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    /// Reconnect attempts were used up during a recording
    ReconnectExhausted { attempts: u32 },
    /// A recording session started
    RecordingStarted { folder: PathBuf, multi_stage: bool },
    /// A frame was written to the session folder
    FrameSaved { path: PathBuf, image_count: u64 },
    /// The recording stopped
    RecordingStopped { image_count: u64, reason: String },
    /// A guidance message for the upcoming stage
    StageGuidance {
        stage_index: usize,
        stage_name: String,
        message: String,
    },
    /// One countdown tick before capture begins
    StageCountdown { stage_index: usize, remaining: u32 },
    /// A stage started accepting frames
    StageStarted {
        stage_index: usize,
        stage_name: String,
    },
    /// A stage reached its target count
    StageCompleted {
        stage_index: usize,
        stage_name: String,
        captured: u32,
    },
    /// Every stage of the plan completed
    PlanCompleted { stages: usize },
    /// Session archive was written and the session folder removed
    PackagingCompleted { archive: PathBuf, image_count: u64 },
    /// Session archive could not be written; files were left in place
    PackagingFailed { error: String },
}

impl EyecapEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            EyecapEvent::ConnectionStateChanged { state, endpoint } => match endpoint {
                Some(endpoint) => format!("Connection {:?} ({})", state, endpoint),
                None => format!("Connection {:?}", state),
            },
            EyecapEvent::ConnectFailed { attempted } => {
                format!("All connection attempts failed: {}", attempted.join(", "))
            }
            EyecapEvent::StreamError { message } => format!("Stream error: {}", message),
            EyecapEvent::Status(status) => format!("Device status: {}", status),
            EyecapEvent::WatchdogSilence { silent_for_secs } => {
                format!("No image data received for {}s", silent_for_secs)
            }
            EyecapEvent::ReconnectScheduled {
                attempt,
                max_attempts,
                delay_ms,
            } => format!(
                "Reconnect {}/{} scheduled in {}ms",
                attempt, max_attempts, delay_ms
            ),
            EyecapEvent::ReconnectExhausted { attempts } => {
                format!("Reconnect gave up after {} attempts", attempts)
            }
            EyecapEvent::RecordingStarted { folder, multi_stage } => format!(
                "Recording started in {} ({})",
                folder.display(),
                if *multi_stage { "multi-stage" } else { "single" }
            ),
            EyecapEvent::FrameSaved { path, image_count } => {
                format!("Saved image #{}: {}", image_count, path.display())
            }
            EyecapEvent::RecordingStopped {
                image_count,
                reason,
            } => format!("Recording stopped ({} images): {}", image_count, reason),
            EyecapEvent::StageGuidance {
                stage_index,
                message,
                ..
            } => format!("Stage {}: {}", stage_index + 1, message),
            EyecapEvent::StageCountdown {
                stage_index,
                remaining,
            } => format!("Stage {} starts in {}", stage_index + 1, remaining),
            EyecapEvent::StageStarted {
                stage_index,
                stage_name,
            } => format!("Stage {} ({}) capturing", stage_index + 1, stage_name),
            EyecapEvent::StageCompleted {
                stage_index,
                stage_name,
                captured,
            } => format!(
                "Stage {} ({}) complete with {} images",
                stage_index + 1,
                stage_name,
                captured
            ),
            EyecapEvent::PlanCompleted { stages } => {
                format!("All {} stages complete", stages)
            }
            EyecapEvent::PackagingCompleted {
                archive,
                image_count,
            } => format!(
                "Packaged {} images into {}",
                image_count,
                archive.display()
            ),
            EyecapEvent::PackagingFailed { error } => format!("Packaging failed: {}", error),
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            EyecapEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            EyecapEvent::ConnectFailed { .. } => "connect_failed",
            EyecapEvent::StreamError { .. } => "stream_error",
            EyecapEvent::Status(_) => "status",
            EyecapEvent::WatchdogSilence { .. } => "watchdog_silence",
            EyecapEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            EyecapEvent::ReconnectExhausted { .. } => "reconnect_exhausted",
            EyecapEvent::RecordingStarted { .. } => "recording_started",
            EyecapEvent::FrameSaved { .. } => "frame_saved",
            EyecapEvent::RecordingStopped { .. } => "recording_stopped",
            EyecapEvent::StageGuidance { .. } => "stage_guidance",
            EyecapEvent::StageCountdown { .. } => "stage_countdown",
            EyecapEvent::StageStarted { .. } => "stage_started",
            EyecapEvent::StageCompleted { .. } => "stage_completed",
            EyecapEvent::PlanCompleted { .. } => "plan_completed",
            EyecapEvent::PackagingCompleted { .. } => "packaging_completed",
            EyecapEvent::PackagingFailed { .. } => "packaging_failed",
        }
    }
}

/// Event bus for component coordination using broadcast channels
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EyecapEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<EyecapEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Publishing with no subscribers is not an error; it returns `Ok(0)`.
    pub fn publish(&self, event: EyecapEvent) -> Result<usize, EventBusError> {
        match &event {
            EyecapEvent::ConnectFailed { .. } | EyecapEvent::PackagingFailed { .. } => {
                error!("{}", event.description());
            }
            EyecapEvent::StreamError { .. }
            | EyecapEvent::WatchdogSilence { .. }
            | EyecapEvent::ReconnectScheduled { .. }
            | EyecapEvent::ReconnectExhausted { .. } => {
                warn!("{}", event.description());
            }
            EyecapEvent::RecordingStarted { .. }
            | EyecapEvent::RecordingStopped { .. }
            | EyecapEvent::StageStarted { .. }
            | EyecapEvent::StageCompleted { .. }
            | EyecapEvent::PlanCompleted { .. }
            | EyecapEvent::PackagingCompleted { .. } => {
                info!("{}", event.description());
            }
            _ => debug!("Event: {}", event.description()),
        }

        if self.sender.receiver_count() == 0 {
            return Ok(0);
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &EyecapEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<EyecapEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<EyecapEvent>,
        filter: EventFilter,
        name: impl Into<String>,
    ) -> Self {
        Self {
            receiver,
            filter,
            name: name.into(),
        }
    }

    /// Receive the next filtered event. Lagging skips ahead instead of failing.
    pub async fn recv(&mut self) -> Result<EyecapEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        debug!(
                            "Receiver '{}' received event: {}",
                            self.name,
                            event.description()
                        );
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let subscriber_count = event_bus
            .publish(EyecapEvent::PlanCompleted { stages: 3 })
            .unwrap();
        assert_eq!(subscriber_count, 1);

        match receiver.recv().await.unwrap() {
            EyecapEvent::PlanCompleted { stages } => assert_eq!(stages, 3),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let event_bus = EventBus::new(10);
        let delivered = event_bus
            .publish(EyecapEvent::StreamError {
                message: "reset".to_string(),
            })
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let event_bus = EventBus::new(10);
        let mut receiver = EventReceiver::new(
            event_bus.subscribe(),
            EventFilter::EventTypes(vec!["stage_started"]),
            "test",
        );

        event_bus
            .publish(EyecapEvent::StageCountdown {
                stage_index: 0,
                remaining: 3,
            })
            .unwrap();
        event_bus
            .publish(EyecapEvent::StageStarted {
                stage_index: 0,
                stage_name: "center".to_string(),
            })
            .unwrap();

        let received = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event_type(), "stage_started");
        assert!(EventFilter::All.matches(&received));
    }

    #[test]
    fn test_event_properties() {
        let event = EyecapEvent::StageCompleted {
            stage_index: 1,
            stage_name: "blink".to_string(),
            captured: 40,
        };

        assert_eq!(event.event_type(), "stage_completed");
        assert_eq!(event.description(), "Stage 2 (blink) complete with 40 images");
    }
}
