use super::plan::Stage;
use crate::events::{EventBus, EyecapEvent};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

/// Presentation of stage guidance and audible cues
pub trait CuePlayer: Send + Sync {
    fn guidance(&self, stage_index: usize, stage: &Stage, message: &str);
    fn countdown_tick(&self, stage_index: usize, remaining: u32);
    fn stage_started(&self, stage_index: usize, stage: &Stage);
    fn stage_complete(&self, stage_index: usize, stage: &Stage, captured: u32);
    fn plan_complete(&self, stages: usize);
}

/// Publishes cues on the event bus, optionally ringing the terminal bell
pub struct EventCuePlayer {
    event_bus: Arc<EventBus>,
    audible: bool,
}

impl EventCuePlayer {
    pub fn new(event_bus: Arc<EventBus>, audible: bool) -> Self {
        Self { event_bus, audible }
    }

    fn bell(&self) {
        if !self.audible {
            return;
        }
        let mut stdout = std::io::stdout();
        if let Err(e) = stdout.write_all(b"\x07").and_then(|_| stdout.flush()) {
            debug!("Could not ring terminal bell: {}", e);
        }
    }
}

impl CuePlayer for EventCuePlayer {
    fn guidance(&self, stage_index: usize, stage: &Stage, message: &str) {
        self.bell();
        let _ = self.event_bus.publish(EyecapEvent::StageGuidance {
            stage_index,
            stage_name: stage.name.clone(),
            message: message.to_string(),
        });
    }

    fn countdown_tick(&self, stage_index: usize, remaining: u32) {
        self.bell();
        let _ = self.event_bus.publish(EyecapEvent::StageCountdown {
            stage_index,
            remaining,
        });
    }

    fn stage_started(&self, stage_index: usize, stage: &Stage) {
        let _ = self.event_bus.publish(EyecapEvent::StageStarted {
            stage_index,
            stage_name: stage.name.clone(),
        });
    }

    fn stage_complete(&self, stage_index: usize, stage: &Stage, captured: u32) {
        self.bell();
        let _ = self.event_bus.publish(EyecapEvent::StageCompleted {
            stage_index,
            stage_name: stage.name.clone(),
            captured,
        });
    }

    fn plan_complete(&self, stages: usize) {
        self.bell();
        let _ = self
            .event_bus
            .publish(EyecapEvent::PlanCompleted { stages });
    }
}
