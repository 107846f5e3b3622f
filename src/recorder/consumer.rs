use super::types::{RecorderCommand, RecorderStatus, RecordingMode, StopReason, UserInfo};
use crate::config::EyecapConfig;
use crate::error::{EyecapError, Result};
use crate::events::{EventBus, EyecapEvent};
use crate::frame::Frame;
use crate::packaging::PackagingService;
use crate::processing::FrameProcessor;
use crate::reconnect::{LinkLostOutcome, ReconnectSupervisor};
use crate::session::RecordingSession;
use crate::stages::{CuePlayer, Stage, StagePlan, StageSequencer, StageTiming};
use crate::stream::{ConnectionInfo, DeviceStreamClient};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Forwards cues and reports plan completion back to the consumer
pub(crate) struct CompletionCues {
    inner: Arc<dyn CuePlayer>,
    commands: mpsc::UnboundedSender<RecorderCommand>,
}

impl CompletionCues {
    pub(crate) fn new(
        inner: Arc<dyn CuePlayer>,
        commands: mpsc::UnboundedSender<RecorderCommand>,
    ) -> Self {
        Self { inner, commands }
    }
}

impl CuePlayer for CompletionCues {
    fn guidance(&self, stage_index: usize, stage: &Stage, message: &str) {
        self.inner.guidance(stage_index, stage, message);
    }

    fn countdown_tick(&self, stage_index: usize, remaining: u32) {
        self.inner.countdown_tick(stage_index, remaining);
    }

    fn stage_started(&self, stage_index: usize, stage: &Stage) {
        self.inner.stage_started(stage_index, stage);
    }

    fn stage_complete(&self, stage_index: usize, stage: &Stage, captured: u32) {
        self.inner.stage_complete(stage_index, stage, captured);
    }

    fn plan_complete(&self, stages: usize) {
        self.inner.plan_complete(stages);
        let _ = self.commands.send(RecorderCommand::PlanComplete);
    }
}

struct ActiveRecording {
    session: RecordingSession,
    mode: RecordingMode,
    sequencer: Option<StageSequencer>,
    last_capture: Option<Instant>,
}

/// A finished session whose archive could not be written
struct PendingPackage {
    session: RecordingSession,
    plan: Option<StagePlan>,
}

/// Single writer for session and stage state
pub(crate) struct RecordingConsumer {
    config: EyecapConfig,
    plan: StagePlan,
    processor: FrameProcessor,
    packaging: PackagingService,
    supervisor: ReconnectSupervisor<DeviceStreamClient>,
    event_bus: Arc<EventBus>,
    cues: Arc<dyn CuePlayer>,
    active: Option<ActiveRecording>,
    pending: VecDeque<PendingPackage>,
    latest: Option<Frame>,
}

impl RecordingConsumer {
    pub(crate) fn new(
        config: EyecapConfig,
        plan: StagePlan,
        supervisor: ReconnectSupervisor<DeviceStreamClient>,
        event_bus: Arc<EventBus>,
        cues: Arc<dyn CuePlayer>,
    ) -> Self {
        let processor = FrameProcessor::new(config.recording.processing.clone());
        Self {
            config,
            plan,
            processor,
            packaging: PackagingService::new(),
            supervisor,
            event_bus,
            cues,
            active: None,
            pending: VecDeque::new(),
            latest: None,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RecorderCommand>) {
        debug!("Recording consumer started");

        while let Some(command) = commands.recv().await {
            match command {
                RecorderCommand::Frame(frame) => self.on_frame(frame).await,
                RecorderCommand::CaptureNow { reply } => {
                    let saved = self.capture_now().await;
                    let _ = reply.send(saved);
                }
                RecorderCommand::StartRecording { user, mode, reply } => {
                    let result = self.start(user, mode).await;
                    let _ = reply.send(result);
                }
                RecorderCommand::StopRecording { reason, reply } => {
                    let result = self.finish(reason).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                error!("Recording could not be finalized: {}", e);
                            }
                        }
                    }
                }
                RecorderCommand::Status { connection, reply } => {
                    let _ = reply.send(self.status(connection));
                }
                RecorderCommand::Connected => self.supervisor.on_connected(),
                RecorderCommand::LinkLost => self.on_link_lost().await,
                RecorderCommand::ReconnectGaveUp => {
                    self.finish_quietly(StopReason::LinkLost).await;
                }
                RecorderCommand::PlanComplete => {
                    let complete = self
                        .active
                        .as_ref()
                        .and_then(|active| active.sequencer.as_ref())
                        .map_or(false, StageSequencer::is_complete);
                    if complete {
                        self.finish_quietly(StopReason::PlanComplete).await;
                    }
                }
                RecorderCommand::Shutdown => {
                    self.finish_quietly(StopReason::Shutdown).await;
                    break;
                }
            }
        }

        debug!("Recording consumer stopped");
    }

    async fn on_frame(&mut self, frame: Frame) {
        self.latest = Some(frame.clone());

        let Some(active) = self.active.as_mut() else {
            return;
        };

        let saved = match active.mode {
            RecordingMode::Single => {
                let interval = Duration::from_millis(self.config.recording.capture_interval_ms);
                if let Some(last) = active.last_capture {
                    if frame.received_at.saturating_duration_since(last) < interval {
                        return;
                    }
                }

                let processed = self.processor.process(&frame);
                let saved = active
                    .session
                    .save_frame(&processed, &self.processor.suffix())
                    .await;
                if saved {
                    active.last_capture = Some(frame.received_at);
                }
                saved
            }
            RecordingMode::MultiStage => match &active.sequencer {
                Some(sequencer) => {
                    let processed = self.processor.process(&frame);
                    sequencer.on_frame(&mut active.session, &processed).await
                }
                None => false,
            },
        };

        if saved {
            publish_saved(&self.event_bus, &active.session);
        }
    }

    async fn capture_now(&mut self) -> bool {
        let (Some(active), Some(frame)) = (self.active.as_mut(), self.latest.as_ref()) else {
            warn!("Capture requested without an active recording and a current frame");
            return false;
        };

        let processed = self.processor.process(frame);
        let suffix = format!("{}_manual", self.processor.suffix());
        let saved = active.session.save_frame(&processed, &suffix).await;
        if saved {
            publish_saved(&self.event_bus, &active.session);
        }
        saved
    }

    async fn start(&mut self, user: UserInfo, mode: RecordingMode) -> Result<PathBuf> {
        if self.active.is_some() {
            return Err(EyecapError::component(
                "recorder",
                "a recording is already in progress",
            ));
        }
        for pending in &self.pending {
            warn!(
                "Starting a new recording while {} is still waiting to be packaged",
                pending.session.root().display()
            );
        }

        let session = RecordingSession::create(
            &self.config.recording.output_dir,
            &user.username,
            &user.email,
            self.config.recording.jpeg_quality,
        )
        .await?;

        let sequencer = match mode {
            RecordingMode::Single => None,
            RecordingMode::MultiStage => {
                let sequencer = StageSequencer::new(
                    self.plan.clone(),
                    StageTiming::from(&self.config.stages),
                    Arc::clone(&self.cues),
                );
                sequencer.begin(&session).await?;
                Some(sequencer)
            }
        };

        let folder = session.root().to_path_buf();
        self.supervisor.set_recording_active(true);
        self.active = Some(ActiveRecording {
            session,
            mode,
            sequencer,
            last_capture: None,
        });

        let _ = self.event_bus.publish(EyecapEvent::RecordingStarted {
            folder: folder.clone(),
            multi_stage: mode == RecordingMode::MultiStage,
        });
        Ok(folder)
    }

    /// Stop the active recording and package it. Without an active
    /// recording, retry every previously failed packaging in order; the
    /// first failure is returned after all have been attempted.
    async fn finish(&mut self, reason: StopReason) -> Result<Option<PathBuf>> {
        let Some(active) = self.active.take() else {
            return self.retry_pending().await;
        };

        if let Some(sequencer) = &active.sequencer {
            sequencer.stop();
        }
        self.supervisor.set_recording_active(false);

        let _ = self.event_bus.publish(EyecapEvent::RecordingStopped {
            image_count: active.session.image_count(),
            reason: reason.to_string(),
        });

        self.package(PendingPackage {
            plan: active.sequencer.map(|sequencer| sequencer.plan().clone()),
            session: active.session,
        })
        .await
    }

    async fn retry_pending(&mut self) -> Result<Option<PathBuf>> {
        let mut archive = None;
        let mut first_error = None;

        for pending in std::mem::take(&mut self.pending) {
            info!("Retrying packaging of {}", pending.session.root().display());
            match self.package(pending).await {
                Ok(Some(path)) => archive = Some(path),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(archive),
        }
    }

    /// Archive one session; on failure it is queued for a later retry
    async fn package(&mut self, pending: PendingPackage) -> Result<Option<PathBuf>> {
        match self
            .packaging
            .finalize(&pending.session, pending.plan.as_ref())
            .await
        {
            Ok(Some(archive)) => {
                let _ = self.event_bus.publish(EyecapEvent::PackagingCompleted {
                    archive: archive.clone(),
                    image_count: pending.session.image_count(),
                });
                Ok(Some(archive))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                let _ = self.event_bus.publish(EyecapEvent::PackagingFailed {
                    error: e.to_string(),
                });
                self.pending.push_back(pending);
                Err(e.into())
            }
        }
    }

    async fn finish_quietly(&mut self, reason: StopReason) {
        if self.active.is_none() {
            return;
        }
        if let Err(e) = self.finish(reason).await {
            error!("Recording stopped ({}) but could not be packaged: {}", reason, e);
        }
    }

    async fn on_link_lost(&mut self) {
        match self.supervisor.handle_link_lost() {
            LinkLostOutcome::Propagated {
                stop_recording: true,
            } => self.finish_quietly(StopReason::LinkLost).await,
            outcome => debug!("Link loss handled: {:?}", outcome),
        }
    }

    fn status(&self, connection: ConnectionInfo) -> RecorderStatus {
        RecorderStatus {
            connection,
            mode: self.active.as_ref().map(|active| active.mode),
            session: self
                .active
                .as_ref()
                .map(|active| active.session.session_info()),
            stage: self
                .active
                .as_ref()
                .and_then(|active| active.sequencer.as_ref())
                .map(StageSequencer::progress),
            packaging_pending: self.pending.len(),
        }
    }
}

fn publish_saved(event_bus: &EventBus, session: &RecordingSession) {
    if let Some(path) = session.last_saved() {
        let _ = event_bus.publish(EyecapEvent::FrameSaved {
            path: path.to_path_buf(),
            image_count: session.image_count(),
        });
    }
}
