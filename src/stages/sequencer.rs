use super::cue::CuePlayer;
use super::plan::{Stage, StagePlan};
use crate::config::StagesConfig;
use crate::error::SessionError;
use crate::frame::Frame;
use crate::session::RecordingSession;
use crate::session::file_timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Sub-state of the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerPhase {
    /// `begin` has not been called
    Idle,
    /// Guidance and countdown for the current stage are playing
    Guiding,
    /// Accepting frames for the current stage
    Capturing,
    /// Target reached, pausing before the next stage
    Completing,
    /// Every stage reached its target
    Complete,
    Stopped,
}

/// Pacing of the announcement and completion steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub guidance_dwell: Duration,
    pub countdown_ticks: u32,
    pub tick: Duration,
    pub completion_pause: Duration,
}

impl From<&StagesConfig> for StageTiming {
    fn from(config: &StagesConfig) -> Self {
        Self {
            guidance_dwell: Duration::from_millis(config.guidance_dwell_ms),
            countdown_ticks: config.countdown_secs,
            tick: Duration::from_secs(1),
            completion_pause: Duration::from_millis(config.completion_pause_ms),
        }
    }
}

impl Default for StageTiming {
    fn default() -> Self {
        Self::from(&StagesConfig::default())
    }
}

/// Progress snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub phase: SequencerPhase,
    pub stage_index: usize,
    pub stage_name: Option<String>,
    pub stage_count: u32,
    pub stage_target: u32,
    pub total_stages: usize,
}

struct StageRunState {
    current_stage_index: usize,
    current_stage_count: u32,
    /// Relative to the session root, index-aligned with the plan
    per_stage_folders: Vec<PathBuf>,
    captured_per_stage: Vec<u32>,
    phase: SequencerPhase,
    last_capture: Option<Instant>,
}

struct SequencerShared {
    plan: StagePlan,
    timing: StageTiming,
    cues: Arc<dyn CuePlayer>,
    state: Mutex<StageRunState>,
    cancel: Mutex<CancellationToken>,
}

/// Drives a recording session through a stage plan.
///
/// Stage completion is driven by frame count only; a stage that never
/// receives frames never completes and only `stop()` ends it.
#[derive(Clone)]
pub struct StageSequencer {
    shared: Arc<SequencerShared>,
}

impl StageSequencer {
    pub fn new(plan: StagePlan, timing: StageTiming, cues: Arc<dyn CuePlayer>) -> Self {
        let stages = plan.len();
        Self {
            shared: Arc::new(SequencerShared {
                plan,
                timing,
                cues,
                state: Mutex::new(StageRunState {
                    current_stage_index: 0,
                    current_stage_count: 0,
                    per_stage_folders: Vec::new(),
                    captured_per_stage: vec![0; stages],
                    phase: SequencerPhase::Idle,
                    last_capture: None,
                }),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn plan(&self) -> &StagePlan {
        &self.shared.plan
    }

    /// Create one folder per stage under the session root and announce stage 1
    pub async fn begin(&self, session: &RecordingSession) -> Result<(), SessionError> {
        let mut folders = Vec::with_capacity(self.shared.plan.len());
        for (index, stage) in self.shared.plan.stages().iter().enumerate() {
            let folder = PathBuf::from(stage.folder_name(index));
            let path = session.root().join(&folder);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|source| SessionError::DirectoryCreation { path, source })?;
            folders.push(folder);
        }

        {
            let mut state = self.shared.state.lock();
            state.current_stage_index = 0;
            state.current_stage_count = 0;
            state.per_stage_folders = folders;
            state.captured_per_stage = vec![0; self.shared.plan.len()];
            state.phase = SequencerPhase::Idle;
            state.last_capture = None;
        }
        self.shared.cancel.lock().cancel();
        *self.shared.cancel.lock() = CancellationToken::new();

        info!(
            "Starting {}-stage capture in {}",
            self.shared.plan.len(),
            session.root().display()
        );
        self.advance_to(0);
        Ok(())
    }

    /// Move to stage `index`, or to Complete past the last stage. Guidance
    /// runs as its own task; capture opens when it finishes.
    pub fn advance_to(&self, index: usize) {
        let stage = {
            let mut state = self.shared.state.lock();
            if state.phase == SequencerPhase::Stopped {
                debug!("Sequencer stopped, not advancing to stage {}", index);
                return;
            }

            if index >= self.shared.plan.len() {
                state.current_stage_index = self.shared.plan.len();
                state.current_stage_count = 0;
                state.phase = SequencerPhase::Complete;
                None
            } else {
                state.current_stage_index = index;
                state.current_stage_count = 0;
                state.last_capture = None;
                state.phase = SequencerPhase::Guiding;
                self.shared.plan.get(index).cloned()
            }
        };

        let Some(stage) = stage else {
            info!("All {} stages complete", self.shared.plan.len());
            self.shared.cues.plan_complete(self.shared.plan.len());
            return;
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                error!("No async runtime to run stage guidance on");
                self.stop();
                return;
            }
        };

        let cancel = self.shared.cancel.lock().clone();
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            run_guidance(shared, index, stage, cancel).await;
        });
    }

    /// Offer a frame. Returns true if it was saved for the current stage.
    pub async fn on_frame(&self, session: &mut RecordingSession, frame: &Frame) -> bool {
        let (index, folder, local_count) = {
            let state = self.shared.state.lock();
            if state.phase != SequencerPhase::Capturing {
                return false;
            }

            let index = state.current_stage_index;
            let Some(stage) = self.shared.plan.get(index) else {
                return false;
            };

            if let Some(last) = state.last_capture {
                if frame.received_at.saturating_duration_since(last) < stage.interval() {
                    return false;
                }
            }

            (
                index,
                state.per_stage_folders[index].clone(),
                state.current_stage_count + 1,
            )
        };

        let stage = &self.shared.plan.stages()[index];
        let file_name = format!(
            "{}_{}_{:04}.jpg",
            stage.file_prefix(index),
            file_timestamp(frame),
            local_count
        );
        if !session.save_frame_as(frame, Path::new(&folder), &file_name).await {
            return false;
        }

        let completed = {
            let mut state = self.shared.state.lock();
            if state.current_stage_index != index {
                return true;
            }
            state.current_stage_count += 1;
            state.captured_per_stage[index] += 1;
            state.last_capture = Some(frame.received_at);

            if state.phase == SequencerPhase::Capturing
                && state.current_stage_count >= stage.target_count
            {
                state.phase = SequencerPhase::Completing;
                Some(state.current_stage_count)
            } else {
                None
            }
        };

        if let Some(captured) = completed {
            info!(
                "Stage {} ({}) reached {} images",
                index + 1,
                stage.name,
                captured
            );
            self.shared.cues.stage_complete(index, stage, captured);
            self.schedule_next(index);
        }

        true
    }

    fn schedule_next(&self, index: usize) {
        let cancel = self.shared.cancel.lock().clone();
        let pause = self.shared.timing.completion_pause;
        let sequencer = self.clone();

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(pause) => sequencer.advance_to(index + 1),
                    }
                });
            }
            Err(_) => self.advance_to(index + 1),
        }
    }

    /// Halt capture. Frames already written stay on disk.
    pub fn stop(&self) {
        self.shared.cancel.lock().cancel();
        let mut state = self.shared.state.lock();
        if state.phase != SequencerPhase::Complete {
            state.phase = SequencerPhase::Stopped;
        }
    }

    pub fn phase(&self) -> SequencerPhase {
        self.shared.state.lock().phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase() == SequencerPhase::Complete
    }

    pub fn current_stage_index(&self) -> usize {
        self.shared.state.lock().current_stage_index
    }

    /// Frames captured per stage, index-aligned with the plan
    pub fn captured_per_stage(&self) -> Vec<u32> {
        self.shared.state.lock().captured_per_stage.clone()
    }

    pub fn progress(&self) -> StageProgress {
        let state = self.shared.state.lock();
        let stage = self.shared.plan.get(state.current_stage_index);
        StageProgress {
            phase: state.phase,
            stage_index: state.current_stage_index,
            stage_name: stage.map(|s| s.name.clone()),
            stage_count: state.current_stage_count,
            stage_target: stage.map_or(0, |s| s.target_count),
            total_stages: self.shared.plan.len(),
        }
    }
}

async fn run_guidance(
    shared: Arc<SequencerShared>,
    index: usize,
    stage: Stage,
    cancel: CancellationToken,
) {
    let timing = shared.timing;

    for message in &stage.guidance_messages {
        if cancel.is_cancelled() {
            return;
        }
        shared.cues.guidance(index, &stage, message);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(timing.guidance_dwell) => {}
        }
    }

    for remaining in (1..=timing.countdown_ticks).rev() {
        if cancel.is_cancelled() {
            return;
        }
        shared.cues.countdown_tick(index, remaining);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(timing.tick) => {}
        }
    }

    {
        let mut state = shared.state.lock();
        if cancel.is_cancelled()
            || state.phase != SequencerPhase::Guiding
            || state.current_stage_index != index
        {
            return;
        }
        state.phase = SequencerPhase::Capturing;
    }

    info!(
        "Stage {} ({}) capturing every {}ms until {} images",
        index + 1,
        stage.name,
        stage.interval_ms,
        stage.target_count
    );
    shared.cues.stage_started(index, &stage);
}
