use super::*;
use crate::error::StageError;
use crate::events::{EventBus, EyecapEvent};
use crate::frame::Frame;
use crate::session::RecordingSession;
use image::RgbImage;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
enum Cue {
    Guidance(usize, String),
    Tick(usize, u32),
    Started(usize),
    Complete(usize, u32),
    PlanComplete(usize),
}

#[derive(Default)]
struct RecordingCues {
    cues: Mutex<Vec<Cue>>,
}

impl RecordingCues {
    fn cues(&self) -> Vec<Cue> {
        self.cues.lock().clone()
    }
}

impl CuePlayer for RecordingCues {
    fn guidance(&self, stage_index: usize, _stage: &Stage, message: &str) {
        self.cues
            .lock()
            .push(Cue::Guidance(stage_index, message.to_string()));
    }

    fn countdown_tick(&self, stage_index: usize, remaining: u32) {
        self.cues.lock().push(Cue::Tick(stage_index, remaining));
    }

    fn stage_started(&self, stage_index: usize, _stage: &Stage) {
        self.cues.lock().push(Cue::Started(stage_index));
    }

    fn stage_complete(&self, stage_index: usize, _stage: &Stage, captured: u32) {
        self.cues.lock().push(Cue::Complete(stage_index, captured));
    }

    fn plan_complete(&self, stages: usize) {
        self.cues.lock().push(Cue::PlanComplete(stages));
    }
}

fn two_stage_plan() -> StagePlan {
    StagePlan::new(vec![
        Stage::new("center", "Look at the lens", 100, 3).with_guidance(["Look at the lens"]),
        Stage::new("blink", "Blink", 100, 2).with_guidance(["Blink now", "Keep blinking"]),
    ])
    .unwrap()
}

fn frame() -> Frame {
    Frame::new(RgbImage::from_pixel(16, 16, image::Rgb([200, 40, 40])))
}

async fn wait_for_phase(sequencer: &StageSequencer, phase: SequencerPhase, stage_index: usize) {
    for _ in 0..1000 {
        if sequencer.phase() == phase && sequencer.current_stage_index() == stage_index {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "sequencer never reached {:?} at stage {} (now {:?})",
        phase,
        stage_index,
        sequencer.progress()
    );
}

/// Feed frames spaced wider than the stage interval
async fn feed(sequencer: &StageSequencer, session: &mut RecordingSession, count: usize) {
    for _ in 0..count {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sequencer.on_frame(session, &frame()).await);
    }
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_plan_validation() {
    assert!(matches!(StagePlan::new(vec![]), Err(StageError::EmptyPlan)));
    assert!(matches!(
        StagePlan::new(vec![Stage::new("a", "", 0, 1)]),
        Err(StageError::InvalidStage { .. })
    ));
    assert!(matches!(
        StagePlan::new(vec![Stage::new("a", "", 10, 0)]),
        Err(StageError::InvalidStage { .. })
    ));
    assert!(matches!(
        StagePlan::new(vec![Stage::new("../x", "", 10, 1)]),
        Err(StageError::InvalidStage { .. })
    ));

    let plan = StagePlan::eye_capture_default();
    assert_eq!(plan.len(), 5);
    assert!(StagePlan::new(plan.stages().to_vec()).is_ok());
}

#[test]
fn test_stage_naming() {
    let stage = Stage::new("blink", "", 100, 2);
    assert_eq!(stage.folder_name(1), "stage_2_blink");
    assert_eq!(stage.file_prefix(1), "stage2_blink");
}

#[tokio::test(start_paused = true)]
async fn test_plan_runs_to_completion() {
    let temp_dir = TempDir::new().unwrap();
    let mut session = RecordingSession::create(temp_dir.path(), "alice", "", 90)
        .await
        .unwrap();
    let cues = Arc::new(RecordingCues::default());
    let sequencer = StageSequencer::new(two_stage_plan(), StageTiming::default(), cues.clone());

    sequencer.begin(&session).await.unwrap();
    assert!(session.root().join("stage_1_center").is_dir());
    assert!(session.root().join("stage_2_blink").is_dir());

    // Frames during guidance are not captured
    assert_eq!(sequencer.phase(), SequencerPhase::Guiding);
    assert!(!sequencer.on_frame(&mut session, &frame()).await);

    wait_for_phase(&sequencer, SequencerPhase::Capturing, 0).await;
    feed(&sequencer, &mut session, 3).await;
    assert_eq!(sequencer.phase(), SequencerPhase::Completing);
    assert!(!sequencer.on_frame(&mut session, &frame()).await);

    wait_for_phase(&sequencer, SequencerPhase::Capturing, 1).await;
    feed(&sequencer, &mut session, 2).await;

    wait_for_phase(&sequencer, SequencerPhase::Complete, 2).await;
    assert!(sequencer.is_complete());

    // A sixth frame after completion is a no-op
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!sequencer.on_frame(&mut session, &frame()).await);

    assert_eq!(session.image_count(), 5);
    assert_eq!(sequencer.captured_per_stage(), vec![3, 2]);
    assert_eq!(count_files(&session.root().join("stage_1_center")), 3);
    assert_eq!(count_files(&session.root().join("stage_2_blink")), 2);

    let names: Vec<String> = std::fs::read_dir(session.root().join("stage_2_blink"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names
        .iter()
        .all(|n| n.starts_with("stage2_blink_") && n.ends_with(".jpg")));
    assert!(names.iter().any(|n| n.ends_with("_0002.jpg")));

    let cues = cues.cues();
    let ticks = cues.iter().filter(|c| matches!(c, Cue::Tick(..))).count();
    assert_eq!(ticks, 10);
    assert_eq!(cues[0], Cue::Guidance(0, "Look at the lens".to_string()));
    assert_eq!(cues[1], Cue::Tick(0, 5));
    assert!(cues.contains(&Cue::Started(0)));
    assert!(cues.contains(&Cue::Complete(0, 3)));
    assert!(cues.contains(&Cue::Guidance(1, "Keep blinking".to_string())));
    assert!(cues.contains(&Cue::Complete(1, 2)));
    assert_eq!(cues.last(), Some(&Cue::PlanComplete(2)));
}

#[tokio::test(start_paused = true)]
async fn test_interval_throttles_capture() {
    let temp_dir = TempDir::new().unwrap();
    let mut session = RecordingSession::create(temp_dir.path(), "alice", "", 90)
        .await
        .unwrap();
    let plan = StagePlan::new(vec![Stage::new("slow", "", 500, 10)]).unwrap();
    let sequencer = StageSequencer::new(plan, StageTiming::default(), Arc::new(RecordingCues::default()));

    sequencer.begin(&session).await.unwrap();
    wait_for_phase(&sequencer, SequencerPhase::Capturing, 0).await;

    let mut accepted = 0;
    for _ in 0..10 {
        if sequencer.on_frame(&mut session, &frame()).await {
            accepted += 1;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Frames at 0, 200, ..., 1800ms with a 500ms interval: 0, 600, 1200, 1800
    assert_eq!(accepted, 4);
    assert_eq!(sequencer.progress().stage_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_guidance_prevents_capture() {
    let temp_dir = TempDir::new().unwrap();
    let mut session = RecordingSession::create(temp_dir.path(), "alice", "", 90)
        .await
        .unwrap();
    let cues = Arc::new(RecordingCues::default());
    let sequencer = StageSequencer::new(two_stage_plan(), StageTiming::default(), cues.clone());

    sequencer.begin(&session).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    sequencer.stop();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sequencer.phase(), SequencerPhase::Stopped);
    assert!(!sequencer.on_frame(&mut session, &frame()).await);
    assert!(!cues.cues().contains(&Cue::Started(0)));

    sequencer.advance_to(1);
    assert_eq!(sequencer.phase(), SequencerPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_stage_keeps_partial_frames() {
    let temp_dir = TempDir::new().unwrap();
    let mut session = RecordingSession::create(temp_dir.path(), "alice", "", 90)
        .await
        .unwrap();
    let sequencer = StageSequencer::new(
        two_stage_plan(),
        StageTiming::default(),
        Arc::new(RecordingCues::default()),
    );

    sequencer.begin(&session).await.unwrap();
    wait_for_phase(&sequencer, SequencerPhase::Capturing, 0).await;
    feed(&sequencer, &mut session, 2).await;
    sequencer.stop();

    assert!(!sequencer.on_frame(&mut session, &frame()).await);
    assert_eq!(count_files(&session.root().join("stage_1_center")), 2);
    assert_eq!(session.image_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_event_cue_player_publishes() {
    let bus = Arc::new(EventBus::new(64));
    let mut receiver = bus.subscribe();
    let cues = EventCuePlayer::new(Arc::clone(&bus), false);
    let stage = Stage::new("center", "", 100, 3);

    cues.guidance(0, &stage, "Look at the lens");
    cues.countdown_tick(0, 3);
    cues.plan_complete(1);

    assert!(matches!(
        receiver.recv().await.unwrap(),
        EyecapEvent::StageGuidance { stage_index: 0, .. }
    ));
    assert!(matches!(
        receiver.recv().await.unwrap(),
        EyecapEvent::StageCountdown { remaining: 3, .. }
    ));
    assert!(matches!(
        receiver.recv().await.unwrap(),
        EyecapEvent::PlanCompleted { stages: 1 }
    ));
}
