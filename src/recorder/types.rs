use crate::error::Result;
use crate::frame::Frame;
use crate::session::SessionInfo;
use crate::stages::StageProgress;
use crate::stream::ConnectionInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Who is being recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub email: String,
}

impl UserInfo {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingMode {
    /// Every frame (subject to the capture interval) goes into the session root
    Single,
    /// Frames are routed through the stage plan
    MultiStage,
}

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    PlanComplete,
    LinkLost,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::Requested => "stopped by user",
            StopReason::PlanComplete => "all stages complete",
            StopReason::LinkLost => "device connection lost",
            StopReason::Shutdown => "shutting down",
        };
        f.write_str(reason)
    }
}

/// Snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub connection: ConnectionInfo,
    pub mode: Option<RecordingMode>,
    pub session: Option<SessionInfo>,
    pub stage: Option<StageProgress>,
    /// Finished sessions whose packaging failed and will be retried on
    /// the next stop or disconnect
    pub packaging_pending: usize,
}

impl RecorderStatus {
    pub fn is_recording(&self) -> bool {
        self.mode.is_some()
    }
}

/// Everything that mutates recording state goes through the consumer task
/// as one of these.
pub(crate) enum RecorderCommand {
    Frame(Frame),
    CaptureNow {
        reply: oneshot::Sender<bool>,
    },
    StartRecording {
        user: UserInfo,
        mode: RecordingMode,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    StopRecording {
        reason: StopReason,
        reply: Option<oneshot::Sender<Result<Option<PathBuf>>>>,
    },
    Status {
        connection: ConnectionInfo,
        reply: oneshot::Sender<RecorderStatus>,
    },
    Connected,
    LinkLost,
    ReconnectGaveUp,
    PlanComplete,
    Shutdown,
}
