mod consumer;
mod orchestrator;
mod types;

pub use orchestrator::Recorder;
pub use types::{RecorderStatus, RecordingMode, StopReason, UserInfo};
