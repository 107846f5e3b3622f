mod recording;

pub(crate) use recording::file_timestamp;
pub use recording::{format_elapsed, RecordingSession, SessionInfo};
