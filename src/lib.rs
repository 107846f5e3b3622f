pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod keyboard_input;
pub mod packaging;
pub mod processing;
pub mod reconnect;
pub mod recorder;
pub mod session;
pub mod stages;
pub mod status;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use config::EyecapConfig;
pub use error::{EyecapError, Result};
pub use events::{EventBus, EventFilter, EventReceiver, EyecapEvent};
pub use frame::{Frame, FrameDecoder};
pub use keyboard_input::{KeyCommand, KeyboardInputHandler};
pub use packaging::{ArchiveManifest, PackagingService};
pub use processing::{FrameProcessor, ProcessingConfig, RegionOfInterest, Rotation};
pub use reconnect::{LinkLostOutcome, ReconnectPolicy, ReconnectSupervisor, StreamLink};
pub use recorder::{Recorder, RecorderStatus, RecordingMode, StopReason, UserInfo};
pub use session::{RecordingSession, SessionInfo};
pub use stages::{CuePlayer, EventCuePlayer, Stage, StagePlan, StageSequencer, StageTiming};
pub use status::{status_summary, StatusEvent, StatusMessageParser};
pub use stream::{
    ConnectionInfo, ConnectionState, DeviceStreamClient, DeviceType, DisconnectReason,
    StreamEndpoint,
};
