mod cue;
mod plan;
mod sequencer;
#[cfg(test)]
mod tests;

pub use cue::{CuePlayer, EventCuePlayer};
pub use plan::{Stage, StagePlan};
pub use sequencer::{SequencerPhase, StageProgress, StageSequencer, StageTiming};
