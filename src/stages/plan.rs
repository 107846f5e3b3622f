use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One named capture phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Shown to the subject while the stage is announced
    #[serde(default)]
    pub description: String,
    /// Minimum spacing between captured frames
    pub interval_ms: u64,
    pub target_count: u32,
    #[serde(default)]
    pub guidance_messages: Vec<String>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        interval_ms: u64,
        target_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            interval_ms,
            target_count,
            guidance_messages: Vec::new(),
        }
    }

    pub fn with_guidance<I, S>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guidance_messages = messages.into_iter().map(Into::into).collect();
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// `stage_{n}_{name}`, n being 1-based
    pub fn folder_name(&self, index: usize) -> String {
        format!("stage_{}_{}", index + 1, self.name)
    }

    /// `stage{n}_{name}`, used as the file name prefix
    pub fn file_prefix(&self, index: usize) -> String {
        format!("stage{}_{}", index + 1, self.name)
    }

    fn validate(&self) -> Result<(), StageError> {
        let invalid = |details: &str| StageError::InvalidStage {
            name: self.name.clone(),
            details: details.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self
            .name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':') || c.is_whitespace())
        {
            return Err(invalid("name must be usable as a folder name"));
        }
        if self.interval_ms < 1 {
            return Err(invalid("interval_ms must be at least 1"));
        }
        if self.target_count < 1 {
            return Err(invalid("target_count must be at least 1"));
        }
        Ok(())
    }
}

/// Ordered, validated list of stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self, StageError> {
        if stages.is_empty() {
            return Err(StageError::EmptyPlan);
        }
        for stage in &stages {
            stage.validate()?;
        }
        Ok(Self { stages })
    }

    /// Built-in five-stage eye capture plan
    pub fn eye_capture_default() -> Self {
        Self {
            stages: vec![
                Stage::new("look_straight", "Look straight at the camera", 200, 50)
                    .with_guidance([
                        "Look straight at the camera",
                        "Keep your head still and breathe normally",
                    ]),
                Stage::new(
                    "look_around",
                    "Slowly look up, down, left and right",
                    200,
                    100,
                )
                .with_guidance([
                    "Slowly move your eyes up, down, left and right",
                    "Keep your head still, move only your eyes",
                ]),
                Stage::new("blink", "Blink naturally", 100, 50)
                    .with_guidance(["Blink naturally a few times per second"]),
                Stage::new("squint", "Squint your eyes", 200, 30)
                    .with_guidance(["Narrow your eyes as if looking into the sun"]),
                Stage::new("wide_open", "Open your eyes wide", 200, 30)
                    .with_guidance(["Open your eyes as wide as you can"]),
            ],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn get(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; plans are non-empty by construction
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
