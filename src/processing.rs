use crate::frame::Frame;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Rotation options for frame processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    /// Rotate 90 degrees clockwise
    Rotate90,
    /// Rotate 180 degrees
    Rotate180,
    /// Rotate 270 degrees clockwise (90 degrees counter-clockwise)
    Rotate270,
}

impl Rotation {
    /// Get rotation angle in degrees
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }
}

/// Crop rectangle in image coordinates (after rotation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp the rectangle so it lies inside an image of the given size and
    /// is at least one pixel in each direction.
    pub fn clamped(&self, image_width: u32, image_height: u32) -> Self {
        let x = self.x.min(image_width.saturating_sub(1));
        let y = self.y.min(image_height.saturating_sub(1));
        let width = self.width.min(image_width - x).max(1);
        let height = self.height.min(image_height - y).max(1);
        Self::new(x, y, width, height)
    }
}

/// Optional transformations applied to frames before they are saved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub rotation: Option<Rotation>,
    #[serde(default)]
    pub roi: Option<RegionOfInterest>,
    /// Final (width, height); frames keep their size when absent
    #[serde(default)]
    pub target_size: Option<(u32, u32)>,
}

/// Applies rotation, then crop, then resize
#[derive(Debug, Clone, Default)]
pub struct FrameProcessor {
    config: ProcessingConfig,
}

impl FrameProcessor {
    pub fn new(config: ProcessingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// True when processing leaves frames untouched
    pub fn is_identity(&self) -> bool {
        self.config.rotation.is_none()
            && self.config.roi.is_none()
            && self.config.target_size.is_none()
    }

    /// Process a frame, keeping its arrival timestamps
    pub fn process(&self, frame: &Frame) -> Frame {
        if self.is_identity() {
            return frame.clone();
        }

        let source = frame.image.as_ref();
        let mut image = match self.config.rotation {
            Some(Rotation::Rotate90) => imageops::rotate90(source),
            Some(Rotation::Rotate180) => imageops::rotate180(source),
            Some(Rotation::Rotate270) => imageops::rotate270(source),
            None => source.clone(),
        };

        if let Some(roi) = self.config.roi {
            let roi = roi.clamped(image.width(), image.height());
            image = imageops::crop_imm(&image, roi.x, roi.y, roi.width, roi.height).to_image();
        }

        if let Some((width, height)) = self.config.target_size {
            if image.dimensions() != (width, height) {
                image = imageops::resize(&image, width, height, FilterType::Lanczos3);
            }
        }

        debug!(
            "Processed frame {}x{} -> {}x{}",
            frame.width(),
            frame.height(),
            image.width(),
            image.height()
        );

        Frame {
            image: Arc::new(image),
            timestamp: frame.timestamp,
            received_at: frame.received_at,
        }
    }

    /// File name suffix describing the applied transformations, e.g. `_rot90_roi`
    pub fn suffix(&self) -> String {
        let mut parts = Vec::new();
        if let Some(rotation) = self.config.rotation {
            parts.push(format!("rot{}", rotation.degrees()));
        }
        if self.config.roi.is_some() {
            parts.push("roi".to_string());
        }

        if parts.is_empty() {
            String::new()
        } else {
            format!("_{}", parts.join("_"))
        }
    }
}
