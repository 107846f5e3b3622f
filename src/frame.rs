use crate::error::DecodeError;
use image::RgbImage;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;
use tracing::debug;

/// Smallest payload accepted as a compressed image. Anything shorter is
/// rejected before the codec runs.
pub const MIN_FRAME_BYTES: usize = 100;

/// Decoded 3-channel color frame with its arrival time
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded pixels (shared ownership, frames fan out to several consumers)
    pub image: Arc<RgbImage>,
    /// Wall-clock arrival time, used in file names
    pub timestamp: SystemTime,
    /// Monotonic arrival time, used for throttling and the watchdog
    pub received_at: Instant,
}

impl Frame {
    /// Wrap an already decoded image, stamped with the current time
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            timestamp: SystemTime::now(),
            received_at: Instant::now(),
        }
    }

    /// Override the monotonic arrival time
    pub fn with_received_at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Stateless decoder for binary frame payloads
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    min_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            min_size: MIN_FRAME_BYTES,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder with a custom minimum payload size
    pub fn with_min_size(min_size: usize) -> Self {
        Self { min_size }
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Decode a compressed image payload into a color frame
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        if bytes.len() < self.min_size {
            return Err(DecodeError::TooSmall {
                len: bytes.len(),
                min: self.min_size,
            });
        }

        let decoded = image::load_from_memory(bytes).map_err(|e| DecodeError::Invalid {
            details: e.to_string(),
        })?;

        let frame = Frame::new(decoded.to_rgb8());
        debug!(
            "Decoded {} byte payload into {}x{} frame",
            bytes.len(),
            frame.width(),
            frame.height()
        );

        Ok(frame)
    }
}
