use crate::error::SessionError;
use crate::frame::Frame;
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info};

/// Progress snapshot of a recording session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub image_count: u64,
    pub elapsed: Duration,
    /// `HH:MM:SS`
    pub elapsed_display: String,
    pub folder: PathBuf,
}

/// One recording effort, backed by one folder on disk.
///
/// `image_count` only ever counts files that were actually written, and
/// the counter embedded in file names follows it.
#[derive(Debug)]
pub struct RecordingSession {
    root: PathBuf,
    username: String,
    email: String,
    start_time: Option<DateTime<Local>>,
    image_count: u64,
    jpeg_quality: u8,
    last_saved: Option<PathBuf>,
}

impl RecordingSession {
    /// Create `{output_dir}/{username}_{YYYYMMDD_HHMMSS}` and start the clock
    pub async fn create(
        output_dir: impl AsRef<Path>,
        username: &str,
        email: &str,
        jpeg_quality: u8,
    ) -> Result<Self, SessionError> {
        let username = sanitize_username(username)?;
        let start_time = Local::now();
        let root = output_dir.as_ref().join(format!(
            "{}_{}",
            username,
            start_time.format("%Y%m%d_%H%M%S")
        ));

        fs::create_dir_all(&root)
            .await
            .map_err(|source| SessionError::DirectoryCreation {
                path: root.clone(),
                source,
            })?;

        info!("Recording session started in {}", root.display());

        Ok(Self {
            root,
            username,
            email: email.trim().to_string(),
            start_time: Some(start_time),
            image_count: 0,
            jpeg_quality: jpeg_quality.clamp(1, 100),
            last_saved: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        self.start_time
    }

    pub fn image_count(&self) -> u64 {
        self.image_count
    }

    /// Path of the most recent successful save
    pub fn last_saved(&self) -> Option<&Path> {
        self.last_saved.as_deref()
    }

    /// Save into the session root as `img_{timestamp}_{counter:06}{suffix}.jpg`
    pub async fn save_frame(&mut self, frame: &Frame, suffix: &str) -> bool {
        let file_name = format!(
            "img_{}_{:06}{}.jpg",
            file_timestamp(frame),
            self.image_count,
            suffix
        );
        let path = self.root.join(file_name);
        self.save_to(frame, path).await
    }

    /// Save under `relative_dir` (inside the session root) with a caller-chosen name
    pub async fn save_frame_as(&mut self, frame: &Frame, relative_dir: &Path, file_name: &str) -> bool {
        let path = self.root.join(relative_dir).join(file_name);
        self.save_to(frame, path).await
    }

    async fn save_to(&mut self, frame: &Frame, path: PathBuf) -> bool {
        match self.write_jpeg(frame, &path).await {
            Ok(()) => {
                self.image_count += 1;
                debug!("Saved image #{} to {}", self.image_count, path.display());
                self.last_saved = Some(path);
                true
            }
            Err(e) => {
                error!("Failed to save frame: {}", e);
                false
            }
        }
    }

    async fn write_jpeg(&self, frame: &Frame, path: &Path) -> Result<(), SessionError> {
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality)
            .encode(
                frame.image.as_raw(),
                frame.width(),
                frame.height(),
                ColorType::Rgb8,
            )
            .map_err(|e| SessionError::Encode {
                details: e.to_string(),
            })?;

        fs::write(path, buffer)
            .await
            .map_err(|source| SessionError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time
            .map(|start| (Local::now() - start).to_std().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn session_info(&self) -> SessionInfo {
        let elapsed = self.elapsed();
        SessionInfo {
            image_count: self.image_count,
            elapsed,
            elapsed_display: format_elapsed(elapsed),
            folder: self.root.clone(),
        }
    }
}

/// Format a duration as `HH:MM:SS`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Frame arrival time as `YYYYMMDD_HHMMSS_mmm`
pub(crate) fn file_timestamp(frame: &Frame) -> String {
    DateTime::<Local>::from(frame.timestamp)
        .format("%Y%m%d_%H%M%S_%3f")
        .to_string()
}

fn sanitize_username(username: &str) -> Result<String, SessionError> {
    let cleaned: String = username
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_' || c == '.') {
        return Err(SessionError::InvalidUser {
            details: format!("'{}' cannot be used as a folder name", username),
        });
    }

    Ok(cleaned)
}
