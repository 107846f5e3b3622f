use crate::error::PackagingError;
use crate::session::RecordingSession;
use crate::stages::StagePlan;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Name of the metadata entry at the archive root
pub const MANIFEST_NAME: &str = "recording_info.json";

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Per-stage entry of the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage_number: usize,
    pub stage_name: String,
    pub description: String,
    pub interval_ms: u64,
    pub target_count: u32,
    pub folder_name: String,
    pub image_count: u64,
}

/// Metadata written once into every archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub username: String,
    pub email: String,
    /// ISO-8601 session start, if known
    pub recording_time: Option<String>,
    pub image_count: u64,
    pub image_format: String,
    pub duration_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageManifest>>,
}

/// Seals a session folder into a zip archive next to it
#[derive(Debug, Clone)]
pub struct PackagingService {
    compression_level: i32,
}

impl Default for PackagingService {
    fn default() -> Self {
        Self {
            compression_level: 6,
        }
    }
}

struct PackagingJob {
    root: PathBuf,
    username: String,
    email: String,
    start_time: Option<DateTime<Local>>,
    image_count: u64,
    plan: Option<StagePlan>,
    compression_level: i32,
}

impl PackagingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression_level(compression_level: i32) -> Self {
        Self { compression_level }
    }

    /// Archive the session and remove its folder.
    ///
    /// Returns `Ok(None)` without touching the filesystem when nothing was
    /// captured. On error no archive is left behind and the session folder
    /// is untouched.
    pub async fn finalize(
        &self,
        session: &RecordingSession,
        plan: Option<&StagePlan>,
    ) -> Result<Option<PathBuf>, PackagingError> {
        if session.image_count() == 0 {
            info!("No images captured, nothing to package");
            return Ok(None);
        }

        let job = PackagingJob {
            root: session.root().to_path_buf(),
            username: session.username().to_string(),
            email: session.email().to_string(),
            start_time: session.start_time(),
            image_count: session.image_count(),
            plan: plan.cloned(),
            compression_level: self.compression_level,
        };

        let archive = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| PackagingError::Task {
                details: e.to_string(),
            })??;

        Ok(Some(archive))
    }
}

impl PackagingJob {
    fn run(self) -> Result<PathBuf, PackagingError> {
        let duration_minutes = self
            .start_time
            .map(|start| (Local::now() - start).num_minutes().max(0) as u64)
            .unwrap_or(0);

        let stem = if self.plan.is_some() {
            format!(
                "{}_eyedata_{}pics_{}min",
                self.username, self.image_count, duration_minutes
            )
        } else {
            format!(
                "{}_{}pics_{}min",
                self.username, self.image_count, duration_minutes
            )
        };
        let parent = self.root.parent().unwrap_or_else(|| Path::new("."));
        let archive_path = unused_archive_path(parent, &stem);
        let partial_path = archive_path.with_extension("zip.partial");

        let mut images = Vec::new();
        collect_images(&self.root, &self.root, &mut images)?;
        debug!(
            "Packaging {} files from {}",
            images.len(),
            self.root.display()
        );

        let manifest = self.manifest(duration_minutes, &images);

        if let Err(e) = self.write_archive(&partial_path, &images, &manifest) {
            if let Err(cleanup) = fs::remove_file(&partial_path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Could not remove partial archive {}: {}",
                        partial_path.display(),
                        cleanup
                    );
                }
            }
            return Err(e);
        }

        fs::rename(&partial_path, &archive_path).map_err(|e| {
            let _ = fs::remove_file(&partial_path);
            PackagingError::Archive {
                path: archive_path.clone(),
                details: e.to_string(),
            }
        })?;

        info!(
            "Packaged {} images into {}",
            self.image_count,
            archive_path.display()
        );

        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(
                "Archive written but session folder {} could not be removed: {}",
                self.root.display(),
                e
            );
        }

        Ok(archive_path)
    }

    fn manifest(&self, duration_minutes: u64, images: &[(PathBuf, String)]) -> ArchiveManifest {
        let stages = self.plan.as_ref().map(|plan| {
            plan.stages()
                .iter()
                .enumerate()
                .map(|(index, stage)| {
                    let folder_name = stage.folder_name(index);
                    let prefix = format!("{}/", folder_name);
                    StageManifest {
                        stage_number: index + 1,
                        stage_name: stage.name.clone(),
                        description: stage.description.clone(),
                        interval_ms: stage.interval_ms,
                        target_count: stage.target_count,
                        image_count: images
                            .iter()
                            .filter(|(_, name)| name.starts_with(&prefix))
                            .count() as u64,
                        folder_name,
                    }
                })
                .collect()
        });

        ArchiveManifest {
            username: self.username.clone(),
            email: self.email.clone(),
            recording_time: self.start_time.map(|start| start.to_rfc3339()),
            image_count: self.image_count,
            image_format: "jpg".to_string(),
            duration_minutes,
            stages,
        }
    }

    fn write_archive(
        &self,
        path: &Path,
        images: &[(PathBuf, String)],
        manifest: &ArchiveManifest,
    ) -> Result<(), PackagingError> {
        let archive_error = |details: String| PackagingError::Archive {
            path: path.to_path_buf(),
            details,
        };

        let file = File::create(path).map_err(|e| archive_error(e.to_string()))?;
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level));

        for (source, entry_name) in images {
            writer
                .start_file(entry_name.as_str(), options)
                .map_err(|e| archive_error(e.to_string()))?;
            let mut input = File::open(source).map_err(|e| archive_error(e.to_string()))?;
            io::copy(&mut input, &mut writer).map_err(|e| archive_error(e.to_string()))?;
        }

        let manifest_json =
            serde_json::to_string_pretty(manifest).map_err(|e| PackagingError::Manifest {
                details: e.to_string(),
            })?;
        writer
            .start_file(MANIFEST_NAME, options)
            .map_err(|e| archive_error(e.to_string()))?;
        io::Write::write_all(&mut writer, manifest_json.as_bytes())
            .map_err(|e| archive_error(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| archive_error(e.to_string()))?;
        Ok(())
    }
}

/// `{stem}.zip`, or `{stem}_2.zip`, `{stem}_3.zip`, ... if taken
fn unused_archive_path(parent: &Path, stem: &str) -> PathBuf {
    let mut candidate = parent.join(format!("{}.zip", stem));
    let mut n = 2;
    while candidate.exists() {
        candidate = parent.join(format!("{}_{}.zip", stem, n));
        n += 1;
    }
    candidate
}

/// Collect image files below `dir` as (absolute path, `/`-separated entry name)
fn collect_images(
    root: &Path,
    dir: &Path,
    images: &mut Vec<(PathBuf, String)>,
) -> Result<(), PackagingError> {
    let walk_error = |source| PackagingError::Walk {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(dir)
        .map_err(walk_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(walk_error)?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type().map_err(walk_error)?;

        if file_type.is_dir() {
            collect_images(root, &path, images)?;
        } else if file_type.is_file() && is_image(&path) {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let entry_name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            images.push((path.clone(), entry_name));
        }
    }

    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::stages::Stage;
    use image::RgbImage;
    use std::collections::BTreeSet;
    use std::io::Read;
    use tempfile::TempDir;

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(20, 20, image::Rgb([1, 2, 3])))
    }

    fn archive_entries(path: &Path) -> BTreeSet<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    fn read_manifest(path: &Path) -> ArchiveManifest {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut json = String::new();
        archive
            .by_name(MANIFEST_NAME)
            .unwrap()
            .read_to_string(&mut json)
            .unwrap();
        serde_json::from_str(&json).unwrap()
    }

    fn dir_listing(dir: &Path) -> Vec<PathBuf> {
        let mut names: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_empty_session_is_not_packaged() {
        let temp_dir = TempDir::new().unwrap();
        let session = RecordingSession::create(temp_dir.path(), "alice", "", 95)
            .await
            .unwrap();
        let before = dir_listing(temp_dir.path());

        let result = PackagingService::new().finalize(&session, None).await.unwrap();

        assert!(result.is_none());
        assert_eq!(dir_listing(temp_dir.path()), before);
        assert!(session.root().is_dir());
    }

    #[tokio::test]
    async fn test_single_mode_archive() {
        let temp_dir = TempDir::new().unwrap();
        let mut session = RecordingSession::create(temp_dir.path(), "alice", "a@example.com", 95)
            .await
            .unwrap();
        for _ in 0..3 {
            assert!(session.save_frame(&frame(), "").await);
        }
        let expected: BTreeSet<String> = fs::read_dir(session.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .chain(std::iter::once(MANIFEST_NAME.to_string()))
            .collect();

        let archive = PackagingService::new()
            .finalize(&session, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(archive, temp_dir.path().join("alice_3pics_0min.zip"));
        assert_eq!(archive_entries(&archive), expected);
        assert!(!session.root().exists());
        assert!(!temp_dir.path().join("alice_3pics_0min.zip.partial").exists());

        let manifest = read_manifest(&archive);
        assert_eq!(manifest.username, "alice");
        assert_eq!(manifest.email, "a@example.com");
        assert_eq!(manifest.image_count, 3);
        assert_eq!(manifest.image_format, "jpg");
        assert_eq!(manifest.duration_minutes, 0);
        assert!(manifest.recording_time.is_some());
        assert!(manifest.stages.is_none());
    }

    #[tokio::test]
    async fn test_multi_stage_archive_keeps_folders() {
        let temp_dir = TempDir::new().unwrap();
        let mut session = RecordingSession::create(temp_dir.path(), "bob", "", 95)
            .await
            .unwrap();
        let plan = StagePlan::new(vec![
            Stage::new("center", "Look at the lens", 100, 2),
            Stage::new("blink", "Blink", 50, 1),
        ])
        .unwrap();

        for (index, stage) in plan.stages().iter().enumerate() {
            let folder = stage.folder_name(index);
            fs::create_dir_all(session.root().join(&folder)).unwrap();
            for n in 0..(stage.target_count) {
                let name = format!("{}_x_{:04}.jpg", stage.file_prefix(index), n + 1);
                assert!(session.save_frame_as(&frame(), Path::new(&folder), &name).await);
            }
        }

        let archive = PackagingService::new()
            .finalize(&session, Some(&plan))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(archive.file_name().unwrap(), "bob_eyedata_3pics_0min.zip");
        let entries = archive_entries(&archive);
        assert!(entries.contains("stage_1_center/stage1_center_x_0001.jpg"));
        assert!(entries.contains("stage_1_center/stage1_center_x_0002.jpg"));
        assert!(entries.contains("stage_2_blink/stage2_blink_x_0001.jpg"));
        assert_eq!(entries.len(), 4);

        let stages = read_manifest(&archive).stages.unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_number, 1);
        assert_eq!(stages[0].folder_name, "stage_1_center");
        assert_eq!(stages[0].image_count, 2);
        assert_eq!(stages[1].stage_name, "blink");
        assert_eq!(stages[1].interval_ms, 50);
        assert_eq!(stages[1].image_count, 1);
    }

    #[tokio::test]
    async fn test_existing_archive_is_not_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("dave_1pics_0min.zip");
        fs::write(&existing, b"earlier archive").unwrap();

        let mut session = RecordingSession::create(temp_dir.path(), "dave", "", 95)
            .await
            .unwrap();
        assert!(session.save_frame(&frame(), "").await);

        let archive = PackagingService::new()
            .finalize(&session, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(archive, temp_dir.path().join("dave_1pics_0min_2.zip"));
        assert_eq!(fs::read(&existing).unwrap(), b"earlier archive");
        assert!(archive_entries(&archive).contains(MANIFEST_NAME));
    }

    #[tokio::test]
    async fn test_failed_archive_leaves_folder_intact() {
        let temp_dir = TempDir::new().unwrap();
        let mut session = RecordingSession::create(temp_dir.path(), "carol", "", 95)
            .await
            .unwrap();
        assert!(session.save_frame(&frame(), "").await);

        // A directory where the partial archive should go makes File::create fail
        fs::create_dir(temp_dir.path().join("carol_1pics_0min.zip.partial")).unwrap();

        let result = PackagingService::new().finalize(&session, None).await;
        assert!(matches!(result, Err(PackagingError::Archive { .. })));
        assert!(session.root().is_dir());
        assert_eq!(fs::read_dir(session.root()).unwrap().count(), 1);
        assert!(!temp_dir.path().join("carol_1pics_0min.zip").exists());
    }
}
