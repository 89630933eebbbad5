//! Folder-based stage tracking for video artifacts.
//!
//! An artifact moves through named folders (`staging` → `processing` →
//! `finished`, or `failed`). Placing into the first stage links the source so
//! upstream consumers of the original file (e.g. a torrent still seeding) are
//! never disturbed; every later transition is a move.

use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs;
use tracing::{debug, info, warn};

/// Files at or below this size are treated as samples/ads during directory
/// resolution.
pub const MIN_VIDEO_SIZE: u64 = 200 * 1024 * 1024;

const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts"];

static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z]{2,5}-\d{3,5})").expect("valid code pattern"));

/// The stage folders of one data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderLayout {
    pub input: PathBuf,
    pub staging: PathBuf,
    pub processing: PathBuf,
    pub finished: PathBuf,
    pub subtitles: PathBuf,
    pub failed: PathBuf,
}

impl FolderLayout {
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            input: root.join("input"),
            staging: root.join("staging"),
            processing: root.join("processing"),
            finished: root.join("finished"),
            subtitles: root.join("subtitles"),
            failed: root.join("failed"),
        }
    }

    /// Creates every stage folder.
    pub async fn ensure_all(&self) -> io::Result<()> {
        for dir in [
            &self.input,
            &self.staging,
            &self.processing,
            &self.finished,
            &self.subtitles,
            &self.failed,
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Places `source` into `stage_dir` under its own file name.
///
/// Tries a hard link first; when that fails (typically across filesystems)
/// the file is copied. The source is never modified.
pub async fn place_at_stage(source: &Path, stage_dir: &Path) -> io::Result<PathBuf> {
    let dest = stage_dir.join(file_name_of(source)?);
    fs::create_dir_all(stage_dir).await?;

    match fs::hard_link(source, &dest).await {
        Ok(()) => {
            debug!("Hard-linked: {} -> {}", source.display(), dest.display());
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && same_file(source, &dest).await => {
            debug!("Already staged: {}", dest.display());
        }
        Err(e) => {
            debug!("Hard link failed ({}), falling back to copy", e);
            fs::copy(source, &dest).await?;
            debug!("Copied: {} -> {}", source.display(), dest.display());
        }
    }

    Ok(dest)
}

/// Moves `current` into `target_dir`, keeping its file name.
pub async fn advance_stage(current: &Path, target_dir: &Path) -> io::Result<PathBuf> {
    let dest = target_dir.join(file_name_of(current)?);
    advance_to(current, &dest).await?;
    Ok(dest)
}

/// Moves `current` to exactly `dest`, creating the parent folder.
///
/// A rename is attempted first. If it fails the file is copied and the source
/// removed; a failed removal only logs a warning and leaves an orphan copy.
pub async fn advance_to(current: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(current, dest).await {
        Ok(()) => {
            debug!("Moved: {} -> {}", current.display(), dest.display());
            Ok(())
        }
        Err(e) => {
            debug!("Rename failed ({}), falling back to copy+delete", e);
            copy_then_remove(current, dest).await
        }
    }
}

async fn copy_then_remove(current: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(current, dest).await?;

    if let Err(e) = fs::remove_file(current).await {
        warn!(
            "Failed to remove source after copy: {}: {}",
            current.display(),
            e
        );
    }

    debug!("Moved (copy+delete): {} -> {}", current.display(), dest.display());
    Ok(())
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a).await, fs::metadata(b).await) {
        (Ok(ma), Ok(mb)) => same_inode(&ma, &mb),
        _ => false,
    }
}

#[cfg(unix)]
fn same_inode(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_inode(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

fn file_name_of(path: &Path) -> io::Result<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {}", path.display()),
        )
    })
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively lists video files under `dir`, sorted by path.
pub async fn find_video_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut videos = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if is_video_file(&path) {
                videos.push(path);
            }
        }
    }

    videos.sort();
    Ok(videos)
}

pub fn has_video_code(file_name: &str) -> bool {
    CODE_PATTERN.is_match(&file_name.to_uppercase())
}

/// Picks the single video worth processing inside a download directory.
///
/// Candidates need a video code in their name and a size above `min_size`;
/// the largest candidate wins. Returns `None` when nothing qualifies.
pub async fn find_valid_video_file(dir: &Path, min_size: u64) -> io::Result<Option<PathBuf>> {
    let videos = find_video_files(dir).await?;
    let mut best: Option<(PathBuf, u64)> = None;

    for path in videos {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !has_video_code(&name) {
            debug!("Skipped (no code pattern): {}", name);
            continue;
        }

        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!("Skipped (stat error): {}: {}", name, e);
                continue;
            }
        };

        if size <= min_size {
            debug!("Skipped (too small: {}MB): {}", size / (1024 * 1024), name);
            continue;
        }

        if best.as_ref().map_or(true, |(_, best_size)| size > *best_size) {
            best = Some((path, size));
        }
    }

    if let Some((path, size)) = &best {
        info!(
            "Selected video: {} ({}MB)",
            path.display(),
            size / (1024 * 1024)
        );
    }

    Ok(best.map(|(path, _)| path))
}

/// Normalises a messy release name to `CODE.ext`.
///
/// `site.com@sone-269-C.MP4` becomes `SONE-269.mp4`; names without a code are
/// returned unchanged.
pub fn clean_video_filename(file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    match CODE_PATTERN.find(&file_name.to_uppercase()) {
        Some(code) => format!("{}{}", code.as_str(), ext),
        None => file_name.to_string(),
    }
}

/// File name with its extension swapped for `new_ext` (including the dot).
pub fn with_extension(file_name: &str, new_ext: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    format!("{}{}", stem, new_ext)
}

/// Writes a short placeholder subtitle used when tools are skipped.
pub async fn write_placeholder_subtitle(path: &Path) -> io::Result<()> {
    let content = "1\n00:00:00,000 --> 00:00:05,000\n[Dry run test subtitle]\n\n\
                   2\n00:00:05,000 --> 00:00:10,000\n\
                   This is a dummy subtitle for testing the workflow.\n";
    fs::write(path, content).await
}
