//! Scratch storage for uploads and derived media files.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Directory where uploads and intermediate files live
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    dir: PathBuf,
}

impl ScratchSpace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh unique path inside the scratch directory; nothing is created yet
    pub async fn temp_path(&self, extension: Option<&str>) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ServiceError::file_system("create_temp_file", Some(self.dir.clone()), e))?;

        let filename = match extension {
            Some(ext) if !ext.is_empty() => format!("whisperrr_{}.{}", Uuid::new_v4(), ext),
            _ => format!("whisperrr_{}", Uuid::new_v4()),
        };
        Ok(self.dir.join(filename))
    }

    /// Write uploaded bytes to scratch storage, keeping the upload's extension
    pub async fn persist_upload(&self, original_name: &str, bytes: &[u8]) -> Result<ScratchFile> {
        let safe_name = safe_filename(original_name);
        let extension = Path::new(&safe_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());

        let path = self.temp_path(extension.as_deref()).await?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ServiceError::file_system("persist_upload", Some(path.clone()), e))?;

        debug!("💾 Persisted upload {} ({} bytes) to {}", safe_name, bytes.len(), path.display());
        Ok(ScratchFile::new(path))
    }
}

/// A scratch file deleted when dropped unless ownership is handed off
#[derive(Debug)]
pub struct ScratchFile {
    path: Option<PathBuf>,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Hand the file to the caller; it will no longer be deleted on drop
    pub fn persist(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            remove_quietly(&path);
        }
    }
}

/// Delete a file, logging and swallowing any failure
pub fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("🧹 Removed scratch file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove scratch file {}: {}", path.display(), e),
    }
}

/// Strip path components and unsafe characters from an uploaded filename
pub fn safe_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .replace("..", "");

    let mut safe = String::with_capacity(base.len());
    for c in base.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' };
        if c == '_' && safe.ends_with('_') {
            continue;
        }
        safe.push(c);
    }

    let safe: String = safe
        .trim_matches(|c| matches!(c, '.' | '_' | ' '))
        .chars()
        .take(255)
        .collect();

    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// Lowercase extension of a path, without the dot
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| !e.is_empty())
}
