use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

const FALLBACK_FILE_NAME: &str = "upload";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Staged file already exists: {0}")]
    Collision(PathBuf),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of one image received on the upload route.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub original_name: String,
    pub path: PathBuf,
    pub content_type: String,
    pub size: u64,
}

impl UploadedFile {
    pub fn staged_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
    }
}

/// An upload written to the staging directory.
///
/// Call [`StagedFile::remove`] once the file has been used. Any value dropped
/// without it unlinks the file synchronously, so every exit path of the
/// owning request removes it exactly once.
#[derive(Debug)]
pub struct StagedFile {
    file: UploadedFile,
    writer: Option<fs::File>,
    removed: bool,
}

impl StagedFile {
    pub async fn create(
        dir: &Path,
        original_name: &str,
        content_type: &str,
    ) -> Result<Self, StagingError> {
        let path = dir.join(staged_file_name(original_name, epoch_millis()));

        let writer = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StagingError::Collision(path.clone()),
                _ => StagingError::Io(e),
            })?;

        tracing::debug!("Staging upload at {}", path.display());

        Ok(Self {
            file: UploadedFile {
                original_name: original_name.to_string(),
                path,
                content_type: content_type.to_string(),
                size: 0,
            },
            writer: Some(writer),
            removed: false,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(chunk).await?;
            self.file.size += chunk.len() as u64;
        }
        Ok(())
    }

    /// Flushes pending writes and closes the handle. The file stays on disk.
    pub async fn finish(&mut self) -> Result<(), StagingError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.file.size
    }

    pub fn info(&self) -> &UploadedFile {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Unlinks the file on the runtime. Failures are logged, never returned.
    pub async fn remove(mut self) {
        self.writer.take();
        let result = fs::remove_file(&self.file.path).await;
        self.removed = true;
        log_removal(&self.file.path, result);
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.writer.take();
        log_removal(&self.file.path, std::fs::remove_file(&self.file.path));
    }
}

fn log_removal(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!("Removed staged file {}", path.display()),
        Err(e) => tracing::warn!("Failed to remove staged file {}: {}", path.display(), e),
    }
}

pub async fn ensure_upload_dir(dir: &Path) -> std::io::Result<()> {
    if fs::try_exists(dir).await? {
        return Ok(());
    }
    fs::create_dir_all(dir).await?;
    tracing::info!("Created upload directory {}", dir.display());
    Ok(())
}

pub fn staged_file_name(original_name: &str, millis: u128) -> String {
    format!("{}-{}", millis, sanitize_file_name(original_name))
}

// Only the last path component of a client supplied name is kept.
fn sanitize_file_name(original_name: &str) -> String {
    let name = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    match name {
        "" | "." | ".." => FALLBACK_FILE_NAME.to_string(),
        name => name.to_string(),
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
