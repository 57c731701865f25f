use crate::{ForemanError, ForemanResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp file placed next to `path` so the final rename stays on one filesystem.
fn temp_path_for(path: &Path) -> PathBuf {
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial write.
///
/// The data is written and synced to a sibling temp file, which is then
/// renamed over the destination. Parent directories are created as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> ForemanResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path_for(path);
    let result = (|| -> ForemanResult<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Async variant of [`write_atomic`] for callers on the tokio runtime.
pub async fn write_atomic_async(path: &Path, contents: Vec<u8>) -> ForemanResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &contents))
        .await
        .map_err(|e| ForemanError::Io(std::io::Error::other(e.to_string())))?
}

/// Append one JSON value as a line to `path`, creating the file and its
/// parent directories if needed.
pub async fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> ForemanResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    append_jsonl_line(path, value).await
}

/// Like [`append_jsonl`], but the parent directory must already exist.
/// A missing directory surfaces as a `NotFound` I/O error.
pub async fn append_jsonl_line<T: Serialize>(path: &Path, value: &T) -> ForemanResult<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Read every line of a JSONL file. A missing file reads as empty; blank
/// lines are ignored.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> ForemanResult<Vec<T>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    data.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(ForemanError::from))
        .collect()
}
