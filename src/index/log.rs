//! Durable message log: one JSON record per line, in id order.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::db::replace_file;
use crate::errors::AppError;
use crate::models::MessageEntry;

/// Read the whole log. A missing file is created empty.
///
/// Any unreadable line fails the whole load.
pub async fn read_log(path: &Path) -> Result<Vec<MessageEntry>, AppError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Message log missing, creating a new one");
            replace_file(path, b"").await?;
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: MessageEntry = serde_json::from_str(line).map_err(|e| {
            AppError::Codec(format!(
                "Corrupt message log {} at line {}: {}",
                path.display(),
                lineno + 1,
                e
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Append one record and flush it to disk.
pub async fn append_record(path: &Path, entry: &MessageEntry) -> Result<(), AppError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.sync_data().await?;
    Ok(())
}

/// Replace the log with a full snapshot.
pub async fn write_snapshot(path: &Path, entries: &[MessageEntry]) -> Result<(), AppError> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend(serde_json::to_vec(entry)?);
        out.push(b'\n');
    }
    replace_file(path, &out).await
}
