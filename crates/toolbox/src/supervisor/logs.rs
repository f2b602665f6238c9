//! Per-service log files: `<log_dir>/<name>.out` and `<name>.err`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{ToolboxError, ToolboxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Out,
    Err,
}

impl LogStream {
    pub fn extension(&self) -> &'static str {
        match self {
            LogStream::Out => "out",
            LogStream::Err => "err",
        }
    }
}

impl FromStr for LogStream {
    type Err = ToolboxError;

    fn from_str(s: &str) -> Result<Self, ToolboxError> {
        match s {
            "out" => Ok(LogStream::Out),
            "err" => Ok(LogStream::Err),
            other => Err(ToolboxError::invalid(format!("invalid log type: {other}"))),
        }
    }
}

/// A slice of a log file and where the next read should start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogChunk {
    pub content: String,
    pub exists: bool,
    pub offset: u64,
}

pub fn log_path(log_dir: &Path, name: &str, stream: LogStream) -> PathBuf {
    log_dir.join(format!("{name}.{}", stream.extension()))
}

/// Read from byte `offset`, or the last `|offset|` bytes when negative.
pub async fn read_log(path: &Path, offset: i64) -> ToolboxResult<LogChunk> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogChunk {
                content: String::new(),
                exists: false,
                offset: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();

    let start = if offset < 0 {
        size.saturating_sub(offset.unsigned_abs())
    } else {
        offset.unsigned_abs()
    };
    if start >= size {
        return Ok(LogChunk {
            content: String::new(),
            exists: true,
            offset: size,
        });
    }

    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity(usize::try_from(size - start).unwrap_or(0));
    file.read_to_end(&mut buf).await?;
    let end = start + buf.len() as u64;
    Ok(LogChunk {
        content: String::from_utf8_lossy(&buf).into_owned(),
        exists: true,
        offset: end,
    })
}

/// Best-effort removal of both log files.
pub async fn remove_logs(log_dir: &Path, name: &str) {
    for stream in [LogStream::Out, LogStream::Err] {
        let path = log_path(log_dir, name, stream);
        if let Err(e) = fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to delete log file {}: {}", path.display(), e);
        }
    }
}
