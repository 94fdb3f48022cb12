//! Append-only JSON-lines run log.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    time::{LogEntry, LogLevel, LoggerSink},
};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Writes one [`LogEntry`] per line to a file, appending across runs.
///
/// CI runners keep the file as a build artifact; the lock holder, every job
/// failure and the final summary end up in it regardless of the terminal
/// format. Lines are buffered in order and reach the disk on
/// [`flush`](LoggerSink::flush).
pub struct JsonLinesLogSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    min_level: LogLevel,
}

impl JsonLinesLogSink {
    pub fn open(path: impl Into<PathBuf>, min_level: LogLevel) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            min_level,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> Result<MutexGuard<'_, BufWriter<File>>> {
        self.writer
            .lock()
            .map_err(|_| BridgeError::OperationFailed("run log writer poisoned".to_string()))
    }
}

#[async_trait]
impl LoggerSink for JsonLinesLogSink {
    async fn log(&self, entry: LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| BridgeError::OperationFailed(format!("Unencodable log entry: {}", e)))?;
        line.push(b'\n');

        self.writer()?.write_all(&line)?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }
}
