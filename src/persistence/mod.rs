use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::Result;

/// Append-only JSON-lines file, one record per line
///
/// Every append is flushed before returning so a crash loses at most the
/// record being written.
pub struct JsonLinesLog<T> {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    _record: PhantomData<fn(T)>,
}

impl<T: Serialize + DeserializeOwned> JsonLinesLog<T> {
    /// Open for appending, creating the file and parent directories if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!("Opened JSON-lines log at {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    pub fn append_all<'a>(&self, records: impl IntoIterator<Item = &'a T>) -> Result<usize>
    where
        T: 'a,
    {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0;
        for record in records {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{}", line)?;
            written += 1;
        }
        writer.flush()?;
        Ok(written)
    }

    /// Read every record of a log file in order
    ///
    /// A missing file is an empty log; blank lines are skipped.
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<T>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }

        tracing::debug!("Loaded {} records from {}", records.len(), path.display());
        Ok(records)
    }
}
