//! Durable append-only stores.
//!
//! CSV stores get a header only when the file is new or empty, so repeated
//! runs accumulate rows without duplicating it. JSONL stores hold one JSON
//! object per line. Concurrent producers go through a single [`StoreWriter`]
//! task so appends never interleave.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// True when the file is missing or has zero length
pub fn is_new_or_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Append serializable rows to a CSV file. Returns the number of rows written.
pub fn append_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    ensure_parent(path)?;
    let write_header = is_new_or_empty(path);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut wtr = csv::WriterBuilder::new().has_headers(write_header).from_writer(file);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    debug!("Appended {} rows to {:?} (header: {})", rows.len(), path, write_header);
    Ok(rows.len())
}

/// Read every row of a CSV store
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Append one JSON value per line
pub fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<usize> {
    if items.is_empty() {
        return Ok(0);
    }
    ensure_parent(path)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item)?);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())?;
    Ok(items.len())
}

/// Non-blank lines of a JSONL store, unparsed
pub fn read_jsonl_lines(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Destination format of a [`StoreWriter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Csv,
    JsonLines,
}

/// Single writer task owning one destination store.
///
/// Producers clone the sender from [`StoreWriter::sender`]; each message is a
/// batch of rows appended atomically with respect to other messages.
pub struct StoreWriter<T> {
    tx: mpsc::Sender<Vec<T>>,
    handle: JoinHandle<Result<usize>>,
}

impl<T> StoreWriter<T>
where
    T: Serialize + Send + 'static,
{
    pub fn spawn(path: PathBuf, format: StoreFormat, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<T>>(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut written = 0usize;
            while let Some(batch) = rx.recv().await {
                let result = match format {
                    StoreFormat::Csv => append_csv(&path, &batch),
                    StoreFormat::JsonLines => append_jsonl(&path, &batch),
                };
                match result {
                    Ok(n) => written += n,
                    Err(e) => {
                        warn!("Store write to {:?} failed: {}", path, e);
                        return Err(e);
                    }
                }
            }
            Ok(written)
        });
        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<Vec<T>> {
        self.tx.clone()
    }

    /// Close the channel and wait for pending writes. Returns rows written.
    pub async fn finish(self) -> Result<usize> {
        drop(self.tx);
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()).into()),
        }
    }
}
