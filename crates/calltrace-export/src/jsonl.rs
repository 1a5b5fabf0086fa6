//! JSONL call log backend
//!
//! Appends one JSON object per event to a file. The log is self-describing: every
//! line carries a `type` tag (`save_op`, `call_start`, `call_end`, `call_update`), so
//! [`read_call_log`] can fold it back into calls.
//!
//! Lines go straight to the file, one `write_all` each, so a failed batch reports
//! exactly how many lines landed and a retry never repeats them. A line torn by a
//! failed write is terminated before the next write and skipped when reading.

use async_trait::async_trait;
use calltrace_core::{
    fold_call_events, BackendError, BackendResult, Call, CallEnd, CallEvent, CallStart,
    CallUpdate, ObjectRef, OpDef, TraceBackend,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// JSONL backend configuration
#[derive(Debug, Clone)]
pub struct JsonlBackendConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to an existing log
    pub append: bool,
}

impl Default for JsonlBackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("calltrace-calls.jsonl"),
            append: true,
        }
    }
}

impl JsonlBackendConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

struct LogWriter {
    out: Box<dyn Write + Send>,
    /// Last write failed midway; the current line is unterminated
    torn: bool,
}

/// Writes call events to a JSONL file
pub struct JsonlBackend {
    config: JsonlBackendConfig,
    writer: Mutex<LogWriter>,
    /// Saved ops by ref URI, answered by `resolve_ref`
    objects: Mutex<HashMap<String, Value>>,
    events_written: AtomicU64,
}

impl JsonlBackend {
    /// Open the log, picking up ops saved by earlier runs when appending
    pub fn open(config: JsonlBackendConfig) -> BackendResult<Self> {
        let mut objects = HashMap::new();
        if config.append && config.path.exists() {
            for event in read_events(&config.path)? {
                if let CallEvent::SaveOp { op_ref, op } = event {
                    objects.insert(op_ref.uri(), serde_json::to_value(&op)?);
                }
            }
        }

        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };

        info!(
            "JSONL backend writing to: {:?} ({} saved ops known)",
            config.path,
            objects.len()
        );

        Ok(Self::with_writer(config, Box::new(file), objects))
    }

    fn with_writer(
        config: JsonlBackendConfig,
        out: Box<dyn Write + Send>,
        objects: HashMap<String, Value>,
    ) -> Self {
        Self {
            config,
            writer: Mutex::new(LogWriter { out, torn: false }),
            objects: Mutex::new(objects),
            events_written: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }

    fn write_events(&self, events: &[CallEvent]) -> BackendResult<()> {
        let lines = events
            .iter()
            .map(|event| {
                serde_json::to_vec(event).map(|mut line| {
                    line.push(b'\n');
                    line
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (written, failure) = {
            let mut log = self.writer.lock();
            log.write_lines(&lines)
        };

        self.remember(&events[..written])?;
        if written > 0 {
            debug!("Wrote {} events to {:?}", written, self.config.path);
        }

        match failure {
            None => Ok(()),
            Some(e) if written == 0 => Err(e.into()),
            Some(e) => Err(BackendError::Partial {
                sent: written,
                source: Box::new(e.into()),
            }),
        }
    }

    fn remember(&self, written: &[CallEvent]) -> BackendResult<()> {
        for event in written {
            if let CallEvent::SaveOp { op_ref, op } = event {
                self.objects
                    .lock()
                    .insert(op_ref.uri(), serde_json::to_value(op)?);
            }
        }
        self.events_written
            .fetch_add(written.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self) -> BackendResult<()> {
        self.writer.lock().out.flush()?;
        Ok(())
    }
}

impl LogWriter {
    /// Write whole lines until one fails; returns how many landed
    fn write_lines(&mut self, lines: &[Vec<u8>]) -> (usize, Option<std::io::Error>) {
        if self.torn {
            if let Err(e) = self.out.write_all(b"\n") {
                return (0, Some(e));
            }
            self.torn = false;
        }

        for (i, line) in lines.iter().enumerate() {
            if let Err(e) = self.out.write_all(line) {
                self.torn = true;
                return (i, Some(e));
            }
        }
        (lines.len(), None)
    }
}

#[async_trait]
impl TraceBackend for JsonlBackend {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn call_start(&self, start: &CallStart) -> BackendResult<()> {
        self.write_events(&[CallEvent::CallStart(start.clone())])
    }

    async fn call_end(&self, end: &CallEnd) -> BackendResult<()> {
        self.write_events(&[CallEvent::CallEnd(end.clone())])
    }

    async fn call_update(&self, update: &CallUpdate) -> BackendResult<()> {
        self.write_events(&[CallEvent::CallUpdate(update.clone())])
    }

    async fn save_op(&self, op_ref: &ObjectRef, op: &OpDef) -> BackendResult<()> {
        if !self.objects.lock().contains_key(&op_ref.uri()) {
            self.write_events(&[CallEvent::SaveOp {
                op_ref: op_ref.clone(),
                op: op.clone(),
            }])?;
        }
        Ok(())
    }

    async fn resolve_ref(&self, object_ref: &ObjectRef) -> BackendResult<Value> {
        self.objects
            .lock()
            .get(&object_ref.uri())
            .cloned()
            .ok_or_else(|| BackendError::NotFound(object_ref.uri()))
    }

    async fn upsert_batch(&self, events: &[CallEvent]) -> BackendResult<()> {
        self.write_events(events)
    }
}

impl Drop for JsonlBackend {
    fn drop(&mut self) {
        if let Err(e) = self.writer.get_mut().out.flush() {
            warn!("Failed to flush {:?}: {}", self.config.path, e);
        }
    }
}

/// Read every event from a call log.
///
/// Blank lines are ignored; malformed lines (e.g. a line truncated by a crash) are
/// skipped with a warning.
pub fn read_events(path: &Path) -> BackendResult<Vec<CallEvent>> {
    parse_events(BufReader::new(File::open(path)?), path)
}

fn parse_events(reader: impl BufRead, path: &Path) -> BackendResult<Vec<CallEvent>> {
    let mut events = Vec::new();
    let mut skipped = 0usize;

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CallEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!("Skipping malformed line {} of {:?}: {}", n + 1, path, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} malformed lines in {:?}", skipped, path);
    }
    Ok(events)
}

/// Read a call log and fold it into calls, in start order
pub fn read_call_log(path: &Path) -> BackendResult<Vec<Call>> {
    let events = read_events(path)?;
    Ok(fold_call_events(&events))
}
