use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only event log shared by every component that reports progress.
///
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - the file sink writes one compact JSON object per line
/// - the memory sink keeps events for inspection in tests
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    sink: EventSink,
    run_id: String,
    lock: Mutex<Vec<Value>>,
}

#[derive(Debug)]
enum EventSink {
    Jsonl(PathBuf),
    Memory,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self::with_sink(EventSink::Jsonl(path.into()), run_id.into())
    }

    pub fn in_memory(run_id: impl Into<String>) -> Self {
        Self::with_sink(EventSink::Memory, run_id.into())
    }

    fn with_sink(sink: EventSink, run_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                sink,
                run_id,
                lock: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.inner.sink {
            EventSink::Jsonl(path) => Some(path.as_path()),
            EventSink::Memory => None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let mut guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        match &self.inner.sink {
            EventSink::Jsonl(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let line = serde_json::to_string(&event)?;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            EventSink::Memory => guard.push(event.clone()),
        }

        Ok(event)
    }

    /// Events held by an in-memory writer. File-backed writers return nothing.
    pub fn events(&self) -> Vec<Value> {
        self.inner
            .lock
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
