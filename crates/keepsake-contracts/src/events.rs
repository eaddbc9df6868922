use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only audit log (`events.jsonl`) for job lifecycle and generation
/// fallbacks.
///
/// - default fields are `type`, `source`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a writer without a path keeps nothing and only returns the event
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    source: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                source: source.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn disabled(source: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                source: source.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "source".to_string(),
            Value::String(self.inner.source.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

/// Reads every well-formed event line; malformed lines are skipped.
pub fn read_events(path: &Path) -> Vec<Value> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "orchestrator");

        let mut payload = EventPayload::new();
        payload.insert("adapter_id".to_string(), Value::String("a-1".to_string()));
        let emitted = writer.emit("job_created", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("job_created".to_string()));
        assert_eq!(parsed["source"], Value::String("orchestrator".to_string()));
        assert_eq!(parsed["adapter_id"], Value::String("a-1".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let writer = EventWriter::disabled("orchestrator");

        let mut payload = EventPayload::new();
        payload.insert("source".to_string(), Value::String("router".to_string()));
        let emitted = writer.emit("generation_fallback", payload)?;

        assert_eq!(emitted["type"], Value::String("generation_fallback".to_string()));
        assert_eq!(emitted["source"], Value::String("router".to_string()));
        Ok(())
    }

    #[test]
    fn disabled_writer_touches_no_file() -> anyhow::Result<()> {
        let writer = EventWriter::disabled("orchestrator");
        assert!(writer.path().is_none());
        let emitted = writer.emit("job_created", EventPayload::new())?;
        assert_eq!(emitted["type"], Value::String("job_created".to_string()));
        Ok(())
    }

    #[test]
    fn read_events_returns_lines_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "orchestrator");

        writer.emit("one", EventPayload::new())?;
        writer.emit("two", EventPayload::new())?;
        fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"not json\n")?;

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], Value::String("one".to_string()));
        assert_eq!(events[1]["type"], Value::String("two".to_string()));
        Ok(())
    }
}
