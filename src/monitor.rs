//! Runtime observability: the monitor trait and a recording implementation.
//!
//! A monitor receives every effect lifecycle event and every dispatched
//! action. The bundled `TraceMonitor` records them as serializable entries
//! and can append a run to a JSON Lines file for later analysis.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::ids::EffectId;
use crate::value::{Action, Value};

/// Descriptor of a triggered effect, reported before it runs.
#[derive(Debug, Clone)]
pub struct EffectInfo {
    pub effect_id: EffectId,
    pub parent_effect_id: EffectId,
    /// Key within an all/race fan-out, empty otherwise.
    pub label: String,
    pub description: String,
}

/// Observer of runtime activity. All hooks default to no-ops.
pub trait SagaMonitor: Send + Sync {
    fn root_saga_started(&self, effect_id: EffectId, name: &str) {
        let _ = (effect_id, name);
    }

    fn effect_triggered(&self, info: &EffectInfo) {
        let _ = info;
    }

    fn effect_resolved(&self, effect_id: EffectId, result: &Value) {
        let _ = (effect_id, result);
    }

    fn effect_rejected(&self, effect_id: EffectId, error: &TaskError) {
        let _ = (effect_id, error);
    }

    fn effect_cancelled(&self, effect_id: EffectId) {
        let _ = effect_id;
    }

    fn action_dispatched(&self, action: &Action) {
        let _ = action;
    }
}

/// A single recorded monitor event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEntry {
    RootStarted {
        effect_id: u64,
        name: String,
    },
    Triggered {
        effect_id: u64,
        parent_effect_id: u64,
        label: String,
        description: String,
    },
    Resolved {
        effect_id: u64,
        result: String,
    },
    Rejected {
        effect_id: u64,
        error: String,
    },
    Cancelled {
        effect_id: u64,
    },
    ActionDispatched {
        kind: String,
    },
}

/// One lint-log-style record of a whole run.
#[derive(Debug, Serialize, Deserialize)]
pub struct TraceLogEntry {
    /// Unix timestamp of when the trace was written
    pub timestamp: u64,
    /// ISO 8601 formatted date string
    pub datetime: String,
    pub entries: Vec<TraceEntry>,
}

/// Recording monitor: keeps every event in memory.
#[derive(Clone, Default)]
pub struct TraceMonitor {
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

impl TraceMonitor {
    pub fn new() -> Self {
        TraceMonitor {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, entry: TraceEntry) {
        self.entries.lock().expect("trace lock poisoned").push(entry);
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().expect("trace lock poisoned").clone()
    }

    /// Kinds of every recorded action dispatch, in order.
    pub fn dispatched_kinds(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                TraceEntry::ActionDispatched { kind } => Some(kind),
                _ => None,
            })
            .collect()
    }

    /// Append the recorded trace to a JSON Lines file.
    pub fn write_json_lines(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let record = TraceLogEntry {
            timestamp,
            datetime: format_datetime(timestamp),
            entries: self.entries(),
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(writer, "{}", json)?;
        writer.flush()
    }
}

impl SagaMonitor for TraceMonitor {
    fn root_saga_started(&self, effect_id: EffectId, name: &str) {
        self.push(TraceEntry::RootStarted {
            effect_id: effect_id.raw(),
            name: name.to_string(),
        });
    }

    fn effect_triggered(&self, info: &EffectInfo) {
        self.push(TraceEntry::Triggered {
            effect_id: info.effect_id.raw(),
            parent_effect_id: info.parent_effect_id.raw(),
            label: info.label.clone(),
            description: info.description.clone(),
        });
    }

    fn effect_resolved(&self, effect_id: EffectId, result: &Value) {
        self.push(TraceEntry::Resolved {
            effect_id: effect_id.raw(),
            result: result.describe(),
        });
    }

    fn effect_rejected(&self, effect_id: EffectId, error: &TaskError) {
        self.push(TraceEntry::Rejected {
            effect_id: effect_id.raw(),
            error: error.message.clone(),
        });
    }

    fn effect_cancelled(&self, effect_id: EffectId) {
        self.push(TraceEntry::Cancelled {
            effect_id: effect_id.raw(),
        });
    }

    fn action_dispatched(&self, action: &Action) {
        self.push(TraceEntry::ActionDispatched {
            kind: action.kind.clone(),
        });
    }
}

impl std::fmt::Debug for TraceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceMonitor")
            .field("entries", &self.entries().len())
            .finish()
    }
}

/// Format a unix timestamp as ISO 8601 datetime string
fn format_datetime(timestamp: u64) -> String {
    use std::time::Duration;
    let d = UNIX_EPOCH + Duration::from_secs(timestamp);
    let datetime: chrono::DateTime<chrono::Utc> = chrono::DateTime::from(d);
    datetime.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trace_monitor_records_lifecycle() {
        let monitor = TraceMonitor::new();
        let info = EffectInfo {
            effect_id: EffectId::from_raw(1),
            parent_effect_id: EffectId::root(),
            label: String::new(),
            description: "take(\"A\")".to_string(),
        };
        monitor.effect_triggered(&info);
        monitor.effect_resolved(EffectId::from_raw(1), &Value::Int(5));
        monitor.action_dispatched(&Action::new("A"));

        let entries = monitor.entries();
        assert_eq!(entries.len(), 3);
        assert!(matches!(&entries[0], TraceEntry::Triggered { effect_id: 1, .. }));
        assert!(matches!(&entries[1], TraceEntry::Resolved { result, .. } if result == "5"));
        assert_eq!(monitor.dispatched_kinds(), vec!["A".to_string()]);
    }

    #[test]
    fn test_write_json_lines_round_trips() {
        let monitor = TraceMonitor::new();
        monitor.effect_cancelled(EffectId::from_raw(9));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        monitor.write_json_lines(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: TraceLogEntry = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed.entries, vec![TraceEntry::Cancelled { effect_id: 9 }]);
        assert!(!parsed.datetime.is_empty());
    }
}
