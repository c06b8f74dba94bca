use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow_state::FlowStateHandle;
use crate::types::Value;

pub const VALUE_PREVIEW_MAX_CHARS: usize = 512;
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Component,
    Liveness,
    Protocol,
    DebuggerDesync,
    Disposer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_state: Option<FlowStateHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            fault: None,
            message: message.into(),
            flow_state: None,
            component: None,
        }
    }

    pub fn fault(kind: FaultKind, message: impl Into<String>) -> Self {
        let severity = match kind {
            FaultKind::Liveness | FaultKind::DebuggerDesync => Severity::Warning,
            _ => Severity::Error,
        };
        Self {
            fault: Some(kind),
            ..Self::new(severity, message)
        }
    }

    pub fn at(mut self, flow_state: FlowStateHandle, component: &str) -> Self {
        self.flow_state = Some(flow_state);
        self.component = Some(component.to_string());
        self
    }
}

/// Bounded sink of log records for the observer. Oldest records are evicted.
#[derive(Debug, Clone)]
pub struct RuntimeLogs {
    capacity: usize,
    records: VecDeque<LogRecord>,
}

impl RuntimeLogs {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn records(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    pub fn recent(&self, count: usize) -> Vec<LogRecord> {
        let skip = self.records.len().saturating_sub(count);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn faults(&self, kind: FaultKind) -> Vec<&LogRecord> {
        self.records
            .iter()
            .filter(|record| record.fault == Some(kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for RuntimeLogs {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

/// Observer-facing event stream, drained by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    FlowStarted {
        flow_state: FlowStateHandle,
        flow: String,
    },
    FlowFinished {
        flow_state: FlowStateHandle,
        flow: String,
    },
    ComponentExecuted {
        flow_state: FlowStateHandle,
        flow: String,
        component: String,
    },
    ValuePropagated {
        flow: String,
        component: String,
        output: String,
        value: Value,
    },
    Paused {
        flow_state: FlowStateHandle,
        flow: String,
        component: String,
    },
    Resumed,
    Log(LogRecord),
}

pub fn format_value_preview(value: &Value, max_chars: usize) -> (String, bool) {
    let raw = match value {
        Value::String(text) => format!("{text:?}"),
        other => other.to_string(),
    };
    truncate_preview(&raw, max_chars)
}

fn truncate_preview(value: &str, max_chars: usize) -> (String, bool) {
    let char_count = value.chars().count();
    if char_count <= max_chars {
        return (value.to_string(), false);
    }

    (value.chars().take(max_chars).collect(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut logs = RuntimeLogs::with_capacity(2);
        logs.push(LogRecord::new(Severity::Info, "one"));
        logs.push(LogRecord::new(Severity::Info, "two"));
        logs.push(LogRecord::new(Severity::Info, "three"));

        let messages: Vec<_> = logs.records().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(logs.recent(1)[0].message, "three");
    }

    #[test]
    fn test_fault_severity_by_kind() {
        assert_eq!(
            LogRecord::fault(FaultKind::Liveness, "stuck").severity,
            Severity::Warning
        );
        assert_eq!(
            LogRecord::fault(FaultKind::Component, "boom").severity,
            Severity::Error
        );

        let mut logs = RuntimeLogs::default();
        logs.push(LogRecord::fault(FaultKind::Protocol, "bad frame"));
        logs.push(LogRecord::new(Severity::Info, "fine"));
        assert_eq!(logs.faults(FaultKind::Protocol).len(), 1);
    }

    #[test]
    fn test_value_preview_truncates_on_char_boundary() {
        let (preview, truncated) = format_value_preview(&Value::from("héllo"), 3);
        assert_eq!(preview, "\"hé");
        assert!(truncated);

        let (preview, truncated) = format_value_preview(&Value::Int32(42), 8);
        assert_eq!(preview, "42");
        assert!(!truncated);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RuntimeEvent::Resumed;
        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json, serde_json::json!({"event": "resumed"}));
    }
}
