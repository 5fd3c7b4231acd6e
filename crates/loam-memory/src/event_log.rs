use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use loam_core::{ActivationPoint, FailureChannel, Result, SessionId, SCHEMA_VERSION};

/// One failed step, as recorded in the session event log. Write-once,
/// append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub session_id: SessionId,
    pub step_index: u32,
    pub tool_name: String,
    pub action_payload: Value,
    /// May be empty for soft signals (no-progress and friends).
    pub error_text: String,
    pub fingerprint: String,
    pub tags: BTreeSet<String>,
    pub channel: FailureChannel,
    pub at: DateTime<Utc>,
}

/// Records appended to `events/session-<id>.jsonl`. The header is always
/// the first line, written at session start so the log exists even when
/// the first model turn fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Header {
        session_id: SessionId,
        task_id: String,
        domain_key: String,
        started_at: DateTime<Utc>,
        schema_version: u32,
    },
    Error(ErrorEvent),
    Retrieval {
        step_index: u32,
        point: ActivationPoint,
        lesson_ids: Vec<String>,
    },
    ValidationRetry {
        step_index: u32,
        attempt: u32,
        detail: String,
    },
    Reflection {
        step_index: u32,
        reason: String,
    },
}

impl SessionEvent {
    /// Step index carried by non-header events.
    pub fn step_index(&self) -> Option<u32> {
        match self {
            SessionEvent::Header { .. } => None,
            SessionEvent::Error(e) => Some(e.step_index),
            SessionEvent::Retrieval { step_index, .. }
            | SessionEvent::ValidationRetry { step_index, .. }
            | SessionEvent::Reflection { step_index, .. } => Some(*step_index),
        }
    }
}

/// Append-only JSONL writer for one session's events.
///
/// Step indices must be monotonically non-decreasing; an out-of-order
/// append is a logic error and is dropped with a warning rather than
/// corrupting the log.
pub struct SessionEventLog {
    file: Option<File>,
    path: Option<PathBuf>,
    last_step: u32,
    error_count: u32,
}

impl SessionEventLog {
    /// Create the log file and write the header line.
    pub fn create(
        events_dir: &Path,
        session_id: SessionId,
        task_id: &str,
        domain_key: &str,
    ) -> Result<Self> {
        std::fs::create_dir_all(events_dir)?;
        let path = events_dir.join(format!("session-{session_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut log = Self {
            file: Some(file),
            path: Some(path),
            last_step: 0,
            error_count: 0,
        };
        log.append(&SessionEvent::Header {
            session_id,
            task_id: task_id.to_string(),
            domain_key: domain_key.to_string(),
            started_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
        });
        Ok(log)
    }

    /// A log that records nothing (tests without a disk root).
    pub fn sink() -> Self {
        Self {
            file: None,
            path: None,
            last_step: 0,
            error_count: 0,
        }
    }

    /// Append one event. Never fails; I/O problems are logged and the
    /// session continues.
    pub fn append(&mut self, event: &SessionEvent) {
        if let Some(step) = event.step_index() {
            if step < self.last_step {
                warn!(
                    step,
                    last = self.last_step,
                    "dropping out-of-order session event"
                );
                return;
            }
            self.last_step = step;
        }
        if matches!(event, SessionEvent::Error(_)) {
            self.error_count += 1;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = serde_json::to_string(event).map(|line| {
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.flush())
        });
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to append session event"),
            Err(e) => warn!(error = %e, "failed to serialize session event"),
        }
    }

    /// Number of error events appended so far.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read all events back from a session log file.
    pub fn read(path: &Path) -> Result<Vec<SessionEvent>> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

/// Scan prior session logs for fingerprints — used for the
/// `fingerprint_recurrence_before` metric.
pub fn prior_fingerprints(events_dir: &Path, exclude: SessionId) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let Ok(entries) = std::fs::read_dir(events_dir) else {
        return seen;
    };
    let exclude_name = format!("session-{exclude}.jsonl");
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy() == exclude_name {
            continue;
        }
        let Ok(events) = SessionEventLog::read(&entry.path()) else {
            continue;
        };
        for event in events {
            if let SessionEvent::Error(e) = event {
                seen.insert(e.fingerprint);
            }
        }
    }
    seen
}
