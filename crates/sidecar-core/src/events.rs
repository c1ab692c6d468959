use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One line of the per-session `events.jsonl` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Result {
        id: String,
        action: ResultAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answers: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Reload {
        added: Vec<String>,
        removed: Vec<String>,
        changed: Vec<String>,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompts: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAction {
    Accept,
    Decline,
    Cancel,
    Timeout,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event log encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only JSON-lines bus shared by path. Any process holding the
/// session directory may append; readers tail by polling the file length.
/// The filesystem is the ground truth — there is no in-memory custodian.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event as a single write. `result` events are idempotent
    /// per interaction id: if the file already holds a result for that id
    /// the append is dropped.
    pub fn append(&self, kind: EventKind) -> Result<(), EventLogError> {
        if let EventKind::Result { id, .. } = &kind {
            if self.has_result(id)? {
                return Ok(());
            }
        }
        let event = Event {
            ts: Utc::now().timestamp_millis(),
            kind,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    pub fn has_result(&self, id: &str) -> Result<bool, EventLogError> {
        Ok(self
            .read_all()?
            .iter()
            .any(|event| matches!(&event.kind, EventKind::Result { id: found, .. } if found == id)))
    }

    pub fn find_result(&self, id: &str) -> Result<Option<Event>, EventLogError> {
        Ok(self
            .read_all()?
            .into_iter()
            .find(|event| matches!(&event.kind, EventKind::Result { id: found, .. } if found == id)))
    }

    /// Every parseable event in append order. Malformed or partial trailing
    /// lines are skipped.
    pub fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect())
    }

    /// A tailer positioned at the current end of the file.
    pub fn tail_from_end(&self) -> Result<EventLogTailer, EventLogError> {
        let offset = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(EventLogTailer {
            path: self.path.clone(),
            offset,
            carry: Vec::new(),
        })
    }

    pub fn tail_from_start(&self) -> EventLogTailer {
        EventLogTailer {
            path: self.path.clone(),
            offset: 0,
            carry: Vec::new(),
        }
    }
}

/// Incremental reader over an events file. Reads only bytes past the last
/// offset and buffers partial lines until the newline arrives.
#[derive(Debug)]
pub struct EventLogTailer {
    path: PathBuf,
    offset: u64,
    carry: Vec<u8>,
}

impl EventLogTailer {
    pub fn poll(&mut self) -> Result<Vec<Event>, EventLogError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if len < self.offset {
            // Truncated underneath us; start over.
            self.offset = 0;
            self.carry.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut chunk)?;
        self.offset = len;
        self.carry.extend_from_slice(&chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.carry.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=newline).collect();
            let trimmed = &line[..line.len() - 1];
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_slice::<Event>(trimmed) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        (dir, log)
    }

    fn result(id: &str, action: ResultAction) -> EventKind {
        EventKind::Result {
            id: id.to_string(),
            action,
            answers: None,
            result: None,
        }
    }

    #[test]
    fn append_and_read_round_trip() {
        let (_dir, log) = temp_log();
        log.append(result("i-1", ResultAction::Accept)).unwrap();
        log.append(EventKind::Status {
            message: Some("booted".to_string()),
            prompts: None,
        })
        .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0].kind, EventKind::Result { id, .. } if id == "i-1"));
        assert!(events[0].ts > 0);
    }

    #[test]
    fn duplicate_result_is_dropped() {
        let (_dir, log) = temp_log();
        log.append(result("dup", ResultAction::Accept)).unwrap();
        log.append(result("dup", ResultAction::Cancel)).unwrap();
        log.append(result("other", ResultAction::Decline)).unwrap();

        let results: Vec<_> = log
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|e| matches!(&e.kind, EventKind::Result { id, .. } if id == "dup"))
            .collect();
        assert_eq!(results.len(), 1);
        assert!(
            matches!(&results[0].kind, EventKind::Result { action, .. } if *action == ResultAction::Accept)
        );
    }

    #[test]
    fn tailer_sees_only_new_events() {
        let (_dir, log) = temp_log();
        log.append(result("old", ResultAction::Accept)).unwrap();

        let mut tailer = log.tail_from_end().unwrap();
        assert!(tailer.poll().unwrap().is_empty());

        log.append(result("new", ResultAction::Decline)).unwrap();
        let events = tailer.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].kind, EventKind::Result { id, .. } if id == "new"));
        assert!(tailer.poll().unwrap().is_empty());
    }

    #[test]
    fn tailer_buffers_partial_lines() {
        let (_dir, log) = temp_log();
        let mut tailer = log.tail_from_start();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log.path())
            .unwrap();
        file.write_all(br#"{"ts":1,"type":"status","mess"#).unwrap();
        assert!(tailer.poll().unwrap().is_empty());
        file.write_all(b"age\":\"hi\"}\n").unwrap();

        let events = tailer.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0].kind, EventKind::Status { message, .. } if message.as_deref() == Some("hi"))
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (_dir, log) = temp_log();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log.path())
            .unwrap();
        file.write_all(b"not json\n").unwrap();
        log.append(result("ok", ResultAction::Accept)).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let event = Event {
            ts: 42,
            kind: EventKind::Result {
                id: "abc".to_string(),
                action: ResultAction::Timeout,
                answers: None,
                result: None,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"ts": 42, "type": "result", "id": "abc", "action": "timeout"})
        );
    }
}
