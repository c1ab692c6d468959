use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Pending,
    Starting,
    Running,
    Ready,
    Crashed,
    Stopped,
    Completed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Ready => "ready",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Completed => "completed",
        }
    }

    /// A child is expected to be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Ready
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of one supervised process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub name: String,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, String>,
}

impl ProcessState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ProcessStatus::Pending,
            pid: None,
            port: None,
            url: None,
            healthy: None,
            restart_count: 0,
            last_restart_time: None,
            exit_code: None,
            error: None,
            exports: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tokens_are_lowercase() {
        let value = serde_json::to_value(ProcessStatus::Ready).unwrap();
        assert_eq!(value, serde_json::json!("ready"));
        let parsed: ProcessStatus = serde_json::from_value(serde_json::json!("crashed")).unwrap();
        assert_eq!(parsed, ProcessStatus::Crashed);
    }

    #[test]
    fn snapshot_omits_unset_fields() {
        let state = ProcessState::new("api");
        let value = serde_json::to_value(&state).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("pid"));
        assert!(!obj.contains_key("exitCode"));
        assert_eq!(obj["status"], "pending");
        assert_eq!(obj["restartCount"], 0);
    }
}
