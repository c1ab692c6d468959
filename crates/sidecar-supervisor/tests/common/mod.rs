#![allow(dead_code)]

use async_trait::async_trait;
use sidecar_supervisor::{FloatingOpts, PaneError, PaneHost, PaneId, PaneStatus};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory pane host: records every spawn and lets tests flip pane
/// status, so supervisor behavior is exercised without a real multiplexer.
pub struct StubPaneHost {
    pub panes: Mutex<BTreeMap<String, PaneStatus>>,
    pub created: Mutex<Vec<(String, String)>>,
    pub floating: Mutex<Vec<String>>,
    next_pid: AtomicU32,
    /// When set, every created pane is immediately dead with this code.
    pub die_on_spawn: Option<i32>,
}

impl StubPaneHost {
    pub fn new() -> Self {
        Self {
            panes: Mutex::new(BTreeMap::new()),
            created: Mutex::new(Vec::new()),
            floating: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(4000),
            die_on_spawn: None,
        }
    }

    pub fn dying(exit_code: i32) -> Self {
        Self {
            die_on_spawn: Some(exit_code),
            ..Self::new()
        }
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn command_for(&self, name: &str) -> Option<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(created, _)| created == name)
            .map(|(_, command)| command.clone())
    }

    pub fn mark_dead(&self, name: &str, exit_code: i32) {
        self.panes.lock().unwrap().insert(
            name.to_string(),
            PaneStatus::Dead {
                exit_code: Some(exit_code),
            },
        );
    }
}

#[async_trait]
impl PaneHost for StubPaneHost {
    async fn create_pane(
        &self,
        name: &str,
        command: &str,
        _cwd: &Path,
        _env: &BTreeMap<String, String>,
    ) -> Result<PaneId, PaneError> {
        let status = match self.die_on_spawn {
            Some(exit_code) => PaneStatus::Dead {
                exit_code: Some(exit_code),
            },
            None => PaneStatus::Running {
                pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            },
        };
        self.panes.lock().unwrap().insert(name.to_string(), status);
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), command.to_string()));
        Ok(PaneId(name.to_string()))
    }

    async fn respawn_pane(
        &self,
        id: &PaneId,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        self.create_pane(&id.0, command, cwd, env).await.map(|_| ())
    }

    async fn kill_pane(&self, id: &PaneId) -> Result<(), PaneError> {
        self.panes
            .lock()
            .unwrap()
            .insert(id.0.clone(), PaneStatus::Dead { exit_code: None });
        Ok(())
    }

    async fn send_interrupt(&self, id: &PaneId) -> Result<(), PaneError> {
        self.panes.lock().unwrap().insert(
            id.0.clone(),
            PaneStatus::Dead {
                exit_code: Some(130),
            },
        );
        Ok(())
    }

    async fn capture_pane(&self, _id: &PaneId, _lines: usize) -> Result<String, PaneError> {
        Ok(String::new())
    }

    async fn pane_status(&self, id: &PaneId) -> Result<PaneStatus, PaneError> {
        Ok(self
            .panes
            .lock()
            .unwrap()
            .get(&id.0)
            .copied()
            .unwrap_or(PaneStatus::Missing))
    }

    async fn open_floating(
        &self,
        _command: &str,
        opts: &FloatingOpts,
        _env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        self.floating.lock().unwrap().push(opts.name.clone());
        Ok(())
    }

    async fn close_floating(&self, name: &str) -> Result<(), PaneError> {
        self.floating.lock().unwrap().retain(|kept| kept != name);
        Ok(())
    }

    fn supports_geometry(&self) -> bool {
        true
    }
}
