mod common;

use common::StubPaneHost;
use sidecar_core::events::{EventKind, EventLog};
use sidecar_core::manifest::{Manifest, Settings};
use sidecar_core::state::ProcessStatus;
use sidecar_core::ToolError;
use sidecar_supervisor::{StartOptions, Supervisor, SupervisorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    supervisor: Arc<Supervisor>,
    pane: Arc<StubPaneHost>,
    event_log: EventLog,
}

fn harness(manifest_yaml: &str, pane: StubPaneHost) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Manifest::from_str(manifest_yaml).unwrap();
    let pane = Arc::new(pane);
    let event_log = EventLog::new(dir.path().join("events.jsonl"));
    let pane_dyn: Arc<dyn sidecar_supervisor::PaneHost> = pane.clone();
    let (supervisor, events_rx) = Supervisor::new(
        SupervisorConfig {
            config_dir: dir.path().to_path_buf(),
            settings: Settings::default(),
            runtime_dir: dir.path().join("runtime"),
            wrap_program: PathBuf::from("sidecar"),
        },
        pane_dyn,
        event_log.clone(),
    );
    supervisor.load(&manifest).unwrap();
    supervisor.spawn_background(events_rx);
    Harness {
        _dir: dir,
        supervisor,
        pane,
        event_log,
    }
}

async fn wait_for_status(
    supervisor: &Arc<Supervisor>,
    name: &str,
    wanted: ProcessStatus,
) -> sidecar_core::ProcessState {
    for _ in 0..600 {
        let state = supervisor.get_status(name).unwrap();
        if state.status == wanted {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "process '{name}' never reached {wanted}: {:?}",
        supervisor.get_status(name)
    );
}

#[tokio::test]
async fn dependency_chain_starts_in_order_and_resolves_exports() {
    let yaml = r#"
processes:
  db:
    command: "run-db"
    port: 5432
    readyVars: [port]
  api:
    command: "run-api --db-port $processes.db.port"
    dependsOn: [db]
"#;
    let h = harness(yaml, StubPaneHost::new());
    h.supervisor.start_all().await.unwrap();

    let db = wait_for_status(&h.supervisor, "db", ProcessStatus::Ready).await;
    assert_eq!(db.port, Some(5432));
    assert_eq!(db.exports.get("port").map(String::as_str), Some("5432"));
    wait_for_status(&h.supervisor, "api", ProcessStatus::Ready).await;

    let created = h.pane.created_names();
    assert_eq!(created, vec!["db", "api"]);
    let api_command = h.pane.command_for("api").unwrap();
    assert!(
        api_command.contains("--db-port 5432"),
        "api command did not resolve the db port: {api_command}"
    );
}

#[tokio::test]
async fn starting_a_running_process_is_already_running() {
    let yaml = "processes:\n  web:\n    command: serve\n";
    let h = harness(yaml, StubPaneHost::new());
    h.supervisor
        .start_process("web", StartOptions::default())
        .await
        .unwrap();
    let err = h
        .supervisor
        .start_process("web", StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::AlreadyRunning(_)));
    // Exactly one spawn reached the pane host.
    assert_eq!(h.pane.created_names().len(), 1);
}

#[tokio::test]
async fn stop_then_start_preserves_restart_count() {
    let yaml = "processes:\n  web:\n    command: serve\n";
    let h = harness(yaml, StubPaneHost::new());
    h.supervisor
        .start_process("web", StartOptions::default())
        .await
        .unwrap();
    let before = h.supervisor.get_status("web").unwrap().restart_count;

    let stopped = h.supervisor.stop_process("web").await.unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert_eq!(stopped.restart_count, before);

    let started = h
        .supervisor
        .start_process("web", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(started.restart_count, before);
}

#[tokio::test]
async fn stopped_process_is_not_restarted_by_env_changes() {
    let yaml = "processes:\n  web:\n    command: serve\n";
    let h = harness(yaml, StubPaneHost::new());
    let restarted = h.supervisor.restart_if_running("web").await.unwrap();
    assert!(!restarted);
    assert_eq!(
        h.supervisor.get_status("web").unwrap().status,
        ProcessStatus::Pending
    );
}

#[tokio::test(start_paused = true)]
async fn on_failure_restarts_back_off_then_give_up() {
    let yaml = r#"
processes:
  flaky:
    command: "explode"
    restartPolicy: onFailure
    maxRestarts: 2
"#;
    let h = harness(yaml, StubPaneHost::dying(1));
    let _ = h.supervisor.start_all().await;

    // crash -> ~1s backoff -> crash -> ~2s backoff -> crash -> give up
    let mut state = h.supervisor.get_status("flaky").unwrap();
    for _ in 0..600 {
        state = h.supervisor.get_status("flaky").unwrap();
        if state.status == ProcessStatus::Crashed
            && state.error.as_deref() == Some("max restarts exceeded")
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(state.error.as_deref(), Some("max restarts exceeded"));

    assert_eq!(state.restart_count, 2);
    assert_eq!(state.exit_code, Some(1));
    // Initial spawn plus exactly two restart attempts.
    assert_eq!(h.pane.created_names().len(), 3);
}

#[tokio::test]
async fn run_to_completion_process_completes() {
    let yaml = r#"
processes:
  migrate:
    command: "run-migrations"
    restartPolicy: never
"#;
    let h = harness(yaml, StubPaneHost::new());
    h.supervisor
        .start_process("migrate", StartOptions::default())
        .await
        .unwrap();
    // Simulate a clean exit observed by the host poll.
    h.pane.mark_dead("migrate", 0);
    let state = wait_for_status(&h.supervisor, "migrate", ProcessStatus::Completed).await;
    assert_eq!(state.exit_code, Some(0));
    assert!(state.error.is_none());
}

#[tokio::test]
async fn reload_applies_exact_diff_and_emits_event() {
    let before = r#"
processes:
  a:
    command: "serve-a"
  b:
    command: "serve-b"
"#;
    let h = harness(before, StubPaneHost::new());
    h.supervisor.start_all().await.unwrap();

    let after = Manifest::from_str(
        r#"
processes:
  a:
    command: "serve-a --new"
  c:
    command: "serve-c"
"#,
    )
    .unwrap();
    let diff = h.supervisor.reload(&after).await.unwrap();
    assert_eq!(diff.added, vec!["c"]);
    assert_eq!(diff.removed, vec!["b"]);
    assert_eq!(diff.changed, vec!["a"]);

    assert!(matches!(
        h.supervisor.get_status("b").unwrap_err(),
        ToolError::NotFound(_)
    ));
    wait_for_status(&h.supervisor, "c", ProcessStatus::Ready).await;
    let a_command = h.pane.command_for("a").unwrap();
    assert!(a_command.contains("--new"));

    let reload_events: Vec<_> = h
        .event_log
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|event| matches!(event.kind, EventKind::Reload { .. }))
        .collect();
    assert_eq!(reload_events.len(), 1);
    if let EventKind::Reload {
        added,
        removed,
        changed,
    } = &reload_events[0].kind
    {
        assert_eq!(added, &vec!["c".to_string()]);
        assert_eq!(removed, &vec!["b".to_string()]);
        assert_eq!(changed, &vec!["a".to_string()]);
    }
}

#[tokio::test]
async fn noop_reload_changes_nothing_and_emits_nothing() {
    let yaml = "processes:\n  a:\n    command: serve\n";
    let h = harness(yaml, StubPaneHost::new());
    h.supervisor.start_all().await.unwrap();
    let spawns_before = h.pane.created_names().len();

    let diff = h
        .supervisor
        .reload(&Manifest::from_str(yaml).unwrap())
        .await
        .unwrap();
    assert!(diff.is_empty());
    assert_eq!(h.pane.created_names().len(), spawns_before);
    assert!(h.event_log.read_all().unwrap().is_empty());
}

#[tokio::test]
async fn manual_dependency_blocks_start_with_clear_error() {
    let yaml = r#"
processes:
  db:
    command: "run-db"
    autoStart: false
  api:
    command: "run-api"
    dependsOn: [db]
"#;
    let h = harness(yaml, StubPaneHost::new());
    let err = h.supervisor.start_all().await.unwrap_err();
    assert!(err.to_string().contains("db"));
    let api = h.supervisor.get_status("api").unwrap();
    assert_eq!(api.status, ProcessStatus::Crashed);
    assert!(api.error.as_deref().unwrap_or_default().contains("db"));
    // The manual dependency itself was left alone.
    assert_eq!(
        h.supervisor.get_status("db").unwrap().status,
        ProcessStatus::Pending
    );
}
