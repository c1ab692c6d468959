mod common;

use common::StubPaneHost;
use sidecar_core::events::{EventKind, EventLog, ResultAction};
use sidecar_supervisor::{InteractionBroker, InteractionRequest};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (tempfile::TempDir, Arc<StubPaneHost>, Arc<InteractionBroker>, EventLog) {
    let dir = tempfile::tempdir().unwrap();
    let pane = Arc::new(StubPaneHost::new());
    let pane_dyn: Arc<dyn sidecar_supervisor::PaneHost> = pane.clone();
    let event_log = EventLog::new(dir.path().join("events.jsonl"));
    let broker = InteractionBroker::new(pane_dyn, event_log.clone(), dir.path().to_path_buf());
    (dir, pane, broker, event_log)
}

fn schema_request() -> InteractionRequest {
    InteractionRequest {
        schema: Some(serde_json::json!({"questions": [{"question": "ok?"}]})),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_returns_distinct_ids_and_opens_floating_panes() {
    let (_dir, pane, broker, _log) = setup();
    let first = broker.create(schema_request()).await.unwrap();
    let second = broker.create(schema_request()).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(broker.pending_count(), 2);
    assert_eq!(pane.floating.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn wait_receives_the_result_written_by_the_child() {
    let (_dir, _pane, broker, log) = setup();
    let id = broker.create(schema_request()).await.unwrap();

    // The UI child appends its result through the events file, exactly as
    // a real process would with $EVENTS_FILE.
    let child_log = log.clone();
    let child_id = id.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        child_log
            .append(EventKind::Result {
                id: child_id,
                action: ResultAction::Accept,
                answers: Some(serde_json::json!({"ok?": "yes"})),
                result: None,
            })
            .unwrap();
    });

    let event = broker
        .wait(&id, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    writer.await.unwrap();
    match event.kind {
        EventKind::Result {
            id: got,
            action,
            answers,
            ..
        } => {
            assert_eq!(got, id);
            assert_eq!(action, ResultAction::Accept);
            assert_eq!(answers.unwrap()["ok?"], "yes");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // Settled: no longer pending.
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn cancel_emits_exactly_one_result() {
    let (_dir, pane, broker, log) = setup();
    let id = broker.create(schema_request()).await.unwrap();
    broker.cancel(&id).await.unwrap();

    // A late UI write for the same id is dropped by the log.
    log.append(EventKind::Result {
        id: id.clone(),
        action: ResultAction::Accept,
        answers: None,
        result: None,
    })
    .unwrap();

    let results: Vec<_> = log
        .read_all()
        .unwrap()
        .into_iter()
        .filter(
            |event| matches!(&event.kind, EventKind::Result { id: found, .. } if *found == id),
        )
        .collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        &results[0].kind,
        EventKind::Result { action: ResultAction::Cancel, .. }
    ));
    assert!(pane.floating.lock().unwrap().is_empty());

    // Cancelling twice is NotFound.
    assert!(broker.cancel(&id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn timeout_kills_the_pane_and_records_a_timeout_result() {
    let (_dir, pane, broker, log) = setup();
    let request = InteractionRequest {
        timeout_ms: Some(1_000),
        ..schema_request()
    };
    let id = broker.create(request).await.unwrap();
    assert_eq!(pane.floating.lock().unwrap().len(), 1);

    // Give the timeout task room to fire.
    for _ in 0..100 {
        if broker.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(broker.pending_count(), 0);
    assert!(pane.floating.lock().unwrap().is_empty());
    let event = log.find_result(&id).unwrap().unwrap();
    assert!(matches!(
        event.kind,
        EventKind::Result { action: ResultAction::Timeout, .. }
    ));
}
