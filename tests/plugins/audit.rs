use futures::StreamExt;
use tempfile::TempDir;
use tributary::core::error::ErrorKind;
use tributary::core::model::{Event, EventsQuery, StreamsQuery};
use tributary::core::query::StreamQuery;
use tributary::core::store::EventStore;
use tributary::plugins::audit::{AUDIT_FILE_NAME, AuditStore};

fn action(streams: &[&str], time: f64, kind: &str) -> Event {
    Event {
        stream_ids: streams.iter().map(|s| s.to_string()).collect(),
        event_type: Some(kind.to_string()),
        time: Some(time),
        content: Some(serde_json::json!({ "action": kind })),
        ..Default::default()
    }
}

#[tokio::test]
async fn audit_appends_one_line_per_event_and_reads_in_append_order() {
    let tmp = TempDir::new().expect("tempdir");
    let store = AuditStore::new(tmp.path());

    store
        .create_event("alice", action(&["access-1"], 5.0, "audit-log/read"))
        .await
        .expect("append");
    store
        .create_event("alice", action(&["access-2"], 1.0, "audit-log/write"))
        .await
        .expect("append");
    store
        .create_event("alice", action(&["access-1"], 3.0, "audit-log/write"))
        .await
        .expect("append");

    let path = tmp.path().join("alice").join(AUDIT_FILE_NAME);
    let log = std::fs::read_to_string(path).expect("read log");
    assert_eq!(log.lines().count(), 3);

    let all = store
        .get_events("alice", &EventsQuery::default())
        .await
        .expect("all");
    let times: Vec<f64> = all.iter().filter_map(|e| e.time).collect();
    assert_eq!(times, vec![5.0, 1.0, 3.0]);

    let scoped = EventsQuery {
        types: vec!["audit-log/write".to_string()],
        ..EventsQuery::for_streams("\"access-1\"".parse::<StreamQuery>().expect("query"))
    };
    let events = store.get_events("alice", &scoped).await.expect("scoped");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].time, Some(3.0));

    let limited = EventsQuery {
        limit: Some(1),
        ..Default::default()
    };
    let first: Vec<_> = store
        .get_events_streamed("alice", &limited)
        .await
        .expect("open")
        .collect()
        .await;
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn audit_is_append_only() {
    let tmp = TempDir::new().expect("tempdir");
    let store = AuditStore::new(tmp.path());
    let created = store
        .create_event("alice", action(&["a"], 1.0, "audit-log/read"))
        .await
        .expect("append");

    let err = store.delete_event("alice", &created.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    let err = store
        .create_stream("alice", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

#[tokio::test]
async fn audit_streams_are_derived_from_logged_ids() {
    let tmp = TempDir::new().expect("tempdir");
    let store = AuditStore::new(tmp.path());
    let none = store
        .get_streams("alice", &StreamsQuery::default())
        .await
        .expect("empty");
    assert!(none.is_empty());

    store
        .create_event("alice", action(&["x", "y"], 1.0, "audit-log/read"))
        .await
        .expect("append");
    store
        .create_event("alice", action(&["y", "z"], 2.0, "audit-log/read"))
        .await
        .expect("append");

    let streams = store
        .get_streams("alice", &StreamsQuery::default())
        .await
        .expect("streams");
    let ids: Vec<&str> = streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["x", "y", "z"]);

    let infos = store.get_storage_infos("alice").await.expect("infos");
    assert_eq!(infos.event_count, 2);
    assert_eq!(infos.stream_count, 3);

    store.delete_user("alice").await.expect("delete user");
    assert!(!tmp.path().join("alice").exists());
    let after = store
        .get_events("alice", &EventsQuery::default())
        .await
        .expect("after");
    assert!(after.is_empty());
}

#[tokio::test]
async fn audit_corrupt_line_ends_the_stream_with_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    let store = AuditStore::new(tmp.path());
    store
        .create_event("alice", action(&["a"], 1.0, "audit-log/read"))
        .await
        .expect("append");

    let path = tmp.path().join("alice").join(AUDIT_FILE_NAME);
    let mut log = std::fs::read_to_string(&path).expect("read");
    log.push_str("{not json\n");
    log.push_str(&serde_json::to_string(&action(&["a"], 2.0, "audit-log/read")).expect("json"));
    log.push('\n');
    std::fs::write(&path, log).expect("write");

    let items: Vec<_> = store
        .get_events_streamed("alice", &EventsQuery::default())
        .await
        .expect("open")
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(items[1].is_err());
}

#[tokio::test]
async fn audit_keeps_every_user_inside_the_root() {
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().join("audit");
    let store = AuditStore::new(&root);

    store
        .create_event("john.doe", action(&["a"], 1.0, "audit-log/read"))
        .await
        .expect("dotted user id");
    store
        .create_event("../escape", action(&["a"], 2.0, "audit-log/read"))
        .await
        .expect("path-like user id");

    assert!(root.join("john.doe").join(AUDIT_FILE_NAME).exists());
    assert!(root.join("%2E.%2Fescape").join(AUDIT_FILE_NAME).exists());
    assert!(!tmp.path().join("escape").exists());

    let dotted = store
        .get_events("john.doe", &EventsQuery::default())
        .await
        .expect("dotted events");
    assert_eq!(dotted.len(), 1);
    assert_eq!(dotted[0].time, Some(1.0));

    let err = store.delete_user("").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryMalformed);
}
