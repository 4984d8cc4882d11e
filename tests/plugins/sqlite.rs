use futures::StreamExt;
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestRunner};
use rusqlite::Connection;
use tempfile::TempDir;
use tributary::core::compile::SqlDialect;
use tributary::core::config::{Config, SqliteConfig, StreamingConfig};
use tributary::core::error::ErrorKind;
use tributary::core::model::{Event, EventsQuery, Stream, StreamsQuery};
use tributary::core::query::{QueryBlock, StreamQuery};
use tributary::core::retry::RetryPolicy;
use tributary::core::store::EventStore;
use tributary::plugins::memory::MemoryStore;
use tributary::plugins::sqlite::SqliteStore;

fn open(tmp: &TempDir, config: &Config) -> SqliteStore {
    SqliteStore::open(&tmp.path().join("events.db"), config).expect("open sqlite store")
}

fn note(streams: &[&str], time: f64) -> Event {
    Event {
        stream_ids: streams.iter().map(|s| s.to_string()).collect(),
        event_type: Some("note/txt".to_string()),
        time: Some(time),
        content: Some(serde_json::json!(format!("at {time}"))),
        ..Default::default()
    }
}

fn query(json: &str) -> EventsQuery {
    EventsQuery::for_streams(json.parse::<StreamQuery>().expect("parse stream query"))
}

fn times(events: &[Event]) -> Vec<f64> {
    events.iter().filter_map(|e| e.time).collect()
}

#[tokio::test]
async fn sqlite_events_roundtrip_with_filters_and_order() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default());

    store
        .create_event("alice", note(&["a"], 1.0))
        .await
        .expect("create 1");
    store
        .create_event("alice", note(&["a", "b"], 2.0))
        .await
        .expect("create 2");
    let mut photo = note(&["c"], 3.0);
    photo.event_type = Some("picture/attached".to_string());
    store.create_event("alice", photo).await.expect("create 3");
    store
        .create_event("bob", note(&["a"], 4.0))
        .await
        .expect("create bob");

    let all = store
        .get_events("alice", &EventsQuery::default())
        .await
        .expect("all");
    assert_eq!(times(&all), vec![3.0, 2.0, 1.0]);
    for e in &all {
        assert_eq!(e.integrity, Some(e.compute_integrity()));
    }

    let ab_not_b = store
        .get_events("alice", &query(r#"[{"any":["a","b"],"not":["b"]}]"#))
        .await
        .expect("any/not");
    assert_eq!(times(&ab_not_b), vec![1.0]);

    let either = store
        .get_events("alice", &query(r#"[{"any":["c"]},{"any":["b"]}]"#))
        .await
        .expect("two blocks");
    assert_eq!(times(&either), vec![3.0, 2.0]);

    let windowed = EventsQuery {
        from_time: Some(1.5),
        types: vec!["note/txt".to_string()],
        sort_ascending: true,
        ..Default::default()
    };
    let events = store.get_events("alice", &windowed).await.expect("window");
    assert_eq!(times(&events), vec![2.0]);

    let limited = EventsQuery {
        limit: Some(2),
        ..Default::default()
    };
    let streamed: Vec<Event> = store
        .get_events_streamed("alice", &limited)
        .await
        .expect("open stream")
        .map(|item| item.expect("stream item"))
        .collect()
        .await;
    assert_eq!(times(&streamed), vec![3.0, 2.0]);

    let nothing = store
        .get_events("alice", &query("[{}]"))
        .await
        .expect("empty block");
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn sqlite_delete_leaves_unindexed_tombstone() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default());
    let created = store
        .create_event("alice", note(&["a"], 1.0))
        .await
        .expect("create");
    store
        .create_event("alice", note(&["a"], 2.0))
        .await
        .expect("create");

    let tombstone = store
        .delete_event("alice", &created.id)
        .await
        .expect("delete");
    assert_eq!(tombstone.id, created.id);
    assert!(tombstone.deleted.is_some());
    assert!(!tombstone.has_body());

    let live = store
        .get_events("alice", &query(r#""a""#))
        .await
        .expect("live");
    assert_eq!(times(&live), vec![2.0]);

    let with_deletions = EventsQuery {
        include_deletions: true,
        ..query(r#""a""#)
    };
    let events = store
        .get_events("alice", &with_deletions)
        .await
        .expect("deletions");
    assert_eq!(events.len(), 2);
    let listed = events.iter().find(|e| e.id == created.id);
    assert!(listed.is_some_and(|e| e.deleted.is_some()));

    let again = store
        .delete_event("alice", &created.id)
        .await
        .expect("idempotent delete");
    assert_eq!(again.deleted, tombstone.deleted);

    let err = store.delete_event("alice", "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownResource);
}

#[tokio::test]
async fn sqlite_streams_tree_conflicts_and_user_deletion() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default());
    for (id, parent) in [("root", None), ("child", Some("root")), ("leaf", Some("child"))] {
        store
            .create_stream(
                "alice",
                Stream {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    parent_id: parent.map(str::to_string),
                    ..Default::default()
                },
            )
            .await
            .expect("create stream");
    }
    let dup = store
        .create_stream(
            "alice",
            Stream {
                id: "root".to_string(),
                name: "Again".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::ItemAlreadyExists);

    let tree = store
        .get_streams("alice", &StreamsQuery::default())
        .await
        .expect("streams");
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].children[0].children[0].id, "leaf");

    let under_child = StreamsQuery {
        parent_id: Some("child".to_string()),
        include_trashed: false,
    };
    let children = store
        .get_streams("alice", &under_child)
        .await
        .expect("children");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, "leaf");

    store
        .create_event("alice", note(&["leaf"], 1.0))
        .await
        .expect("create");
    let infos = store.get_storage_infos("alice").await.expect("infos");
    assert_eq!(infos.event_count, 1);
    assert_eq!(infos.stream_count, 3);
    assert!(infos.size_bytes > 0);

    store.delete_user("alice").await.expect("delete user");
    let infos = store.get_storage_infos("alice").await.expect("infos after");
    assert_eq!(infos.event_count, 0);
    assert_eq!(infos.stream_count, 0);
}

#[tokio::test]
async fn sqlite_write_exhausts_retries_under_exclusive_lock_and_recovers_after_release() {
    let tmp = TempDir::new().expect("tempdir");
    let config = Config {
        retry: RetryPolicy::immediate(5),
        sqlite: SqliteConfig {
            busy_timeout_ms: 10,
        },
        ..Default::default()
    };
    let store = open(&tmp, &config);

    let lock_conn = Connection::open(tmp.path().join("events.db")).expect("open lock");
    lock_conn
        .execute_batch("BEGIN EXCLUSIVE;")
        .expect("acquire exclusive lock");

    let blocked = store.create_event("alice", note(&["a"], 1.0)).await;
    let err = blocked.expect_err("write must fail while lock is held");
    assert_eq!(err.kind(), ErrorKind::RetryExhausted);
    assert_eq!(
        err.to_string(),
        "Failed write action events.create after 5 retries"
    );

    lock_conn.execute_batch("COMMIT;").expect("release lock");

    store
        .create_event("alice", note(&["a"], 2.0))
        .await
        .expect("write should succeed after lock release");
    let events = store
        .get_events("alice", &EventsQuery::default())
        .await
        .expect("read");
    assert_eq!(
        times(&events),
        vec![2.0],
        "exactly one successful write should be recorded"
    );
}

#[tokio::test]
async fn legacy_placeholder_is_rejected_as_malformed() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default()).with_dialect(SqlDialect::legacy());
    store
        .create_event("alice", note(&["a"], 1.0))
        .await
        .expect("create");

    let negation_only = query(r#"[{"not":["b"]}]"#);
    let err = store.get_events("alice", &negation_only).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryMalformed);

    let err = store
        .get_events_streamed("alice", &negation_only)
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryMalformed);

    // Positive clauses never need the placeholder.
    let positive = store
        .get_events("alice", &query(r#"[{"any":["a"],"not":["b"]}]"#))
        .await
        .expect("positive query");
    assert_eq!(positive.len(), 1);
}

#[tokio::test]
async fn negation_only_block_matches_every_other_event() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default());
    store
        .create_event("alice", note(&["a"], 1.0))
        .await
        .expect("create");
    store
        .create_event("alice", note(&["b"], 2.0))
        .await
        .expect("create");
    store
        .create_event("alice", note(&["a", "b"], 3.0))
        .await
        .expect("create");

    let events = store
        .get_events("alice", &query(r#"[{"not":["b"]}]"#))
        .await
        .expect("negation");
    assert_eq!(times(&events), vec![1.0]);
}

#[tokio::test]
async fn dropping_the_stream_stops_the_producer() {
    let tmp = TempDir::new().expect("tempdir");
    let config = Config {
        streaming: StreamingConfig {
            channel_capacity: 1,
        },
        ..Default::default()
    };
    let store = open(&tmp, &config);
    for i in 0..20 {
        store
            .create_event("alice", note(&["a"], i as f64))
            .await
            .expect("create");
    }
    let mut events = store
        .get_events_streamed("alice", &EventsQuery::default())
        .await
        .expect("open");
    let first = events.next().await.expect("one item").expect("ok item");
    assert_eq!(first.time, Some(19.0));
    drop(events);

    // The producer released its connection, so writes go through.
    store
        .create_event("alice", note(&["a"], 99.0))
        .await
        .expect("write after drop");
}

#[tokio::test]
async fn stamped_times_and_digests_survive_read_back() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default());

    let mut created = Vec::new();
    for i in 0..50 {
        let event = Event {
            stream_ids: vec!["a".to_string()],
            content: Some(serde_json::json!(i)),
            ..Default::default()
        };
        created.push(store.create_event("alice", event).await.expect("create"));
    }

    let read = store
        .get_events("alice", &EventsQuery::default())
        .await
        .expect("read");
    assert_eq!(read.len(), created.len());
    for event in &read {
        let original = created
            .iter()
            .find(|c| c.id == event.id)
            .expect("created event");
        assert_eq!(event.time, original.time);
        assert_eq!(event.created, original.created);
        assert_eq!(
            event.integrity,
            Some(event.compute_integrity()),
            "{}",
            event.id
        );
    }

    let first = store
        .delete_event("alice", &created[0].id)
        .await
        .expect("delete");
    let again = store
        .delete_event("alice", &created[0].id)
        .await
        .expect("delete again");
    assert_eq!(first.deleted, again.deleted);
}

#[tokio::test]
async fn stream_ids_match_exactly_regardless_of_case_and_punctuation() {
    let tmp = TempDir::new().expect("tempdir");
    let sqlite = open(&tmp, &Config::default());
    let memory = MemoryStore::new();
    for (streams, time) in [
        (&["Diary"][..], 1.0),
        (&["foo", "bar"][..], 2.0),
        (&[".."][..], 3.0),
    ] {
        sqlite
            .create_event("alice", note(streams, time))
            .await
            .expect("sqlite");
        memory
            .create_event("alice", note(streams, time))
            .await
            .expect("memory");
    }

    for (json, expected) in [
        (r#""diary""#, vec![]),
        (r#""Diary""#, vec![1.0]),
        (r#""foo/bar""#, vec![]),
        (r#""foo bar""#, vec![]),
        (r#""foo""#, vec![2.0]),
        (r#"".."#, vec![3.0]),
        (r#"[{"not":[".."]}]"#, vec![2.0, 1.0]),
    ] {
        let from_sqlite = sqlite
            .get_events("alice", &query(json))
            .await
            .expect("sqlite");
        let from_memory = memory
            .get_events("alice", &query(json))
            .await
            .expect("memory");
        assert_eq!(times(&from_sqlite), expected, "sqlite {json}");
        assert_eq!(times(&from_memory), expected, "memory {json}");
    }
}

const IDS: [&str; 7] = ["diary", "Diary", "foo/bar", "foo", "bar", "..", "x y"];

fn id() -> impl Strategy<Value = String> {
    prop::sample::select(IDS.to_vec()).prop_map(str::to_string)
}

fn any_clause() -> impl Strategy<Value = Vec<String>> {
    prop_oneof![
        3 => prop::collection::vec(id(), 0..3),
        1 => Just(vec!["*".to_string()]),
    ]
}

fn leaf_block() -> impl Strategy<Value = QueryBlock> {
    (any_clause(), prop::collection::vec(id(), 0..2)).prop_map(|(any, not)| QueryBlock {
        any,
        and: Vec::new(),
        not,
    })
}

fn block() -> impl Strategy<Value = QueryBlock> {
    (
        any_clause(),
        prop::collection::vec(leaf_block(), 0..2),
        prop::collection::vec(id(), 0..2),
    )
        .prop_map(|(any, and, not)| QueryBlock { any, and, not })
}

#[test]
fn compiled_sql_agrees_with_reference_evaluation() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open(&tmp, &Config::default());
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    // One event per non-empty subset of IDS.
    let mut stored = Vec::new();
    for mask in 1u32..(1 << IDS.len()) {
        let streams: Vec<&str> = IDS
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, id)| *id)
            .collect();
        let event = runtime
            .block_on(store.create_event("alice", note(&streams, mask as f64)))
            .expect("create");
        stored.push(event);
    }

    let mut runner = TestRunner::new(ProptestConfig::with_cases(128));
    runner
        .run(&prop::collection::vec(block(), 0..3), |blocks| {
            let query = StreamQuery::new(blocks);
            let mut expected: Vec<String> = stored
                .iter()
                .filter(|e| query.matches(&e.stream_ids))
                .map(|e| e.id.clone())
                .collect();
            let mut actual: Vec<String> = store
                .events_blocking("alice", &EventsQuery::for_streams(query.clone()))
                .expect("query")
                .into_iter()
                .map(|e| e.id)
                .collect();
            expected.sort();
            actual.sort();
            prop_assert_eq!(actual, expected, "query {}", query.to_json());
            Ok(())
        })
        .expect("compiled SQL must agree with the reference evaluation");
}
