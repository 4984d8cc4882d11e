use futures::StreamExt;
use std::sync::Arc;
use tempfile::TempDir;
use tributary::core::config::Config;
use tributary::core::error::{ErrorKind, ErrorPayload};
use tributary::core::model::{Attachment, Event, EventsQuery, PermissionSet};
use tributary::core::pipeline::Pipeline;
use tributary::core::query::StreamQuery;
use tributary::core::wire;
use tributary::plugins;

const CONFIG: &str = r#"
default_backend = "local"

[[backends]]
id = "local"
name = "Local"
kind = "sqlite"
path = "data/events.db"
mandatory = true

[[backends]]
id = "audit"
name = "Audit"
kind = "audit"
path = "data/audit"

[retry]
max_attempts = 3

[attachments]
secret = "test-secret"
"#;

const STUB_BACKEND: &str = r#"
[[backends]]
id = "legacy"
name = "Legacy plugin"
kind = "faulty"
"#;

fn load_text(tmp: &TempDir, text: &str) -> Config {
    let path = tmp.path().join("tributary.toml");
    std::fs::write(&path, text).expect("write config");
    Config::load(&path).expect("load config")
}

fn load(tmp: &TempDir) -> Config {
    load_text(tmp, CONFIG)
}

fn event(streams: &[&str], time: f64) -> Event {
    Event {
        stream_ids: streams.iter().map(|s| s.to_string()).collect(),
        event_type: Some("note/txt".to_string()),
        time: Some(time),
        ..Default::default()
    }
}

async fn deliver(
    config: &Config,
    events: tributary::core::store::EventStream,
    perms: PermissionSet,
    prefix: Option<&str>,
) -> String {
    let filtered = Pipeline::for_caller(Arc::new(perms), &config.attachments.secret).run(events);
    wire::json_array(filtered, prefix.map(str::to_string))
        .map(|chunk| chunk.expect("chunk"))
        .collect::<Vec<String>>()
        .await
        .concat()
}

#[tokio::test]
async fn boot_from_config_and_deliver_filtered_wire_output() {
    let tmp = TempDir::new().expect("tempdir");
    let config = load(&tmp);
    let federation = plugins::boot(&config).expect("boot");
    assert_eq!(federation.backends().len(), 2);
    assert!(tmp.path().join("data/events.db").exists());

    let mut with_file = event(&["diary", "secret"], 2.0);
    with_file.attachments.push(Attachment {
        id: "att1".to_string(),
        file_name: "scan.pdf".to_string(),
        media_type: "application/pdf".to_string(),
        size: 42,
        ..Default::default()
    });
    federation
        .create_event("alice", event(&["diary"], 1.0))
        .await
        .expect("local");
    federation
        .create_event("alice", with_file)
        .await
        .expect("local with file");
    federation
        .create_event("alice", event(&["secret"], 3.0))
        .await
        .expect("local secret");
    federation
        .create_event("alice", event(&[":audit:diary"], 4.0))
        .await
        .expect("audit");

    let perms = PermissionSet::new("acc1", ["diary", ":audit:diary"]).with_attachments();
    let events = federation
        .query("alice", &EventsQuery::default())
        .await
        .expect("query");
    let text = deliver(&config, events, perms, Some(r#"{"events":"#)).await;
    assert!(text.starts_with(r#"{"events":["#));
    assert!(text.ends_with(']'));

    let delivered: Vec<Event> =
        serde_json::from_str(&text[r#"{"events":"#.len()..]).expect("valid array");
    assert_eq!(delivered.len(), 3, "the secret-only event is filtered out");
    for e in &delivered {
        assert!(
            e.stream_ids
                .iter()
                .all(|s| s == "diary" || s == ":audit:diary")
        );
        assert_eq!(e.stream_id.as_ref(), e.stream_ids.first());
    }
    let attached = delivered
        .iter()
        .find(|e| !e.attachments.is_empty())
        .expect("attachment event");
    let token = attached.attachments[0].read_token.as_deref().expect("read token");
    assert!(token.starts_with("acc1-"));
    assert_eq!(attached.stream_ids, vec!["diary"]);

    federation.shutdown().expect("shutdown");
}

#[tokio::test]
async fn deletions_are_delivered_minimized() {
    let tmp = TempDir::new().expect("tempdir");
    let config = load(&tmp);
    let federation = plugins::boot(&config).expect("boot");

    let created = federation
        .create_event("alice", event(&["diary"], 1.0))
        .await
        .expect("create");
    federation
        .delete_event("alice", &created.id)
        .await
        .expect("delete");

    let local_diary = r#"{"streams":"diary","storeId":"local"}"#
        .parse::<StreamQuery>()
        .expect("query");
    let query = EventsQuery {
        include_deletions: true,
        ..EventsQuery::for_streams(local_diary)
    };
    let events = federation.query("alice", &query).await.expect("query");
    let text = deliver(&config, events, PermissionSet::new("acc1", ["diary"]), None).await;
    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
    let deleted = value[0].as_object().expect("object");
    assert_eq!(deleted.len(), 2);
    assert_eq!(deleted["id"], serde_json::json!(created.id));
    assert!(deleted["deleted"].is_f64());
}

#[tokio::test]
async fn empty_result_is_still_a_valid_array() {
    let tmp = TempDir::new().expect("tempdir");
    let config = load(&tmp);
    let federation = plugins::boot(&config).expect("boot");
    let events = federation
        .query("nobody", &EventsQuery::default())
        .await
        .expect("query");
    let perms = PermissionSet::new("acc", ["*"]);
    let text = deliver(&config, events, perms, Some("x=")).await;
    assert_eq!(text, "x=[]");
}

#[tokio::test]
async fn stub_backend_is_skipped_for_storage_infos_but_fails_queries() {
    let tmp = TempDir::new().expect("tempdir");
    let config = load_text(&tmp, &format!("{CONFIG}{STUB_BACKEND}"));
    let federation = plugins::boot(&config).expect("boot");
    federation
        .create_event("alice", event(&["diary"], 1.0))
        .await
        .expect("create");

    let infos = federation.storage_infos("alice").await.expect("infos");
    assert_eq!(
        infos.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["audit", "local"]
    );
    assert_eq!(infos["local"].event_count, 1);
    assert_eq!(infos["audit"].event_count, 0);

    let err = federation
        .query("alice", &EventsQuery::default())
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert_eq!(ErrorPayload::from(&err).id, ErrorKind::NotSupported);
}

#[test]
fn boot_rejects_invalid_configuration() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("tributary.toml");
    std::fs::write(&path, CONFIG.replace("id = \"audit\"", "id = \"local\"")).expect("write");
    let err = Config::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    let payload = ErrorPayload::from(&err);
    let json = serde_json::to_value(&payload).expect("payload json");
    assert_eq!(json["id"], "invalid-configuration");
}
