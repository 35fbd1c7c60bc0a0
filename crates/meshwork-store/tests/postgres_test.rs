//! PostgreSQL provider integration tests
//!
//! Require a live database; set `MESH_TEST_DATABASE_URL` to run, e.g.
//!
//! ```text
//! MESH_TEST_DATABASE_URL=postgres://localhost/mesh_test \
//!     cargo test -p meshwork-store --test postgres_test
//! ```
//!
//! Without the variable every test is a no-op pass. Each test namespaces its
//! keys with a fresh uuid so suites can run concurrently against one
//! database.

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use meshwork_core::message::{MessageMetadata, StreamMessage};
use meshwork_store::{HookSignal, HookTarget, MeshStore, PostgresMeshStore, TaskKind, TimeHook};

async fn store() -> Option<PostgresMeshStore> {
    let url = std::env::var("MESH_TEST_DATABASE_URL").ok()?;
    let pool = sqlx::PgPool::connect(&url)
        .await
        .expect("database should be reachable when MESH_TEST_DATABASE_URL is set");
    let store = PostgresMeshStore::new(pool);
    store.migrate().await.expect("schema should apply");
    Some(store)
}

fn scoped(name: &str) -> String {
    format!("pgtest:{}:{name}", Uuid::now_v7().simple())
}

fn message(jid: &str) -> StreamMessage {
    StreamMessage::new(MessageMetadata::enter(jid, "a1"), json!({"k": "v"}))
}

#[tokio::test]
async fn test_hincrby_first_claim_wins() {
    let Some(store) = store().await else { return };
    let key = scoped("hash");

    assert_eq!(store.hincrby_float(&key, "guard", 1.0).await.unwrap(), 1.0);
    assert_eq!(store.hincrby_float(&key, "guard", 1.0).await.unwrap(), 2.0);
    assert_eq!(store.hincrby_float(&key, "other", 2.5).await.unwrap(), 2.5);
}

#[tokio::test]
async fn test_create_job_rejects_duplicates() {
    let Some(store) = store().await else { return };
    let key = scoped("job");

    assert!(store
        .create_job(&key, vec![("md/jid".into(), "\"j\"".into())], 1.0)
        .await
        .unwrap());
    assert!(!store.create_job(&key, vec![], 1.0).await.unwrap());

    let fields = store.hget_all(&key).await.unwrap();
    assert_eq!(fields.get(":").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn test_stream_consume_ack_and_skip_locked() {
    let Some(store) = store().await else { return };
    let stream = scoped("stream");

    store.publish_to_stream(&stream, &message("j1")).await.unwrap();
    store.publish_to_stream(&stream, &message("j2")).await.unwrap();

    let batch = store.consume_batch(&stream, "g", "c1", 10, 0).await.unwrap();
    assert_eq!(batch.len(), 2);

    // claimed entries are invisible to a second consumer
    assert!(store
        .consume_batch(&stream, "g", "c2", 10, 0)
        .await
        .unwrap()
        .is_empty());

    let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
    assert_eq!(store.ack(&stream, "g", &ids).await.unwrap(), 2);
}

#[tokio::test]
async fn test_delayed_visibility_and_idle_claim() {
    let Some(store) = store().await else { return };
    let stream = scoped("delayed");

    store
        .publish_to_stream_delayed(&stream, &message("j1"), Duration::from_millis(400))
        .await
        .unwrap();
    assert!(store
        .consume_batch(&stream, "g", "c", 10, 0)
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let batch = store.consume_batch(&stream, "g", "dead", 10, 0).await.unwrap();
    assert_eq!(batch.len(), 1);

    // unacked + idle: another consumer reclaims after the threshold
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reclaimed = store
        .claim_idle(&stream, "g", "live", Duration::from_millis(200), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message.metadata.jid, "j1");
}

#[tokio::test]
async fn test_hook_signal_single_delivery() {
    let Some(store) = store().await else { return };
    let topic = scoped("topic");

    store
        .set_hook_signal(HookSignal {
            topic: topic.clone(),
            resolved: "r".into(),
            target: HookTarget {
                job_id: "j".into(),
                gid: "g".into(),
                aid: "a".into(),
                dad: "0".into(),
                sid: Some("-y0-0-".into()),
            },
            expire_at: None,
        })
        .await
        .unwrap();

    let first = store.get_hook_signal(&topic, "r").await.unwrap();
    assert_eq!(first.unwrap().sid.as_deref(), Some("-y0-0-"));
    assert!(store.get_hook_signal(&topic, "r").await.unwrap().is_none());
}

#[tokio::test]
async fn test_time_hooks_pop_in_slot_order() {
    let Some(store) = store().await else { return };
    let jid = scoped("sleeper");

    for (slot, aid) in [(2000_i64, "late"), (1000, "early")] {
        store
            .register_time_hook(TimeHook {
                list_key: format!("{jid}:tq:{slot}"),
                target: jid.clone(),
                gid: "g1".into(),
                aid: aid.into(),
                dad: "0".into(),
                sid: None,
                kind: TaskKind::Sleep,
                slot_ms: slot,
            })
            .await
            .unwrap();
    }

    let first = store
        .get_next_task(5000, Some(&format!("{jid}:tq:1000")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.aid, "early");

    assert_eq!(store.cancel_time_hooks(&jid).await.unwrap(), 1);
}

#[tokio::test]
async fn test_scout_lease() {
    let Some(store) = store().await else { return };
    let role = scoped("scout");

    assert!(store
        .reserve_scout_role(&role, "g1", Duration::from_millis(300))
        .await
        .unwrap());
    assert!(!store
        .reserve_scout_role(&role, "g2", Duration::from_millis(300))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store
        .reserve_scout_role(&role, "g2", Duration::from_millis(300))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_listen_notify_round_trip() {
    let Some(store) = store().await else { return };
    // LISTEN channel names are identifiers; keep it short and unique.
    let channel = format!("mesh_test_{}", Uuid::now_v7().simple());

    let mut rx = store.listen(&channel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.notify(&channel, "hello").await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification should arrive")
        .unwrap();
    assert_eq!(payload, "hello");
}
