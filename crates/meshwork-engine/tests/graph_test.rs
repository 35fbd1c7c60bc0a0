//! Graph interpreter scenarios on the in-memory store
//!
//! Exercises the non-durable activity kinds end-to-end: trigger/worker
//! round-trips, hook signals, cycle loops, awaited child graphs, keyed
//! signal fan-out, and the quorum throttle round-trip. Worker callbacks are
//! driven manually so every step is deterministic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use meshwork_core::manifest::AppManifest;
use meshwork_core::message::StreamMessage;
use meshwork_core::{codes, MeshError};
use meshwork_engine::{Engine, EngineConfig, Quorum, ThrottleCache};
use meshwork_store::{Keys, MemoryMeshStore, MeshStore, ThrottleSpec};

const MANIFEST: &str = r#"
app:
  id: orders
  version: "1"
  graphs:
    - subscribes: order.created
      publishes: order.completed
      activities:
        t1:
          type: trigger
          job:
            maps:
              sku: "{t1.output.data.sku}"
        w1:
          type: worker
          topic: order.work
          job:
            maps:
              echo: "{w1.output.data.echo}"
      transitions:
        t1:
          - to: w1

    - subscribes: approval.requested
      publishes: approval.resolved
      activities:
        t2:
          type: trigger
          job:
            maps:
              id: "{t2.output.data.id}"
        h2:
          type: hook
          hook:
            topic: order.approved
            resolver: "{data.id}"
          job:
            maps:
              approved: "{h2.output.data.ok}"
      transitions:
        t2:
          - to: h2

    - subscribes: loop.started
      publishes: loop.completed
      activities:
        t3:
          type: trigger
          job:
            maps:
              n: "{t3.output.data.n}"
        w3:
          type: worker
          topic: loop.work
          job:
            maps:
              n: "{w3.output.data.n}"
        c3:
          type: cycle
          ancestor: w3
          input:
            n: "{w3.output.data.n}"
      transitions:
        t3:
          - to: w3
        w3:
          - to: c3
            conditions:
              code: 200
              match:
                - expected: true
                  actual:
                    "@pipe":
                      - ["{w3.output.data.n}", 3]
                      - ["{@logical.lt}"]

    - subscribes: parent.started
      publishes: parent.completed
      activities:
        t4:
          type: trigger
        a4:
          type: await
          topic: child.started
          input:
            values: "{t4.output.data.values}"
          job:
            maps:
              child_total: "{a4.output.data.total}"
      transitions:
        t4:
          - to: a4

    - subscribes: child.started
      publishes: child.completed
      activities:
        t5:
          type: trigger
        w5:
          type: worker
          topic: child.work
          input:
            values: "{t5.output.data.values}"
          job:
            maps:
              total: "{w5.output.data.total}"
      transitions:
        t5:
          - to: w5

    - subscribes: watch.started
      activities:
        t6:
          type: trigger
          stats:
            id: region
            key: "{t6.output.data.region}"
        h6:
          type: hook
          hook:
            topic: watch.release
          job:
            maps:
              released: true
      transitions:
        t6:
          - to: h6

    - subscribes: release.requested
      activities:
        t7:
          type: trigger
        s7:
          type: signal
          topic: watch.release
          subtype: all
          key_name: region
          key_value: "{t7.output.data.region}"
      transitions:
        t7:
          - to: s7
"#;

struct Harness {
    store: Arc<MemoryMeshStore>,
    engine: Arc<Engine>,
    keys: Keys,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
        let manifest = AppManifest::from_yaml(MANIFEST).unwrap();
        store.set_app(&manifest).await.unwrap();
        store.activate_app("orders", "1").await.unwrap();

        let engine = Engine::new(
            store.clone() as Arc<dyn MeshStore>,
            EngineConfig::new("mesh", "orders").with_guid("e1"),
        );
        Self {
            keys: Keys::new("mesh", "orders"),
            store,
            engine,
        }
    }

    /// Route engine messages and run worker callbacks until quiescent.
    async fn drain<F>(&self, worker: F)
    where
        F: Fn(&str, &Value) -> Result<Value, MeshError>,
    {
        loop {
            let mut progressed = false;

            let entries = self
                .store
                .consume_batch(&self.keys.engine_stream(), "engine", "t", 100, 0)
                .await
                .unwrap();
            for entry in entries {
                progressed = true;
                let _ = self.engine.route_message(entry.message).await;
                self.store
                    .ack(&self.keys.engine_stream(), "engine", &[entry.id])
                    .await
                    .unwrap();
            }

            for topic in ["order.work", "loop.work", "child.work"] {
                let stream = self.keys.stream(topic);
                let entries = self
                    .store
                    .consume_batch(&stream, "worker", "t", 100, 0)
                    .await
                    .unwrap();
                for entry in entries {
                    progressed = true;
                    let mut reply = entry.message.clone();
                    match worker(topic, &entry.message.data) {
                        Ok(data) => {
                            reply.metadata.code = Some(codes::SUCCESS);
                            reply.data = data;
                        }
                        Err(e) => {
                            reply.metadata.code = Some(e.code());
                            reply.data = json!({ "message": e.to_string() });
                        }
                    }
                    self.store
                        .publish_to_stream(&self.keys.engine_stream(), &reply)
                        .await
                        .unwrap();
                    self.store.ack(&stream, "worker", &[entry.id]).await.unwrap();
                }
            }

            if !progressed {
                break;
            }
        }
    }

    async fn data(&self, jid: &str) -> Value {
        self.engine.get_state(jid).await.unwrap().data
    }
}

fn echo_worker(topic: &str, data: &Value) -> Result<Value, MeshError> {
    match topic {
        "order.work" => Ok(json!({ "echo": data })),
        "loop.work" => {
            let n = data.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({ "n": n + 1 }))
        }
        "child.work" => {
            let values = data
                .get("values")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let total: i64 = values.iter().filter_map(Value::as_i64).sum();
            Ok(json!({ "total": total }))
        }
        other => Err(MeshError::fatal(format!("unexpected topic {other}"))),
    }
}

#[tokio::test]
async fn test_trigger_worker_round_trip() {
    let h = Harness::new().await;
    let jid = h
        .engine
        .start_job("order.created", json!({ "sku": "widget" }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    assert_eq!(h.engine.get_status(&jid).await.unwrap(), 0.0);
    let data = h.data(&jid).await;
    assert_eq!(data["sku"], json!("widget"));
    assert_eq!(data["echo"]["sku"], json!("widget"));
}

#[tokio::test]
async fn test_hook_signal_resolution() {
    let h = Harness::new().await;
    let jid = h
        .engine
        .start_job("approval.requested", json!({ "id": "o-9" }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;
    assert_eq!(h.engine.get_status(&jid).await.unwrap(), 1.0);

    // the resolver keys the binding by the business id, not the job id
    h.engine
        .deliver_signal("order.approved", json!({ "id": "o-9", "ok": true }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    assert_eq!(h.engine.get_status(&jid).await.unwrap(), 0.0);
    assert_eq!(h.data(&jid).await["approved"], json!(true));
}

#[tokio::test]
async fn test_hook_signal_for_other_id_stays_pending() {
    let h = Harness::new().await;
    let jid = h
        .engine
        .start_job("approval.requested", json!({ "id": "o-9" }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    h.engine
        .deliver_signal("order.approved", json!({ "id": "other", "ok": true }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    assert_eq!(h.engine.get_status(&jid).await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_cycle_loops_until_condition_fails() {
    let h = Harness::new().await;
    let jid = h
        .engine
        .start_job("loop.started", json!({ "n": 0 }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    assert_eq!(h.engine.get_status(&jid).await.unwrap(), 0.0);
    // three iterations: 0→1→2→3, then the `n < 3` gate stops the cycle
    assert_eq!(h.data(&jid).await["n"], json!(3));
}

#[tokio::test]
async fn test_await_spawns_and_joins_child_graph() {
    let h = Harness::new().await;
    let jid = h
        .engine
        .start_job("parent.started", json!({ "values": [1, 2, 3] }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    assert_eq!(h.engine.get_status(&jid).await.unwrap(), 0.0);
    assert_eq!(h.data(&jid).await["child_total"], json!(6));

    // the child is its own job, back-linked to the parent
    let raw = h.store.hget_all(&h.keys.job(&jid)).await.unwrap();
    let child_jid = raw
        .keys()
        .find_map(|k| k.strip_prefix("ch/"))
        .expect("child marker");
    let child = h.engine.get_state(child_jid).await.unwrap();
    assert_eq!(child.metadata.pj.as_deref(), Some(jid.as_str()));
    assert_eq!(child.data["total"], json!(6));
}

#[tokio::test]
async fn test_signal_all_releases_keyed_jobs() {
    let h = Harness::new().await;
    let west1 = h
        .engine
        .start_job("watch.started", json!({ "region": "west" }), None)
        .await
        .unwrap();
    let west2 = h
        .engine
        .start_job("watch.started", json!({ "region": "west" }), None)
        .await
        .unwrap();
    let east = h
        .engine
        .start_job("watch.started", json!({ "region": "east" }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    for jid in [&west1, &west2, &east] {
        assert_eq!(h.engine.get_status(jid).await.unwrap(), 1.0);
    }

    h.engine
        .start_job("release.requested", json!({ "region": "west" }), None)
        .await
        .unwrap();
    h.drain(echo_worker).await;

    assert_eq!(h.engine.get_status(&west1).await.unwrap(), 0.0);
    assert_eq!(h.engine.get_status(&west2).await.unwrap(), 0.0);
    // the other key is untouched
    assert_eq!(h.engine.get_status(&east).await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_throttle_round_trip_between_members() {
    let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
    let keys = Keys::new("mesh", "orders");

    let throttle_a = Arc::new(ThrottleCache::new("member-a"));
    let quorum_a = Arc::new(Quorum::new(
        store.clone() as Arc<dyn MeshStore>,
        keys.clone(),
        "member-a",
        throttle_a,
    ));
    let throttle_b = Arc::new(ThrottleCache::new("member-b"));
    let quorum_b = Arc::new(Quorum::new(
        store.clone() as Arc<dyn MeshStore>,
        keys.clone(),
        "member-b",
        Arc::clone(&throttle_b),
    ));

    let (_tx, shutdown) = tokio::sync::watch::channel(false);
    quorum_a.join(shutdown.clone()).await.unwrap();
    quorum_b.join(shutdown.clone()).await.unwrap();

    quorum_a
        .throttle(ThrottleSpec {
            topic: None,
            guid: None,
            throttle: 500,
        })
        .await
        .unwrap();

    // member B observes the new rate within the round-trip budget
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(throttle_b.effective(None), 500);

    // and a fresh member inherits it from the store on seed
    let late = ThrottleCache::new("member-c");
    let rate = store.get_throttle_rate(None, Some("member-c")).await.unwrap();
    late.set(None, None, rate);
    assert_eq!(late.effective(None), 500);

    quorum_a
        .throttle(ThrottleSpec {
            topic: None,
            guid: None,
            throttle: 0,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(throttle_b.effective(None), 0);
}

#[tokio::test]
async fn test_job_start_message_round_trips_reserved_names() {
    // wire-shape check: compact names survive the stream
    let message = StreamMessage::new(
        meshwork_core::message::MessageMetadata {
            jid: "j1".into(),
            aid: "w1".into(),
            dad: "0,1".into(),
            ts: meshwork_core::message::now_iso(),
            code: Some(589),
            ..Default::default()
        },
        json!({"items": []}),
    );
    let wire = serde_json::to_value(&message).unwrap();
    assert_eq!(wire["metadata"]["jid"], json!("j1"));
    assert_eq!(wire["metadata"]["dad"], json!("0,1"));
    assert_eq!(wire["metadata"]["code"], json!(589));
}
