//! End-to-end scenarios on the in-memory store
//!
//! These drive the engine, durable worker, and scout directly (no spawned
//! loops) so every interleaving is deterministic: publish → drain → advance
//! time → drain again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use meshwork_core::codes;
use meshwork_durable::{
    durable_manifest, ChildOptions, DurableWorker, ProxyOptions, WorkerConfig, EXECUTE_TOPIC,
};
use meshwork_engine::{Engine, EngineConfig, InterruptOptions, Scout, ScoutConfig};
use meshwork_store::{Keys, MemoryMeshStore, MeshStore};

const NS: &str = "mesh";
const APP: &str = "durable";
const QUEUE: &str = "q";

struct Mesh {
    store: Arc<MemoryMeshStore>,
    engine: Arc<Engine>,
    worker: Arc<DurableWorker>,
    scout: Scout,
    keys: Keys,
}

impl Mesh {
    async fn new() -> Self {
        let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
        store.set_app(&durable_manifest(APP)).await.unwrap();
        store.activate_app(APP, "1").await.unwrap();

        let engine = Engine::new(
            store.clone() as Arc<dyn MeshStore>,
            EngineConfig::new(NS, APP)
                .with_guid("engine-test")
                .with_fidelity_secs(1),
        );
        let worker = DurableWorker::new(
            store.clone() as Arc<dyn MeshStore>,
            WorkerConfig::new(NS, APP, QUEUE).with_guid("worker-test"),
        );
        let scout = Scout::new(Arc::clone(&engine), ScoutConfig::default());

        Self {
            keys: Keys::new(NS, APP),
            store,
            engine,
            worker,
            scout,
        }
    }

    /// Route every visible message until the mesh is quiescent.
    async fn drain(&self) {
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

            for topic in self.worker.topics() {
                let stream = self.keys.stream(&topic);
                let entries = self
                    .store
                    .consume_batch(&stream, "worker", "t", 100, 0)
                    .await
                    .unwrap();
                for entry in entries {
                    progressed = true;
                    if topic.ends_with(".activity") {
                        self.worker
                            .process_activity_message(entry.message)
                            .await
                            .unwrap();
                    } else {
                        let name = topic.rsplit('.').next().unwrap();
                        self.worker
                            .process_workflow_message(name, entry.message)
                            .await
                            .unwrap();
                    }
                    self.store.ack(&stream, "worker", &[entry.id]).await.unwrap();
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Advance virtual time, fire the scout, and drain the fallout.
    async fn advance_and_tick(&self, by: Duration) {
        self.store.advance(by);
        let now = self.store.now_ms();
        self.scout.tick(now).await.unwrap();
        self.drain().await;
    }

    async fn start_workflow(&self, name: &str, args: Value) -> String {
        let jid = self
            .engine
            .start_job(
                EXECUTE_TOPIC,
                json!({ "topic": format!("{QUEUE}.{name}"), "args": args }),
                None,
            )
            .await
            .unwrap();
        self.drain().await;
        jid
    }

    async fn response(&self, jid: &str) -> Value {
        self.engine.get_state(jid).await.unwrap().data["response"].clone()
    }
}

#[tokio::test]
async fn test_simple_echo_round_trip() {
    let mesh = Mesh::new().await;
    mesh.worker
        .register_workflow("echo", |_ctx, args| async move {
            Ok(json!({ "echo": args[0] }))
        });

    let jid = mesh.start_workflow("echo", json!([{ "x": 7 }])).await;

    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 0.0);
    let state = mesh.engine.get_state(&jid).await.unwrap();
    assert_eq!(state.data["response"]["echo"], json!({ "x": 7 }));
    assert!(state.metadata.jc.is_some());
}

#[tokio::test]
async fn test_durable_sleep_runs_exactly_twice() {
    let mesh = Mesh::new().await;
    let invocations = Arc::new(AtomicU32::new(0));

    let counter = invocations.clone();
    mesh.worker.register_workflow("nap", move |ctx, _args| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.sleep_for(Duration::from_secs(2)).await?;
            Ok(json!("done"))
        }
    });

    let jid = mesh.start_workflow("nap", json!([])).await;

    // suspended: one execution, job still open, sleep marker pending
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 1.0);

    // the wake fires after the duration (plus fidelity quantization)
    mesh.advance_and_tick(Duration::from_secs(4)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 0.0);
    assert_eq!(mesh.response(&jid).await, json!("done"));
}

#[tokio::test]
async fn test_proxy_activity_retries_with_backoff() {
    let mesh = Mesh::new().await;
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    mesh.worker.register_activity("act", move |_args| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(meshwork_durable::DurableError::Retryable(
                    "first call fails".into(),
                ))
            } else {
                Ok(json!("ok"))
            }
        }
    });
    mesh.worker.register_workflow("use_act", |ctx, _args| async move {
        let proxy = ctx.proxy_activities(
            ProxyOptions::default().with_retry(
                meshwork_core::RetryPolicy::default()
                    .with_maximum_attempts(3)
                    .with_backoff_coefficient(2.0),
            ),
        );
        let out: String = proxy.call("act", vec![]).await?;
        Ok(json!(out))
    });

    let jid = mesh.start_workflow("use_act", json!([])).await;

    // first activity attempt failed; the retry is delayed, not immediate
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    mesh.drain().await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // delay for retry 1 with coefficient 2 is 2 seconds
    mesh.store.advance(Duration::from_secs(3));
    mesh.drain().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(mesh.response(&jid).await, json!("ok"));
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_wait_for_signal_fan_in() {
    let mesh = Mesh::new().await;

    mesh.worker.register_workflow("fanin", |ctx, _args| async move {
        let branches = vec![
            Box::pin({
                let ctx = ctx.clone();
                async move { ctx.wait_for::<Value>("A").await }
            }) as futures::future::BoxFuture<'static, Result<Value, meshwork_durable::DurableError>>,
            Box::pin({
                let ctx = ctx.clone();
                async move { ctx.wait_for::<Value>("B").await }
            }),
        ];
        let values = ctx.all(branches).await?;
        let joined = format!(
            "{}{}",
            values[0].as_str().unwrap_or(""),
            values[1].as_str().unwrap_or("")
        );
        Ok(json!(joined))
    });

    let jid = mesh.start_workflow("fanin", json!([])).await;
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 1.0);

    // first signal resolves one slot but the collation keeps waiting
    mesh.engine.deliver_signal("A", json!("x"), None).await.unwrap();
    mesh.drain().await;
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 1.0);

    mesh.engine.deliver_signal("B", json!("y"), None).await.unwrap();
    mesh.drain().await;

    assert_eq!(mesh.response(&jid).await, json!("xy"));

    // the collator stored each result at its own execution index
    let raw = mesh
        .store
        .hget_all(&mesh.keys.job(&jid))
        .await
        .unwrap();
    assert_eq!(raw.get("-y0-0-").map(String::as_str), Some("\"x\""));
    assert_eq!(raw.get("-y0-1-").map(String::as_str), Some("\"y\""));
}

#[tokio::test]
async fn test_exec_child_cascade() {
    let mesh = Mesh::new().await;

    mesh.worker.register_workflow("leaf", |_ctx, args| async move {
        let n = args[0].as_i64().unwrap_or(0);
        Ok(json!(n * n))
    });
    mesh.worker.register_workflow("parent", |ctx, _args| async move {
        let mut squares = Vec::new();
        for n in 0..3 {
            let square: i64 = ctx
                .exec_child(ChildOptions::new("leaf", vec![json!(n)]))
                .await?;
            squares.push(square);
        }
        Ok(json!(squares))
    });

    let jid = mesh.start_workflow("parent", json!([])).await;

    assert_eq!(mesh.response(&jid).await, json!([0, 1, 4]));

    // three child markers on the parent, each child back-linked via pj
    let raw = mesh.store.hget_all(&mesh.keys.job(&jid)).await.unwrap();
    let children: Vec<&String> = raw
        .keys()
        .filter(|k| k.starts_with("ch/"))
        .collect();
    assert_eq!(children.len(), 3);

    for child_field in children {
        let child_jid = child_field.strip_prefix("ch/").unwrap();
        let child = mesh.engine.get_state(child_jid).await.unwrap();
        assert_eq!(child.metadata.pj.as_deref(), Some(jid.as_str()));
    }
}

#[tokio::test]
async fn test_signal_before_registration_wins() {
    let mesh = Mesh::new().await;

    mesh.worker.register_workflow("late", |ctx, _args| async move {
        let got: String = ctx.wait_for("early.topic").await?;
        Ok(json!(got))
    });

    // deliver before any binding exists: the signal persists
    mesh.engine
        .deliver_signal("early.topic", json!("kept"), None)
        .await
        .unwrap();

    let jid = mesh.start_workflow("late", json!([])).await;

    // no second signal needed; registration claimed the persisted delivery
    assert_eq!(mesh.response(&jid).await, json!("kept"));
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_sleep_zero_floors_to_slot_boundary() {
    let mesh = Mesh::new().await;
    mesh.worker.register_workflow("zero", |ctx, _args| async move {
        ctx.sleep_for(Duration::ZERO).await?;
        Ok(json!("woke"))
    });

    let jid = mesh.start_workflow("zero", json!([])).await;
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 1.0);

    // wakes at the current slot's scout pass, never earlier than a boundary
    mesh.advance_and_tick(Duration::from_secs(1)).await;
    assert_eq!(mesh.response(&jid).await, json!("woke"));
}

#[tokio::test]
async fn test_interrupt_cancels_sleep_and_is_idempotent() {
    let mesh = Mesh::new().await;
    mesh.worker.register_workflow("sleeper", |ctx, _args| async move {
        ctx.sleep_for(Duration::from_secs(3600)).await?;
        Ok(json!("never"))
    });

    let jid = mesh.start_workflow("sleeper", json!([])).await;
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 1.0);

    mesh.engine
        .interrupt(
            &jid,
            InterruptOptions {
                reason: Some("operator stop".into()),
                descend: false,
            },
        )
        .await
        .unwrap();

    let status = mesh.engine.get_status(&jid).await.unwrap();
    assert!(status <= codes::INTERRUPTED_FLOOR);

    // the pending wake was cancelled with the job
    assert!(mesh
        .store
        .get_next_task(mesh.store.now_ms() + 10_000_000, None)
        .await
        .unwrap()
        .is_none());

    // interrupting a terminal job is a no-op returning success
    mesh.engine
        .interrupt(&jid, InterruptOptions::default())
        .await
        .unwrap();
    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), status);
}

#[tokio::test]
async fn test_duplicate_job_id_is_rejected() {
    let mesh = Mesh::new().await;
    mesh.worker
        .register_workflow("echo", |_ctx, args| async move { Ok(args[0].clone()) });

    let context = meshwork_engine::JobContext {
        jid: Some("fixed-id".into()),
        ..Default::default()
    };
    mesh.engine
        .start_job(
            EXECUTE_TOPIC,
            json!({ "topic": "q.echo", "args": ["a"] }),
            Some(context.clone()),
        )
        .await
        .unwrap();
    mesh.drain().await;
    assert_eq!(mesh.engine.get_status("fixed-id").await.unwrap(), 0.0);

    // same jid again: the trigger rejects it and the first result stands
    mesh.engine
        .start_job(
            EXECUTE_TOPIC,
            json!({ "topic": "q.echo", "args": ["b"] }),
            Some(context),
        )
        .await
        .unwrap();
    mesh.drain().await;
    assert_eq!(mesh.response("fixed-id").await, json!("a"));
}

#[tokio::test]
async fn test_fatal_workflow_error_reaches_job_state() {
    let mesh = Mesh::new().await;
    mesh.worker.register_workflow("explode", |_ctx, _args| async move {
        Err(meshwork_durable::DurableError::Fatal("kaboom".into()))
    });

    let jid = mesh.start_workflow("explode", json!([])).await;

    assert_eq!(mesh.engine.get_status(&jid).await.unwrap(), 0.0);
    let state = mesh.engine.get_state(&jid).await.unwrap();
    assert_eq!(state.data["$error"]["code"], json!(596));
    assert!(state.data["$error"]["message"]
        .as_str()
        .unwrap()
        .contains("kaboom"));
}

#[tokio::test]
async fn test_child_error_propagates_to_parent_call_site() {
    let mesh = Mesh::new().await;
    mesh.worker.register_workflow("bad_leaf", |_ctx, _args| async move {
        Err(meshwork_durable::DurableError::Fatal("leaf broke".into()))
    });
    mesh.worker.register_workflow("guardian", |ctx, _args| async move {
        match ctx
            .exec_child::<Value>(ChildOptions::new("bad_leaf", vec![]))
            .await
        {
            Ok(_) => Ok(json!("unexpected")),
            Err(e) if meshwork_durable::did_interrupt(&e) => Err(e),
            Err(e) => Ok(json!(format!("caught: {e}"))),
        }
    });

    let jid = mesh.start_workflow("guardian", json!([])).await;
    let response = mesh.response(&jid).await;
    assert!(response.as_str().unwrap().contains("leaf broke"));
}

#[tokio::test]
async fn test_completion_publishes_exactly_once() {
    let mesh = Mesh::new().await;

    // wire a quorum so completion notifications flow
    let quorum = Arc::new(meshwork_engine::Quorum::new(
        mesh.store.clone() as Arc<dyn MeshStore>,
        mesh.keys.clone(),
        "observer",
        mesh.engine.throttle_cache(),
    ));
    let (_tx, shutdown) = tokio::sync::watch::channel(false);
    quorum.join(shutdown).await.unwrap();
    mesh.engine.set_quorum(Arc::clone(&quorum));
    let mut events = quorum.subscribe();

    mesh.worker
        .register_workflow("echo", |_ctx, args| async move { Ok(args[0].clone()) });
    let jid = mesh.start_workflow("echo", json!(["once"])).await;

    // drain everything again: no second completion may appear
    mesh.drain().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut completions = 0;
    while let Ok(event) = events.try_recv() {
        if let meshwork_engine::QuorumMessage::Job { jid: done, .. } = event {
            if done == jid {
                completions += 1;
            }
        }
    }
    assert_eq!(completions, 1);
}
