//! The built-in "durable" meta-graph
//!
//! Workflow executions are themselves jobs on a hard-coded app: the execute
//! graph runs registered workflow functions (the worker's reply codes drive
//! sleep/wait/child/proxy re-entry), and the activity graph runs proxied
//! activity calls with their own retry budget. Subflow spawns address these
//! graphs by the entry topics below.

use serde_json::json;
use std::collections::BTreeMap;

use meshwork_core::manifest::{ActivityDef, ActivityKind, AppManifest, Graph, JobSection};
use meshwork_core::{MapRules, RetryPolicy, Transition};

/// Entry topic for workflow executions.
pub const EXECUTE_TOPIC: &str = "durable.execute";

/// Completion topic for workflow executions.
pub const EXECUTED_TOPIC: &str = "durable.executed";

/// Entry topic for proxied-activity executions.
pub const ACTIVITY_EXECUTE_TOPIC: &str = "durable.activity.execute";

/// Completion topic for proxied-activity executions.
pub const ACTIVITY_EXECUTED_TOPIC: &str = "durable.activity.executed";

/// Stream topic a task queue's workflow worker consumes for `name`.
pub fn workflow_topic(task_queue: &str, name: &str) -> String {
    format!("{task_queue}.{name}")
}

/// Stream topic a task queue's activity worker consumes.
pub fn activity_topic(task_queue: &str) -> String {
    format!("{task_queue}.activity")
}

/// Build the durable app manifest for `app_id`.
///
/// This is the elaborate variant: full collation support, per-activity
/// retry, and origin-job propagation (the engine threads `oj` through every
/// spawned subflow).
pub fn durable_manifest(app_id: &str) -> AppManifest {
    AppManifest {
        id: app_id.to_string(),
        version: "1".to_string(),
        graphs: vec![execute_graph(), activity_graph()],
    }
}

fn execute_graph() -> Graph {
    let mut activities = BTreeMap::new();
    let mut trigger_maps = MapRules::new();
    trigger_maps.insert("$retry".to_string(), json!("{t1.output.data.$retry}"));
    activities.insert(
        "t1".to_string(),
        ActivityDef::of_kind(ActivityKind::Trigger).with_job_maps(trigger_maps),
    );

    let mut input = MapRules::new();
    input.insert("topic".to_string(), json!("{t1.output.data.topic}"));
    input.insert("args".to_string(), json!("{t1.output.data.args}"));

    let mut maps = MapRules::new();
    maps.insert("done".to_string(), json!(true));
    maps.insert("response".to_string(), json!("{w1.output.data.response}"));

    activities.insert(
        "w1".to_string(),
        ActivityDef {
            topic: Some("{t1.output.data.topic}".to_string()),
            input: Some(input),
            job: Some(JobSection { maps }),
            retry: Some(RetryPolicy::default()),
            ..ActivityDef::of_kind(ActivityKind::Worker)
        },
    );

    let mut transitions = BTreeMap::new();
    transitions.insert("t1".to_string(), vec![Transition::unconditional("w1")]);

    Graph {
        subscribes: EXECUTE_TOPIC.to_string(),
        publishes: Some(EXECUTED_TOPIC.to_string()),
        expire: Some(120),
        input: None,
        output: None,
        activities,
        transitions,
        hooks: BTreeMap::new(),
    }
}

fn activity_graph() -> Graph {
    let mut activities = BTreeMap::new();
    let mut trigger_maps = MapRules::new();
    trigger_maps.insert("$retry".to_string(), json!("{t2.output.data.$retry}"));
    activities.insert(
        "t2".to_string(),
        ActivityDef::of_kind(ActivityKind::Trigger).with_job_maps(trigger_maps),
    );

    let mut input = MapRules::new();
    input.insert("topic".to_string(), json!("{t2.output.data.topic}"));
    input.insert("activity".to_string(), json!("{t2.output.data.activity}"));
    input.insert("args".to_string(), json!("{t2.output.data.args}"));

    let mut maps = MapRules::new();
    maps.insert("done".to_string(), json!(true));
    maps.insert("response".to_string(), json!("{w2.output.data.response}"));

    activities.insert(
        "w2".to_string(),
        ActivityDef {
            topic: Some("{t2.output.data.topic}".to_string()),
            input: Some(input),
            job: Some(JobSection { maps }),
            retry: Some(RetryPolicy::default()),
            ..ActivityDef::of_kind(ActivityKind::Worker)
        },
    );

    let mut transitions = BTreeMap::new();
    transitions.insert("t2".to_string(), vec![Transition::unconditional("w2")]);

    Graph {
        subscribes: ACTIVITY_EXECUTE_TOPIC.to_string(),
        publishes: Some(ACTIVITY_EXECUTED_TOPIC.to_string()),
        expire: Some(120),
        input: None,
        output: None,
        activities,
        transitions,
        hooks: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_shape() {
        let manifest = durable_manifest("durable");
        assert_eq!(manifest.graphs.len(), 2);

        let execute = manifest.graph_by_subscribes(EXECUTE_TOPIC).unwrap();
        assert_eq!(execute.publishes.as_deref(), Some(EXECUTED_TOPIC));
        let (tid, _) = execute.trigger().unwrap();
        assert_eq!(tid, "t1");
        assert_eq!(execute.transitions_from("t1")[0].to, "w1");

        let worker = execute.activity("w1").unwrap();
        assert_eq!(worker.kind, ActivityKind::Worker);
        // the worker topic resolves per job from the trigger payload
        assert!(worker.topic.as_deref().unwrap().contains('{'));
        assert!(worker.retry.is_some());
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(workflow_topic("orders", "greet"), "orders.greet");
        assert_eq!(activity_topic("orders"), "orders.activity");
    }

    #[test]
    fn test_activity_graph_maps_response() {
        let manifest = durable_manifest("durable");
        let graph = manifest.graph_by_subscribes(ACTIVITY_EXECUTE_TOPIC).unwrap();
        let worker = graph.activity("w2").unwrap();
        let maps = &worker.job.as_ref().unwrap().maps;
        assert_eq!(maps.get("response").unwrap(), &json!("{w2.output.data.response}"));
    }
}
