//! Graph descriptor model
//!
//! The parsed form of a deployed app: graphs, activities, transitions, and
//! hook wiring. Parsing from YAML is plain serde — structural schema
//! validation happens upstream of deployment and is not repeated here.
//!
//! Manifests are append-only: a deployed `(app, version)` pair is immutable;
//! activation only moves the active-version pointer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshError;
use crate::mapper::MapRules;
use crate::retry::RetryPolicy;
use crate::transition::Transition;

/// The six activity kinds the interpreter understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// Creates the job HASH and seeds metadata/data from the entry payload.
    Trigger,
    /// Emits work to a worker stream topic; re-enters on the worker's reply.
    Worker,
    /// Awaits a time event (`sleep`) or an external signal (`hook`).
    Hook,
    /// Spawns a child job on another graph's entry topic.
    Await,
    /// Back-edge to a declared ancestor; drives bounded loops and re-entry.
    Cycle,
    /// Emits a hook signal to one job or a keyed set of jobs.
    Signal,
}

/// `signal` activity fan-out mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalSubtype {
    #[default]
    One,
    All,
}

/// Hook-signal binding declared on a `hook` activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookSection {
    /// Signal topic the binding listens on.
    pub topic: String,

    /// Expression producing the match value the inbound signal must resolve
    /// to (evaluated against the job document at registration time).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<Value>,
}

/// `job:` section — maps activity output into the job's `d/*` data fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobSection {
    #[serde(default)]
    pub maps: MapRules,
}

/// `stats:` declaration for secondary-key indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatsDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjacent: Option<String>,
}

/// One activity node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityDef {
    #[serde(rename = "type")]
    pub kind: ActivityKind,

    /// Worker stream topic / await entry topic / signal hook topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Enter-leg input mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<MapRules>,

    /// Output schemas keyed by response code (validated upstream; the code
    /// set gates which reply codes this activity accepts).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_schemas: BTreeMap<u32, Value>,

    /// `job.maps` rules applied on the leave leg.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSection>,

    /// Retry policy for worker replies (599) and spawned subflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Hook kind: timer expression (seconds, or an expression resolving to
    /// seconds). Mutually exclusive with `hook`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<Value>,

    /// Hook kind: signal binding. Mutually exclusive with `sleep`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookSection>,

    /// Await kind: whether the parent waits for the child's completion.
    #[serde(default = "default_true", rename = "await")]
    pub await_result: bool,

    /// Cycle kind: the ancestor activity receiving the back-edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor: Option<String>,

    /// Signal kind: one (single binding) or all (keyed fan-out).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<SignalSubtype>,

    /// Signal-all fan-out key selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsDef>,
}

fn default_true() -> bool {
    true
}

impl ActivityDef {
    /// Minimal definition of the given kind; kind-specific fields default.
    pub fn of_kind(kind: ActivityKind) -> Self {
        Self {
            kind,
            topic: None,
            input: None,
            output_schemas: BTreeMap::new(),
            job: None,
            retry: None,
            sleep: None,
            hook: None,
            await_result: true,
            ancestor: None,
            subtype: None,
            key_name: None,
            key_value: None,
            stats: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_input(mut self, input: MapRules) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_job_maps(mut self, maps: MapRules) -> Self {
        self.job = Some(JobSection { maps });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// One executable graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Graph {
    /// Entry topic this graph subscribes to.
    pub subscribes: String,

    /// Completion topic, published exactly once when the status semaphore
    /// reaches zero (or the job is interrupted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publishes: Option<String>,

    /// Cleanup TTL in seconds after completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    pub activities: BTreeMap<String, ActivityDef>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transitions: BTreeMap<String, Vec<Transition>>,

    /// Signal-topic → re-entry transitions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, Vec<Transition>>,
}

impl Graph {
    /// The single trigger activity of this graph.
    pub fn trigger(&self) -> Result<(&str, &ActivityDef), MeshError> {
        self.activities
            .iter()
            .find(|(_, def)| def.kind == ActivityKind::Trigger)
            .map(|(id, def)| (id.as_str(), def))
            .ok_or_else(|| {
                MeshError::UnknownActivity(format!("{}: no trigger activity", self.subscribes))
            })
    }

    pub fn activity(&self, aid: &str) -> Result<&ActivityDef, MeshError> {
        self.activities
            .get(aid)
            .ok_or_else(|| MeshError::UnknownActivity(aid.to_string()))
    }

    pub fn transitions_from(&self, aid: &str) -> &[Transition] {
        self.transitions.get(aid).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A deployed app version: a set of graphs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppManifest {
    pub id: String,
    pub version: String,
    pub graphs: Vec<Graph>,
}

/// Top-level file wrapper (`app:` root key in the YAML form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub app: AppManifest,
}

impl AppManifest {
    /// Parse a YAML manifest document.
    pub fn from_yaml(source: &str) -> Result<Self, MeshError> {
        let file: ManifestFile = serde_yaml::from_str(source)?;
        Ok(file.app)
    }

    /// Graph whose entry topic is `topic`.
    pub fn graph_by_subscribes(&self, topic: &str) -> Result<&Graph, MeshError> {
        self.graphs
            .iter()
            .find(|g| g.subscribes == topic)
            .ok_or_else(|| MeshError::UnknownTopic(topic.to_string()))
    }

    /// Graphs (with matching transition lists) listening on a hook topic.
    pub fn graphs_by_hook_topic(&self, topic: &str) -> Vec<(&Graph, &[Transition])> {
        self.graphs
            .iter()
            .filter_map(|g| g.hooks.get(topic).map(|t| (g, t.as_slice())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
app:
  id: orders
  version: "1"
  graphs:
    - subscribes: order.created
      publishes: order.completed
      expire: 120
      activities:
        t1:
          type: trigger
        w1:
          type: worker
          topic: order.work
          retry:
            maximumAttempts: 3
            backoffCoefficient: 2
          job:
            maps:
              total: "{w1.output.data.total}"
      transitions:
        t1:
          - to: w1
      hooks:
        order.amended:
          - to: w1
"#;

    #[test]
    fn test_yaml_parse() {
        let manifest = AppManifest::from_yaml(SAMPLE).unwrap();
        assert_eq!(manifest.id, "orders");
        assert_eq!(manifest.graphs.len(), 1);

        let graph = &manifest.graphs[0];
        assert_eq!(graph.subscribes, "order.created");
        assert_eq!(graph.expire, Some(120));

        let (tid, tdef) = graph.trigger().unwrap();
        assert_eq!(tid, "t1");
        assert_eq!(tdef.kind, ActivityKind::Trigger);

        let w1 = graph.activity("w1").unwrap();
        assert_eq!(w1.kind, ActivityKind::Worker);
        assert_eq!(w1.topic.as_deref(), Some("order.work"));
        assert_eq!(w1.retry.as_ref().unwrap().maximum_attempts, 3);
        assert!(w1.job.as_ref().unwrap().maps.contains_key("total"));
    }

    #[test]
    fn test_topic_lookup() {
        let manifest = AppManifest::from_yaml(SAMPLE).unwrap();
        assert!(manifest.graph_by_subscribes("order.created").is_ok());
        assert!(matches!(
            manifest.graph_by_subscribes("nope"),
            Err(MeshError::UnknownTopic(_))
        ));

        let hooked = manifest.graphs_by_hook_topic("order.amended");
        assert_eq!(hooked.len(), 1);
        assert_eq!(hooked[0].1[0].to, "w1");
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let manifest = AppManifest::from_yaml(SAMPLE).unwrap();
        let json = serde_json::to_value(&manifest).unwrap();
        let back: AppManifest = serde_json::from_value(json).unwrap();
        assert_eq!(manifest, back);
    }

    #[test]
    fn test_await_defaults_true() {
        let def: ActivityDef = serde_json::from_value(json!({
            "type": "await", "topic": "child.topic"
        }))
        .unwrap();
        assert!(def.await_result);
        assert_eq!(def.kind, ActivityKind::Await);

        let def: ActivityDef = serde_json::from_value(json!({
            "type": "await", "topic": "child.topic", "await": false
        }))
        .unwrap();
        assert!(!def.await_result);
    }

    #[test]
    fn test_unknown_activity_error() {
        let manifest = AppManifest::from_yaml(SAMPLE).unwrap();
        let graph = &manifest.graphs[0];
        assert!(matches!(
            graph.activity("zz"),
            Err(MeshError::UnknownActivity(_))
        ));
        assert!(graph.transitions_from("zz").is_empty());
    }
}
