//! Deterministic key construction
//!
//! Every persistent artifact lives under a key minted from the closed
//! [`KeyType`] enumeration. Shapes are stable — peers and operators grep for
//! them — so changes here are wire changes.

use std::fmt;

/// Closed enumeration of mintable key types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// App manifest registry: `{ns}:{app}:app`
    App,
    /// Job HASH: `{ns}:{app}:j:{jid}`
    Job,
    /// Engine transition stream: `{ns}:{app}:s:engine`
    EngineStream,
    /// Worker/topic stream: `{ns}:{app}:s:t:{topic}`
    Stream,
    /// Task-queue registry: `{ns}:{app}:tq`
    TaskQueues,
    /// One time-hook slot list: `{ns}:{app}:tq:{slot}`
    TimeSlot,
    /// Hook-signal index: `{ns}:{app}:sig`
    HookSignal,
    /// Throttle rates: `{ns}:{app}:throttle`
    Throttle,
    /// Quorum broadcast channel: `{ns}:q:{app}`
    Quorum,
    /// Guid-targeted quorum subchannel: `{ns}:q:{app}:{guid}`
    QuorumGuid,
    /// Scout-role lease: `{ns}:{app}:scout:{role}`
    ScoutRole,
    /// Stats index for keyed signal fan-out: `{ns}:{app}:stats:{key}`
    JobStats,
}

/// Parameters feeding key construction; only the fields a [`KeyType`] uses
/// are read.
#[derive(Debug, Clone, Default)]
pub struct KeyParams<'a> {
    pub app_id: &'a str,
    pub job_id: &'a str,
    pub topic: &'a str,
    pub guid: &'a str,
    pub role: &'a str,
    pub key: &'a str,
    pub slot: i64,
}

/// Mint a key. Deterministic over `(namespace, key_type, params)`.
pub fn mint_key(namespace: &str, key_type: KeyType, params: &KeyParams<'_>) -> String {
    match key_type {
        KeyType::App => format!("{namespace}:{}:app", params.app_id),
        KeyType::Job => format!("{namespace}:{}:j:{}", params.app_id, params.job_id),
        KeyType::EngineStream => format!("{namespace}:{}:s:engine", params.app_id),
        KeyType::Stream => format!("{namespace}:{}:s:t:{}", params.app_id, params.topic),
        KeyType::TaskQueues => format!("{namespace}:{}:tq", params.app_id),
        KeyType::TimeSlot => format!("{namespace}:{}:tq:{}", params.app_id, params.slot),
        KeyType::HookSignal => format!("{namespace}:{}:sig", params.app_id),
        KeyType::Throttle => format!("{namespace}:{}:throttle", params.app_id),
        KeyType::Quorum => format!("{namespace}:q:{}", params.app_id),
        KeyType::QuorumGuid => format!("{namespace}:q:{}:{}", params.app_id, params.guid),
        KeyType::ScoutRole => format!("{namespace}:{}:scout:{}", params.app_id, params.role),
        KeyType::JobStats => format!("{namespace}:{}:stats:{}", params.app_id, params.key),
    }
}

/// Convenience minting handle bound to a `(namespace, app)` pair.
#[derive(Debug, Clone)]
pub struct Keys {
    pub namespace: String,
    pub app_id: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
        }
    }

    fn params(&self) -> KeyParams<'_> {
        KeyParams {
            app_id: &self.app_id,
            ..Default::default()
        }
    }

    pub fn app(&self) -> String {
        mint_key(&self.namespace, KeyType::App, &self.params())
    }

    pub fn job(&self, job_id: &str) -> String {
        mint_key(
            &self.namespace,
            KeyType::Job,
            &KeyParams {
                job_id,
                ..self.params()
            },
        )
    }

    pub fn engine_stream(&self) -> String {
        mint_key(&self.namespace, KeyType::EngineStream, &self.params())
    }

    pub fn stream(&self, topic: &str) -> String {
        mint_key(
            &self.namespace,
            KeyType::Stream,
            &KeyParams {
                topic,
                ..self.params()
            },
        )
    }

    pub fn hook_signals(&self) -> String {
        mint_key(&self.namespace, KeyType::HookSignal, &self.params())
    }

    pub fn time_slot(&self, slot: i64) -> String {
        mint_key(
            &self.namespace,
            KeyType::TimeSlot,
            &KeyParams {
                slot,
                ..self.params()
            },
        )
    }

    pub fn quorum(&self) -> String {
        mint_key(&self.namespace, KeyType::Quorum, &self.params())
    }

    pub fn quorum_guid(&self, guid: &str) -> String {
        mint_key(
            &self.namespace,
            KeyType::QuorumGuid,
            &KeyParams {
                guid,
                ..self.params()
            },
        )
    }

    pub fn scout_role(&self, role: &str) -> String {
        mint_key(
            &self.namespace,
            KeyType::ScoutRole,
            &KeyParams {
                role,
                ..self.params()
            },
        )
    }

    pub fn job_stats(&self, key: &str) -> String {
        mint_key(
            &self.namespace,
            KeyType::JobStats,
            &KeyParams {
                key,
                ..self.params()
            },
        )
    }
}

impl fmt::Display for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let keys = Keys::new("mesh", "orders");
        assert_eq!(keys.app(), "mesh:orders:app");
        assert_eq!(keys.job("j1"), "mesh:orders:j:j1");
        assert_eq!(keys.engine_stream(), "mesh:orders:s:engine");
        assert_eq!(keys.stream("order.work"), "mesh:orders:s:t:order.work");
        assert_eq!(keys.time_slot(1_700_000), "mesh:orders:tq:1700000");
        assert_eq!(keys.quorum(), "mesh:q:orders");
        assert_eq!(keys.quorum_guid("g1"), "mesh:q:orders:g1");
        assert_eq!(keys.scout_role("time"), "mesh:orders:scout:time");
        assert_eq!(keys.job_stats("region"), "mesh:orders:stats:region");
    }

    #[test]
    fn test_minting_is_deterministic() {
        let a = mint_key(
            "mesh",
            KeyType::Stream,
            &KeyParams {
                app_id: "x",
                topic: "t",
                ..Default::default()
            },
        );
        let b = mint_key(
            "mesh",
            KeyType::Stream,
            &KeyParams {
                app_id: "x",
                topic: "t",
                ..Default::default()
            },
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_types_never_collide() {
        let keys = Keys::new("mesh", "a");
        let minted = [
            keys.app(),
            keys.job("j"),
            keys.engine_stream(),
            keys.stream("j"),
            keys.quorum(),
            keys.scout_role("j"),
            keys.job_stats("j"),
        ];
        let unique: std::collections::HashSet<_> = minted.iter().collect();
        assert_eq!(unique.len(), minted.len());
    }
}
