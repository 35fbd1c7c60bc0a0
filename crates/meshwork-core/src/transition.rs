//! Transition match evaluation
//!
//! Given a source activity's emitted status code and the job document, select
//! the downstream activities to enter. All matching entries are taken in
//! declared order (fan-out); empty conditions always match.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapper::{resolve_expr, MapError};

/// How `match` pairs combine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    #[default]
    And,
    Or,
}

/// One `{expected, actual}` comparison; both sides are mapping expressions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchPair {
    pub expected: Value,
    pub actual: Value,
}

/// Status-code gate: a single code or an accepted set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CodeGate {
    One(u32),
    Any(Vec<u32>),
}

impl CodeGate {
    fn accepts(&self, code: u32) -> bool {
        match self {
            Self::One(c) => *c == code,
            Self::Any(cs) => cs.contains(&code),
        }
    }
}

/// Conditions guarding a transition edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransitionConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeGate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,

    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<MatchPair>,
}

/// One edge in the graph's `transitions` (or `hooks`) map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<TransitionConditions>,
}

impl Transition {
    pub fn unconditional(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            conditions: None,
        }
    }

    pub fn on_code(to: impl Into<String>, code: u32) -> Self {
        Self {
            to: to.into(),
            conditions: Some(TransitionConditions {
                code: Some(CodeGate::One(code)),
                ..Default::default()
            }),
        }
    }
}

/// Evaluate a transition list, returning every matching edge in order.
pub fn eval_transitions<'a>(
    transitions: &'a [Transition],
    code: u32,
    doc: &Value,
) -> Result<Vec<&'a Transition>, MapError> {
    let mut selected = Vec::new();
    for transition in transitions {
        if matches_conditions(transition.conditions.as_ref(), code, doc)? {
            selected.push(transition);
        }
    }
    Ok(selected)
}

fn matches_conditions(
    conditions: Option<&TransitionConditions>,
    code: u32,
    doc: &Value,
) -> Result<bool, MapError> {
    let Some(conditions) = conditions else {
        return Ok(true);
    };

    if let Some(gate) = &conditions.code {
        if !gate.accepts(code) {
            return Ok(false);
        }
    }

    if conditions.matches.is_empty() {
        return Ok(true);
    }

    let gate = conditions.gate.unwrap_or_default();
    let mut any = false;
    for pair in &conditions.matches {
        let expected = resolve_expr(&pair.expected, doc)?;
        let actual = resolve_expr(&pair.actual, doc)?;
        let hit = expected == actual;
        match gate {
            Gate::And if !hit => return Ok(false),
            Gate::Or if hit => any = true,
            _ => {}
        }
    }

    Ok(match gate {
        Gate::And => true,
        Gate::Or => any,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({"data": {"kind": "vip", "score": 9}})
    }

    #[test]
    fn test_empty_conditions_always_match() {
        let edges = vec![Transition::unconditional("b1")];
        let hit = eval_transitions(&edges, 200, &doc()).unwrap();
        assert_eq!(hit.len(), 1);
    }

    #[test]
    fn test_code_gate() {
        let edges = vec![
            Transition::on_code("ok", 200),
            Transition::on_code("retry", 599),
        ];
        let hit = eval_transitions(&edges, 599, &doc()).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].to, "retry");
    }

    #[test]
    fn test_code_gate_accepts_set() {
        let edge = Transition {
            to: "fail".into(),
            conditions: Some(TransitionConditions {
                code: Some(CodeGate::Any(vec![596, 597, 598])),
                ..Default::default()
            }),
        };
        assert_eq!(eval_transitions(&[edge.clone()], 597, &doc()).unwrap().len(), 1);
        assert!(eval_transitions(&[edge], 200, &doc()).unwrap().is_empty());
    }

    #[test]
    fn test_and_gate_requires_all_pairs() {
        let edge = Transition {
            to: "vip".into(),
            conditions: Some(TransitionConditions {
                gate: Some(Gate::And),
                matches: vec![
                    MatchPair {
                        expected: json!("vip"),
                        actual: json!("{data.kind}"),
                    },
                    MatchPair {
                        expected: json!(10),
                        actual: json!("{data.score}"),
                    },
                ],
                ..Default::default()
            }),
        };
        assert!(eval_transitions(&[edge], 200, &doc()).unwrap().is_empty());
    }

    #[test]
    fn test_or_gate_needs_one_pair() {
        let edge = Transition {
            to: "vip".into(),
            conditions: Some(TransitionConditions {
                gate: Some(Gate::Or),
                matches: vec![
                    MatchPair {
                        expected: json!("vip"),
                        actual: json!("{data.kind}"),
                    },
                    MatchPair {
                        expected: json!(10),
                        actual: json!("{data.score}"),
                    },
                ],
                ..Default::default()
            }),
        };
        assert_eq!(eval_transitions(&[edge], 200, &doc()).unwrap().len(), 1);
    }

    #[test]
    fn test_fan_out_preserves_order() {
        let edges = vec![
            Transition::unconditional("first"),
            Transition::on_code("never", 599),
            Transition::unconditional("second"),
        ];
        let hit = eval_transitions(&edges, 200, &doc()).unwrap();
        let names: Vec<_> = hit.iter().map(|t| t.to.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
- to: b1
  conditions:
    code: 200
    match:
      - expected: vip
        actual: "{data.kind}"
- to: b2
"#;
        let edges: Vec<Transition> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].to, "b1");
        assert!(edges[1].conditions.is_none());
    }
}
