//! Node kinds and their configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Condition;
use crate::reliability::RetryPolicy;

/// Well-known handle names
pub mod handles {
    pub const IN: &str = "in";
    pub const OUT: &str = "out";
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const A: &str = "a";
    pub const B: &str = "b";
    pub const EACH_ITEM: &str = "each_item";
    pub const COMPLETED: &str = "completed";
}

/// A node in a workflow graph
///
/// Serialized as `{"id": .., "kind": "action", "config": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    /// Display label from the builder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: NodeKind,

    /// Marks a node whose lack of outgoing edges is intentional
    #[serde(default)]
    pub terminal: bool,
}

/// The kind of a node together with its configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point fired by an external event
    TriggerEvent,
    /// Entry point fired by a cron schedule
    TriggerSchedule,
    /// Invokes a registered behavior
    Action(ActionConfig),
    /// Routes to `true` or `false`
    IfThen(IfThenConfig),
    /// Routes deterministically to `a` or `b` per run
    SplitAb(SplitConfig),
    /// Joins multiple inputs
    Merge(MergeConfig),
    /// Spawns one branch per array item
    LoopIterator(LoopConfig),
    /// Sleeps before continuing
    WaitDelay(DelayConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Registered behavior name
    pub behavior: String,

    /// Parameters, with `{{ path }}` templates resolved against the context
    #[serde(default)]
    pub params: Value,

    /// Credits charged per execution; defaults to the behavior's cost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfThenConfig {
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Percentage of runs routed to `a` (0-100)
    pub split_percentage: u8,
}

/// How a merge node decides to fire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Fire once every input handle has received an arrival
    #[default]
    WaitAll,
    /// Fire on the first arrival and drop the rest
    First,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitAll => "wait_all",
            Self::First => "first",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub strategy: MergeStrategy,

    #[serde(default = "default_merge_inputs")]
    pub inputs: Vec<String>,
}

fn default_merge_inputs() -> Vec<String> {
    vec![handles::A.to_string(), handles::B.to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Dotted path to the array to iterate
    pub array_path: String,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration_ms: u64,
}

impl NodeKind {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::TriggerEvent => "trigger_event",
            Self::TriggerSchedule => "trigger_schedule",
            Self::Action(_) => "action",
            Self::IfThen(_) => "if_then",
            Self::SplitAb(_) => "split_ab",
            Self::Merge(_) => "merge",
            Self::LoopIterator(_) => "loop_iterator",
            Self::WaitDelay(_) => "wait_delay",
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::TriggerEvent | Self::TriggerSchedule)
    }

    /// Handles edges may target
    pub fn input_handles(&self) -> Vec<&str> {
        match self {
            Self::TriggerEvent | Self::TriggerSchedule => vec![],
            Self::Merge(config) => config.inputs.iter().map(String::as_str).collect(),
            _ => vec![handles::IN],
        }
    }

    /// Handles edges may leave from
    pub fn output_handles(&self) -> &'static [&'static str] {
        match self {
            Self::IfThen(_) => &[handles::TRUE, handles::FALSE],
            Self::SplitAb(_) => &[handles::A, handles::B],
            Self::LoopIterator(_) => &[handles::EACH_ITEM, handles::COMPLETED],
            _ => &[handles::OUT],
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            terminal: false,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn trigger_event(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::TriggerEvent)
    }

    pub fn trigger_schedule(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::TriggerSchedule)
    }

    pub fn action(id: impl Into<String>, behavior: impl Into<String>, params: Value) -> Self {
        Self::new(
            id,
            NodeKind::Action(ActionConfig {
                behavior: behavior.into(),
                params,
                cost: None,
                retry: None,
                timeout_ms: None,
            }),
        )
    }

    pub fn if_then(id: impl Into<String>, condition: Condition) -> Self {
        Self::new(id, NodeKind::IfThen(IfThenConfig { condition }))
    }

    pub fn split_ab(id: impl Into<String>, split_percentage: u8) -> Self {
        Self::new(id, NodeKind::SplitAb(SplitConfig { split_percentage }))
    }

    pub fn merge(id: impl Into<String>, strategy: MergeStrategy) -> Self {
        Self::new(
            id,
            NodeKind::Merge(MergeConfig {
                strategy,
                inputs: default_merge_inputs(),
            }),
        )
    }

    pub fn loop_iterator(id: impl Into<String>, array_path: impl Into<String>, max_iterations: u32) -> Self {
        Self::new(
            id,
            NodeKind::LoopIterator(LoopConfig {
                array_path: array_path.into(),
                max_iterations,
            }),
        )
    }

    pub fn wait_delay(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, NodeKind::WaitDelay(DelayConfig { duration_ms }))
    }

    /// Override the action's retry policy; no-op on other kinds
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        if let NodeKind::Action(config) = &mut self.kind {
            config.retry = Some(policy);
        }
        self
    }

    /// Override the action's timeout; no-op on other kinds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let NodeKind::Action(config) = &mut self.kind {
            config.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Override the action's credit cost; no-op on other kinds
    pub fn with_cost(mut self, cost: u64) -> Self {
        if let NodeKind::Action(config) = &mut self.kind {
            config.cost = Some(cost);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_wire_format() {
        let node: Node = serde_json::from_value(json!({
            "id": "send",
            "kind": "action",
            "config": {
                "behavior": "send_email",
                "params": {"to": "{{ trigger.email }}"},
                "timeout_ms": 5000
            }
        }))
        .unwrap();

        assert_eq!(node.id, "send");
        assert!(!node.terminal);
        match &node.kind {
            NodeKind::Action(config) => {
                assert_eq!(config.behavior, "send_email");
                assert_eq!(config.timeout_ms, Some(5000));
                assert!(config.retry.is_none());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_trigger_needs_no_config() {
        let node: Node =
            serde_json::from_value(json!({"id": "start", "kind": "trigger_event"})).unwrap();
        assert_eq!(node.kind, NodeKind::TriggerEvent);
        assert!(node.kind.input_handles().is_empty());
    }

    #[test]
    fn test_merge_defaults() {
        let node: Node = serde_json::from_value(json!({
            "id": "join",
            "kind": "merge",
            "config": {}
        }))
        .unwrap();

        match &node.kind {
            NodeKind::Merge(config) => {
                assert_eq!(config.strategy, MergeStrategy::WaitAll);
                assert_eq!(config.inputs, vec!["a", "b"]);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(node.kind.input_handles(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<Node, _> = serde_json::from_value(json!({
            "id": "x",
            "kind": "teleport",
            "config": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_output_handles() {
        assert_eq!(
            Node::if_then("c", Condition::exists("x")).kind.output_handles(),
            &["true", "false"]
        );
        assert_eq!(Node::split_ab("s", 50).kind.output_handles(), &["a", "b"]);
        assert_eq!(
            Node::loop_iterator("l", "items", 5).kind.output_handles(),
            &["each_item", "completed"]
        );
        assert_eq!(Node::wait_delay("w", 10).kind.output_handles(), &["out"]);
    }

    #[test]
    fn test_serialize_roundtrip_keeps_shape() {
        let node = Node::wait_delay("pause", 60_000).terminal();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "pause",
                "kind": "wait_delay",
                "config": {"duration_ms": 60000},
                "terminal": true
            })
        );
    }
}
