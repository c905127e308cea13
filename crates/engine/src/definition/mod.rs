//! Workflow definitions: the typed graph saved by the visual builder

mod condition;
mod node;
mod service;
mod validation;

pub use condition::Condition;
pub use node::{
    handles, ActionConfig, DelayConfig, IfThenConfig, LoopConfig, MergeConfig, MergeStrategy,
    Node, NodeKind, SplitConfig,
};
pub use service::{DefinitionError, DefinitionGraph, DefinitionService, NewDefinition};
pub use validation::{check_registrations, validate, ValidationReport, Violation};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Definition lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Ready,
    Active,
    Paused,
    Error,
    Archived,
}

impl DefinitionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Archived => "archived",
        }
    }

    /// Allowed status transitions
    pub fn can_transition_to(self, next: DefinitionStatus) -> bool {
        use DefinitionStatus::*;
        matches!(
            (self, next),
            (Draft, Ready | Active | Archived)
                | (Ready, Draft | Active | Archived)
                | (Active, Paused | Error | Archived)
                | (Paused, Active | Archived)
                | (Error, Paused | Active | Archived)
        )
    }

    /// Whether the graph may still be edited
    pub fn is_editable(self) -> bool {
        matches!(self, Self::Draft | Self::Ready)
    }
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown definition status: {other}")),
        }
    }
}

/// Directed edge between two node handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    pub target_node_id: String,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
}

fn default_source_handle() -> String {
    handles::OUT.to_string()
}

fn default_target_handle() -> String {
    handles::IN.to_string()
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        source: (impl Into<String>, impl Into<String>),
        target: (impl Into<String>, impl Into<String>),
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.0.into(),
            source_handle: source.1.into(),
            target_node_id: target.0.into(),
            target_handle: target.1.into(),
        }
    }

    /// Edge from `source.out` to `target.in`
    pub fn simple(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, (source, handles::OUT), (target, handles::IN))
    }
}

/// What fires a trigger node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSource {
    /// An external event of the given kind. Every filter entry must equal
    /// the value at its payload path.
    Event {
        event_kind: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        filter: BTreeMap<String, Value>,
    },
    /// A cron expression (5 or 6 fields, UTC)
    Schedule { cron: String },
}

/// Binds a trigger node to its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub node_id: String,
    #[serde(flatten)]
    pub source: TriggerSource,
}

impl TriggerSpec {
    pub fn event(node_id: impl Into<String>, event_kind: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            source: TriggerSource::Event {
                event_kind: event_kind.into(),
                filter: BTreeMap::new(),
            },
        }
    }

    pub fn schedule(node_id: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            source: TriggerSource::Schedule { cron: cron.into() },
        }
    }

    pub fn with_filter(mut self, path: impl Into<String>, value: Value) -> Self {
        if let TriggerSource::Event { filter, .. } = &mut self.source {
            filter.insert(path.into(), value);
        }
        self
    }

    /// Whether an event of `event_kind` with `payload` fires this trigger
    pub fn matches_event(&self, event_kind: &str, payload: &Value) -> bool {
        match &self.source {
            TriggerSource::Event {
                event_kind: kind,
                filter,
            } => {
                kind == event_kind
                    && filter.iter().all(|(path, expected)| {
                        payload
                            .as_object()
                            .and_then(|map| crate::context::resolve_path(map, path))
                            .is_some_and(|actual| actual == expected)
                    })
            }
            TriggerSource::Schedule { .. } => false,
        }
    }
}

/// A saved workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub org_id: String,
    pub name: String,
    /// Incremented on every save
    pub version: u32,
    pub status: DefinitionStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub triggers: Vec<TriggerSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Edges leaving `node_id` through `handle`
    pub fn outgoing<'a>(&'a self, node_id: &'a str, handle: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.source_node_id == node_id && e.source_handle == handle)
    }

    pub fn trigger(&self, node_id: &str) -> Option<&TriggerSpec> {
        self.triggers.iter().find(|t| t.node_id == node_id)
    }

    /// First event trigger matching the event, if any
    pub fn matching_trigger(&self, event_kind: &str, payload: &Value) -> Option<&TriggerSpec> {
        self.triggers
            .iter()
            .find(|t| t.matches_event(event_kind, payload))
    }

    /// Behavior names referenced by action nodes
    pub fn behaviors(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.nodes.iter().filter_map(|n| match &n.kind {
            NodeKind::Action(config) => Some((n.id.as_str(), config.behavior.as_str())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use DefinitionStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Ready.can_transition_to(Draft));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Error.can_transition_to(Active));
        assert!(!Active.can_transition_to(Draft));
        assert!(!Paused.can_transition_to(Draft));
        assert!(!Archived.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Paused));
    }

    #[test]
    fn test_trigger_filter_matching() {
        let trigger = TriggerSpec::event("start", "form.submitted")
            .with_filter("form_id", json!("signup"));

        assert!(trigger.matches_event(
            "form.submitted",
            &json!({"form_id": "signup", "email": "a@b.c"})
        ));
        assert!(!trigger.matches_event("form.submitted", &json!({"form_id": "other"})));
        assert!(!trigger.matches_event("form.submitted", &json!("not an object")));
        assert!(!trigger.matches_event("order.paid", &json!({"form_id": "signup"})));
    }

    #[test]
    fn test_trigger_spec_wire_format() {
        let spec: TriggerSpec = serde_json::from_value(json!({
            "node_id": "nightly",
            "type": "schedule",
            "cron": "0 3 * * *"
        }))
        .unwrap();
        assert_eq!(spec, TriggerSpec::schedule("nightly", "0 3 * * *"));
    }

    #[test]
    fn test_edge_defaults_handles() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1",
            "source_node_id": "a",
            "target_node_id": "b"
        }))
        .unwrap();
        assert_eq!(edge, Edge::simple("e1", "a", "b"));
    }
}
