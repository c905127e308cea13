//! Structural validation of workflow graphs
//!
//! Runs before a definition may become ready or active. Every problem is
//! collected so the builder can highlight all of them at once.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Serialize;

use super::{handles, MergeStrategy, NodeKind, TriggerSource, WorkflowDefinition};
use crate::behavior::BehaviorRegistry;
use crate::timer::parse_schedule;

/// A single structural problem in a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Violation {
    #[error("definition has no trigger nodes")]
    NoTriggers,

    #[error("duplicate node id `{node_id}`")]
    DuplicateNodeId { node_id: String },

    #[error("node id `{node_id}` must be non-empty and must not contain '/' or '#'")]
    InvalidNodeId { node_id: String },

    #[error("duplicate edge id `{edge_id}`")]
    DuplicateEdgeId { edge_id: String },

    #[error("edge `{edge_id}` references unknown node `{node_id}`")]
    UnknownNode { edge_id: String, node_id: String },

    #[error("edge `{edge_id}` leaves `{node_id}` through `{handle}`, which a {kind} node does not have")]
    UnknownSourceHandle {
        edge_id: String,
        node_id: String,
        handle: String,
        kind: String,
    },

    #[error("edge `{edge_id}` enters `{node_id}` through `{handle}`, which a {kind} node does not accept")]
    UnknownTargetHandle {
        edge_id: String,
        node_id: String,
        handle: String,
        kind: String,
    },

    #[error("trigger node `{node_id}` has an incoming edge")]
    TriggerHasIncomingEdge { node_id: String },

    #[error("trigger node `{node_id}` has no trigger spec")]
    MissingTriggerSpec { node_id: String },

    #[error("trigger spec for `{node_id}` does not match a trigger node of the same type")]
    TriggerSpecMismatch { node_id: String },

    #[error("node `{node_id}` has no incoming edge")]
    MissingIncomingEdge { node_id: String },

    #[error("node `{node_id}` is not reachable from any trigger")]
    Unreachable { node_id: String },

    #[error("node `{node_id}` has no outgoing edges and is not marked terminal")]
    DanglingNode { node_id: String },

    #[error("merge `{node_id}` input `{handle}` has no incoming edge")]
    MergeInputUnconnected { node_id: String, handle: String },

    #[error("wait-all merge `{node_id}` joins edges from inside and outside the items of loop `{loop_node}`")]
    MergeAcrossLoopScope { node_id: String, loop_node: String },

    #[error("cycle through nodes {nodes:?}")]
    Cycle { nodes: Vec<String> },

    #[error("node `{node_id}` has invalid config: {reason}")]
    InvalidConfig { node_id: String, reason: String },

    #[error("node `{node_id}` uses unregistered behavior `{behavior}`")]
    UnknownBehavior { node_id: String, behavior: String },
}

/// Outcome of validating a definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<(), Vec<Violation>> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(self.violations)
        }
    }
}

/// Validate graph structure and node configuration
pub fn validate(def: &WorkflowDefinition) -> ValidationReport {
    let mut violations = check_configs(def);

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indexes: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &def.nodes {
        if node.id.is_empty() || node.id.contains('/') || node.id.contains('#') {
            violations.push(Violation::InvalidNodeId {
                node_id: node.id.clone(),
            });
        }
        if indexes.contains_key(node.id.as_str()) {
            violations.push(Violation::DuplicateNodeId {
                node_id: node.id.clone(),
            });
            continue;
        }
        indexes.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    let mut edge_ids = HashSet::new();
    let mut has_incoming: HashSet<&str> = HashSet::new();
    let mut has_outgoing: HashSet<&str> = HashSet::new();
    let mut connected: HashSet<(&str, &str)> = HashSet::new();

    for edge in &def.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            violations.push(Violation::DuplicateEdgeId {
                edge_id: edge.id.clone(),
            });
        }

        let source = def.node(&edge.source_node_id);
        let target = def.node(&edge.target_node_id);

        for (node_id, node) in [
            (&edge.source_node_id, source),
            (&edge.target_node_id, target),
        ] {
            if node.is_none() {
                violations.push(Violation::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: node_id.clone(),
                });
            }
        }

        let (Some(source), Some(target)) = (source, target) else {
            continue;
        };

        if !source
            .kind
            .output_handles()
            .contains(&edge.source_handle.as_str())
        {
            violations.push(Violation::UnknownSourceHandle {
                edge_id: edge.id.clone(),
                node_id: source.id.clone(),
                handle: edge.source_handle.clone(),
                kind: source.kind.name().to_string(),
            });
        }

        if target.kind.is_trigger() {
            violations.push(Violation::TriggerHasIncomingEdge {
                node_id: target.id.clone(),
            });
        } else if !target
            .kind
            .input_handles()
            .contains(&edge.target_handle.as_str())
        {
            violations.push(Violation::UnknownTargetHandle {
                edge_id: edge.id.clone(),
                node_id: target.id.clone(),
                handle: edge.target_handle.clone(),
                kind: target.kind.name().to_string(),
            });
        }

        has_outgoing.insert(source.id.as_str());
        has_incoming.insert(target.id.as_str());
        connected.insert((target.id.as_str(), edge.target_handle.as_str()));
        if let (Some(&from), Some(&to)) = (
            indexes.get(source.id.as_str()),
            indexes.get(target.id.as_str()),
        ) {
            graph.add_edge(from, to, ());
        }
    }

    violations.extend(check_triggers(def));

    for node in &def.nodes {
        if !node.kind.is_trigger() && !has_incoming.contains(node.id.as_str()) {
            violations.push(Violation::MissingIncomingEdge {
                node_id: node.id.clone(),
            });
        }
        if !node.terminal && !has_outgoing.contains(node.id.as_str()) {
            violations.push(Violation::DanglingNode {
                node_id: node.id.clone(),
            });
        }
        if let NodeKind::Merge(config) = &node.kind {
            for handle in &config.inputs {
                if !connected.contains(&(node.id.as_str(), handle.as_str())) {
                    violations.push(Violation::MergeInputUnconnected {
                        node_id: node.id.clone(),
                        handle: handle.clone(),
                    });
                }
            }
        }
    }

    violations.extend(check_merge_scopes(def));

    // nodes fed only by a cycle never run, so report them separately
    let mut reachable = HashSet::new();
    for node in def.nodes.iter().filter(|n| n.kind.is_trigger()) {
        let Some(&start) = indexes.get(node.id.as_str()) else {
            continue;
        };
        let mut dfs = Dfs::new(&graph, start);
        while let Some(idx) = dfs.next(&graph) {
            reachable.insert(idx);
        }
    }
    for (id, idx) in &indexes {
        if !reachable.contains(idx) && has_incoming.contains(id) {
            violations.push(Violation::Unreachable {
                node_id: id.to_string(),
            });
        }
    }

    for component in tarjan_scc(&graph) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&idx| graph.contains_edge(idx, idx));
        if is_cycle {
            let mut nodes: Vec<String> = component.iter().map(|&idx| graph[idx].to_string()).collect();
            nodes.sort();
            violations.push(Violation::Cycle { nodes });
        }
    }

    if !def.nodes.iter().any(|n| n.kind.is_trigger()) {
        violations.push(Violation::NoTriggers);
    }

    violations.sort_by_key(|v| v.to_string());
    violations.dedup();
    ValidationReport { violations }
}

/// Node configuration checks that do not depend on graph shape
fn check_configs(def: &WorkflowDefinition) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut invalid = |node_id: &str, reason: String| {
        violations.push(Violation::InvalidConfig {
            node_id: node_id.to_string(),
            reason,
        })
    };

    for node in &def.nodes {
        match &node.kind {
            NodeKind::Action(config) => {
                if config.behavior.trim().is_empty() {
                    invalid(&node.id, "behavior name is empty".into());
                }
                if config.timeout_ms == Some(0) {
                    invalid(&node.id, "timeout_ms must be positive".into());
                }
                if let Some(retry) = &config.retry {
                    if retry.max_attempts == 0 {
                        invalid(&node.id, "retry.max_attempts must be at least 1".into());
                    }
                }
            }
            NodeKind::SplitAb(config) if config.split_percentage > 100 => {
                invalid(
                    &node.id,
                    format!("split_percentage {} exceeds 100", config.split_percentage),
                );
            }
            NodeKind::Merge(config) => {
                if config.inputs.is_empty() {
                    invalid(&node.id, "merge needs at least one input handle".into());
                }
                let unique: HashSet<&String> = config.inputs.iter().collect();
                if unique.len() != config.inputs.len() {
                    invalid(&node.id, "merge input handles must be unique".into());
                }
            }
            NodeKind::LoopIterator(config) => {
                if config.max_iterations == 0 {
                    invalid(&node.id, "max_iterations must be at least 1".into());
                }
                if config.array_path.trim().is_empty() {
                    invalid(&node.id, "array_path is empty".into());
                }
            }
            _ => {}
        }
    }
    violations
}

/// Arrivals from a loop's item branches and from its parent branch land in
/// different wait sets, so a wait-all merge fed from both never fires
fn check_merge_scopes(def: &WorkflowDefinition) -> Vec<Violation> {
    let mut violations = Vec::new();
    let wait_all: Vec<&str> = def
        .nodes
        .iter()
        .filter(|n| matches!(&n.kind, NodeKind::Merge(c) if c.strategy == MergeStrategy::WaitAll))
        .map(|n| n.id.as_str())
        .collect();
    if wait_all.is_empty() {
        return violations;
    }

    for loop_node in def
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::LoopIterator(_)))
    {
        let scope = item_scope(def, &loop_node.id);
        for merge in &wait_all {
            let (mut inside, mut outside) = (false, false);
            for edge in def.edges.iter().filter(|e| e.target_node_id == *merge) {
                let from_item = scope.contains(edge.source_node_id.as_str())
                    || (edge.source_node_id == loop_node.id
                        && edge.source_handle == handles::EACH_ITEM);
                if from_item {
                    inside = true;
                } else {
                    outside = true;
                }
            }
            if inside && outside {
                violations.push(Violation::MergeAcrossLoopScope {
                    node_id: merge.to_string(),
                    loop_node: loop_node.id.clone(),
                });
            }
        }
    }
    violations
}

/// Nodes that run inside the item branches of `loop_node`
fn item_scope<'a>(def: &'a WorkflowDefinition, loop_node: &str) -> HashSet<&'a str> {
    let mut scope = HashSet::new();
    let mut stack: Vec<&str> = def
        .edges
        .iter()
        .filter(|e| e.source_node_id == loop_node && e.source_handle == handles::EACH_ITEM)
        .map(|e| e.target_node_id.as_str())
        .collect();
    while let Some(id) = stack.pop() {
        if !scope.insert(id) {
            continue;
        }
        stack.extend(
            def.edges
                .iter()
                .filter(|e| e.source_node_id == id)
                .map(|e| e.target_node_id.as_str()),
        );
    }
    scope
}

fn check_triggers(def: &WorkflowDefinition) -> Vec<Violation> {
    let mut violations = Vec::new();

    for node in def.nodes.iter().filter(|n| n.kind.is_trigger()) {
        if def.trigger(&node.id).is_none() {
            violations.push(Violation::MissingTriggerSpec {
                node_id: node.id.clone(),
            });
        }
    }

    for spec in &def.triggers {
        let kind_matches = match (def.node(&spec.node_id).map(|n| &n.kind), &spec.source) {
            (Some(NodeKind::TriggerEvent), TriggerSource::Event { .. }) => true,
            (Some(NodeKind::TriggerSchedule), TriggerSource::Schedule { cron }) => {
                if let Err(e) = parse_schedule(cron) {
                    violations.push(Violation::InvalidConfig {
                        node_id: spec.node_id.clone(),
                        reason: e.to_string(),
                    });
                }
                true
            }
            _ => false,
        };
        if !kind_matches {
            violations.push(Violation::TriggerSpecMismatch {
                node_id: spec.node_id.clone(),
            });
        }
    }
    violations
}

/// Save-time checks: configs must parse sensibly and every action must
/// name a registered behavior. Graph shape is not checked here.
pub fn check_registrations(def: &WorkflowDefinition, behaviors: &BehaviorRegistry) -> Vec<Violation> {
    let mut violations = check_configs(def);
    for (node_id, behavior) in def.behaviors() {
        if !behaviors.contains(behavior) {
            violations.push(Violation::UnknownBehavior {
                node_id: node_id.to_string(),
                behavior: behavior.to_string(),
            });
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Condition, DefinitionStatus, Edge, Node, TriggerSpec};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn definition(nodes: Vec<Node>, edges: Vec<Edge>, triggers: Vec<TriggerSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            org_id: "org".into(),
            name: "test".into(),
            version: 1,
            status: DefinitionStatus::Draft,
            nodes,
            edges,
            triggers,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn linear() -> WorkflowDefinition {
        definition(
            vec![
                Node::trigger_event("start"),
                Node::action("send", "send_email", json!({})).terminal(),
            ],
            vec![Edge::simple("e1", "start", "send")],
            vec![TriggerSpec::event("start", "form.submitted")],
        )
    }

    fn has(report: &ValidationReport, pred: impl Fn(&Violation) -> bool) -> bool {
        report.violations.iter().any(pred)
    }

    #[test]
    fn test_valid_linear_graph() {
        let report = validate(&linear());
        assert!(report.is_ok(), "{:?}", report.violations);
    }

    #[test]
    fn test_cycle_detected() {
        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::action("a", "x", json!({})),
                Node::action("b", "x", json!({})),
            ],
            vec![
                Edge::simple("e1", "start", "a"),
                Edge::simple("e2", "a", "b"),
                Edge::simple("e3", "b", "a"),
            ],
            vec![TriggerSpec::event("start", "go")],
        );

        let report = validate(&def);
        assert!(has(&report, |v| matches!(
            v,
            Violation::Cycle { nodes } if nodes == &vec!["a".to_string(), "b".to_string()]
        )));
    }

    #[test]
    fn test_trigger_with_incoming_edge() {
        let mut def = linear();
        def.nodes[1].terminal = false;
        def.edges.push(Edge::simple("back", "send", "start"));

        let report = validate(&def);
        assert!(has(&report, |v| matches!(v, Violation::TriggerHasIncomingEdge { node_id } if node_id == "start")));
    }

    #[test]
    fn test_orphan_and_dangling_nodes() {
        let mut def = linear();
        def.nodes.push(Node::action("orphan", "x", json!({})));

        let report = validate(&def);
        assert!(has(&report, |v| matches!(v, Violation::MissingIncomingEdge { node_id } if node_id == "orphan")));
        assert!(has(&report, |v| matches!(v, Violation::DanglingNode { node_id } if node_id == "orphan")));
    }

    #[test]
    fn test_unknown_handles() {
        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::if_then("check", Condition::exists("trigger.email")),
                Node::action("send", "x", json!({})).terminal(),
            ],
            vec![
                Edge::simple("e1", "start", "check"),
                Edge::new("e2", ("check", "maybe"), ("send", "in")),
            ],
            vec![TriggerSpec::event("start", "go")],
        );

        let report = validate(&def);
        assert!(has(&report, |v| matches!(v, Violation::UnknownSourceHandle { handle, .. } if handle == "maybe")));
    }

    #[test]
    fn test_merge_handles_accepted() {
        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::split_ab("split", 50),
                Node::merge("join", MergeStrategy::WaitAll).terminal(),
            ],
            vec![
                Edge::simple("e1", "start", "split"),
                Edge::new("e2", ("split", "a"), ("join", "a")),
                Edge::new("e3", ("split", "b"), ("join", "b")),
            ],
            vec![TriggerSpec::event("start", "go")],
        );

        assert!(validate(&def).is_ok());

        let mut bad = def.clone();
        bad.edges[2].target_handle = "in".into();
        assert!(has(&validate(&bad), |v| matches!(v, Violation::UnknownTargetHandle { handle, .. } if handle == "in")));
    }

    #[test]
    fn test_unconnected_merge_input() {
        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::action("left", "x", json!({})),
                Node::merge("join", MergeStrategy::WaitAll).terminal(),
            ],
            vec![
                Edge::simple("e1", "start", "left"),
                Edge::new("e2", ("left", "out"), ("join", "a")),
            ],
            vec![TriggerSpec::event("start", "go")],
        );

        let report = validate(&def);
        assert_eq!(
            report.violations,
            vec![Violation::MergeInputUnconnected {
                node_id: "join".into(),
                handle: "b".into()
            }]
        );
    }

    /// start -> each(loop) -> item -> join.a, start -> join.b
    fn loop_fed_merge(strategy: MergeStrategy) -> WorkflowDefinition {
        definition(
            vec![
                Node::trigger_event("start"),
                Node::loop_iterator("each", "start.items", 10),
                Node::action("item", "x", json!({})),
                Node::action("done", "x", json!({})).terminal(),
                Node::merge("join", strategy).terminal(),
            ],
            vec![
                Edge::simple("e1", "start", "each"),
                Edge::new("e2", ("each", "each_item"), ("item", "in")),
                Edge::new("e3", ("each", "completed"), ("done", "in")),
                Edge::new("e4", ("item", "out"), ("join", "a")),
                Edge::new("e5", ("start", "out"), ("join", "b")),
            ],
            vec![TriggerSpec::event("start", "go")],
        )
    }

    #[test]
    fn test_wait_all_merge_across_loop_scope() {
        let report = validate(&loop_fed_merge(MergeStrategy::WaitAll));
        assert_eq!(
            report.violations,
            vec![Violation::MergeAcrossLoopScope {
                node_id: "join".into(),
                loop_node: "each".into()
            }]
        );

        // first-arrival merges fire per branch and are allowed
        assert!(validate(&loop_fed_merge(MergeStrategy::First)).is_ok());
    }

    #[test]
    fn test_wait_all_merge_within_item_scope() {
        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::loop_iterator("each", "start.items", 10).terminal(),
                Node::action("left", "x", json!({})),
                Node::action("right", "x", json!({})),
                Node::merge("join", MergeStrategy::WaitAll).terminal(),
            ],
            vec![
                Edge::simple("e1", "start", "each"),
                Edge::new("e2", ("each", "each_item"), ("left", "in")),
                Edge::new("e3", ("each", "each_item"), ("right", "in")),
                Edge::new("e4", ("left", "out"), ("join", "a")),
                Edge::new("e5", ("right", "out"), ("join", "b")),
            ],
            vec![TriggerSpec::event("start", "go")],
        );
        let report = validate(&def);
        assert!(report.is_ok(), "{:?}", report.violations);
    }

    #[test]
    fn test_invalid_configs() {
        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::split_ab("split", 150).terminal(),
                Node::loop_iterator("bad/id", "items", 0).terminal(),
            ],
            vec![
                Edge::simple("e1", "start", "split"),
                Edge::simple("e2", "start", "bad/id"),
            ],
            vec![TriggerSpec::event("start", "go")],
        );

        let report = validate(&def);
        assert!(has(&report, |v| matches!(v, Violation::InvalidConfig { node_id, .. } if node_id == "split")));
        assert!(has(&report, |v| matches!(v, Violation::InvalidConfig { node_id, .. } if node_id == "bad/id")));
        assert!(has(&report, |v| matches!(v, Violation::InvalidNodeId { .. })));
    }

    #[test]
    fn test_trigger_spec_checks() {
        let def = definition(
            vec![
                Node::trigger_event("start").terminal(),
                Node::trigger_schedule("nightly").terminal(),
            ],
            vec![],
            vec![
                TriggerSpec::event("start", "go"),
                TriggerSpec::event("nightly", "go"),
            ],
        );

        let report = validate(&def);
        assert!(has(&report, |v| matches!(v, Violation::TriggerSpecMismatch { node_id } if node_id == "nightly")));
        assert!(!has(&report, |v| matches!(v, Violation::TriggerSpecMismatch { node_id } if node_id == "start")));
    }

    #[test]
    fn test_trigger_without_spec() {
        let def = definition(vec![Node::trigger_event("start").terminal()], vec![], vec![]);
        assert!(has(&validate(&def), |v| matches!(v, Violation::MissingTriggerSpec { node_id } if node_id == "start")));
    }

    #[test]
    fn test_bad_cron_reported() {
        let def = definition(
            vec![Node::trigger_schedule("nightly").terminal()],
            vec![],
            vec![TriggerSpec::schedule("nightly", "not a cron")],
        );
        assert!(has(&validate(&def), |v| matches!(v, Violation::InvalidConfig { node_id, .. } if node_id == "nightly")));
    }

    #[test]
    fn test_no_triggers() {
        let def = definition(vec![], vec![], vec![]);
        assert!(has(&validate(&def), |v| matches!(v, Violation::NoTriggers)));
    }

    #[test]
    fn test_check_registrations() {
        let mut registry = BehaviorRegistry::new();
        registry.register_fn("log", |_ctx| async { Ok(json!({})) });

        let def = definition(
            vec![
                Node::trigger_event("start"),
                Node::action("a", "log", json!({})),
                Node::action("b", "missing", json!({})),
            ],
            vec![],
            vec![],
        );

        let violations = check_registrations(&def, &registry);
        assert_eq!(
            violations,
            vec![Violation::UnknownBehavior {
                node_id: "b".into(),
                behavior: "missing".into()
            }]
        );
    }
}
