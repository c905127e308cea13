//! Successor resolution for branches, merges and loops
//!
//! Everything here is pure: it turns a finished node and the handle it
//! fired into [`Route`]s. The store applies routes atomically with the
//! step's outcome, which is where merge wait sets are updated.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::definition::{handles, NodeKind, WorkflowDefinition};
use crate::run::{BranchPath, MergeArrival, NewStep, Route, StepInstance};

/// Bucket in 0..100 for a run, stable across processes and restarts
pub fn split_bucket(run_id: Uuid) -> u8 {
    let digest = Sha256::digest(run_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Handle an A/B split fires for this run: `a` when the bucket falls
/// below the percentage
pub fn split_handle(run_id: Uuid, split_percentage: u8) -> &'static str {
    if split_bucket(run_id) < split_percentage {
        handles::A
    } else {
        handles::B
    }
}

/// Scope overlay handed to a step's successors
///
/// Root-branch outputs live in the run context, so root successors get an
/// empty overlay. Inside a loop item the step's own output is layered on
/// top of its scope.
pub fn successor_scope(step: &StepInstance, output: &Value) -> Map<String, Value> {
    if step.branch.is_root() {
        return Map::new();
    }
    let mut scope = step.scope.clone();
    scope.insert(step.node_id.clone(), output.clone());
    scope
}

/// Routes for every edge leaving `node_id` through `handle`
pub fn routes_for(
    def: &WorkflowDefinition,
    node_id: &str,
    handle: &str,
    branch: &BranchPath,
    scope: &Map<String, Value>,
) -> Vec<Route> {
    def.outgoing(node_id, handle)
        .filter_map(|edge| {
            let target = def.node(&edge.target_node_id)?;
            let step = NewStep::new(target.id.clone(), branch.clone(), scope.clone());
            Some(match &target.kind {
                NodeKind::Merge(config) => Route::Merge(MergeArrival {
                    step,
                    handle: edge.target_handle.clone(),
                    strategy: config.strategy,
                    inputs: config.inputs.clone(),
                }),
                _ => Route::Step(step),
            })
        })
        .collect()
}

/// `each_item` routes for the first `spawn` items of a loop
///
/// Item `i` runs in branch `<branch>/<loop_node>#i` with the loop variable
/// `{ item, index, total }` under the loop node id.
pub fn loop_item_routes(
    def: &WorkflowDefinition,
    loop_node: &str,
    branch: &BranchPath,
    scope: &Map<String, Value>,
    items: &[Value],
    spawn: u32,
) -> Vec<Route> {
    let total = items.len();
    items
        .iter()
        .take(spawn as usize)
        .enumerate()
        .flat_map(|(index, item)| {
            let mut item_scope = scope.clone();
            item_scope.insert(
                loop_node.to_string(),
                json!({ "item": item, "index": index, "total": total }),
            );
            let item_branch = branch.child(loop_node, index as u32);
            routes_for(def, loop_node, handles::EACH_ITEM, &item_branch, &item_scope)
        })
        .collect()
}
