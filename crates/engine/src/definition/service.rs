//! Definition lifecycle: create, save, status transitions

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    check_registrations, validate, DefinitionStatus, Edge, Node, TriggerSpec, Violation,
    WorkflowDefinition,
};
use crate::behavior::BehaviorRegistry;
use crate::persistence::{DefinitionFilter, StoreError, WorkflowStore};
use crate::timer::{TimerError, TimerService};

/// Errors from definition lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition not found: {0}")]
    NotFound(Uuid),

    #[error("cannot move definition from {from} to {to}")]
    InvalidTransition {
        from: DefinitionStatus,
        to: DefinitionStatus,
    },

    #[error("definition is {status}; only draft or ready definitions can be edited")]
    NotEditable { status: DefinitionStatus },

    #[error("definition is invalid ({} violation(s))", .0.len())]
    Invalid(Vec<Violation>),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for DefinitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DefinitionNotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Fields for a new, empty draft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDefinition {
    pub org_id: String,
    pub name: String,
}

/// The editable part of a definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

/// Definition lifecycle operations
#[derive(Clone)]
pub struct DefinitionService {
    store: Arc<dyn WorkflowStore>,
    behaviors: Arc<BehaviorRegistry>,
    timers: TimerService,
}

impl DefinitionService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        behaviors: Arc<BehaviorRegistry>,
        timers: TimerService,
    ) -> Self {
        Self {
            store,
            behaviors,
            timers,
        }
    }

    #[instrument(skip(self, new), fields(org_id = %new.org_id))]
    pub async fn create(&self, new: NewDefinition) -> Result<WorkflowDefinition, DefinitionError> {
        let now = self.timers.now();
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            org_id: new.org_id,
            name: new.name,
            version: 1,
            status: DefinitionStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            triggers: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_definition(&def).await?;
        info!(definition_id = %def.id, "created definition");
        Ok(def)
    }

    /// Replace the graph of a draft or ready definition
    ///
    /// Rejects unknown behaviors and malformed node configs. The structural
    /// validator does not run here, so half-built drafts can be saved.
    #[instrument(skip(self, graph))]
    pub async fn save(
        &self,
        id: Uuid,
        graph: DefinitionGraph,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let mut def = self.store.get_definition(id).await?;
        if !def.status.is_editable() {
            return Err(DefinitionError::NotEditable { status: def.status });
        }

        def.nodes = graph.nodes;
        def.edges = graph.edges;
        def.triggers = graph.triggers;

        let violations = check_registrations(&def, &self.behaviors);
        if !violations.is_empty() {
            return Err(DefinitionError::Invalid(violations));
        }

        def.version += 1;
        def.status = DefinitionStatus::Draft;
        def.updated_at = self.timers.now();
        self.store.update_definition(&def).await?;
        Ok(def)
    }

    /// Move a definition to `status`
    ///
    /// `ready` and `active` require a clean validation report. Entering
    /// `active` arms schedule triggers; leaving it disarms them.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        id: Uuid,
        status: DefinitionStatus,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let mut def = self.store.get_definition(id).await?;
        let previous = def.status;
        if previous == status {
            return Ok(def);
        }
        if !previous.can_transition_to(status) {
            return Err(DefinitionError::InvalidTransition {
                from: previous,
                to: status,
            });
        }

        if matches!(status, DefinitionStatus::Ready | DefinitionStatus::Active) {
            let violations = self.check(&def);
            if !violations.is_empty() {
                return Err(DefinitionError::Invalid(violations));
            }
        }

        def.status = status;
        def.updated_at = self.timers.now();
        self.store.update_definition(&def).await?;

        if status == DefinitionStatus::Active {
            self.timers.register_schedules(&def).await?;
        } else if previous == DefinitionStatus::Active {
            self.timers.clear_schedules(def.id).await?;
        }

        info!(definition_id = %id, from = %previous, to = %status, "definition status changed");
        Ok(def)
    }

    /// Structural validation plus behavior registration
    pub fn check(&self, def: &WorkflowDefinition) -> Vec<Violation> {
        let mut violations = validate(def).violations;
        violations.extend(check_registrations(def, &self.behaviors));
        violations.sort_by_key(|v| v.to_string());
        violations.dedup();
        violations
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkflowDefinition, DefinitionError> {
        Ok(self.store.get_definition(id).await?)
    }

    pub async fn list(&self, org_id: Option<&str>) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        let filter = DefinitionFilter {
            org_id: org_id.map(String::from),
            status: None,
        };
        Ok(self.store.list_definitions(&filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Edge;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::timer::SystemClock;
    use serde_json::json;

    fn service() -> (DefinitionService, Arc<InMemoryWorkflowStore>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let mut behaviors = BehaviorRegistry::new();
        behaviors.register_fn("send_email", |_ctx| async { Ok(json!({})) });
        let timers = TimerService::new(store.clone(), Arc::new(SystemClock));
        (
            DefinitionService::new(store.clone(), Arc::new(behaviors), timers),
            store,
        )
    }

    fn valid_graph() -> DefinitionGraph {
        DefinitionGraph {
            nodes: vec![
                Node::trigger_event("signup"),
                Node::action("welcome", "send_email", json!({})).terminal(),
            ],
            edges: vec![Edge::simple("e1", "signup", "welcome")],
            triggers: vec![TriggerSpec::event("signup", "user_signed_up")],
        }
    }

    async fn draft(svc: &DefinitionService) -> WorkflowDefinition {
        svc.create(NewDefinition {
            org_id: "org-1".into(),
            name: "welcome".into(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_bumps_version_and_returns_to_draft() {
        let (svc, _) = service();
        let def = draft(&svc).await;
        svc.save(def.id, valid_graph()).await.unwrap();
        svc.set_status(def.id, DefinitionStatus::Ready).await.unwrap();

        let saved = svc.save(def.id, valid_graph()).await.unwrap();
        assert_eq!(saved.version, 3);
        assert_eq!(saved.status, DefinitionStatus::Draft);
    }

    #[tokio::test]
    async fn test_save_rejects_unknown_behavior() {
        let (svc, _) = service();
        let def = draft(&svc).await;
        let mut graph = valid_graph();
        graph.nodes[1] = Node::action("welcome", "send_fax", json!({})).terminal();

        let err = svc.save(def.id, graph).await.unwrap_err();
        match err {
            DefinitionError::Invalid(violations) => assert!(matches!(
                violations[0],
                Violation::UnknownBehavior { ref behavior, .. } if behavior == "send_fax"
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_save_allows_structurally_incomplete_draft() {
        let (svc, _) = service();
        let def = draft(&svc).await;
        let graph = DefinitionGraph {
            nodes: vec![Node::action("orphan", "send_email", json!({}))],
            ..Default::default()
        };
        svc.save(def.id, graph).await.unwrap();

        let err = svc.set_status(def.id, DefinitionStatus::Active).await.unwrap_err();
        assert!(matches!(err, DefinitionError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_active_definition_is_not_editable() {
        let (svc, _) = service();
        let def = draft(&svc).await;
        svc.save(def.id, valid_graph()).await.unwrap();
        svc.set_status(def.id, DefinitionStatus::Active).await.unwrap();

        let err = svc.save(def.id, valid_graph()).await.unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::NotEditable {
                status: DefinitionStatus::Active
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let (svc, _) = service();
        let def = draft(&svc).await;
        let err = svc.set_status(def.id, DefinitionStatus::Paused).await.unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_schedules_follow_active_status() {
        let (svc, store) = service();
        let def = draft(&svc).await;
        let graph = DefinitionGraph {
            nodes: vec![
                Node::trigger_schedule("nightly"),
                Node::action("digest", "send_email", json!({})).terminal(),
            ],
            edges: vec![Edge::simple("e1", "nightly", "digest")],
            triggers: vec![TriggerSpec::schedule("nightly", "0 3 * * *")],
        };
        svc.save(def.id, graph).await.unwrap();

        svc.set_status(def.id, DefinitionStatus::Active).await.unwrap();
        assert_eq!(store.list_schedules(def.id).await.unwrap().len(), 1);

        svc.set_status(def.id, DefinitionStatus::Paused).await.unwrap();
        assert!(store.list_schedules(def.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_definition() {
        let (svc, _) = service();
        let err = svc.get(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound(_)));
    }
}
