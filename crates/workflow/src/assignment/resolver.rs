//! Ordered strategy resolution

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument, warn};

use super::strategies::{AdminPoolStrategy, ManualStrategy, PreviousOwnerStrategy, RoundRobinStrategy};
use super::{
    AssigneeSelectionResult, AssignmentError, AssignmentRequest, AssignmentStrategy,
    StrategyKind, UserDirectory,
};
use crate::persistence::{RoundRobinStore, WorkflowStore};

/// Tries strategies in priority order and returns the first success
///
/// The order comes from the runtime override if it names one, else from
/// the activity definition, else from the resolver's default. An explicit
/// assignee in the runtime override always goes first through the manual
/// strategy.
pub struct AssignmentResolver {
    strategies: HashMap<StrategyKind, Arc<dyn AssignmentStrategy>>,
    default_order: Vec<StrategyKind>,
}

impl AssignmentResolver {
    pub fn new(default_order: Vec<StrategyKind>) -> Self {
        Self {
            strategies: HashMap::new(),
            default_order,
        }
    }

    /// Resolver with all four standard strategies registered
    pub fn standard<Q, H>(
        queue: Arc<Q>,
        history: Arc<H>,
        directory: Arc<dyn UserDirectory>,
        admin_pool: Option<String>,
    ) -> Self
    where
        Q: RoundRobinStore,
        H: WorkflowStore,
    {
        let mut resolver = Self::new(vec![StrategyKind::Manual, StrategyKind::AdminPool]);
        resolver.register(Arc::new(ManualStrategy));
        resolver.register(Arc::new(RoundRobinStrategy::new(queue, directory)));
        resolver.register(Arc::new(PreviousOwnerStrategy::new(history)));
        resolver.register(Arc::new(AdminPoolStrategy::new(admin_pool)));
        resolver
    }

    pub fn with_default_order(mut self, order: Vec<StrategyKind>) -> Self {
        self.default_order = order;
        self
    }

    /// Register (or replace) the implementation of a strategy kind
    pub fn register(&mut self, strategy: Arc<dyn AssignmentStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    fn order_for(&self, request: &AssignmentRequest) -> Vec<StrategyKind> {
        let ov = request.runtime_override.as_ref();
        let mut order = match ov.and_then(|o| o.strategies.clone()) {
            Some(strategies) if !strategies.is_empty() => strategies,
            _ if !request.strategies.is_empty() => request.strategies.clone(),
            _ => self.default_order.clone(),
        };

        if ov.is_some_and(|o| o.has_explicit_assignee()) {
            order.retain(|k| *k != StrategyKind::Manual);
            order.insert(0, StrategyKind::Manual);
        }
        order
    }

    /// Run the strategies in order
    ///
    /// A strategy that errors is skipped so later strategies can still
    /// assign. If every strategy fails and at least one errored, the last
    /// error is returned so the caller can retry.
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, activity = %request.activity_id))]
    pub async fn resolve(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssigneeSelectionResult, AssignmentError> {
        let order = self.order_for(request);
        let mut attempts = Vec::with_capacity(order.len());
        let mut last_error = None;

        for kind in order {
            let Some(strategy) = self.strategies.get(&kind) else {
                warn!(strategy = %kind, "assignment strategy not registered");
                attempts.push(json!({"strategy": kind, "reason": "not registered"}));
                continue;
            };

            match strategy.select_assignee(request).await {
                Ok(result) if result.success => {
                    debug!(strategy = %kind, assignee = ?result.assignee(), "assignee selected");
                    return Ok(result.with_metadata("attempts", attempts));
                }
                Ok(result) => {
                    attempts.push(json!({"strategy": kind, "reason": result.reason}));
                }
                Err(e) => {
                    warn!(strategy = %kind, error = %e, "assignment strategy failed");
                    attempts.push(json!({"strategy": kind, "reason": e.to_string()}));
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        Ok(
            AssigneeSelectionResult::failure(None, "no assignment strategy produced an assignee")
                .with_metadata("attempts", attempts),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{RuntimeOverride, StaticUserDirectory};
    use crate::persistence::InMemoryWorkflowStore;
    use crate::workflow::Variables;
    use serde_json::json;
    use uuid::Uuid;

    fn resolver(store: Arc<InMemoryWorkflowStore>) -> AssignmentResolver {
        let directory = Arc::new(StaticUserDirectory::from_groups([(
            "appraisers",
            vec!["alice", "bob"],
        )]));
        AssignmentResolver::standard(store.clone(), store, directory, Some("admins".into()))
    }

    fn request(properties: serde_json::Value, strategies: Vec<StrategyKind>) -> AssignmentRequest {
        AssignmentRequest {
            instance_id: Uuid::now_v7(),
            activity_id: "review".into(),
            activity_name: "AdminReview".into(),
            properties: properties.as_object().cloned().unwrap_or_else(Variables::new),
            strategies,
            runtime_override: None,
        }
    }

    #[tokio::test]
    async fn test_falls_through_to_first_success() {
        let resolver = resolver(Arc::new(InMemoryWorkflowStore::new()));
        let req = request(
            json!({"candidate_groups": ["appraisers"]}),
            vec![StrategyKind::Manual, StrategyKind::PreviousOwner, StrategyKind::RoundRobin],
        );

        let result = resolver.resolve(&req).await.unwrap();
        assert!(result.success);
        assert_eq!(result.strategy, Some(StrategyKind::RoundRobin));
        assert_eq!(result.assignee_id.as_deref(), Some("alice"));
        assert_eq!(result.metadata["attempts"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_rotates_between_calls() {
        let resolver = resolver(Arc::new(InMemoryWorkflowStore::new()));
        let req = request(json!({"candidate_groups": "appraisers"}), vec![StrategyKind::RoundRobin]);

        let first = resolver.resolve(&req).await.unwrap();
        let second = resolver.resolve(&req).await.unwrap();
        let third = resolver.resolve(&req).await.unwrap();

        assert_eq!(first.assignee_id.as_deref(), Some("alice"));
        assert_eq!(second.assignee_id.as_deref(), Some("bob"));
        assert_eq!(third.assignee_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_admin_pool_is_the_fallback() {
        let resolver = resolver(Arc::new(InMemoryWorkflowStore::new()));
        let req = request(json!({}), vec![StrategyKind::Manual, StrategyKind::AdminPool]);

        let result = resolver.resolve(&req).await.unwrap();
        assert_eq!(result.strategy, Some(StrategyKind::AdminPool));
        assert_eq!(result.assignee_group.as_deref(), Some("admins"));
        assert_eq!(result.assignee(), Some("admins"));
    }

    #[tokio::test]
    async fn test_runtime_override_goes_first() {
        let resolver = resolver(Arc::new(InMemoryWorkflowStore::new()));
        let mut req = request(
            json!({"candidate_groups": ["appraisers"]}),
            vec![StrategyKind::RoundRobin],
        );
        req.runtime_override = Some(RuntimeOverride::assign_to("zoe"));

        let result = resolver.resolve(&req).await.unwrap();
        assert_eq!(result.strategy, Some(StrategyKind::Manual));
        assert_eq!(result.assignee_id.as_deref(), Some("zoe"));
    }

    #[tokio::test]
    async fn test_override_strategy_order_replaces_configured_order() {
        let resolver = resolver(Arc::new(InMemoryWorkflowStore::new()));
        let mut req = request(
            json!({"candidate_groups": ["appraisers"]}),
            vec![StrategyKind::RoundRobin],
        );
        req.runtime_override =
            Some(RuntimeOverride::default().with_strategies(vec![StrategyKind::AdminPool]));

        let result = resolver.resolve(&req).await.unwrap();
        assert_eq!(result.strategy, Some(StrategyKind::AdminPool));
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let resolver = AssignmentResolver::new(vec![StrategyKind::Manual])
            .with_default_order(vec![StrategyKind::Manual, StrategyKind::RoundRobin]);
        let req = request(json!({}), vec![]);

        let result = resolver.resolve(&req).await.unwrap();
        assert!(!result.success);
        assert!(result.assignee().is_none());
        assert_eq!(result.metadata["attempts"].as_array().unwrap().len(), 2);
    }
}
