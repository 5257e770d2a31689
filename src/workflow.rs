//! Workflow graphs: auctions composed into a DAG where later stages consume
//! the results of earlier ones. Validation and ordering live here; the
//! controller does the running.

use crate::errors::WorkflowError;
use crate::mechanisms::config::MechanismConfig;
use crate::types::{AuctionResult, Bid, BidderId, NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A bid the controller will materialize on behalf of a hook, stamped with
/// its own clock and provenance metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticBid {
    pub bidder_id: BidderId,
    pub amount: Decimal,
    pub quantity: u64,
}

/// Function-valued workflow extension points, expressed as a capability
/// object. `transform` shapes the effective config from dependency results,
/// `synthesize_bids` seeds the stage's book, `aggregate` post-processes the
/// stored result.
pub trait WorkflowHooks: Send + Sync {
    fn transform(
        &self,
        config: MechanismConfig,
        _deps: &BTreeMap<NodeId, AuctionResult>,
    ) -> MechanismConfig {
        config
    }

    fn synthesize_bids(&self, _deps: &BTreeMap<NodeId, AuctionResult>) -> Vec<SyntheticBid> {
        Vec::new()
    }

    fn aggregate(
        &self,
        result: AuctionResult,
        _deps: &BTreeMap<NodeId, AuctionResult>,
    ) -> AuctionResult {
        result
    }
}

/// Passes everything through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHooks;

impl WorkflowHooks for IdentityHooks {}

/// Re-bids every upstream winner at `rebid_factor` times the upstream
/// clearing price, carrying their allocation over as quantity.
#[derive(Debug, Clone)]
pub struct PropagateWinnersHooks {
    rebid_factor: Decimal,
}

impl PropagateWinnersHooks {
    pub fn new() -> Self {
        Self::with_factor(Decimal::new(11, 1))
    }

    pub fn with_factor(rebid_factor: Decimal) -> Self {
        Self { rebid_factor }
    }
}

impl Default for PropagateWinnersHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowHooks for PropagateWinnersHooks {
    fn synthesize_bids(&self, deps: &BTreeMap<NodeId, AuctionResult>) -> Vec<SyntheticBid> {
        let mut bids = Vec::new();
        for result in deps.values() {
            for winner in &result.winners {
                let quantity = result
                    .allocations
                    .get(winner)
                    .and_then(|allocation| allocation.ceil().to_u64())
                    .unwrap_or(1)
                    .max(1);

                bids.push(SyntheticBid {
                    bidder_id: *winner,
                    amount: result.clearing_price * self.rebid_factor,
                    quantity,
                });
            }
        }
        bids
    }
}

/// One auction stage of a workflow.
pub struct WorkflowNode {
    pub id: NodeId,
    pub config: MechanismConfig,
    pub dependencies: Vec<NodeId>,
    pub hooks: Arc<dyn WorkflowHooks>,
    pub initial_bids: Vec<Bid>,
    /// How long the stage accepts bids before the controller finalizes it.
    /// `None` finalizes immediately after the initial bids.
    pub duration: Option<Duration>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl WorkflowNode {
    pub fn new(config: MechanismConfig) -> Self {
        Self {
            id: NodeId::new(),
            config,
            dependencies: Vec::new(),
            hooks: Arc::new(IdentityHooks),
            initial_bids: Vec::new(),
            duration: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: NodeId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_initial_bid(mut self, bid: Bid) -> Self {
        self.initial_bids.push(bid);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// A validated DAG of auction stages. Edges run from dependency to
/// dependent and are derived from the nodes' `dependencies` fields.
pub struct WorkflowGraph {
    pub workflow_id: WorkflowId,
    pub nodes: BTreeMap<NodeId, WorkflowNode>,
    pub edges: Vec<(NodeId, NodeId)>,
}

impl WorkflowGraph {
    /// Builds and validates the graph; cyclic or dangling inputs are
    /// rejected before any actor is started.
    pub fn new(nodes: Vec<WorkflowNode>) -> Result<Self, WorkflowError> {
        let mut node_map = BTreeMap::new();
        let mut edges = Vec::new();

        for node in nodes {
            for dependency in &node.dependencies {
                edges.push((*dependency, node.id));
            }
            node_map.insert(node.id, node);
        }

        let graph = Self {
            workflow_id: WorkflowId::new(),
            nodes: node_map,
            edges,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        for (from, to) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(WorkflowError::UnknownNode(*from));
            }
            if !self.nodes.contains_key(to) {
                return Err(WorkflowError::UnknownNode(*to));
            }
        }

        for node in self.nodes.values() {
            for dependency in &node.dependencies {
                if !self.edges.contains(&(*dependency, node.id)) {
                    return Err(WorkflowError::MissingEdge {
                        node: node.id,
                        dependency: *dependency,
                    });
                }
            }
        }

        // Kahn's algorithm doubles as cycle detection: anything it cannot
        // order is on a cycle.
        self.topological_levels().map(|_| ())
    }

    /// Kahn's algorithm, grouped into levels of mutually independent nodes
    /// so the controller can run each level in parallel.
    pub fn topological_levels(&self) -> Result<Vec<Vec<NodeId>>, WorkflowError> {
        let mut indegree: BTreeMap<NodeId, usize> =
            self.nodes.keys().map(|id| (*id, 0)).collect();
        for (_, to) in &self.edges {
            if let Some(count) = indegree.get_mut(to) {
                *count += 1;
            }
        }

        let mut current: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut levels = Vec::new();
        let mut ordered = 0;

        while !current.is_empty() {
            ordered += current.len();
            let mut next = Vec::new();

            for id in &current {
                for (from, to) in &self.edges {
                    if from == id {
                        if let Some(count) = indegree.get_mut(to) {
                            *count -= 1;
                            if *count == 0 {
                                next.push(*to);
                            }
                        }
                    }
                }
            }

            levels.push(std::mem::replace(&mut current, next));
        }

        if ordered < self.nodes.len() {
            return Err(WorkflowError::CyclicGraph);
        }
        Ok(levels)
    }

    /// Flattened execution order; every node exactly once.
    pub fn execution_order(&self) -> Result<Vec<NodeId>, WorkflowError> {
        Ok(self.topological_levels()?.into_iter().flatten().collect())
    }
}

/// Outcome of a whole workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub node_results: BTreeMap<NodeId, AuctionResult>,
    pub execution_order: Vec<NodeId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuctionId;
    use rust_decimal_macros::dec;

    fn node() -> WorkflowNode {
        WorkflowNode::new(MechanismConfig::first_price(dec!(0)))
    }

    #[test]
    fn execution_order_respects_dependencies() {
        let a = node();
        let b = node().with_dependency(a.id);
        let c = node().with_dependency(a.id);
        let d = node().with_dependency(b.id).with_dependency(c.id);
        let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);

        let graph = WorkflowGraph::new(vec![d, c, b, a]).unwrap();
        let order = graph.execution_order().unwrap();

        assert_eq!(order.len(), 4);
        let position = |id: NodeId| order.iter().position(|other| *other == id).unwrap();
        assert!(position(a_id) < position(b_id));
        assert!(position(a_id) < position(c_id));
        assert!(position(b_id) < position(d_id));
        assert!(position(c_id) < position(d_id));
    }

    #[test]
    fn independent_nodes_share_a_level() {
        let a = node();
        let b = node().with_dependency(a.id);
        let c = node().with_dependency(a.id);
        let (b_id, c_id) = (b.id, c.id);

        let graph = WorkflowGraph::new(vec![a, b, c]).unwrap();
        let levels = graph.topological_levels().unwrap();

        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 1);
        assert!(levels[1].contains(&b_id) && levels[1].contains(&c_id));
    }

    #[test]
    fn cyclic_graphs_are_rejected_at_construction() {
        let mut a = node();
        let mut b = node();
        let mut c = node();
        a.dependencies.push(c.id);
        b.dependencies.push(a.id);
        c.dependencies.push(b.id);

        let result = WorkflowGraph::new(vec![a, b, c]);

        assert!(matches!(result, Err(WorkflowError::CyclicGraph)));
    }

    #[test]
    fn dangling_dependencies_are_rejected() {
        let ghost = NodeId::new();
        let lonely = node().with_dependency(ghost);

        let result = WorkflowGraph::new(vec![lonely]);

        assert!(matches!(result, Err(WorkflowError::UnknownNode(_))));
    }

    #[test]
    fn propagate_winners_rebids_at_the_configured_factor() {
        let winner = BidderId::new();
        let mut result = AuctionResult::empty(AuctionId::new(), dec!(75), Utc::now());
        result.winners.push(winner);
        result.allocations.insert(winner, dec!(1));
        result.payments.insert(winner, dec!(75));

        let mut deps = BTreeMap::new();
        deps.insert(NodeId::new(), result);

        let bids = PropagateWinnersHooks::new().synthesize_bids(&deps);

        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].bidder_id, winner);
        assert_eq!(bids[0].amount, dec!(82.5));
        assert_eq!(bids[0].quantity, 1);
    }

    #[test]
    fn fractional_allocations_propagate_as_whole_lots() {
        let winner = BidderId::new();
        let mut result = AuctionResult::empty(AuctionId::new(), dec!(10), Utc::now());
        result.winners.push(winner);
        result.allocations.insert(winner, dec!(2.5));
        result.payments.insert(winner, dec!(25));

        let mut deps = BTreeMap::new();
        deps.insert(NodeId::new(), result);

        let bids = PropagateWinnersHooks::with_factor(dec!(2)).synthesize_bids(&deps);

        assert_eq!(bids[0].quantity, 3);
        assert_eq!(bids[0].amount, dec!(20));
    }

    #[test]
    fn identity_hooks_change_nothing() {
        let config = MechanismConfig::first_price(dec!(5));
        let deps = BTreeMap::new();

        let transformed = IdentityHooks.transform(config.clone(), &deps);

        assert_eq!(transformed, config);
        assert!(IdentityHooks.synthesize_bids(&deps).is_empty());
    }
}
