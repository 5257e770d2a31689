use crate::actors::auction_actor::AuctionHandle;
use crate::actors::prometheus_exporter::PrometheusExporterHandle;
use crate::clock::{Clock, SystemClock};
use crate::errors::{ActorError, EngineError, WorkflowError};
use crate::event_log::EventLog;
use crate::mechanisms::config::MechanismConfig;
use crate::metrics_update;
use crate::configuration::Register;
use crate::types::{
    AuctionId, AuctionResult, Bid, Bidder, BidderId, BidResponse, NodeId, StatusReport, WorkflowId,
    METADATA_PROPAGATED,
};
use crate::workflow::{
    PropagateWinnersHooks, WorkflowGraph, WorkflowNode, WorkflowResult,
};
use anyhow::Result;
use chrono::Duration as ChronoDuration;
use log::{info, warn};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reserved metadata keys on bids synthesized from an upstream result.
pub const PROPAGATED_PRICE_KEY: &str = "prev_clearing_price";
pub const PROPAGATED_WINNERS_KEY: &str = "prev_winners";
pub const PROPAGATED_ALLOCATIONS_KEY: &str = "prev_allocations";

struct ControllerInner {
    actors: HashMap<AuctionId, AuctionHandle>,
    workflow_results: HashMap<WorkflowId, WorkflowResult>,
}

/// Owns every live auction actor and runs workflow DAGs over them. All map
/// access happens in short critical sections; no lock is ever held across a
/// mailbox send.
pub struct AuctionController {
    register: Register,
    log: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    inner: Mutex<ControllerInner>,
    stopped: AtomicBool,
}

impl AuctionController {
    pub async fn new(register: Register, log: Arc<EventLog>) -> Result<Self> {
        Self::with_clock(register, log, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        register: Register,
        log: Arc<EventLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        PrometheusExporterHandle::new(&register).await?;

        Ok(Self {
            register,
            log,
            clock,
            inner: Mutex::new(ControllerInner {
                actors: HashMap::new(),
                workflow_results: HashMap::new(),
            }),
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WorkflowError::ControllerStopped.into());
        }
        Ok(())
    }

    fn handle_for(&self, auction_id: AuctionId) -> Result<AuctionHandle, EngineError> {
        self.inner
            .lock()
            .unwrap()
            .actors
            .get(&auction_id)
            .cloned()
            .ok_or_else(|| ActorError::UnknownAuction(auction_id).into())
    }

    fn forget_actor(&self, auction_id: AuctionId) {
        self.inner.lock().unwrap().actors.remove(&auction_id);
    }

    pub async fn create_auction(&self, config: MechanismConfig) -> Result<AuctionId, EngineError> {
        self.create_auction_with_participants(config, Vec::new())
            .await
    }

    pub async fn create_auction_with_participants(
        &self,
        config: MechanismConfig,
        participants: Vec<Bidder>,
    ) -> Result<AuctionId, EngineError> {
        self.ensure_running()?;

        let handle = AuctionHandle::new(
            config,
            participants,
            Arc::clone(&self.log),
            Arc::clone(&self.clock),
        )
        .await;
        let auction_id = handle.auction_id();

        self.inner.lock().unwrap().actors.insert(auction_id, handle);
        Ok(auction_id)
    }

    pub async fn submit_bid(
        &self,
        auction_id: AuctionId,
        bidder_id: BidderId,
        amount: Decimal,
        quantity: u64,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<BidResponse, EngineError> {
        let handle = self.handle_for(auction_id)?;

        let mut bid = Bid::new(bidder_id, amount, quantity, self.clock.now());
        bid.metadata = metadata;

        Ok(handle.submit_bid(bid).await.map_err(EngineError::from)?)
    }

    pub async fn finalize_auction(&self, auction_id: AuctionId) -> Result<AuctionResult, EngineError> {
        let handle = self.handle_for(auction_id)?;
        Ok(handle.finalize().await.map_err(EngineError::from)?)
    }

    /// Served from the actor's status cell, not its mailbox.
    pub fn query_status(&self, auction_id: AuctionId) -> Result<StatusReport, EngineError> {
        Ok(self.handle_for(auction_id)?.status())
    }

    /// Merges an upstream result into a downstream auction's inputs: the
    /// previous winners are re-bid at the chain factor, and the previous
    /// clearing price, winners and allocations travel along under reserved
    /// metadata keys.
    pub fn propagate_results(&self, from_result: &AuctionResult) -> Vec<Bid> {
        let factor = self.chain_rebid_factor();
        let now = self.clock.now();

        from_result
            .winners
            .iter()
            .map(|winner| {
                let quantity = from_result
                    .allocations
                    .get(winner)
                    .and_then(|allocation| allocation.ceil().to_u64())
                    .unwrap_or(1)
                    .max(1);

                let mut bid = Bid::new(
                    *winner,
                    from_result.clearing_price * factor,
                    quantity,
                    now,
                );
                bid.metadata.insert(
                    METADATA_PROPAGATED.to_string(),
                    serde_json::json!(from_result.auction_id.to_string()),
                );
                bid.metadata.insert(
                    PROPAGATED_PRICE_KEY.to_string(),
                    serde_json::json!(from_result.clearing_price.to_string()),
                );
                bid.metadata.insert(
                    PROPAGATED_WINNERS_KEY.to_string(),
                    serde_json::json!(from_result
                        .winners
                        .iter()
                        .map(|w| w.to_string())
                        .collect::<Vec<_>>()),
                );
                bid.metadata.insert(
                    PROPAGATED_ALLOCATIONS_KEY.to_string(),
                    serde_json::json!(from_result
                        .allocations
                        .iter()
                        .map(|(w, a)| (w.to_string(), a.to_string()))
                        .collect::<BTreeMap<_, _>>()),
                );
                bid
            })
            .collect()
    }

    fn chain_rebid_factor(&self) -> Decimal {
        let configured = self.register.config.get_controller_config().chain_rebid_factor;
        Decimal::from_f64(configured).unwrap_or_else(|| Decimal::new(11, 1))
    }

    /// Linearizes `nodes` so each stage depends on its predecessor and
    /// re-bids the predecessor's winners at the chain factor.
    pub fn chain_auctions(&self, mut nodes: Vec<WorkflowNode>) -> Result<WorkflowGraph, EngineError> {
        let hooks = Arc::new(PropagateWinnersHooks::with_factor(self.chain_rebid_factor()));

        for index in 1..nodes.len() {
            let previous = nodes[index - 1].id;
            nodes[index].dependencies.push(previous);
            nodes[index].hooks = Arc::clone(&hooks) as Arc<dyn crate::workflow::WorkflowHooks>;
        }

        Ok(WorkflowGraph::new(nodes)?)
    }

    pub async fn execute_workflow(
        &self,
        graph: WorkflowGraph,
    ) -> Result<WorkflowResult, EngineError> {
        metrics_update!(inc ACTIVE_WORKFLOWS_COUNT);
        let timer = metrics_update!(timer WORKFLOW_EXECUTION_TIME);

        let outcome = self.execute_workflow_inner(graph).await;

        metrics_update!(timer observe timer);
        metrics_update!(dec ACTIVE_WORKFLOWS_COUNT);
        outcome
    }

    async fn execute_workflow_inner(
        &self,
        graph: WorkflowGraph,
    ) -> Result<WorkflowResult, EngineError> {
        self.ensure_running()?;
        graph.validate()?;

        let levels = graph.topological_levels()?;
        let execution_order: Vec<NodeId> = levels.iter().flatten().copied().collect();
        let start_time = self.clock.now();

        info!(
            "Executing workflow {} with {} node(s) across {} level(s)",
            graph.workflow_id,
            graph.nodes.len(),
            levels.len()
        );

        let mut node_results: BTreeMap<NodeId, AuctionResult> = BTreeMap::new();
        for level in &levels {
            let outcomes = {
                let stage_futures: Vec<_> = level
                    .iter()
                    .filter_map(|id| graph.nodes.get(id))
                    .map(|node| self.run_node(node, &node_results))
                    .collect();
                futures::future::join_all(stage_futures).await
            };

            for outcome in outcomes {
                let (node_id, result) = outcome?;
                node_results.insert(node_id, result);
            }
        }

        let workflow_result = WorkflowResult {
            workflow_id: graph.workflow_id,
            node_results,
            execution_order,
            start_time,
            end_time: self.clock.now(),
            metadata: BTreeMap::new(),
        };

        self.inner
            .lock()
            .unwrap()
            .workflow_results
            .insert(graph.workflow_id, workflow_result.clone());

        Ok(workflow_result)
    }

    /// Runs one stage to completion: transform the config from dependency
    /// results, launch the actor, seed the book, wait out the bidding
    /// window, finalize and poll for completion under the deadline.
    async fn run_node(
        &self,
        node: &WorkflowNode,
        results: &BTreeMap<NodeId, AuctionResult>,
    ) -> Result<(NodeId, AuctionResult), EngineError> {
        let mut deps = BTreeMap::new();
        for dependency in &node.dependencies {
            let result = results
                .get(dependency)
                .ok_or(WorkflowError::MissingDependencyResult(*dependency))?;
            deps.insert(*dependency, result.clone());
        }

        self.ensure_running()?;
        let effective_config = node.hooks.transform(node.config.clone(), &deps);
        let reserve = effective_config.common().reserve_price;

        let handle = AuctionHandle::new(
            effective_config,
            Vec::new(),
            Arc::clone(&self.log),
            Arc::clone(&self.clock),
        )
        .await;
        let auction_id = handle.auction_id();
        self.inner.lock().unwrap().actors.insert(auction_id, handle.clone());

        for bid in &node.initial_bids {
            let response = handle.submit_bid(bid.clone()).await.map_err(EngineError::from)?;
            if !response.accepted {
                warn!(
                    "Initial bid for workflow node {} rejected: {}",
                    node.id, response.message
                );
            }
        }

        let provenance: Vec<String> = deps.keys().map(|id| id.to_string()).collect();
        for synthetic in node.hooks.synthesize_bids(&deps) {
            let bid = Bid::new(
                synthetic.bidder_id,
                synthetic.amount,
                synthetic.quantity,
                self.clock.now(),
            )
            .with_metadata(METADATA_PROPAGATED, serde_json::json!(provenance));

            let response = handle.submit_bid(bid).await.map_err(EngineError::from)?;
            if !response.accepted {
                warn!(
                    "Propagated bid for workflow node {} rejected: {}",
                    node.id, response.message
                );
            }
        }

        if let Some(duration) = node.duration {
            self.clock.sleep(duration).await;
        }

        handle.request_finalize().map_err(EngineError::from)?;

        let controller_config = self.register.config.get_controller_config();
        let timeout_ms = controller_config.finalize_timeout_ms;
        let poll_interval = Duration::from_millis(controller_config.poll_interval_ms);
        let deadline = self.clock.now() + ChronoDuration::milliseconds(timeout_ms as i64);

        loop {
            let now = self.clock.now();
            let report = handle.status();
            if report.status.is_terminal() {
                break;
            }
            if now > deadline {
                self.forget_actor(auction_id);
                return Err(WorkflowError::FinalizationTimeout {
                    auction_id,
                    timeout_ms,
                }
                .into());
            }
            self.clock.sleep(poll_interval).await;
        }

        let snapshot = handle.snapshot().await.map_err(EngineError::from)?;
        self.forget_actor(auction_id);

        // A cancelled stage still yields a (empty) result; branches whose
        // dependencies are intact keep going.
        let result = snapshot
            .result
            .unwrap_or_else(|| AuctionResult::empty(auction_id, reserve, self.clock.now()));

        Ok((node.id, node.hooks.aggregate(result, &deps)))
    }

    pub fn workflow_result(&self, workflow_id: WorkflowId) -> Option<WorkflowResult> {
        self.inner
            .lock()
            .unwrap()
            .workflow_results
            .get(&workflow_id)
            .cloned()
    }

    pub fn live_auction_count(&self) -> usize {
        self.inner.lock().unwrap().actors.len()
    }

    /// Cancels every live actor, closes its mailbox and joins its worker
    /// before returning; afterwards the controller refuses further work.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let actors: Vec<AuctionHandle> = {
            let mut inner = self.inner.lock().unwrap();
            inner.actors.drain().map(|(_, handle)| handle).collect()
        };
        let cancelled = actors.len();

        for handle in &actors {
            handle.cancel("controller stopped");
        }

        // Consuming the last handle clone closes the mailbox, so each
        // worker drains its in-flight messages and exits before we move on.
        for handle in actors {
            handle.join().await;
        }

        info!("Controller stopped; {} live auction(s) cancelled", cancelled);
    }
}
