use crate::clock::Clock;
use crate::errors::{ActorError, BidError};
use crate::event_log::EventLog;
use crate::mechanisms::config::MechanismConfig;
use crate::mechanisms::{self, BidDisposition, MechanismState};
use crate::metrics_update;
use crate::types::{
    AuctionId, AuctionResult, AuctionStatus, Bid, Bidder, BidderId, BidResponse, Event,
    StatusReport,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Everything one auction owns. Mutated only on the actor task; the handle
/// hands out clones through `Snapshot`.
#[derive(Debug, Clone)]
pub struct AuctionState {
    pub auction_id: AuctionId,
    pub config: MechanismConfig,
    pub status: AuctionStatus,
    pub current_bids: Vec<Bid>,
    pub participants: BTreeMap<BidderId, Bidder>,
    pub started_at: DateTime<Utc>,
    pub result: Option<AuctionResult>,
}

enum AuctionMessage {
    Bid {
        bid: Bid,
        respond_to: oneshot::Sender<BidResponse>,
    },
    Finalize {
        respond_to: Option<oneshot::Sender<Result<AuctionResult, ActorError>>>,
    },
    Query {
        respond_to: oneshot::Sender<StatusReport>,
    },
    Snapshot {
        respond_to: oneshot::Sender<AuctionState>,
    },
    UpdateConfig {
        config: MechanismConfig,
        respond_to: oneshot::Sender<bool>,
    },
    Cancel {
        reason: String,
    },
}

struct AuctionActor {
    state: AuctionState,
    mechanism_state: MechanismState,
    log: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    receiver: mpsc::UnboundedReceiver<AuctionMessage>,
    /// Messages the actor addressed to itself; drained before the mailbox
    /// so a triggered finalize cannot be overtaken by queued bids.
    pending: VecDeque<AuctionMessage>,
    status_cell: Arc<Mutex<StatusReport>>,
}

impl AuctionActor {
    fn new(
        config: MechanismConfig,
        participants: Vec<Bidder>,
        log: Arc<EventLog>,
        clock: Arc<dyn Clock>,
        receiver: mpsc::UnboundedReceiver<AuctionMessage>,
        status_cell: Arc<Mutex<StatusReport>>,
    ) -> Self {
        let started_at = clock.now();
        let state = AuctionState {
            auction_id: AuctionId::new(),
            status: AuctionStatus::Pending,
            current_bids: Vec::new(),
            participants: participants
                .into_iter()
                .map(|bidder| (bidder.id, bidder))
                .collect(),
            started_at,
            result: None,
            config,
        };
        let mechanism_state = MechanismState::for_config(&state.config, started_at);

        metrics_update!(inc total ACTIVE_ACTOR_INSTANCES_COUNT, &["auction_actor"]);

        Self {
            state,
            mechanism_state,
            log,
            clock,
            receiver,
            pending: VecDeque::new(),
            status_cell,
        }
    }

    async fn run(&mut self) {
        self.start();
        self.update_status_cell();

        loop {
            let message = match self.pending.pop_front() {
                Some(message) => message,
                None => match self.receiver.recv().await {
                    Some(message) => message,
                    None => break,
                },
            };

            self.handle_message(message).await;
            self.update_status_cell();
        }

        info!(
            "Auction actor {} stopped in status {}",
            self.state.auction_id, self.state.status
        );
    }

    fn start(&mut self) {
        self.state.status = AuctionStatus::Active;
        let event = Event::AuctionStarted {
            auction_id: self.state.auction_id,
            mechanism: self.state.config.kind().to_string(),
        };
        if let Err(err) = self.log.append(self.state.auction_id, event) {
            self.cancel(format!("failed to record auction start: {}", err));
        } else {
            info!(
                "Auction {} started ({})",
                self.state.auction_id,
                self.state.config.kind()
            );
        }
    }

    async fn handle_message(&mut self, message: AuctionMessage) {
        // Clock-driven clearing conditions (inactivity, candle flame,
        // descending demand) are evaluated on every message, so even a
        // query can expire an auction.
        if self.state.status == AuctionStatus::Active {
            let now = self.clock.now();
            if self
                .mechanism_state
                .on_tick(&self.state.config, &self.state.current_bids, now)
            {
                self.finalize_internal(now);
            }
        }

        match message {
            AuctionMessage::Bid { bid, respond_to } => {
                let response = self.handle_bid(bid);
                let _ = respond_to.send(response);
            }
            AuctionMessage::Finalize { respond_to } => {
                let result = self.handle_finalize();
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(result);
                }
            }
            AuctionMessage::Query { respond_to } => {
                let _ = respond_to.send(self.status_report());
            }
            AuctionMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.state.clone());
            }
            AuctionMessage::UpdateConfig { config, respond_to } => {
                let _ = respond_to.send(self.handle_update_config(config));
            }
            AuctionMessage::Cancel { reason } => {
                self.cancel(reason);
            }
        }
    }

    fn handle_bid(&mut self, bid: Bid) -> BidResponse {
        let mechanism = self.state.config.kind().to_string();

        if let Err(reason) = self.validate_bid(&bid) {
            return self.reject_bid(&bid, reason.to_string(), &mechanism);
        }

        let now = self.clock.now();
        match self
            .mechanism_state
            .on_bid(&self.state.config, &self.state.current_bids, &bid, now)
        {
            BidDisposition::Rejected(reason) => self.reject_bid(&bid, reason.to_string(), &mechanism),
            disposition => {
                let event = Event::BidSubmitted {
                    auction_id: self.state.auction_id,
                    bid: bid.clone(),
                };
                if let Err(err) = self.log.append(self.state.auction_id, event) {
                    self.cancel(format!("failed to record bid: {}", err));
                    return BidResponse::rejected("auction cancelled: event log failure");
                }

                let bid_id = bid.id;
                self.state.current_bids.push(bid);
                metrics_update!(inc BIDS_SUBMITTED_COUNT, &[mechanism.as_str()]);

                if disposition == BidDisposition::AcceptedTriggersClearing {
                    self.pending
                        .push_back(AuctionMessage::Finalize { respond_to: None });
                }

                BidResponse::accepted(bid_id, "bid accepted")
            }
        }
    }

    fn validate_bid(&mut self, bid: &Bid) -> Result<(), BidError> {
        if self.state.status != AuctionStatus::Active {
            return Err(BidError::NotAccepting(self.state.status));
        }

        if let Some(start_time) = self.state.config.common().start_time {
            if self.clock.now() < start_time {
                return Err(BidError::BiddingNotOpen(start_time));
            }
        }

        if let Some(end_time) = self.state.config.common().end_time {
            if self.clock.now() > end_time {
                // Past the deadline the auction only waits to be finalized.
                self.state.status = AuctionStatus::Finalizing;
                return Err(BidError::BiddingClosed(end_time));
            }
        }

        if bid.quantity == 0 {
            return Err(BidError::ZeroQuantity);
        }

        let reserve = self.state.config.common().reserve_price;
        if bid.amount < reserve {
            return Err(BidError::BelowReserve {
                amount: bid.amount,
                reserve,
            });
        }

        Ok(())
    }

    fn reject_bid(&mut self, bid: &Bid, reason: String, mechanism: &str) -> BidResponse {
        let event = Event::BidRejected {
            auction_id: self.state.auction_id,
            bidder_id: bid.bidder_id,
            amount: bid.amount,
            reason: reason.clone(),
        };
        if let Err(err) = self.log.append(self.state.auction_id, event) {
            error!(
                "Failed to record bid rejection for auction {}: {:#?}",
                self.state.auction_id, err
            );
        }
        metrics_update!(inc BIDS_REJECTED_COUNT, &[mechanism]);

        BidResponse::rejected(reason)
    }

    fn handle_finalize(&mut self) -> Result<AuctionResult, ActorError> {
        match self.state.status {
            // Finalize is idempotent once completed: same result, no new event.
            AuctionStatus::Completed => Ok(self
                .state
                .result
                .clone()
                .expect("completed auction always has a result")),
            AuctionStatus::Cancelled => Err(ActorError::Cancelled {
                auction_id: self.state.auction_id,
                reason: "auction was cancelled".to_string(),
            }),
            _ => {
                let now = self.clock.now();
                Ok(self.finalize_internal(now))
            }
        }
    }

    fn finalize_internal(&mut self, now: DateTime<Utc>) -> AuctionResult {
        self.state.status = AuctionStatus::Finalizing;
        let mechanism = self.state.config.kind().to_string();
        let timer = metrics_update!(timer AUCTION_FINALIZATION_TIME, &[mechanism.as_str()]);

        let result = match mechanisms::finalize(
            &self.state.config,
            &self.mechanism_state,
            self.state.auction_id,
            &self.state.current_bids,
            now,
        ) {
            Ok(result) => result,
            Err(err) => {
                // A clearing fault yields an empty result and cancels the
                // auction, leaving siblings in the same workflow untouched.
                warn!(
                    "Clearing failed for auction {}: {}",
                    self.state.auction_id, err
                );
                let empty = AuctionResult::empty(
                    self.state.auction_id,
                    self.state.config.common().reserve_price,
                    now,
                );
                self.state.result = Some(empty.clone());
                self.cancel(format!("clearing failed: {}", err));
                metrics_update!(timer observe timer);
                return empty;
            }
        };

        self.state.result = Some(result.clone());
        self.state.status = AuctionStatus::Completed;

        let event = Event::AuctionFinalized {
            auction_id: self.state.auction_id,
            result: result.clone(),
        };
        if let Err(err) = self.log.append(self.state.auction_id, event) {
            error!(
                "Failed to record finalization for auction {}: {:#?}",
                self.state.auction_id, err
            );
        }

        metrics_update!(timer observe timer);
        info!(
            "Auction {} completed at clearing price {} with {} winner(s)",
            self.state.auction_id,
            result.clearing_price,
            result.winners.len()
        );
        result
    }

    fn handle_update_config(&mut self, config: MechanismConfig) -> bool {
        if self.state.status.is_terminal() || config.kind() != self.state.config.kind() {
            return false;
        }
        self.state.config = config;
        true
    }

    fn cancel(&mut self, reason: String) {
        if self.state.status.is_terminal() {
            return;
        }

        self.state.status = AuctionStatus::Cancelled;
        let event = Event::AuctionCancelled {
            auction_id: self.state.auction_id,
            reason: reason.clone(),
        };
        if let Err(err) = self.log.append(self.state.auction_id, event) {
            error!(
                "Failed to record cancellation for auction {}: {:#?}",
                self.state.auction_id, err
            );
        }
        warn!("Auction {} cancelled: {}", self.state.auction_id, reason);
    }

    fn current_price(&self) -> Option<Decimal> {
        match &self.mechanism_state {
            MechanismState::Dutch(state) => Some(state.current_price),
            MechanismState::English(state) => Some(state.current_price),
            MechanismState::Japanese(state) => Some(state.current_price),
            MechanismState::Penny(state) => Some(state.current_price),
            _ => None,
        }
    }

    fn current_leader(&self) -> Option<BidderId> {
        match &self.mechanism_state {
            MechanismState::English(state) => state.current_leader,
            MechanismState::Penny(state) => state.last_bidder,
            _ => None,
        }
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.state.status,
            bid_count: self.state.current_bids.len(),
            current_price: self.current_price(),
            current_leader: self.current_leader(),
        }
    }

    fn update_status_cell(&self) {
        *self.status_cell.lock().unwrap() = self.status_report();
    }
}

impl Drop for AuctionActor {
    fn drop(&mut self) {
        debug!("AuctionActor {} has been dropped", self.state.auction_id);
        metrics_update!(dec total ACTIVE_ACTOR_INSTANCES_COUNT, &["auction_actor"]);
    }
}

/// Frontend of a running auction actor. Cloneable; dropping the last clone
/// closes the mailbox and lets the worker drain out.
pub struct AuctionHandle {
    auction_id: AuctionId,
    sender: mpsc::UnboundedSender<AuctionMessage>,
    status_cell: Arc<Mutex<StatusReport>>,
    /// The spawned worker task, shared by all clones; taken by `join`.
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for AuctionHandle {
    fn clone(&self) -> Self {
        metrics_update!(inc total ACTIVE_HANDLE_INSTANCES_COUNT, &["auction_handle"]);
        Self {
            auction_id: self.auction_id,
            sender: self.sender.clone(),
            status_cell: Arc::clone(&self.status_cell),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl Drop for AuctionHandle {
    fn drop(&mut self) {
        debug!("AuctionHandle {} has been dropped", self.auction_id);
        metrics_update!(dec total ACTIVE_HANDLE_INSTANCES_COUNT, &["auction_handle"]);
    }
}

impl AuctionHandle {
    pub async fn new(
        config: MechanismConfig,
        participants: Vec<Bidder>,
        log: Arc<EventLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let status_cell = Arc::new(Mutex::new(StatusReport {
            status: AuctionStatus::Pending,
            bid_count: 0,
            current_price: None,
            current_leader: None,
        }));

        let mut actor = AuctionActor::new(
            config,
            participants,
            log,
            clock,
            receiver,
            Arc::clone(&status_cell),
        );
        let auction_id = actor.state.auction_id;

        let worker = tokio::spawn(async move { actor.run().await });

        metrics_update!(inc total ACTIVE_HANDLE_INSTANCES_COUNT, &["auction_handle"]);

        Self {
            auction_id,
            sender,
            status_cell,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn auction_id(&self) -> AuctionId {
        self.auction_id
    }

    pub async fn submit_bid(&self, bid: Bid) -> Result<BidResponse, ActorError> {
        let (sender, receiver) = oneshot::channel();
        let msg = AuctionMessage::Bid {
            bid,
            respond_to: sender,
        };

        self.sender
            .send(msg)
            .map_err(|_| ActorError::MailboxClosed)?;
        Ok(receiver.await?)
    }

    pub async fn finalize(&self) -> Result<AuctionResult, ActorError> {
        let (sender, receiver) = oneshot::channel();
        let msg = AuctionMessage::Finalize {
            respond_to: Some(sender),
        };

        self.sender
            .send(msg)
            .map_err(|_| ActorError::MailboxClosed)?;
        receiver.await?
    }

    /// Fire-and-forget finalize; completion is observed through `status`.
    pub fn request_finalize(&self) -> Result<(), ActorError> {
        self.sender
            .send(AuctionMessage::Finalize { respond_to: None })
            .map_err(|_| ActorError::MailboxClosed)
    }

    pub async fn query(&self) -> Result<StatusReport, ActorError> {
        let (sender, receiver) = oneshot::channel();
        let msg = AuctionMessage::Query { respond_to: sender };

        self.sender
            .send(msg)
            .map_err(|_| ActorError::MailboxClosed)?;
        Ok(receiver.await?)
    }

    /// Out-of-band status read from the shared cell; never touches the
    /// mailbox, so controller polls cannot pile up behind bids.
    pub fn status(&self) -> StatusReport {
        self.status_cell.lock().unwrap().clone()
    }

    pub async fn snapshot(&self) -> Result<AuctionState, ActorError> {
        let (sender, receiver) = oneshot::channel();
        let msg = AuctionMessage::Snapshot { respond_to: sender };

        self.sender
            .send(msg)
            .map_err(|_| ActorError::MailboxClosed)?;
        Ok(receiver.await?)
    }

    pub async fn update_config(&self, config: MechanismConfig) -> Result<bool, ActorError> {
        let (sender, receiver) = oneshot::channel();
        let msg = AuctionMessage::UpdateConfig {
            config,
            respond_to: sender,
        };

        self.sender
            .send(msg)
            .map_err(|_| ActorError::MailboxClosed)?;
        Ok(receiver.await?)
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.sender.send(AuctionMessage::Cancel {
            reason: reason.into(),
        });
    }

    /// Consumes the handle and waits for the worker task to exit. The
    /// worker only stops once every clone is gone, so join the last one.
    pub async fn join(self) {
        let worker = self.worker.lock().unwrap().take();
        drop(self);
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Rebuilds auction state by replaying the log, the way a persistence
/// adapter would at startup. The returned state matches what the live actor
/// held right after the last event was processed.
pub fn rebuild_from_log(
    log: &EventLog,
    auction_id: AuctionId,
    config: MechanismConfig,
) -> AuctionState {
    let mut state = AuctionState {
        auction_id,
        status: AuctionStatus::Pending,
        current_bids: Vec::new(),
        participants: BTreeMap::new(),
        started_at: Utc::now(),
        result: None,
        config,
    };
    let mut mechanism_state = MechanismState::for_config(&state.config, state.started_at);

    log.replay(auction_id, |entry| match &entry.event {
        Event::AuctionStarted { .. } => {
            state.status = AuctionStatus::Active;
            state.started_at = entry.timestamp;
            mechanism_state = MechanismState::for_config(&state.config, entry.timestamp);
        }
        Event::BidSubmitted { bid, .. } => {
            mechanism_state.on_bid(&state.config, &state.current_bids, bid, entry.timestamp);
            state.current_bids.push(bid.clone());
        }
        Event::BidRejected { .. } => {}
        Event::AuctionFinalized { result, .. } => {
            state.result = Some(result.clone());
            state.status = AuctionStatus::Completed;
        }
        Event::AuctionCancelled { .. } => {
            state.status = AuctionStatus::Cancelled;
        }
    });

    state
}
