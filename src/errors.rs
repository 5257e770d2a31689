use crate::types::{AuctionId, AuctionStatus, NodeId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Reasons a bid is turned away before it reaches the book. These are
/// surfaced to the caller inside a `BidResponse` and recorded as a
/// `BidRejected` event; they never take the actor down.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BidError {
    #[error("auction is not accepting bids (status: {0})")]
    NotAccepting(AuctionStatus),

    #[error("bidding does not open until {0}")]
    BiddingNotOpen(DateTime<Utc>),

    #[error("bidding closed at {0}")]
    BiddingClosed(DateTime<Utc>),

    #[error("bid {amount} is below the reserve price {reserve}")]
    BelowReserve { amount: Decimal, reserve: Decimal },

    #[error("bid {amount} is below the current price {current} plus increment {increment}")]
    BelowIncrement {
        amount: Decimal,
        current: Decimal,
        increment: Decimal,
    },

    #[error("bid quantity must be positive")]
    ZeroQuantity,

    #[error("bidder {0} already dropped out")]
    DroppedOut(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to canonically encode event: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Faults raised by the clearing routines themselves. A mechanism error
/// cancels the affected auction but not its siblings.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MechanismError {
    #[error("bid {0} carries no bundle metadata")]
    MissingBundle(String),

    #[error("bundle of bid {bid_id} names unknown item {item}")]
    UnknownItem { bid_id: String, item: String },

    #[error("double auction bid {0} carries no is_buy flag")]
    MissingSide(String),

    #[error("invalid mechanism parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow graph contains a cycle")]
    CyclicGraph,

    #[error("edge references unknown node {0}")]
    UnknownNode(NodeId),

    #[error("dependency {dependency} of node {node} has no matching edge")]
    MissingEdge { node: NodeId, dependency: NodeId },

    #[error("no result available for dependency {0}")]
    MissingDependencyResult(NodeId),

    #[error("auction {auction_id} did not finalize within {timeout_ms} ms")]
    FinalizationTimeout {
        auction_id: AuctionId,
        timeout_ms: u64,
    },

    #[error("controller has been stopped")]
    ControllerStopped,
}

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("auction {0} is unknown to the controller")]
    UnknownAuction(AuctionId),

    #[error("auction actor mailbox is closed")]
    MailboxClosed,

    #[error("auction actor dropped the reply channel")]
    RecvError(#[from] tokio::sync::oneshot::error::RecvError),

    #[error("auction {auction_id} was cancelled: {reason}")]
    Cancelled {
        auction_id: AuctionId,
        reason: String,
    },
}

/// Umbrella error for callers that do not care which subsystem failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Bid(#[from] BidError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Mechanism(#[from] MechanismError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

impl EngineError {
    /// Exit code for thin CLI wrappers: 1 validation, 2 runtime, 3 timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Bid(_) => 1,
            EngineError::Mechanism(MechanismError::InvalidParameter(_)) => 1,
            EngineError::Workflow(WorkflowError::CyclicGraph)
            | EngineError::Workflow(WorkflowError::UnknownNode(_))
            | EngineError::Workflow(WorkflowError::MissingEdge { .. }) => 1,
            EngineError::Workflow(WorkflowError::FinalizationTimeout { .. }) => 3,
            _ => 2,
        }
    }
}
