//! Programmable auction engine: a mechanism kernel for ten auction formats,
//! per-auction mailbox actors coordinated by a workflow controller, and a
//! tamper-evident hash-chained event log underneath all of it.

pub mod actors;
pub mod clock;
pub mod configuration;
pub mod controller;
pub mod errors;
pub mod event_log;
pub mod mechanisms;
pub mod types;
pub mod workflow;

pub use actors::auction_actor::{rebuild_from_log, AuctionHandle, AuctionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use configuration::{Configuration, Register};
pub use controller::AuctionController;
pub use errors::EngineError;
pub use event_log::{EventLog, LogEntry};
pub use mechanisms::config::{MechanismConfig, MechanismKind, TieBreaking};
pub use types::{
    AuctionId, AuctionResult, AuctionStatus, Bid, Bidder, BidderId, BidResponse, Event, EventKind,
    StatusReport,
};
pub use workflow::{
    IdentityHooks, PropagateWinnersHooks, WorkflowGraph, WorkflowHooks, WorkflowNode,
    WorkflowResult,
};
