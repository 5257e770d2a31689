use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Metadata keys with mechanism-specific meaning on a `Bid`.
pub const METADATA_BUNDLE: &str = "bundle";
pub const METADATA_IS_BUY: &str = "is_buy";
/// Marks bids the controller synthesizes from a predecessor's winners.
pub const METADATA_PROPAGATED: &str = "propagated_from";

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(AuctionId);
id_type!(BidId);
id_type!(BidderId);
id_type!(NodeId);
id_type!(WorkflowId);

/// A single sealed or open-outcry bid. Immutable once created; the
/// mechanism-specific extensions (`bundle`, `is_buy`) live in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub bidder_id: BidderId,
    pub amount: Decimal,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Bid {
    pub fn new(
        bidder_id: BidderId,
        amount: Decimal,
        quantity: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BidId::new(),
            bidder_id,
            amount,
            quantity,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Item bundle named by a combinatorial bid.
    pub fn bundle(&self) -> Option<BTreeSet<String>> {
        let raw = self.metadata.get(METADATA_BUNDLE)?.as_array()?;
        Some(
            raw.iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Buy/sell side of a double-auction bid. `None` when the flag is absent.
    pub fn is_buy(&self) -> Option<bool> {
        self.metadata.get(METADATA_IS_BUY)?.as_bool()
    }
}

/// Declarative bidder description. The engine never mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bidder {
    pub id: BidderId,
    pub name: String,
    pub budget: Decimal,
    pub valuation: Decimal,
    pub strategy: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Pending,
    Active,
    Finalizing,
    Completed,
    Cancelled,
}

impl AuctionStatus {
    /// No transition escapes `Completed` or `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuctionStatus::Completed | AuctionStatus::Cancelled)
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuctionStatus::Pending => "pending",
            AuctionStatus::Active => "active",
            AuctionStatus::Finalizing => "finalizing",
            AuctionStatus::Completed => "completed",
            AuctionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of a cleared auction. Produced once by the mechanism kernel and
/// thereafter read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionResult {
    pub auction_id: AuctionId,
    pub clearing_price: Decimal,
    pub winners: Vec<BidderId>,
    pub allocations: BTreeMap<BidderId, Decimal>,
    pub payments: BTreeMap<BidderId, Decimal>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AuctionResult {
    /// Completed-but-empty result, used when no bid met the reserve or a
    /// finalization failed.
    pub fn empty(auction_id: AuctionId, clearing_price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            auction_id,
            clearing_price,
            winners: Vec::new(),
            allocations: BTreeMap::new(),
            payments: BTreeMap::new(),
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    /// `keys(payments) ⊆ keys(allocations)` and every winner appears in both.
    pub fn validate(&self) -> bool {
        self.payments
            .keys()
            .all(|bidder| self.allocations.contains_key(bidder))
            && self.winners.iter().all(|winner| {
                self.allocations.contains_key(winner) && self.payments.contains_key(winner)
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    BidSubmitted,
    BidRejected,
    AuctionStarted,
    AuctionFinalized,
    AuctionCancelled,
}

/// Every state transition an auction goes through, as recorded in the
/// tamper-evident log. Field order matters: the canonical encoding hashed
/// into the chain follows the declaration order below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    BidSubmitted {
        auction_id: AuctionId,
        bid: Bid,
    },
    BidRejected {
        auction_id: AuctionId,
        bidder_id: BidderId,
        amount: Decimal,
        reason: String,
    },
    AuctionStarted {
        auction_id: AuctionId,
        mechanism: String,
    },
    AuctionFinalized {
        auction_id: AuctionId,
        result: AuctionResult,
    },
    AuctionCancelled {
        auction_id: AuctionId,
        reason: String,
    },
}

impl Event {
    pub fn auction_id(&self) -> AuctionId {
        match self {
            Event::BidSubmitted { auction_id, .. }
            | Event::BidRejected { auction_id, .. }
            | Event::AuctionStarted { auction_id, .. }
            | Event::AuctionFinalized { auction_id, .. }
            | Event::AuctionCancelled { auction_id, .. } => *auction_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::BidSubmitted { .. } => EventKind::BidSubmitted,
            Event::BidRejected { .. } => EventKind::BidRejected,
            Event::AuctionStarted { .. } => EventKind::AuctionStarted,
            Event::AuctionFinalized { .. } => EventKind::AuctionFinalized,
            Event::AuctionCancelled { .. } => EventKind::AuctionCancelled,
        }
    }
}

/// Reply to a bid submission, carried back over the message's oneshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BidResponse {
    pub accepted: bool,
    pub bid_id: Option<BidId>,
    pub message: String,
}

impl BidResponse {
    pub fn accepted(bid_id: BidId, message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            bid_id: Some(bid_id),
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            bid_id: None,
            message: message.into(),
        }
    }
}

/// Cheap out-of-band view of an auction, served without touching the mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: AuctionStatus,
    pub bid_count: usize,
    pub current_price: Option<Decimal>,
    pub current_leader: Option<BidderId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn bid(amount: Decimal) -> Bid {
        Bid::new(BidderId::new(), amount, 1, Utc::now())
    }

    #[test]
    fn bundle_metadata_is_parsed_into_a_set() {
        let bid = bid(dec!(10)).with_metadata(METADATA_BUNDLE, json!(["a", "b", "a"]));

        let bundle = bid.bundle().unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(bundle.contains("a") && bundle.contains("b"));
    }

    #[test]
    fn side_flag_is_absent_unless_set() {
        assert_eq!(bid(dec!(10)).is_buy(), None);
        assert_eq!(
            bid(dec!(10))
                .with_metadata(METADATA_IS_BUY, json!(true))
                .is_buy(),
            Some(true)
        );
    }

    #[test]
    fn result_validation_requires_winners_in_both_maps() {
        let winner = BidderId::new();
        let mut result = AuctionResult::empty(AuctionId::new(), dec!(5), Utc::now());
        result.winners.push(winner);
        assert!(!result.validate());

        result.allocations.insert(winner, dec!(1));
        result.payments.insert(winner, dec!(5));
        assert!(result.validate());
    }

    #[test]
    fn payments_must_be_a_subset_of_allocations() {
        let loser = BidderId::new();
        let mut result = AuctionResult::empty(AuctionId::new(), dec!(5), Utc::now());
        result.payments.insert(loser, dec!(1));
        assert!(!result.validate());

        result.allocations.insert(loser, Decimal::ZERO);
        assert!(result.validate());
    }

    #[test]
    fn events_report_their_kind_and_auction() {
        let auction_id = AuctionId::new();
        let event = Event::AuctionCancelled {
            auction_id,
            reason: "handler failure".to_string(),
        };

        assert_eq!(event.kind(), EventKind::AuctionCancelled);
        assert_eq!(event.auction_id(), auction_id);
    }
}
