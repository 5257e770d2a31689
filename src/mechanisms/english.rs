//! Ascending-price (English) auction. Each accepted bid must beat the
//! current price by the configured increment; the auction finalizes once the
//! book has been quiet longer than `inactive_duration_ms`.

use super::config::EnglishConfig;
use super::BidDisposition;
use crate::errors::BidError;
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct EnglishState {
    pub current_price: Decimal,
    pub current_leader: Option<BidderId>,
    pub last_bid_time: DateTime<Utc>,
}

impl EnglishState {
    pub fn new(config: &EnglishConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            current_price: config.starting_price,
            current_leader: None,
            last_bid_time: started_at,
        }
    }

    pub fn on_bid(
        &mut self,
        config: &EnglishConfig,
        bid: &Bid,
        now: DateTime<Utc>,
    ) -> BidDisposition {
        let required = self.current_price + config.increment;
        if bid.amount < required {
            return BidDisposition::Rejected(BidError::BelowIncrement {
                amount: bid.amount,
                current: self.current_price,
                increment: config.increment,
            });
        }

        self.current_price = bid.amount;
        self.current_leader = Some(bid.bidder_id);
        self.last_bid_time = now;
        BidDisposition::Accepted
    }

    pub fn on_tick(&mut self, config: &EnglishConfig, now: DateTime<Utc>) -> bool {
        now - self.last_bid_time > Duration::milliseconds(config.inactive_duration_ms as i64)
    }
}

/// The standing high bid; the reserve when nobody ever led.
pub fn determine_clearing_price(config: &EnglishConfig, state: &EnglishState) -> Decimal {
    if state.current_leader.is_some() {
        state.current_price.max(config.common.reserve_price)
    } else {
        config.common.reserve_price
    }
}

pub fn finalize(
    config: &EnglishConfig,
    state: &EnglishState,
    auction_id: AuctionId,
    _bids: &[Bid],
    now: DateTime<Utc>,
) -> AuctionResult {
    let clearing_price = determine_clearing_price(config, state);

    let leader = match state.current_leader {
        Some(leader) => leader,
        None => return AuctionResult::empty(auction_id, clearing_price, now),
    };

    let allocation = Decimal::from(config.common.max_quantity);
    let mut allocations = BTreeMap::new();
    let mut payments = BTreeMap::new();
    allocations.insert(leader, allocation);
    payments.insert(leader, clearing_price);

    AuctionResult {
        auction_id,
        clearing_price,
        winners: vec![leader],
        allocations,
        payments,
        timestamp: now,
        metadata: BTreeMap::new(),
    }
}
