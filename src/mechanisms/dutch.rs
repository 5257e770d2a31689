//! Descending-price (Dutch) auction. The price falls by `decrement` every
//! `tick_duration_ms` of elapsed time, clamped at the floor; the auction
//! clears as soon as aggregate demand at the current price covers
//! `max_quantity`.

use super::config::DutchConfig;
use super::{allocate_by_rank, reserve_filter, BidDisposition};
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct DutchState {
    pub current_price: Decimal,
    pub last_tick: DateTime<Utc>,
}

impl DutchState {
    pub fn new(config: &DutchConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            current_price: config.starting_price,
            last_tick: started_at,
        }
    }

    /// Lazy descent: the price is recomputed from elapsed whole ticks on
    /// every message, so a quiet mailbox does not stall the clock.
    pub fn advance(&mut self, config: &DutchConfig, now: DateTime<Utc>) {
        if config.tick_duration_ms == 0 {
            return;
        }
        let tick = config.tick_duration_ms as i64;
        let elapsed = (now - self.last_tick).num_milliseconds();
        if elapsed < tick {
            return;
        }

        let steps = elapsed / tick;
        self.current_price =
            (self.current_price - config.decrement * Decimal::from(steps)).max(config.floor_price);
        self.last_tick = self.last_tick + Duration::milliseconds(steps * tick);
    }

    /// Standing bids priced at or above the current price count as demand.
    pub fn demand(&self, book: &[Bid]) -> u64 {
        book.iter()
            .filter(|bid| bid.amount >= self.current_price)
            .map(|bid| bid.quantity)
            .sum()
    }

    pub fn on_bid(
        &mut self,
        config: &DutchConfig,
        book: &[Bid],
        bid: &Bid,
        now: DateTime<Utc>,
    ) -> BidDisposition {
        self.advance(config, now);

        let mut demand = self.demand(book);
        if bid.amount >= self.current_price {
            demand += bid.quantity;
        }

        if demand >= config.common.max_quantity {
            BidDisposition::AcceptedTriggersClearing
        } else {
            BidDisposition::Accepted
        }
    }

    pub fn on_tick(&mut self, config: &DutchConfig, book: &[Bid], now: DateTime<Utc>) -> bool {
        self.advance(config, now);
        self.demand(book) >= config.common.max_quantity
    }
}

/// Highest of floor and the descended price at `now`.
pub fn determine_clearing_price(
    config: &DutchConfig,
    state: &DutchState,
    now: DateTime<Utc>,
) -> Decimal {
    let mut descended = state.clone();
    descended.advance(config, now);
    descended.current_price
}

pub fn finalize(
    config: &DutchConfig,
    state: &DutchState,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> AuctionResult {
    let reserve = config.common.reserve_price;
    let clearing_price = determine_clearing_price(config, state, now).max(reserve);

    let qualifying: Vec<&Bid> = reserve_filter(bids, reserve)
        .into_iter()
        .filter(|bid| bid.amount >= clearing_price)
        .collect();
    if qualifying.is_empty() {
        return AuctionResult::empty(auction_id, reserve.max(clearing_price), now);
    }

    let shares = allocate_by_rank(
        &qualifying,
        usize::MAX,
        config.common.max_quantity,
        &config.common.tie_breaking,
    );

    let mut allocations: BTreeMap<BidderId, Decimal> = BTreeMap::new();
    let mut payments: BTreeMap<BidderId, Decimal> = BTreeMap::new();
    for share in &shares {
        *allocations
            .entry(share.bid.bidder_id)
            .or_insert(Decimal::ZERO) += share.allocation;
        // Everyone pays the uniform descended price per allocated unit.
        *payments.entry(share.bid.bidder_id).or_insert(Decimal::ZERO) +=
            clearing_price * share.allocation;
    }

    let winners = allocations.keys().copied().collect();
    AuctionResult {
        auction_id,
        clearing_price,
        winners,
        allocations,
        payments,
        timestamp: now,
        metadata: BTreeMap::new(),
    }
}
