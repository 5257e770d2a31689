//! Japanese auction: the price rises one step at a time and every active
//! bidder must affirm each step to stay in. Dropping out is final; the field
//! collapsing below `min_active_bidders` ends the auction.

use super::config::JapaneseConfig;
use super::BidDisposition;
use crate::errors::BidError;
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct JapaneseState {
    pub current_price: Decimal,
    pub active: BTreeSet<BidderId>,
    pub dropped: BTreeSet<BidderId>,
    /// Bidders who already affirmed the next price step.
    affirmed: BTreeSet<BidderId>,
}

impl JapaneseState {
    pub fn new(config: &JapaneseConfig) -> Self {
        Self {
            current_price: config.starting_price,
            active: BTreeSet::new(),
            dropped: BTreeSet::new(),
            affirmed: BTreeSet::new(),
        }
    }

    /// A bid at or above the next step affirms it; a bid below the current
    /// price is a drop-out. Once every active bidder has affirmed, the price
    /// rises and affirmations reset.
    pub fn on_bid(&mut self, config: &JapaneseConfig, bid: &Bid) -> BidDisposition {
        if self.dropped.contains(&bid.bidder_id) {
            return BidDisposition::Rejected(BidError::DroppedOut(bid.bidder_id.to_string()));
        }

        if bid.amount < self.current_price {
            self.active.remove(&bid.bidder_id);
            self.affirmed.remove(&bid.bidder_id);
            self.dropped.insert(bid.bidder_id);

            if !self.active.is_empty() && self.active.len() < config.min_active_bidders {
                return BidDisposition::AcceptedTriggersClearing;
            }
            return BidDisposition::Accepted;
        }

        self.active.insert(bid.bidder_id);
        if bid.amount >= self.current_price + config.increment {
            self.affirmed.insert(bid.bidder_id);
        }

        if !self.affirmed.is_empty() && self.affirmed.is_superset(&self.active) {
            self.current_price += config.increment;
            self.affirmed.clear();
        }

        BidDisposition::Accepted
    }
}

/// Price of the last fully affirmed step.
pub fn determine_clearing_price(config: &JapaneseConfig, state: &JapaneseState) -> Decimal {
    state.current_price.max(config.common.reserve_price)
}

/// The surviving field wins at the current price, splitting the quantity
/// evenly.
pub fn finalize(
    config: &JapaneseConfig,
    state: &JapaneseState,
    auction_id: AuctionId,
    now: DateTime<Utc>,
) -> AuctionResult {
    if state.active.is_empty() {
        return AuctionResult::empty(auction_id, config.common.reserve_price, now);
    }

    let clearing_price = determine_clearing_price(config, state);
    let share = Decimal::from(config.common.max_quantity) / Decimal::from(state.active.len() as u64);

    let mut allocations = BTreeMap::new();
    let mut payments = BTreeMap::new();
    for bidder in &state.active {
        allocations.insert(*bidder, share);
        payments.insert(*bidder, clearing_price * share);
    }

    AuctionResult {
        auction_id,
        clearing_price,
        winners: state.active.iter().copied().collect(),
        allocations,
        payments,
        timestamp: now,
        metadata: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::config::CommonConfig;
    use rust_decimal_macros::dec;

    fn config(min_active_bidders: usize) -> JapaneseConfig {
        JapaneseConfig {
            common: CommonConfig::default(),
            starting_price: dec!(100),
            increment: dec!(10),
            min_active_bidders,
        }
    }

    fn bid_from(bidder: BidderId, amount: Decimal) -> Bid {
        Bid::new(bidder, amount, 1, Utc::now())
    }

    #[test]
    fn price_rises_once_every_active_bidder_affirms() {
        let config = config(2);
        let mut state = JapaneseState::new(&config);
        let (a, b) = (BidderId::new(), BidderId::new());

        state.on_bid(&config, &bid_from(a, dec!(110)));
        assert_eq!(state.current_price, dec!(110));

        state.on_bid(&config, &bid_from(b, dec!(120)));
        assert_eq!(state.current_price, dec!(110));

        state.on_bid(&config, &bid_from(a, dec!(120)));
        assert_eq!(state.current_price, dec!(120));
    }

    #[test]
    fn dropping_out_is_final() {
        let config = config(2);
        let mut state = JapaneseState::new(&config);
        let (a, b, c) = (BidderId::new(), BidderId::new(), BidderId::new());

        state.on_bid(&config, &bid_from(a, dec!(100)));
        state.on_bid(&config, &bid_from(b, dec!(100)));
        state.on_bid(&config, &bid_from(c, dec!(100)));

        state.on_bid(&config, &bid_from(c, dec!(0)));
        assert!(state.dropped.contains(&c));

        let rejoin = state.on_bid(&config, &bid_from(c, dec!(200)));
        assert!(matches!(
            rejoin,
            BidDisposition::Rejected(BidError::DroppedOut(_))
        ));
    }

    #[test]
    fn field_collapsing_below_minimum_triggers_clearing() {
        let config = config(2);
        let mut state = JapaneseState::new(&config);
        let (a, b) = (BidderId::new(), BidderId::new());

        state.on_bid(&config, &bid_from(a, dec!(100)));
        state.on_bid(&config, &bid_from(b, dec!(100)));

        let disposition = state.on_bid(&config, &bid_from(b, dec!(0)));
        assert_eq!(disposition, BidDisposition::AcceptedTriggersClearing);
        assert_eq!(state.active.len(), 1);
    }

    #[test]
    fn survivors_win_at_the_current_price() {
        let config = config(2);
        let mut state = JapaneseState::new(&config);
        let (a, b) = (BidderId::new(), BidderId::new());

        state.on_bid(&config, &bid_from(a, dec!(110)));
        state.on_bid(&config, &bid_from(b, dec!(0)));

        let result = finalize(&config, &state, AuctionId::new(), Utc::now());

        assert_eq!(result.winners, vec![a]);
        assert_eq!(result.clearing_price, dec!(110));
        assert_eq!(result.payments[&a], dec!(110));
        assert!(result.validate());
    }
}
