//! Penny auction: every bid bumps the price by `bid_increment` and costs the
//! bidder `bid_cost`, win or lose. The most recent bidder when the
//! inactivity window expires takes the item at the current price; everyone
//! else's bid costs are sunk.

use super::config::PennyConfig;
use super::BidDisposition;
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct PennyState {
    pub current_price: Decimal,
    pub last_bidder: Option<BidderId>,
    pub last_bid_time: DateTime<Utc>,
    pub bid_counts: BTreeMap<BidderId, u64>,
}

impl PennyState {
    pub fn new(config: &PennyConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            current_price: config.common.reserve_price,
            last_bidder: None,
            last_bid_time: started_at,
            bid_counts: BTreeMap::new(),
        }
    }

    pub fn on_bid(
        &mut self,
        config: &PennyConfig,
        bid: &Bid,
        now: DateTime<Utc>,
    ) -> BidDisposition {
        self.current_price += config.bid_increment;
        self.last_bidder = Some(bid.bidder_id);
        self.last_bid_time = now;
        *self.bid_counts.entry(bid.bidder_id).or_insert(0) += 1;
        BidDisposition::Accepted
    }

    pub fn on_tick(&mut self, config: &PennyConfig, now: DateTime<Utc>) -> bool {
        self.last_bidder.is_some()
            && now - self.last_bid_time > Duration::milliseconds(config.inactive_duration_ms as i64)
    }
}

pub fn determine_clearing_price(state: &PennyState) -> Decimal {
    state.current_price
}

/// Winner pays the bumped-up price plus their own bid costs; losers keep
/// paying for the bids they placed. Sunk costs are the point of the format.
pub fn finalize(
    config: &PennyConfig,
    state: &PennyState,
    auction_id: AuctionId,
    now: DateTime<Utc>,
) -> AuctionResult {
    let winner = match state.last_bidder {
        Some(winner) => winner,
        None => {
            return AuctionResult::empty(auction_id, config.common.reserve_price, now);
        }
    };

    let clearing_price = determine_clearing_price(state);
    let mut allocations = BTreeMap::new();
    let mut payments = BTreeMap::new();

    for (bidder, count) in &state.bid_counts {
        let sunk = config.bid_cost * Decimal::from(*count);
        if *bidder == winner {
            allocations.insert(*bidder, Decimal::from(config.common.max_quantity));
            payments.insert(*bidder, clearing_price + sunk);
        } else {
            allocations.insert(*bidder, Decimal::ZERO);
            payments.insert(*bidder, sunk);
        }
    }

    AuctionResult {
        auction_id,
        clearing_price,
        winners: vec![winner],
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

    fn config() -> PennyConfig {
        PennyConfig {
            common: CommonConfig::default(),
            bid_increment: dec!(0.01),
            bid_cost: dec!(0.5),
            inactive_duration_ms: 10_000,
        }
    }

    fn bid_from(bidder: BidderId) -> Bid {
        Bid::new(bidder, dec!(1), 1, Utc::now())
    }

    #[test]
    fn each_bid_bumps_the_price_and_resets_the_timer() {
        let config = config();
        let start = Utc::now();
        let mut state = PennyState::new(&config, start);
        let bidder = BidderId::new();

        state.on_bid(&config, &bid_from(bidder), start);
        state.on_bid(&config, &bid_from(bidder), start + Duration::seconds(5));

        assert_eq!(state.current_price, dec!(0.02));
        assert_eq!(state.last_bid_time, start + Duration::seconds(5));
        assert_eq!(state.bid_counts[&bidder], 2);
    }

    #[test]
    fn timeout_only_fires_once_someone_has_bid() {
        let config = config();
        let start = Utc::now();
        let mut state = PennyState::new(&config, start);

        assert!(!state.on_tick(&config, start + Duration::seconds(60)));

        state.on_bid(&config, &bid_from(BidderId::new()), start);
        assert!(!state.on_tick(&config, start + Duration::seconds(9)));
        assert!(state.on_tick(&config, start + Duration::seconds(11)));
    }

    #[test]
    fn last_bidder_wins_and_losers_keep_their_sunk_costs() {
        let config = config();
        let start = Utc::now();
        let mut state = PennyState::new(&config, start);
        let (loser, winner) = (BidderId::new(), BidderId::new());

        state.on_bid(&config, &bid_from(loser), start);
        state.on_bid(&config, &bid_from(loser), start);
        state.on_bid(&config, &bid_from(winner), start);

        let result = finalize(&config, &state, AuctionId::new(), Utc::now());

        assert_eq!(result.winners, vec![winner]);
        assert_eq!(result.clearing_price, dec!(0.03));
        // Winner: price 0.03 plus one bid cost.
        assert_eq!(result.payments[&winner], dec!(0.53));
        // Loser: two sunk bid costs, no allocation.
        assert_eq!(result.payments[&loser], dec!(1.0));
        assert_eq!(result.allocations[&loser], Decimal::ZERO);
        assert!(result.validate());
    }

    #[test]
    fn no_bids_completes_empty() {
        let config = config();
        let state = PennyState::new(&config, Utc::now());

        let result = finalize(&config, &state, AuctionId::new(), Utc::now());

        assert!(result.winners.is_empty());
        assert!(result.payments.is_empty());
    }
}
