//! Candle auction: first-price clearing at a terminal instant drawn
//! uniformly from `[min_duration, max_duration]` when the auction starts.
//! Bids landing after the flame went out stay in the book but never clear.

use super::config::{CandleConfig, SealedBidConfig};
use super::{sealed, seeded_range};
use crate::types::{AuctionId, AuctionResult, Bid};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct CandleState {
    /// Sampled once at start; never revealed to bidders.
    pub terminal_instant: DateTime<Utc>,
}

impl CandleState {
    pub fn new(config: &CandleConfig, started_at: DateTime<Utc>) -> Self {
        let duration_ms = seeded_range(config.seed, config.min_duration_ms, config.max_duration_ms);
        Self {
            terminal_instant: started_at + Duration::milliseconds(duration_ms as i64),
        }
    }

    pub fn on_tick(&mut self, now: DateTime<Utc>) -> bool {
        now > self.terminal_instant
    }
}

pub fn finalize(
    config: &CandleConfig,
    state: &CandleState,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> AuctionResult {
    let timely: Vec<Bid> = bids
        .iter()
        .filter(|bid| bid.timestamp <= state.terminal_instant)
        .cloned()
        .collect();

    let as_first_price = SealedBidConfig {
        common: config.common.clone(),
        max_winners: 1,
    };
    sealed::finalize_first_price(&as_first_price, auction_id, &timely, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::config::CommonConfig;
    use crate::types::BidderId;
    use rust_decimal_macros::dec;

    fn config(seed: u64) -> CandleConfig {
        CandleConfig {
            common: CommonConfig::with_reserve(dec!(10)),
            min_duration_ms: 5_000,
            max_duration_ms: 15_000,
            seed,
        }
    }

    #[test]
    fn terminal_instant_is_reproducible_for_a_fixed_seed() {
        let start = Utc::now();
        let first = CandleState::new(&config(9), start);
        let second = CandleState::new(&config(9), start);

        assert_eq!(first.terminal_instant, second.terminal_instant);
        let offset = first.terminal_instant - start;
        assert!(offset >= Duration::milliseconds(5_000));
        assert!(offset <= Duration::milliseconds(15_000));
    }

    #[test]
    fn bids_after_the_flame_are_excluded_from_clearing() {
        let start = Utc::now();
        let config = config(3);
        let state = CandleState::new(&config, start);

        let timely = Bid::new(BidderId::new(), dec!(20), 1, start + Duration::seconds(1));
        let late = Bid::new(
            BidderId::new(),
            dec!(100),
            1,
            state.terminal_instant + Duration::seconds(1),
        );

        let result = finalize(
            &config,
            &state,
            AuctionId::new(),
            &[timely.clone(), late],
            state.terminal_instant + Duration::seconds(5),
        );

        assert_eq!(result.winners, vec![timely.bidder_id]);
        assert_eq!(result.clearing_price, dec!(20));
    }

    #[test]
    fn tick_fires_only_after_the_terminal_instant() {
        let start = Utc::now();
        let config = config(3);
        let mut state = CandleState::new(&config, start);
        let terminal = state.terminal_instant;

        assert!(!state.on_tick(terminal));
        assert!(state.on_tick(terminal + Duration::milliseconds(1)));
    }
}
