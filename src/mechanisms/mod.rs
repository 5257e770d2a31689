pub mod candle;
pub mod combinatorial;
pub mod config;
pub mod double;
pub mod dutch;
pub mod english;
pub mod japanese;
pub mod penny;
pub mod sealed;

use crate::errors::{BidError, MechanismError};
use crate::types::{AuctionId, AuctionResult, Bid};
use chrono::{DateTime, Utc};
use config::{MechanismConfig, TieBreaking};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

/// What a mechanism decided about an incoming bid.
#[derive(Debug, Clone, PartialEq)]
pub enum BidDisposition {
    Accepted,
    /// Accepted, and the bid pushed the auction over its clearing condition
    /// (dutch demand reached, japanese field collapsed). The actor reacts by
    /// enqueueing a finalize to itself.
    AcceptedTriggersClearing,
    Rejected(BidError),
}

/// Bids at or above the reserve, in submission order. Anything strictly
/// below reserve never reaches a clearing routine.
pub fn reserve_filter<'a>(bids: &'a [Bid], reserve: Decimal) -> Vec<&'a Bid> {
    bids.iter().filter(|bid| bid.amount >= reserve).collect()
}

/// Descending by amount; equal amounts keep submission order (timestamp,
/// then id) so ranking is deterministic before any tie policy applies.
pub fn sort_descending(bids: &mut [&Bid]) {
    bids.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.id.cmp(&b.id))
    });
}

/// A winning bid and the quantity it was allocated.
#[derive(Debug, Clone)]
pub struct WinningShare<'a> {
    pub bid: &'a Bid,
    pub allocation: Decimal,
}

/// Ranks `qualifying` descending and allocates quantity down the book until
/// `max_winners` or `max_quantity` is exhausted. The tie policy only comes
/// into play for the marginal group of equal-amount bids that does not fit
/// whole.
pub fn allocate_by_rank<'a>(
    qualifying: &[&'a Bid],
    max_winners: usize,
    max_quantity: u64,
    tie_breaking: &TieBreaking,
) -> Vec<WinningShare<'a>> {
    let mut sorted: Vec<&Bid> = qualifying.to_vec();
    sort_descending(&mut sorted);

    let mut shares: Vec<WinningShare<'a>> = Vec::new();
    let mut remaining_quantity = Decimal::from(max_quantity);
    let mut remaining_slots = max_winners;

    let mut index = 0;
    while index < sorted.len() && remaining_slots > 0 && remaining_quantity > Decimal::ZERO {
        // Group of equal-amount bids starting at `index`.
        let amount = sorted[index].amount;
        let mut end = index;
        while end < sorted.len() && sorted[end].amount == amount {
            end += 1;
        }
        let group = &sorted[index..end];
        let group_quantity: Decimal = group.iter().map(|bid| Decimal::from(bid.quantity)).sum();

        if group.len() <= remaining_slots && group_quantity <= remaining_quantity {
            for bid in group.iter().copied() {
                let allocation = Decimal::from(bid.quantity);
                remaining_quantity -= allocation;
                remaining_slots -= 1;
                shares.push(WinningShare { bid, allocation });
            }
            index = end;
            continue;
        }

        // Marginal group: not everyone fits, the tie policy decides.
        match tie_breaking {
            TieBreaking::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let chosen = group[rng.gen_range(0..group.len())];
                let allocation = Decimal::from(chosen.quantity).min(remaining_quantity);
                shares.push(WinningShare {
                    bid: chosen,
                    allocation,
                });
            }
            TieBreaking::FirstCome => {
                let mut ordered = group.to_vec();
                ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
                for bid in ordered {
                    if remaining_slots == 0 || remaining_quantity <= Decimal::ZERO {
                        break;
                    }
                    let allocation = Decimal::from(bid.quantity).min(remaining_quantity);
                    remaining_quantity -= allocation;
                    remaining_slots -= 1;
                    shares.push(WinningShare { bid, allocation });
                }
            }
            TieBreaking::Proportional => {
                for bid in group.iter().copied() {
                    let share = Decimal::from(bid.quantity) / group_quantity;
                    shares.push(WinningShare {
                        bid,
                        allocation: remaining_quantity * share,
                    });
                }
            }
        }
        break;
    }

    shares.retain(|share| share.allocation > Decimal::ZERO);
    shares
}

/// Uniform draw from `[min, max]`, seeded. Used by the candle terminal
/// instant; tie-breaking seeds its own generator.
pub(crate) fn seeded_range(seed: u64, min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    StdRng::seed_from_u64(seed).gen_range(min..=max)
}

/// Per-mechanism live state, owned by the auction actor alongside the bid
/// book. Sealed mechanisms carry none.
#[derive(Debug, Clone)]
pub enum MechanismState {
    Sealed,
    Dutch(dutch::DutchState),
    English(english::EnglishState),
    Japanese(japanese::JapaneseState),
    Candle(candle::CandleState),
    Penny(penny::PennyState),
}

impl MechanismState {
    pub fn for_config(config: &MechanismConfig, started_at: DateTime<Utc>) -> Self {
        match config {
            MechanismConfig::Dutch(dutch) => {
                MechanismState::Dutch(dutch::DutchState::new(dutch, started_at))
            }
            MechanismConfig::English(english) => {
                MechanismState::English(english::EnglishState::new(english, started_at))
            }
            MechanismConfig::Japanese(japanese) => {
                MechanismState::Japanese(japanese::JapaneseState::new(japanese))
            }
            MechanismConfig::Candle(candle) => {
                MechanismState::Candle(candle::CandleState::new(candle, started_at))
            }
            MechanismConfig::Penny(penny) => {
                MechanismState::Penny(penny::PennyState::new(penny, started_at))
            }
            _ => MechanismState::Sealed,
        }
    }

    /// Mechanism-level acceptance check and state advance for an incoming
    /// bid. `book` holds the already-accepted bids, without `bid`.
    pub fn on_bid(
        &mut self,
        config: &MechanismConfig,
        book: &[Bid],
        bid: &Bid,
        now: DateTime<Utc>,
    ) -> BidDisposition {
        match (self, config) {
            (MechanismState::Dutch(state), MechanismConfig::Dutch(dutch)) => {
                state.on_bid(dutch, book, bid, now)
            }
            (MechanismState::English(state), MechanismConfig::English(english)) => {
                state.on_bid(english, bid, now)
            }
            (MechanismState::Japanese(state), MechanismConfig::Japanese(japanese)) => {
                state.on_bid(japanese, bid)
            }
            (MechanismState::Penny(state), MechanismConfig::Penny(penny)) => {
                state.on_bid(penny, bid, now)
            }
            // Sealed mechanisms and candle accept anything the actor let
            // through; candle filters late bids at clearing time instead.
            _ => BidDisposition::Accepted,
        }
    }

    /// Clock-driven advance. True means the auction should finalize now.
    pub fn on_tick(&mut self, config: &MechanismConfig, book: &[Bid], now: DateTime<Utc>) -> bool {
        match (self, config) {
            (MechanismState::Dutch(state), MechanismConfig::Dutch(dutch)) => {
                state.on_tick(dutch, book, now)
            }
            (MechanismState::English(state), MechanismConfig::English(english)) => {
                state.on_tick(english, now)
            }
            (MechanismState::Candle(state), _) => state.on_tick(now),
            (MechanismState::Penny(state), MechanismConfig::Penny(penny)) => {
                state.on_tick(penny, now)
            }
            _ => false,
        }
    }
}

/// Dispatches to the mechanism-specific clearing routine.
pub fn finalize(
    config: &MechanismConfig,
    state: &MechanismState,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> Result<AuctionResult, MechanismError> {
    match (config, state) {
        (MechanismConfig::FirstPrice(sealed), _) => {
            Ok(sealed::finalize_first_price(sealed, auction_id, bids, now))
        }
        (MechanismConfig::SecondPrice(sealed), _) => {
            Ok(sealed::finalize_second_price(sealed, auction_id, bids, now))
        }
        (MechanismConfig::AllPay(all_pay), _) => {
            sealed::finalize_all_pay(all_pay, auction_id, bids, now)
        }
        (MechanismConfig::Dutch(dutch), MechanismState::Dutch(state)) => {
            Ok(dutch::finalize(dutch, state, auction_id, bids, now))
        }
        (MechanismConfig::English(english), MechanismState::English(state)) => {
            Ok(english::finalize(english, state, auction_id, bids, now))
        }
        (MechanismConfig::Japanese(japanese), MechanismState::Japanese(state)) => {
            Ok(japanese::finalize(japanese, state, auction_id, now))
        }
        (MechanismConfig::Candle(candle), MechanismState::Candle(state)) => {
            Ok(candle::finalize(candle, state, auction_id, bids, now))
        }
        (MechanismConfig::Penny(penny), MechanismState::Penny(state)) => {
            Ok(penny::finalize(penny, state, auction_id, now))
        }
        (MechanismConfig::Double(double), _) => double::finalize(double, auction_id, bids, now),
        (MechanismConfig::Combinatorial(combinatorial), _) => {
            combinatorial::finalize(combinatorial, auction_id, bids, now)
        }
        (config, state) => Err(MechanismError::InvalidParameter(format!(
            "mechanism state {:?} does not match config {}",
            state,
            config.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BidderId;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn bid_at(amount: Decimal, quantity: u64, offset_ms: i64) -> Bid {
        Bid::new(
            BidderId::new(),
            amount,
            quantity,
            Utc::now() + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn reserve_filter_drops_strictly_lower_bids() {
        let bids = vec![bid_at(dec!(5), 1, 0), bid_at(dec!(10), 1, 1), bid_at(dec!(15), 1, 2)];

        let qualifying = reserve_filter(&bids, dec!(10));

        assert_eq!(qualifying.len(), 2);
        assert!(qualifying.iter().all(|bid| bid.amount >= dec!(10)));
    }

    #[test]
    fn first_come_tie_goes_to_the_earliest_bid() {
        let early = bid_at(dec!(20), 1, 0);
        let late = bid_at(dec!(20), 1, 500);
        let bids = vec![&late, &early];

        let shares = allocate_by_rank(&bids, 1, 1, &TieBreaking::FirstCome);

        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].bid.id, early.id);
    }

    #[test]
    fn random_tie_is_reproducible_for_a_fixed_seed() {
        let a = bid_at(dec!(20), 1, 0);
        let b = bid_at(dec!(20), 1, 1);
        let bids = vec![&a, &b];

        let first = allocate_by_rank(&bids, 1, 1, &TieBreaking::Random { seed: 7 });
        let second = allocate_by_rank(&bids, 1, 1, &TieBreaking::Random { seed: 7 });

        assert_eq!(first[0].bid.id, second[0].bid.id);
    }

    #[test]
    fn proportional_tie_splits_by_quantity_share() {
        let a = bid_at(dec!(20), 3, 0);
        let b = bid_at(dec!(20), 1, 1);
        let bids = vec![&a, &b];

        let shares = allocate_by_rank(&bids, 2, 2, &TieBreaking::Proportional);

        assert_eq!(shares.len(), 2);
        let total: Decimal = shares.iter().map(|share| share.allocation).sum();
        assert_eq!(total, dec!(2));
        let a_share = shares.iter().find(|share| share.bid.id == a.id).unwrap();
        assert_eq!(a_share.allocation, dec!(1.5));
    }

    #[test]
    fn allocation_never_exceeds_max_quantity() {
        let bids_owned = vec![bid_at(dec!(30), 4, 0), bid_at(dec!(25), 4, 1), bid_at(dec!(20), 4, 2)];
        let bids: Vec<&Bid> = bids_owned.iter().collect();

        let shares = allocate_by_rank(&bids, 10, 6, &TieBreaking::FirstCome);

        let total: Decimal = shares.iter().map(|share| share.allocation).sum();
        assert!(total <= dec!(6));
    }

    #[test]
    fn non_marginal_groups_bypass_the_tie_policy() {
        let top = bid_at(dec!(30), 1, 0);
        let tied_a = bid_at(dec!(20), 1, 1);
        let tied_b = bid_at(dec!(20), 1, 2);
        let bids = vec![&top, &tied_a, &tied_b];

        let shares = allocate_by_rank(&bids, 3, 3, &TieBreaking::Random { seed: 1 });

        // Everyone fits, so the tied pair is not actually at the margin.
        assert_eq!(shares.len(), 3);
    }

    #[test]
    fn seeded_range_is_deterministic_and_bounded() {
        let first = seeded_range(42, 100, 200);
        let second = seeded_range(42, 100, 200);

        assert_eq!(first, second);
        assert!((100..=200).contains(&first));
        assert_eq!(seeded_range(42, 150, 150), 150);
    }
}
