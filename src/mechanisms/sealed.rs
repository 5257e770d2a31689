//! Sealed-bid mechanisms: first-price, second-price (Vickrey) and all-pay.
//! All three clear from a single snapshot of the book, so they carry no live
//! state machine.

use super::config::{AllPayConfig, SealedBidConfig};
use super::{allocate_by_rank, reserve_filter, sort_descending, WinningShare};
use crate::errors::MechanismError;
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Highest qualifying amount; the reserve when nothing qualifies.
pub fn determine_clearing_price(qualifying: &[&Bid], reserve: Decimal) -> Decimal {
    qualifying
        .iter()
        .map(|bid| bid.amount)
        .max()
        .unwrap_or(reserve)
}

/// Uniform price for a k-winner Vickrey clearing: the (k+1)-th highest
/// qualifying amount, clamped below to the reserve. A lone qualifying bid
/// pays exactly the reserve.
pub fn determine_second_price(
    qualifying: &[&Bid],
    winner_count: usize,
    reserve: Decimal,
) -> Decimal {
    let mut sorted = qualifying.to_vec();
    sort_descending(&mut sorted);

    sorted
        .get(winner_count)
        .map(|bid| bid.amount.max(reserve))
        .unwrap_or(reserve)
}

/// Winners and their quantity shares, ranked by amount.
pub fn allocate_winners<'a>(
    qualifying: &[&'a Bid],
    config: &SealedBidConfig,
) -> Vec<WinningShare<'a>> {
    allocate_by_rank(
        qualifying,
        config.max_winners,
        config.common.max_quantity,
        &config.common.tie_breaking,
    )
}

/// Each winner pays their own bid, pro-rated when a tie policy handed them
/// a partial fill.
pub fn calculate_payments_first_price(shares: &[WinningShare<'_>]) -> BTreeMap<BidderId, Decimal> {
    let mut payments = BTreeMap::new();
    for share in shares {
        let fraction = share.allocation / Decimal::from(share.bid.quantity);
        *payments.entry(share.bid.bidder_id).or_insert(Decimal::ZERO) +=
            share.bid.amount * fraction;
    }
    payments
}

/// Every winner pays the uniform clearing price per allocated unit.
pub fn calculate_payments_uniform(
    shares: &[WinningShare<'_>],
    clearing_price: Decimal,
) -> BTreeMap<BidderId, Decimal> {
    let mut payments = BTreeMap::new();
    for share in shares {
        *payments.entry(share.bid.bidder_id).or_insert(Decimal::ZERO) +=
            clearing_price * share.allocation;
    }
    payments
}

fn collect_allocations(shares: &[WinningShare<'_>]) -> BTreeMap<BidderId, Decimal> {
    let mut allocations = BTreeMap::new();
    for share in shares {
        *allocations
            .entry(share.bid.bidder_id)
            .or_insert(Decimal::ZERO) += share.allocation;
    }
    allocations
}

fn assemble(
    auction_id: AuctionId,
    clearing_price: Decimal,
    allocations: BTreeMap<BidderId, Decimal>,
    payments: BTreeMap<BidderId, Decimal>,
    now: DateTime<Utc>,
) -> AuctionResult {
    let winners: Vec<BidderId> = allocations
        .iter()
        .filter(|(_, allocation)| **allocation > Decimal::ZERO)
        .map(|(bidder, _)| *bidder)
        .collect();

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

pub fn finalize_first_price(
    config: &SealedBidConfig,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> AuctionResult {
    let reserve = config.common.reserve_price;
    let qualifying = reserve_filter(bids, reserve);
    if qualifying.is_empty() {
        return AuctionResult::empty(auction_id, reserve, now);
    }

    let clearing_price = determine_clearing_price(&qualifying, reserve);
    let shares = allocate_winners(&qualifying, config);
    let payments = calculate_payments_first_price(&shares);
    let allocations = collect_allocations(&shares);

    assemble(auction_id, clearing_price, allocations, payments, now)
}

pub fn finalize_second_price(
    config: &SealedBidConfig,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> AuctionResult {
    let reserve = config.common.reserve_price;
    let qualifying = reserve_filter(bids, reserve);
    if qualifying.is_empty() {
        return AuctionResult::empty(auction_id, reserve, now);
    }

    let shares = allocate_winners(&qualifying, config);
    let clearing_price = determine_second_price(&qualifying, shares.len(), reserve);
    let payments = calculate_payments_uniform(&shares, clearing_price);
    let allocations = collect_allocations(&shares);

    assemble(auction_id, clearing_price, allocations, payments, now)
}

/// All-pay: the ranked prize structure decides who wins, but every
/// qualifying bidder pays. Losers are refunded `refund_rate` of their bid.
pub fn finalize_all_pay(
    config: &AllPayConfig,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> Result<AuctionResult, MechanismError> {
    if config.refund_rate < Decimal::ZERO || config.refund_rate > Decimal::ONE {
        return Err(MechanismError::InvalidParameter(format!(
            "refund_rate {} is outside [0, 1]",
            config.refund_rate
        )));
    }

    let reserve = config.common.reserve_price;
    let qualifying = reserve_filter(bids, reserve);
    if qualifying.is_empty() {
        return Ok(AuctionResult::empty(auction_id, reserve, now));
    }

    let mut ranked = qualifying.clone();
    sort_descending(&mut ranked);
    let clearing_price = ranked[0].amount;

    let max_quantity = Decimal::from(config.common.max_quantity);
    let mut allocations: BTreeMap<BidderId, Decimal> = BTreeMap::new();
    let mut payments: BTreeMap<BidderId, Decimal> = BTreeMap::new();

    for (rank, bid) in ranked.iter().enumerate() {
        let prize = config
            .prize_structure
            .get(rank)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let won = prize > Decimal::ZERO;

        *allocations.entry(bid.bidder_id).or_insert(Decimal::ZERO) += prize * max_quantity;

        // Winners pay in full; losers get the configured fraction back.
        let due = if won {
            bid.amount
        } else {
            bid.amount * (Decimal::ONE - config.refund_rate)
        };
        *payments.entry(bid.bidder_id).or_insert(Decimal::ZERO) += due;
    }

    Ok(assemble(
        auction_id,
        clearing_price,
        allocations,
        payments,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::config::{CommonConfig, TieBreaking};
    use rust_decimal_macros::dec;

    fn bid(amount: Decimal) -> Bid {
        Bid::new(BidderId::new(), amount, 1, Utc::now())
    }

    fn sealed_config(reserve: Decimal) -> SealedBidConfig {
        SealedBidConfig {
            common: CommonConfig::with_reserve(reserve),
            max_winners: 1,
        }
    }

    #[test]
    fn first_price_clears_at_the_highest_bid() {
        let bids = vec![bid(dec!(100)), bid(dec!(150)), bid(dec!(125)), bid(dec!(140))];
        let top = bids[1].bidder_id;

        let result = finalize_first_price(&sealed_config(dec!(90)), AuctionId::new(), &bids, Utc::now());

        assert_eq!(result.clearing_price, dec!(150));
        assert_eq!(result.winners, vec![top]);
        assert_eq!(result.payments[&top], dec!(150));
        assert!(result.validate());
    }

    #[test]
    fn no_qualifying_bid_completes_empty_at_reserve() {
        let bids = vec![bid(dec!(5)), bid(dec!(8))];

        let result = finalize_first_price(&sealed_config(dec!(10)), AuctionId::new(), &bids, Utc::now());

        assert!(result.winners.is_empty());
        assert_eq!(result.clearing_price, dec!(10));
        assert!(result.payments.is_empty());
    }

    #[test]
    fn vickrey_winner_pays_the_second_highest_bid() {
        let bids = vec![bid(dec!(15)), bid(dec!(20)), bid(dec!(12))];
        let top = bids[1].bidder_id;

        let result = finalize_second_price(&sealed_config(dec!(10)), AuctionId::new(), &bids, Utc::now());

        assert_eq!(result.clearing_price, dec!(15));
        assert_eq!(result.winners, vec![top]);
        assert_eq!(result.payments[&top], dec!(15));
    }

    #[test]
    fn vickrey_with_a_single_bid_clears_at_reserve() {
        let bids = vec![bid(dec!(40))];

        let result = finalize_second_price(&sealed_config(dec!(10)), AuctionId::new(), &bids, Utc::now());

        assert_eq!(result.clearing_price, dec!(10));
        assert_eq!(result.payments[&bids[0].bidder_id], dec!(10));
    }

    #[test]
    fn k_winner_vickrey_all_pay_the_k_plus_first_price() {
        let config = SealedBidConfig {
            common: CommonConfig {
                max_quantity: 2,
                ..CommonConfig::with_reserve(dec!(5))
            },
            max_winners: 2,
        };
        let bids = vec![bid(dec!(30)), bid(dec!(25)), bid(dec!(20))];

        let result = finalize_second_price(&config, AuctionId::new(), &bids, Utc::now());

        assert_eq!(result.clearing_price, dec!(20));
        assert_eq!(result.winners.len(), 2);
        for winner in &result.winners {
            assert_eq!(result.payments[winner], dec!(20));
        }
    }

    #[test]
    fn first_price_tie_respects_first_come() {
        let early = Bid::new(BidderId::new(), dec!(50), 1, Utc::now());
        let late = Bid::new(
            BidderId::new(),
            dec!(50),
            1,
            Utc::now() + chrono::Duration::seconds(1),
        );
        let config = SealedBidConfig {
            common: CommonConfig {
                tie_breaking: TieBreaking::FirstCome,
                ..CommonConfig::default()
            },
            max_winners: 1,
        };

        let result = finalize_first_price(
            &config,
            AuctionId::new(),
            &[late.clone(), early.clone()],
            Utc::now(),
        );

        assert_eq!(result.winners, vec![early.bidder_id]);
    }

    #[test]
    fn all_pay_losers_pay_unless_refunded() {
        let config = AllPayConfig {
            common: CommonConfig::default(),
            prize_structure: vec![Decimal::ONE],
            refund_rate: dec!(0.5),
        };
        let bids = vec![bid(dec!(10)), bid(dec!(6))];
        let winner = bids[0].bidder_id;
        let loser = bids[1].bidder_id;

        let result = finalize_all_pay(&config, AuctionId::new(), &bids, Utc::now()).unwrap();

        assert_eq!(result.winners, vec![winner]);
        assert_eq!(result.payments[&winner], dec!(10));
        assert_eq!(result.payments[&loser], dec!(3));
        assert_eq!(result.allocations[&loser], Decimal::ZERO);
        assert!(result.validate());
    }

    #[test]
    fn all_pay_rejects_an_out_of_range_refund_rate() {
        let config = AllPayConfig {
            refund_rate: dec!(1.5),
            ..AllPayConfig::default()
        };

        let result = finalize_all_pay(&config, AuctionId::new(), &[bid(dec!(10))], Utc::now());

        assert!(matches!(result, Err(MechanismError::InvalidParameter(_))));
    }
}
