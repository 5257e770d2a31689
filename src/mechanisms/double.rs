//! Sealed-bid double auction. Buys and sells are matched bid-for-bid: the
//! clearing quantity is the largest prefix where the k-th highest buy still
//! covers the k-th lowest sell. Sellers' payments are negative (they are
//! paid out).

use super::config::{DoubleConfig, PriceRule};
use super::reserve_filter;
use crate::errors::MechanismError;
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

fn two() -> Decimal {
    Decimal::from(2)
}

/// Splits the book into buys (descending) and sells (ascending). A bid
/// without the `is_buy` flag poisons the whole clearing.
pub fn partition_sides<'a>(bids: &[&'a Bid]) -> Result<(Vec<&'a Bid>, Vec<&'a Bid>), MechanismError> {
    let mut buys = Vec::new();
    let mut sells = Vec::new();

    for bid in bids {
        match bid.is_buy() {
            Some(true) => buys.push(*bid),
            Some(false) => sells.push(*bid),
            None => return Err(MechanismError::MissingSide(bid.id.to_string())),
        }
    }

    buys.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.id.cmp(&b.id))
    });
    sells.sort_by(|a, b| {
        a.amount
            .cmp(&b.amount)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.id.cmp(&b.id))
    });

    Ok((buys, sells))
}

/// Largest k such that `buys[k-1].amount >= sells[k-1].amount`.
pub fn crossing_quantity(buys: &[&Bid], sells: &[&Bid]) -> usize {
    let mut k = 0;
    while k < buys.len() && k < sells.len() && buys[k].amount >= sells[k].amount {
        k += 1;
    }
    k
}

/// Midpoint of the marginal matched buy and sell.
pub fn determine_clearing_price(buys: &[&Bid], sells: &[&Bid], k: usize, reserve: Decimal) -> Decimal {
    if k == 0 {
        return reserve;
    }
    (buys[k - 1].amount + sells[k - 1].amount) / two()
}

pub fn finalize(
    config: &DoubleConfig,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> Result<AuctionResult, MechanismError> {
    let reserve = config.common.reserve_price;
    let qualifying = reserve_filter(bids, reserve);
    let (buys, sells) = partition_sides(&qualifying)?;

    let crossing = crossing_quantity(&buys, &sells);
    // Matched pairs are additionally capped by the tradeable quantity.
    let k = crossing.min(config.common.max_quantity as usize);
    if k == 0 {
        return Ok(AuctionResult::empty(auction_id, reserve, now));
    }

    let clearing_price = determine_clearing_price(&buys, &sells, k, reserve);

    let mut winners: Vec<BidderId> = Vec::new();
    let mut allocations: BTreeMap<BidderId, Decimal> = BTreeMap::new();
    let mut payments: BTreeMap<BidderId, Decimal> = BTreeMap::new();

    for (buy, sell) in buys[..k].iter().zip(sells[..k].iter()) {
        let (buyer_pays, seller_receives) = match config.price_rule {
            PriceRule::Uniform => (clearing_price, clearing_price),
            PriceRule::Discriminatory => (buy.amount, sell.amount),
        };

        // One lot changes hands per matched pair; the seller's allocation
        // stays zero because goods flow away from them.
        *allocations.entry(buy.bidder_id).or_insert(Decimal::ZERO) += Decimal::ONE;
        allocations.entry(sell.bidder_id).or_insert(Decimal::ZERO);
        *payments.entry(buy.bidder_id).or_insert(Decimal::ZERO) += buyer_pays;
        *payments.entry(sell.bidder_id).or_insert(Decimal::ZERO) -= seller_receives;

        if !winners.contains(&buy.bidder_id) {
            winners.push(buy.bidder_id);
        }
        if !winners.contains(&sell.bidder_id) {
            winners.push(sell.bidder_id);
        }
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("matched_pairs".to_string(), serde_json::json!(k));

    Ok(AuctionResult {
        auction_id,
        clearing_price,
        winners,
        allocations,
        payments,
        timestamp: now,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::config::CommonConfig;
    use crate::types::METADATA_IS_BUY;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn config(price_rule: PriceRule, max_quantity: u64) -> DoubleConfig {
        DoubleConfig {
            common: CommonConfig {
                max_quantity,
                ..CommonConfig::default()
            },
            price_rule,
        }
    }

    fn order(amount: Decimal, is_buy: bool) -> Bid {
        Bid::new(BidderId::new(), amount, 1, Utc::now())
            .with_metadata(METADATA_IS_BUY, json!(is_buy))
    }

    #[test]
    fn matched_buys_and_sells_have_equal_cardinality() {
        let bids = vec![
            order(dec!(10), true),
            order(dec!(9), true),
            order(dec!(4), true),
            order(dec!(5), false),
            order(dec!(8), false),
            order(dec!(12), false),
        ];

        let result = finalize(&config(PriceRule::Uniform, 10), AuctionId::new(), &bids, Utc::now()).unwrap();

        assert_eq!(result.metadata["matched_pairs"], json!(2));
        let buyers_allocated = result
            .allocations
            .values()
            .filter(|allocation| **allocation > Decimal::ZERO)
            .count();
        assert_eq!(buyers_allocated, 2);
        assert_eq!(result.winners.len(), 4);
    }

    #[test]
    fn uniform_rule_clears_at_the_marginal_midpoint() {
        let bids = vec![
            order(dec!(10), true),
            order(dec!(9), true),
            order(dec!(5), false),
            order(dec!(8), false),
        ];

        let result = finalize(&config(PriceRule::Uniform, 10), AuctionId::new(), &bids, Utc::now()).unwrap();

        // Marginal pair is buy 9 / sell 8: midpoint 8.5.
        assert_eq!(result.clearing_price, dec!(8.5));
        let paid: Decimal = result.payments.values().copied().sum();
        // Uniform price: buyers pay exactly what sellers receive.
        assert_eq!(paid, Decimal::ZERO);
    }

    #[test]
    fn discriminatory_rule_charges_each_side_its_own_bid() {
        let buy = order(dec!(10), true);
        let sell = order(dec!(6), false);
        let buyer = buy.bidder_id;
        let seller = sell.bidder_id;

        let result = finalize(
            &config(PriceRule::Discriminatory, 10),
            AuctionId::new(),
            &[buy, sell],
            Utc::now(),
        )
        .unwrap();

        assert_eq!(result.payments[&buyer], dec!(10));
        assert_eq!(result.payments[&seller], dec!(-6));
    }

    #[test]
    fn uncrossed_books_complete_empty() {
        let bids = vec![order(dec!(5), true), order(dec!(9), false)];

        let result = finalize(&config(PriceRule::Uniform, 10), AuctionId::new(), &bids, Utc::now()).unwrap();

        assert!(result.winners.is_empty());
        assert!(result.payments.is_empty());
    }

    #[test]
    fn missing_side_flag_is_a_mechanism_error() {
        let flagless = Bid::new(BidderId::new(), dec!(5), 1, Utc::now());

        let result = finalize(&config(PriceRule::Uniform, 10), AuctionId::new(), &[flagless], Utc::now());

        assert!(matches!(result, Err(MechanismError::MissingSide(_))));
    }

    #[test]
    fn matched_pairs_are_capped_by_max_quantity() {
        let bids = vec![
            order(dec!(10), true),
            order(dec!(9), true),
            order(dec!(1), false),
            order(dec!(2), false),
        ];

        let result = finalize(&config(PriceRule::Uniform, 1), AuctionId::new(), &bids, Utc::now()).unwrap();

        assert_eq!(result.metadata["matched_pairs"], json!(1));
        let allocated: Decimal = result.allocations.values().copied().sum();
        assert_eq!(allocated, Decimal::ONE);
    }
}
