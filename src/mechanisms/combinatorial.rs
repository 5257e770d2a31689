//! Combinatorial auction: each bid names a bundle of items and the winning
//! set is the disjoint collection of bundles with maximal summed value
//! (weighted set packing). The solver sits behind a trait so an ILP backend
//! can be plugged in; the default is a best-first branch and bound, which
//! keeps the core solver-free.

use super::config::{CombinatorialConfig, PaymentRule};
use super::reserve_filter;
use crate::errors::MechanismError;
use crate::types::{AuctionId, AuctionResult, Bid, BidderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Maximum distinct items; bundles are packed into a 64-bit occupancy mask.
pub const MAX_ITEMS: usize = 64;

/// A parsed bundle bid, ready for the solver.
#[derive(Debug, Clone)]
pub struct BundleBid {
    pub bidder_id: BidderId,
    pub amount: Decimal,
    pub mask: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SolverSolution {
    /// Indices into the slice handed to `solve`.
    pub chosen: Vec<usize>,
    pub value: Decimal,
}

pub trait SetPackingSolver: Send + Sync {
    fn solve(&self, bids: &[BundleBid]) -> SolverSolution;
}

/// Best-first branch and bound over bids sorted by descending amount, with
/// a remaining-value upper bound for pruning. Exact for the instance sizes
/// the engine is meant for (a few dozen bids).
#[derive(Debug, Default, Clone, Copy)]
pub struct BranchAndBoundSolver;

impl BranchAndBoundSolver {
    fn search(
        bids: &[BundleBid],
        order: &[usize],
        suffix_value: &[Decimal],
        position: usize,
        used_mask: u64,
        value: Decimal,
        chosen: &mut Vec<usize>,
        best: &mut SolverSolution,
    ) {
        if value > best.value {
            best.value = value;
            best.chosen = chosen.clone();
        }
        if position == order.len() {
            return;
        }
        // Even taking every remaining bid cannot beat the incumbent.
        if value + suffix_value[position] <= best.value {
            return;
        }

        let index = order[position];
        let bid = &bids[index];

        if bid.mask & used_mask == 0 {
            chosen.push(index);
            Self::search(
                bids,
                order,
                suffix_value,
                position + 1,
                used_mask | bid.mask,
                value + bid.amount,
                chosen,
                best,
            );
            chosen.pop();
        }

        Self::search(
            bids,
            order,
            suffix_value,
            position + 1,
            used_mask,
            value,
            chosen,
            best,
        );
    }
}

impl SetPackingSolver for BranchAndBoundSolver {
    fn solve(&self, bids: &[BundleBid]) -> SolverSolution {
        let mut order: Vec<usize> = (0..bids.len()).collect();
        order.sort_by(|a, b| bids[*b].amount.cmp(&bids[*a].amount));

        let mut suffix_value = vec![Decimal::ZERO; order.len() + 1];
        for position in (0..order.len()).rev() {
            suffix_value[position] = suffix_value[position + 1] + bids[order[position]].amount;
        }

        let mut best = SolverSolution::default();
        let mut chosen = Vec::new();
        Self::search(
            bids,
            &order,
            &suffix_value,
            0,
            0,
            Decimal::ZERO,
            &mut chosen,
            &mut best,
        );
        best
    }
}

fn parse_bundles(
    config: &CombinatorialConfig,
    qualifying: &[&Bid],
) -> Result<Vec<BundleBid>, MechanismError> {
    if config.items.len() > MAX_ITEMS {
        return Err(MechanismError::InvalidParameter(format!(
            "item set of {} exceeds the supported maximum of {}",
            config.items.len(),
            MAX_ITEMS
        )));
    }

    let item_bits: BTreeMap<&str, u64> = config
        .items
        .iter()
        .enumerate()
        .map(|(position, item)| (item.as_str(), 1u64 << position))
        .collect();

    let mut parsed = Vec::with_capacity(qualifying.len());
    for bid in qualifying {
        let bundle = bid
            .bundle()
            .ok_or_else(|| MechanismError::MissingBundle(bid.id.to_string()))?;

        let mut mask = 0u64;
        for item in &bundle {
            let bit = item_bits
                .get(item.as_str())
                .ok_or_else(|| MechanismError::UnknownItem {
                    bid_id: bid.id.to_string(),
                    item: item.clone(),
                })?;
            mask |= bit;
        }

        parsed.push(BundleBid {
            bidder_id: bid.bidder_id,
            amount: bid.amount,
            mask,
        });
    }
    Ok(parsed)
}

fn winning_value_per_bidder(
    bids: &[BundleBid],
    solution: &SolverSolution,
) -> BTreeMap<BidderId, Decimal> {
    let mut values = BTreeMap::new();
    for index in &solution.chosen {
        let bid = &bids[*index];
        *values.entry(bid.bidder_id).or_insert(Decimal::ZERO) += bid.amount;
    }
    values
}

/// The externality a winner imposes: how much better off everyone else
/// would be if the winner's bids were withdrawn.
fn vcg_payments(
    bids: &[BundleBid],
    solution: &SolverSolution,
    solver: &dyn SetPackingSolver,
) -> BTreeMap<BidderId, Decimal> {
    let won = winning_value_per_bidder(bids, solution);
    let mut payments = BTreeMap::new();

    for (bidder, value_won) in &won {
        let others: Vec<BundleBid> = bids
            .iter()
            .filter(|bid| bid.bidder_id != *bidder)
            .cloned()
            .collect();
        let without = solver.solve(&others);

        let others_welfare_now = solution.value - *value_won;
        let payment = (without.value - others_welfare_now).max(Decimal::ZERO);
        payments.insert(*bidder, payment);
    }
    payments
}

pub fn finalize(
    config: &CombinatorialConfig,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> Result<AuctionResult, MechanismError> {
    finalize_with_solver(config, &BranchAndBoundSolver, auction_id, bids, now)
}

pub fn finalize_with_solver(
    config: &CombinatorialConfig,
    solver: &dyn SetPackingSolver,
    auction_id: AuctionId,
    bids: &[Bid],
    now: DateTime<Utc>,
) -> Result<AuctionResult, MechanismError> {
    let reserve = config.common.reserve_price;
    let qualifying = reserve_filter(bids, reserve);
    if qualifying.is_empty() {
        return Ok(AuctionResult::empty(auction_id, reserve, now));
    }

    let parsed = parse_bundles(config, &qualifying)?;
    let solution = solver.solve(&parsed);
    if solution.chosen.is_empty() {
        return Ok(AuctionResult::empty(auction_id, reserve, now));
    }

    let mut allocations: BTreeMap<BidderId, Decimal> = BTreeMap::new();
    for index in &solution.chosen {
        *allocations
            .entry(parsed[*index].bidder_id)
            .or_insert(Decimal::ZERO) += Decimal::ONE;
    }

    let payments = match config.payment_rule {
        PaymentRule::FirstPrice => winning_value_per_bidder(&parsed, &solution),
        PaymentRule::Vcg => vcg_payments(&parsed, &solution, solver),
    };

    let winners: Vec<BidderId> = allocations.keys().copied().collect();
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "winning_value".to_string(),
        serde_json::json!(solution.value.to_string()),
    );

    Ok(AuctionResult {
        auction_id,
        // The clearing "price" of a packing is the value of the winning set.
        clearing_price: solution.value,
        winners,
        allocations,
        payments,
        timestamp: now,
        metadata,
    })
}
