use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Policy for resolving equal-top bids at the margin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TieBreaking {
    /// Uniform random pick among the tied bids; seeded for reproducibility.
    Random { seed: u64 },
    /// Earliest timestamp wins, ties resolved by bid id order.
    FirstCome,
    /// Each tied bidder receives quantity scaled by their share of the
    /// summed tied quantity.
    Proportional,
}

impl Default for TieBreaking {
    fn default() -> Self {
        TieBreaking::FirstCome
    }
}

fn default_max_quantity() -> u64 {
    1
}

/// Options every mechanism accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(default)]
    pub reserve_price: Decimal,
    #[serde(default)]
    pub tie_breaking: TieBreaking,
    #[serde(default = "default_max_quantity")]
    pub max_quantity: u64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            reserve_price: Decimal::ZERO,
            tie_breaking: TieBreaking::default(),
            max_quantity: default_max_quantity(),
            start_time: None,
            end_time: None,
        }
    }
}

impl CommonConfig {
    pub fn with_reserve(reserve_price: Decimal) -> Self {
        Self {
            reserve_price,
            ..Self::default()
        }
    }
}

fn default_max_winners() -> usize {
    1
}

/// Shared by first-price and second-price sealed auctions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBidConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default = "default_max_winners")]
    pub max_winners: usize,
}

impl Default for SealedBidConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            max_winners: default_max_winners(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutchConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub starting_price: Decimal,
    pub decrement: Decimal,
    pub floor_price: Decimal,
    pub tick_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnglishConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub starting_price: Decimal,
    pub increment: Decimal,
    pub inactive_duration_ms: u64,
}

fn default_min_active_bidders() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JapaneseConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub starting_price: Decimal,
    pub increment: Decimal,
    #[serde(default = "default_min_active_bidders")]
    pub min_active_bidders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    /// Seed for the terminal-instant draw; the sampled instant itself is
    /// never exposed to bidders.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PennyConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub bid_increment: Decimal,
    pub bid_cost: Decimal,
    pub inactive_duration_ms: u64,
}

fn default_prize_structure() -> Vec<Decimal> {
    vec![Decimal::ONE]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllPayConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Quantity share awarded per rank, highest bidder first.
    #[serde(default = "default_prize_structure")]
    pub prize_structure: Vec<Decimal>,
    /// Fraction of a losing bid refunded, in [0, 1].
    #[serde(default)]
    pub refund_rate: Decimal,
}

impl Default for AllPayConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            prize_structure: default_prize_structure(),
            refund_rate: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceRule {
    /// Both sides trade at the midpoint of the marginal buy and sell.
    Uniform,
    /// Each side pays (receives) its own bid.
    Discriminatory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub price_rule: PriceRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRule {
    FirstPrice,
    Vcg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinatorialConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// The finite item set bundles may draw from.
    pub items: BTreeSet<String>,
    pub payment_rule: PaymentRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    FirstPrice,
    SecondPrice,
    Dutch,
    English,
    Japanese,
    Candle,
    Penny,
    AllPay,
    Double,
    Combinatorial,
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MechanismKind::FirstPrice => "first_price",
            MechanismKind::SecondPrice => "second_price",
            MechanismKind::Dutch => "dutch",
            MechanismKind::English => "english",
            MechanismKind::Japanese => "japanese",
            MechanismKind::Candle => "candle",
            MechanismKind::Penny => "penny",
            MechanismKind::AllPay => "all_pay",
            MechanismKind::Double => "double",
            MechanismKind::Combinatorial => "combinatorial",
        };
        f.write_str(tag)
    }
}

/// The unified configuration facade: one typed variant per mechanism,
/// dispatched on by the kernel and carried by workflow nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mechanism", rename_all = "snake_case")]
pub enum MechanismConfig {
    FirstPrice(SealedBidConfig),
    SecondPrice(SealedBidConfig),
    Dutch(DutchConfig),
    English(EnglishConfig),
    Japanese(JapaneseConfig),
    Candle(CandleConfig),
    Penny(PennyConfig),
    AllPay(AllPayConfig),
    Double(DoubleConfig),
    Combinatorial(CombinatorialConfig),
}

impl MechanismConfig {
    pub fn kind(&self) -> MechanismKind {
        match self {
            MechanismConfig::FirstPrice(_) => MechanismKind::FirstPrice,
            MechanismConfig::SecondPrice(_) => MechanismKind::SecondPrice,
            MechanismConfig::Dutch(_) => MechanismKind::Dutch,
            MechanismConfig::English(_) => MechanismKind::English,
            MechanismConfig::Japanese(_) => MechanismKind::Japanese,
            MechanismConfig::Candle(_) => MechanismKind::Candle,
            MechanismConfig::Penny(_) => MechanismKind::Penny,
            MechanismConfig::AllPay(_) => MechanismKind::AllPay,
            MechanismConfig::Double(_) => MechanismKind::Double,
            MechanismConfig::Combinatorial(_) => MechanismKind::Combinatorial,
        }
    }

    pub fn common(&self) -> &CommonConfig {
        match self {
            MechanismConfig::FirstPrice(config) | MechanismConfig::SecondPrice(config) => {
                &config.common
            }
            MechanismConfig::Dutch(config) => &config.common,
            MechanismConfig::English(config) => &config.common,
            MechanismConfig::Japanese(config) => &config.common,
            MechanismConfig::Candle(config) => &config.common,
            MechanismConfig::Penny(config) => &config.common,
            MechanismConfig::AllPay(config) => &config.common,
            MechanismConfig::Double(config) => &config.common,
            MechanismConfig::Combinatorial(config) => &config.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonConfig {
        match self {
            MechanismConfig::FirstPrice(config) | MechanismConfig::SecondPrice(config) => {
                &mut config.common
            }
            MechanismConfig::Dutch(config) => &mut config.common,
            MechanismConfig::English(config) => &mut config.common,
            MechanismConfig::Japanese(config) => &mut config.common,
            MechanismConfig::Candle(config) => &mut config.common,
            MechanismConfig::Penny(config) => &mut config.common,
            MechanismConfig::AllPay(config) => &mut config.common,
            MechanismConfig::Double(config) => &mut config.common,
            MechanismConfig::Combinatorial(config) => &mut config.common,
        }
    }

    /// Shorthand for the common first-price case with only a reserve.
    pub fn first_price(reserve_price: Decimal) -> Self {
        MechanismConfig::FirstPrice(SealedBidConfig {
            common: CommonConfig::with_reserve(reserve_price),
            ..SealedBidConfig::default()
        })
    }

    pub fn second_price(reserve_price: Decimal) -> Self {
        MechanismConfig::SecondPrice(SealedBidConfig {
            common: CommonConfig::with_reserve(reserve_price),
            ..SealedBidConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn facade_reports_kind_and_common_options() {
        let config = MechanismConfig::first_price(dec!(90));

        assert_eq!(config.kind(), MechanismKind::FirstPrice);
        assert_eq!(config.kind().to_string(), "first_price");
        assert_eq!(config.common().reserve_price, dec!(90));
        assert_eq!(config.common().max_quantity, 1);
    }

    #[test]
    fn facade_round_trips_through_serde() {
        let config = MechanismConfig::Dutch(DutchConfig {
            common: CommonConfig::default(),
            starting_price: dec!(100),
            decrement: dec!(5),
            floor_price: dec!(50),
            tick_duration_ms: 1_000,
        });

        let encoded = serde_json::to_string(&config).unwrap();
        assert!(encoded.contains("\"mechanism\":\"dutch\""));

        let decoded: MechanismConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }
}
