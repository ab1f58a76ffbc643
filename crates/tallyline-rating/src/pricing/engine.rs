//! Pricing engine
//!
//! Turns a quantity into money under the price's billing model:
//! - FLAT_FEE: amount per unit
//! - PACKAGE: amount per package of `divide_by` units, rounded up or down
//! - TIERED/VOLUME: whole quantity at the rate of the tier it falls in
//! - TIERED/SLAB: each tier's slice of the quantity at that tier's rate
//!
//! Every result is rounded to the currency's minor-unit precision.

use rust_decimal::Decimal;
use std::sync::Arc;
use tallyline_common::currency::round_to_currency;
use tallyline_common::{BillingModel, Price, PriceTier, RoundMode, TierMode};
use tracing::{error, instrument, warn};

use super::cache::TierCache;

/// Stateless pricing engine backed by a sorted-tier cache
#[derive(Clone)]
pub struct PricingEngine {
    tiers: Arc<TierCache>,
}

impl PricingEngine {
    pub fn new() -> Self {
        Self {
            tiers: Arc::new(TierCache::default()),
        }
    }

    /// Share an existing tier cache
    pub fn with_cache(tiers: Arc<TierCache>) -> Self {
        Self { tiers }
    }

    pub fn cache(&self) -> &TierCache {
        &self.tiers
    }

    /// Cost of `quantity` units under `price`
    ///
    /// A cost outside the decimal range is logged and priced at zero.
    #[instrument(skip(self, price), fields(price_id = %price.id))]
    pub fn cost(&self, price: &Price, quantity: Decimal) -> Decimal {
        if quantity.is_zero() {
            return Decimal::ZERO;
        }

        let cost = match price.billing_model {
            BillingModel::FlatFee => price.amount.checked_mul(quantity),
            BillingModel::Package => package_cost(price, quantity),
            BillingModel::Tiered => self.tiered_cost(price, quantity),
        };

        match cost {
            Some(cost) => round_to_currency(cost, &price.currency),
            None => {
                error!(price_id = %price.id, quantity = %quantity, "Cost overflowed, pricing at zero");
                Decimal::ZERO
            }
        }
    }

    /// Sum of per-bucket costs, each bucket priced on its own
    pub fn bucketed_cost(&self, price: &Price, bucket_values: &[Decimal]) -> Decimal {
        let total = bucket_values
            .iter()
            .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(self.cost(price, *v)));
        match total {
            Some(total) => round_to_currency(total, &price.currency),
            None => {
                error!(price_id = %price.id, buckets = bucket_values.len(), "Bucketed cost overflowed, pricing at zero");
                Decimal::ZERO
            }
        }
    }

    fn tiered_cost(&self, price: &Price, quantity: Decimal) -> Option<Decimal> {
        if price.tiers.is_empty() {
            error!(price_id = %price.id, "Tiered price has no tiers");
            return Some(Decimal::ZERO);
        }

        match price.tier_mode {
            Some(TierMode::Volume) => volume_cost(&self.tiers.sorted_tiers(price), quantity),
            Some(TierMode::Slab) => slab_cost(&self.tiers.sorted_tiers(price), quantity),
            other => {
                error!(price_id = %price.id, tier_mode = ?other, "Invalid tier mode");
                Some(Decimal::ZERO)
            }
        }
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn package_cost(price: &Price, quantity: Decimal) -> Option<Decimal> {
    let Some(transform) = price.transform.as_ref().filter(|t| t.divide_by > 0) else {
        warn!(price_id = %price.id, "Package price without positive divisor");
        return Some(Decimal::ZERO);
    };

    let packages = quantity.checked_div(Decimal::from(transform.divide_by))?;
    let packages = match transform.round {
        RoundMode::Up => packages.ceil(),
        RoundMode::Down => packages.floor(),
    };
    price.amount.checked_mul(packages)
}

/// First tier whose bound is open or above the quantity, else the last tier
fn volume_cost(tiers: &[PriceTier], quantity: Decimal) -> Option<Decimal> {
    let selected = tiers
        .iter()
        .find(|tier| match tier.up_to {
            None => true,
            Some(up_to) => quantity < Decimal::from(up_to),
        })
        .or_else(|| tiers.last());

    selected.map_or(Some(Decimal::ZERO), |tier| tier.cost(quantity))
}

fn slab_cost(tiers: &[PriceTier], quantity: Decimal) -> Option<Decimal> {
    let mut remaining = quantity;
    let mut tier_start = Decimal::ZERO;
    let mut cost = Decimal::ZERO;

    for tier in tiers {
        let mut tier_quantity = remaining;
        if let Some(up_to) = tier.up_to {
            let up_to = Decimal::from(up_to);
            let capacity = up_to - tier_start;
            if remaining > capacity {
                tier_quantity = capacity;
            }
            tier_start = up_to;
        }

        cost = cost.checked_add(tier.cost(tier_quantity)?)?;
        remaining -= tier_quantity;
        if remaining <= Decimal::ZERO {
            break;
        }
    }

    Some(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn two_tiers() -> Vec<PriceTier> {
        vec![
            PriceTier::new(Some(100), dec!(1)),
            PriceTier::new(None, dec!(0.5)),
        ]
    }

    #[test]
    fn test_zero_quantity_is_free() {
        let engine = PricingEngine::new();
        let prices = [
            Price::flat_fee("p1", "m1", dec!(2), "usd"),
            Price::package("p2", "m1", dec!(5), "usd", 10, RoundMode::Up),
            Price::tiered("p3", "m1", "usd", TierMode::Volume, two_tiers()),
            Price::tiered("p4", "m1", "usd", TierMode::Slab, two_tiers()),
        ];
        for price in &prices {
            assert_eq!(engine.cost(price, Decimal::ZERO), Decimal::ZERO);
        }
    }

    #[test]
    fn test_flat_fee() {
        let engine = PricingEngine::new();
        let price = Price::flat_fee("p1", "m1", dec!(0.01), "usd");
        assert_eq!(engine.cost(&price, dec!(1)), dec!(0.01));
        assert_eq!(engine.cost(&price, dec!(1234)), dec!(12.34));
        // Sub-cent totals round to the currency precision
        assert_eq!(engine.cost(&price, dec!(0.4)), dec!(0.00));
    }

    #[test]
    fn test_package_rounding() {
        let engine = PricingEngine::new();
        let up = Price::package("p1", "m1", dec!(5), "usd", 100, RoundMode::Up);
        let down = Price::package("p2", "m1", dec!(5), "usd", 100, RoundMode::Down);

        assert_eq!(engine.cost(&up, dec!(250)), dec!(15));
        assert_eq!(engine.cost(&down, dec!(250)), dec!(10));
        assert_eq!(engine.cost(&down, dec!(99)), dec!(0));

        let invalid = Price::package("p3", "m1", dec!(5), "usd", 0, RoundMode::Up);
        assert_eq!(engine.cost(&invalid, dec!(250)), Decimal::ZERO);
    }

    #[test]
    fn test_slab_vs_volume() {
        let engine = PricingEngine::new();
        let slab = Price::tiered("p1", "m1", "usd", TierMode::Slab, two_tiers());
        let volume = Price::tiered("p2", "m1", "usd", TierMode::Volume, two_tiers());

        assert_eq!(engine.cost(&slab, dec!(150)), dec!(125));
        assert_eq!(engine.cost(&volume, dec!(150)), dec!(75));

        // Within the first tier both models agree
        assert_eq!(engine.cost(&slab, dec!(40)), dec!(40));
        assert_eq!(engine.cost(&volume, dec!(40)), dec!(40));
    }

    #[test]
    fn test_volume_boundary_and_fallback() {
        let engine = PricingEngine::new();
        let volume = Price::tiered("p1", "m1", "usd", TierMode::Volume, two_tiers());
        // Upper bounds are exclusive
        assert_eq!(engine.cost(&volume, dec!(100)), dec!(50));

        let bounded = Price::tiered(
            "p2",
            "m1",
            "usd",
            TierMode::Volume,
            vec![
                PriceTier::new(Some(10), dec!(2)),
                PriceTier::new(Some(20), dec!(1)).with_flat(dec!(3)),
            ],
        );
        // Past every bound: last tier
        assert_eq!(engine.cost(&bounded, dec!(30)), dec!(33));
    }

    #[test]
    fn test_slab_with_flat_amounts_and_unsorted_tiers() {
        let engine = PricingEngine::new();
        let price = Price::tiered(
            "p1",
            "m1",
            "usd",
            TierMode::Slab,
            vec![
                PriceTier::new(None, dec!(0.1)).with_flat(dec!(1)),
                PriceTier::new(Some(10), dec!(1)).with_flat(dec!(2)),
            ],
        );
        // 10 × 1 + 2, then 5 × 0.1 + 1
        assert_eq!(engine.cost(&price, dec!(15)), dec!(13.5));
        // Stops after the first tier
        assert_eq!(engine.cost(&price, dec!(10)), dec!(12));
    }

    #[test]
    fn test_invalid_tier_mode() {
        let engine = PricingEngine::new();
        let mut price = Price::tiered("p1", "m1", "usd", TierMode::Slab, two_tiers());
        price.tier_mode = None;
        assert_eq!(engine.cost(&price, dec!(150)), Decimal::ZERO);

        price.tier_mode = Some(TierMode::Unknown);
        assert_eq!(engine.cost(&price, dec!(150)), Decimal::ZERO);
    }

    #[test]
    fn test_currency_precision() {
        let engine = PricingEngine::new();
        let jpy = Price::flat_fee("p1", "m1", dec!(0.7), "jpy");
        assert_eq!(engine.cost(&jpy, dec!(3)), dec!(2));

        let kwd = Price::flat_fee("p2", "m1", dec!(0.0015), "kwd");
        assert_eq!(engine.cost(&kwd, dec!(3)), dec!(0.005));
    }

    #[test]
    fn test_bucketed_cost() {
        let engine = PricingEngine::new();
        let price = Price::tiered("p1", "m1", "usd", TierMode::Slab, two_tiers());
        // Per-bucket peaks priced independently: 50 + (100 + 25)
        assert_eq!(engine.bucketed_cost(&price, &[dec!(50), dec!(150)]), dec!(175));
        // One grand-total peak would price differently
        assert_eq!(engine.cost(&price, dec!(200)), dec!(150));
        assert_eq!(engine.bucketed_cost(&price, &[]), Decimal::ZERO);
    }

    #[test]
    fn test_tier_edit_reprices() {
        let engine = PricingEngine::new();
        let mut slab = Price::tiered("p1", "m1", "usd", TierMode::Slab, two_tiers());
        assert_eq!(engine.cost(&slab, dec!(150)), dec!(125));

        slab.tiers[0].up_to = Some(10);
        // 10 × 1 + 140 × 0.5
        assert_eq!(engine.cost(&slab, dec!(150)), dec!(80));
    }

    #[test]
    fn test_overflowing_cost_prices_at_zero() {
        let engine = PricingEngine::new();
        let huge = Decimal::MAX / dec!(10);

        let flat = Price::flat_fee("p1", "m1", dec!(1000), "usd");
        assert_eq!(engine.cost(&flat, huge), Decimal::ZERO);

        let package = Price::package("p2", "m1", dec!(1000), "usd", 1, RoundMode::Up);
        assert_eq!(engine.cost(&package, huge), Decimal::ZERO);

        let volume = Price::tiered("p3", "m1", "usd", TierMode::Volume, vec![PriceTier::new(None, dec!(1000))]);
        assert_eq!(engine.cost(&volume, huge), Decimal::ZERO);

        let slab = Price::tiered(
            "p4",
            "m1",
            "usd",
            TierMode::Slab,
            vec![PriceTier::new(Some(10), dec!(1)), PriceTier::new(None, dec!(1000))],
        );
        assert_eq!(engine.cost(&slab, huge), Decimal::ZERO);

        // Each bucket fits but the sum does not
        let unit = Price::flat_fee("p5", "m1", dec!(1), "usd");
        let half = (Decimal::MAX / dec!(2)).floor();
        assert_eq!(engine.bucketed_cost(&unit, &[half, half, half]), Decimal::ZERO);
    }
}
