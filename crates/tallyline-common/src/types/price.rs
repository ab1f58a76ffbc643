//! Price configuration
//!
//! A price turns a quantity into money. Usage prices point at a meter; fixed
//! prices carry no meter and never reach the rating path.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PricingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Usage,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingModel {
    FlatFee,
    Package,
    Tiered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierMode {
    Volume,
    Slab,
    #[serde(other)]
    Unknown,
}

/// Rounding applied after dividing by the package size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundMode {
    #[default]
    Up,
    Down,
}

/// Package transform: bill per `divide_by` units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformQuantity {
    pub divide_by: i64,
    #[serde(default)]
    pub round: RoundMode,
}

/// One tier; `up_to == None` is the open-ended overflow tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<u64>,
    pub unit_amount: Decimal,
    #[serde(default)]
    pub flat_amount: Option<Decimal>,
}

impl PriceTier {
    pub fn new(up_to: Option<u64>, unit_amount: Decimal) -> Self {
        Self {
            up_to,
            unit_amount,
            flat_amount: None,
        }
    }

    pub fn with_flat(mut self, flat_amount: Decimal) -> Self {
        self.flat_amount = Some(flat_amount);
        self
    }

    /// Cost of `quantity` units within this tier, flat fee included; `None` on overflow
    pub fn cost(&self, quantity: Decimal) -> Option<Decimal> {
        self.unit_amount
            .checked_mul(quantity)?
            .checked_add(self.flat_amount.unwrap_or(Decimal::ZERO))
    }
}

/// Entity a price belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceEntityType {
    #[default]
    Plan,
    Costsheet,
    Subscription,
}

/// Publication status shared by catalog entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Published,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub price_type: PriceType,
    #[serde(default)]
    pub meter_id: Option<String>,
    pub billing_model: BillingModel,
    /// Per-unit amount for FLAT_FEE, per-package amount for PACKAGE
    #[serde(default)]
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub tier_mode: Option<TierMode>,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    pub transform: Option<TransformQuantity>,
    #[serde(default)]
    pub entity_type: PriceEntityType,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub status: Status,
    /// Version stamp; changes whenever the tier configuration changes
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Price {
    /// Usage price billed per unit
    pub fn flat_fee(id: impl Into<String>, meter_id: impl Into<String>, amount: Decimal, currency: &str) -> Self {
        Self {
            id: id.into(),
            tenant_id: String::new(),
            price_type: PriceType::Usage,
            meter_id: Some(meter_id.into()),
            billing_model: BillingModel::FlatFee,
            amount,
            currency: currency.to_lowercase(),
            tier_mode: None,
            tiers: Vec::new(),
            transform: None,
            entity_type: PriceEntityType::Plan,
            entity_id: String::new(),
            status: Status::Published,
            updated_at: DateTime::<Utc>::default(),
        }
    }

    /// Usage price billed per started or completed package
    pub fn package(
        id: impl Into<String>,
        meter_id: impl Into<String>,
        amount: Decimal,
        currency: &str,
        divide_by: i64,
        round: RoundMode,
    ) -> Self {
        let mut price = Self::flat_fee(id, meter_id, amount, currency);
        price.billing_model = BillingModel::Package;
        price.transform = Some(TransformQuantity { divide_by, round });
        price
    }

    /// Tiered usage price
    pub fn tiered(
        id: impl Into<String>,
        meter_id: impl Into<String>,
        currency: &str,
        mode: TierMode,
        tiers: Vec<PriceTier>,
    ) -> Self {
        let mut price = Self::flat_fee(id, meter_id, Decimal::ZERO, currency);
        price.billing_model = BillingModel::Tiered;
        price.tier_mode = Some(mode);
        price.tiers = tiers;
        price
    }

    pub fn with_entity(mut self, entity_type: PriceEntityType, entity_id: impl Into<String>) -> Self {
        self.entity_type = entity_type;
        self.entity_id = entity_id.into();
        self
    }

    /// Usage type with a meter reference
    pub fn is_usage(&self) -> bool {
        self.price_type == PriceType::Usage && self.meter_id.as_deref().map_or(false, |m| !m.is_empty())
    }

    /// Check the model-specific configuration
    pub fn validate(&self) -> Result<(), PricingError> {
        match self.billing_model {
            BillingModel::FlatFee => Ok(()),
            BillingModel::Package => match &self.transform {
                Some(t) if t.divide_by > 0 => Ok(()),
                _ => Err(PricingError::InvalidPackageSize {
                    price_id: self.id.clone(),
                }),
            },
            BillingModel::Tiered => {
                match self.tier_mode {
                    Some(TierMode::Volume) | Some(TierMode::Slab) => {}
                    _ => {
                        return Err(PricingError::MissingTierMode {
                            price_id: self.id.clone(),
                        })
                    }
                }
                if self.tiers.is_empty() {
                    return Err(PricingError::EmptyTiers {
                        price_id: self.id.clone(),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_deserialize() {
        let json = r#"{
            "id": "price-1",
            "type": "USAGE",
            "meter_id": "m1",
            "billing_model": "TIERED",
            "currency": "usd",
            "tier_mode": "SLAB",
            "tiers": [
                {"up_to": 100, "unit_amount": "1"},
                {"up_to": null, "unit_amount": "0.5", "flat_amount": "2"}
            ]
        }"#;
        let price: Price = serde_json::from_str(json).unwrap();

        assert!(price.is_usage());
        assert_eq!(price.tier_mode, Some(TierMode::Slab));
        assert_eq!(price.tiers[1].flat_amount, Some(dec!(2)));
        assert_eq!(price.status, Status::Published);
        assert!(price.validate().is_ok());
    }

    #[test]
    fn test_fixed_price_is_not_usage() {
        let mut price = Price::flat_fee("p1", "m1", dec!(10), "usd");
        price.price_type = PriceType::Fixed;
        assert!(!price.is_usage());

        let mut no_meter = Price::flat_fee("p2", "", dec!(10), "usd");
        assert!(!no_meter.is_usage());
        no_meter.meter_id = None;
        assert!(!no_meter.is_usage());
    }

    #[test]
    fn test_validate() {
        let pkg = Price::package("p1", "m1", dec!(5), "usd", 0, RoundMode::Up);
        assert_eq!(
            pkg.validate(),
            Err(PricingError::InvalidPackageSize { price_id: "p1".into() })
        );

        let mut tiered = Price::tiered("p2", "m1", "usd", TierMode::Volume, vec![]);
        assert!(matches!(tiered.validate(), Err(PricingError::EmptyTiers { .. })));
        tiered.tier_mode = None;
        assert!(matches!(tiered.validate(), Err(PricingError::MissingTierMode { .. })));
    }

    #[test]
    fn test_tier_cost() {
        let tier = PriceTier::new(Some(10), dec!(0.5)).with_flat(dec!(3));
        assert_eq!(tier.cost(dec!(4)), Some(dec!(5)));
    }

    #[test]
    fn test_tier_cost_overflow() {
        let tier = PriceTier::new(None, dec!(1000));
        assert_eq!(tier.cost(Decimal::MAX / dec!(10)), None);
    }
}
