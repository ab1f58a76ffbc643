//! Quantity extraction
//!
//! Computes the billable quantity an event contributes to a meter. Bad data
//! degrades to zero with a warning; only a broken billing period for
//! WEIGHTED_SUM is an error.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tallyline_common::{AggregationType, Cadence, Event, Meter, PeriodError, Result, TallyError};
use tracing::warn;

/// Billing period an event was assigned to, needed by WEIGHTED_SUM
#[derive(Debug, Clone, Copy)]
pub struct PeriodContext {
    pub period_start: DateTime<Utc>,
    pub cadence: Cadence,
}

impl PeriodContext {
    /// Context from an epoch-ms period ID
    pub fn from_period_id(period_id: u64, cadence: Cadence) -> Self {
        let period_start = DateTime::<Utc>::from_timestamp_millis(period_id as i64).unwrap_or_default();
        Self { period_start, cadence }
    }

    pub fn period_end(&self) -> std::result::Result<DateTime<Utc>, PeriodError> {
        self.cadence.next(self.period_start)
    }
}

/// Extractor output: quantity plus the raw value as text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extracted {
    pub quantity: Decimal,
    /// Display form of the aggregated property (empty for COUNT)
    pub value: String,
}

impl Extracted {
    fn zero() -> Self {
        Self::default()
    }

    fn new(quantity: Decimal, value: String) -> Self {
        Self { quantity, value }
    }
}

/// Quantity `event` contributes to `meter`, never negative
pub fn extract(event: &Event, meter: &Meter, period: Option<&PeriodContext>) -> Result<Extracted> {
    let extracted = extract_raw(event, meter, period)?;
    if extracted.quantity.is_sign_negative() && !extracted.quantity.is_zero() {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            quantity = %extracted.quantity,
            "Negative quantity clamped to zero"
        );
        return Ok(Extracted::new(Decimal::ZERO, extracted.value));
    }
    Ok(extracted)
}

fn extract_raw(event: &Event, meter: &Meter, period: Option<&PeriodContext>) -> Result<Extracted> {
    let agg = &meter.aggregation;

    if agg.kind == AggregationType::Count {
        return Ok(Extracted::new(Decimal::ONE, String::new()));
    }
    if agg.kind == AggregationType::Unknown {
        warn!(event_id = %event.id, meter_id = %meter.id, "Unsupported aggregation type");
        return Ok(Extracted::zero());
    }
    if agg.field.is_empty() {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            aggregation = %agg.kind,
            "Aggregation with empty field name"
        );
        return Ok(Extracted::zero());
    }
    let Some(raw) = event.property(&agg.field) else {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            field = %agg.field,
            aggregation = %agg.kind,
            "Property not found for aggregation"
        );
        return Ok(Extracted::zero());
    };
    let value = raw.to_string();

    if agg.kind == AggregationType::CountUnique {
        return Ok(Extracted::new(Decimal::ONE, value));
    }

    let number = match raw.to_decimal() {
        Ok(number) => number,
        Err(e) => {
            warn!(
                event_id = %event.id,
                meter_id = %meter.id,
                field = %agg.field,
                error = %e,
                "Property value is not numeric"
            );
            return Ok(Extracted::new(Decimal::ZERO, value));
        }
    };

    let quantity = match agg.kind {
        AggregationType::SumWithMultiplier => match agg.multiplier {
            Some(multiplier) => match number.checked_mul(multiplier) {
                Some(quantity) => quantity,
                None => {
                    warn!(
                        event_id = %event.id,
                        meter_id = %meter.id,
                        value = %number,
                        multiplier = %multiplier,
                        "Multiplied quantity out of range"
                    );
                    Decimal::ZERO
                }
            },
            None => {
                warn!(event_id = %event.id, meter_id = %meter.id, "SUM_WITH_MULTIPLIER without multiplier");
                Decimal::ZERO
            }
        },
        AggregationType::WeightedSum => {
            if number.is_zero() {
                Decimal::ZERO
            } else {
                weighted(event, meter, number, period)?
            }
        }
        _ => number,
    };

    Ok(Extracted::new(quantity, value))
}

/// `value × remaining / total` over the event's billing period
fn weighted(event: &Event, meter: &Meter, value: Decimal, period: Option<&PeriodContext>) -> Result<Decimal> {
    let Some(period) = period else {
        return Err(TallyError::Validation(format!(
            "weighted sum meter {} requires a billing period",
            meter.id
        )));
    };

    let period_end = period.period_end()?;
    let total_ms = (period_end - period.period_start).num_milliseconds();
    if total_ms <= 0 {
        return Err(PeriodError::NonPositiveDuration {
            start_ms: period.period_start.timestamp_millis(),
            end_ms: period_end.timestamp_millis(),
        }
        .into());
    }
    let remaining_ms = (period_end - event.timestamp).num_milliseconds().max(0);

    let weighted = value
        .checked_mul(Decimal::from(remaining_ms))
        .and_then(|scaled| scaled.checked_div(Decimal::from(total_ms)));
    Ok(weighted.unwrap_or_else(|| {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            value = %value,
            "Weighted quantity out of range"
        );
        Decimal::ZERO
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use tallyline_common::{BillingPeriod, MeterAggregation};

    fn meter(kind: AggregationType, field: &str) -> Meter {
        Meter::new("m1", "usage", MeterAggregation::new(kind, field))
    }

    fn event() -> Event {
        Event::new("evt-1", "t1", "cust-1", "usage", Utc::now())
    }

    #[test]
    fn test_count_is_always_one() {
        let out = extract(&event(), &meter(AggregationType::Count, ""), None).unwrap();
        assert_eq!(out.quantity, dec!(1));
        assert_eq!(out.value, "");
    }

    #[test]
    fn test_sum_family_reads_field() {
        let e = event().with_property("bytes", 1500i64);
        for kind in [AggregationType::Sum, AggregationType::Avg, AggregationType::Latest, AggregationType::Max] {
            let out = extract(&e, &meter(kind, "bytes"), None).unwrap();
            assert_eq!(out.quantity, dec!(1500));
            assert_eq!(out.value, "1500");
        }
    }

    #[test]
    fn test_missing_or_bad_field_is_zero() {
        let sum = meter(AggregationType::Sum, "bytes");
        assert_eq!(extract(&event(), &sum, None).unwrap().quantity, Decimal::ZERO);

        let e = event().with_property("bytes", "lots");
        let out = extract(&e, &sum, None).unwrap();
        assert_eq!(out.quantity, Decimal::ZERO);
        assert_eq!(out.value, "lots");

        let no_field = meter(AggregationType::Sum, "");
        assert_eq!(extract(&e, &no_field, None).unwrap().quantity, Decimal::ZERO);
    }

    #[test]
    fn test_sum_with_multiplier() {
        let mut m = meter(AggregationType::SumWithMultiplier, "tokens");
        let e = event().with_property("tokens", "250");
        assert_eq!(extract(&e, &m, None).unwrap().quantity, Decimal::ZERO);

        m.aggregation.multiplier = Some(dec!(0.001));
        assert_eq!(extract(&e, &m, None).unwrap().quantity, dec!(0.25));
    }

    #[test]
    fn test_out_of_range_quantity_is_zero() {
        let huge = "79228162514264337593543950";

        let mut m = meter(AggregationType::SumWithMultiplier, "tokens");
        m.aggregation.multiplier = Some(dec!(100000));
        let out = extract(&event().with_property("tokens", huge), &m, None).unwrap();
        assert_eq!(out.quantity, Decimal::ZERO);
        assert_eq!(out.value, huge);

        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let period = PeriodContext {
            period_start: start,
            cadence: Cadence::new(start, 1, BillingPeriod::Monthly),
        };
        let mut e = event().with_property("seats", huge);
        e.timestamp = start + Duration::days(15);
        let out = extract(&e, &meter(AggregationType::WeightedSum, "seats"), Some(&period)).unwrap();
        assert_eq!(out.quantity, Decimal::ZERO);
    }

    #[test]
    fn test_count_unique_carries_value() {
        let m = meter(AggregationType::CountUnique, "user_id");
        let out = extract(&event().with_property("user_id", "abc"), &m, None).unwrap();
        assert_eq!(out.quantity, dec!(1));
        assert_eq!(out.value, "abc");

        assert_eq!(extract(&event(), &m, None).unwrap().quantity, Decimal::ZERO);
    }

    #[test]
    fn test_negative_is_clamped() {
        let e = event().with_property("delta", "-42.5");
        let out = extract(&e, &meter(AggregationType::Sum, "delta"), None).unwrap();
        assert_eq!(out.quantity, Decimal::ZERO);
        assert!(!out.quantity.is_sign_negative());

        let mut m = meter(AggregationType::SumWithMultiplier, "delta");
        m.aggregation.multiplier = Some(dec!(-2));
        let positive = event().with_property("delta", 3i64);
        assert_eq!(extract(&positive, &m, None).unwrap().quantity, Decimal::ZERO);
    }

    #[test]
    fn test_unknown_aggregation_is_zero() {
        let e = event().with_property("x", 5i64);
        assert_eq!(
            extract(&e, &meter(AggregationType::Unknown, "x"), None).unwrap().quantity,
            Decimal::ZERO
        );
    }

    #[test]
    fn test_weighted_sum_midpoint() {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        // April has 30 days
        let period = PeriodContext {
            period_start: start,
            cadence: Cadence::new(start, 1, BillingPeriod::Monthly),
        };
        let mut e = event().with_property("seats", 300i64);
        e.timestamp = start + Duration::days(15);

        let out = extract(&e, &meter(AggregationType::WeightedSum, "seats"), Some(&period)).unwrap();
        assert_eq!(out.quantity, dec!(150));

        // After the period end nothing remains
        e.timestamp = start + Duration::days(45);
        let out = extract(&e, &meter(AggregationType::WeightedSum, "seats"), Some(&period)).unwrap();
        assert_eq!(out.quantity, Decimal::ZERO);
    }

    #[test]
    fn test_weighted_sum_errors() {
        let m = meter(AggregationType::WeightedSum, "seats");
        let e = event().with_property("seats", 10i64);
        let err = extract(&e, &m, None).unwrap_err();
        assert!(err.is_validation());

        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let broken = PeriodContext {
            period_start: start,
            cadence: Cadence::new(start, 0, BillingPeriod::Monthly),
        };
        assert!(extract(&e, &m, Some(&broken)).unwrap_err().is_validation());
    }

    #[test]
    fn test_period_context_from_id() {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let ctx = PeriodContext::from_period_id(
            start.timestamp_millis() as u64,
            Cadence::new(start, 1, BillingPeriod::Monthly),
        );
        assert_eq!(ctx.period_start, start);
        assert_eq!(ctx.period_end().unwrap(), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }
}
