//! Billing-period calendar math
//!
//! Subscriptions bill on a cadence (`count` × `period`) anchored to a
//! billing-anchor timestamp. Month-based cadences keep the anchor's
//! day-of-month and time of day, clamping to the last day of shorter months,
//! so an Oct 31 anchor bills Nov 30, Dec 31, Jan 31, Feb 28...

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PeriodError;

/// Upper bound on period steps when locating an event's period
pub const MAX_PERIOD_WALK: usize = 100_000;

/// Billing cadence unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    HalfYearly,
    Annual,
}

impl BillingPeriod {
    /// Months per unit, `None` for day-based cadences
    pub fn months(&self) -> Option<u32> {
        match self {
            BillingPeriod::Daily | BillingPeriod::Weekly => None,
            BillingPeriod::Monthly => Some(1),
            BillingPeriod::Quarterly => Some(3),
            BillingPeriod::HalfYearly => Some(6),
            BillingPeriod::Annual => Some(12),
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BillingPeriod::Daily => "DAILY",
            BillingPeriod::Weekly => "WEEKLY",
            BillingPeriod::Monthly => "MONTHLY",
            BillingPeriod::Quarterly => "QUARTERLY",
            BillingPeriod::HalfYearly => "HALF_YEARLY",
            BillingPeriod::Annual => "ANNUAL",
        };
        f.write_str(s)
    }
}

impl FromStr for BillingPeriod {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(BillingPeriod::Daily),
            "WEEKLY" => Ok(BillingPeriod::Weekly),
            "MONTHLY" => Ok(BillingPeriod::Monthly),
            "QUARTERLY" => Ok(BillingPeriod::Quarterly),
            "HALF_YEARLY" => Ok(BillingPeriod::HalfYearly),
            "ANNUAL" => Ok(BillingPeriod::Annual),
            other => Err(PeriodError::UnsupportedPeriod(other.to_string())),
        }
    }
}

/// Number of days in the given month
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Year and month `months` after (year, month)
fn shift_month(year: i32, month: u32, months: i64) -> (i32, u32) {
    let total = i64::from(year) * 12 + i64::from(month) - 1 + months;
    (total.div_euclid(12) as i32, (total.rem_euclid(12) + 1) as u32)
}

/// Build a timestamp on (year, month, day) at the time of day of `clock`
fn at_day(year: i32, month: u32, day: u32, clock: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)))
        .and_then(|d| d.and_hms_nano_opt(clock.hour(), clock.minute(), clock.second(), clock.nanosecond()))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Add years and months, clamping the day-of-month to the target month's
/// length, then add days.
pub fn add_clamped(date: DateTime<Utc>, years: i32, months: i32, days: i32) -> DateTime<Utc> {
    let (year, month) = shift_month(date.year(), date.month(), i64::from(years) * 12 + i64::from(months));
    at_day(year, month, date.day(), date) + Duration::days(i64::from(days))
}

/// End of the billing period starting at `period_start`.
///
/// Day-based cadences add whole days. Month-based cadences land on the
/// anchor's day-of-month and time of day, clamped to the target month. The
/// result is capped at `end` when given.
pub fn next_billing_date(
    period_start: DateTime<Utc>,
    anchor: DateTime<Utc>,
    count: u32,
    period: BillingPeriod,
    end: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, PeriodError> {
    if count == 0 {
        return Err(PeriodError::ZeroPeriodCount);
    }

    let next = match period.months() {
        None => {
            let days = match period {
                BillingPeriod::Weekly => 7 * i64::from(count),
                _ => i64::from(count),
            };
            period_start + Duration::days(days)
        }
        Some(unit) => {
            let (year, month) = shift_month(
                period_start.year(),
                period_start.month(),
                i64::from(unit) * i64::from(count),
            );
            at_day(year, month, anchor.day(), anchor)
        }
    };

    Ok(match end {
        Some(end) if end < next => end,
        _ => next,
    })
}

/// Billing cadence of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub anchor: DateTime<Utc>,
    pub count: u32,
    pub period: BillingPeriod,
}

impl Cadence {
    pub fn new(anchor: DateTime<Utc>, count: u32, period: BillingPeriod) -> Self {
        Self { anchor, count, period }
    }

    pub fn next(&self, period_start: DateTime<Utc>) -> Result<DateTime<Utc>, PeriodError> {
        next_billing_date(period_start, self.anchor, self.count, self.period, None)
    }
}

/// Epoch-millisecond start of the billing period containing `ts`.
///
/// Events inside the current period short-circuit. Earlier events walk forward
/// from the subscription start, later events from the current period end.
pub fn calculate_period_id(
    ts: DateTime<Utc>,
    subscription_start: DateTime<Utc>,
    current_start: DateTime<Utc>,
    current_end: DateTime<Utc>,
    cadence: &Cadence,
) -> Result<u64, PeriodError> {
    if ts >= current_start && ts < current_end {
        return Ok(to_period_id(current_start));
    }

    if ts < subscription_start {
        return Err(PeriodError::BeforeSubscriptionStart {
            event_ms: ts.timestamp_millis(),
            start_ms: subscription_start.timestamp_millis(),
        });
    }

    let mut start = if ts < current_start { subscription_start } else { current_end };
    for _ in 0..MAX_PERIOD_WALK {
        let end = cadence.next(start)?;
        if end <= start {
            return Err(PeriodError::NonPositiveDuration {
                start_ms: start.timestamp_millis(),
                end_ms: end.timestamp_millis(),
            });
        }
        if ts < end {
            return Ok(to_period_id(start));
        }
        start = end;
    }

    Err(PeriodError::WalkLimit(MAX_PERIOD_WALK))
}

fn to_period_id(start: DateTime<Utc>) -> u64 {
    start.timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_next_billing_date_day_based() {
        let start = utc(2024, 3, 10);
        assert_eq!(
            next_billing_date(start, start, 10, BillingPeriod::Daily, None).unwrap(),
            utc(2024, 3, 20)
        );
        assert_eq!(
            next_billing_date(start, start, 2, BillingPeriod::Weekly, None).unwrap(),
            utc(2024, 3, 24)
        );
    }

    #[test]
    fn test_next_billing_date_months() {
        let start = utc(2024, 1, 15);
        assert_eq!(
            next_billing_date(start, start, 2, BillingPeriod::Monthly, None).unwrap(),
            utc(2024, 3, 15)
        );

        let oct31 = utc(2024, 10, 31);
        assert_eq!(
            next_billing_date(oct31, oct31, 1, BillingPeriod::Monthly, None).unwrap(),
            utc(2024, 11, 30)
        );
        // The anchor day comes back after a short month
        assert_eq!(
            next_billing_date(utc(2024, 11, 30), oct31, 1, BillingPeriod::Monthly, None).unwrap(),
            utc(2024, 12, 31)
        );

        let leap = utc(2024, 2, 29);
        assert_eq!(
            next_billing_date(leap, leap, 1, BillingPeriod::Annual, None).unwrap(),
            utc(2025, 2, 28)
        );
        assert_eq!(
            next_billing_date(utc(2024, 1, 1), utc(2024, 1, 1), 1, BillingPeriod::Quarterly, None).unwrap(),
            utc(2024, 4, 1)
        );
    }

    #[test]
    fn test_next_billing_date_keeps_anchor_clock() {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 5, 9, 30, 0).unwrap();
        let next = next_billing_date(anchor, anchor, 1, BillingPeriod::Monthly, None).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 5, 9, 30, 0).unwrap());
    }

    #[test]
    fn test_next_billing_date_cliff_and_errors() {
        let start = utc(2024, 1, 1);
        let end = utc(2024, 1, 20);
        assert_eq!(
            next_billing_date(start, start, 1, BillingPeriod::Monthly, Some(end)).unwrap(),
            end
        );
        assert_eq!(
            next_billing_date(start, start, 0, BillingPeriod::Daily, None),
            Err(PeriodError::ZeroPeriodCount)
        );
        assert!("FORTNIGHTLY".parse::<BillingPeriod>().is_err());
    }

    #[test]
    fn test_add_clamped() {
        assert_eq!(add_clamped(utc(2024, 1, 31), 0, 1, 0), utc(2024, 2, 29));
        assert_eq!(add_clamped(utc(2024, 12, 31), 0, 2, 0), utc(2025, 2, 28));
        assert_eq!(add_clamped(utc(2024, 3, 10), 0, 0, 5), utc(2024, 3, 15));
        assert_eq!(add_clamped(utc(2024, 11, 30), 0, 2, 0), utc(2025, 1, 30));
        assert_eq!(add_clamped(utc(2024, 2, 29), 1, 0, 0), utc(2025, 2, 28));
    }

    #[test]
    fn test_period_id_current_period() {
        let cadence = Cadence::new(utc(2024, 1, 1), 1, BillingPeriod::Monthly);
        let id = calculate_period_id(
            utc(2024, 3, 15),
            utc(2024, 1, 1),
            utc(2024, 3, 1),
            utc(2024, 4, 1),
            &cadence,
        )
        .unwrap();
        assert_eq!(id, utc(2024, 3, 1).timestamp_millis() as u64);
    }

    #[test]
    fn test_period_id_walks_backwards_and_forwards() {
        let cadence = Cadence::new(utc(2024, 1, 1), 1, BillingPeriod::Monthly);
        let sub_start = utc(2024, 1, 1);

        let past = calculate_period_id(utc(2024, 2, 10), sub_start, utc(2024, 3, 1), utc(2024, 4, 1), &cadence)
            .unwrap();
        assert_eq!(past, utc(2024, 2, 1).timestamp_millis() as u64);

        let future = calculate_period_id(utc(2024, 5, 31), sub_start, utc(2024, 3, 1), utc(2024, 4, 1), &cadence)
            .unwrap();
        assert_eq!(future, utc(2024, 5, 1).timestamp_millis() as u64);

        // Period boundaries are half-open
        let boundary = calculate_period_id(utc(2024, 4, 1), sub_start, utc(2024, 3, 1), utc(2024, 4, 1), &cadence)
            .unwrap();
        assert_eq!(boundary, utc(2024, 4, 1).timestamp_millis() as u64);
    }

    #[test]
    fn test_period_id_before_start() {
        let cadence = Cadence::new(utc(2024, 1, 1), 1, BillingPeriod::Monthly);
        let err = calculate_period_id(utc(2023, 12, 31), utc(2024, 1, 1), utc(2024, 1, 1), utc(2024, 2, 1), &cadence)
            .unwrap_err();
        assert!(matches!(err, PeriodError::BeforeSubscriptionStart { .. }));
    }
}
