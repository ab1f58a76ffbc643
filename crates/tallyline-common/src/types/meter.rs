//! Meter definitions: what to count and how

use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How a meter turns events into quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    Latest,
    Max,
    SumWithMultiplier,
    CountUnique,
    WeightedSum,
    /// Any aggregation this build does not know about
    #[serde(other)]
    Unknown,
}

impl AggregationType {
    /// Whether this aggregation reads a property field
    pub fn requires_field(&self) -> bool {
        !matches!(self, AggregationType::Count | AggregationType::Unknown)
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregationType::Count => "COUNT",
            AggregationType::Sum => "SUM",
            AggregationType::Avg => "AVG",
            AggregationType::Latest => "LATEST",
            AggregationType::Max => "MAX",
            AggregationType::SumWithMultiplier => "SUM_WITH_MULTIPLIER",
            AggregationType::CountUnique => "COUNT_UNIQUE",
            AggregationType::WeightedSum => "WEIGHTED_SUM",
            AggregationType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Time bucket granularity for analytics points and bucketed-max meters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowSize {
    #[serde(rename = "MINUTE")]
    Minute,
    #[serde(rename = "15MIN")]
    FifteenMinutes,
    #[serde(rename = "30MIN")]
    ThirtyMinutes,
    #[serde(rename = "HOUR")]
    Hour,
    #[serde(rename = "3HOUR")]
    ThreeHours,
    #[serde(rename = "6HOUR")]
    SixHours,
    #[serde(rename = "12HOUR")]
    TwelveHours,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "WEEK")]
    Week,
    #[serde(rename = "MONTH")]
    Month,
}

impl WindowSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSize::Minute => "MINUTE",
            WindowSize::FifteenMinutes => "15MIN",
            WindowSize::ThirtyMinutes => "30MIN",
            WindowSize::Hour => "HOUR",
            WindowSize::ThreeHours => "3HOUR",
            WindowSize::SixHours => "6HOUR",
            WindowSize::TwelveHours => "12HOUR",
            WindowSize::Day => "DAY",
            WindowSize::Week => "WEEK",
            WindowSize::Month => "MONTH",
        }
    }

    /// Fixed bucket width, `None` for calendar months
    pub fn fixed_duration(&self) -> Option<Duration> {
        match self {
            WindowSize::Minute => Some(Duration::minutes(1)),
            WindowSize::FifteenMinutes => Some(Duration::minutes(15)),
            WindowSize::ThirtyMinutes => Some(Duration::minutes(30)),
            WindowSize::Hour => Some(Duration::hours(1)),
            WindowSize::ThreeHours => Some(Duration::hours(3)),
            WindowSize::SixHours => Some(Duration::hours(6)),
            WindowSize::TwelveHours => Some(Duration::hours(12)),
            WindowSize::Day => Some(Duration::days(1)),
            WindowSize::Week | WindowSize::Month => None,
        }
    }

    /// Start of the bucket containing `ts`. Weeks start on Monday.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WindowSize::Week => {
                let day = WindowSize::Day.truncate(ts);
                day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
            }
            WindowSize::Month => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(ts),
            fixed => match fixed.fixed_duration() {
                Some(width) => ts.duration_trunc(width).unwrap_or(ts),
                None => ts,
            },
        }
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s {
            "MINUTE" => WindowSize::Minute,
            "15MIN" => WindowSize::FifteenMinutes,
            "30MIN" => WindowSize::ThirtyMinutes,
            "HOUR" => WindowSize::Hour,
            "3HOUR" => WindowSize::ThreeHours,
            "6HOUR" => WindowSize::SixHours,
            "12HOUR" => WindowSize::TwelveHours,
            "DAY" => WindowSize::Day,
            "WEEK" => WindowSize::Week,
            "MONTH" => WindowSize::Month,
            other => return Err(format!("invalid window size: {}", other)),
        };
        Ok(parsed)
    }
}

/// Aggregation settings of a meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterAggregation {
    #[serde(rename = "type")]
    pub kind: AggregationType,
    /// Property the aggregation reads (ignored for COUNT)
    #[serde(default)]
    pub field: String,
    /// Only used by SUM_WITH_MULTIPLIER
    #[serde(default)]
    pub multiplier: Option<Decimal>,
    /// Only used by MAX; turns the meter into a bucketed-max meter
    #[serde(default)]
    pub bucket_size: Option<WindowSize>,
}

impl MeterAggregation {
    pub fn new(kind: AggregationType, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            multiplier: None,
            bucket_size: None,
        }
    }
}

/// Property predicate: the event's property must display as one of `values`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterFilter {
    pub key: String,
    pub values: BTreeSet<String>,
}

impl MeterFilter {
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Tenant-scoped metric definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    pub event_name: String,
    pub aggregation: MeterAggregation,
    #[serde(default)]
    pub filters: Vec<MeterFilter>,
}

impl Meter {
    pub fn new(id: impl Into<String>, event_name: impl Into<String>, aggregation: MeterAggregation) -> Self {
        let event_name = event_name.into();
        Self {
            id: id.into(),
            tenant_id: String::new(),
            name: event_name.clone(),
            event_name,
            aggregation,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: MeterFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// MAX aggregation with a bucket size
    pub fn is_bucketed_max(&self) -> bool {
        self.aggregation.kind == AggregationType::Max && self.aggregation.bucket_size.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_serde() {
        let agg: AggregationType = serde_json::from_str("\"SUM_WITH_MULTIPLIER\"").unwrap();
        assert_eq!(agg, AggregationType::SumWithMultiplier);

        let unknown: AggregationType = serde_json::from_str("\"PERCENTILE\"").unwrap();
        assert_eq!(unknown, AggregationType::Unknown);
    }

    #[test]
    fn test_bucketed_max() {
        let mut agg = MeterAggregation::new(AggregationType::Max, "concurrency");
        let plain = Meter::new("m1", "ping", agg.clone());
        assert!(!plain.is_bucketed_max());

        agg.bucket_size = Some(WindowSize::Hour);
        let bucketed = Meter::new("m2", "ping", agg);
        assert!(bucketed.is_bucketed_max());
    }

    #[test]
    fn test_window_truncate() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 14, 13, 47, 12).unwrap();

        assert_eq!(
            WindowSize::Hour.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 14, 13, 0, 0).unwrap()
        );
        assert_eq!(
            WindowSize::FifteenMinutes.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 14, 13, 45, 0).unwrap()
        );
        assert_eq!(
            WindowSize::SixHours.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap()
        );
        // 2024-03-14 is a Thursday
        assert_eq!(
            WindowSize::Week.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );
        assert_eq!(
            WindowSize::Month.truncate(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_window_parse() {
        assert_eq!("3HOUR".parse::<WindowSize>(), Ok(WindowSize::ThreeHours));
        assert!("FORTNIGHT".parse::<WindowSize>().is_err());
    }
}
