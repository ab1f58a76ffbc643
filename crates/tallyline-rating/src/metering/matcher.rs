//! Event to (price, meter) matching
//!
//! A usage price applies to an event when its meter listens to the event's
//! name and every meter filter accepts the event's properties. Matches are
//! ranked most-specific first so a filtered meter shadows a catch-all one.

use std::collections::HashMap;
use tallyline_common::{Event, Meter, MeterFilter, Price};
use tracing::{debug, instrument};

/// One applicable (price, meter) pair
#[derive(Debug, Clone, Copy)]
pub struct PriceMatch<'a> {
    pub price: &'a Price,
    pub meter: &'a Meter,
}

impl<'a> PriceMatch<'a> {
    pub fn specificity(&self) -> usize {
        self.meter.filters.len()
    }
}

/// Whether every filter of `meter` accepts the event.
///
/// A filter accepts when the event has the key and the property's display
/// form is one of the filter values. No filters accepts everything.
pub fn filters_match(event: &Event, filters: &[MeterFilter]) -> bool {
    filters.iter().all(|filter| {
        event
            .property(&filter.key)
            .map_or(false, |value| filter.values.contains(&value.to_string()))
    })
}

/// Ranked matches of `event` among `prices`
#[instrument(skip_all, fields(event_id = %event.id, event_name = %event.event_name))]
pub fn match_prices<'a>(
    event: &Event,
    prices: &'a [Price],
    meters: &'a HashMap<String, Meter>,
) -> Vec<PriceMatch<'a>> {
    let mut matches: Vec<PriceMatch<'a>> = prices
        .iter()
        .filter(|price| price.is_usage())
        .filter_map(|price| {
            let meter_id = price.meter_id.as_deref()?;
            match meters.get(meter_id) {
                Some(meter) => Some(PriceMatch { price, meter }),
                None => {
                    debug!(price_id = %price.id, meter_id, "Meter not found for price, skipping");
                    None
                }
            }
        })
        .filter(|m| m.meter.event_name == event.event_name)
        .filter(|m| filters_match(event, &m.meter.filters))
        .collect();

    matches.sort_by(|a, b| {
        b.specificity()
            .cmp(&a.specificity())
            .then_with(|| a.price.id.cmp(&b.price.id))
    });

    debug!(matches = matches.len(), "Matched prices");
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tallyline_common::{AggregationType, MeterAggregation, PriceType};

    fn meter(id: &str, event_name: &str) -> Meter {
        Meter::new(id, event_name, MeterAggregation::new(AggregationType::Count, ""))
    }

    fn catalog(meters: Vec<Meter>) -> HashMap<String, Meter> {
        meters.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    fn event() -> Event {
        Event::new("evt-1", "t1", "cust-1", "api_call", Utc::now())
            .with_property("region", "us-east-1")
            .with_property("tier", "gold")
            .with_property("port", 443i64)
    }

    #[test]
    fn test_specific_meter_ranks_first() {
        let meters = catalog(vec![
            meter("m-any", "api_call"),
            meter("m-specific", "api_call")
                .with_filter(MeterFilter::new("region", ["us-east-1", "eu-west-1"]))
                .with_filter(MeterFilter::new("tier", ["gold"])),
        ]);
        let prices = vec![
            Price::flat_fee("a-price", "m-any", dec!(1), "usd"),
            Price::flat_fee("z-price", "m-specific", dec!(2), "usd"),
        ];

        let matches = match_prices(&event(), &prices, &meters);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].meter.id, "m-specific");
        assert_eq!(matches[1].meter.id, "m-any");
    }

    #[test]
    fn test_tie_break_by_price_id() {
        let meters = catalog(vec![meter("m1", "api_call")]);
        let prices = vec![
            Price::flat_fee("price-b", "m1", dec!(1), "usd"),
            Price::flat_fee("price-a", "m1", dec!(1), "usd"),
        ];

        let ids: Vec<_> = match_prices(&event(), &prices, &meters)
            .iter()
            .map(|m| m.price.id.as_str())
            .collect();
        assert_eq!(ids, vec!["price-a", "price-b"]);
    }

    #[test]
    fn test_filters_reject() {
        let meters = catalog(vec![
            meter("m-wrong-value", "api_call").with_filter(MeterFilter::new("region", ["eu-west-1"])),
            meter("m-missing-key", "api_call").with_filter(MeterFilter::new("plan", ["pro"])),
            meter("m-other-event", "page_view"),
            meter("m-numeric", "api_call").with_filter(MeterFilter::new("port", ["443"])),
        ]);
        let prices = vec![
            Price::flat_fee("p1", "m-wrong-value", dec!(1), "usd"),
            Price::flat_fee("p2", "m-missing-key", dec!(1), "usd"),
            Price::flat_fee("p3", "m-other-event", dec!(1), "usd"),
            Price::flat_fee("p4", "m-numeric", dec!(1), "usd"),
            Price::flat_fee("p5", "m-unknown", dec!(1), "usd"),
        ];

        let matches = match_prices(&event(), &prices, &meters);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].price.id, "p4");
    }

    #[test]
    fn test_non_usage_prices_skipped() {
        let meters = catalog(vec![meter("m1", "api_call")]);
        let mut fixed = Price::flat_fee("p1", "m1", dec!(1), "usd");
        fixed.price_type = PriceType::Fixed;

        assert!(match_prices(&event(), &[fixed], &meters).is_empty());
    }

    #[test]
    fn test_empty_filter_values_never_match() {
        let filters = vec![MeterFilter::new("region", Vec::<String>::new())];
        assert!(!filters_match(&event(), &filters));
        assert!(filters_match(&event(), &[]));
    }
}
