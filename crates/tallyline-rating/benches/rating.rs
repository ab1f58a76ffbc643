//! Rating hot-path benchmarks
//!
//! - Price matching against a growing catalog
//! - Quantity extraction and dedup hashing
//! - Tiered pricing with the sorted-tier cache

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tallyline_common::{
    AggregationType, Event, Meter, MeterAggregation, MeterFilter, Price, PriceTier, TierMode,
};
use tallyline_rating::{extract, match_prices, unique_hash, PricingEngine};

fn event() -> Event {
    Event::new(
        "evt-1",
        "t1",
        "ext-1",
        "llm_call",
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap(),
    )
    .with_property("model", "gpt-4")
    .with_property("tokens", 1200i64)
}

/// `n` meters on the benchmark event, every other one filtered on `model`
fn catalog(n: usize) -> (Vec<Price>, HashMap<String, Meter>) {
    let mut prices = Vec::with_capacity(n);
    let mut meters = HashMap::with_capacity(n);
    for i in 0..n {
        let meter_id = format!("m{}", i);
        let mut meter = Meter::new(
            meter_id.clone(),
            "llm_call",
            MeterAggregation::new(AggregationType::Sum, "tokens"),
        );
        if i % 2 == 0 {
            meter = meter.with_filter(MeterFilter::new("model", ["gpt-4", "gpt-4o"]));
        }
        prices.push(Price::flat_fee(format!("p{}", i), meter_id.clone(), dec!(0.0001), "usd"));
        meters.insert(meter_id, meter);
    }
    (prices, meters)
}

// ============ MATCHING BENCHMARKS ============

fn bench_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching");
    let event = event();

    for size in [4usize, 32, 256] {
        let (prices, meters) = catalog(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("match_prices", size), &size, |b, _| {
            b.iter(|| black_box(match_prices(black_box(&event), &prices, &meters)));
        });
    }

    group.finish();
}

// ============ METERING BENCHMARKS ============

fn bench_metering(c: &mut Criterion) {
    let mut group = c.benchmark_group("metering");
    let event = event();
    let sum = Meter::new("m-sum", "llm_call", MeterAggregation::new(AggregationType::Sum, "tokens"));
    let unique = Meter::new(
        "m-unique",
        "llm_call",
        MeterAggregation::new(AggregationType::CountUnique, "model"),
    );

    group.bench_function("extract_sum", |b| {
        b.iter(|| black_box(extract(black_box(&event), &sum, None)))
    });
    group.bench_function("unique_hash", |b| {
        b.iter(|| black_box(unique_hash(black_box(&event), &unique)))
    });

    group.finish();
}

// ============ PRICING BENCHMARKS ============

fn bench_pricing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pricing");
    let engine = PricingEngine::new();
    let tiers = vec![
        PriceTier::new(Some(1_000), dec!(0.01)),
        PriceTier::new(Some(10_000), dec!(0.008)),
        PriceTier::new(Some(100_000), dec!(0.005)),
        PriceTier::new(None, dec!(0.002)),
    ];
    let slab = Price::tiered("p-slab", "m1", "usd", TierMode::Slab, tiers.clone());
    let volume = Price::tiered("p-volume", "m1", "usd", TierMode::Volume, tiers);
    let flat = Price::flat_fee("p-flat", "m1", dec!(0.0001), "usd");

    for quantity in [500u64, 50_000, 5_000_000] {
        let qty = Decimal::from(quantity);
        group.bench_with_input(BenchmarkId::new("slab", quantity), &qty, |b, qty| {
            b.iter(|| black_box(engine.cost(&slab, black_box(*qty))))
        });
        group.bench_with_input(BenchmarkId::new("volume", quantity), &qty, |b, qty| {
            b.iter(|| black_box(engine.cost(&volume, black_box(*qty))))
        });
    }
    group.bench_function("flat_fee", |b| {
        b.iter(|| black_box(engine.cost(&flat, black_box(dec!(123456.789)))))
    });

    group.finish();
}

criterion_group!(benches, bench_matching, bench_metering, bench_pricing);
criterion_main!(benches);
