//! Deduplication hashing
//!
//! The hash is the storage-side uniqueness key of a usage record. It is a
//! pure function of the event and the meter, so redelivery and backfill
//! produce the same key as the first run.

use tallyline_common::{AggregationType, Event, Meter};

/// Hash input for an (event, meter) pair.
///
/// `event_name:event_id` for every aggregation except COUNT_UNIQUE with a
/// field present on the event, which hashes `event_name:field:value` so
/// repeated values collapse to one billable unit.
pub fn hash_input(event: &Event, meter: &Meter) -> String {
    let agg = &meter.aggregation;
    if agg.kind == AggregationType::CountUnique && !agg.field.is_empty() {
        if let Some(value) = event.property(&agg.field) {
            return format!("{}:{}:{}", event.event_name, agg.field, value);
        }
    }
    format!("{}:{}", event.event_name, event.id)
}

/// 256-bit hex digest identifying the billable unit
pub fn unique_hash(event: &Event, meter: &Meter) -> String {
    blake3::hash(hash_input(event, meter).as_bytes()).to_hex().to_string()
}
