//! Sorted tier cache
//!
//! Tiered pricing walks tiers in ascending upper-bound order. Sorting happens
//! once per tier configuration instead of on every cost calculation; an entry
//! is replaced as soon as any tier bound, amount or the tier mode changes.

use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use tallyline_common::{Price, PriceTier};
use tracing::{debug, instrument};

/// Digest of a price's tier configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TierVersion(blake3::Hash);

impl From<&Price> for TierVersion {
    fn from(price: &Price) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("{:?}", price.tier_mode).as_bytes());
        for tier in &price.tiers {
            match tier.up_to {
                Some(up_to) => hasher.update(&[1]).update(&up_to.to_le_bytes()),
                None => hasher.update(&[0]),
            };
            hasher.update(&tier.unit_amount.serialize());
            match tier.flat_amount {
                Some(flat) => hasher.update(&[1]).update(&flat.serialize()),
                None => hasher.update(&[0]),
            };
        }
        Self(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
struct CachedTiers {
    version: TierVersion,
    tiers: Arc<Vec<PriceTier>>,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached prices
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Tiers sorted ascending by `up_to`, open-ended tiers last
pub fn sort_tiers(tiers: &[PriceTier]) -> Vec<PriceTier> {
    let mut sorted = tiers.to_vec();
    sorted.sort_by(|a, b| match (a.up_to, b.up_to) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    sorted
}

/// In-memory sorted-tier cache keyed by price ID
pub struct TierCache {
    cache: DashMap<String, CachedTiers>,
    max_entries: usize,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl TierCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            max_entries,
            hits: Default::default(),
            misses: Default::default(),
        }
    }

    /// Sorted tiers for `price`, sorting and caching on a miss or a stale entry
    #[instrument(skip(self, price), fields(price_id = %price.id))]
    pub fn sorted_tiers(&self, price: &Price) -> Arc<Vec<PriceTier>> {
        use std::sync::atomic::Ordering::Relaxed;

        let version = TierVersion::from(price);
        if let Some(entry) = self.cache.get(&price.id) {
            if entry.version == version {
                self.hits.fetch_add(1, Relaxed);
                return Arc::clone(&entry.tiers);
            }
            debug!("Tier configuration changed, re-sorting");
        }
        self.misses.fetch_add(1, Relaxed);

        let tiers = Arc::new(sort_tiers(&price.tiers));

        // Evict an arbitrary entry when at capacity
        if self.cache.len() >= self.max_entries && !self.cache.contains_key(&price.id) {
            if let Some(victim) = self.cache.iter().next().map(|e| e.key().clone()) {
                self.cache.remove(&victim);
            }
        }

        self.cache.insert(
            price.id.clone(),
            CachedTiers {
                version,
                tiers: Arc::clone(&tiers),
            },
        );
        tiers
    }

    /// Drop the cached tiers of one price
    pub fn invalidate(&self, price_id: &str) -> bool {
        self.cache.remove(price_id).is_some()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        use std::sync::atomic::Ordering::Relaxed;
        CacheStats {
            entry_count: self.cache.len() as u64,
            hits: self.hits.load(Relaxed),
            misses: self.misses.load(Relaxed),
        }
    }
}

impl Default for TierCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}
