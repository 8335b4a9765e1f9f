//! Per-cycle result caches.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use papaya::HashMap;

use crate::value::{Value, ValueSpecification};

/// Why a value was not calculated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotCalculated {
    /// The market data snapshot had no value.
    MissingMarketData,
    /// Execution was suppressed by the blacklist or reused from a failed node.
    Suppressed,
    /// The producing function failed or did not produce the output.
    EvaluationError,
    /// An input of the producing node was itself not calculated.
    MissingInputs,
}

impl fmt::Display for NotCalculated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotCalculated::MissingMarketData => "Missing market data",
            NotCalculated::Suppressed => "Execution suppressed",
            NotCalculated::EvaluationError => "Evaluation error",
            NotCalculated::MissingInputs => "Missing inputs",
        };
        f.write_str(s)
    }
}

/// A cache entry: either a computed value or a not-calculated sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Computed or loaded value.
    Value(Value),
    /// Sentinel standing in for a value that could not be produced.
    NotCalculated(NotCalculated),
}

impl CacheValue {
    /// The computed value, if this is not a sentinel.
    pub fn value(&self) -> Option<&Value> {
        match self {
            CacheValue::Value(v) => Some(v),
            CacheValue::NotCalculated(_) => None,
        }
    }

    /// The sentinel, if this is one.
    pub fn not_calculated(&self) -> Option<NotCalculated> {
        match self {
            CacheValue::Value(_) => None,
            CacheValue::NotCalculated(reason) => Some(*reason),
        }
    }
}

impl From<Value> for CacheValue {
    fn from(value: Value) -> Self {
        CacheValue::Value(value)
    }
}

impl From<NotCalculated> for CacheValue {
    fn from(reason: NotCalculated) -> Self {
        CacheValue::NotCalculated(reason)
    }
}

impl fmt::Display for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Value(v) => write!(f, "{}", v),
            CacheValue::NotCalculated(reason) => write!(f, "<{}>", reason),
        }
    }
}

/// Thread-safe mapping from specification to cache entry for one
/// calculation configuration in one cycle.
///
/// Uses papaya's lock-free HashMap, so readers never block writers.
pub struct ResultCache {
    entries: HashMap<ValueSpecification, CacheValue, ahash::RandomState>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("len", &self.len())
            .finish()
    }
}

impl ResultCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Get an entry.
    pub fn get(&self, spec: &ValueSpecification) -> Option<CacheValue> {
        self.entries.pin().get(spec).cloned()
    }

    /// Get several entries at once.
    pub fn get_many<'a, I>(&self, specs: I) -> Vec<(ValueSpecification, Option<CacheValue>)>
    where
        I: IntoIterator<Item = &'a ValueSpecification>,
    {
        let pinned = self.entries.pin();
        specs
            .into_iter()
            .map(|spec| (spec.clone(), pinned.get(spec).cloned()))
            .collect()
    }

    /// Insert or replace an entry.
    pub fn put(&self, spec: ValueSpecification, value: impl Into<CacheValue>) {
        self.entries.pin().insert(spec, value.into());
    }

    /// Insert a batch of entries under a single pin.
    pub fn put_many<I>(&self, values: I)
    where
        I: IntoIterator<Item = (ValueSpecification, CacheValue)>,
    {
        let pinned = self.entries.pin();
        for (spec, value) in values {
            pinned.insert(spec, value);
        }
    }

    /// Returns `true` if an entry exists for `spec`.
    pub fn contains(&self, spec: &ValueSpecification) -> bool {
        self.entries.pin().contains_key(spec)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries sorted by specification.
    pub fn sorted_entries(&self) -> Vec<(ValueSpecification, CacheValue)> {
        let mut entries: Vec<_> = self
            .entries
            .pin()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Write every entry, sorted by key, as `key = value` lines.
    pub fn dump_to(&self, path: &Path) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for (spec, value) in self.sorted_entries() {
            writeln!(out, "{} = {}", spec, value)?;
        }
        out.flush()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.pin().clear();
    }
}

/// Identifier of a computation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleId(pub u64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates and releases result caches per cycle and configuration.
pub trait ComputationCacheSource: Send + Sync {
    /// Cache for `configuration` in `cycle`, created on first use.
    fn get_cache(&self, cycle: CycleId, configuration: &str) -> Arc<ResultCache>;

    /// Drop every cache belonging to `cycle`.
    fn release_caches(&self, cycle: CycleId);
}

/// In-memory cache source.
pub struct InMemoryCacheSource {
    caches: HashMap<(CycleId, String), Arc<ResultCache>, ahash::RandomState>,
}

impl Default for InMemoryCacheSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheSource {
    /// Create an empty cache source.
    pub fn new() -> Self {
        Self {
            caches: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Number of live caches.
    pub fn live_caches(&self) -> usize {
        self.caches.pin().len()
    }
}

impl ComputationCacheSource for InMemoryCacheSource {
    fn get_cache(&self, cycle: CycleId, configuration: &str) -> Arc<ResultCache> {
        self.caches
            .pin()
            .get_or_insert_with((cycle, configuration.to_string()), || {
                Arc::new(ResultCache::new())
            })
            .clone()
    }

    fn release_caches(&self, cycle: CycleId) {
        let pinned = self.caches.pin();
        let keys: Vec<_> = pinned
            .keys()
            .filter(|(id, _)| *id == cycle)
            .cloned()
            .collect();
        for key in keys {
            pinned.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{TargetSpec, ValueProperties};

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, TargetSpec::new("PRIMITIVE", "X"), ValueProperties::none())
    }

    #[test]
    fn test_put_and_get_many() {
        let cache = ResultCache::new();
        cache.put_many([
            (spec("A"), CacheValue::Value(Value::new(1.0_f64))),
            (spec("B"), NotCalculated::MissingMarketData.into()),
        ]);
        let got = cache.get_many([&spec("A"), &spec("B"), &spec("C")]);
        assert_eq!(got[0].1, Some(CacheValue::Value(Value::new(1.0_f64))));
        assert_eq!(
            got[1].1.as_ref().and_then(CacheValue::not_calculated),
            Some(NotCalculated::MissingMarketData)
        );
        assert_eq!(got[2].1, None);
    }

    #[test]
    fn test_dump_is_sorted() {
        let cache = ResultCache::new();
        cache.put(spec("Zeta"), Value::new(2_i64));
        cache.put(spec("Alpha"), Value::new(1_i64));
        let path = std::env::temp_dir().join(format!("calc-flow-dump-{}.txt", std::process::id()));
        cache.dump_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Alpha"));
        assert!(lines[1].starts_with("Zeta"));
    }

    #[test]
    fn test_cache_source_releases_per_cycle() {
        let source = InMemoryCacheSource::new();
        let a = source.get_cache(CycleId(1), "Default");
        let again = source.get_cache(CycleId(1), "Default");
        assert!(Arc::ptr_eq(&a, &again));
        source.get_cache(CycleId(2), "Default");
        source.release_caches(CycleId(1));
        assert_eq!(source.live_caches(), 1);
    }
}
