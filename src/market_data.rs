//! Market data collaborators: availability during resolution, snapshots
//! during execution, and override (shift) operations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::{TargetSpec, Value, ValueProperties, ValueRequirement, ValueSpecification};

/// Default property on a calculation configuration holding a shift expression
/// applied to every market data value loaded for it.
pub const MARKET_DATA_SHIFT: &str = "MARKET_DATA_SHIFT";

/// Decides during resolution whether a requirement is sourced from market data.
pub trait MarketDataAvailability: Send + Sync {
    /// The specification market data would supply for `requirement`, if any.
    fn resolve(&self, requirement: &ValueRequirement) -> Option<ValueSpecification>;
}

/// Point-in-time market data used to populate a cycle's caches.
pub trait MarketDataSnapshot: Send + Sync {
    /// Currently available values for the given specifications.
    ///
    /// Specifications absent from the returned map are treated as missing.
    fn query(&self, specs: &[ValueSpecification]) -> HashMap<ValueSpecification, Value>;
}

/// Mutable in-memory market data keyed by target and value name.
///
/// Serves as both availability and snapshot. Cheap to clone; clones share
/// the same values.
#[derive(Clone, Default)]
pub struct InMemoryMarketData {
    values: Arc<RwLock<HashMap<(TargetSpec, String), Value>>>,
}

impl InMemoryMarketData {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) a value.
    pub fn set(&self, target: TargetSpec, name: impl Into<String>, value: Value) {
        self.values.write().insert((target, name.into()), value);
    }

    /// Remove a value, making it missing from subsequent snapshots.
    pub fn remove(&self, target: &TargetSpec, name: &str) {
        self.values.write().remove(&(target.clone(), name.to_string()));
    }

    /// Copy the current values into an immutable snapshot.
    pub fn snapshot(&self) -> Arc<dyn MarketDataSnapshot> {
        Arc::new(FixedSnapshot {
            values: self.values.read().clone(),
        })
    }
}

impl MarketDataAvailability for InMemoryMarketData {
    fn resolve(&self, requirement: &ValueRequirement) -> Option<ValueSpecification> {
        let key = (requirement.target.clone(), requirement.name.clone());
        if !self.values.read().contains_key(&key) {
            return None;
        }
        let spec = ValueSpecification::new(
            requirement.name.clone(),
            requirement.target.clone(),
            ValueProperties::none(),
        );
        requirement
            .constraints
            .is_satisfied_by(spec.properties())
            .then_some(spec)
    }
}

impl MarketDataSnapshot for InMemoryMarketData {
    fn query(&self, specs: &[ValueSpecification]) -> HashMap<ValueSpecification, Value> {
        lookup(&self.values.read(), specs)
    }
}

struct FixedSnapshot {
    values: HashMap<(TargetSpec, String), Value>,
}

impl MarketDataSnapshot for FixedSnapshot {
    fn query(&self, specs: &[ValueSpecification]) -> HashMap<ValueSpecification, Value> {
        lookup(&self.values, specs)
    }
}

fn lookup(
    values: &HashMap<(TargetSpec, String), Value>,
    specs: &[ValueSpecification],
) -> HashMap<ValueSpecification, Value> {
    specs
        .iter()
        .filter_map(|spec| {
            values
                .get(&(spec.target().clone(), spec.name().to_string()))
                .map(|v| (spec.clone(), v.clone()))
        })
        .collect()
}

/// Transformation applied to market data values as they are loaded.
pub trait OverrideOperation: Send + Sync {
    /// Return the (possibly) modified value for `spec`.
    fn apply(&self, spec: &ValueSpecification, value: Value) -> Value;
}

/// Compiles shift expressions into override operations.
pub trait OverrideOperationCompiler: Send + Sync {
    /// Compile `expression`, or fail if it is not understood.
    fn compile(&self, expression: &str) -> anyhow::Result<Arc<dyn OverrideOperation>>;
}

/// Compiles numeric shifts: `+x`, `-x`, `*x`, optionally restricted to one
/// value name as `Name:*1.01`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericShiftCompiler;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ShiftKind {
    Add(f64),
    Multiply(f64),
}

#[derive(Debug)]
struct NumericShift {
    value_name: Option<String>,
    kind: ShiftKind,
}

impl OverrideOperation for NumericShift {
    fn apply(&self, spec: &ValueSpecification, value: Value) -> Value {
        if self
            .value_name
            .as_deref()
            .is_some_and(|name| name != spec.name())
        {
            return value;
        }
        match value.as_f64() {
            Some(x) => Value::new(match self.kind {
                ShiftKind::Add(d) => x + d,
                ShiftKind::Multiply(m) => x * m,
            }),
            None => value,
        }
    }
}

impl OverrideOperationCompiler for NumericShiftCompiler {
    fn compile(&self, expression: &str) -> anyhow::Result<Arc<dyn OverrideOperation>> {
        let expression = expression.trim();
        let (value_name, body) = match expression.split_once(':') {
            Some((name, body)) => (Some(name.trim().to_string()), body.trim()),
            None => (None, expression),
        };
        let mut chars = body.chars();
        let op = chars
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty shift expression"))?;
        let amount: f64 = chars
            .as_str()
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid shift amount in `{}`: {}", expression, e))?;
        let kind = match op {
            '+' => ShiftKind::Add(amount),
            '-' => ShiftKind::Add(-amount),
            '*' => ShiftKind::Multiply(amount),
            other => anyhow::bail!("unsupported shift operator `{}`", other),
        };
        Ok(Arc::new(NumericShift { value_name, kind }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_spec() -> ValueSpecification {
        ValueSpecification::new("MarketRate", TargetSpec::new("SECURITY", "T"), ValueProperties::none())
    }

    #[test]
    fn test_availability_resolves_known_values() {
        let md = InMemoryMarketData::new();
        md.set(TargetSpec::new("SECURITY", "T"), "MarketRate", Value::new(0.05_f64));
        let req = ValueRequirement::new("MarketRate", TargetSpec::new("SECURITY", "T"));
        assert_eq!(md.resolve(&req), Some(rate_spec()));
        assert_eq!(md.resolve(&ValueRequirement::new("Other", TargetSpec::new("SECURITY", "T"))), None);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let md = InMemoryMarketData::new();
        md.set(TargetSpec::new("SECURITY", "T"), "MarketRate", Value::new(0.05_f64));
        let snapshot = md.snapshot();
        md.set(TargetSpec::new("SECURITY", "T"), "MarketRate", Value::new(0.06_f64));
        let values = snapshot.query(&[rate_spec()]);
        assert_eq!(values.get(&rate_spec()).and_then(Value::as_f64), Some(0.05));
    }

    #[test]
    fn test_shift_compiler() {
        let shift = NumericShiftCompiler.compile("MarketRate: *2").unwrap();
        assert_eq!(shift.apply(&rate_spec(), Value::new(0.05_f64)).as_f64(), Some(0.1));
        let add = NumericShiftCompiler.compile("+0.01").unwrap();
        let shifted = add.apply(&rate_spec(), Value::new(0.05_f64)).as_f64().unwrap();
        assert!((shifted - 0.06).abs() < 1e-12);
        assert!(NumericShiftCompiler.compile("/2").is_err());
        assert!(NumericShiftCompiler.compile("").is_err());
    }
}
