//! Requirement and specification model.
//!
//! A [`ValueRequirement`] says *what* is wanted: a target, a value name and a
//! set of property constraints. A [`ValueSpecification`] says *what was
//! produced*: the same identity with resolved properties. Many requirements
//! with looser constraints may be satisfied by one specification.
//!
//! Specifications are interned through [`SpecInterner`] so that structurally
//! equal specifications share one allocation and pointer equality becomes a
//! valid fast path for comparisons.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use papaya::HashMap;
use serde::{Deserialize, Serialize};

/// Identifies the object a value is computed for (a trade, a curve, a portfolio node).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Kind of target, e.g. `"SECURITY"` or `"PRIMITIVE"`.
    pub kind: String,
    /// Identifier of the target within its kind.
    pub id: String,
}

impl TargetSpec {
    /// Create a new target specification.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.kind, self.id)
    }
}

/// Allowed values for a single property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyValues {
    /// Any value is acceptable (or, on a specification, the value is unbound).
    Any,
    /// One of a finite set of values.
    Values(BTreeSet<String>),
}

impl PropertyValues {
    fn intersect(&self, other: &PropertyValues) -> Option<PropertyValues> {
        match (self, other) {
            (PropertyValues::Any, o) => Some(o.clone()),
            (s, PropertyValues::Any) => Some(s.clone()),
            (PropertyValues::Values(a), PropertyValues::Values(b)) => {
                let common: BTreeSet<String> = a.intersection(b).cloned().collect();
                if common.is_empty() {
                    None
                } else {
                    Some(PropertyValues::Values(common))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
struct Property {
    values: PropertyValues,
    optional: bool,
}

/// Ordered mapping from property name to allowed values.
///
/// Used both as a constraint set on requirements and as the resolved
/// property set of specifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueProperties {
    properties: BTreeMap<String, Property>,
}

impl ValueProperties {
    /// An empty property set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add (or extend) a property with a single value.
    pub fn with(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_values(name, [value.into()])
    }

    /// Add (or extend) a property with several allowed values.
    pub fn with_values<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self
            .properties
            .entry(name.into())
            .or_insert_with(|| Property {
                values: PropertyValues::Values(BTreeSet::new()),
                optional: false,
            });
        if let PropertyValues::Values(set) = &mut entry.values {
            set.extend(values.into_iter().map(Into::into));
        }
        self
    }

    /// Add a wildcard property.
    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        let entry = self.properties.entry(name.into()).or_insert(Property {
            values: PropertyValues::Any,
            optional: false,
        });
        entry.values = PropertyValues::Any;
        self
    }

    /// Mark a property optional, adding it as a wildcard if absent.
    pub fn with_optional(mut self, name: impl Into<String>) -> Self {
        self.properties
            .entry(name.into())
            .or_insert(Property {
                values: PropertyValues::Any,
                optional: true,
            })
            .optional = true;
        self
    }

    /// Remove a property.
    pub fn without(mut self, name: &str) -> Self {
        self.properties.remove(name);
        self
    }

    /// Returns `true` if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Property names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Allowed values for a property, if present.
    pub fn values(&self, name: &str) -> Option<&PropertyValues> {
        self.properties.get(name).map(|p| &p.values)
    }

    /// The single bound value of a property, if it has exactly one.
    pub fn value(&self, name: &str) -> Option<&str> {
        match self.values(name)? {
            PropertyValues::Values(set) if set.len() == 1 => set.iter().next().map(String::as_str),
            _ => None,
        }
    }

    /// Returns `true` if the property is flagged optional.
    pub fn is_optional(&self, name: &str) -> bool {
        self.properties.get(name).is_some_and(|p| p.optional)
    }

    /// Returns `true` if `other` satisfies every constraint in `self`.
    ///
    /// A missing property only satisfies an optional constraint. A wildcard
    /// on either side matches anything; otherwise the value sets must share
    /// at least one member.
    pub fn is_satisfied_by(&self, other: &ValueProperties) -> bool {
        self.properties.iter().all(|(name, constraint)| {
            match other.properties.get(name) {
                None => constraint.optional,
                Some(offered) => constraint.values.intersect(&offered.values).is_some(),
            }
        })
    }

    /// Returns `true` if no property present in both sets has disjoint values.
    pub fn is_compatible_with(&self, other: &ValueProperties) -> bool {
        self.properties.iter().all(|(name, mine)| {
            other
                .properties
                .get(name)
                .map_or(true, |theirs| mine.values.intersect(&theirs.values).is_some())
        })
    }

    /// Compose two property sets.
    ///
    /// Properties present in both are narrowed to the intersection of their
    /// values (wildcards take the other side's values); an empty intersection
    /// keeps `self`'s values. Properties present in only one side are kept.
    /// A composed property is optional only if both sides mark it optional.
    pub fn compose(&self, other: &ValueProperties) -> ValueProperties {
        let mut properties = self.properties.clone();
        for (name, theirs) in &other.properties {
            match properties.get_mut(name) {
                Some(mine) => {
                    if let Some(values) = mine.values.intersect(&theirs.values) {
                        mine.values = values;
                    }
                    mine.optional = mine.optional && theirs.optional;
                }
                None => {
                    properties.insert(name.clone(), theirs.clone());
                }
            }
        }
        ValueProperties { properties }
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, property)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", name)?;
            if property.optional {
                write!(f, "?")?;
            }
            match &property.values {
                PropertyValues::Any => write!(f, "=*")?,
                PropertyValues::Values(set) => {
                    let joined: Vec<&str> = set.iter().map(String::as_str).collect();
                    write!(f, "=[{}]", joined.join(","))?;
                }
            }
        }
        write!(f, "}}")
    }
}

/// What is wanted: a target, a value name and constraints on its properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRequirement {
    /// Name of the value, e.g. `"PV"`.
    pub name: String,
    /// Target the value is computed for.
    pub target: TargetSpec,
    /// Property constraints.
    #[serde(default)]
    pub constraints: ValueProperties,
}

impl ValueRequirement {
    /// Create a requirement with no constraints.
    pub fn new(name: impl Into<String>, target: TargetSpec) -> Self {
        Self::with_constraints(name, target, ValueProperties::none())
    }

    /// Create a requirement with constraints.
    pub fn with_constraints(
        name: impl Into<String>,
        target: TargetSpec,
        constraints: ValueProperties,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            constraints,
        }
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.name, self.target, self.constraints)
    }
}

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SpecInner {
    name: String,
    target: TargetSpec,
    properties: ValueProperties,
}

/// What was produced: a value identity with resolved properties.
///
/// Immutable and cheap to clone. Equality is structural with a pointer fast
/// path, so interned instances compare in constant time.
#[derive(Clone)]
pub struct ValueSpecification(Arc<SpecInner>);

impl ValueSpecification {
    /// Create a (non-interned) specification.
    pub fn new(name: impl Into<String>, target: TargetSpec, properties: ValueProperties) -> Self {
        Self(Arc::new(SpecInner {
            name: name.into(),
            target,
            properties,
        }))
    }

    /// Value name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Target the value belongs to.
    pub fn target(&self) -> &TargetSpec {
        &self.0.target
    }

    /// Resolved properties.
    pub fn properties(&self) -> &ValueProperties {
        &self.0.properties
    }

    /// Returns `true` if both handles share one allocation.
    pub fn ptr_eq(&self, other: &ValueSpecification) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns `true` if this specification satisfies the requirement.
    pub fn satisfies(&self, requirement: &ValueRequirement) -> bool {
        self.0.name == requirement.name
            && self.0.target == requirement.target
            && requirement.constraints.is_satisfied_by(&self.0.properties)
    }

    /// A specification with the same name and target but different properties.
    pub fn with_properties(&self, properties: ValueProperties) -> Self {
        Self::new(self.0.name.clone(), self.0.target.clone(), properties)
    }

    /// A specification with the same name and properties on another target.
    pub fn with_target(&self, target: TargetSpec) -> Self {
        Self::new(self.0.name.clone(), target, self.0.properties.clone())
    }

    /// Narrow this specification by composing its properties with `other`.
    pub fn compose(&self, other: &ValueProperties) -> Self {
        self.with_properties(self.0.properties.compose(other))
    }

    /// The requirement exactly matching this specification.
    pub fn to_requirement(&self) -> ValueRequirement {
        ValueRequirement::with_constraints(
            self.0.name.clone(),
            self.0.target.clone(),
            self.0.properties.clone(),
        )
    }
}

impl PartialEq for ValueSpecification {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for ValueSpecification {}

impl Hash for ValueSpecification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for ValueSpecification {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueSpecification {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spec({})", self)
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.0.name, self.0.target, self.0.properties)
    }
}

/// Concurrent interner for value specifications.
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct SpecInterner {
    table: Arc<HashMap<ValueSpecification, ValueSpecification, ahash::RandomState>>,
}

impl Default for SpecInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecInterner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self {
            table: Arc::new(HashMap::with_hasher(ahash::RandomState::new())),
        }
    }

    /// Return the canonical instance structurally equal to `spec`.
    pub fn intern(&self, spec: ValueSpecification) -> ValueSpecification {
        let table = self.table.pin();
        table.get_or_insert(spec.clone(), spec).clone()
    }

    /// Number of distinct specifications interned so far.
    pub fn len(&self) -> usize {
        self.table.pin().len()
    }

    /// Returns `true` if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Object-safe equality comparison for computed values.
pub trait DynEq: Any {
    /// Returns `true` if `other` has the same concrete type and is equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: PartialEq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Payload of a computed value. Implemented for every `PartialEq + Debug` type.
pub trait ValueData: DynEq + fmt::Debug + Send + Sync {
    /// The value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: PartialEq + fmt::Debug + Send + Sync + 'static> ValueData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An opaque computed value, shared between caches without copying.
#[derive(Clone)]
pub struct Value(Arc<dyn ValueData>);

impl Value {
    /// Wrap a concrete value.
    pub fn new<T: PartialEq + fmt::Debug + Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to a concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref::<T>()
    }

    /// Convenience accessor for numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        self.downcast_ref::<f64>().copied()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || (*self.0).dyn_eq((*other.0).as_any())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade() -> TargetSpec {
        TargetSpec::new("SECURITY", "T1")
    }

    #[test]
    fn test_satisfied_by_requires_non_optional_properties() {
        let constraints = ValueProperties::none().with("ccy", "USD");
        assert!(constraints.is_satisfied_by(&ValueProperties::none().with("ccy", "USD")));
        assert!(constraints.is_satisfied_by(&ValueProperties::none().with_any("ccy")));
        assert!(!constraints.is_satisfied_by(&ValueProperties::none().with("ccy", "EUR")));
        assert!(!constraints.is_satisfied_by(&ValueProperties::none()));

        let optional = ValueProperties::none().with_optional("curve");
        assert!(optional.is_satisfied_by(&ValueProperties::none()));
    }

    #[test]
    fn test_compose_narrows_wildcards_and_keeps_union() {
        let a = ValueProperties::none().with("a", "1").with_any("b");
        let b = ValueProperties::none().with_any("a").with("b", "2").with("c", "3");
        let composed = a.compose(&b);
        assert_eq!(composed.value("a"), Some("1"));
        assert_eq!(composed.value("b"), Some("2"));
        assert_eq!(composed.value("c"), Some("3"));
        assert!(a.is_compatible_with(&b));
    }

    #[test]
    fn test_compose_with_disjoint_values_keeps_self() {
        let a = ValueProperties::none().with("ccy", "USD");
        let b = ValueProperties::none().with("ccy", "EUR");
        assert!(!a.is_compatible_with(&b));
        assert_eq!(a.compose(&b).value("ccy"), Some("USD"));
    }

    #[test]
    fn test_interner_returns_canonical_instance() {
        let interner = SpecInterner::new();
        let props = ValueProperties::none().with("ccy", "USD");
        let first = interner.intern(ValueSpecification::new("PV", trade(), props.clone()));
        let second = interner.intern(ValueSpecification::new("PV", trade(), props));
        assert!(first.ptr_eq(&second));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_spec_satisfies_requirement() {
        let spec = ValueSpecification::new(
            "PV",
            trade(),
            ValueProperties::none().with("ccy", "USD").with_any("curve"),
        );
        let req = ValueRequirement::with_constraints(
            "PV",
            trade(),
            ValueProperties::none().with("ccy", "USD"),
        );
        assert!(spec.satisfies(&req));
        assert!(!spec.satisfies(&ValueRequirement::new("Delta", trade())));
    }

    #[test]
    fn test_value_equality_is_structural() {
        assert_eq!(Value::new(0.05_f64), Value::new(0.05_f64));
        assert_ne!(Value::new(0.05_f64), Value::new(1_i64));
        assert_eq!(Value::new(String::from("x")).downcast_ref::<String>().map(String::as_str), Some("x"));
    }
}
