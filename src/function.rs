//! Function definitions and the function registry.
//!
//! Pricing logic is opaque to the engine: a [`FunctionDefinition`] only
//! declares which targets it applies to, the outputs it can produce, the
//! inputs it needs for a desired output, and an `execute` entry point.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cache::CacheValue;
use crate::value::{TargetSpec, Value, ValueProperties, ValueRequirement, ValueSpecification};

/// Identifier of the built-in function that sources values from market data.
pub const MARKET_DATA_SOURCING_FUNCTION: &str = "MarketDataSourcing";

/// A value produced by a function invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValue {
    /// The specification the value was produced for.
    pub specification: ValueSpecification,
    /// The value itself.
    pub value: Value,
}

impl ComputedValue {
    /// Create a computed value.
    pub fn new(specification: ValueSpecification, value: Value) -> Self {
        Self {
            specification,
            value,
        }
    }
}

/// Input values handed to a function, keyed by specification.
#[derive(Debug, Default, Clone)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, CacheValue>,
}

impl FunctionInputs {
    pub(crate) fn new(values: HashMap<ValueSpecification, CacheValue>) -> Self {
        Self { values }
    }

    /// Value for an exact input specification.
    pub fn get(&self, spec: &ValueSpecification) -> Option<&Value> {
        self.values.get(spec).and_then(CacheValue::value)
    }

    /// First computed input with the given value name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .filter(|(spec, _)| spec.name() == name)
            .find_map(|(_, value)| value.value())
    }

    /// Numeric input by value name.
    pub fn f64(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(Value::as_f64)
    }

    /// Input specifications whose value is a not-calculated sentinel.
    pub fn missing(&self) -> Vec<ValueSpecification> {
        let mut missing: Vec<_> = self
            .values
            .iter()
            .filter(|(_, value)| value.value().is_none())
            .map(|(spec, _)| spec.clone())
            .collect();
        missing.sort();
        missing
    }

    /// Iterate over all inputs.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &CacheValue)> {
        self.values.iter()
    }
}

/// An opaque function the engine can bind requirements to and execute.
pub trait FunctionDefinition: Send + Sync {
    /// Unique identifier of the function.
    fn id(&self) -> &str;

    /// Returns `true` if the function can compute values for `target`.
    fn can_apply_to(&self, target: &TargetSpec) -> bool;

    /// Maximal output specifications for `target`. Unbound properties are wildcards.
    fn results(&self, target: &TargetSpec) -> Vec<ValueSpecification>;

    /// Input requirements needed to produce `desired`, or `None` if the
    /// function cannot produce it after all.
    fn requirements(
        &self,
        target: &TargetSpec,
        desired: &ValueRequirement,
    ) -> Option<Vec<ValueRequirement>>;

    /// Returns `true` if the function should run even when some inputs are
    /// not-calculated sentinels.
    fn can_handle_missing_inputs(&self) -> bool {
        false
    }

    /// Compute the desired outputs.
    fn execute(
        &self,
        target: &TargetSpec,
        inputs: &FunctionInputs,
        desired: &[ValueSpecification],
    ) -> anyhow::Result<Vec<ComputedValue>>;
}

/// A function bound into a graph. Compared and hashed by function id.
#[derive(Clone)]
pub struct ParameterizedFunction {
    function: Arc<dyn FunctionDefinition>,
}

impl ParameterizedFunction {
    /// Wrap a function definition.
    pub fn new(function: Arc<dyn FunctionDefinition>) -> Self {
        Self { function }
    }

    /// The built-in market-data-sourcing function.
    pub fn market_data_sourcing() -> Self {
        Self::new(Arc::new(MarketDataSourcing))
    }

    /// Function identifier.
    pub fn id(&self) -> &str {
        self.function.id()
    }

    /// Underlying definition.
    pub fn definition(&self) -> &Arc<dyn FunctionDefinition> {
        &self.function
    }

    /// Returns `true` for the market-data-sourcing function.
    pub fn is_market_data_sourcing(&self) -> bool {
        self.id() == MARKET_DATA_SOURCING_FUNCTION
    }
}

impl PartialEq for ParameterizedFunction {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ParameterizedFunction {}

impl Hash for ParameterizedFunction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for ParameterizedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.id())
    }
}

struct MarketDataSourcing;

impl FunctionDefinition for MarketDataSourcing {
    fn id(&self) -> &str {
        MARKET_DATA_SOURCING_FUNCTION
    }

    fn can_apply_to(&self, _target: &TargetSpec) -> bool {
        false
    }

    fn results(&self, _target: &TargetSpec) -> Vec<ValueSpecification> {
        Vec::new()
    }

    fn requirements(
        &self,
        _target: &TargetSpec,
        _desired: &ValueRequirement,
    ) -> Option<Vec<ValueRequirement>> {
        None
    }

    fn execute(
        &self,
        _target: &TargetSpec,
        _inputs: &FunctionInputs,
        _desired: &[ValueSpecification],
    ) -> anyhow::Result<Vec<ComputedValue>> {
        anyhow::bail!("market data values are loaded into the cache, never computed")
    }
}

/// A candidate binding for a requirement.
#[derive(Clone, Debug)]
pub struct FunctionCandidate {
    /// The function.
    pub function: ParameterizedFunction,
    /// Every output the function produces for the target.
    pub outputs: Vec<ValueSpecification>,
    /// Inputs needed to produce the requested output.
    pub inputs: Vec<ValueRequirement>,
}

/// Lazily enumerates candidate bindings for requirements.
pub trait FunctionRegistry: Send + Sync {
    /// Candidates that may satisfy `requirement`, in priority order.
    ///
    /// The iterator is consumed step by step as the search backtracks, so
    /// expensive lookups should be deferred into `next`.
    fn candidates(
        &self,
        requirement: &ValueRequirement,
    ) -> Box<dyn Iterator<Item = FunctionCandidate> + Send>;
}

/// Registry over an ordered list of function definitions.
///
/// Cheap to clone.
#[derive(Clone, Default)]
pub struct FunctionRepository {
    functions: Arc<Vec<Arc<dyn FunctionDefinition>>>,
}

impl FunctionRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function. Earlier functions take priority.
    pub fn with_function(mut self, function: impl FunctionDefinition + 'static) -> Self {
        Arc::make_mut(&mut self.functions).push(Arc::new(function));
        self
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns `true` if no functions are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionRegistry for FunctionRepository {
    fn candidates(
        &self,
        requirement: &ValueRequirement,
    ) -> Box<dyn Iterator<Item = FunctionCandidate> + Send> {
        let functions = Arc::clone(&self.functions);
        let requirement = requirement.clone();
        Box::new((0..functions.len()).filter_map(move |index| {
            let function = &functions[index];
            let target = &requirement.target;
            if !function.can_apply_to(target) {
                return None;
            }
            let outputs = function.results(target);
            if !outputs.iter().any(|o| o.name() == requirement.name) {
                return None;
            }
            let inputs = function.requirements(target, &requirement)?;
            Some(FunctionCandidate {
                function: ParameterizedFunction::new(Arc::clone(function)),
                outputs,
                inputs,
            })
        }))
    }
}

type Compute = dyn Fn(&TargetSpec, &FunctionInputs) -> anyhow::Result<Value> + Send + Sync;

/// Function built from a closure producing a single named output.
///
/// Inputs are requested by value name, on the same target unless an explicit
/// target is given. Counts its invocations.
///
/// ```ignore
/// let pv = SimpleFunction::new("F1", "PV")
///     .with_output_properties(ValueProperties::none().with_any("ccy"))
///     .with_input("MarketRate")
///     .computing(|_, inputs| Ok(Value::new(inputs.f64("MarketRate").unwrap_or(0.0) * 100.0)));
/// ```
#[derive(Clone)]
pub struct SimpleFunction {
    id: String,
    output: String,
    output_properties: ValueProperties,
    target_kind: Option<String>,
    inputs: Vec<(Option<TargetSpec>, ValueRequirementTemplate)>,
    handles_missing: bool,
    compute: Arc<Compute>,
    calls: Arc<AtomicUsize>,
}

#[derive(Clone, Debug)]
struct ValueRequirementTemplate {
    name: String,
    constraints: ValueProperties,
}

impl SimpleFunction {
    /// Create a function `id` producing `output`. Computes `0.0` until
    /// [`computing`](Self::computing) is called.
    pub fn new(id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output: output.into(),
            output_properties: ValueProperties::none(),
            target_kind: None,
            inputs: Vec::new(),
            handles_missing: false,
            compute: Arc::new(|_, _| Ok(Value::new(0.0_f64))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Maximal properties of the output. Wildcards are narrowed by requirements.
    pub fn with_output_properties(mut self, properties: ValueProperties) -> Self {
        self.output_properties = properties;
        self
    }

    /// Restrict the function to targets of one kind.
    pub fn for_target_kind(mut self, kind: impl Into<String>) -> Self {
        self.target_kind = Some(kind.into());
        self
    }

    /// Require a value on the same target.
    pub fn with_input(self, name: impl Into<String>) -> Self {
        self.with_constrained_input(None, name, ValueProperties::none())
    }

    /// Require a value on another target.
    pub fn with_input_on(self, target: TargetSpec, name: impl Into<String>) -> Self {
        self.with_constrained_input(Some(target), name, ValueProperties::none())
    }

    /// Require a value with constraints, on `target` or the function's own target.
    pub fn with_constrained_input(
        mut self,
        target: Option<TargetSpec>,
        name: impl Into<String>,
        constraints: ValueProperties,
    ) -> Self {
        self.inputs.push((
            target,
            ValueRequirementTemplate {
                name: name.into(),
                constraints,
            },
        ));
        self
    }

    /// Run even when inputs are not-calculated sentinels.
    pub fn handling_missing_inputs(mut self) -> Self {
        self.handles_missing = true;
        self
    }

    /// Set the computation.
    pub fn computing<F>(mut self, compute: F) -> Self
    where
        F: Fn(&TargetSpec, &FunctionInputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.compute = Arc::new(compute);
        self
    }

    /// Number of times `execute` has run, shared across clones.
    pub fn invocations(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FunctionDefinition for SimpleFunction {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_apply_to(&self, target: &TargetSpec) -> bool {
        self.target_kind
            .as_deref()
            .map_or(true, |kind| kind == target.kind)
    }

    fn results(&self, target: &TargetSpec) -> Vec<ValueSpecification> {
        vec![ValueSpecification::new(
            self.output.clone(),
            target.clone(),
            self.output_properties.clone(),
        )]
    }

    fn requirements(
        &self,
        target: &TargetSpec,
        _desired: &ValueRequirement,
    ) -> Option<Vec<ValueRequirement>> {
        Some(
            self.inputs
                .iter()
                .map(|(input_target, template)| {
                    ValueRequirement::with_constraints(
                        template.name.clone(),
                        input_target.clone().unwrap_or_else(|| target.clone()),
                        template.constraints.clone(),
                    )
                })
                .collect(),
        )
    }

    fn can_handle_missing_inputs(&self) -> bool {
        self.handles_missing
    }

    fn execute(
        &self,
        target: &TargetSpec,
        inputs: &FunctionInputs,
        desired: &[ValueSpecification],
    ) -> anyhow::Result<Vec<ComputedValue>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = (self.compute)(target, inputs)?;
        Ok(desired
            .iter()
            .map(|spec| ComputedValue::new(spec.clone(), value.clone()))
            .collect())
    }
}
