//! Shared fixtures: a trade priced from one market rate.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use calc_flow::{
    CalculationConfiguration, CompiledViewDefinition, EngineConfig, EngineContext,
    EngineContextBuilder, FunctionRepository, InMemoryMarketData, SimpleFunction,
    SingleComputationCycle, TargetSpec, Value, ValueProperties, ValueRequirement, ViewCompiler,
    ViewDefinition,
};

pub const NOTIONAL: f64 = 1_000_000.0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn trade() -> TargetSpec {
    TargetSpec::new("SECURITY", "T")
}

pub fn usd() -> ValueProperties {
    ValueProperties::none().with("ccy", "USD")
}

/// `(trade, "PV", {ccy=USD})`
pub fn pv_requirement() -> ValueRequirement {
    ValueRequirement::with_constraints("PV", trade(), usd())
}

pub fn pv_of(rate: f64) -> f64 {
    NOTIONAL * rate
}

/// `F1`: PV in USD from the trade's `MarketRate`.
pub fn f1() -> SimpleFunction {
    SimpleFunction::new("F1", "PV")
        .with_output_properties(usd())
        .with_input("MarketRate")
        .computing(|_, inputs| {
            let rate = inputs
                .f64("MarketRate")
                .ok_or_else(|| anyhow::anyhow!("MarketRate missing"))?;
            Ok(Value::new(pv_of(rate)))
        })
}

pub fn market_data(rate: f64) -> InMemoryMarketData {
    let md = InMemoryMarketData::new();
    md.set(trade(), "MarketRate", Value::new(rate));
    md
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_threads(4)
        .with_poll_timeout(Duration::from_millis(50))
}

pub fn engine(functions: FunctionRepository, md: &InMemoryMarketData) -> EngineContext {
    engine_with(functions, md, |builder| builder)
}

pub fn engine_with(
    functions: FunctionRepository,
    md: &InMemoryMarketData,
    customize: impl FnOnce(EngineContextBuilder) -> EngineContextBuilder,
) -> EngineContext {
    init_tracing();
    customize(
        EngineContext::builder(Arc::new(functions), Arc::new(md.clone())).with_config(test_config()),
    )
    .build()
    .unwrap()
}

pub fn view(requirements: Vec<ValueRequirement>) -> ViewDefinition {
    let mut configuration = CalculationConfiguration::new("Default");
    for requirement in requirements {
        configuration = configuration.with_requirement(requirement);
    }
    ViewDefinition::new("Test").with_configuration(configuration)
}

pub fn compile(engine: &EngineContext, view: &ViewDefinition) -> Arc<CompiledViewDefinition> {
    Arc::new(ViewCompiler::new(engine.clone()).compile(view).unwrap())
}

pub fn cycle(
    engine: &EngineContext,
    view: &Arc<CompiledViewDefinition>,
    md: &InMemoryMarketData,
) -> SingleComputationCycle {
    SingleComputationCycle::new(
        engine.next_cycle_id(),
        Arc::clone(view),
        engine.clone(),
        md.snapshot(),
    )
}

pub fn as_f64(value: Option<calc_flow::CacheValue>) -> Option<f64> {
    value.as_ref().and_then(|v| v.value()).and_then(Value::as_f64)
}
