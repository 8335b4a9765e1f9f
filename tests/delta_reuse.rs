//! Two-node pricing scenario and delta reuse across consecutive cycles.

mod common;

use std::sync::Arc;

use calc_flow::{
    CountingStatistics, CycleError, CycleState, FunctionRepository, NodeStateFlag,
    NotCalculated, TargetSpec, Value, ValueRequirement,
};
use common::*;

#[test]
fn test_pv_is_computed_from_market_rate() {
    let f1 = f1();
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1.clone()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));

    let graph = view.graph("Default").unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.market_data_requirements().len(), 1);

    let cycle = cycle(&engine, &view, &md);
    assert_eq!(cycle.state(), CycleState::AwaitingExecution);
    cycle.pre_execute(None).unwrap();
    cycle.execute().unwrap();
    assert_eq!(cycle.state(), CycleState::Executed);

    let pv = cycle.terminal_value("Default", &pv_requirement()).unwrap();
    assert_eq!(as_f64(pv), Some(pv_of(0.05)));
    assert_eq!(f1.invocations(), 1);

    let model = cycle.post_execute().unwrap();
    assert!(model.is_complete());
    assert_eq!(model.values("Default").map(|v| v.len()), Some(1));
}

#[test]
fn test_second_cycle_reuses_unchanged_results() {
    let f1 = f1();
    let md = market_data(0.05);
    let statistics = Arc::new(CountingStatistics::new());
    let engine = engine_with(
        FunctionRepository::new().with_function(f1.clone()),
        &md,
        |builder| builder.with_statistics(statistics.clone()),
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));

    let first = cycle(&engine, &view, &md);
    first.pre_execute(None).unwrap();
    first.execute().unwrap();
    let first_pv = first.terminal_value("Default", &pv_requirement()).unwrap();
    assert_eq!(statistics.executed_nodes(), 1);

    let second = cycle(&engine, &view, &md);
    second.pre_execute(Some(&first)).unwrap();
    second.execute().unwrap();
    let second_pv = second.terminal_value("Default", &pv_requirement()).unwrap();

    assert_eq!(first_pv, second_pv);
    assert_eq!(f1.invocations(), 1);
    assert_eq!(statistics.executed_nodes(), 1);

    let graph = view.graph("Default").unwrap();
    let pv_spec = graph.terminal_specification(&pv_requirement()).unwrap();
    let pv_node = graph.node_producing(pv_spec).unwrap();
    assert_eq!(
        second.node_state("Default", pv_node),
        Some(NodeStateFlag::Executed)
    );
    assert!(second.job_result("Default", pv_spec).is_some());
    assert_eq!(
        second.result_model().value("Default", pv_spec),
        second_pv.as_ref()
    );
}

#[test]
fn test_changed_market_data_is_recomputed() {
    let f1 = f1();
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1.clone()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));

    let first = cycle(&engine, &view, &md);
    first.execute().unwrap();

    md.set(trade(), "MarketRate", Value::new(0.06_f64));
    let second = cycle(&engine, &view, &md);
    second.pre_execute(Some(&first)).unwrap();
    second.execute().unwrap();

    assert_eq!(f1.invocations(), 2);
    assert_eq!(
        as_f64(second.terminal_value("Default", &pv_requirement()).unwrap()),
        Some(pv_of(0.06))
    );
}

#[test]
fn test_only_affected_branch_is_recomputed() {
    let f1 = f1();
    let eurusd = TargetSpec::new("CURRENCY", "EURUSD");
    let fx = calc_flow::SimpleFunction::new("FX", "FxDelta")
        .with_input_on(eurusd.clone(), "FxRate")
        .computing(|_, inputs| Ok(Value::new(inputs.f64("FxRate").unwrap_or_default() * 2.0)));
    let md = market_data(0.05);
    md.set(eurusd.clone(), "FxRate", Value::new(1.1_f64));
    let engine = engine(
        FunctionRepository::new()
            .with_function(f1.clone())
            .with_function(fx.clone()),
        &md,
    );
    let fx_delta = ValueRequirement::new("FxDelta", trade());
    let view = compile(&engine, &view(vec![pv_requirement(), fx_delta.clone()]));

    let first = cycle(&engine, &view, &md);
    first.execute().unwrap();

    md.set(eurusd, "FxRate", Value::new(1.2_f64));
    let second = cycle(&engine, &view, &md);
    second.pre_execute(Some(&first)).unwrap();
    second.execute().unwrap();

    assert_eq!(f1.invocations(), 1);
    assert_eq!(fx.invocations(), 2);
    assert_eq!(
        as_f64(second.terminal_value("Default", &fx_delta).unwrap()),
        Some(2.4)
    );
}

#[test]
fn test_previously_failed_node_keeps_its_sentinel() {
    let f1 = f1();
    let md = calc_flow::InMemoryMarketData::new();
    let engine = engine(FunctionRepository::new().with_function(f1.clone()), &md);
    // Resolve against availability first, then drop the value from the snapshot.
    md.set(trade(), "MarketRate", Value::new(0.05_f64));
    let view = compile(&engine, &view(vec![pv_requirement()]));
    md.remove(&trade(), "MarketRate");

    let first = cycle(&engine, &view, &md);
    first.execute().unwrap();
    let first_pv = first.terminal_value("Default", &pv_requirement()).unwrap();
    assert_eq!(
        first_pv.as_ref().and_then(|v| v.not_calculated()),
        Some(NotCalculated::MissingInputs)
    );

    let second = cycle(&engine, &view, &md);
    second.pre_execute(Some(&first)).unwrap();
    second.execute().unwrap();
    assert_eq!(second.terminal_value("Default", &pv_requirement()).unwrap(), first_pv);
    assert_eq!(f1.invocations(), 0);
    assert_eq!(second.state(), CycleState::Executed);
}

#[test]
fn test_previous_cycle_must_be_executed() {
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));

    let first = cycle(&engine, &view, &md);
    let second = cycle(&engine, &view, &md);
    match second.pre_execute(Some(&first)) {
        Err(CycleError::PreviousCycleNotExecuted(state)) => {
            assert_eq!(state, CycleState::AwaitingExecution)
        }
        other => panic!("unexpected: {:?}", other),
    }
}
