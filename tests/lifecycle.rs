//! Cycle state machine, result delivery, market data shifts and cache dumps.

mod common;

use std::sync::Arc;

use calc_flow::{
    CalculationConfiguration, CycleError, CycleId, CycleState, EngineConfig, FunctionRepository,
    InMemoryCacheSource, ResultCollector, ResultFragment, ResultListener, ResultModel,
    SingleComputationCycle, ValueProperties, ViewDefinition, MARKET_DATA_SHIFT,
};
use common::*;

#[test]
fn test_state_transitions() {
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = cycle(&engine, &view, &md);

    assert!(matches!(
        cycle.post_execute(),
        Err(CycleError::InvalidState {
            operation: "post-execute",
            state: CycleState::AwaitingExecution
        })
    ));
    cycle.execute().unwrap();
    assert!(matches!(
        cycle.execute(),
        Err(CycleError::InvalidState {
            state: CycleState::Executed,
            ..
        })
    ));
    assert!(matches!(
        cycle.pre_execute(None),
        Err(CycleError::InvalidState { .. })
    ));
    cycle.post_execute().unwrap();
    assert_eq!(cycle.state(), CycleState::Executed);

    cycle.release().unwrap();
    assert_eq!(cycle.state(), CycleState::Destroyed);
    assert!(matches!(
        cycle.release(),
        Err(CycleError::InvalidState {
            operation: "release",
            state: CycleState::Destroyed
        })
    ));
    assert!(matches!(
        cycle.query_results("Default"),
        Err(CycleError::InvalidState { .. })
    ));
}

#[test]
fn test_release_frees_caches() {
    let md = market_data(0.05);
    let caches = Arc::new(InMemoryCacheSource::new());
    let engine = engine_with(
        FunctionRepository::new().with_function(f1()),
        &md,
        |builder| builder.with_cache_source(caches.clone()),
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));

    let first = cycle(&engine, &view, &md);
    first.execute().unwrap();
    let second = cycle(&engine, &view, &md);
    second.execute().unwrap();
    assert_eq!(caches.live_caches(), 2);

    first.release().unwrap();
    assert_eq!(caches.live_caches(), 1);
    second.release().unwrap();
    assert_eq!(caches.live_caches(), 0);
}

#[test]
fn test_unknown_configuration() {
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();

    match cycle.query_results("Bumped") {
        Err(CycleError::UnknownConfiguration(name)) => assert_eq!(name, "Bumped"),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(cycle.query_results("Default").unwrap().len(), 1);
}

#[test]
fn test_market_data_shift_per_configuration() {
    let f1 = f1();
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1.clone()), &md);
    let definition = ViewDefinition::new("Scenarios")
        .with_configuration(CalculationConfiguration::new("Base").with_requirement(pv_requirement()))
        .with_configuration(
            CalculationConfiguration::new("Bumped")
                .with_requirement(pv_requirement())
                .with_default_properties(ValueProperties::none().with(MARKET_DATA_SHIFT, "+0.01")),
        )
        .with_configuration(
            CalculationConfiguration::new("Garbled")
                .with_requirement(pv_requirement())
                .with_default_properties(ValueProperties::none().with(MARKET_DATA_SHIFT, "%2")),
        );
    let view = compile(&engine, &definition);
    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();

    let base = as_f64(cycle.terminal_value("Base", &pv_requirement()).unwrap()).unwrap();
    let bumped = as_f64(cycle.terminal_value("Bumped", &pv_requirement()).unwrap()).unwrap();
    let garbled = as_f64(cycle.terminal_value("Garbled", &pv_requirement()).unwrap()).unwrap();
    assert_eq!(base, pv_of(0.05));
    assert!((bumped - pv_of(0.06)).abs() < 1e-6);
    assert_eq!(garbled, base);
    assert_eq!(f1.invocations(), 3);
}

#[test]
fn test_listener_receives_fragments() {
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let collector = Arc::new(ResultCollector::new());
    let cycle = SingleComputationCycle::new(
        engine.next_cycle_id(),
        view.clone(),
        engine.clone(),
        md.snapshot(),
    )
    .with_listener(collector.clone());

    cycle.execute().unwrap();
    let model = cycle.post_execute().unwrap();

    let fragments = collector.fragments();
    assert_eq!(fragments.len(), 2);
    assert!(matches!(fragments[0], ResultFragment::MarketData { .. }));
    match &fragments[1] {
        ResultFragment::Computed { values, .. } => {
            assert_eq!(values.len(), 1);
            assert_eq!(as_f64(Some(values[0].1.clone())), Some(pv_of(0.05)));
        }
        other => panic!("unexpected fragment: {:?}", other),
    }
    assert_eq!(collector.completed_models(), vec![model]);
}

struct PanickingListener;

impl ResultListener for PanickingListener {
    fn fragment(&self, _cycle: CycleId, _fragment: &ResultFragment) {
        panic!("listener bug");
    }

    fn completed(&self, _cycle: CycleId, _model: &ResultModel) {
        panic!("listener bug");
    }
}

#[test]
fn test_panicking_listener_does_not_break_cycle() {
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = SingleComputationCycle::new(
        engine.next_cycle_id(),
        view,
        engine.clone(),
        md.snapshot(),
    )
    .with_listener(Arc::new(PanickingListener));

    cycle.execute().unwrap();
    let model = cycle.post_execute().unwrap();
    assert_eq!(cycle.state(), CycleState::Executed);
    assert_eq!(model.values("Default").map(|v| v.len()), Some(1));
}

#[test]
fn test_cache_dump_on_release() {
    let directory = std::env::temp_dir().join(format!("calc-flow-dumps-{}", std::process::id()));
    let md = market_data(0.05);
    let engine = engine_with(
        FunctionRepository::new().with_function(f1()),
        &md,
        |builder| builder.with_config(test_config().with_cache_dumps(Some(directory.clone()))),
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();
    let path = cycle.cache_dump_path("Default");
    cycle.release().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_dir_all(&directory).ok();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("MarketRate"));
    assert!(lines[1].starts_with("PV"));
}

#[test]
fn test_config_from_json() {
    let config: EngineConfig = serde_json::from_str(
        r#"{ "worker_threads": 2, "poll_timeout_ms": 100, "dump_caches": true }"#,
    )
    .unwrap();
    assert_eq!(config.worker_threads, 2);
    assert_eq!(config.poll_timeout().as_millis(), 100);
    assert!(config.dump_caches);
    assert_eq!(config.result_queue_capacity, EngineConfig::default().result_queue_capacity);
}

#[test]
fn test_view_definition_from_json() {
    let definition: ViewDefinition = serde_json::from_str(
        r#"{
            "name": "Risk",
            "configurations": [
                {
                    "name": "Default",
                    "requirements": [
                        { "name": "PV", "target": { "kind": "SECURITY", "id": "T" } }
                    ]
                }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(definition.configurations.len(), 1);
    assert_eq!(definition.configurations[0].requirements[0].name, "PV");
    assert!(!definition.dump_caches);
}
