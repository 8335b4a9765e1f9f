//! Sentinel propagation, failure containment and interruption.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use calc_flow::{
    CacheValue, CountingStatistics, CycleError, CycleState, ExecutionError, ExecutionHandle,
    ExecutionLogMode, ExecutionRequest, FullLogForOutputs, FunctionIdBlacklist, FunctionRepository,
    GraphExecutor, NodeStateFlag, NotCalculated, SimpleFunction, Value, ValueRequirement,
};
use common::*;

/// `Risk` depends on `PV`, so it sits downstream of `F1`.
fn risk() -> SimpleFunction {
    SimpleFunction::new("RiskFn", "Risk")
        .with_constrained_input(None, "PV", usd())
        .computing(|_, inputs| Ok(Value::new(inputs.f64("PV").unwrap_or_default() / 100.0)))
}

fn not_calculated(value: Option<CacheValue>) -> Option<NotCalculated> {
    value.and_then(|v| v.not_calculated())
}

#[test]
fn test_blacklisted_node_is_suppressed_and_cycle_completes() {
    let f1 = f1();
    let risk = risk();
    let md = market_data(0.05);
    let blacklist = Arc::new(FunctionIdBlacklist::new());
    blacklist.add("F1");
    let engine = engine_with(
        FunctionRepository::new()
            .with_function(f1.clone())
            .with_function(risk.clone()),
        &md,
        |builder| builder.with_blacklist(blacklist.clone()),
    );
    let risk_req = ValueRequirement::new("Risk", trade());
    let view = compile(&engine, &view(vec![pv_requirement(), risk_req.clone()]));

    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();
    assert_eq!(cycle.state(), CycleState::Executed);

    assert_eq!(
        not_calculated(cycle.terminal_value("Default", &pv_requirement()).unwrap()),
        Some(NotCalculated::Suppressed)
    );
    assert_eq!(
        not_calculated(cycle.terminal_value("Default", &risk_req).unwrap()),
        Some(NotCalculated::MissingInputs)
    );
    assert_eq!(f1.invocations(), 0);
    assert_eq!(risk.invocations(), 0);

    let graph = view.graph("Default").unwrap();
    let pv_spec = graph.terminal_specification(&pv_requirement()).unwrap();
    let f1_node = graph.node_producing(pv_spec).unwrap();
    assert_eq!(
        cycle.node_state("Default", f1_node),
        Some(NodeStateFlag::Suppressed)
    );
    assert!(cycle.post_execute().is_ok());
}

#[test]
fn test_missing_market_data_becomes_sentinel() {
    let f1 = f1();
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1.clone()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));
    md.remove(&trade(), "MarketRate");

    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();

    let rate = view.graph("Default").unwrap().market_data_requirements()[0].clone();
    let cached = cycle.query_computation_caches("Default", &[rate.clone()]).unwrap();
    assert_eq!(
        not_calculated(cached[0].1.clone()),
        Some(NotCalculated::MissingMarketData)
    );
    let pv_spec = view
        .graph("Default")
        .unwrap()
        .terminal_specification(&pv_requirement())
        .unwrap()
        .clone();
    let job = cycle.job_result("Default", &pv_spec).unwrap();
    assert_eq!(job.missing_inputs, vec![rate]);
    assert_eq!(f1.invocations(), 0);
}

#[test]
fn test_missing_inputs_can_be_handled() {
    let tolerant = SimpleFunction::new("Tolerant", "PV")
        .with_output_properties(usd())
        .with_input("MarketRate")
        .handling_missing_inputs()
        .computing(|_, inputs| Ok(Value::new(inputs.f64("MarketRate").unwrap_or(-1.0))));
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(tolerant.clone()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));
    md.remove(&trade(), "MarketRate");

    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();
    assert_eq!(tolerant.invocations(), 1);
    assert_eq!(
        as_f64(cycle.terminal_value("Default", &pv_requirement()).unwrap()),
        Some(-1.0)
    );
}

#[test]
fn test_function_failure_is_contained() {
    let failing = SimpleFunction::new("Broken", "Vega")
        .computing(|_, _| Err(anyhow::anyhow!("vol surface unavailable")));
    let panicking = SimpleFunction::new("Panicky", "Gamma").computing(|_, _| panic!("boom"));
    let md = market_data(0.05);
    let statistics = Arc::new(CountingStatistics::new());
    let log_modes = Arc::new(FullLogForOutputs::new());
    let engine = engine_with(
        FunctionRepository::new()
            .with_function(f1())
            .with_function(failing)
            .with_function(panicking),
        &md,
        |builder| {
            builder
                .with_statistics(statistics.clone())
                .with_log_modes(log_modes.clone())
        },
    );
    let vega = ValueRequirement::new("Vega", trade());
    let gamma = ValueRequirement::new("Gamma", trade());
    let view = compile(
        &engine,
        &view(vec![pv_requirement(), vega.clone(), gamma.clone()]),
    );
    let graph = view.graph("Default").unwrap();
    log_modes.enable(graph.terminal_specification(&vega).unwrap().clone());

    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();
    assert_eq!(cycle.state(), CycleState::Executed);

    assert_eq!(
        as_f64(cycle.terminal_value("Default", &pv_requirement()).unwrap()),
        Some(pv_of(0.05))
    );
    assert_eq!(
        not_calculated(cycle.terminal_value("Default", &vega).unwrap()),
        Some(NotCalculated::EvaluationError)
    );
    assert_eq!(
        not_calculated(cycle.terminal_value("Default", &gamma).unwrap()),
        Some(NotCalculated::EvaluationError)
    );
    assert_eq!(statistics.executed_nodes(), 3);
    assert_eq!(statistics.failed_nodes(), 2);

    let vega_job = cycle
        .job_result("Default", graph.terminal_specification(&vega).unwrap())
        .unwrap();
    assert_eq!(vega_job.log.exception(), Some("vol surface unavailable"));
    assert!(vega_job.log.events().is_some());
    let gamma_job = cycle
        .job_result("Default", graph.terminal_specification(&gamma).unwrap())
        .unwrap();
    assert!(gamma_job.log.exception().unwrap().contains("boom"));
    assert!(gamma_job.log.events().is_none());
}

#[test]
fn test_full_log_mode_forces_recompute_once() {
    let f1 = f1();
    let md = market_data(0.05);
    let log_modes = Arc::new(FullLogForOutputs::new());
    let engine = engine_with(
        FunctionRepository::new().with_function(f1.clone()),
        &md,
        |builder| builder.with_log_modes(log_modes.clone()),
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let pv_spec = view
        .graph("Default")
        .unwrap()
        .terminal_specification(&pv_requirement())
        .unwrap()
        .clone();

    let first = cycle(&engine, &view, &md);
    first.execute().unwrap();

    log_modes.enable(pv_spec.clone());
    let second = cycle(&engine, &view, &md);
    second.pre_execute(Some(&first)).unwrap();
    second.execute().unwrap();
    assert_eq!(f1.invocations(), 2);
    assert!(second.job_result("Default", &pv_spec).unwrap().log.events().is_some());

    let third = cycle(&engine, &view, &md);
    third.pre_execute(Some(&second)).unwrap();
    third.execute().unwrap();
    assert_eq!(f1.invocations(), 2);
}

#[test]
fn test_constant_log_mode() {
    let md = market_data(0.05);
    let engine = engine_with(
        FunctionRepository::new().with_function(f1()),
        &md,
        |builder| builder.with_log_modes(Arc::new(ExecutionLogMode::Full)),
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = cycle(&engine, &view, &md);
    cycle.execute().unwrap();
    let pv_spec = view
        .graph("Default")
        .unwrap()
        .terminal_specification(&pv_requirement())
        .unwrap()
        .clone();
    let events = cycle.job_result("Default", &pv_spec).unwrap().log;
    assert_eq!(events.events().map(|e| e.len()), Some(1));
}

#[test]
fn test_interrupt_cancels_execution() {
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let slow = blocking_pv(started.clone(), release.clone());
    let downstream = risk();
    let md = market_data(0.05);
    let engine = engine(
        FunctionRepository::new()
            .with_function(slow)
            .with_function(downstream.clone()),
        &md,
    );
    let view = compile(
        &engine,
        &view(vec![ValueRequirement::new("Risk", trade())]),
    );
    let cycle = Arc::new(cycle(&engine, &view, &md));
    let interrupt = cycle.interrupt_handle();

    let runner = {
        let cycle = cycle.clone();
        thread::spawn(move || cycle.execute())
    };
    while !started.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    interrupt.interrupt();
    release.store(true, Ordering::SeqCst);

    assert!(matches!(runner.join().unwrap(), Err(CycleError::Interrupted)));
    assert_eq!(cycle.state(), CycleState::ExecutionInterrupted);
    // Give the released function time to finish; its dependent must not start.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(downstream.invocations(), 0);
    assert!(matches!(
        cycle.post_execute(),
        Err(CycleError::InvalidState {
            state: CycleState::ExecutionInterrupted,
            ..
        })
    ));
    cycle.release().unwrap();
    assert_eq!(cycle.state(), CycleState::Destroyed);
}

/// PV function that blocks until `release` is set, flagging `started` first.
fn blocking_pv(started: Arc<AtomicBool>, release: Arc<AtomicBool>) -> SimpleFunction {
    SimpleFunction::new("Slow", "PV")
        .with_output_properties(usd())
        .with_input("MarketRate")
        .computing(move |_, _| {
            started.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(10);
            while !release.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::new(0.0_f64))
        })
}

#[test]
fn test_interrupt_returns_while_function_still_running() {
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let md = market_data(0.05);
    let engine = engine(
        FunctionRepository::new().with_function(blocking_pv(started.clone(), release.clone())),
        &md,
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = Arc::new(cycle(&engine, &view, &md));
    let interrupt = cycle.interrupt_handle();

    let runner = {
        let cycle = cycle.clone();
        thread::spawn(move || cycle.execute())
    };
    while !started.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    let interrupted_at = Instant::now();
    interrupt.interrupt();
    let outcome = runner.join().unwrap();
    let elapsed = interrupted_at.elapsed();
    release.store(true, Ordering::SeqCst);

    assert!(matches!(outcome, Err(CycleError::Interrupted)));
    assert!(elapsed < Duration::from_secs(1), "execute took {:?}", elapsed);
    assert_eq!(cycle.state(), CycleState::ExecutionInterrupted);
    cycle.release().unwrap();
}

#[test]
fn test_concurrent_execute_runs_cycle_once() {
    let f1 = f1();
    let md = market_data(0.05);
    let engine = engine(FunctionRepository::new().with_function(f1.clone()), &md);
    let view = compile(&engine, &view(vec![pv_requirement()]));

    for round in 1..=20 {
        let cycle = Arc::new(cycle(&engine, &view, &md));
        let barrier = Arc::new(Barrier::new(2));
        let runners: Vec<_> = (0..2)
            .map(|_| {
                let cycle = cycle.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cycle.execute()
                })
            })
            .collect();
        let outcomes: Vec<_> = runners.into_iter().map(|r| r.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            Err(CycleError::InvalidState {
                operation: "execute",
                ..
            })
        )));
        assert_eq!(f1.invocations(), round);
        assert_eq!(cycle.state(), CycleState::Executed);
    }
}

/// Scheduler that fails every graph it is given.
struct UnavailableScheduler;

impl GraphExecutor for UnavailableScheduler {
    fn execute(&self, request: ExecutionRequest) -> ExecutionHandle {
        let handle = ExecutionHandle::new();
        handle.complete(Err(ExecutionError::Fault(format!(
            "no workers for {}",
            request.configuration
        ))));
        handle
    }
}

#[test]
fn test_scheduler_fault_fails_cycle() {
    let f1 = f1();
    let md = market_data(0.05);
    let engine = engine_with(
        FunctionRepository::new().with_function(f1.clone()),
        &md,
        |builder| builder.with_executor(Arc::new(UnavailableScheduler)),
    );
    let view = compile(&engine, &view(vec![pv_requirement()]));
    let cycle = cycle(&engine, &view, &md);

    match cycle.execute() {
        Err(CycleError::ExecutionFailed {
            configuration,
            source,
        }) => {
            assert_eq!(configuration, "Default");
            assert_eq!(source, ExecutionError::Fault("no workers for Default".to_string()));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(cycle.state(), CycleState::ExecutionInterrupted);
    assert!(matches!(
        cycle.post_execute(),
        Err(CycleError::InvalidState {
            operation: "post-execute",
            state: CycleState::ExecutionInterrupted
        })
    ));
    assert_eq!(f1.invocations(), 0);
}
