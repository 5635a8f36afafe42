// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeMap;

use sd_engine::{
    compile_model, simulate_eager, simulate_final, DelayStateStore, ErrorCode, Flow, LookupPolicy, Model, RunContext,
    SolverKind, Stock, TimeConfig, UnitRegistry,
};

fn ctx<'a>(registry: &'a UnitRegistry, store: &'a DelayStateStore, run_id: &'a str) -> RunContext<'a> {
    RunContext { registry, delay_state: store, run_id, lookup_policy: LookupPolicy::Clamp, time_unit: None }
}

fn stock(id: &str, name: &str, initial: f64) -> Stock {
    Stock { id: id.to_string(), name: name.to_string(), initial_value: initial, units: None }
}

// Scenario 1: one stock, no flows.
#[test]
fn identity_simulation_holds_stock_constant() {
    let model = Model {
        id: "m".to_string(),
        name: "identity".to_string(),
        stocks: vec![stock("s", "S", 10.0)],
        flows: vec![],
        variables: vec![],
        time_config: TimeConfig { start: 0.0, end: 2.0, step: 0.5 },
    };
    let compiled = compile_model(&model).unwrap();
    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    let states = simulate_eager(&compiled, SolverKind::Euler, ctx(&registry, &store, "scenario1")).unwrap();

    assert_eq!(states.len(), 5);
    let times: Vec<f64> = states.iter().map(|s| s.time).collect();
    assert_eq!(times, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    for s in &states {
        assert!((s.stocks["s"] - 10.0).abs() < 1e-9);
    }
}

// Scenario 2: constant inflow rate of 1 widget per tick.
#[test]
fn constant_inflow_accumulates_linearly() {
    let model = Model {
        id: "m".to_string(),
        name: "constant_inflow".to_string(),
        stocks: vec![stock("s", "S", 10.0)],
        flows: vec![Flow {
            id: "f".to_string(),
            name: "Inflow".to_string(),
            source: None,
            target: Some("s".to_string()),
            rate_equation: "1 { widgets } / 1 { tick }".to_string(),
            units: None,
        }],
        variables: vec![],
        time_config: TimeConfig { start: 0.0, end: 2.0, step: 0.5 },
    };
    let compiled = compile_model(&model).unwrap();
    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    let states = simulate_eager(&compiled, SolverKind::Euler, ctx(&registry, &store, "scenario2")).unwrap();

    let expected = [10.0, 10.5, 11.0, 11.5, 12.0];
    for (state, want) in states.iter().zip(expected.iter()) {
        assert!((state.stocks["s"] - want).abs() < 1e-9, "got {} want {}", state.stocks["s"], want);
    }
}

// Scenario 3: exponential growth, dS/dt = 0.02*S, dt=1, horizon 100.
#[test]
fn exponential_growth_matches_compound_interest_within_two_percent() {
    let model = Model {
        id: "m".to_string(),
        name: "exponential_growth".to_string(),
        stocks: vec![stock("s", "S", 1.0)],
        flows: vec![Flow {
            id: "f".to_string(),
            name: "Growth".to_string(),
            source: None,
            target: Some("s".to_string()),
            rate_equation: "[S] * 0.02 / 1 { tick }".to_string(),
            units: None,
        }],
        variables: vec![],
        time_config: TimeConfig { start: 0.0, end: 100.0, step: 1.0 },
    };
    let compiled = compile_model(&model).unwrap();
    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    let last = simulate_final(&compiled, SolverKind::Euler, ctx(&registry, &store, "scenario3")).unwrap();

    let expected = 1.02f64.powi(100);
    assert!((last.stocks["s"] - expected).abs() / expected < 0.02, "got {}, want ~{}", last.stocks["s"], expected);
}

// Scenario 4: SIR model, RK4, conservation/peak/monotonicity.
#[test]
fn sir_model_conserves_population_and_infects_then_recovers() {
    let model = Model {
        id: "m".to_string(),
        name: "sir".to_string(),
        stocks: vec![stock("s", "Susceptible", 20.0), stock("i", "Infected", 15.0), stock("r", "Recovered", 10.0)],
        flows: vec![
            Flow {
                id: "infect".to_string(),
                name: "Infection".to_string(),
                source: Some("s".to_string()),
                target: Some("i".to_string()),
                rate_equation: "0.01 * [Susceptible] * [Infected] / 1 { tick }".to_string(),
                units: None,
            },
            Flow {
                id: "recover".to_string(),
                name: "Recovery".to_string(),
                source: Some("i".to_string()),
                target: Some("r".to_string()),
                rate_equation: "0.02 * [Infected] / 1 { tick }".to_string(),
                units: None,
            },
        ],
        variables: vec![],
        time_config: TimeConfig { start: 0.0, end: 200.0, step: 1.0 },
    };
    let compiled = compile_model(&model).unwrap();
    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    let states = simulate_eager(&compiled, SolverKind::Rk4, ctx(&registry, &store, "scenario4")).unwrap();

    let total0 = states[0].stocks["s"] + states[0].stocks["i"] + states[0].stocks["r"];
    for s in &states {
        let total = s.stocks["s"] + s.stocks["i"] + s.stocks["r"];
        assert!((total - total0).abs() < 0.01, "population drifted: {total} vs {total0}");
        assert!(s.stocks["s"] >= -1e-9 && s.stocks["i"] >= -1e-9 && s.stocks["r"] >= -1e-9);
    }

    let peak = states.iter().map(|s| s.stocks["i"]).fold(f64::MIN, f64::max);
    assert!(peak > 15.0, "infected curve never rose above its initial value");
    assert!(states.last().unwrap().stocks["i"] < 1.0, "infected did not decay near zero");

    for pair in states.windows(2) {
        assert!(pair[1].stocks["r"] + 1e-9 >= pair[0].stocks["r"], "recovered stock is not monotonic");
    }
}

// Scenario 5: lookup clamping and non-monotonic rejection.
#[test]
fn lookup_clamps_outside_table_range() {
    use sd_engine::{evaluate_equation, parse_equation, EvalServices, Scope};

    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    let time_config = TimeConfig { start: 0.0, end: 1.0, step: 0.1 };
    let services = EvalServices {
        time_config: &time_config,
        registry: &registry,
        delay_state: &store,
        run_id: "scenario5",
        time: 0.0,
        lookup_policy: LookupPolicy::Clamp,
        time_unit: None,
        scratch: false,
    };

    let cases = [("-1", 0.0), ("0.5", 5.0), ("10", 10.0)];
    for (x, want) in cases {
        let eqn = parse_equation(&format!("LOOKUP({x}, (0,0) (1,10))")).unwrap();
        let scope = Scope::new();
        let result = evaluate_equation(&eqn.expr, &scope, &services).unwrap();
        assert!((result.value - want).abs() < 1e-9, "LOOKUP({x}) = {}, want {want}", result.value);
    }
}

#[test]
fn lookup_rejects_non_monotonic_table_at_parse_time() {
    use sd_engine::parse_equation;

    let err = parse_equation("LOOKUP(x, (0,0) (1,10) (0.5,5))").unwrap_err();
    assert_eq!(err.code, ErrorCode::LookupNonMonotonic);
}

// Scenario 6: DELAY1 state persistence against its closed-form recurrence.
#[test]
fn delay1_matches_its_first_order_recurrence() {
    use sd_engine::{compile_equation, evaluate_equation, parse_equation, EvalServices, Quantity, Scope};

    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    store.begin_run("scenario6");
    let time_config = TimeConfig { start: 0.0, end: 1.0, step: 0.1 };

    let eqn = parse_equation("DELAY1([Input], 1 { tick }, 0 { tick })").unwrap();
    let compiled = compile_equation(&eqn).unwrap();

    let dt = 0.1;
    let mut y = 0.0f64;
    for n in 1..=6 {
        let t = (n - 1) as f64 * dt;
        let input = t;
        let mut scope = Scope::new();
        scope.insert("input", Quantity::dimensionless(input));
        let services = EvalServices {
            time_config: &time_config,
            registry: &registry,
            delay_state: &store,
            run_id: "scenario6",
            time: t,
            lookup_policy: LookupPolicy::Clamp,
            time_unit: None,
            scratch: false,
        };
        let result = evaluate_equation(&compiled.expr, &scope, &services).unwrap();

        y += dt * (input - y);
        assert!((result.value - y).abs() < 1e-9, "step {n}: got {}, want {y}", result.value);
    }
}

// Scenario 7: unit mismatch between two incompatible stocks on the first step.
#[test]
fn unit_mismatched_flow_fails_on_first_step() {
    let model = Model {
        id: "m".to_string(),
        name: "unit_mismatch".to_string(),
        stocks: vec![
            Stock { id: "a".to_string(), name: "A".to_string(), initial_value: 10.0, units: Some(BTreeMap::from([("kg".to_string(), 1.0)])) },
            Stock { id: "b".to_string(), name: "B".to_string(), initial_value: 0.0, units: Some(BTreeMap::from([("liters".to_string(), 1.0)])) },
        ],
        flows: vec![Flow {
            id: "f".to_string(),
            name: "Bridge".to_string(),
            source: Some("a".to_string()),
            target: Some("b".to_string()),
            rate_equation: "1 { kg / tick }".to_string(),
            units: None,
        }],
        variables: vec![],
        time_config: TimeConfig { start: 0.0, end: 1.0, step: 1.0 },
    };
    let compiled = compile_model(&model).unwrap();
    let registry = UnitRegistry::new();
    let store = DelayStateStore::new();
    // The flow's per-step rate (kg/tick * 1 tick) cancels to kg, matching
    // stock `a` but not stock `b`'s liters, the way a real run's
    // `ctx.time_unit` cancels the tick component of flow rates.
    let run_ctx = RunContext {
        registry: &registry,
        delay_state: &store,
        run_id: "scenario7",
        lookup_policy: LookupPolicy::Clamp,
        time_unit: Some(BTreeMap::from([("tick".to_string(), 1.0)])),
    };
    let err = simulate_eager(&compiled, SolverKind::Euler, run_ctx).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnitMismatch);
}
