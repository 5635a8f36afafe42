// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The simulation driver: turns a compiled model and a chosen solver into
//! a stream of [`SimState`]s, plus eager and final-only convenience
//! wrappers.

use crate::common::{Diagnostic, ErrorCode, Phase, Result};
use crate::compile::CompiledModel;
use crate::model::SimState;
use crate::solver::{self, RunContext, SolverKind};

/// A lazily-advancing simulation, one [`SimState`] per `next()` call. The
/// first call yields the seeded initial state; each subsequent call
/// advances the solver by `min(step, end - time)`. Ends the run's
/// delay-state lifetime on drop, so a
/// consumer that stops iterating early still releases it.
pub struct SimulationRun<'a> {
    compiled: &'a CompiledModel,
    ctx: RunContext<'a>,
    solver: SolverKind,
    current: Option<SimState>,
    step_size: f64,
    started: bool,
    finished: bool,
    cancel: Option<Box<dyn FnMut() -> bool + 'a>>,
}

impl<'a> SimulationRun<'a> {
    /// Installs a cancellation check consulted at the top of every
    /// `next()` call. Once it returns `true` the run stops yielding
    /// further states.
    pub fn cancel_when(mut self, cancel: impl FnMut() -> bool + 'a) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }
}

impl<'a> Iterator for SimulationRun<'a> {
    type Item = Result<SimState>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(cancel) = self.cancel.as_mut() {
            if cancel() {
                self.finished = true;
                return None;
            }
        }

        let end = self.compiled.model.time_config.end;
        if !self.started {
            self.started = true;
            let initial = self.current.clone().expect("SimulationRun always starts with an initial state");
            if initial.time >= end - 1e-9 {
                self.finished = true;
            }
            return Some(Ok(initial));
        }

        let current = match &self.current {
            Some(s) => s.clone(),
            None => {
                self.finished = true;
                return None;
            }
        };
        if current.time >= end - 1e-9 {
            self.finished = true;
            return None;
        }

        let dt = self.step_size.min(end - current.time);
        match solver::step(&self.solver, self.compiled, &current, dt, &self.ctx) {
            Ok((next_state, next_step)) => {
                self.step_size = next_step;
                self.current = Some(next_state.clone());
                Some(Ok(next_state))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for SimulationRun<'_> {
    fn drop(&mut self) {
        self.ctx.delay_state.end_run(self.ctx.run_id);
    }
}

/// Starts a run: seeds the initial state and begins the run's
/// delay-state lifetime. Returns a lazy iterator; use [`simulate_eager`]
/// or [`simulate_final`] for the collected variants.
pub fn simulate<'a>(compiled: &'a CompiledModel, solver_kind: SolverKind, ctx: RunContext<'a>) -> Result<SimulationRun<'a>> {
    ctx.delay_state.begin_run(ctx.run_id);
    let initial = solver::initial_state(compiled, &ctx)?;
    let step_size = match &solver_kind {
        SolverKind::AdaptiveRk4(opts) => opts.initial_step,
        SolverKind::Euler | SolverKind::Rk4 => compiled.model.time_config.step,
    };
    Ok(SimulationRun {
        compiled,
        ctx,
        solver: solver_kind,
        current: Some(initial),
        step_size,
        started: false,
        finished: false,
        cancel: None,
    })
}

/// Collects every emitted state eagerly into memory.
pub fn simulate_eager(compiled: &CompiledModel, solver_kind: SolverKind, ctx: RunContext) -> Result<Vec<SimState>> {
    simulate(compiled, solver_kind, ctx)?.collect()
}

/// Runs to completion and returns only the last emitted state. A
/// degenerate horizon (`end == start`) still yields exactly one state,
/// which is that final state (`spec.md` §4.7).
pub fn simulate_final(compiled: &CompiledModel, solver_kind: SolverKind, ctx: RunContext) -> Result<SimState> {
    let mut last = None;
    for item in simulate(compiled, solver_kind, ctx)? {
        last = Some(item?);
    }
    last.ok_or_else(|| Diagnostic::new(Phase::Solve, ErrorCode::StateAccessError, "simulation produced no states"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile_model;
    use crate::interpreter::{DelayStateStore, LookupPolicy};
    use crate::model::{Flow, Model, Stock, TimeConfig};
    use crate::solver::SolverOptions;
    use crate::units::UnitRegistry;

    fn ctx<'a>(registry: &'a UnitRegistry, store: &'a DelayStateStore, run_id: &'a str) -> RunContext<'a> {
        RunContext { registry, delay_state: store, run_id, lookup_policy: LookupPolicy::Clamp, time_unit: None }
    }

    fn identity_model() -> Model {
        Model {
            id: "m".to_string(),
            name: "m".to_string(),
            stocks: vec![Stock { id: "s".to_string(), name: "S".to_string(), initial_value: 10.0, units: None }],
            flows: vec![],
            variables: vec![],
            time_config: TimeConfig { start: 0.0, end: 2.0, step: 0.5 },
        }
    }

    #[test]
    fn test_identity_simulation_yields_five_states() {
        let model = identity_model();
        let compiled = compile_model(&model).unwrap();
        let registry = UnitRegistry::new();
        let store = DelayStateStore::new();
        let states: Vec<SimState> = simulate_eager(&compiled, SolverKind::Euler, ctx(&registry, &store, "run1")).unwrap();
        assert_eq!(states.len(), 5);
        let times: Vec<f64> = states.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert!(states.iter().all(|s| (s.stocks["s"] - 10.0).abs() < 1e-9));
    }

    #[test]
    fn test_time_is_strictly_monotonic_and_ends_at_horizon() {
        let mut model = identity_model();
        model.flows.push(Flow {
            id: "f".to_string(),
            name: "Inflow".to_string(),
            source: None,
            target: Some("s".to_string()),
            rate_equation: "1".to_string(),
            units: None,
        });
        let compiled = compile_model(&model).unwrap();
        let registry = UnitRegistry::new();
        let store = DelayStateStore::new();
        let states: Vec<SimState> = simulate_eager(&compiled, SolverKind::Euler, ctx(&registry, &store, "run2")).unwrap();
        for pair in states.windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
        assert!((states.last().unwrap().time - model.time_config.end).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_horizon_yields_exactly_one_state() {
        let mut model = identity_model();
        model.time_config = TimeConfig { start: 3.0, end: 3.0, step: 1.0 };
        let compiled = compile_model(&model).unwrap();
        let registry = UnitRegistry::new();
        let store = DelayStateStore::new();
        let states: Vec<SimState> = simulate_eager(&compiled, SolverKind::Euler, ctx(&registry, &store, "run3")).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].time, 3.0);

        let registry2 = UnitRegistry::new();
        let store2 = DelayStateStore::new();
        let last = simulate_final(&compiled, SolverKind::Euler, ctx(&registry2, &store2, "run4")).unwrap();
        assert_eq!(last.time, 3.0);
    }

    #[test]
    fn test_cancellation_stops_iteration_early() {
        let model = identity_model();
        let compiled = compile_model(&model).unwrap();
        let registry = UnitRegistry::new();
        let store = DelayStateStore::new();
        let mut seen = 0;
        let run = simulate(&compiled, SolverKind::Euler, ctx(&registry, &store, "run5"))
            .unwrap()
            .cancel_when(move || {
                seen += 1;
                seen > 2
            });
        let states: Vec<Result<SimState>> = run.collect();
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn test_adaptive_solver_reaches_horizon_exactly() {
        let mut model = identity_model();
        model.stocks[0].initial_value = 1.0;
        model.time_config = TimeConfig { start: 0.0, end: 1.0, step: 0.1 };
        model.flows.push(Flow {
            id: "f".to_string(),
            name: "Growth".to_string(),
            source: None,
            target: Some("s".to_string()),
            rate_equation: "TIME * [S]".to_string(),
            units: None,
        });
        let compiled = compile_model(&model).unwrap();
        let registry = UnitRegistry::new();
        let store = DelayStateStore::new();
        let opts = SolverOptions { initial_step: 0.1, ..SolverOptions::default() };
        let last = simulate_final(&compiled, SolverKind::AdaptiveRk4(opts), ctx(&registry, &store, "run6")).unwrap();
        assert!((last.time - 1.0).abs() < 1e-9);
        let expected = (0.5f64).exp();
        assert!((last.stocks["s"] - expected).abs() < 1e-3);
    }
}
