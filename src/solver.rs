// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Euler, classical RK4, and adaptive (step-doubling) RK4 solvers
//! (`spec.md` §4.6), sharing one step contract: `dt > 0`, finite, and
//! clamped so the final step lands exactly on `timeConfig.end`.

use std::collections::HashMap;

use crate::common::{Diagnostic, ErrorCode, Phase, Result};
use crate::compile::CompiledModel;
use crate::graph::NodeKind;
use crate::interpreter::{evaluate_equation, DelayStateStore, EvalServices, LookupPolicy, Scope};
use crate::model::{Id, SimState, SimUnits};
use crate::units::{unit_maps_equal, Quantity, UnitExponentMap, UnitRegistry};

/// Collaborators a solver/driver call needs beyond the compiled model and
/// state: the unit registry, the run-scoped delay-state store, and the
/// lookup extrapolation policy (`spec.md` §4.4's `EvalServices`, minus
/// the parts that vary per evaluation call).
pub struct RunContext<'a> {
    pub registry: &'a UnitRegistry,
    pub delay_state: &'a DelayStateStore,
    pub run_id: &'a str,
    pub lookup_policy: LookupPolicy,
    pub time_unit: Option<UnitExponentMap>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolverOptions {
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    pub max_attempts_per_step: u32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        // `spec.md` §6, "Determinism and numeric semantics": default
        // integration error targets are 1e-6 absolute and relative.
        SolverOptions {
            initial_step: 1.0,
            min_step: 1e-6,
            max_step: 1.0,
            absolute_tolerance: 1e-6,
            relative_tolerance: 1e-6,
            max_attempts_per_step: 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SolverKind {
    Euler,
    Rk4,
    AdaptiveRk4(SolverOptions),
}

fn invalid_step(dt: f64) -> Diagnostic {
    Diagnostic::new(
        Phase::Solve,
        ErrorCode::InvalidTimeStepError,
        format!("time step must be positive and finite, got {dt}"),
    )
}

/// Evaluates every flow and variable in dependency order against
/// `stocks`/`time`, returning each variable's and flow's evaluated
/// [`Quantity`]. Inserts each result back into the scope under its own
/// name as it goes, so downstream nodes in the same pass can reference
/// it.
pub(crate) fn evaluate_rates(compiled: &CompiledModel, stocks: &HashMap<Id, f64>, time: f64, ctx: &RunContext, scratch: bool) -> Result<(HashMap<Id, Quantity>, HashMap<Id, Quantity>)> {
    let time_config = &compiled.model.time_config;
    let services = EvalServices {
        time_config,
        time,
        run_id: ctx.run_id,
        delay_state: ctx.delay_state,
        lookup_policy: ctx.lookup_policy,
        registry: ctx.registry,
        time_unit: ctx.time_unit.clone(),
        scratch,
    };

    let mut scope = Scope::new();
    for stock in &compiled.model.stocks {
        let value = *stocks.get(&stock.id).unwrap_or(&0.0);
        scope.insert(&stock.name, Quantity { value, units: stock.units.clone().unwrap_or_default() });
    }

    let mut variable_values = HashMap::new();
    let mut flow_rates = HashMap::new();
    for id in &compiled.graph.order {
        let kind = *compiled.graph.kind.get(id).expect("graph node missing from kind map");
        let name = match kind {
            NodeKind::Flow => &compiled.model.flows.iter().find(|f| &f.id == id).expect("flow id not in model").name,
            NodeKind::Variable => &compiled.model.variables.iter().find(|v| &v.id == id).expect("variable id not in model").name,
        };
        let value = match compiled.equations.get(id) {
            Some(eqn) => evaluate_equation(&eqn.expr, &scope, &services)?,
            None => {
                let var = compiled.model.variables.iter().find(|v| &v.id == id).expect("constant id not in model");
                Quantity::dimensionless(var.value.expect("constant without a compiled equation must carry a literal value"))
            }
        };
        scope.insert(name, value.clone());
        match kind {
            NodeKind::Flow => {
                flow_rates.insert(id.clone(), value);
            }
            NodeKind::Variable => {
                variable_values.insert(id.clone(), value);
            }
        }
    }
    Ok((variable_values, flow_rates))
}

/// Flow -> stock derivative mapping (`spec.md` §4.6): each flow's rate
/// subtracts from its source and adds to its target, after checking that
/// `rate.units * time.units` equals the affected stock's unit map.
fn stock_derivatives(compiled: &CompiledModel, flow_rates: &HashMap<Id, Quantity>, ctx: &RunContext) -> Result<HashMap<Id, f64>> {
    let mut derivs: HashMap<Id, f64> = HashMap::new();
    let time_units = ctx.time_unit.clone().unwrap_or_default();
    for flow in &compiled.model.flows {
        let rate = flow_rates.get(&flow.id).expect("every flow must have an evaluated rate");
        let rate_per_step = Quantity { value: 1.0, units: rate.units.clone() }.mul(&Quantity { value: 1.0, units: time_units.clone() });

        for end_id in [&flow.source, &flow.target].into_iter().flatten() {
            let stock = compiled.model.stock(end_id).expect("flow end must reference a stock");
            let expected = stock.units.clone().unwrap_or_default();
            if !unit_maps_equal(&rate_per_step.units, &expected) {
                return Err(Diagnostic::new(
                    Phase::Solve,
                    ErrorCode::UnitMismatch,
                    format!(
                        "flow `{}` rate has units incompatible with stock `{}`: `{}` * time vs `{}`",
                        flow.name,
                        stock.name,
                        crate::units::format_unit_map(&rate.units),
                        crate::units::format_unit_map(&expected)
                    ),
                ));
            }
        }
        if let Some(src) = &flow.source {
            *derivs.entry(src.clone()).or_insert(0.0) -= rate.value;
        }
        if let Some(tgt) = &flow.target {
            *derivs.entry(tgt.clone()).or_insert(0.0) += rate.value;
        }
    }
    Ok(derivs)
}

fn combine_stocks(compiled: &CompiledModel, base: &HashMap<Id, f64>, stages: &[(&HashMap<Id, f64>, f64)]) -> HashMap<Id, f64> {
    let mut out = base.clone();
    for stock in &compiled.model.stocks {
        let mut value = *base.get(&stock.id).unwrap_or(&0.0);
        for (deriv, weight) in stages {
            value += deriv.get(&stock.id).copied().unwrap_or(0.0) * weight;
        }
        out.insert(stock.id.clone(), value);
    }
    out
}

pub(crate) fn snapshot(compiled: &CompiledModel, stocks: HashMap<Id, f64>, time: f64, variable_values: &HashMap<Id, Quantity>, flow_rates: &HashMap<Id, Quantity>, ctx: &RunContext) -> SimState {
    let variables: HashMap<Id, f64> = variable_values.iter().map(|(id, q)| (id.clone(), q.value)).collect();
    let mut units = SimUnits {
        time: ctx.time_unit.clone().unwrap_or_default(),
        stocks: HashMap::new(),
        variables: HashMap::new(),
        rates: HashMap::new(),
    };
    for stock in &compiled.model.stocks {
        units.stocks.insert(stock.id.clone(), stock.units.clone().unwrap_or_default());
    }
    for (id, q) in variable_values {
        units.variables.insert(id.clone(), q.units.clone());
    }
    for (id, q) in flow_rates {
        units.rates.insert(id.clone(), q.units.clone());
    }
    SimState { time, stocks, variables, units }
}

/// Seeds a run's first [`SimState`] from `Stock.initial_value`, then
/// evaluates every variable and flow at `t = timeConfig.start` so the
/// emitted snapshot carries their values too (`spec.md` §4.7, "seeds
/// stocks from initialValue, evaluates constants and t=start variables").
pub(crate) fn initial_state(compiled: &CompiledModel, ctx: &RunContext) -> Result<SimState> {
    let stocks: HashMap<Id, f64> = compiled.model.stocks.iter().map(|s| (s.id.clone(), s.initial_value)).collect();
    let time = compiled.model.time_config.start;
    let (var_vals, rates) = evaluate_rates(compiled, &stocks, time, ctx, false)?;
    Ok(snapshot(compiled, stocks, time, &var_vals, &rates, ctx))
}

/// One step of explicit Euler: `stocksₜ₊dt = stocksₜ + derivatives(stateₜ) · dt`.
pub fn step_euler(compiled: &CompiledModel, state: &SimState, dt: f64, ctx: &RunContext) -> Result<SimState> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(invalid_step(dt));
    }
    let (_, flow_rates) = evaluate_rates(compiled, &state.stocks, state.time, ctx, false)?;
    let derivs = stock_derivatives(compiled, &flow_rates, ctx)?;
    let new_stocks = combine_stocks(compiled, &state.stocks, &[(&derivs, dt)]);
    let new_time = state.time + dt;
    let (var_vals, rates) = evaluate_rates(compiled, &new_stocks, new_time, ctx, false)?;
    Ok(snapshot(compiled, new_stocks, new_time, &var_vals, &rates, ctx))
}

/// Runs the 4-stage RK4 recurrence entirely in scratch mode (no
/// delay-state commits) and returns the resulting stock map, without
/// building a full snapshot. Shared by both classical and adaptive RK4.
fn rk4_new_stocks(compiled: &CompiledModel, stocks: &HashMap<Id, f64>, time: f64, dt: f64, ctx: &RunContext) -> Result<HashMap<Id, f64>> {
    let (_, r1) = evaluate_rates(compiled, stocks, time, ctx, true)?;
    let k1 = stock_derivatives(compiled, &r1, ctx)?;

    let s2 = combine_stocks(compiled, stocks, &[(&k1, dt / 2.0)]);
    let (_, r2) = evaluate_rates(compiled, &s2, time + dt / 2.0, ctx, true)?;
    let k2 = stock_derivatives(compiled, &r2, ctx)?;

    let s3 = combine_stocks(compiled, stocks, &[(&k2, dt / 2.0)]);
    let (_, r3) = evaluate_rates(compiled, &s3, time + dt / 2.0, ctx, true)?;
    let k3 = stock_derivatives(compiled, &r3, ctx)?;

    let s4 = combine_stocks(compiled, stocks, &[(&k3, dt)]);
    let (_, r4) = evaluate_rates(compiled, &s4, time + dt, ctx, true)?;
    let k4 = stock_derivatives(compiled, &r4, ctx)?;

    Ok(combine_stocks(
        compiled,
        stocks,
        &[(&k1, dt / 6.0), (&k2, dt / 3.0), (&k3, dt / 3.0), (&k4, dt / 6.0)],
    ))
}

/// One step of classical RK4. Intermediate stages run against perturbed
/// stock snapshots without publishing them through the delay-state
/// store; only this function's final, committing evaluation advances it
/// (`spec.md` §9, "Intermediate solver state").
pub fn step_rk4(compiled: &CompiledModel, state: &SimState, dt: f64, ctx: &RunContext) -> Result<SimState> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(invalid_step(dt));
    }
    let new_stocks = rk4_new_stocks(compiled, &state.stocks, state.time, dt, ctx)?;
    let new_time = state.time + dt;
    let (var_vals, rates) = evaluate_rates(compiled, &new_stocks, new_time, ctx, false)?;
    Ok(snapshot(compiled, new_stocks, new_time, &var_vals, &rates, ctx))
}

fn rk4_two_half_steps(compiled: &CompiledModel, stocks: &HashMap<Id, f64>, time: f64, h: f64, ctx: &RunContext) -> Result<HashMap<Id, f64>> {
    let half = h / 2.0;
    let mid = rk4_new_stocks(compiled, stocks, time, half, ctx)?;
    rk4_new_stocks(compiled, &mid, time + half, half, ctx)
}

/// Adaptive RK4 with step-doubling error control (`spec.md` §4.6):
/// compares one full step of size `h` against two half-steps, accepts the
/// half-step result when the scaled error is within tolerance, and
/// otherwise shrinks `h` and retries up to `opts.max_attempts_per_step`.
/// Returns the accepted state and the step size to try next.
pub fn step_adaptive_rk4(compiled: &CompiledModel, state: &SimState, initial_h: f64, opts: &SolverOptions, ctx: &RunContext) -> Result<(SimState, f64)> {
    if !(initial_h > 0.0) || !initial_h.is_finite() {
        return Err(invalid_step(initial_h));
    }
    let mut h = initial_h.clamp(opts.min_step, opts.max_step);
    let mut last_err = 0.0;

    for _ in 0..opts.max_attempts_per_step {
        let full = rk4_new_stocks(compiled, &state.stocks, state.time, h, ctx)?;
        let half = rk4_two_half_steps(compiled, &state.stocks, state.time, h, ctx)?;

        let mut err = 0.0f64;
        for stock in &compiled.model.stocks {
            let full_v = full.get(&stock.id).copied().unwrap_or(0.0);
            let half_v = half.get(&stock.id).copied().unwrap_or(0.0);
            let state_v = state.stocks.get(&stock.id).copied().unwrap_or(0.0);
            let scale = opts.absolute_tolerance + opts.relative_tolerance * half_v.abs().max(state_v.abs());
            let e = if scale > 0.0 { (full_v - half_v).abs() / scale } else { 0.0 };
            err = err.max(e);
        }
        last_err = err;

        if err <= 1.0 {
            let next_h = if err > 0.0 {
                (0.9 * h * err.powf(-1.0 / 5.0)).clamp(opts.min_step, opts.max_step)
            } else {
                opts.max_step
            };
            let new_time = state.time + h;
            let (var_vals, rates) = evaluate_rates(compiled, &half, new_time, ctx, false)?;
            let snap = snapshot(compiled, half, new_time, &var_vals, &rates, ctx);
            return Ok((snap, next_h));
        }

        if h <= opts.min_step {
            break;
        }
        let shrunk = (0.9 * h * err.powf(-1.0 / 4.0)).max(opts.min_step);
        tracing::warn!(time = state.time, step = h, next_step = shrunk, scaled_error = err, "adaptive RK4 step rejected, shrinking");
        h = shrunk;
    }

    Err(Diagnostic::new(
        Phase::Solve,
        ErrorCode::ConvergenceError,
        format!("adaptive RK4 failed to converge at time {} with step {h}: scaled error {last_err}", state.time),
    ))
}

/// Dispatches to the chosen solver, clamping `dt` so the step never
/// overshoots `timeConfig.end`. Returns the accepted state and, for the
/// adaptive solver, the step size to use next (solvers without step
/// control just echo `dt` back).
pub fn step(kind: &SolverKind, compiled: &CompiledModel, state: &SimState, dt: f64, ctx: &RunContext) -> Result<(SimState, f64)> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(invalid_step(dt));
    }
    let bounded_dt = dt.min(compiled.model.time_config.end - state.time);
    if !(bounded_dt > 0.0) {
        return Err(invalid_step(bounded_dt));
    }
    match kind {
        SolverKind::Euler => Ok((step_euler(compiled, state, bounded_dt, ctx)?, bounded_dt)),
        SolverKind::Rk4 => Ok((step_rk4(compiled, state, bounded_dt, ctx)?, bounded_dt)),
        SolverKind::AdaptiveRk4(opts) => step_adaptive_rk4(compiled, state, bounded_dt, opts, ctx),
    }
}
