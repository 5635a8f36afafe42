// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The unit-aware equation evaluator (`spec.md` §4.4): given a compiled
//! expression, a scope, and runtime services, produces a [`Quantity`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::ast::{BinaryOp, DelayKind, Expr, TimeKind, UnaryOp};
use crate::builtins::call_builtin;
use crate::common::{canonicalize, Diagnostic, ErrorCode, Phase, Result};
use crate::model::TimeConfig;
use crate::units::{format_unit_map, Quantity, UnitExponentMap, UnitRegistry};

/// `name -> Quantity`, keyed by [`canonicalize`] so that `[Population]`
/// and `[ population ]` resolve to the same binding.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    bindings: HashMap<String, Quantity>,
}

impl Scope {
    pub fn new() -> Self {
        Scope::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: Quantity) {
        self.bindings.insert(canonicalize(name.as_ref()), value);
    }

    pub fn get(&self, name: &str) -> Option<&Quantity> {
        self.bindings.get(&canonicalize(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum LookupPolicy {
    #[default]
    Clamp,
    LinearExtrapolation,
}

/// Process- or run-scoped `(runId, nodeId) -> scalar` map for delay/smooth
/// state (`spec.md` §3, "DelayStateStore"). Reads return `None` ("absent")
/// on first touch; writes are last-write-wins.
#[derive(Default)]
pub struct DelayStateStore {
    inner: Mutex<HashMap<(String, String), f64>>,
}

impl DelayStateStore {
    pub fn new() -> Self {
        DelayStateStore::default()
    }

    /// Clears any stale state under `run_id`, giving the run a fresh
    /// start. Run ids are expected to be unique per simulation invocation,
    /// so this is mostly defensive against id reuse.
    pub fn begin_run(&self, run_id: &str) {
        let mut guard = self.inner.lock().unwrap();
        guard.retain(|(r, _), _| r != run_id);
    }

    pub fn end_run(&self, run_id: &str) {
        let mut guard = self.inner.lock().unwrap();
        guard.retain(|(r, _), _| r != run_id);
    }

    pub fn read(&self, run_id: &str, node_id: &str) -> Option<f64> {
        let guard = self.inner.lock().unwrap();
        guard.get(&(run_id.to_string(), node_id.to_string())).copied()
    }

    pub fn write(&self, run_id: &str, node_id: &str, value: f64) {
        let mut guard = self.inner.lock().unwrap();
        guard.insert((run_id.to_string(), node_id.to_string()), value);
    }
}

/// Runtime collaborators the evaluator needs beyond the expression and
/// scope (`spec.md` §4.4, "... and runtime services").
pub struct EvalServices<'a> {
    pub time_config: &'a TimeConfig,
    pub time: f64,
    pub run_id: &'a str,
    pub delay_state: &'a DelayStateStore,
    pub lookup_policy: LookupPolicy,
    pub registry: &'a UnitRegistry,
    /// Units attached to `TIME`/`TIME STEP`/`INITIAL TIME`/`FINAL TIME`
    /// primitives; `None` renders them dimensionless.
    pub time_unit: Option<UnitExponentMap>,
    /// When `true`, writes to `delay_state` are suppressed and reads fall
    /// through to whatever is already committed. Used by RK4's
    /// intermediate stages, which must evaluate against perturbed stock
    /// snapshots without publishing state (`spec.md` §9, "Intermediate
    /// solver state").
    pub scratch: bool,
}

fn time_quantity(services: &EvalServices, value: f64) -> Quantity {
    Quantity {
        value,
        units: services.time_unit.clone().unwrap_or_default(),
    }
}

pub fn evaluate_equation(expr: &Expr, scope: &Scope, services: &EvalServices) -> Result<Quantity> {
    match expr {
        Expr::QuantityLiteral { value, unit, .. } => Ok(Quantity {
            value: *value,
            units: unit.clone().unwrap_or_default(),
        }),
        Expr::BooleanLiteral { value, .. } => Ok(Quantity::dimensionless(if *value { 1.0 } else { 0.0 })),
        Expr::Ref { name, span } => scope.get(name).cloned().ok_or_else(|| {
            Diagnostic::new(
                Phase::Evaluate,
                ErrorCode::IdentifierNotFound,
                format!("identifier `{name}` was not found in scope"),
            )
            .with_span(*span)
            .with_hints(scope.names())
        }),
        Expr::Unary { op, expr, span } => {
            let v = evaluate_equation(expr, scope, services)?;
            match op {
                UnaryOp::Pos => Ok(v),
                UnaryOp::Neg => Ok(Quantity { value: -v.value, units: v.units }),
                UnaryOp::Not => {
                    if !v.is_dimensionless() {
                        return Err(Diagnostic::new(
                            Phase::Evaluate,
                            ErrorCode::DimensionlessRequired,
                            "`NOT` requires a dimensionless (boolean) operand",
                        )
                        .with_span(*span));
                    }
                    Ok(Quantity::dimensionless(if v.value == 0.0 { 1.0 } else { 0.0 }))
                }
            }
        }
        Expr::Binary { op, left, right, span } => evaluate_binary(*op, left, right, *span, scope, services),
        Expr::IfChain { branches, else_branch, span } => {
            for branch in branches {
                let cond = evaluate_equation(&branch.cond, scope, services)?;
                if !cond.is_dimensionless() {
                    return Err(Diagnostic::new(
                        Phase::Evaluate,
                        ErrorCode::DimensionlessRequired,
                        "IF condition must be dimensionless (boolean)",
                    )
                    .with_span(*span));
                }
                if cond.value != 0.0 {
                    // Untaken branches are never evaluated, so they cannot
                    // perform spurious delay-state writes; cross-branch
                    // unit consistency is therefore only checked when it
                    // can be without evaluating the branch (§4.4's "when
                    // both known at compile time" case is out of scope for
                    // this tree-walking evaluator).
                    return evaluate_equation(&branch.then, scope, services);
                }
            }
            match else_branch {
                Some(e) => evaluate_equation(e, scope, services),
                None => Err(Diagnostic::new(
                    Phase::Evaluate,
                    ErrorCode::UnsupportedOperator,
                    "IF chain had no matching branch and no ELSE",
                )
                .with_span(*span)),
            }
        }
        Expr::Call { name, args, .. } => {
            let values: Result<Vec<Quantity>> = args.iter().map(|a| evaluate_equation(a, scope, services)).collect();
            call_builtin(name, &values?, services.time)
        }
        Expr::Lookup1D { x, points, x_unit, y_unit, span } => {
            let xq = evaluate_equation(x, scope, services)?;
            if let Some(xu) = x_unit {
                if xq.units != *xu {
                    return Err(Diagnostic::new(
                        Phase::Evaluate,
                        ErrorCode::UnitMismatch,
                        format!(
                            "LOOKUP input has units `{}`, table expects `{}`",
                            format_unit_map(&xq.units),
                            format_unit_map(xu)
                        ),
                    )
                    .with_span(*span));
                }
            }
            let value = interpolate(points, xq.value, services.lookup_policy);
            Ok(Quantity { value, units: y_unit.clone().unwrap_or_default() })
        }
        Expr::Delay { kind, input, tau, init, id, span } => evaluate_delay(*kind, input, tau, init.as_deref(), id, *span, scope, services),
        Expr::Time { kind, .. } => Ok(match kind {
            TimeKind::Time => time_quantity(services, services.time),
            TimeKind::TimeStep => time_quantity(services, services.time_config.step),
            TimeKind::InitialTime => time_quantity(services, services.time_config.start),
            TimeKind::FinalTime => time_quantity(services, services.time_config.end),
        }),
    }
}

fn evaluate_binary(op: BinaryOp, left: &Expr, right: &Expr, span: crate::common::Span, scope: &Scope, services: &EvalServices) -> Result<Quantity> {
    let l = evaluate_equation(left, scope, services)?;
    let r = evaluate_equation(right, scope, services)?;
    match op {
        BinaryOp::Add => l.add(&r).map_err(|e| e.with_span(span)),
        BinaryOp::Sub => l.sub(&r).map_err(|e| e.with_span(span)),
        BinaryOp::Mul => Ok(l.mul(&r)),
        BinaryOp::Div => Ok(l.div(&r)),
        BinaryOp::Mod => l.modulo(&r).map_err(|e| e.with_span(span)),
        BinaryOp::Pow => {
            if !r.is_dimensionless() {
                return Err(Diagnostic::new(
                    Phase::Evaluate,
                    ErrorCode::DimensionlessRequired,
                    "the exponent of `^` must be dimensionless",
                )
                .with_span(span));
            }
            l.pow(r.value).map_err(|e| e.with_span(span))
        }
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            let ord = l.compare_ord(&r).map_err(|e| e.with_span(span))?;
            let truth = match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Lte => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Gte => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Quantity::dimensionless(if truth { 1.0 } else { 0.0 }))
        }
        BinaryOp::Eq => Ok(Quantity::dimensionless(if l.compare_eq(&r).map_err(|e| e.with_span(span))? { 1.0 } else { 0.0 })),
        BinaryOp::Neq => Ok(Quantity::dimensionless(if !l.compare_eq(&r).map_err(|e| e.with_span(span))? { 1.0 } else { 0.0 })),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
            if !l.is_dimensionless() || !r.is_dimensionless() {
                return Err(Diagnostic::new(
                    Phase::Evaluate,
                    ErrorCode::DimensionlessRequired,
                    format!("`{op:?}` requires dimensionless (boolean) operands"),
                )
                .with_span(span));
            }
            let (lb, rb) = (l.value != 0.0, r.value != 0.0);
            let truth = match op {
                BinaryOp::And => lb && rb,
                BinaryOp::Or => lb || rb,
                BinaryOp::Xor => lb != rb,
                _ => unreachable!(),
            };
            Ok(Quantity::dimensionless(if truth { 1.0 } else { 0.0 }))
        }
    }
}

/// Binary search + linear interpolation over a strictly-increasing point
/// table, clamping or linearly extrapolating outside `[x0, xn]` per
/// `policy` (`spec.md` §4.4, "Lookup1D").
fn interpolate(points: &[(f64, f64)], x: f64, policy: LookupPolicy) -> f64 {
    let (x0, y0) = points[0];
    let (xn, yn) = points[points.len() - 1];
    if x <= x0 {
        return match policy {
            LookupPolicy::Clamp => y0,
            LookupPolicy::LinearExtrapolation if points.len() > 1 => {
                let (x1, y1) = points[1];
                y0 + (x - x0) * (y1 - y0) / (x1 - x0)
            }
            LookupPolicy::LinearExtrapolation => y0,
        };
    }
    if x >= xn {
        return match policy {
            LookupPolicy::Clamp => yn,
            LookupPolicy::LinearExtrapolation if points.len() > 1 => {
                let (xm, ym) = points[points.len() - 2];
                ym + (x - xm) * (yn - ym) / (xn - xm)
            }
            LookupPolicy::LinearExtrapolation => yn,
        };
    }
    let idx = points.partition_point(|&(px, _)| px <= x).saturating_sub(1);
    let (x0, y0) = points[idx];
    let (x1, y1) = points[idx + 1];
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// `DELAY1`/`SMOOTH`/`DELAY3`/`SMOOTH3` share the same first-order
/// recurrence; `DELAY3`/`SMOOTH3` chain three stages each with `tau/3`,
/// keyed `"{id}#0"`, `"{id}#1"`, `"{id}#2"`.
fn evaluate_delay(
    kind: DelayKind,
    input: &Expr,
    tau: &Expr,
    init: Option<&Expr>,
    id: &str,
    span: crate::common::Span,
    scope: &Scope,
    services: &EvalServices,
) -> Result<Quantity> {
    let x = evaluate_equation(input, scope, services)?;
    let tau_q = evaluate_equation(tau, scope, services)?;

    let time_dim_ok = match &services.time_unit {
        Some(time_unit) => tau_q.units == *time_unit,
        None => tau_q.is_dimensionless(),
    };
    if !time_dim_ok {
        return Err(Diagnostic::new(
            Phase::Evaluate,
            ErrorCode::DelayInvalidTau,
            format!("DELAY/SMOOTH time constant must have time dimension, got `{}`", format_unit_map(&tau_q.units)),
        )
        .with_span(span));
    }
    if tau_q.value <= 0.0 {
        // passthrough per spec.md: invalid (non-positive) tau is not an
        // error, it just disables the lag.
        return Ok(x);
    }

    let init_q = match init {
        Some(e) => {
            let q = evaluate_equation(e, scope, services)?;
            if q.units != x.units {
                return Err(Diagnostic::new(
                    Phase::Evaluate,
                    ErrorCode::UnitMismatch,
                    "DELAY/SMOOTH `init` must share units with `input`",
                )
                .with_span(span));
            }
            Some(q.value)
        }
        None => None,
    };

    let dt = services.time_config.step;
    let stages = match kind {
        DelayKind::Delay1 | DelayKind::Smooth => 1,
        DelayKind::Delay3 | DelayKind::Smooth3 => 3,
    };
    let stage_tau = tau_q.value / stages as f64;

    let mut stage_input = x.value;
    for stage in 0..stages {
        let key = format!("{id}#{stage}");
        let prev = services
            .delay_state
            .read(services.run_id, &key)
            .or(if stage == 0 { init_q } else { None })
            .unwrap_or(stage_input);
        let next = prev + (dt / stage_tau) * (stage_input - prev);
        if !services.scratch {
            services.delay_state.write(services.run_id, &key, next);
        }
        stage_input = next;
    }

    Ok(Quantity { value: stage_input, units: x.units })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_equation;

    fn services<'a>(time_config: &'a TimeConfig, time: f64, store: &'a DelayStateStore, registry: &'a UnitRegistry) -> EvalServices<'a> {
        EvalServices {
            time_config,
            time,
            run_id: "test",
            delay_state: store,
            lookup_policy: LookupPolicy::Clamp,
            registry,
            time_unit: None,
            scratch: false,
        }
    }

    #[test]
    fn test_identifier_not_found() {
        let eqn = parse_equation("[Missing] + 1").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 1.0, step: 1.0 };
        let reg = UnitRegistry::new();
        let scope = Scope::new();
        let err = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap_err();
        assert_eq!(err.code, ErrorCode::IdentifierNotFound);
    }

    #[test]
    fn test_arithmetic() {
        let eqn = parse_equation("1 + 2 * 3").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 1.0, step: 1.0 };
        let reg = UnitRegistry::new();
        let scope = Scope::new();
        let q = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap();
        assert_eq!(q.value, 7.0);
    }

    #[test]
    fn test_if_chain() {
        let eqn = parse_equation("IF [X] > 1 THEN 1 ELSE 0 END IF").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 1.0, step: 1.0 };
        let reg = UnitRegistry::new();
        let mut scope = Scope::new();
        scope.insert("X", Quantity::dimensionless(5.0));
        let q = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap();
        assert_eq!(q.value, 1.0);
    }

    #[test]
    fn test_lookup_clamping() {
        let eqn = parse_equation("LOOKUP(x, (0, 0), (1, 10))").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 1.0, step: 1.0 };
        let reg = UnitRegistry::new();
        let mut scope = Scope::new();

        scope.insert("x", Quantity::dimensionless(-1.0));
        let below = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap();
        assert_eq!(below.value, 0.0);

        scope.insert("x", Quantity::dimensionless(0.5));
        let mid = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap();
        assert_eq!(mid.value, 5.0);

        scope.insert("x", Quantity::dimensionless(10.0));
        let above = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap();
        assert_eq!(above.value, 10.0);
    }

    #[test]
    fn test_delay1_state_persistence() {
        // DELAY1([Input], 1 tick, 0 tick) with Input = t, dt = 0.1, seeded scenario 6.
        let eqn = parse_equation("DELAY1([Input], 1, 0)").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 0.6, step: 0.1 };
        let reg = UnitRegistry::new();

        let mut y_prev = 0.0f64;
        for n in 1..=6 {
            let t = n as f64 * 0.1;
            let mut scope = Scope::new();
            scope.insert("Input", Quantity::dimensionless(t));
            let svc = services(&tc, t, &store, &reg);
            let q = evaluate_equation(&eqn.expr, &scope, &svc).unwrap();
            let expected = y_prev + 0.1 * (t - y_prev);
            assert!((q.value - expected).abs() < 1e-9, "step {n}: got {}, want {}", q.value, expected);
            y_prev = expected;
        }
    }

    #[test]
    fn test_delay_nonpositive_tau_passes_through() {
        let eqn = parse_equation("DELAY1([Input], 0)").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 1.0, step: 0.1 };
        let reg = UnitRegistry::new();
        let mut scope = Scope::new();
        scope.insert("Input", Quantity::dimensionless(42.0));
        let q = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap();
        assert_eq!(q.value, 42.0);
    }

    #[test]
    fn test_unit_mismatch_on_addition() {
        let eqn = parse_equation("[A] + [B]").unwrap();
        let store = DelayStateStore::new();
        let tc = TimeConfig { start: 0.0, end: 1.0, step: 1.0 };
        let reg = UnitRegistry::new();
        let mut scope = Scope::new();
        scope.insert("A", Quantity::dimensionless(1.0));
        let mut b_units = UnitExponentMap::new();
        b_units.insert("tick".to_string(), 1.0);
        scope.insert("B", Quantity { value: 1.0, units: b_units });
        let err = evaluate_equation(&eqn.expr, &scope, &services(&tc, 0.0, &store, &reg)).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnitMismatch);
    }
}
