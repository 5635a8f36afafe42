// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The system-dynamics model data types (`spec.md` §3, "Model") and their
//! structural validation: unique names, stock references that resolve,
//! and a sane `TimeConfig`.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::common::{canonicalize, Diagnostic, ErrorCode, Phase, Result};
use crate::units::UnitExponentMap;

/// A snapshot of one simulated instant (`spec.md` §3, "SimState"): stock
/// and variable values are finite reals, unit maps are valid for that
/// state's `time`.
#[derive(Clone, Debug, PartialEq)]
pub struct SimState {
    pub time: f64,
    pub stocks: HashMap<Id, f64>,
    pub variables: HashMap<Id, f64>,
    pub units: SimUnits,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct SimUnits {
    pub time: UnitExponentMap,
    pub stocks: HashMap<Id, UnitExponentMap>,
    pub variables: HashMap<Id, UnitExponentMap>,
    pub rates: HashMap<Id, UnitExponentMap>,
}

pub type Id = String;

#[derive(Clone, Debug, PartialEq)]
pub struct Stock {
    pub id: Id,
    pub name: String,
    pub initial_value: f64,
    pub units: Option<UnitExponentMap>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Flow {
    pub id: Id,
    pub name: String,
    pub source: Option<Id>,
    pub target: Option<Id>,
    pub rate_equation: String,
    pub units: Option<UnitExponentMap>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VariableKind {
    Auxiliary,
    Constant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub id: Id,
    pub name: String,
    pub equation: String,
    pub kind: VariableKind,
    /// Constants may skip parsing their equation and carry a literal value
    /// directly (`spec.md` §3, "Variable ... value?").
    pub value: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TimeConfig {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl TimeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.end >= self.start) {
            return Err(Diagnostic::new(
                Phase::Compile,
                ErrorCode::ModelValidationError,
                format!("TimeConfig.end ({}) must be >= TimeConfig.start ({})", self.end, self.start),
            ));
        }
        if !(self.step > 0.0) || !self.step.is_finite() {
            return Err(Diagnostic::new(
                Phase::Compile,
                ErrorCode::ModelValidationError,
                format!("TimeConfig.step ({}) must be a positive, finite number", self.step),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    pub id: Id,
    pub name: String,
    pub stocks: Vec<Stock>,
    pub flows: Vec<Flow>,
    pub variables: Vec<Variable>,
    pub time_config: TimeConfig,
}

impl Model {
    pub fn stock(&self, id: &str) -> Option<&Stock> {
        self.stocks.iter().find(|s| s.id == id)
    }

    pub fn variable(&self, id: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    /// Look up a stock or constant variable by its canonicalized *name*,
    /// the way `scenario::branch` resolves override targets (`spec.md`
    /// §4.8).
    pub fn find_by_name(&self, name: &str) -> Option<NamedTarget<'_>> {
        let key = canonicalize(name);
        if let Some(s) = self.stocks.iter().find(|s| canonicalize(&s.name) == key) {
            return Some(NamedTarget::Stock(s));
        }
        if let Some(v) = self.variables.iter().find(|v| canonicalize(&v.name) == key) {
            return Some(NamedTarget::Variable(v));
        }
        None
    }

    /// Structural validation: unique names across stocks/flows/variables,
    /// every flow's `source`/`target` resolves to a stock in this model,
    /// at least one of `source`/`target` is set, and `time_config` is
    /// sane. Does not touch equation text (that's `compile.rs`'s job).
    pub fn validate(&self) -> Result<()> {
        self.time_config.validate()?;

        let mut names: HashSet<String> = HashSet::new();
        for name in self
            .stocks
            .iter()
            .map(|s| &s.name)
            .chain(self.flows.iter().map(|f| &f.name))
            .chain(self.variables.iter().map(|v| &v.name))
        {
            let key = canonicalize(name);
            if !names.insert(key) {
                return Err(Diagnostic::new(
                    Phase::Compile,
                    ErrorCode::ModelValidationError,
                    format!("duplicate name `{name}` in model `{}`", self.name),
                ));
            }
        }

        let stock_ids: HashSet<&str> = self.stocks.iter().map(|s| s.id.as_str()).collect();
        for flow in &self.flows {
            if flow.source.is_none() && flow.target.is_none() {
                return Err(Diagnostic::new(
                    Phase::Compile,
                    ErrorCode::ModelValidationError,
                    format!("flow `{}` must set at least one of source/target", flow.name),
                ));
            }
            for end in [&flow.source, &flow.target].into_iter().flatten() {
                if !stock_ids.contains(end.as_str()) {
                    return Err(Diagnostic::new(
                        Phase::Compile,
                        ErrorCode::ModelValidationError,
                        format!("flow `{}` references unknown stock id `{end}`", flow.name),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Reads a parameter's current scalar value by name, for sensitivity
    /// and optimization to perturb (`spec.md` §4.8). Only stocks'
    /// `initial_value` and constant variables' `value` qualify as
    /// parameters; an auxiliary or unknown name fails with
    /// `ObjectiveMetricMissing`.
    pub fn current_parameter_value(&self, name: &str) -> Result<f64> {
        match self.find_by_name(name) {
            Some(NamedTarget::Stock(s)) => Ok(s.initial_value),
            Some(NamedTarget::Variable(v)) if v.kind == VariableKind::Constant => {
                v.value.ok_or_else(|| {
                    Diagnostic::new(
                        Phase::Scenario,
                        ErrorCode::ObjectiveMetricMissing,
                        format!("constant `{name}` in model `{}` has no literal value", self.name),
                    )
                })
            }
            _ => Err(Diagnostic::new(
                Phase::Scenario,
                ErrorCode::ObjectiveMetricMissing,
                format!("`{name}` is not a stock or constant variable in model `{}`", self.name),
            )),
        }
    }

    /// Reads a metric's value out of a simulated `state` by name, for
    /// objective and Monte Carlo reporting (`spec.md` §4.8). A metric may
    /// name any stock or variable tracked in `state`.
    pub fn metric_value(&self, state: &SimState, name: &str) -> Result<f64> {
        self.metric_value_in(&state.stocks, &state.variables, name)
    }

    /// As [`Model::metric_value`], but reads from standalone stock/variable
    /// maps (e.g. a [`crate::scenario::ScenarioSummary`]'s final values)
    /// rather than a full `SimState`.
    pub fn metric_value_in(&self, stocks: &HashMap<Id, f64>, variables: &HashMap<Id, f64>, name: &str) -> Result<f64> {
        match self.find_by_name(name) {
            Some(NamedTarget::Stock(s)) => stocks.get(&s.id).copied().ok_or_else(|| {
                Diagnostic::new(
                    Phase::Scenario,
                    ErrorCode::ObjectiveMetricMissing,
                    format!("stock `{name}` has no recorded value in this state"),
                )
            }),
            Some(NamedTarget::Variable(v)) => variables.get(&v.id).copied().or(v.value).ok_or_else(|| {
                Diagnostic::new(
                    Phase::Scenario,
                    ErrorCode::ObjectiveMetricMissing,
                    format!("variable `{name}` has no recorded value in this state"),
                )
            }),
            None => Err(Diagnostic::new(
                Phase::Scenario,
                ErrorCode::ObjectiveMetricMissing,
                format!("metric `{name}` does not match any stock or variable in model `{}`", self.name),
            )),
        }
    }

    /// A copy of this model with `overrides` applied: each name is
    /// resolved against stocks (replacing `initial_value`) or constant
    /// variables (replacing `value`). Unknown names fail with
    /// `ScenarioOverrideUnknown`, used directly by `scenario::branch`.
    pub fn with_overrides(&self, overrides: &HashMap<String, f64>) -> Result<Model> {
        let mut next = self.clone();
        for (name, &value) in overrides {
            let key = canonicalize(name);
            if let Some(stock) = next.stocks.iter_mut().find(|s| canonicalize(&s.name) == key) {
                stock.initial_value = value;
                continue;
            }
            if let Some(var) = next
                .variables
                .iter_mut()
                .find(|v| canonicalize(&v.name) == key && v.kind == VariableKind::Constant)
            {
                var.value = Some(value);
                continue;
            }
            return Err(Diagnostic::new(
                Phase::Scenario,
                ErrorCode::ScenarioOverrideUnknown,
                format!("override target `{name}` does not match any stock or constant variable in model `{}`", self.name),
            ));
        }
        Ok(next)
    }
}

pub enum NamedTarget<'a> {
    Stock(&'a Stock),
    Variable(&'a Variable),
}

/// A stable ordering of every node id declared in `model`, in declaration
/// order: stocks first, then flows, then variables. Used as the
/// tie-break order for the evaluation graph's topological sort.
pub fn declaration_order(model: &Model) -> Vec<&str> {
    let mut order: Vec<&str> = Vec::with_capacity(model.stocks.len() + model.flows.len() + model.variables.len());
    order.extend(model.stocks.iter().map(|s| s.id.as_str()));
    order.extend(model.flows.iter().map(|f| f.id.as_str()));
    order.extend(model.variables.iter().map(|v| v.id.as_str()));
    order
}

/// Collapse declaration order into a `BTreeSet` view where duplicate
/// lookups are cheap; used by `graph.rs` when building adjacency maps.
pub fn node_id_set(model: &Model) -> BTreeSet<&str> {
    declaration_order(model).into_iter().collect()
}
