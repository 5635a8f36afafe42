// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The scenario engine (`spec.md` §4.8): branching, bounded-parallel
//! comparison, sensitivity analysis, grid/random optimization, and seeded
//! Monte Carlo with percentile reporting.

use std::collections::HashMap;

#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{Diagnostic, ErrorCode, Phase, Result};
use crate::compile::{self, CompiledModel};
use crate::driver;
use crate::interpreter::{DelayStateStore, LookupPolicy};
use crate::model::{Id, Model, SimState};
use crate::solver::{RunContext, SolverKind};
use crate::units::UnitRegistry;

/// `spec.md` §3, "Scenario" — a named set of overrides branched off a
/// base model. `overrides` targets stock initial values and constant
/// variable values by name, resolved the same way `Model::with_overrides`
/// resolves them.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioDefinition {
    pub id: String,
    pub name: String,
    pub base_model_id: String,
    pub overrides: HashMap<String, f64>,
}

/// Collaborators every scenario run shares: which solver to step with, how
/// many workers may run concurrently (`spec.md` §5's bounded worker
/// pool), and the lookup extrapolation policy. Each run still gets its own
/// `DelayStateStore`, per §5's "no shared mutable state crosses run
/// boundaries".
#[derive(Clone, Debug)]
pub struct ScenarioOptions {
    pub solver: SolverKind,
    pub parallelism: usize,
    pub lookup_policy: LookupPolicy,
    pub collect_traces: bool,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        // `spec.md` §5: "a `parallelism` knob (default: an
        // implementation-defined small integer)".
        ScenarioOptions {
            solver: SolverKind::Euler,
            parallelism: 4,
            lookup_policy: LookupPolicy::Clamp,
            collect_traces: false,
        }
    }
}

/// One scenario's result: final values, and the delta from the model's
/// initial state, for every stock and variable. Optionally carries the
/// full state trace when `ScenarioOptions::collect_traces` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioSummary {
    pub final_stocks: HashMap<Id, f64>,
    pub final_variables: HashMap<Id, f64>,
    pub delta_stocks: HashMap<Id, f64>,
    pub delta_variables: HashMap<Id, f64>,
    pub trace: Option<Vec<SimState>>,
}

fn run_bounded<T, F>(count: usize, parallelism: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    #[cfg(not(target_arch = "wasm32"))]
    {
        // A scoped pool sized to `parallelism`, never the global rayon
        // pool, so `options.parallelism` is honestly respected per call
        // (`spec.md` §9, "Bounded ensembles").
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .build()
            .expect("failed to build scenario worker pool");
        pool.install(|| (0..count).into_par_iter().map(f).collect())
    }
    #[cfg(target_arch = "wasm32")]
    {
        (0..count).map(f).collect()
    }
}

fn run_to_summary(model: &Model, registry: &UnitRegistry, options: &ScenarioOptions, run_id: &str) -> Result<ScenarioSummary> {
    let compiled = compile::compile_model(model)?;
    let store = DelayStateStore::new();
    let ctx = RunContext {
        registry,
        delay_state: &store,
        run_id,
        lookup_policy: options.lookup_policy,
        time_unit: None,
    };
    let states = driver::simulate_eager(&compiled, options.solver.clone(), ctx)?;
    summarize(&states, options.collect_traces)
}

fn summarize(states: &[SimState], keep_trace: bool) -> Result<ScenarioSummary> {
    let initial = states.first().ok_or_else(|| {
        Diagnostic::new(Phase::Scenario, ErrorCode::ModelValidationError, "simulation produced no states")
    })?;
    let last = states.last().expect("non-empty states has a last element");

    let mut delta_stocks = HashMap::new();
    for (id, &v) in &last.stocks {
        delta_stocks.insert(id.clone(), v - initial.stocks.get(id).copied().unwrap_or(0.0));
    }
    let mut delta_variables = HashMap::new();
    for (id, &v) in &last.variables {
        delta_variables.insert(id.clone(), v - initial.variables.get(id).copied().unwrap_or(0.0));
    }

    Ok(ScenarioSummary {
        final_stocks: last.stocks.clone(),
        final_variables: last.variables.clone(),
        delta_stocks,
        delta_variables,
        trace: if keep_trace { Some(states.to_vec()) } else { None },
    })
}

/// Branch `base` into a new model with `scenario.overrides` applied.
/// Unknown override names fail with `ScenarioOverrideUnknown`.
pub fn branch(base: &Model, scenario: &ScenarioDefinition) -> Result<Model> {
    base.with_overrides(&scenario.overrides)
}

/// Outcome of one scenario within a [`compare`] batch: errors are
/// attributed to the offending scenario id rather than cancelling the
/// whole batch (`spec.md` §7, "attributes errors to the offending
/// scenario id and continues processing other scenarios").
#[derive(Clone, Debug)]
pub struct ScenarioOutcome {
    pub id: String,
    pub result: Result<ScenarioSummary>,
}

#[derive(Clone, Debug)]
pub struct CompareReport {
    pub baseline: ScenarioSummary,
    pub scenarios: Vec<ScenarioOutcome>,
}

/// Runs `base` and every scenario in `scenarios` to completion, bounded to
/// `options.parallelism` concurrent workers. Result order matches input
/// scenario order regardless of which worker finishes first (`spec.md`
/// §5, "Ordering guarantees").
pub fn compare(base: &Model, scenarios: &[ScenarioDefinition], registry: &UnitRegistry, options: &ScenarioOptions) -> Result<CompareReport> {
    let baseline = run_to_summary(base, registry, options, "scenario:baseline")?;

    let outcomes = run_bounded(scenarios.len(), options.parallelism, |i| {
        let scenario = &scenarios[i];
        tracing::debug!(scenario = %scenario.id, "starting scenario worker");
        let result = branch(base, scenario).and_then(|branched| {
            run_to_summary(&branched, registry, options, &format!("scenario:{}", scenario.id))
        });
        if let Err(e) = &result {
            tracing::warn!(scenario = %scenario.id, error = %e, "scenario worker failed");
        }
        ScenarioOutcome { id: scenario.id.clone(), result }
    });

    Ok(CompareReport { baseline, scenarios: outcomes })
}

/// Per-parameter impact of a `±epsilon` perturbation on `metric` at the
/// horizon (`spec.md` §4.8, "Sensitivity").
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterImpact {
    pub parameter: String,
    pub baseline_value: f64,
    pub plus_value: f64,
    pub minus_value: f64,
    pub absolute_impact: f64,
    pub relative_impact: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensitivityReport {
    pub baseline_metric: f64,
    pub impacts: Vec<ParameterImpact>,
}

/// Runs `base` plus a `±epsilon` perturbation of each named parameter and
/// reports the impact on `metric` at the horizon. Deterministic given
/// fixed inputs (`spec.md` §4.8, "Sensitivity").
pub fn sensitivity(
    base: &Model,
    registry: &UnitRegistry,
    options: &ScenarioOptions,
    metric: &str,
    parameters: &[String],
    epsilon: f64,
) -> Result<SensitivityReport> {
    let baseline_summary = run_to_summary(base, registry, options, "sensitivity:baseline")?;
    let baseline_metric = metric_value(base, &baseline_summary, metric)?;

    let impacts = run_bounded(parameters.len(), options.parallelism, |i| -> Result<ParameterImpact> {
        let name = &parameters[i];
        let baseline_value = base.current_parameter_value(name)?;

        let plus_model = base.with_overrides(&HashMap::from([(name.clone(), baseline_value * (1.0 + epsilon))]))?;
        let plus_summary = run_to_summary(&plus_model, registry, options, &format!("sensitivity:{name}:plus"))?;
        let plus_value = metric_value(&plus_model, &plus_summary, metric)?;

        let minus_model = base.with_overrides(&HashMap::from([(name.clone(), baseline_value * (1.0 - epsilon))]))?;
        let minus_summary = run_to_summary(&minus_model, registry, options, &format!("sensitivity:{name}:minus"))?;
        let minus_value = metric_value(&minus_model, &minus_summary, metric)?;

        let absolute_impact = (plus_value - baseline_metric).abs().max((minus_value - baseline_metric).abs());
        let relative_impact = if baseline_metric.abs() > 1e-12 { absolute_impact / baseline_metric.abs() } else { 0.0 };

        Ok(ParameterImpact {
            parameter: name.clone(),
            baseline_value,
            plus_value,
            minus_value,
            absolute_impact,
            relative_impact,
        })
    })
    .into_iter()
    .collect::<Result<Vec<_>>>()?;

    Ok(SensitivityReport { baseline_metric, impacts })
}

fn metric_value(model: &Model, summary: &ScenarioSummary, name: &str) -> Result<f64> {
    model.metric_value_in(&summary.final_stocks, &summary.final_variables, name)
}

/// A parameter's search bounds; `grid_samples` is only consulted by
/// [`OptimizeStrategy::Grid`].
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub grid_samples: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

/// `spec.md` §4.8, "Optimize ... Objective: maximize or minimize a target
/// metric at a given time". `at_time: None` means the simulation horizon.
#[derive(Clone, Debug, PartialEq)]
pub struct Objective {
    pub metric: String,
    pub direction: ObjectiveDirection,
    pub at_time: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizeResult {
    pub best_parameters: HashMap<String, f64>,
    pub best_value: f64,
    pub iterations: usize,
}

/// `grid`, `random`, or an opaque user strategy (`spec.md` §4.8,
/// "Optimize"). The `Custom` variant receives the same collaborators this
/// module's own strategies use, so a caller's strategy can reuse
/// [`evaluate_candidate`] directly.
pub enum OptimizeStrategy {
    Grid,
    Random { iterations: usize, seed: u64 },
    Custom(Box<dyn Fn(&Model, &UnitRegistry, &ScenarioOptions, &[ParameterSpec], &Objective) -> Result<OptimizeResult> + Send + Sync>),
}

fn linspace(min: f64, max: f64, samples: usize) -> Vec<f64> {
    if samples <= 1 {
        return vec![min];
    }
    let step = (max - min) / (samples - 1) as f64;
    (0..samples).map(|i| min + step * i as f64).collect()
}

fn cartesian_product(parameters: &[ParameterSpec]) -> Vec<HashMap<String, f64>> {
    let mut combos: Vec<HashMap<String, f64>> = vec![HashMap::new()];
    for p in parameters {
        let values = linspace(p.min, p.max, p.grid_samples.max(1));
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for &v in &values {
                let mut c = combo.clone();
                c.insert(p.name.clone(), v);
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

/// Runs `base` with `candidate` applied as overrides and returns the
/// objective's metric value at `objective.at_time` (or the horizon).
/// Exposed so a [`OptimizeStrategy::Custom`] closure can reuse it.
pub fn evaluate_candidate(
    base: &Model,
    registry: &UnitRegistry,
    options: &ScenarioOptions,
    candidate: &HashMap<String, f64>,
    objective: &Objective,
    run_id: &str,
) -> Result<f64> {
    let model = base.with_overrides(candidate)?;
    let compiled = compile::compile_model(&model)?;
    let store = DelayStateStore::new();
    let ctx = RunContext {
        registry,
        delay_state: &store,
        run_id,
        lookup_policy: options.lookup_policy,
        time_unit: None,
    };
    let states = driver::simulate_eager(&compiled, options.solver.clone(), ctx)?;
    let state = state_at(&states, objective.at_time)?;
    model.metric_value(state, &objective.metric)
}

fn state_at(states: &[SimState], at_time: Option<f64>) -> Result<&SimState> {
    match at_time {
        None => states.last().ok_or_else(|| {
            Diagnostic::new(Phase::Scenario, ErrorCode::ModelValidationError, "simulation produced no states")
        }),
        Some(t) => states
            .iter()
            .min_by(|a, b| (a.time - t).abs().partial_cmp(&(b.time - t).abs()).unwrap())
            .ok_or_else(|| Diagnostic::new(Phase::Scenario, ErrorCode::ModelValidationError, "simulation produced no states")),
    }
}

fn better(direction: ObjectiveDirection, candidate: f64, incumbent: f64) -> bool {
    match direction {
        ObjectiveDirection::Maximize => candidate > incumbent,
        ObjectiveDirection::Minimize => candidate < incumbent,
    }
}

/// Picks the best of `candidates` (already paired with their evaluated
/// objective value) by `direction`, breaking ties by the earliest index
/// for determinism.
fn pick_best(direction: ObjectiveDirection, evaluations: Vec<(HashMap<String, f64>, Result<f64>)>) -> Result<OptimizeResult> {
    let iterations = evaluations.len();
    let mut best: Option<(HashMap<String, f64>, f64)> = None;
    for (params, value) in evaluations {
        let value = value?;
        best = match best {
            None => Some((params, value)),
            Some((bp, bv)) if better(direction, value, bv) => Some((params, value)),
            Some(existing) => Some(existing),
        };
    }
    let (best_parameters, best_value) = best.ok_or_else(|| {
        Diagnostic::new(Phase::Scenario, ErrorCode::ModelValidationError, "optimize ran zero candidates")
    })?;
    Ok(OptimizeResult { best_parameters, best_value, iterations })
}

/// Maximizes or minimizes `objective`'s metric over `parameters` using
/// `strategy` (`spec.md` §4.8, "Optimize"). Grid and random strategies
/// both respect each parameter's `[min, max]` bounds.
pub fn optimize(
    base: &Model,
    registry: &UnitRegistry,
    options: &ScenarioOptions,
    parameters: &[ParameterSpec],
    objective: &Objective,
    strategy: &OptimizeStrategy,
) -> Result<OptimizeResult> {
    match strategy {
        OptimizeStrategy::Grid => {
            let candidates = cartesian_product(parameters);
            let evaluations: Vec<(HashMap<String, f64>, Result<f64>)> = run_bounded(candidates.len(), options.parallelism, |i| {
                let candidate = candidates[i].clone();
                let value = evaluate_candidate(base, registry, options, &candidate, objective, &format!("optimize:grid:{i}"));
                (candidate, value)
            });
            pick_best(objective.direction, evaluations)
        }
        OptimizeStrategy::Random { iterations, seed } => {
            // Candidates are drawn sequentially from one seeded PRNG so the
            // sample sequence is reproducible regardless of how evaluation
            // itself is scheduled (`spec.md` §4.8, "seeded PRNG").
            let mut rng = StdRng::seed_from_u64(*seed);
            let candidates: Vec<HashMap<String, f64>> = (0..*iterations)
                .map(|_| {
                    parameters
                        .iter()
                        .map(|p| (p.name.clone(), rng.random_range(p.min..=p.max)))
                        .collect()
                })
                .collect();
            let evaluations: Vec<(HashMap<String, f64>, Result<f64>)> = run_bounded(candidates.len(), options.parallelism, |i| {
                let candidate = candidates[i].clone();
                let value = evaluate_candidate(base, registry, options, &candidate, objective, &format!("optimize:random:{i}"));
                (candidate, value)
            });
            pick_best(objective.direction, evaluations)
        }
        OptimizeStrategy::Custom(f) => f(base, registry, options, parameters, objective),
    }
}

/// Draws one parameter's value from `(baseline, rng)` for a Monte Carlo
/// iteration (`spec.md` §4.8, "Monte Carlo").
pub type Sampler = Box<dyn Fn(&Model, &mut StdRng) -> f64 + Send + Sync>;

#[derive(Clone, Debug)]
pub struct MonteCarloOptions {
    pub iterations: usize,
    pub seed: u64,
    pub metrics: Vec<String>,
}

/// `{mean, variance, min, max, percentiles at [0.5, 0.9, 0.95]}` for one
/// tracked metric, computed from the full sample set.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricStats {
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    /// `(percentile, value)` pairs for `[0.5, 0.9, 0.95]`.
    pub percentiles: Vec<(f64, f64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MonteCarloReport {
    pub metrics: HashMap<String, MetricStats>,
}

const MONTE_CARLO_PERCENTILES: [f64; 3] = [0.5, 0.9, 0.95];

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + frac * (sorted[hi] - sorted[lo])
    }
}

fn compute_stats(mut samples: Vec<f64>) -> MetricStats {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let percentiles = MONTE_CARLO_PERCENTILES.iter().map(|&p| (p, percentile(&samples, p))).collect();
    MetricStats { mean, variance, min, max, percentiles }
}

/// Samples `samplers` for `mc.iterations` draws from a PRNG seeded with
/// `mc.seed`, runs each sampled scenario, and aggregates `mc.metrics` at
/// the horizon. Same inputs and seed produce identical outputs (`spec.md`
/// §4.8 + §8, scenario 8).
pub fn monte_carlo(
    base: &Model,
    registry: &UnitRegistry,
    options: &ScenarioOptions,
    samplers: &HashMap<String, Sampler>,
    mc: &MonteCarloOptions,
) -> Result<MonteCarloReport> {
    // Draws happen sequentially against one PRNG stream, in a fixed
    // sampler order, so the sequence does not depend on how evaluation is
    // parallelized below (`spec.md` §5, "Monte Carlo results are
    // aggregated in iteration-index order").
    let mut rng = StdRng::seed_from_u64(mc.seed);
    let mut sampler_names: Vec<&String> = samplers.keys().collect();
    sampler_names.sort();

    let candidates: Vec<HashMap<String, f64>> = (0..mc.iterations)
        .map(|_| {
            sampler_names
                .iter()
                .map(|&name| (name.clone(), (samplers[name])(base, &mut rng)))
                .collect()
        })
        .collect();

    tracing::debug!(iterations = mc.iterations, seed = mc.seed, "starting Monte Carlo run");
    let results: Vec<Result<ScenarioSummary>> = run_bounded(candidates.len(), options.parallelism, |i| {
        branch_and_run(base, registry, options, &candidates[i], &format!("montecarlo:{i}"))
    });

    let mut per_metric: HashMap<String, Vec<f64>> = mc.metrics.iter().map(|m| (m.clone(), Vec::with_capacity(mc.iterations))).collect();
    for result in results {
        let summary = result?;
        for metric in &mc.metrics {
            let value = metric_value(base, &summary, metric)?;
            per_metric.get_mut(metric).expect("metric pre-populated above").push(value);
        }
    }

    let metrics = per_metric.into_iter().map(|(name, samples)| (name, compute_stats(samples))).collect();
    Ok(MonteCarloReport { metrics })
}

fn branch_and_run(base: &Model, registry: &UnitRegistry, options: &ScenarioOptions, overrides: &HashMap<String, f64>, run_id: &str) -> Result<ScenarioSummary> {
    let model = base.with_overrides(overrides)?;
    run_to_summary(&model, registry, options, run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flow, Stock, TimeConfig, Variable, VariableKind};

    fn growth_model() -> Model {
        Model {
            id: "m".to_string(),
            name: "m".to_string(),
            stocks: vec![Stock { id: "s".to_string(), name: "Population".to_string(), initial_value: 100.0, units: None }],
            flows: vec![Flow {
                id: "f".to_string(),
                name: "Growth".to_string(),
                source: None,
                target: Some("s".to_string()),
                rate_equation: "[Population] * [GrowthRate]".to_string(),
                units: None,
            }],
            variables: vec![Variable {
                id: "v".to_string(),
                name: "GrowthRate".to_string(),
                equation: "0.1".to_string(),
                kind: VariableKind::Constant,
                value: Some(0.1),
            }],
            time_config: TimeConfig { start: 0.0, end: 10.0, step: 1.0 },
        }
    }

    #[test]
    fn test_branch_overrides_constant() {
        let model = growth_model();
        let scenario = ScenarioDefinition {
            id: "high_growth".to_string(),
            name: "High growth".to_string(),
            base_model_id: model.id.clone(),
            overrides: HashMap::from([("GrowthRate".to_string(), 0.5)]),
        };
        let branched = branch(&model, &scenario).unwrap();
        assert_eq!(branched.variables[0].value, Some(0.5));
    }

    #[test]
    fn test_branch_unknown_override_errors() {
        let model = growth_model();
        let scenario = ScenarioDefinition {
            id: "bad".to_string(),
            name: "bad".to_string(),
            base_model_id: model.id.clone(),
            overrides: HashMap::from([("NoSuchName".to_string(), 1.0)]),
        };
        let err = branch(&model, &scenario).unwrap_err();
        assert_eq!(err.code, ErrorCode::ScenarioOverrideUnknown);
    }

    #[test]
    fn test_compare_preserves_order_and_isolates_errors() {
        let model = growth_model();
        let scenarios = vec![
            ScenarioDefinition {
                id: "a".to_string(),
                name: "a".to_string(),
                base_model_id: model.id.clone(),
                overrides: HashMap::from([("GrowthRate".to_string(), 0.2)]),
            },
            ScenarioDefinition {
                id: "broken".to_string(),
                name: "broken".to_string(),
                base_model_id: model.id.clone(),
                overrides: HashMap::from([("DoesNotExist".to_string(), 1.0)]),
            },
            ScenarioDefinition {
                id: "b".to_string(),
                name: "b".to_string(),
                base_model_id: model.id.clone(),
                overrides: HashMap::from([("GrowthRate".to_string(), 0.3)]),
            },
        ];
        let registry = UnitRegistry::new();
        let options = ScenarioOptions::default();
        let report = compare(&model, &scenarios, &registry, &options).unwrap();
        assert_eq!(report.scenarios.len(), 3);
        assert_eq!(report.scenarios[0].id, "a");
        assert_eq!(report.scenarios[1].id, "broken");
        assert_eq!(report.scenarios[2].id, "b");
        assert!(report.scenarios[0].result.is_ok());
        assert!(report.scenarios[1].result.is_err());
        assert!(report.scenarios[2].result.is_ok());
    }

    #[test]
    fn test_sensitivity_reports_impact() {
        let model = growth_model();
        let registry = UnitRegistry::new();
        let options = ScenarioOptions::default();
        let report = sensitivity(&model, &registry, &options, "Population", &["GrowthRate".to_string()], 0.1).unwrap();
        assert_eq!(report.impacts.len(), 1);
        assert!(report.impacts[0].absolute_impact > 0.0);
        assert!(report.impacts[0].plus_value > report.impacts[0].minus_value);
    }

    #[test]
    fn test_optimize_grid_bounded_constant() {
        // Seeded scenario 9: GrowthRate in [0.12, 0.12] grid search
        // returns GrowthRate ~= 0.12.
        let model = growth_model();
        let registry = UnitRegistry::new();
        let options = ScenarioOptions::default();
        let parameters = vec![ParameterSpec { name: "GrowthRate".to_string(), min: 0.12, max: 0.12, grid_samples: 1 }];
        let objective = Objective { metric: "Population".to_string(), direction: ObjectiveDirection::Maximize, at_time: None };
        let result = optimize(&model, &registry, &options, &parameters, &objective, &OptimizeStrategy::Grid).unwrap();
        assert_eq!(result.iterations, 1);
        assert!((result.best_parameters["GrowthRate"] - 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_optimize_random_respects_bounds() {
        let model = growth_model();
        let registry = UnitRegistry::new();
        let options = ScenarioOptions::default();
        let parameters = vec![ParameterSpec { name: "GrowthRate".to_string(), min: 0.0, max: 0.2, grid_samples: 0 }];
        let objective = Objective { metric: "Population".to_string(), direction: ObjectiveDirection::Maximize, at_time: None };
        let strategy = OptimizeStrategy::Random { iterations: 10, seed: 7 };
        let result = optimize(&model, &registry, &options, &parameters, &objective, &strategy).unwrap();
        assert_eq!(result.iterations, 10);
        let rate = result.best_parameters["GrowthRate"];
        assert!((0.0..=0.2).contains(&rate));
    }

    #[test]
    fn test_monte_carlo_is_deterministic() {
        let model = growth_model();
        let registry = UnitRegistry::new();
        let options = ScenarioOptions::default();
        let mut samplers: HashMap<String, Sampler> = HashMap::new();
        samplers.insert(
            "GrowthRate".to_string(),
            Box::new(|_base, rng| rng.random_range(0.05..=0.15)),
        );
        let mc = MonteCarloOptions { iterations: 20, seed: 12345, metrics: vec!["Population".to_string()] };

        let report1 = monte_carlo(&model, &registry, &options, &samplers, &mc).unwrap();
        let report2 = monte_carlo(&model, &registry, &options, &samplers, &mc).unwrap();

        let s1 = &report1.metrics["Population"];
        let s2 = &report2.metrics["Population"];
        assert!((s1.mean - s2.mean).abs() < 1e-12);
        assert!((s1.variance - s2.variance).abs() < 1e-12);
        for (a, b) in s1.percentiles.iter().zip(s2.percentiles.iter()) {
            assert!((a.1 - b.1).abs() < 1e-12);
        }
    }

    #[test]
    fn test_monte_carlo_percentiles_from_full_sample() {
        let model = growth_model();
        let registry = UnitRegistry::new();
        let options = ScenarioOptions::default();
        let mut samplers: HashMap<String, Sampler> = HashMap::new();
        samplers.insert("GrowthRate".to_string(), Box::new(|_base, rng| rng.random_range(0.0..=0.3)));
        let mc = MonteCarloOptions { iterations: 50, seed: 1, metrics: vec!["Population".to_string()] };
        let report = monte_carlo(&model, &registry, &options, &samplers, &mc).unwrap();
        let stats = &report.metrics["Population"];
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        for (_, v) in &stats.percentiles {
            assert!(*v >= stats.min - 1e-9 && *v <= stats.max + 1e-9);
        }
    }
}
