// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The evaluation graph (`spec.md` §4.5): orders auxiliary variables and
//! flows so every expression evaluates with its inputs already in scope.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::ast::Expr;
use crate::common::{canonicalize, Diagnostic, ErrorCode, Phase, Result};
use crate::compile::CompiledEquation;
use crate::model::{Id, Model};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Variable,
    Flow,
}

/// A stable evaluation order over every variable and flow id in `model`,
/// suitable for a single per-step pass: stocks and time primitives are
/// leaves already present in scope, so they never appear here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvaluationGraph {
    pub order: Vec<Id>,
    pub kind: HashMap<Id, NodeKind>,
}

/// Gathers the names referenced in `expr` that gate same-step evaluation
/// order. A `Delay`/`Smooth` node's `input`/`tau`/`init` are deliberately
/// not recursed into: `interpreter::evaluate_delay` reads the previous
/// step's state before folding in the current input (`spec.md` §9, "Delay/
/// smooth nodes break loops by carrying one-step state"), so those
/// sub-expressions must not create a same-step dependency edge or models
/// with standard feedback-through-delay (`X = SMOOTH([Y], tau)`, `Y`
/// depending on `[X]`) would spuriously fail cycle detection.
fn collect_ref_names(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::QuantityLiteral { .. } | Expr::BooleanLiteral { .. } | Expr::Time { .. } => {}
        Expr::Ref { name, .. } => {
            out.insert(canonicalize(name));
        }
        Expr::Unary { expr, .. } => collect_ref_names(expr, out),
        Expr::Binary { left, right, .. } => {
            collect_ref_names(left, out);
            collect_ref_names(right, out);
        }
        Expr::IfChain { branches, else_branch, .. } => {
            for branch in branches {
                collect_ref_names(&branch.cond, out);
                collect_ref_names(&branch.then, out);
            }
            if let Some(e) = else_branch {
                collect_ref_names(e, out);
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_ref_names(arg, out);
            }
        }
        Expr::Lookup1D { x, .. } => collect_ref_names(x, out),
        Expr::Delay { .. } => {}
    }
}

/// Builds the evaluation graph over `model`'s flows and variables.
/// `compiled` must contain one entry per flow/variable id, keyed exactly
/// as `model`'s own ids.
pub fn build_graph(model: &Model, compiled: &HashMap<Id, CompiledEquation>) -> Result<EvaluationGraph> {
    let mut name_to_id: HashMap<String, Id> = HashMap::new();
    for stock in &model.stocks {
        name_to_id.insert(canonicalize(&stock.name), stock.id.clone());
    }
    for flow in &model.flows {
        name_to_id.insert(canonicalize(&flow.name), flow.id.clone());
    }
    for var in &model.variables {
        name_to_id.insert(canonicalize(&var.name), var.id.clone());
    }

    let mut kind: HashMap<Id, NodeKind> = HashMap::new();
    let mut order_ids: Vec<Id> = Vec::new();
    for flow in &model.flows {
        kind.insert(flow.id.clone(), NodeKind::Flow);
        order_ids.push(flow.id.clone());
    }
    for var in &model.variables {
        kind.insert(var.id.clone(), NodeKind::Variable);
        order_ids.push(var.id.clone());
    }

    let node_set: HashSet<&str> = order_ids.iter().map(|s| s.as_str()).collect();

    let mut deps: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for id in &order_ids {
        let compiled_eqn = compiled.get(id);
        let mut refs = HashSet::new();
        if let Some(c) = compiled_eqn {
            collect_ref_names(&c.expr, &mut refs);
        }
        let mut dep_ids: BTreeSet<&str> = BTreeSet::new();
        for name in &refs {
            if let Some(dep_id) = name_to_id.get(name) {
                if node_set.contains(dep_id.as_str()) {
                    dep_ids.insert(dep_id.as_str());
                }
            }
        }
        deps.insert(id.as_str(), dep_ids);
    }

    let node_refs: Vec<&str> = order_ids.iter().map(|s| s.as_str()).collect();
    let order = crate::common::topo_sort(&node_refs, &deps).map_err(|cycle| {
        let names: Vec<String> = cycle
            .iter()
            .map(|id| {
                model
                    .stocks
                    .iter()
                    .map(|s| (&s.id, &s.name))
                    .chain(model.flows.iter().map(|f| (&f.id, &f.name)))
                    .chain(model.variables.iter().map(|v| (&v.id, &v.name)))
                    .find(|(nid, _)| nid.as_str() == *id)
                    .map(|(_, name)| name.clone())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect();
        Diagnostic::new(
            Phase::Compile,
            ErrorCode::CircularDependencyError,
            format!("circular dependency: {}", names.join(" -> ")),
        )
        .with_hints(vec![format!("cycle: {}", names.join(" -> "))])
    })?;

    Ok(EvaluationGraph {
        order: order.into_iter().map(|s| s.to_string()).collect(),
        kind,
    })
}

/// Sort a set of declaration-order ids into the two-level `BTreeMap` used
/// to render a human-readable dependency listing (debugging aid, not on
/// any hot path).
pub fn group_by_kind(graph: &EvaluationGraph) -> BTreeMap<&'static str, Vec<&Id>> {
    let mut groups: BTreeMap<&'static str, Vec<&Id>> = BTreeMap::new();
    for id in &graph.order {
        let label = match graph.kind.get(id) {
            Some(NodeKind::Variable) => "variable",
            Some(NodeKind::Flow) => "flow",
            None => "unknown",
        };
        groups.entry(label).or_default().push(id);
    }
    groups
}
