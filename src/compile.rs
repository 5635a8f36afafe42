// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Static validation and macro inlining. Produces a [`CompiledEquation`]
//! whose top-level `expr` has had every macro call beta-reduced away,
//! ready for fast repeated evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::ast::{walk, Equation, Expr, FunctionDef};
use crate::common::{Diagnostic, ErrorCode, Phase, Result};
use crate::graph::{self, EvaluationGraph};
use crate::model::{Id, Model, VariableKind};

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledEquation {
    pub expr: Expr,
}

/// A model plus every flow/variable equation compiled ahead of time and
/// an evaluation order over them, combined into one artifact since the
/// solver and driver always need both together. Constants that already
/// carry a literal `value` skip parsing their equation entirely.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledModel {
    pub model: Model,
    pub equations: HashMap<Id, CompiledEquation>,
    pub graph: EvaluationGraph,
}

pub fn compile_model(model: &Model) -> Result<CompiledModel> {
    model.validate()?;

    let mut equations = HashMap::new();
    for flow in &model.flows {
        let eqn = crate::parser::parse_equation(&flow.rate_equation)?;
        equations.insert(flow.id.clone(), compile_equation(&eqn)?);
    }
    for var in &model.variables {
        if var.kind == VariableKind::Constant && var.value.is_some() {
            continue;
        }
        let eqn = crate::parser::parse_equation(&var.equation)?;
        equations.insert(var.id.clone(), compile_equation(&eqn)?);
    }

    let graph = graph::build_graph(model, &equations)?;
    Ok(CompiledModel { model: model.clone(), equations, graph })
}

/// A macro body is pure iff it contains no `Delay`, no `Time` primitive,
/// no external `Ref` (only references to its own formal parameters), and
/// no call to a stateful built-in. Since this crate's only stateful
/// built-ins are the delay/smooth family, which are their own `Expr`
/// variant rather than a `Call`, checking for `Delay`/`Time` nodes and
/// external `Ref`s covers the whole rule.
fn check_macro_purity(def: &FunctionDef) -> Result<()> {
    let params: HashSet<&str> = def.params.iter().map(|s| s.as_str()).collect();
    let mut err = None;
    walk(&def.body, &mut |node| {
        if err.is_some() {
            return;
        }
        match node {
            Expr::Delay { span, .. } | Expr::Time { span, .. } => {
                err = Some(
                    Diagnostic::new(
                        Phase::Compile,
                        ErrorCode::MacroImpureBody,
                        format!("macro `{}` may not use TIME or DELAY/SMOOTH primitives", def.name),
                    )
                    .with_span(*span),
                );
            }
            Expr::Ref { name, span } => {
                if !params.contains(name.as_str()) {
                    err = Some(
                        Diagnostic::new(
                            Phase::Compile,
                            ErrorCode::MacroImpureBody,
                            format!("macro `{}` may not reference `{}` outside its parameters", def.name, name),
                        )
                        .with_span(*span),
                    );
                }
            }
            _ => {}
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn macro_calls<'a>(body: &'a Expr, names: &HashSet<&str>, out: &mut Vec<&'a str>) {
    walk(body, &mut |node| {
        if let Expr::Call { name, .. } = node {
            if names.contains(name.as_str()) {
                out.push(name.as_str());
            }
        }
    });
}

fn check_macro_recursion(defs: &[FunctionDef]) -> Result<()> {
    let names: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for def in defs {
        let mut calls = Vec::new();
        macro_calls(&def.body, &names, &mut calls);
        graph.insert(def.name.as_str(), calls);
    }

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        state: &mut HashMap<&'a str, u8>, // 0 = unvisited, 1 = in-progress, 2 = done
    ) -> Result<()> {
        match state.get(node).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => {
                return Err(Diagnostic::new(
                    Phase::Compile,
                    ErrorCode::MacroRecursion,
                    format!("macro `{node}` is part of a recursive call cycle"),
                ));
            }
            _ => {}
        }
        state.insert(node, 1);
        if let Some(callees) = graph.get(node) {
            for callee in callees {
                visit(callee, graph, state)?;
            }
        }
        state.insert(node, 2);
        Ok(())
    }

    let mut state = HashMap::new();
    for def in defs {
        visit(def.name.as_str(), &graph, &mut state)?;
    }
    Ok(())
}

fn check_duplicate_macros(defs: &[FunctionDef]) -> Result<()> {
    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.name.as_str()) {
            return Err(Diagnostic::new(
                Phase::Compile,
                ErrorCode::DuplicateMacroName,
                format!("macro `{}` is defined more than once", def.name),
            )
            .with_span(def.span));
        }
    }
    Ok(())
}

/// The parser already folds `ELSEIF` chains left-to-right and rejects
/// unbalanced `THEN`/`END IF` pairs as a `TrailingInput`/`UnexpectedToken`
/// parse error, so by the time an `IfChain` node reaches compile it is
/// structurally well-formed. This pass re-validates that invariant
/// defensively (e.g. for ASTs constructed directly by a caller rather than
/// parsed from source) and reports `InvalidElseIfChain` if violated.
fn check_if_chains(expr: &Expr) -> Result<()> {
    let mut err = None;
    walk(expr, &mut |node| {
        if err.is_some() {
            return;
        }
        if let Expr::IfChain { branches, span, .. } = node {
            if branches.is_empty() {
                err = Some(Diagnostic::new(
                    Phase::Compile,
                    ErrorCode::InvalidElseIfChain,
                    "an IF chain must have at least one branch",
                )
                .with_span(*span));
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// x-coordinates must be strictly increasing and non-empty. The parser
/// already enforces this at parse time for literal `LOOKUP(...)` calls;
/// this pass re-checks any `Lookup1D` node reachable after macro
/// inlining, since a macro could in principle be asked to produce one
/// (though macro purity already forbids building one dynamically).
fn check_lookup_tables(expr: &Expr) -> Result<()> {
    let mut err = None;
    walk(expr, &mut |node| {
        if err.is_some() {
            return;
        }
        if let Expr::Lookup1D { points, span, .. } = node {
            if points.is_empty() {
                err = Some(Diagnostic::new(Phase::Compile, ErrorCode::LookupEmpty, "LOOKUP table has no points").with_span(*span));
                return;
            }
            for w in points.windows(2) {
                if w[1].0 <= w[0].0 {
                    err = Some(
                        Diagnostic::new(
                            Phase::Compile,
                            ErrorCode::LookupNonMonotonic,
                            "LOOKUP x-coordinates must be strictly increasing",
                        )
                        .with_span(*span),
                    );
                    return;
                }
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Capture-free beta-reduction: substitute each formal parameter with its
/// actual argument expression. This is capture-free by construction
/// because macro purity forbids macros from referencing anything but
/// their own parameters, so no free variable in the argument can be
/// accidentally bound by a parameter name inside the body.
fn substitute(body: &Expr, bindings: &HashMap<&str, &Expr>) -> Expr {
    match body {
        Expr::Ref { name, span } => bindings.get(name.as_str()).map(|e| (*e).clone()).unwrap_or_else(|| Expr::Ref { name: name.clone(), span: *span }),
        Expr::QuantityLiteral { .. } | Expr::BooleanLiteral { .. } | Expr::Time { .. } => body.clone(),
        Expr::Unary { op, expr, span } => Expr::Unary { op: *op, expr: Box::new(substitute(expr, bindings)), span: *span },
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op: *op,
            left: Box::new(substitute(left, bindings)),
            right: Box::new(substitute(right, bindings)),
            span: *span,
        },
        Expr::IfChain { branches, else_branch, span } => Expr::IfChain {
            branches: branches
                .iter()
                .map(|b| crate::ast::IfBranch {
                    cond: Box::new(substitute(&b.cond, bindings)),
                    then: Box::new(substitute(&b.then, bindings)),
                })
                .collect(),
            else_branch: else_branch.as_ref().map(|e| Box::new(substitute(e, bindings))),
            span: *span,
        },
        Expr::Call { name, args, span } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| substitute(a, bindings)).collect(),
            span: *span,
        },
        Expr::Lookup1D { x, points, x_unit, y_unit, span } => Expr::Lookup1D {
            x: Box::new(substitute(x, bindings)),
            points: points.clone(),
            x_unit: x_unit.clone(),
            y_unit: y_unit.clone(),
            span: *span,
        },
        Expr::Delay { kind, input, tau, init, id, span } => Expr::Delay {
            kind: *kind,
            input: Box::new(substitute(input, bindings)),
            tau: Box::new(substitute(tau, bindings)),
            init: init.as_ref().map(|e| Box::new(substitute(e, bindings))),
            id: id.clone(),
            span: *span,
        },
    }
}

/// Inline every macro call in `expr`, erasing macros entirely so
/// downstream stages only ever see primitive AST nodes.
fn inline(expr: &Expr, defs: &HashMap<&str, &FunctionDef>) -> Result<Expr> {
    match expr {
        Expr::Call { name, args, span } => {
            if let Some(def) = defs.get(name.as_str()) {
                if args.len() != def.params.len() {
                    return Err(Diagnostic::new(
                        Phase::Compile,
                        ErrorCode::UnsupportedFunction,
                        format!(
                            "macro `{}` expects {} argument(s), got {}",
                            name,
                            def.params.len(),
                            args.len()
                        ),
                    )
                    .with_span(*span));
                }
                let inlined_args: Result<Vec<Expr>> = args.iter().map(|a| inline(a, defs)).collect();
                let inlined_args = inlined_args?;
                let bindings: HashMap<&str, &Expr> = def
                    .params
                    .iter()
                    .map(|p| p.as_str())
                    .zip(inlined_args.iter())
                    .collect();
                let substituted = substitute(&def.body, &bindings);
                inline(&substituted, defs)
            } else {
                let inlined_args: Result<Vec<Expr>> = args.iter().map(|a| inline(a, defs)).collect();
                Ok(Expr::Call { name: name.clone(), args: inlined_args?, span: *span })
            }
        }
        Expr::QuantityLiteral { .. } | Expr::BooleanLiteral { .. } | Expr::Ref { .. } | Expr::Time { .. } => Ok(expr.clone()),
        Expr::Unary { op, expr: inner, span } => Ok(Expr::Unary { op: *op, expr: Box::new(inline(inner, defs)?), span: *span }),
        Expr::Binary { op, left, right, span } => Ok(Expr::Binary {
            op: *op,
            left: Box::new(inline(left, defs)?),
            right: Box::new(inline(right, defs)?),
            span: *span,
        }),
        Expr::IfChain { branches, else_branch, span } => {
            let branches: Result<Vec<_>> = branches
                .iter()
                .map(|b| -> Result<crate::ast::IfBranch> {
                    Ok(crate::ast::IfBranch {
                        cond: Box::new(inline(&b.cond, defs)?),
                        then: Box::new(inline(&b.then, defs)?),
                    })
                })
                .collect();
            let else_branch = match else_branch {
                Some(e) => Some(Box::new(inline(e, defs)?)),
                None => None,
            };
            Ok(Expr::IfChain { branches: branches?, else_branch, span: *span })
        }
        Expr::Lookup1D { x, points, x_unit, y_unit, span } => Ok(Expr::Lookup1D {
            x: Box::new(inline(x, defs)?),
            points: points.clone(),
            x_unit: x_unit.clone(),
            y_unit: y_unit.clone(),
            span: *span,
        }),
        Expr::Delay { kind, input, tau, init, id, span } => Ok(Expr::Delay {
            kind: *kind,
            input: Box::new(inline(input, defs)?),
            tau: Box::new(inline(tau, defs)?),
            init: match init {
                Some(e) => Some(Box::new(inline(e, defs)?)),
                None => None,
            },
            id: id.clone(),
            span: *span,
        }),
    }
}

/// Run every static validation (duplicate/recursive macros, purity,
/// if-chain exhaustiveness, lookup monotonicity) and return a compiled,
/// macro-free expression ready for the evaluator.
pub fn compile_equation(eqn: &Equation) -> Result<CompiledEquation> {
    check_duplicate_macros(&eqn.defs)?;
    for def in &eqn.defs {
        check_macro_purity(def)?;
    }
    check_macro_recursion(&eqn.defs)?;
    check_if_chains(&eqn.expr)?;
    check_lookup_tables(&eqn.expr)?;

    let defs: HashMap<&str, &FunctionDef> = eqn.defs.iter().map(|d| (d.name.as_str(), d)).collect();
    let expr = inline(&eqn.expr, &defs)?;
    check_if_chains(&expr)?;
    check_lookup_tables(&expr)?;
    Ok(CompiledEquation { expr })
}

/// Content hash over `(source, registry_id)`, used both as the compile
/// cache key and as the `hash` field of the persisted AST envelope.
pub fn content_hash(source: &str, registry_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(registry_id.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// A bounded, mutex-guarded LRU of compiled equations keyed by content
/// hash. Reads and writes both take the mutex; this is the simpler of
/// the two viable concurrency strategies for a copy-on-write-ish cache
/// like this one, the other being a lock-free single-writer structure.
pub struct CompileCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<String, CompiledEquation>,
    order: Vec<String>,
}

impl CompileCache {
    pub fn new(capacity: usize) -> Self {
        CompileCache {
            capacity,
            inner: Mutex::new(CacheInner { map: HashMap::new(), order: Vec::new() }),
        }
    }

    /// Compile `source` under `registry_id`, reusing a cached result when
    /// the content hash matches.
    pub fn compile(&self, source: &str, registry_id: &str) -> Result<CompiledEquation> {
        let key = content_hash(source, registry_id);
        {
            let guard = self.inner.lock().unwrap();
            if let Some(hit) = guard.map.get(&key) {
                return Ok(hit.clone());
            }
        }
        let eqn = crate::parser::parse_equation(source)?;
        let compiled = compile_equation(&eqn)?;

        let mut guard = self.inner.lock().unwrap();
        if !guard.map.contains_key(&key) {
            if guard.order.len() >= self.capacity {
                if let Some(oldest) = guard.order.first().cloned() {
                    guard.order.remove(0);
                    guard.map.remove(&oldest);
                }
            }
            guard.order.push(key.clone());
            guard.map.insert(key, compiled.clone());
        }
        Ok(compiled)
    }
}

impl Default for CompileCache {
    fn default() -> Self {
        CompileCache::new(256)
    }
}
