// Copyright 2019 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Shared error taxonomy, spans, and small utilities used across every
//! other module in the crate.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::{error, result};

pub type Ident = String;

/// Byte-offset span into the original source text, precise to code points.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Hash)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span {
            start: start as u32,
            end: end as u32,
        }
    }

    /// Convert a byte offset into a 1-based (line, column) pair.
    pub fn line_col(src: &str, offset: u32) -> (u32, u32) {
        let offset = offset as usize;
        let mut line = 1u32;
        let mut col = 1u32;
        for (i, ch) in src.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    /// A single-line snippet of `src` around this span with a caret
    /// underneath the offending range.
    pub fn snippet(&self, src: &str) -> String {
        let start = self.start as usize;
        let line_start = src[..start.min(src.len())]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let line_end = src[start.min(src.len())..]
            .find('\n')
            .map(|i| start + i)
            .unwrap_or(src.len());
        let line = &src[line_start..line_end];
        let caret_pos = start.saturating_sub(line_start);
        let width = (self.end.max(self.start + 1) as usize - self.start as usize).max(1);
        let caret = format!("{}{}", " ".repeat(caret_pos), "^".repeat(width));
        format!("{line}\n{caret}")
    }
}

/// Which stage of the pipeline produced a [`Diagnostic`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Parse,
    Compile,
    Evaluate,
    Solve,
    Scenario,
    Unit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Phase::Parse => "parse",
            Phase::Compile => "compile",
            Phase::Evaluate => "evaluate",
            Phase::Solve => "solve",
            Phase::Scenario => "scenario",
            Phase::Unit => "unit",
        };
        write!(f, "{name}")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // parse
    UnexpectedToken,
    UnclosedBlock,
    TrailingInput,
    InvalidUnitExponent,
    InvalidUnitToken,
    UnknownKeyword,
    // compile
    MacroRecursion,
    MacroImpureBody,
    DuplicateMacroName,
    InvalidElseIfChain,
    LookupNonMonotonic,
    LookupEmpty,
    CircularDependencyError,
    // evaluate
    IdentifierNotFound,
    UnitMismatch,
    NonIntegerExponent,
    DimensionlessRequired,
    UnsupportedOperator,
    UnsupportedFunction,
    DelayInvalidTau,
    StateAccessError,
    ComparisonUnitMismatch,
    EqualityUnitMismatch,
    // solver/driver
    InvalidTimeStepError,
    ConvergenceError,
    ModelValidationError,
    // scenario
    ScenarioOverrideUnknown,
    ScenarioNotFound,
    ObjectiveMetricMissing,
    // units
    UnitNotFound,
    UnitDimensionMismatch,
    UnsupportedQuantity,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A fully formed, user-visible diagnostic: phase, code, message, and
/// optional location context. This is the only error type in the crate;
/// every fallible operation returns `Result<T> = Result<T, Diagnostic>`.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub phase: Phase,
    pub code: ErrorCode,
    pub message: String,
    pub span: Option<Span>,
    pub snippet: Option<String>,
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn new(phase: Phase, code: ErrorCode, message: impl Into<String>) -> Self {
        Diagnostic {
            phase,
            code,
            message: message.into(),
            span: None,
            snippet: None,
            hints: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_snippet_from(mut self, src: &str) -> Self {
        if let Some(span) = self.span {
            self.snippet = Some(span.snippet(src));
        }
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn with_hints(mut self, hints: impl IntoIterator<Item = String>) -> Self {
        self.hints.extend(hints);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::{}: {}", self.phase, self.code, self.message)?;
        if let Some(ref snippet) = self.snippet {
            write!(f, "\n{snippet}")?;
        }
        for hint in &self.hints {
            write!(f, "\nhint: {hint}")?;
        }
        Ok(())
    }
}

impl error::Error for Diagnostic {}

pub type Result<T> = result::Result<T, Diagnostic>;

#[macro_export]
macro_rules! diag {
    ($phase:ident, $code:ident, $($arg:tt)*) => {{
        use $crate::common::{Diagnostic, ErrorCode, Phase};
        Err(Diagnostic::new(Phase::$phase, ErrorCode::$code, format!($($arg)*)))
    }};
}

/// Trim, lowercase, and collapse internal whitespace runs to `_`, the
/// canonical form used for scope lookups so that `[Population]` and
/// `[ population ]` refer to the same variable.
pub fn canonicalize(name: &str) -> String {
    let name = name.trim();
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = false;
    for ch in name.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push('_');
            }
            last_was_space = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_was_space = false;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Stable topological sort over `nodes`, using `dependencies` as an
/// adjacency map of node -> the nodes it directly depends on. Ties are
/// broken by the order nodes appear in `nodes` (declaration order).
/// Returns a `CircularDependencyError`-shaped `Err` with the offending
/// cycle path when a cycle is found.
pub fn topo_sort<'a>(
    nodes: &[&'a str],
    dependencies: &HashMap<&'a str, BTreeSet<&'a str>>,
) -> result::Result<Vec<&'a str>, Vec<&'a str>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = nodes.iter().map(|&n| (n, Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        dependencies: &HashMap<&'a str, BTreeSet<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> result::Result<(), Vec<&'a str>> {
        match marks.get(node).copied().unwrap_or(Mark::Done) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = path.iter().position(|&n| n == node).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(node);
                return Err(cycle);
            }
            Mark::Unvisited => {}
        }
        marks.insert(node, Mark::InProgress);
        path.push(node);
        if let Some(deps) = dependencies.get(node) {
            for &dep in deps.iter() {
                visit(dep, dependencies, marks, order, path)?;
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        order.push(node);
        Ok(())
    }

    for &node in nodes {
        visit(node, dependencies, &mut marks, &mut order, &mut path)?;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!("population", canonicalize("  Population  "));
        assert_eq!("birth_rate", canonicalize("Birth   Rate"));
        assert_eq!("x", canonicalize("x"));
    }

    #[test]
    fn test_topo_sort_orders_dependencies_first() {
        let nodes = ["a", "b", "c"];
        let nodes_ref: Vec<&str> = nodes.to_vec();
        let mut deps: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        deps.insert("a", BTreeSet::new());
        deps.insert("b", ["a"].into_iter().collect());
        deps.insert("c", ["b"].into_iter().collect());
        let order = topo_sort(&nodes_ref, &deps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topo_sort_detects_cycle() {
        let nodes = ["a", "b"];
        let nodes_ref: Vec<&str> = nodes.to_vec();
        let mut deps: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        deps.insert("a", ["b"].into_iter().collect());
        deps.insert("b", ["a"].into_iter().collect());
        assert!(topo_sort(&nodes_ref, &deps).is_err());
    }
}
