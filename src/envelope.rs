// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The persisted AST envelope (`spec.md` §6, "Persisted AST envelope"):
//! the JSON shape external collaborators use when they serialize a
//! parsed equation for storage or transport.
//!
//! Rather than deriving `Serialize`/`Deserialize` on [`crate::ast::Expr`]
//! itself, this module mirrors it into a dedicated wire type and
//! converts with `From`, the way `simlin-engine` keeps its JSON format
//! (`json.rs`) separate from the in-memory model (`datamodel.rs`). That
//! keeps the core AST free of wire-format concerns while still giving
//! collaborators a stable, versioned shape to serialize against.

use serde::{Deserialize, Serialize};
#[cfg(feature = "schema")]
use schemars::JsonSchema;

use crate::ast::{BinaryOp, DelayKind, Equation, Expr, FunctionDef, IfBranch, NodeId, TimeKind, UnaryOp};
use crate::common::Span;
use crate::compile::content_hash;
use crate::pretty::pretty_equation;
use crate::units::UnitExponentMap;

/// `spec.md` §6's envelope schema identifier; bump alongside the wire
/// shape, not the AST's in-memory representation.
pub const SCHEMA: &str = "effect-sd-equation/2";
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub struct JsonSpan {
    pub start: u32,
    pub end: u32,
}

impl From<Span> for JsonSpan {
    fn from(span: Span) -> Self {
        JsonSpan { start: span.start, end: span.end }
    }
}

impl From<JsonSpan> for Span {
    fn from(span: JsonSpan) -> Self {
        Span { start: span.start, end: span.end }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub enum JsonUnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub enum JsonBinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Mod,
    #[serde(rename = "^")]
    Pow,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "and")]
    And,
    #[serde(rename = "or")]
    Or,
    #[serde(rename = "xor")]
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub enum JsonDelayKind {
    #[serde(rename = "DELAY1")]
    Delay1,
    #[serde(rename = "DELAY3")]
    Delay3,
    #[serde(rename = "SMOOTH")]
    Smooth,
    #[serde(rename = "SMOOTH3")]
    Smooth3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub enum JsonTimeKind {
    #[serde(rename = "TIME")]
    Time,
    #[serde(rename = "TIME_STEP")]
    TimeStep,
    #[serde(rename = "INITIAL_TIME")]
    InitialTime,
    #[serde(rename = "FINAL_TIME")]
    FinalTime,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "debug-derive", derive(Debug))]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub struct JsonIfBranch {
    pub cond: Box<JsonExpr>,
    pub then: Box<JsonExpr>,
}

/// Wire mirror of [`Expr`] (`spec.md` §3's "AST (tagged union `Expr`)"),
/// tagged by node `type` so JSON on disk is self-describing.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "debug-derive", derive(Debug))]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(tag = "type")]
pub enum JsonExpr {
    QuantityLiteral { value: f64, #[serde(skip_serializing_if = "Option::is_none", default)] unit: Option<UnitExponentMap>, span: JsonSpan },
    BooleanLiteral { value: bool, span: JsonSpan },
    Ref { name: String, span: JsonSpan },
    Unary { op: JsonUnaryOp, expr: Box<JsonExpr>, span: JsonSpan },
    Binary { op: JsonBinaryOp, left: Box<JsonExpr>, right: Box<JsonExpr>, span: JsonSpan },
    IfChain {
        branches: Vec<JsonIfBranch>,
        #[serde(rename = "elseBranch", skip_serializing_if = "Option::is_none", default)]
        else_branch: Option<Box<JsonExpr>>,
        span: JsonSpan,
    },
    Call { name: String, args: Vec<JsonExpr>, span: JsonSpan },
    Lookup1D {
        x: Box<JsonExpr>,
        points: Vec<(f64, f64)>,
        #[serde(rename = "xUnit", skip_serializing_if = "Option::is_none", default)]
        x_unit: Option<UnitExponentMap>,
        #[serde(rename = "yUnit", skip_serializing_if = "Option::is_none", default)]
        y_unit: Option<UnitExponentMap>,
        span: JsonSpan,
    },
    Delay {
        kind: JsonDelayKind,
        input: Box<JsonExpr>,
        tau: Box<JsonExpr>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        init: Option<Box<JsonExpr>>,
        id: NodeId,
        span: JsonSpan,
    },
    Time { kind: JsonTimeKind, span: JsonSpan },
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "debug-derive", derive(Debug))]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub struct JsonFunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: JsonExpr,
    pub span: JsonSpan,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "debug-derive", derive(Debug))]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub struct JsonEquation {
    pub defs: Vec<JsonFunctionDef>,
    pub expr: JsonExpr,
    pub span: JsonSpan,
}

impl From<&UnaryOp> for JsonUnaryOp {
    fn from(op: &UnaryOp) -> Self {
        match op {
            UnaryOp::Neg => JsonUnaryOp::Neg,
            UnaryOp::Pos => JsonUnaryOp::Pos,
            UnaryOp::Not => JsonUnaryOp::Not,
        }
    }
}

impl From<&BinaryOp> for JsonBinaryOp {
    fn from(op: &BinaryOp) -> Self {
        match op {
            BinaryOp::Add => JsonBinaryOp::Add,
            BinaryOp::Sub => JsonBinaryOp::Sub,
            BinaryOp::Mul => JsonBinaryOp::Mul,
            BinaryOp::Div => JsonBinaryOp::Div,
            BinaryOp::Mod => JsonBinaryOp::Mod,
            BinaryOp::Pow => JsonBinaryOp::Pow,
            BinaryOp::Lt => JsonBinaryOp::Lt,
            BinaryOp::Lte => JsonBinaryOp::Lte,
            BinaryOp::Gt => JsonBinaryOp::Gt,
            BinaryOp::Gte => JsonBinaryOp::Gte,
            BinaryOp::Eq => JsonBinaryOp::Eq,
            BinaryOp::Neq => JsonBinaryOp::Neq,
            BinaryOp::And => JsonBinaryOp::And,
            BinaryOp::Or => JsonBinaryOp::Or,
            BinaryOp::Xor => JsonBinaryOp::Xor,
        }
    }
}

impl From<&DelayKind> for JsonDelayKind {
    fn from(kind: &DelayKind) -> Self {
        match kind {
            DelayKind::Delay1 => JsonDelayKind::Delay1,
            DelayKind::Delay3 => JsonDelayKind::Delay3,
            DelayKind::Smooth => JsonDelayKind::Smooth,
            DelayKind::Smooth3 => JsonDelayKind::Smooth3,
        }
    }
}

impl From<&TimeKind> for JsonTimeKind {
    fn from(kind: &TimeKind) -> Self {
        match kind {
            TimeKind::Time => JsonTimeKind::Time,
            TimeKind::TimeStep => JsonTimeKind::TimeStep,
            TimeKind::InitialTime => JsonTimeKind::InitialTime,
            TimeKind::FinalTime => JsonTimeKind::FinalTime,
        }
    }
}

impl From<&IfBranch> for JsonIfBranch {
    fn from(branch: &IfBranch) -> Self {
        JsonIfBranch { cond: Box::new((&*branch.cond).into()), then: Box::new((&*branch.then).into()) }
    }
}

impl From<&Expr> for JsonExpr {
    fn from(expr: &Expr) -> Self {
        match expr {
            Expr::QuantityLiteral { value, unit, span } => {
                JsonExpr::QuantityLiteral { value: *value, unit: unit.clone(), span: (*span).into() }
            }
            Expr::BooleanLiteral { value, span } => JsonExpr::BooleanLiteral { value: *value, span: (*span).into() },
            Expr::Ref { name, span } => JsonExpr::Ref { name: name.clone(), span: (*span).into() },
            Expr::Unary { op, expr, span } => {
                JsonExpr::Unary { op: op.into(), expr: Box::new((&**expr).into()), span: (*span).into() }
            }
            Expr::Binary { op, left, right, span } => JsonExpr::Binary {
                op: op.into(),
                left: Box::new((&**left).into()),
                right: Box::new((&**right).into()),
                span: (*span).into(),
            },
            Expr::IfChain { branches, else_branch, span } => JsonExpr::IfChain {
                branches: branches.iter().map(JsonIfBranch::from).collect(),
                else_branch: else_branch.as_ref().map(|e| Box::new((&**e).into())),
                span: (*span).into(),
            },
            Expr::Call { name, args, span } => {
                JsonExpr::Call { name: name.clone(), args: args.iter().map(JsonExpr::from).collect(), span: (*span).into() }
            }
            Expr::Lookup1D { x, points, x_unit, y_unit, span } => JsonExpr::Lookup1D {
                x: Box::new((&**x).into()),
                points: points.clone(),
                x_unit: x_unit.clone(),
                y_unit: y_unit.clone(),
                span: (*span).into(),
            },
            Expr::Delay { kind, input, tau, init, id, span } => JsonExpr::Delay {
                kind: kind.into(),
                input: Box::new((&**input).into()),
                tau: Box::new((&**tau).into()),
                init: init.as_ref().map(|e| Box::new((&**e).into())),
                id: id.clone(),
                span: (*span).into(),
            },
            Expr::Time { kind, span } => JsonExpr::Time { kind: kind.into(), span: (*span).into() },
        }
    }
}

impl From<&FunctionDef> for JsonFunctionDef {
    fn from(def: &FunctionDef) -> Self {
        JsonFunctionDef { name: def.name.clone(), params: def.params.clone(), body: (&def.body).into(), span: def.span.into() }
    }
}

impl From<&Equation> for JsonEquation {
    fn from(eqn: &Equation) -> Self {
        JsonEquation { defs: eqn.defs.iter().map(JsonFunctionDef::from).collect(), expr: (&eqn.expr).into(), span: eqn.span.into() }
    }
}

/// `spec.md` §6's persisted AST envelope: a parsed equation plus enough
/// metadata (content hash, canonical pretty-print, creation time) for a
/// collaborator to store or transmit it and later verify it hasn't
/// drifted from the source it was parsed from.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "debug-derive", derive(Debug))]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub struct EquationEnvelope {
    pub schema: String,
    pub version: u32,
    pub ast: JsonEquation,
    pub hash: String,
    pub pretty: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// RFC 3339 / ISO-8601 UTC timestamp with second precision, e.g.
/// `2024-01-02T03:04:05Z`.
fn iso8601_utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Builds the envelope for a freshly parsed equation. `registry_id`
/// must match whatever identifies the `UnitRegistry` the equation was
/// parsed and will be compiled against, since the hash covers it
/// (`spec.md` §4.3, "keyed by a hash over `(source, unit-registry-id,
/// version)`").
pub fn envelope_for(source: &str, registry_id: &str, eqn: &Equation) -> EquationEnvelope {
    EquationEnvelope {
        schema: SCHEMA.to_string(),
        version: SCHEMA_VERSION,
        ast: JsonEquation::from(eqn),
        hash: content_hash(source, registry_id),
        pretty: pretty_equation(eqn),
        created_at: iso8601_utc_now(),
    }
}
