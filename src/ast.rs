// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The equation DSL's abstract syntax tree: a tagged union `Expr`. Every
//! node carries a [`Span`] and a deterministic `NodeId` derived from it,
//! used to key stateful delay/smooth nodes.

use crate::common::Span;
use crate::units::UnitExponentMap;

/// `"n:<startOffset>-<endOffset>"`, stable across re-parses of identical
/// source so that delay/smooth state keys survive recompilation.
pub type NodeId = String;

pub fn node_id(span: Span) -> NodeId {
    format!("n:{}-{}", span.start, span.end)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    /// Higher binds tighter; mirrors the grammar's precedence climb
    /// (logical < equality < relational < additive < multiplicative <
    /// power).
    pub fn precedence(self) -> u8 {
        use BinaryOp::*;
        match self {
            Or | Xor => 1,
            And => 2,
            Eq | Neq => 3,
            Lt | Lte | Gt | Gte => 4,
            Add | Sub => 5,
            Mul | Div | Mod => 6,
            Pow => 7,
        }
    }

    /// `^` is the only right-associative operator.
    pub fn right_associative(self) -> bool {
        matches!(self, BinaryOp::Pow)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DelayKind {
    Delay1,
    Delay3,
    Smooth,
    Smooth3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeKind {
    Time,
    TimeStep,
    InitialTime,
    FinalTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfBranch {
    pub cond: Box<Expr>,
    pub then: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    QuantityLiteral {
        value: f64,
        unit: Option<UnitExponentMap>,
        span: Span,
    },
    BooleanLiteral {
        value: bool,
        span: Span,
    },
    Ref {
        name: String,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    IfChain {
        branches: Vec<IfBranch>,
        else_branch: Option<Box<Expr>>,
        span: Span,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    Lookup1D {
        x: Box<Expr>,
        points: Vec<(f64, f64)>,
        x_unit: Option<UnitExponentMap>,
        y_unit: Option<UnitExponentMap>,
        span: Span,
    },
    Delay {
        kind: DelayKind,
        input: Box<Expr>,
        tau: Box<Expr>,
        init: Option<Box<Expr>>,
        id: NodeId,
        span: Span,
    },
    Time {
        kind: TimeKind,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::QuantityLiteral { span, .. }
            | Expr::BooleanLiteral { span, .. }
            | Expr::Ref { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::IfChain { span, .. }
            | Expr::Call { span, .. }
            | Expr::Lookup1D { span, .. }
            | Expr::Delay { span, .. }
            | Expr::Time { span, .. } => *span,
        }
    }

    pub fn id(&self) -> NodeId {
        node_id(self.span())
    }
}

/// A hoisted `FUNCTION ... END FUNCTION` macro definition.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
    pub span: Span,
}

/// The root of a parsed equation: any macros hoisted out of the source,
/// followed by the final top-level expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Equation {
    pub defs: Vec<FunctionDef>,
    pub expr: Expr,
    pub span: Span,
}

/// Walks an expression tree, invoking `f` on every node (pre-order),
/// recursing into children including macro call arguments and delay
/// sub-expressions. Used by the purity/cycle checks in `compile.rs`.
pub fn walk<'a>(expr: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    f(expr);
    match expr {
        Expr::QuantityLiteral { .. } | Expr::BooleanLiteral { .. } | Expr::Ref { .. } | Expr::Time { .. } => {}
        Expr::Unary { expr, .. } => walk(expr, f),
        Expr::Binary { left, right, .. } => {
            walk(left, f);
            walk(right, f);
        }
        Expr::IfChain { branches, else_branch, .. } => {
            for branch in branches {
                walk(&branch.cond, f);
                walk(&branch.then, f);
            }
            if let Some(e) = else_branch {
                walk(e, f);
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                walk(arg, f);
            }
        }
        Expr::Lookup1D { x, .. } => walk(x, f),
        Expr::Delay { input, tau, init, .. } => {
            walk(input, f);
            walk(tau, f);
            if let Some(init) = init {
                walk(init, f);
            }
        }
    }
}
