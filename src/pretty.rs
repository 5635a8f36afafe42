// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! A stable pretty-printer for the equation AST, used by the golden
//! round-trip tests (`spec.md` §8, "Round-trip") and the persisted AST
//! envelope's `pretty` field (`spec.md` §6).

use crate::ast::{BinaryOp, DelayKind, Equation, Expr, TimeKind, UnaryOp};
use crate::units::{format_unit_map, UnitExponentMap};

/// Conservative parenthesization rule: a child binary expression needs
/// parens whenever printing it bare could re-associate differently than
/// the original tree. For a left-associative parent, that means the left
/// child needs parens only on strictly lower precedence, but the right
/// child needs them on lower-*or-equal* precedence (since `a - (b - c)` is
/// not `a - b - c`). For `^`, the only right-associative operator, the
/// roles are reversed.
fn child_needs_parens(parent_op: BinaryOp, child: &Expr, is_right_slot: bool) -> bool {
    let child_op = match child {
        Expr::Binary { op, .. } => *op,
        _ => return false,
    };
    let (parent_prec, child_prec) = (parent_op.precedence(), child_op.precedence());
    if parent_op.right_associative() {
        if is_right_slot {
            child_prec < parent_prec
        } else {
            child_prec <= parent_prec
        }
    } else if is_right_slot {
        child_prec <= parent_prec
    } else {
        child_prec < parent_prec
    }
}

fn pretty_unit(unit: &UnitExponentMap) -> String {
    let rendered = format_unit_map(unit);
    if rendered == "1" {
        String::new()
    } else {
        format!(" {{ {} }}", rendered.replace(" · ", " * ").replace('^', "^"))
    }
}

fn pretty_expr(e: &Expr, out: &mut String) {
    match e {
        Expr::QuantityLiteral { value, unit, .. } => {
            out.push_str(&format_number(*value));
            if let Some(unit) = unit {
                out.push_str(&pretty_unit(unit));
            }
        }
        Expr::BooleanLiteral { value, .. } => {
            out.push_str(if *value { "TRUE" } else { "FALSE" });
        }
        Expr::Ref { name, .. } => {
            out.push('[');
            out.push_str(name);
            out.push(']');
        }
        Expr::Unary { op, expr, .. } => {
            out.push_str(match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Not => "NOT ",
            });
            let needs_parens = matches!(**expr, Expr::Binary { .. });
            if needs_parens {
                out.push('(');
            }
            pretty_expr(expr, out);
            if needs_parens {
                out.push(')');
            }
        }
        Expr::Binary { op, left, right, .. } => {
            let lparen = child_needs_parens(*op, left, false);
            let rparen = child_needs_parens(*op, right, true);
            if lparen {
                out.push('(');
            }
            pretty_expr(left, out);
            if lparen {
                out.push(')');
            }
            out.push(' ');
            out.push_str(op_str(*op));
            out.push(' ');
            if rparen {
                out.push('(');
            }
            pretty_expr(right, out);
            if rparen {
                out.push(')');
            }
        }
        Expr::IfChain { branches, else_branch, .. } => {
            for (i, branch) in branches.iter().enumerate() {
                out.push_str(if i == 0 { "IF " } else { "ELSEIF " });
                pretty_expr(&branch.cond, out);
                out.push_str(" THEN ");
                pretty_expr(&branch.then, out);
                out.push(' ');
            }
            if let Some(e) = else_branch {
                out.push_str("ELSE ");
                pretty_expr(e, out);
                out.push(' ');
            }
            out.push_str("END IF");
        }
        Expr::Call { name, args, .. } => {
            out.push_str(name);
            out.push('(');
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                pretty_expr(a, out);
            }
            out.push(')');
        }
        Expr::Lookup1D { x, points, .. } => {
            out.push_str("LOOKUP(");
            pretty_expr(x, out);
            for (px, py) in points {
                out.push_str(&format!(", ({}, {})", format_number(*px), format_number(*py)));
            }
            out.push(')');
        }
        Expr::Delay { kind, input, tau, init, .. } => {
            out.push_str(match kind {
                DelayKind::Delay1 => "DELAY1(",
                DelayKind::Delay3 => "DELAY3(",
                DelayKind::Smooth => "SMOOTH(",
                DelayKind::Smooth3 => "SMOOTH3(",
            });
            pretty_expr(input, out);
            out.push_str(", ");
            pretty_expr(tau, out);
            if let Some(init) = init {
                out.push_str(", ");
                pretty_expr(init, out);
            }
            out.push(')');
        }
        Expr::Time { kind, .. } => {
            out.push_str(match kind {
                TimeKind::Time => "TIME",
                TimeKind::TimeStep => "TIME STEP",
                TimeKind::InitialTime => "INITIAL TIME",
                TimeKind::FinalTime => "FINAL TIME",
            });
        }
    }
}

fn op_str(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "MOD",
        BinaryOp::Pow => "^",
        BinaryOp::Lt => "<",
        BinaryOp::Lte => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Gte => ">=",
        BinaryOp::Eq => "=",
        BinaryOp::Neq => "<>",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Xor => "XOR",
    }
}

fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Canonical textual form of an equation, stable across semantically
/// identical re-parses (used for the `pretty` field of the persisted AST
/// envelope and for golden round-trip tests).
pub fn pretty_equation(eqn: &Equation) -> String {
    let mut out = String::new();
    for def in &eqn.defs {
        out.push_str(&format!("FUNCTION {}({}) ", def.name, def.params.join(", ")));
        pretty_expr(&def.body, &mut out);
        out.push_str(" END FUNCTION\n");
    }
    pretty_expr(&eqn.expr, &mut out);
    out
}
