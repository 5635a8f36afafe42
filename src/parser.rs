// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Precedence-climbing (Pratt) parser over the token stream produced by
//! [`crate::token`], following the grammar in `spec.md` §4.2.

use crate::ast::{BinaryOp, DelayKind, Equation, Expr, FunctionDef, IfBranch, TimeKind, UnaryOp};
use crate::common::{Diagnostic, ErrorCode, Phase, Result, Span};
use crate::token::{Lexer, Spanned, Token};
use crate::units::UnitExponentMap;

pub fn parse_equation(src: &str) -> Result<Equation> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0, src };
    parser.parse_equation()
}

struct Parser<'input> {
    tokens: Vec<Spanned<'input>>,
    pos: usize,
    src: &'input str,
}

impl<'input> Parser<'input> {
    fn peek(&self) -> Option<Token<'input>> {
        self.tokens.get(self.pos).map(|s| s.tok)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|s| s.span)
            .unwrap_or_else(|| Span::new(self.src.len(), self.src.len()))
    }

    fn advance(&mut self) -> Option<Spanned<'input>> {
        let tok = self.tokens.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, code: ErrorCode, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(Phase::Parse, code, message)
            .with_span(self.peek_span())
            .with_snippet_from(self.src)
    }

    fn expect(&mut self, want: Token<'input>, what: &str) -> Result<Spanned<'input>> {
        match self.peek() {
            Some(tok) if tok == want => Ok(self.advance().unwrap()),
            Some(tok) => Err(self.err(
                ErrorCode::UnexpectedToken,
                format!("expected {what}, found {tok:?}"),
            )),
            None => Err(self.err(ErrorCode::UnexpectedToken, format!("expected {what}, found end of input"))),
        }
    }

    fn eat(&mut self, want: Token<'input>) -> bool {
        if self.peek() == Some(want) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_equation(&mut self) -> Result<Equation> {
        let start = self.peek_span();
        let mut defs = Vec::new();
        while self.peek() == Some(Token::Function) {
            defs.push(self.parse_function_def()?);
        }
        let expr = self.parse_expr()?;
        if self.pos != self.tokens.len() {
            return Err(self.err(
                ErrorCode::TrailingInput,
                "unexpected trailing input after the final expression",
            ));
        }
        let end = if self.tokens.is_empty() {
            start
        } else {
            self.tokens[self.tokens.len() - 1].span
        };
        Ok(Equation {
            defs,
            expr,
            span: Span::new(start.start as usize, end.end as usize),
        })
    }

    fn parse_function_def(&mut self) -> Result<FunctionDef> {
        let start = self.expect(Token::Function, "FUNCTION")?.span;
        let name = match self.advance() {
            Some(Spanned { tok: Token::Ident(n), .. }) => n.to_string(),
            _ => return Err(self.err(ErrorCode::UnexpectedToken, "expected macro name after FUNCTION")),
        };
        self.expect(Token::LParen, "`(`")?;
        let mut params = Vec::new();
        if self.peek() != Some(Token::RParen) {
            loop {
                match self.advance() {
                    Some(Spanned { tok: Token::Ident(p), .. }) => params.push(p.to_string()),
                    _ => return Err(self.err(ErrorCode::UnexpectedToken, "expected parameter name")),
                }
                if !self.eat(Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "`)`")?;
        let body = self.parse_expr()?;
        let end = self.expect(Token::EndFunction, "END FUNCTION")?.span;
        Ok(FunctionDef {
            name,
            params,
            body,
            span: Span::new(start.start as usize, end.end as usize),
        })
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Or) => BinaryOp::Or,
                Some(Token::Xor) => BinaryOp::Xor,
                Some(Token::And) => BinaryOp::And,
                Some(Token::EqEq) | Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Neq) => BinaryOp::Neq,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Lte) => BinaryOp::Lte,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Gte) => BinaryOp::Gte,
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                Some(Token::Caret) => BinaryOp::Pow,
                _ => break,
            };
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if op.right_associative() { prec } else { prec + 1 };
            let right = self.parse_binary(next_min)?;
            let span = Span::new(left.span().start as usize, right.span().end as usize);
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let start = self.peek_span();
        let op = match self.peek() {
            Some(Token::Plus) => Some(UnaryOp::Pos),
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Not) | Some(Token::Bang) => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_unary()?;
            let span = Span::new(start.start as usize, expr.span().end as usize);
            return Ok(Expr::Unary { op, expr: Box::new(expr), span });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Num(n)) => {
                self.advance();
                let value: f64 = n.parse().map_err(|_| {
                    self.err(ErrorCode::UnexpectedToken, format!("invalid number literal `{n}`"))
                })?;
                let unit = if self.peek() == Some(Token::LBrace) {
                    Some(self.parse_unit_literal()?)
                } else {
                    None
                };
                let end = self.tokens[self.pos - 1].span;
                Ok(Expr::QuantityLiteral {
                    value,
                    unit,
                    span: Span::new(start.start as usize, end.end as usize),
                })
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::BooleanLiteral { value: true, span: start })
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::BooleanLiteral { value: false, span: start })
            }
            Some(Token::Ref(name)) => {
                self.advance();
                Ok(Expr::Ref { name: name.to_string(), span: start })
            }
            Some(Token::Time) => {
                self.advance();
                Ok(Expr::Time { kind: TimeKind::Time, span: start })
            }
            Some(Token::TimeStep) => {
                self.advance();
                Ok(Expr::Time { kind: TimeKind::TimeStep, span: start })
            }
            Some(Token::InitialTime) => {
                self.advance();
                Ok(Expr::Time { kind: TimeKind::InitialTime, span: start })
            }
            Some(Token::FinalTime) => {
                self.advance();
                Ok(Expr::Time { kind: TimeKind::FinalTime, span: start })
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::If) => self.parse_if(),
            Some(Token::Lookup) => self.parse_lookup(),
            Some(Token::Delay1) => self.parse_delay(DelayKind::Delay1),
            Some(Token::Delay3) => self.parse_delay(DelayKind::Delay3),
            Some(Token::Smooth) => self.parse_delay(DelayKind::Smooth),
            Some(Token::Smooth3) => self.parse_delay(DelayKind::Smooth3),
            Some(Token::Ident(name)) => {
                self.advance();
                if self.peek() == Some(Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(Token::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect(Token::RParen, "`)`")?.span;
                    Ok(Expr::Call {
                        name: name.to_string(),
                        args,
                        span: Span::new(start.start as usize, end.end as usize),
                    })
                } else {
                    Ok(Expr::Ref { name: name.to_string(), span: start })
                }
            }
            Some(tok) => Err(self.err(ErrorCode::UnexpectedToken, format!("unexpected token {tok:?}"))),
            None => Err(self.err(ErrorCode::UnexpectedToken, "unexpected end of input")),
        }
    }

    fn parse_if(&mut self) -> Result<Expr> {
        let start = self.expect(Token::If, "IF")?.span;
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        self.expect(Token::Then, "THEN")?;
        let then = self.parse_expr()?;
        branches.push(IfBranch { cond: Box::new(cond), then: Box::new(then) });
        while self.eat(Token::ElseIf) {
            let cond = self.parse_expr()?;
            self.expect(Token::Then, "THEN")?;
            let then = self.parse_expr()?;
            branches.push(IfBranch { cond: Box::new(cond), then: Box::new(then) });
        }
        let else_branch = if self.eat(Token::Else) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let end = self.expect(Token::EndIf, "END IF")?.span;
        Ok(Expr::IfChain {
            branches,
            else_branch,
            span: Span::new(start.start as usize, end.end as usize),
        })
    }

    fn parse_lookup(&mut self) -> Result<Expr> {
        let start = self.expect(Token::Lookup, "LOOKUP")?.span;
        self.expect(Token::LParen, "`(`")?;
        let x = self.parse_expr()?;
        self.expect(Token::Comma, "`,`")?;
        let mut points = Vec::new();
        while self.peek() == Some(Token::LParen) {
            self.expect(Token::LParen, "`(`")?;
            let xv = self.parse_number_literal()?;
            self.expect(Token::Comma, "`,`")?;
            let yv = self.parse_number_literal()?;
            self.expect(Token::RParen, "`)`")?;
            points.push((xv, yv));
            self.eat(Token::Comma);
        }
        let end = self.expect(Token::RParen, "`)`")?.span;
        if points.is_empty() {
            return Err(Diagnostic::new(
                Phase::Compile,
                ErrorCode::LookupEmpty,
                "LOOKUP requires at least one point",
            )
            .with_span(start)
            .with_snippet_from(self.src));
        }
        for w in points.windows(2) {
            if w[1].0 <= w[0].0 {
                return Err(Diagnostic::new(
                    Phase::Compile,
                    ErrorCode::LookupNonMonotonic,
                    "LOOKUP x-coordinates must be strictly increasing",
                )
                .with_span(start)
                .with_snippet_from(self.src));
            }
        }
        Ok(Expr::Lookup1D {
            x: Box::new(x),
            points,
            x_unit: None,
            y_unit: None,
            span: Span::new(start.start as usize, end.end as usize),
        })
    }

    fn parse_number_literal(&mut self) -> Result<f64> {
        let neg = self.eat(Token::Minus);
        match self.advance() {
            Some(Spanned { tok: Token::Num(n), .. }) => {
                let v: f64 = n.parse().unwrap();
                Ok(if neg { -v } else { v })
            }
            _ => Err(self.err(ErrorCode::UnexpectedToken, "expected a number literal")),
        }
    }

    fn parse_delay(&mut self, kind: DelayKind) -> Result<Expr> {
        let start_tok = self.advance().unwrap();
        let start = start_tok.span;
        self.expect(Token::LParen, "`(`")?;
        let input = self.parse_expr()?;
        self.expect(Token::Comma, "`,`")?;
        let tau = self.parse_expr()?;
        let init = if self.eat(Token::Comma) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let end = self.expect(Token::RParen, "`)`")?.span;
        let span = Span::new(start.start as usize, end.end as usize);
        Ok(Expr::Delay {
            kind,
            input: Box::new(input),
            tau: Box::new(tau),
            init,
            id: crate::ast::node_id(span),
            span,
        })
    }

    /// `unitProduct` inside `{ ... }`: `*`, `/`, `PER`, `^`, and the
    /// `squared`/`cubed` suffixes, with real exponents.
    fn parse_unit_literal(&mut self) -> Result<UnitExponentMap> {
        self.expect(Token::LBrace, "`{`")?;
        let mut units = self.parse_unit_product()?;
        self.expect(Token::RBrace, "`}`")?;
        units.retain(|_, e| *e != 0.0);
        Ok(units)
    }

    fn parse_unit_product(&mut self) -> Result<UnitExponentMap> {
        let mut units = self.parse_unit_term()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.advance();
                    let rhs = self.parse_unit_term()?;
                    for (sym, exp) in rhs {
                        *units.entry(sym).or_insert(0.0) += exp;
                    }
                }
                Some(Token::Slash) | Some(Token::Per) => {
                    self.advance();
                    let rhs = self.parse_unit_term()?;
                    for (sym, exp) in rhs {
                        *units.entry(sym).or_insert(0.0) -= exp;
                    }
                }
                _ => break,
            }
        }
        Ok(units)
    }

    fn parse_unit_term(&mut self) -> Result<UnitExponentMap> {
        let start = self.peek_span();
        let name = match self.advance() {
            Some(Spanned { tok: Token::Ident(n), .. }) => n.to_string(),
            Some(Spanned { tok, .. }) => {
                return Err(self.err(ErrorCode::InvalidUnitToken, format!("expected a unit name, found {tok:?}")));
            }
            None => return Err(self.err(ErrorCode::InvalidUnitToken, "expected a unit name")),
        };
        let mut exp = 1.0;
        if self.eat(Token::Caret) {
            let neg = self.eat(Token::Minus);
            match self.advance() {
                Some(Spanned { tok: Token::Num(n), .. }) => {
                    let v: f64 = n.parse().map_err(|_| {
                        Diagnostic::new(Phase::Parse, ErrorCode::InvalidUnitExponent, format!("invalid unit exponent `{n}`"))
                            .with_span(start)
                            .with_snippet_from(self.src)
                    })?;
                    exp = if neg { -v } else { v };
                }
                _ => {
                    return Err(Diagnostic::new(
                        Phase::Parse,
                        ErrorCode::InvalidUnitExponent,
                        "expected a numeric exponent after `^`",
                    )
                    .with_span(start)
                    .with_snippet_from(self.src));
                }
            }
        } else if let Some(Token::Ident(suffix)) = self.peek() {
            match suffix {
                "squared" => {
                    exp = 2.0;
                    self.advance();
                }
                "cubed" => {
                    exp = 3.0;
                    self.advance();
                }
                _ => {}
            }
        }
        let mut map = UnitExponentMap::new();
        map.insert(name, exp);
        Ok(map)
    }
}
