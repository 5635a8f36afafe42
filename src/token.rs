// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Hand-rolled lexer for the equation DSL (`spec.md` §4.2). Produces a flat
//! token stream with byte-offset spans; whitespace and comments are
//! skipped eagerly so the parser never sees them.

use std::str::CharIndices;

use unicode_xid::UnicodeXID;

use crate::common::{Diagnostic, ErrorCode, Phase, Result, Span};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Token<'input> {
    // literals / identifiers
    Num(&'input str),
    Ident(&'input str),
    /// `[...]` reference; contents may include spaces.
    Ref(&'input str),
    True,
    False,
    // operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Eq,
    EqEq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Not,
    Bang,
    And,
    Or,
    Xor,
    // punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    // keywords
    If,
    Then,
    Else,
    ElseIf,
    EndIf,
    Lookup,
    Delay1,
    Delay3,
    Smooth,
    Smooth3,
    Time,
    TimeStep,
    InitialTime,
    FinalTime,
    Per,
    Function,
    EndFunction,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Spanned<'input> {
    pub tok: Token<'input>,
    pub span: Span,
}

pub struct Lexer<'input> {
    text: &'input str,
    chars: CharIndices<'input>,
    lookahead: Option<(usize, char)>,
}

/// Multi-word keywords are matched greedily before falling back to a
/// single identifier/keyword so that `TIME STEP` lexes as one token with
/// higher precedence than the bare `TIME` primitive.
const MULTI_WORD_KEYWORDS: &[(&[&str], Token<'static>)] = &[
    (&["time", "step"], Token::TimeStep),
    (&["initial", "time"], Token::InitialTime),
    (&["final", "time"], Token::FinalTime),
    (&["end", "if"], Token::EndIf),
    (&["end", "function"], Token::EndFunction),
];

const KEYWORDS: &[(&str, Token<'static>)] = &[
    ("if", Token::If),
    ("then", Token::Then),
    ("else", Token::Else),
    ("elseif", Token::ElseIf),
    ("lookup", Token::Lookup),
    ("delay1", Token::Delay1),
    ("delay3", Token::Delay3),
    ("smooth", Token::Smooth),
    ("smooth3", Token::Smooth3),
    ("time", Token::Time),
    ("per", Token::Per),
    ("function", Token::Function),
    ("and", Token::And),
    ("or", Token::Or),
    ("xor", Token::Xor),
    ("not", Token::Not),
    ("mod", Token::Percent),
    ("true", Token::True),
    ("false", Token::False),
];

fn is_ident_start(c: char) -> bool {
    c == '_' || UnicodeXID::is_xid_start(c)
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || UnicodeXID::is_xid_continue(c)
}

impl<'input> Lexer<'input> {
    pub fn new(text: &'input str) -> Self {
        let mut lexer = Lexer {
            text,
            chars: text.char_indices(),
            lookahead: None,
        };
        lexer.lookahead = lexer.chars.next();
        lexer
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.lookahead = self.chars.next();
        self.lookahead
    }

    fn skip_trivia(&mut self) -> Result<()> {
        // `{...}` is reserved for unit literals (`spec.md` §4.2), so line
        // (`//`) and block (`/* ... */`) comments use C-style delimiters
        // instead of Vensim's brace comments.
        loop {
            match self.lookahead {
                Some((_, c)) if c.is_whitespace() => {
                    self.bump();
                }
                Some((start, '/')) => {
                    let mut probe = self.chars.clone();
                    match probe.next() {
                        Some((_, '/')) => {
                            self.bump();
                            self.bump();
                            while !matches!(self.lookahead, None | Some((_, '\n'))) {
                                self.bump();
                            }
                        }
                        Some((_, '*')) => {
                            self.bump();
                            self.bump();
                            let mut closed = false;
                            while let Some((_, c)) = self.lookahead {
                                if c == '*' {
                                    let mut p = self.chars.clone();
                                    if matches!(p.next(), Some((_, '/'))) {
                                        self.bump();
                                        self.bump();
                                        closed = true;
                                        break;
                                    }
                                }
                                self.bump();
                            }
                            if !closed {
                                return Err(Diagnostic::new(
                                    Phase::Parse,
                                    ErrorCode::UnclosedBlock,
                                    "unclosed block comment",
                                )
                                .with_span(Span::new(start, self.text.len())));
                            }
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn word_end(&mut self, start: usize) -> usize {
        let mut end = start + self.lookahead.unwrap().1.len_utf8();
        while let Some((idx, c)) = self.lookahead {
            if is_ident_continue(c) {
                end = idx + c.len_utf8();
                self.bump();
            } else {
                break;
            }
        }
        end
    }

    fn try_multi_word(&mut self, start: usize, first_lower: &str) -> Option<(Token<'static>, usize)> {
        'outer: for (words, tok) in MULTI_WORD_KEYWORDS {
            if words[0] != first_lower {
                continue;
            }
            // probe ahead without committing unless the whole phrase matches
            let mut probe_chars = self.chars.clone();
            let mut probe_lookahead = self.lookahead;
            let mut end = start + first_lower.len();
            for expect in &words[1..] {
                // skip whitespace between words
                loop {
                    match probe_lookahead {
                        Some((_, c)) if c.is_whitespace() => {
                            probe_lookahead = probe_chars.next();
                        }
                        _ => break,
                    }
                }
                let word_start = match probe_lookahead {
                    Some((idx, c)) if is_ident_start(c) => idx,
                    _ => continue 'outer,
                };
                let mut word_end = word_start;
                loop {
                    match probe_lookahead {
                        Some((idx, c)) if is_ident_continue(c) => {
                            word_end = idx + c.len_utf8();
                            probe_lookahead = probe_chars.next();
                        }
                        _ => break,
                    }
                }
                let word = &self.text[word_start..word_end];
                if word.to_lowercase() != *expect {
                    continue 'outer;
                }
                end = word_end;
            }
            // commit
            self.chars = probe_chars;
            self.lookahead = probe_lookahead;
            return Some((*tok, end));
        }
        None
    }

    fn number(&mut self, start: usize) -> Spanned<'input> {
        // [0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?
        let mut end = start;
        while let Some((idx, c)) = self.lookahead {
            if c.is_ascii_digit() {
                end = idx + 1;
                self.bump();
            } else {
                break;
            }
        }
        // fractional part, only if '.' is followed by a digit
        if let Some((dot_idx, '.')) = self.lookahead {
            let mut probe = self.chars.clone();
            if matches!(probe.next(), Some((_, c)) if c.is_ascii_digit()) {
                end = dot_idx + 1;
                self.bump();
                while let Some((idx, c)) = self.lookahead {
                    if c.is_ascii_digit() {
                        end = idx + 1;
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        // exponent part, only if [eE][+-]?[0-9]+ fully matches
        if let Some((e_idx, ec)) = self.lookahead {
            if ec == 'e' || ec == 'E' {
                let mut probe = self.chars.clone();
                let mut next = probe.next();
                let has_sign = matches!(next, Some((_, c)) if c == '+' || c == '-');
                if has_sign {
                    next = probe.next();
                }
                if matches!(next, Some((_, c)) if c.is_ascii_digit()) {
                    self.bump(); // consume 'e'/'E'
                    end = e_idx + 1;
                    if has_sign {
                        let (sign_idx, _) = self.lookahead.unwrap();
                        end = sign_idx + 1;
                        self.bump();
                    }
                    while let Some((idx, c)) = self.lookahead {
                        if c.is_ascii_digit() {
                            end = idx + 1;
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
            }
        }
        Spanned {
            tok: Token::Num(&self.text[start..end]),
            span: Span::new(start, end),
        }
    }

    fn reference(&mut self, start: usize) -> Result<Spanned<'input>> {
        self.bump(); // consume '['
        loop {
            match self.lookahead {
                Some((idx, ']')) => {
                    self.bump();
                    return Ok(Spanned {
                        tok: Token::Ref(&self.text[start + 1..idx]),
                        span: Span::new(start, idx + 1),
                    });
                }
                Some(_) => {
                    self.bump();
                }
                None => {
                    return Err(Diagnostic::new(
                        Phase::Parse,
                        ErrorCode::UnclosedBlock,
                        "unclosed reference, expected `]`",
                    )
                    .with_span(Span::new(start, self.text.len())));
                }
            }
        }
    }

    /// Returns the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<Spanned<'input>>> {
        self.skip_trivia()?;
        let (start, c) = match self.lookahead {
            None => return Ok(None),
            Some(p) => p,
        };

        macro_rules! single {
            ($tok:expr) => {{
                self.bump();
                Ok(Some(Spanned {
                    tok: $tok,
                    span: Span::new(start, start + c.len_utf8()),
                }))
            }};
        }

        match c {
            '+' => single!(Token::Plus),
            '-' => single!(Token::Minus),
            '*' => single!(Token::Star),
            '/' => single!(Token::Slash),
            '^' => single!(Token::Caret),
            '(' => single!(Token::LParen),
            ')' => single!(Token::RParen),
            '{' => single!(Token::LBrace),
            '}' => single!(Token::RBrace),
            ',' => single!(Token::Comma),
            '[' => Ok(Some(self.reference(start)?)),
            '=' => {
                self.bump();
                if self.lookahead.map(|(_, c)| c) == Some('=') {
                    self.bump();
                    Ok(Some(Spanned { tok: Token::EqEq, span: Span::new(start, start + 2) }))
                } else {
                    Ok(Some(Spanned { tok: Token::Eq, span: Span::new(start, start + 1) }))
                }
            }
            '<' => {
                self.bump();
                if self.lookahead.map(|(_, c)| c) == Some('=') {
                    self.bump();
                    Ok(Some(Spanned { tok: Token::Lte, span: Span::new(start, start + 2) }))
                } else if self.lookahead.map(|(_, c)| c) == Some('>') {
                    self.bump();
                    Ok(Some(Spanned { tok: Token::Neq, span: Span::new(start, start + 2) }))
                } else {
                    Ok(Some(Spanned { tok: Token::Lt, span: Span::new(start, start + 1) }))
                }
            }
            '>' => {
                self.bump();
                if self.lookahead.map(|(_, c)| c) == Some('=') {
                    self.bump();
                    Ok(Some(Spanned { tok: Token::Gte, span: Span::new(start, start + 2) }))
                } else {
                    Ok(Some(Spanned { tok: Token::Gt, span: Span::new(start, start + 1) }))
                }
            }
            '!' => {
                self.bump();
                if self.lookahead.map(|(_, c)| c) == Some('=') {
                    self.bump();
                    Ok(Some(Spanned { tok: Token::Neq, span: Span::new(start, start + 2) }))
                } else {
                    Ok(Some(Spanned { tok: Token::Bang, span: Span::new(start, start + 1) }))
                }
            }
            '%' => single!(Token::Percent),
            c if c.is_ascii_digit() => Ok(Some(self.number(start))),
            c if is_ident_start(c) => {
                let lower_first_end = self.word_end(start);
                let word = &self.text[start..lower_first_end];
                let lower = word.to_lowercase();
                if let Some((tok, end)) = self.try_multi_word(start, &lower) {
                    return Ok(Some(Spanned { tok, span: Span::new(start, end) }));
                }
                let tok = KEYWORDS
                    .iter()
                    .find(|(w, _)| *w == lower)
                    .map(|(_, t)| *t)
                    .unwrap_or(Token::Ident(word));
                Ok(Some(Spanned { tok, span: Span::new(start, lower_first_end) }))
            }
            other => Err(Diagnostic::new(
                Phase::Parse,
                ErrorCode::UnknownKeyword,
                format!("unexpected character `{other}`"),
            )
            .with_span(Span::new(start, start + other.len_utf8()))),
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned<'input>>> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token()? {
            out.push(tok);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn toks(src: &str) -> Vec<Token<'_>> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|s| s.tok).collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("1 2.5 3e10 4.2e-3"), vec![
            Token::Num("1"),
            Token::Num("2.5"),
            Token::Num("3e10"),
            Token::Num("4.2e-3"),
        ]);
    }

    #[test]
    fn test_reference_with_spaces() {
        assert_eq!(toks("[Birth Rate]"), vec![Token::Ref("Birth Rate")]);
    }

    #[test]
    fn test_multi_word_time_keywords() {
        assert_eq!(toks("TIME STEP"), vec![Token::TimeStep]);
        assert_eq!(toks("INITIAL TIME"), vec![Token::InitialTime]);
        assert_eq!(toks("FINAL TIME"), vec![Token::FinalTime]);
        assert_eq!(toks("TIME"), vec![Token::Time]);
    }

    #[test]
    fn test_case_insensitive_keywords() {
        assert_eq!(toks("If Then Else"), vec![Token::If, Token::Then, Token::Else]);
        assert_eq!(toks("end if"), vec![Token::EndIf]);
    }

    #[test]
    fn test_comment_is_skipped() {
        assert_eq!(
            toks("1 /* a comment */ + 2 // trailing\n"),
            vec![Token::Num("1"), Token::Plus, Token::Num("2")]
        );
    }

    #[test]
    fn test_unclosed_comment_errors() {
        assert!(Lexer::new("1 /* oops").tokenize().is_err());
    }

    #[test]
    fn test_brace_is_lbrace_rbrace_not_comment() {
        assert_eq!(
            toks("5 { widgets }"),
            vec![Token::Num("5"), Token::LBrace, Token::Ident("widgets"), Token::RBrace]
        );
    }
}
