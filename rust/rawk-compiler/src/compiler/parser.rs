//! Recursive descent parser for AWK.
//!
//! Produces an unresolved [`Program`]: variables are referenced by name only.
//! Scope and kind are assigned later by the resolver.

use crate::compiler::ast::*;
use crate::compiler::tokens::{Builtin, Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected {found} at line {line}, col {col}; expected {expected}")]
    Unexpected {
        found: String,
        expected: String,
        line: usize,
        col: usize,
    },
    #[error("{message} at line {line}, col {col}")]
    Invalid {
        message: String,
        line: usize,
        col: usize,
    },
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    in_function: bool,
    in_begin_end: bool,
    /// Inside unparenthesized print arguments `>` is a redirect, not a comparison
    no_greater: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
            in_function: false,
            in_begin_end: false,
            no_greater: false,
        }
    }

    fn current(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, ParseError> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let tok = self.current();
        ParseError::Unexpected {
            found: tok.kind.to_string(),
            expected: expected.to_string(),
            line: tok.span.line,
            col: tok.span.col,
        }
    }

    fn invalid(&self, span: Span, message: impl Into<String>) -> ParseError {
        ParseError::Invalid {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn skip_newlines(&mut self) {
        while self.at(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        )
    }

    // ── Top-level parsing ──

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut program = Program::default();
        self.skip_terminators();
        while !self.at(&TokenKind::Eof) {
            match self.peek_kind() {
                TokenKind::Begin => {
                    self.advance();
                    self.in_begin_end = true;
                    let block = self.parse_block()?;
                    self.in_begin_end = false;
                    program.begin.push(block);
                }
                TokenKind::End => {
                    self.advance();
                    self.in_begin_end = true;
                    let block = self.parse_block()?;
                    self.in_begin_end = false;
                    program.end.push(block);
                }
                TokenKind::Function => program.functions.push(self.parse_function()?),
                _ => program.actions.push(self.parse_action()?),
            }
            self.skip_terminators();
        }
        Ok(program)
    }

    fn parse_action(&mut self) -> Result<Action, ParseError> {
        if self.at(&TokenKind::LBrace) {
            let body = self.parse_block()?;
            return Ok(Action {
                pattern: Pattern::All,
                body: Some(body),
            });
        }
        let start = self.parse_expr()?;
        let pattern = if self.at(&TokenKind::Comma) {
            self.advance();
            self.skip_newlines();
            let stop = self.parse_expr()?;
            Pattern::Range(start, stop)
        } else {
            Pattern::Expr(start)
        };
        let body = if self.at(&TokenKind::LBrace) {
            Some(self.parse_block()?)
        } else {
            if !self.at_terminator() {
                return Err(self.unexpected("'{' or end of pattern"));
            }
            None
        };
        Ok(Action { pattern, body })
    }

    fn parse_function(&mut self) -> Result<Function, ParseError> {
        let span = self.advance().span;
        let name_tok = self.advance();
        let name = match name_tok.kind {
            TokenKind::Name(n) | TokenKind::FuncName(n) => n,
            TokenKind::Builtin(b) => {
                return Err(self.invalid(
                    name_tok.span,
                    format!("can't use builtin name {:?} as function name", b.name()),
                ))
            }
            other => {
                return Err(ParseError::Unexpected {
                    found: other.to_string(),
                    expected: "function name".to_string(),
                    line: name_tok.span.line,
                    col: name_tok.span.col,
                })
            }
        };
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) {
            match self.advance().kind {
                TokenKind::Name(p) => params.push(p),
                _ => {
                    self.pos -= 1;
                    return Err(self.unexpected("parameter name"));
                }
            }
            if self.at(&TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
            } else {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        self.skip_newlines();
        self.in_function = true;
        let body = self.parse_block()?;
        self.in_function = false;
        Ok(Function {
            name,
            params,
            body,
            span,
        })
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        self.expect(&TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            match self.peek_kind() {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(stmts);
                }
                TokenKind::Eof => return Err(self.unexpected("'}'")),
                _ => stmts.push(self.parse_stmt()?),
            }
        }
    }

    // ── Statements ──

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            TokenKind::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                let body = self.parse_loop_body()?;
                Ok(Stmt::While { cond, body })
            }
            TokenKind::Do => {
                self.advance();
                self.skip_newlines();
                self.loop_depth += 1;
                let body = into_block(self.parse_stmt()?);
                self.loop_depth -= 1;
                self.skip_terminators();
                self.expect(&TokenKind::While)?;
                self.expect(&TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                self.end_simple_stmt()?;
                Ok(Stmt::DoWhile { body, cond })
            }
            TokenKind::For => self.parse_for(),
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt::Block(Vec::new()))
            }
            _ => {
                let stmt = self.parse_simple_stmt()?;
                self.end_simple_stmt()?;
                Ok(stmt)
            }
        }
    }

    fn end_simple_stmt(&mut self) -> Result<(), ParseError> {
        match self.peek_kind() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::RBrace | TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("end of statement")),
        }
    }

    fn parse_loop_body(&mut self) -> Result<Block, ParseError> {
        if self.at(&TokenKind::Semicolon) {
            self.advance();
            return Ok(Vec::new());
        }
        self.skip_newlines();
        self.loop_depth += 1;
        let body = self.parse_stmt();
        self.loop_depth -= 1;
        Ok(into_block(body?))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen)?;
        let body = if self.at(&TokenKind::Semicolon) {
            self.advance();
            Vec::new()
        } else {
            self.skip_newlines();
            into_block(self.parse_stmt()?)
        };
        let save = self.pos;
        self.skip_terminators();
        let else_body = if self.at(&TokenKind::Else) {
            self.advance();
            self.skip_newlines();
            Some(into_block(self.parse_stmt()?))
        } else {
            self.pos = save;
            None
        };
        Ok(Stmt::If {
            cond,
            body,
            else_body,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        self.expect(&TokenKind::LParen)?;
        if let (
            Some(TokenKind::Name(var)),
            Some(TokenKind::In),
            Some(TokenKind::Name(array)),
            Some(TokenKind::RParen),
        ) = (self.kind_at(0), self.kind_at(1), self.kind_at(2), self.kind_at(3))
        {
            let (var, array) = (var.clone(), array.clone());
            let var_span = self.advance().span;
            self.advance();
            let array_span = self.advance().span;
            self.advance();
            let body = self.parse_loop_body()?;
            return Ok(Stmt::ForIn {
                var: VarRef {
                    name: var,
                    span: var_span,
                },
                array: VarRef {
                    name: array,
                    span: array_span,
                },
                body,
            });
        }

        let init = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        self.expect(&TokenKind::Semicolon)?;
        self.skip_newlines();
        let cond = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::Semicolon)?;
        self.skip_newlines();
        let post = if self.at(&TokenKind::RParen) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_loop_body()?;
        Ok(Stmt::For {
            init,
            cond,
            post,
            body,
        })
    }

    fn parse_simple_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.current().span;
        match self.peek_kind() {
            TokenKind::Print | TokenKind::Printf => self.parse_print(),
            TokenKind::Delete => {
                self.advance();
                let name_tok = self.advance();
                let TokenKind::Name(name) = name_tok.kind else {
                    self.pos -= 1;
                    return Err(self.unexpected("array name"));
                };
                let index = if self.at(&TokenKind::LBracket) {
                    self.advance();
                    Some(self.parse_expr_list(&TokenKind::RBracket)?)
                } else {
                    None
                };
                Ok(Stmt::Delete {
                    array: VarRef {
                        name,
                        span: name_tok.span,
                    },
                    index,
                })
            }
            TokenKind::Break | TokenKind::Continue => {
                let is_break = self.at(&TokenKind::Break);
                self.advance();
                if self.loop_depth == 0 {
                    let what = if is_break { "break" } else { "continue" };
                    let message = format!("{} must be inside a loop body", what);
                    return Err(self.invalid(span, message));
                }
                Ok(if is_break {
                    Stmt::Break(span)
                } else {
                    Stmt::Continue(span)
                })
            }
            TokenKind::Next | TokenKind::NextFile => {
                let is_next = self.at(&TokenKind::Next);
                self.advance();
                if self.in_begin_end {
                    let what = if is_next { "next" } else { "nextfile" };
                    let message = format!("{} can't be inside BEGIN or END", what);
                    return Err(self.invalid(span, message));
                }
                Ok(if is_next {
                    Stmt::Next(span)
                } else {
                    Stmt::NextFile(span)
                })
            }
            TokenKind::Exit => {
                self.advance();
                let status = if self.at_terminator() {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(Stmt::Exit(status))
            }
            TokenKind::Return => {
                self.advance();
                if !self.in_function {
                    return Err(self.invalid(span, "return must be inside a function"));
                }
                let value = if self.at_terminator() {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(Stmt::Return(value))
            }
            _ => Ok(Stmt::Expr(self.parse_expr()?)),
        }
    }

    fn at_redirect(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Greater | TokenKind::Append | TokenKind::Pipe
        )
    }

    fn parse_print(&mut self) -> Result<Stmt, ParseError> {
        let tok = self.advance();
        let is_printf = tok.kind == TokenKind::Printf;

        let args = if self.at_terminator() || self.at_redirect() {
            Vec::new()
        } else if self.at(&TokenKind::LParen) {
            // `print (a, b) > "out"`: try the parenthesized list first and
            // fall back to a plain expression list such as `print (a)(b)`.
            let save = self.pos;
            self.advance();
            let saved = std::mem::replace(&mut self.no_greater, false);
            let grouped = self.parse_expr_list(&TokenKind::RParen);
            self.no_greater = saved;
            match grouped {
                Ok(list) if self.at_terminator() || self.at_redirect() => list,
                _ => {
                    self.pos = save;
                    self.parse_print_args()?
                }
            }
        } else {
            self.parse_print_args()?
        };

        if is_printf && args.is_empty() {
            return Err(self.invalid(tok.span, "printf requires a format argument"));
        }

        let redirect = if self.at_redirect() {
            let kind = match self.advance().kind {
                TokenKind::Greater => RedirectKind::File,
                TokenKind::Append => RedirectKind::Append,
                _ => RedirectKind::Pipe,
            };
            let saved = std::mem::replace(&mut self.no_greater, true);
            let dest = self.parse_concat();
            self.no_greater = saved;
            Some(OutputRedirect { kind, dest: dest? })
        } else {
            None
        };

        Ok(if is_printf {
            Stmt::Printf { args, redirect }
        } else {
            Stmt::Print { args, redirect }
        })
    }

    fn parse_print_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let saved = std::mem::replace(&mut self.no_greater, true);
        let mut args = Vec::new();
        let result = loop {
            match self.parse_expr() {
                Ok(e) => args.push(e),
                Err(e) => break Err(e),
            }
            if !self.at(&TokenKind::Comma) {
                break Ok(());
            }
            self.advance();
            self.skip_newlines();
        };
        self.no_greater = saved;
        result.map(|_| args)
    }

    /// Parse comma-separated expressions up to and including `close`.
    fn parse_expr_list(&mut self, close: &TokenKind) -> Result<Vec<Expr>, ParseError> {
        let saved = std::mem::replace(&mut self.no_greater, false);
        let mut exprs = Vec::new();
        let result = loop {
            self.skip_newlines();
            if self.at(close) {
                break Ok(());
            }
            match self.parse_expr() {
                Ok(e) => exprs.push(e),
                Err(e) => break Err(e),
            }
            self.skip_newlines();
            if !self.at(&TokenKind::Comma) {
                break Ok(());
            }
            self.advance();
        };
        self.no_greater = saved;
        result?;
        self.expect(close)?;
        Ok(exprs)
    }

    // ── Expressions ──

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_ternary()?;
        if !expr.is_lvalue() {
            return Ok(expr);
        }
        let op = match self.peek_kind() {
            TokenKind::Assign => None,
            TokenKind::AddAssign => Some(AugOp::Add),
            TokenKind::SubAssign => Some(AugOp::Sub),
            TokenKind::MulAssign => Some(AugOp::Mul),
            TokenKind::DivAssign => Some(AugOp::Div),
            TokenKind::ModAssign => Some(AugOp::Mod),
            TokenKind::PowAssign => Some(AugOp::Pow),
            _ => return Ok(expr),
        };
        self.advance();
        self.skip_newlines();
        let value = Box::new(self.parse_expr()?);
        let target = Box::new(expr);
        Ok(match op {
            None => Expr::Assign { target, value },
            Some(op) => Expr::AugAssign { target, op, value },
        })
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if !self.at(&TokenKind::Question) {
            return Ok(cond);
        }
        self.advance();
        self.skip_newlines();
        let then = self.parse_expr()?;
        self.skip_newlines();
        self.expect(&TokenKind::Colon)?;
        self.skip_newlines();
        let otherwise = self.parse_expr()?;
        Ok(Expr::Cond {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.at(&TokenKind::Or) {
            self.advance();
            self.skip_newlines();
            let right = self.parse_and()?;
            left = binary(left, BinaryOp::Or, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_in()?;
        while self.at(&TokenKind::And) {
            self.advance();
            self.skip_newlines();
            let right = self.parse_in()?;
            left = binary(left, BinaryOp::And, right);
        }
        Ok(left)
    }

    fn parse_in(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_match()?;
        while self.at(&TokenKind::In) {
            self.advance();
            let array = self.parse_array_name()?;
            left = Expr::In {
                index: vec![left],
                array,
            };
        }
        Ok(left)
    }

    fn parse_array_name(&mut self) -> Result<VarRef, ParseError> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Name(name) => Ok(VarRef {
                name,
                span: tok.span,
            }),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("array name"))
            }
        }
    }

    fn parse_match(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Match => BinaryOp::Match,
                TokenKind::NotMatch => BinaryOp::NotMatch,
                _ => return Ok(left),
            };
            self.advance();
            let right = regex_to_str(self.parse_comparison()?);
            left = binary(left, op, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_pipe_getline()?;
        let op = match self.peek_kind() {
            TokenKind::Equals => BinaryOp::Equals,
            TokenKind::NotEquals => BinaryOp::NotEquals,
            TokenKind::Less => BinaryOp::Less,
            TokenKind::LessOrEqual => BinaryOp::LessOrEqual,
            TokenKind::Greater if !self.no_greater => BinaryOp::Greater,
            TokenKind::GreaterOrEqual => BinaryOp::GreaterOrEqual,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_pipe_getline()?;
        Ok(binary(left, op, right))
    }

    fn parse_pipe_getline(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_concat()?;
        while self.at(&TokenKind::Pipe) && self.kind_at(1) == Some(&TokenKind::Getline) {
            self.advance();
            self.advance();
            let target = self.parse_getline_target()?;
            left = Expr::Getline {
                source: GetlineSource::Command(Box::new(left)),
                target,
            };
        }
        Ok(left)
    }

    fn starts_concat_operand(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::Regex(_)
            | TokenKind::Name(_)
            | TokenKind::FuncName(_)
            | TokenKind::Builtin(_)
            | TokenKind::Dollar
            | TokenKind::Not
            | TokenKind::LParen
            | TokenKind::Incr
            | TokenKind::Decr => true,
            // `x getline` is not concatenation, but `x (getline)` is
            _ => false,
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        while self.starts_concat_operand() {
            let right = self.parse_additive()?;
            left = binary(left, BinaryOp::Concat, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(left, op, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(left, op, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Minus,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.parse_pow(),
        };
        self.advance();
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_pow(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if !self.at(&TokenKind::Caret) {
            return Ok(base);
        }
        self.advance();
        // Right-associative, and the exponent may carry its own sign: 2^-1
        let exponent = self.parse_unary()?;
        Ok(binary(base, BinaryOp::Pow, exponent))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek_kind(), TokenKind::Incr | TokenKind::Decr) {
            let tok = self.advance();
            let target = self.parse_primary()?;
            if !target.is_lvalue() {
                let message = format!("expected lvalue after {}", tok.kind);
                return Err(self.invalid(tok.span, message));
            }
            return Ok(Expr::Incr {
                target: Box::new(target),
                decr: tok.kind == TokenKind::Decr,
                pre: true,
            });
        }
        let expr = self.parse_primary()?;
        if expr.is_lvalue() && matches!(self.peek_kind(), TokenKind::Incr | TokenKind::Decr) {
            let decr = self.advance().kind == TokenKind::Decr;
            return Ok(Expr::Incr {
                target: Box::new(expr),
                decr,
                pre: false,
            });
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let tok = self.current().clone();
        match tok.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Num(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::Regex(r) => {
                self.advance();
                Ok(Expr::Regex(r))
            }
            TokenKind::Dollar => {
                self.advance();
                let operand = match self.peek_kind() {
                    TokenKind::Incr | TokenKind::Decr => self.parse_postfix()?,
                    TokenKind::Minus | TokenKind::Plus | TokenKind::Not => {
                        let op = match self.advance().kind {
                            TokenKind::Minus => UnaryOp::Minus,
                            TokenKind::Plus => UnaryOp::Plus,
                            _ => UnaryOp::Not,
                        };
                        Expr::Unary {
                            op,
                            expr: Box::new(self.parse_primary()?),
                        }
                    }
                    _ => self.parse_primary()?,
                };
                Ok(Expr::Field(Box::new(operand)))
            }
            TokenKind::LParen => {
                self.advance();
                let mut exprs = self.parse_expr_list(&TokenKind::RParen)?;
                match exprs.len() {
                    0 => Err(self.invalid(tok.span, "empty parentheses")),
                    1 => Ok(exprs.swap_remove(0)),
                    _ if self.at(&TokenKind::In) => {
                        self.advance();
                        let array = self.parse_array_name()?;
                        Ok(Expr::In {
                            index: exprs,
                            array,
                        })
                    }
                    _ => Err(self.invalid(
                        tok.span,
                        "unexpected comma-separated expression",
                    )),
                }
            }
            TokenKind::Name(name) => {
                self.advance();
                let var = VarRef {
                    name,
                    span: tok.span,
                };
                if self.at(&TokenKind::LBracket) {
                    self.advance();
                    let index = self.parse_expr_list(&TokenKind::RBracket)?;
                    if index.is_empty() {
                        return Err(self.invalid(tok.span, "empty array index"));
                    }
                    return Ok(Expr::Index { array: var, index });
                }
                Ok(Expr::Var(var))
            }
            TokenKind::FuncName(name) => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let args = self.parse_expr_list(&TokenKind::RParen)?;
                Ok(Expr::UserCall {
                    name,
                    args,
                    span: tok.span,
                })
            }
            TokenKind::Builtin(func) => self.parse_builtin(func, tok.span),
            TokenKind::Getline => {
                self.advance();
                let target = self.parse_getline_target()?;
                let source = if self.at(&TokenKind::Less) {
                    self.advance();
                    GetlineSource::File(Box::new(self.parse_primary()?))
                } else {
                    GetlineSource::Main
                };
                Ok(Expr::Getline { source, target })
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_getline_target(&mut self) -> Result<Option<Box<Expr>>, ParseError> {
        if matches!(self.peek_kind(), TokenKind::Name(_) | TokenKind::Dollar) {
            Ok(Some(Box::new(self.parse_primary()?)))
        } else {
            Ok(None)
        }
    }

    fn parse_builtin(&mut self, func: Builtin, span: Span) -> Result<Expr, ParseError> {
        self.advance();
        if func == Builtin::Length && !self.at(&TokenKind::LParen) {
            return Ok(Expr::Call {
                func,
                args: Vec::new(),
                span,
            });
        }
        self.expect(&TokenKind::LParen)?;
        let mut args = self.parse_expr_list(&TokenKind::RParen)?;

        let (min, max) = func.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            return Err(self.invalid(
                span,
                format!("wrong number of arguments to {}()", func.name()),
            ));
        }

        let regex_arg = match func {
            Builtin::Split => Some(2),
            Builtin::Sub | Builtin::Gsub => Some(0),
            Builtin::Match => Some(1),
            _ => None,
        };
        if let Some(i) = regex_arg {
            if i < args.len() {
                let arg = std::mem::replace(&mut args[i], Expr::Num(0.0));
                args[i] = regex_to_str(arg);
            }
        }

        match func {
            Builtin::Split if !matches!(args[1], Expr::Var(_)) => {
                let message = "split() second argument must be an array name";
                return Err(self.invalid(span, message));
            }
            Builtin::Sub | Builtin::Gsub if args.len() == 3 && !args[2].is_lvalue() => {
                return Err(self.invalid(
                    span,
                    format!("{}() third argument must be assignable", func.name()),
                ));
            }
            _ => {}
        }
        Ok(Expr::Call { func, args, span })
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

/// A regex literal used where a pattern string is expected is passed as text.
fn regex_to_str(expr: Expr) -> Expr {
    match expr {
        Expr::Regex(r) => Expr::Str(r),
        other => other,
    }
}

fn into_block(stmt: Stmt) -> Block {
    match stmt {
        Stmt::Block(b) => b,
        other => vec![other],
    }
}

/// Parse a token stream into an unresolved program.
pub fn parse(tokens: Vec<Token>) -> Result<Program, ParseError> {
    Parser::new(tokens).parse_program()
}
