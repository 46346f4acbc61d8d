//! Variable and function resolution.
//!
//! AWK never declares whether a name is a scalar or an array; that is
//! inferred from how it is used. The resolver walks the program (functions
//! in call-graph order, then BEGIN, actions and END), records a kind for
//! every variable, propagates kinds through user function calls, and
//! repeats until nothing changes. Then it hands out dense storage indices.

use crate::compiler::ast::*;
use crate::compiler::specials::SpecialVar;
use crate::compiler::tokens::{Builtin, Span};
use crate::compiler::toposort::topo_sort;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

const MAX_PASSES: usize = 100;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Local,
    Special,
    Global,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Scalar,
    Array,
}

/// Resolved storage for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarInfo {
    pub kind: Kind,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncInfo {
    pub index: usize,
    pub native: bool,
    pub params: Vec<String>,
    /// Parallel to `params`: whether each parameter is an array
    pub arrays: Vec<bool>,
    /// Maximum argument count; `None` for variadic native functions
    pub arity: Option<usize>,
}

/// A host-provided function callable from AWK code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeFunc {
    pub name: String,
    /// `None` accepts any number of arguments
    pub arity: Option<usize>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("can't use {current} {name:?} as {used} at line {line}, col {col}")]
    KindConflict {
        name: String,
        current: Kind,
        used: Kind,
        line: usize,
        col: usize,
    },
    #[error("global var {name:?} can't also be a function at line {line}, col {col}")]
    GlobalIsFunction {
        name: String,
        line: usize,
        col: usize,
    },
    #[error("function {name:?} already defined at line {line}, col {col}")]
    DuplicateFunction {
        name: String,
        line: usize,
        col: usize,
    },
    #[error("duplicate parameter name {param:?} in function {func:?} at line {line}, col {col}")]
    DuplicateParam {
        func: String,
        param: String,
        line: usize,
        col: usize,
    },
    #[error("undefined function {name:?} at line {line}, col {col}")]
    UndefinedFunction {
        name: String,
        line: usize,
        col: usize,
    },
    #[error("can't call local variable {name:?} as function at line {line}, col {col}")]
    CallLocal {
        name: String,
        line: usize,
        col: usize,
    },
    #[error("{name:?} called with more arguments than declared at line {line}, col {col}")]
    TooManyArgs {
        name: String,
        line: usize,
        col: usize,
    },
    #[error("can't pass scalar {expr} as array param at line {line}, col {col}")]
    ScalarAsArrayParam {
        expr: String,
        line: usize,
        col: usize,
    },
    #[error("can't pass {arg_kind} {name:?} as {param_kind} param at line {line}, col {col}")]
    ArgKindMismatch {
        name: String,
        arg_kind: Kind,
        param_kind: Kind,
        line: usize,
        col: usize,
    },
    #[error("too many iterations trying to resolve variable types")]
    TooManyIterations,
}

/// A parsed program plus the scope, kind and index of every name in it.
#[derive(Debug, Clone)]
pub struct ResolvedProgram {
    pub program: Program,
    /// Function name ("" for globals) to variable name to info
    vars: BTreeMap<String, BTreeMap<String, VarInfo>>,
    funcs: BTreeMap<String, FuncInfo>,
}

impl ResolvedProgram {
    /// Look up a (possibly local) variable as seen from inside `func`
    /// (`""` for code outside any function).
    pub fn lookup_var(&self, func: &str, name: &str) -> Option<(Scope, VarInfo)> {
        if !func.is_empty() {
            if let Some(info) = self.vars.get(func).and_then(|v| v.get(name)) {
                return Some((Scope::Local, *info));
            }
        }
        if let Some(special) = SpecialVar::from_name(name) {
            return Some((
                Scope::Special,
                VarInfo {
                    kind: Kind::Scalar,
                    index: special.index(),
                },
            ));
        }
        self.vars
            .get("")
            .and_then(|v| v.get(name))
            .map(|info| (Scope::Global, *info))
    }

    pub fn lookup_func(&self, name: &str) -> Option<&FuncInfo> {
        self.funcs.get(name)
    }

    fn global_names(&self, kind: Kind) -> Vec<String> {
        let mut names: Vec<(usize, &String)> = self
            .vars
            .get("")
            .into_iter()
            .flatten()
            .filter(|(_, info)| info.kind == kind)
            .map(|(name, info)| (info.index, name))
            .collect();
        names.sort();
        names.into_iter().map(|(_, n)| n.clone()).collect()
    }

    /// Global scalar names, positioned by index.
    pub fn scalar_names(&self) -> Vec<String> {
        self.global_names(Kind::Scalar)
    }

    /// Global array names, positioned by index.
    pub fn array_names(&self) -> Vec<String> {
        self.global_names(Kind::Array)
    }

    /// Native function names, positioned by index.
    pub fn native_names(&self) -> Vec<String> {
        let mut natives: Vec<(usize, &String)> = self
            .funcs
            .iter()
            .filter(|(_, f)| f.native)
            .map(|(name, f)| (f.index, name))
            .collect();
        natives.sort();
        natives.into_iter().map(|(_, n)| n.clone()).collect()
    }

    /// Human-readable listing of every resolved variable, for debugging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (func, vars) in &self.vars {
            if func.is_empty() {
                out.push_str("globals\n");
            } else if let Some(info) = self.funcs.get(func) {
                let _ = writeln!(
                    out,
                    "function {}({})  # index {}",
                    func,
                    info.params.join(", "),
                    info.index
                );
            }
            for (name, info) in vars {
                let _ = writeln!(out, "  {}: {} {}", name, info.kind, info.index);
            }
        }
        out
    }
}

struct Resolver<'a> {
    /// Function name ("" for globals) to variable name to kind, if known yet
    vars: BTreeMap<String, BTreeMap<String, Option<Kind>>>,
    funcs: BTreeMap<String, FuncInfo>,
    defs: BTreeMap<String, &'a Function>,
    updates: usize,
    cur_func: String,
}

impl<'a> Resolver<'a> {
    fn lookup(&self, func: &str, name: &str) -> Option<(Scope, Option<Kind>, String)> {
        if !func.is_empty() {
            if let Some(kind) = self.vars.get(func).and_then(|v| v.get(name)) {
                return Some((Scope::Local, *kind, func.to_string()));
            }
        }
        if SpecialVar::from_name(name).is_some() {
            return Some((Scope::Special, Some(Kind::Scalar), String::new()));
        }
        self.vars
            .get("")
            .and_then(|v| v.get(name))
            .map(|kind| (Scope::Global, *kind, String::new()))
    }

    fn record_var(
        &mut self,
        func: &str,
        name: &str,
        kind: Option<Kind>,
        span: Span,
    ) -> Result<(), ResolveError> {
        let Some((_, current, owner)) = self.lookup(func, name) else {
            self.vars
                .entry(String::new())
                .or_default()
                .insert(name.to_string(), kind);
            self.updates += 1;
            if self.defs.contains_key(name) {
                return Err(ResolveError::GlobalIsFunction {
                    name: name.to_string(),
                    line: span.line,
                    col: span.col,
                });
            }
            return Ok(());
        };
        match (current, kind) {
            (Some(current), Some(used)) if current != used => Err(ResolveError::KindConflict {
                name: name.to_string(),
                current,
                used,
                line: span.line,
                col: span.col,
            }),
            (None, Some(used)) => {
                if let Some(slot) = self.vars.get_mut(&owner).and_then(|v| v.get_mut(name)) {
                    *slot = Some(used);
                    self.updates += 1;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, var: &VarRef, kind: Option<Kind>) -> Result<(), ResolveError> {
        let func = self.cur_func.clone();
        self.record_var(&func, &var.name, kind, var.span)
    }

    // ── Call graph pass ──

    fn collect_functions(
        &mut self,
        program: &'a Program,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, ResolveError> {
        let mut calls: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut user_index = 0;
        for function in &program.functions {
            let at = function.span;
            if self.defs.contains_key(&function.name) {
                return Err(ResolveError::DuplicateFunction {
                    name: function.name.clone(),
                    line: at.line,
                    col: at.col,
                });
            }
            let mut seen = BTreeSet::new();
            for param in &function.params {
                if !seen.insert(param.as_str()) {
                    return Err(ResolveError::DuplicateParam {
                        func: function.name.clone(),
                        param: param.clone(),
                        line: at.line,
                        col: at.col,
                    });
                }
            }
            self.funcs.insert(
                function.name.clone(),
                FuncInfo {
                    index: user_index,
                    native: false,
                    params: function.params.clone(),
                    arrays: Vec::new(),
                    arity: Some(function.params.len()),
                },
            );
            user_index += 1;
            self.defs.insert(function.name.clone(), function);

            let callees = calls.entry(function.name.clone()).or_default();
            for_each_expr(&function.body, &mut |e| {
                if let Expr::UserCall { name, .. } = e {
                    callees.insert(name.clone());
                }
            });
        }

        let global = calls.entry(String::new()).or_default();
        let mut add_global = |block: &Block| {
            for_each_expr(block, &mut |e| {
                if let Expr::UserCall { name, .. } = e {
                    global.insert(name.clone());
                }
            })
        };
        for block in &program.begin {
            add_global(block);
        }
        for action in &program.actions {
            add_global(&pattern_stmts(&action.pattern));
            if let Some(body) = &action.body {
                add_global(body);
            }
        }
        for block in &program.end {
            add_global(block);
        }
        Ok(calls)
    }

    // ── Main pass ──

    fn walk_ordered(&mut self, program: &Program, ordered: &[String]) -> Result<(), ResolveError> {
        for name in ordered {
            if name.is_empty() {
                continue;
            }
            // A call to something that isn't a defined function is reported
            // while walking the caller.
            let Some(function) = self.defs.get(name).copied() else {
                continue;
            };
            self.cur_func = name.clone();
            self.walk_block(&function.body)?;
            self.cur_func.clear();
        }
        for block in &program.begin {
            self.walk_block(block)?;
        }
        for action in &program.actions {
            match &action.pattern {
                Pattern::All => {}
                Pattern::Expr(e) => self.walk_expr(e)?,
                Pattern::Range(start, stop) => {
                    self.walk_expr(start)?;
                    self.walk_expr(stop)?;
                }
            }
            if let Some(body) = &action.body {
                self.walk_block(body)?;
            }
        }
        for block in &program.end {
            self.walk_block(block)?;
        }
        Ok(())
    }

    fn walk_block(&mut self, block: &[Stmt]) -> Result<(), ResolveError> {
        block.iter().try_for_each(|s| self.walk_stmt(s))
    }

    fn walk_exprs(&mut self, exprs: &[Expr]) -> Result<(), ResolveError> {
        exprs.iter().try_for_each(|e| self.walk_expr(e))
    }

    fn walk_stmt(&mut self, stmt: &Stmt) -> Result<(), ResolveError> {
        match stmt {
            Stmt::Print { args, redirect } | Stmt::Printf { args, redirect } => {
                self.walk_exprs(args)?;
                if let Some(r) = redirect {
                    self.walk_expr(&r.dest)?;
                }
                Ok(())
            }
            Stmt::Expr(e) => self.walk_expr(e),
            Stmt::If {
                cond,
                body,
                else_body,
            } => {
                self.walk_expr(cond)?;
                self.walk_block(body)?;
                if let Some(b) = else_body {
                    self.walk_block(b)?;
                }
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                post,
                body,
            } => {
                if let Some(s) = init {
                    self.walk_stmt(s)?;
                }
                if let Some(c) = cond {
                    self.walk_expr(c)?;
                }
                if let Some(s) = post {
                    self.walk_stmt(s)?;
                }
                self.walk_block(body)
            }
            Stmt::ForIn { var, array, body } => {
                self.record(var, Some(Kind::Scalar))?;
                self.record(array, Some(Kind::Array))?;
                self.walk_block(body)
            }
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                self.walk_expr(cond)?;
                self.walk_block(body)
            }
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Next(_) | Stmt::NextFile(_) => Ok(()),
            Stmt::Exit(e) | Stmt::Return(e) => match e {
                Some(e) => self.walk_expr(e),
                None => Ok(()),
            },
            Stmt::Delete { array, index } => {
                self.record(array, Some(Kind::Array))?;
                if let Some(index) = index {
                    self.walk_exprs(index)?;
                }
                Ok(())
            }
            Stmt::Block(b) => self.walk_block(b),
        }
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<(), ResolveError> {
        match expr {
            Expr::Num(_) | Expr::Str(_) | Expr::Regex(_) => Ok(()),
            Expr::Field(e) => self.walk_expr(e),
            Expr::Var(v) => self.record(v, Some(Kind::Scalar)),
            Expr::Index { array, index } | Expr::In { index, array } => {
                self.walk_exprs(index)?;
                self.record(array, Some(Kind::Array))
            }
            Expr::Assign { target, value }
            | Expr::AugAssign { target, value, .. } => {
                self.walk_expr(target)?;
                self.walk_expr(value)
            }
            Expr::Incr { target, .. } => self.walk_expr(target),
            Expr::Unary { expr, .. } => self.walk_expr(expr),
            Expr::Binary { left, right, .. } => {
                self.walk_expr(left)?;
                self.walk_expr(right)
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                self.walk_expr(cond)?;
                self.walk_expr(then)?;
                self.walk_expr(otherwise)
            }
            Expr::Call { func, args, .. } => match (func, args.as_slice()) {
                (Builtin::Split, [s, Expr::Var(array), rest @ ..]) => {
                    self.walk_expr(s)?;
                    self.record(array, Some(Kind::Array))?;
                    self.walk_exprs(rest)
                }
                // length(x) works on either kind
                (Builtin::Length, [Expr::Var(v)]) => self.record(v, None),
                _ => self.walk_exprs(args),
            },
            Expr::UserCall { name, args, span } => self.walk_call(name, args, *span),
            Expr::Getline { source, target } => {
                match source {
                    GetlineSource::Main => {}
                    GetlineSource::File(e) | GetlineSource::Command(e) => self.walk_expr(e)?,
                }
                if let Some(t) = target {
                    self.walk_expr(t)?;
                }
                Ok(())
            }
        }
    }

    fn walk_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<(), ResolveError> {
        if let Some((Scope::Local, _, _)) = self.lookup(&self.cur_func, name) {
            return Err(ResolveError::CallLocal {
                name: name.to_string(),
                line: span.line,
                col: span.col,
            });
        }
        let Some(info) = self.funcs.get(name).cloned() else {
            return Err(ResolveError::UndefinedFunction {
                name: name.to_string(),
                line: span.line,
                col: span.col,
            });
        };
        if info.arity.is_some_and(|max| args.len() > max) {
            return Err(ResolveError::TooManyArgs {
                name: name.to_string(),
                line: span.line,
                col: span.col,
            });
        }

        for (i, arg) in args.iter().enumerate() {
            let param = info.params.get(i);
            let param_kind = param
                .and_then(|p| self.vars.get(name).and_then(|v| v.get(p)))
                .copied()
                .flatten();
            match arg {
                Expr::Var(var) if info.native => self.record(var, Some(Kind::Scalar))?,
                Expr::Var(var) => {
                    let var_kind = self
                        .lookup(&self.cur_func, &var.name)
                        .and_then(|(_, k, _)| k);
                    match (var_kind, param_kind) {
                        (None, Some(pk)) => self.record(var, Some(pk))?,
                        (Some(vk), None) => {
                            let at = self.defs.get(name).map(|f| f.span).unwrap_or(span);
                            if let Some(p) = param {
                                self.record_var(name, p, Some(vk), at)?;
                            }
                        }
                        (Some(vk), Some(pk)) if vk != pk => {
                            return Err(ResolveError::ArgKindMismatch {
                                name: var.name.clone(),
                                arg_kind: vk,
                                param_kind: pk,
                                line: var.span.line,
                                col: var.span.col,
                            })
                        }
                        _ => self.record(var, None)?,
                    }
                }
                other => {
                    if !info.native && param_kind == Some(Kind::Array) {
                        return Err(ResolveError::ScalarAsArrayParam {
                            expr: other.to_string(),
                            line: span.line,
                            col: span.col,
                        });
                    }
                    self.walk_expr(other)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn finish(
        self,
    ) -> (
        BTreeMap<String, BTreeMap<String, VarInfo>>,
        BTreeMap<String, FuncInfo>,
    ) {
        let mut vars = BTreeMap::new();
        for (func, infos) in &self.vars {
            let names: Vec<&String> = if func.is_empty() {
                infos.keys().collect()
            } else {
                self.funcs
                    .get(func)
                    .map(|f| f.params.iter().collect())
                    .unwrap_or_default()
            };
            let (mut scalars, mut arrays) = (0, 0);
            let mut resolved = BTreeMap::new();
            for name in names {
                let kind = infos.get(name).copied().flatten().unwrap_or(Kind::Scalar);
                let index = match kind {
                    Kind::Scalar => {
                        scalars += 1;
                        scalars - 1
                    }
                    Kind::Array => {
                        arrays += 1;
                        arrays - 1
                    }
                };
                resolved.insert(name.clone(), VarInfo { kind, index });
            }
            vars.insert(func.clone(), resolved);
        }

        let mut funcs = self.funcs;
        for (name, info) in funcs.iter_mut() {
            if info.native {
                continue;
            }
            let locals = vars.get(name);
            info.arrays = info
                .params
                .iter()
                .map(|p| {
                    locals
                        .and_then(|l: &BTreeMap<String, VarInfo>| l.get(p))
                        .is_some_and(|v| v.kind == Kind::Array)
                })
                .collect();
        }

        (vars, funcs)
    }
}

/// Call `f` on every expression in `block`, recursively.
fn for_each_expr<'e>(block: &'e [Stmt], f: &mut dyn FnMut(&'e Expr)) {
    fn expr<'e>(e: &'e Expr, f: &mut dyn FnMut(&'e Expr)) {
        f(e);
        match e {
            Expr::Num(_) | Expr::Str(_) | Expr::Regex(_) | Expr::Var(_) => {}
            Expr::Field(inner)
            | Expr::Incr { target: inner, .. }
            | Expr::Unary { expr: inner, .. } => expr(inner, f),
            Expr::Index { index, .. } | Expr::In { index, .. } => {
                index.iter().for_each(|i| expr(i, f))
            }
            Expr::Assign { target, value } | Expr::AugAssign { target, value, .. } => {
                expr(target, f);
                expr(value, f);
            }
            Expr::Binary { left, right, .. } => {
                expr(left, f);
                expr(right, f);
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                expr(cond, f);
                expr(then, f);
                expr(otherwise, f);
            }
            Expr::Call { args, .. } | Expr::UserCall { args, .. } => {
                args.iter().for_each(|a| expr(a, f))
            }
            Expr::Getline { source, target } => {
                if let GetlineSource::File(e) | GetlineSource::Command(e) = source {
                    expr(e, f);
                }
                if let Some(t) = target {
                    expr(t, f);
                }
            }
        }
    }
    fn stmt<'e>(s: &'e Stmt, f: &mut dyn FnMut(&'e Expr)) {
        match s {
            Stmt::Print { args, redirect } | Stmt::Printf { args, redirect } => {
                args.iter().for_each(|a| expr(a, f));
                if let Some(r) = redirect {
                    expr(&r.dest, f);
                }
            }
            Stmt::Expr(e) => expr(e, f),
            Stmt::If {
                cond,
                body,
                else_body,
            } => {
                expr(cond, f);
                body.iter().for_each(|s| stmt(s, f));
                else_body.iter().flatten().for_each(|s| stmt(s, f));
            }
            Stmt::For {
                init,
                cond,
                post,
                body,
            } => {
                init.iter().for_each(|s| stmt(s, f));
                cond.iter().for_each(|c| expr(c, f));
                post.iter().for_each(|s| stmt(s, f));
                body.iter().for_each(|s| stmt(s, f));
            }
            Stmt::ForIn { body, .. } | Stmt::Block(body) => body.iter().for_each(|s| stmt(s, f)),
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                expr(cond, f);
                body.iter().for_each(|s| stmt(s, f));
            }
            Stmt::Exit(e) | Stmt::Return(e) => e.iter().for_each(|e| expr(e, f)),
            Stmt::Delete { index, .. } => index.iter().flatten().for_each(|i| expr(i, f)),
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Next(_) | Stmt::NextFile(_) => {}
        }
    }
    block.iter().for_each(|s| stmt(s, f));
}

fn pattern_stmts(pattern: &Pattern) -> Block {
    match pattern {
        Pattern::All => Vec::new(),
        Pattern::Expr(e) => vec![Stmt::Expr(e.clone())],
        Pattern::Range(a, b) => vec![Stmt::Expr(a.clone()), Stmt::Expr(b.clone())],
    }
}

/// Resolve scopes, kinds and indices for every name in `program`.
pub fn resolve(program: Program, natives: &[NativeFunc]) -> Result<ResolvedProgram, ResolveError> {
    let mut funcs = BTreeMap::new();
    // A user function shadows a native of the same name, and the natives
    // left over are numbered densely
    let mut native_names: Vec<&NativeFunc> = natives
        .iter()
        .filter(|n| !program.functions.iter().any(|f| f.name == n.name))
        .collect();
    native_names.sort_by(|a, b| a.name.cmp(&b.name));
    for (index, native) in native_names.into_iter().enumerate() {
        funcs.insert(
            native.name.clone(),
            FuncInfo {
                index,
                native: true,
                params: Vec::new(),
                arrays: Vec::new(),
                arity: native.arity,
            },
        );
    }

    let mut resolver = Resolver {
        vars: BTreeMap::new(),
        funcs,
        defs: BTreeMap::new(),
        updates: 0,
        cur_func: String::new(),
    };
    let calls = resolver.collect_functions(&program)?;
    let mut ordered = topo_sort(&calls);
    let called: BTreeSet<String> = ordered.iter().cloned().collect();
    ordered.extend(
        program
            .functions
            .iter()
            .map(|f| f.name.clone())
            .filter(|n| !called.contains(n)),
    );

    for function in &program.functions {
        let locals = resolver.vars.entry(function.name.clone()).or_default();
        for param in &function.params {
            locals.insert(param.clone(), None);
        }
    }
    resolver.vars.entry(String::new()).or_default();
    let builtin = Span::new(0, 0, 1, 1);
    resolver.record_var("", "ARGV", Some(Kind::Array), builtin)?;
    resolver.record_var("", "ENVIRON", Some(Kind::Array), builtin)?;

    let mut updates = resolver.updates;
    resolver.walk_ordered(&program, &ordered)?;
    let mut passes = 1;
    while resolver.updates != updates {
        if passes > MAX_PASSES {
            return Err(ResolveError::TooManyIterations);
        }
        updates = resolver.updates;
        resolver.walk_ordered(&program, &ordered)?;
        passes += 1;
    }
    let functions = program.functions.len();
    debug!(passes, functions, "resolved variable kinds");

    let (vars, funcs) = resolver.finish();
    Ok(ResolvedProgram {
        program,
        vars,
        funcs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::lex;
    use crate::compiler::parser::parse;

    fn resolve_src(src: &str) -> Result<ResolvedProgram, ResolveError> {
        resolve(parse(lex(src).unwrap()).unwrap(), &[])
    }

    fn native(name: &str, arity: Option<usize>) -> NativeFunc {
        NativeFunc {
            name: name.to_string(),
            arity,
        }
    }

    fn local(kind: Kind, index: usize) -> (Scope, VarInfo) {
        (Scope::Local, VarInfo { kind, index })
    }

    fn kind_of(r: &ResolvedProgram, func: &str, name: &str) -> (Scope, Kind) {
        let (scope, info) = r.lookup_var(func, name).unwrap();
        (scope, info.kind)
    }

    #[test]
    fn test_global_indices_sorted_by_name() {
        let r = resolve_src("BEGIN { zeta = 1; alpha = 2; m[1] = 3; b[2] = 4 }").unwrap();
        assert_eq!(r.scalar_names(), vec!["alpha", "zeta"]);
        assert_eq!(r.array_names(), vec!["ARGV", "ENVIRON", "b", "m"]);
    }

    #[test]
    fn test_locals_indexed_by_param_order() {
        let src = "function f(s, arr, t, arr2) { arr[1] = s; arr2[t] = 1 } BEGIN { f(1, x, 2, y) }";
        let r = resolve_src(src).unwrap();
        assert_eq!(r.lookup_var("f", "s").unwrap(), local(Kind::Scalar, 0));
        assert_eq!(r.lookup_var("f", "arr").unwrap(), local(Kind::Array, 0));
        assert_eq!(r.lookup_var("f", "t").unwrap(), local(Kind::Scalar, 1));
        assert_eq!(r.lookup_var("f", "arr2").unwrap(), local(Kind::Array, 1));
        assert_eq!(
            r.lookup_func("f").unwrap().arrays,
            vec![false, true, false, true]
        );
        assert_eq!(kind_of(&r, "", "x"), (Scope::Global, Kind::Array));
    }

    #[test]
    fn test_special_vars() {
        let r = resolve_src("{ NF = 2; print NR }").unwrap();
        let (scope, info) = r.lookup_var("", "NF").unwrap();
        assert_eq!(scope, Scope::Special);
        assert_eq!(info.index, SpecialVar::Nf.index());
        assert!(r.scalar_names().is_empty());
        let err = resolve_src("BEGIN { NR[1] = 1 }").unwrap_err();
        assert!(err.to_string().contains("can't use scalar \"NR\" as array"));
    }

    #[test]
    fn test_scalar_array_conflict() {
        let err = resolve_src("BEGIN { x[1] = 1; x = 1 }").unwrap_err();
        assert!(matches!(
            err,
            ResolveError::KindConflict { ref name, .. } if name == "x"
        ));
        assert!(resolve_src("BEGIN { x = 1 } END { x[1] = 2 }").is_err());
    }

    #[test]
    fn test_kind_flows_from_param_to_argument() {
        let r = resolve_src("function f(a) { a[1] = 99 } BEGIN { f(x) }").unwrap();
        assert_eq!(kind_of(&r, "", "x"), (Scope::Global, Kind::Array));
    }

    #[test]
    fn test_kind_flows_from_argument_to_param() {
        let src = "function f(a) { g(a) } function g(b) { } BEGIN { x[1]; f(x) }";
        let r = resolve_src(src).unwrap();
        assert_eq!(kind_of(&r, "f", "a"), (Scope::Local, Kind::Array));
        assert_eq!(kind_of(&r, "g", "b"), (Scope::Local, Kind::Array));
    }

    #[test]
    fn test_mutual_recursion_fixpoint() {
        let src = "function f1(a) { if (0) f5(z1); f2(a) }
                   function f2(b) { if (0) f4(z2); f3(b) }
                   function f3(c) { if (0) f3(z3); f4(c) }
                   function f4(d) { if (0) f2(z4); f5(d) }
                   function f5(i) { if (0) f1(z5); i[1]=42 }
                   BEGIN { x[1]=3; f5(x); print x[1] }";
        let r = resolve_src(src).unwrap();
        for func in ["f1", "f2", "f3", "f4", "f5"] {
            let param = &r.lookup_func(func).unwrap().params[0];
            assert_eq!(kind_of(&r, func, param).1, Kind::Array, "{func}.{param}");
        }
    }

    #[test]
    fn test_unused_param_defaults_to_scalar() {
        let r = resolve_src("function f(x) { print NR } { f(z) }").unwrap();
        assert_eq!(kind_of(&r, "f", "x"), (Scope::Local, Kind::Scalar));
        assert_eq!(kind_of(&r, "", "z"), (Scope::Global, Kind::Scalar));
    }

    #[test]
    fn test_call_errors() {
        assert!(matches!(
            resolve_src("BEGIN { nope() }").unwrap_err(),
            ResolveError::UndefinedFunction { .. }
        ));
        assert!(matches!(
            resolve_src("function f(a) { } BEGIN { f(1, 2) }").unwrap_err(),
            ResolveError::TooManyArgs { .. }
        ));
        assert!(matches!(
            resolve_src("function f(x) { x() }").unwrap_err(),
            ResolveError::CallLocal { .. }
        ));
        assert!(matches!(
            resolve_src("function f(a) { a[1] } BEGIN { f(1 + 2) }").unwrap_err(),
            ResolveError::ScalarAsArrayParam { .. }
        ));
        assert!(matches!(
            resolve_src("function f(a) { a[1] } BEGIN { s = 1; f(s) }").unwrap_err(),
            ResolveError::ArgKindMismatch {
                arg_kind: Kind::Scalar,
                param_kind: Kind::Array,
                ..
            }
        ));
    }

    #[test]
    fn test_definition_errors() {
        assert!(matches!(
            resolve_src("function f() { } function f() { }").unwrap_err(),
            ResolveError::DuplicateFunction { .. }
        ));
        assert!(matches!(
            resolve_src("function f(a, a) { }").unwrap_err(),
            ResolveError::DuplicateParam { .. }
        ));
        assert!(matches!(
            resolve_src("function f() { } BEGIN { f = 1 }").unwrap_err(),
            ResolveError::GlobalIsFunction { .. }
        ));
    }

    #[test]
    fn test_split_and_length() {
        let src = "BEGIN { n = split(s, parts); print length(parts), length(s) }";
        let r = resolve_src(src).unwrap();
        assert_eq!(kind_of(&r, "", "parts").1, Kind::Array);
        assert_eq!(kind_of(&r, "", "s").1, Kind::Scalar);
    }

    #[test]
    fn test_native_functions() {
        let natives = vec![native("zed", Some(1)), native("add", None)];
        let prog = parse(lex("BEGIN { add(1, 2, 3); zed(x) }").unwrap()).unwrap();
        let r = resolve(prog, &natives).unwrap();
        assert_eq!(r.native_names(), vec!["add", "zed"]);
        assert!(r.lookup_func("add").unwrap().native);

        let prog = parse(lex("BEGIN { zed(1, 2) }").unwrap()).unwrap();
        assert!(matches!(
            resolve(prog, &natives).unwrap_err(),
            ResolveError::TooManyArgs { .. }
        ));
    }

    #[test]
    fn test_user_function_shadows_native() {
        let natives = vec![native("a", None), native("b", None), native("c", None)];
        let src = "function b(x) { return x } BEGIN { print c(4), b(1) }";
        let prog = parse(lex(src).unwrap()).unwrap();
        let r = resolve(prog, &natives).unwrap();
        assert_eq!(r.native_names(), vec!["a", "c"]);
        assert_eq!(r.lookup_func("c").unwrap().index, 1);
        let b = r.lookup_func("b").unwrap();
        assert!(!b.native);
        assert_eq!(b.index, 0);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let src = "function g(q, r) { r[q] = q } function f(a, b) { g(a, b); return b[1] }
                   BEGIN { f(1, arr); y = 2; x = 3; z[1] } { w = $1 }";
        let a = resolve_src(src).unwrap();
        let b = resolve_src(src).unwrap();
        assert_eq!(a.dump(), b.dump());
        assert_eq!(a.scalar_names(), b.scalar_names());
        assert_eq!(a.array_names(), b.array_names());
    }

    #[test]
    fn test_dump_format() {
        let r = resolve_src("function f(a) { a[1] } BEGIN { f(x); n = 1 }").unwrap();
        let dump = r.dump();
        assert!(dump.starts_with("globals\n"));
        assert!(dump.contains("  n: scalar 0\n"));
        assert!(dump.contains("function f(a)  # index 0\n  a: array 0\n"));
    }
}
