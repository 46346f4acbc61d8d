//! Lowering from the resolved AST to stack bytecode.

use crate::compiler::ast::*;
use crate::compiler::bytecode::*;
use crate::compiler::resolve::{Kind, ResolvedProgram, Scope, VarInfo};
use crate::compiler::specials::SpecialVar;
use crate::compiler::tokens::Builtin;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LowerError {
    #[error("program too large: {0} exceeds the encodable range")]
    ProgramTooLarge(&'static str),
    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
    #[error("internal error: {name:?} was not resolved")]
    Unresolved { name: String },
}

/// Lower a resolved program into bytecode.
pub fn lower(resolved: &ResolvedProgram, source: &str) -> Result<CompiledProgram, LowerError> {
    let program = &resolved.program;
    let mut lowerer = Lowerer::new(resolved);

    let mut begin = Vec::with_capacity(program.begin.len());
    for block in &program.begin {
        begin.push(lowerer.lower_block(block)?);
    }

    let mut actions = Vec::with_capacity(program.actions.len());
    for action in &program.actions {
        let pattern = match &action.pattern {
            Pattern::All => CompiledPattern::All,
            Pattern::Expr(e) => CompiledPattern::Expr(lowerer.lower_pattern(e)?),
            Pattern::Range(start, stop) => {
                CompiledPattern::Range(lowerer.lower_pattern(start)?, lowerer.lower_pattern(stop)?)
            }
        };
        let body = match &action.body {
            Some(b) => Some(lowerer.lower_block(b)?),
            None => None,
        };
        actions.push(CompiledAction { pattern, body });
    }

    let mut end = Vec::with_capacity(program.end.len());
    for block in &program.end {
        end.push(lowerer.lower_block(block)?);
    }

    // Functions are stored by resolver index, which is definition order
    let mut functions = Vec::with_capacity(program.functions.len());
    for function in &program.functions {
        let info = resolved
            .lookup_func(&function.name)
            .ok_or_else(|| LowerError::Unresolved {
                name: function.name.clone(),
            })?;
        lowerer.func = function.name.clone();
        let body = lowerer.lower_block(&function.body)?;
        lowerer.func.clear();
        let num_arrays = info.arrays.iter().filter(|a| **a).count();
        functions.push(CompiledFunction {
            name: function.name.clone(),
            params: function.params.clone(),
            arrays: info.arrays.clone(),
            num_scalars: info.params.len() - num_arrays,
            num_arrays,
            body,
        });
    }

    debug!(
        begin = begin.len(),
        actions = actions.len(),
        end = end.len(),
        functions = functions.len(),
        ops = lowerer.total_ops,
        "lowered program"
    );

    Ok(CompiledProgram {
        begin,
        actions,
        end,
        functions,
        nums: lowerer.nums,
        strs: lowerer.strs,
        regexes: lowerer.regexes,
        scalar_names: resolved.scalar_names(),
        array_names: resolved.array_names(),
        native_names: resolved.native_names(),
        source_hash: format!("sha256:{:x}", Sha256::digest(source.as_bytes())),
    })
}

/// Tracks a loop for break/continue patching
struct LoopContext {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
    for_in: bool,
}

struct Lowerer<'a> {
    resolved: &'a ResolvedProgram,
    /// Enclosing function, "" at top level
    func: String,
    code: Vec<Op>,
    loop_stack: Vec<LoopContext>,
    nums: Vec<f64>,
    num_indices: HashMap<u64, u32>,
    strs: Vec<String>,
    str_indices: HashMap<String, u32>,
    regexes: Vec<String>,
    regex_indices: HashMap<String, u32>,
    total_ops: usize,
}

fn pool_index(len: usize) -> Result<u32, LowerError> {
    u32::try_from(len).map_err(|_| LowerError::ProgramTooLarge("constant pool"))
}

/// Whole numbers in i64 range print, and so key arrays, as integers.
fn is_integral(n: f64) -> bool {
    n.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(&n)
}

impl<'a> Lowerer<'a> {
    fn new(resolved: &'a ResolvedProgram) -> Self {
        Self {
            resolved,
            func: String::new(),
            code: Vec::new(),
            loop_stack: Vec::new(),
            nums: Vec::new(),
            num_indices: HashMap::new(),
            strs: Vec::new(),
            str_indices: HashMap::new(),
            regexes: Vec::new(),
            regex_indices: HashMap::new(),
            total_ops: 0,
        }
    }

    fn lower_block(&mut self, block: &[Stmt]) -> Result<Vec<Op>, LowerError> {
        let saved = std::mem::take(&mut self.code);
        let result = self.stmts(block);
        let code = std::mem::replace(&mut self.code, saved);
        result?;
        self.total_ops += code.len();
        Ok(code)
    }

    fn lower_pattern(&mut self, expr: &Expr) -> Result<Vec<Op>, LowerError> {
        let saved = std::mem::take(&mut self.code);
        let result = self.expr(expr);
        let code = std::mem::replace(&mut self.code, saved);
        result?;
        self.total_ops += code.len();
        Ok(code)
    }

    // ── Constant pools ──

    fn num(&mut self, n: f64) -> Result<(), LowerError> {
        let index = match self.num_indices.get(&n.to_bits()) {
            Some(&i) => i,
            None => {
                let i = pool_index(self.nums.len())?;
                self.nums.push(n);
                self.num_indices.insert(n.to_bits(), i);
                i
            }
        };
        self.code.push(Op::Num(index));
        Ok(())
    }

    fn str(&mut self, s: &str) -> Result<(), LowerError> {
        let index = match self.str_indices.get(s) {
            Some(&i) => i,
            None => {
                let i = pool_index(self.strs.len())?;
                self.strs.push(s.to_string());
                self.str_indices.insert(s.to_string(), i);
                i
            }
        };
        self.code.push(Op::Str(index));
        Ok(())
    }

    fn regex(&mut self, source: &str) -> Result<(), LowerError> {
        let index = match self.regex_indices.get(source) {
            Some(&i) => i,
            None => {
                regex::Regex::new(&format!("(?s:{})", source)).map_err(|e| {
                    LowerError::InvalidRegex {
                        pattern: source.to_string(),
                        message: e.to_string(),
                    }
                })?;
                let i = pool_index(self.regexes.len())?;
                self.regexes.push(source.to_string());
                self.regex_indices.insert(source.to_string(), i);
                i
            }
        };
        self.code.push(Op::Regex(index));
        Ok(())
    }

    // ── Jumps ──

    /// Emit a jump with a placeholder offset; returns its address.
    fn jump_forward(&mut self, op: fn(i32) -> Op) -> usize {
        self.code.push(op(0));
        self.code.len() - 1
    }

    /// Point the jump at `at` to the next instruction to be emitted.
    fn patch_forward(&mut self, at: usize) -> Result<(), LowerError> {
        let offset = i32::try_from(self.code.len() - at - 1)
            .map_err(|_| LowerError::ProgramTooLarge("jump offset"))?;
        self.code[at].set_jump_offset(offset);
        Ok(())
    }

    fn jump_back(&mut self, op: fn(i32) -> Op, target: usize) -> Result<(), LowerError> {
        let offset = i32::try_from(target as i64 - (self.code.len() as i64 + 1))
            .map_err(|_| LowerError::ProgramTooLarge("jump offset"))?;
        self.code.push(op(offset));
        Ok(())
    }

    /// Evaluate `cond` and emit a jump taken when its truth equals `when`.
    /// Comparisons fuse into a single compare-and-branch op.
    fn cond_jump(&mut self, cond: &Expr, when: bool) -> Result<fn(i32) -> Op, LowerError> {
        match cond {
            Expr::Binary { left, op, right } if op.is_comparison() => {
                self.expr(left)?;
                self.expr(right)?;
                Ok(compare_jump(*op, when))
            }
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => self.cond_jump(expr, !when),
            _ => {
                self.expr(cond)?;
                Ok(if when { Op::JumpTrue } else { Op::JumpFalse })
            }
        }
    }

    fn patch_loop(&mut self, ctx: LoopContext, continue_at: usize) -> Result<(), LowerError> {
        for j in ctx.break_jumps {
            self.patch_forward(j)?;
        }
        for j in ctx.continue_jumps {
            let offset = i32::try_from(continue_at as i64 - j as i64 - 1)
                .map_err(|_| LowerError::ProgramTooLarge("jump offset"))?;
            self.code[j].set_jump_offset(offset);
        }
        Ok(())
    }

    // ── Names ──

    fn scalar_ref(&self, var: &VarRef) -> Result<ScalarRef, LowerError> {
        let (scope, info) = self.lookup(var)?;
        Ok(match scope {
            Scope::Local => ScalarRef::Local(info.index as u32),
            Scope::Global => ScalarRef::Global(info.index as u32),
            Scope::Special => match SpecialVar::from_name(&var.name) {
                Some(special) => ScalarRef::Special(special),
                None => {
                    return Err(LowerError::Unresolved {
                        name: var.name.clone(),
                    })
                }
            },
        })
    }

    fn array_ref(&self, var: &VarRef) -> Result<ArrayRef, LowerError> {
        match self.lookup(var)? {
            (Scope::Local, info) => Ok(ArrayRef::Local(info.index as u32)),
            (Scope::Global, info) => Ok(ArrayRef::Global(info.index as u32)),
            (Scope::Special, _) => Err(LowerError::Unresolved {
                name: var.name.clone(),
            }),
        }
    }

    fn lookup(&self, var: &VarRef) -> Result<(Scope, VarInfo), LowerError> {
        self.resolved
            .lookup_var(&self.func, &var.name)
            .ok_or_else(|| LowerError::Unresolved {
                name: var.name.clone(),
            })
    }

    fn is_array(&self, var: &VarRef) -> bool {
        matches!(self.lookup(var), Ok((_, info)) if info.kind == Kind::Array)
    }

    // ── Statements ──

    fn stmts(&mut self, stmts: &[Stmt]) -> Result<(), LowerError> {
        stmts.iter().try_for_each(|s| self.stmt(s))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), LowerError> {
        match stmt {
            Stmt::Print { args, redirect } | Stmt::Printf { args, redirect } => {
                for arg in args {
                    self.expr(arg)?;
                }
                let kind = match redirect {
                    None => Redirect::Stdout,
                    Some(r) => {
                        self.expr(&r.dest)?;
                        match r.kind {
                            RedirectKind::File => Redirect::File,
                            RedirectKind::Append => Redirect::Append,
                            RedirectKind::Pipe => Redirect::Pipe,
                        }
                    }
                };
                let num_args = pool_index(args.len())?;
                self.code.push(if matches!(stmt, Stmt::Print { .. }) {
                    Op::Print {
                        num_args,
                        redirect: kind,
                    }
                } else {
                    Op::Printf {
                        num_args,
                        redirect: kind,
                    }
                });
            }

            Stmt::Expr(e) => self.expr_stmt(e)?,

            Stmt::If {
                cond,
                body,
                else_body,
            } => {
                let op = self.cond_jump(cond, false)?;
                let to_else = self.jump_forward(op);
                self.stmts(body)?;
                match else_body {
                    Some(else_body) => {
                        let to_end = self.jump_forward(Op::Jump);
                        self.patch_forward(to_else)?;
                        self.stmts(else_body)?;
                        self.patch_forward(to_end)?;
                    }
                    None => self.patch_forward(to_else)?,
                }
            }

            Stmt::For {
                init,
                cond,
                post,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let exit = match cond {
                    Some(c) => {
                        let op = self.cond_jump(c, false)?;
                        Some(self.jump_forward(op))
                    }
                    None => None,
                };
                let loop_start = self.code.len();
                self.loop_stack.push(LoopContext {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    for_in: false,
                });
                self.stmts(body)?;
                let continue_at = self.code.len();
                if let Some(post) = post {
                    self.stmt(post)?;
                }
                match cond {
                    Some(c) => {
                        let op = self.cond_jump(c, true)?;
                        self.jump_back(op, loop_start)?;
                    }
                    None => self.jump_back(Op::Jump, loop_start)?,
                }
                if let Some(exit) = exit {
                    self.patch_forward(exit)?;
                }
                self.finish_loop(continue_at)?;
            }

            Stmt::While { cond, body } => {
                let op = self.cond_jump(cond, false)?;
                let exit = self.jump_forward(op);
                let loop_start = self.code.len();
                self.loop_stack.push(LoopContext {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    for_in: false,
                });
                self.stmts(body)?;
                let continue_at = self.code.len();
                let op = self.cond_jump(cond, true)?;
                self.jump_back(op, loop_start)?;
                self.patch_forward(exit)?;
                self.finish_loop(continue_at)?;
            }

            Stmt::DoWhile { body, cond } => {
                let loop_start = self.code.len();
                self.loop_stack.push(LoopContext {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    for_in: false,
                });
                self.stmts(body)?;
                let continue_at = self.code.len();
                let op = self.cond_jump(cond, true)?;
                self.jump_back(op, loop_start)?;
                self.finish_loop(continue_at)?;
            }

            Stmt::ForIn { var, array, body } => {
                let var = self.scalar_ref(var)?;
                let array = self.array_ref(array)?;
                let at = self.code.len();
                self.code.push(Op::ForIn {
                    var,
                    array,
                    body_len: 0,
                });
                self.loop_stack.push(LoopContext {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    for_in: true,
                });
                self.stmts(body)?;
                // `continue` ends this key's run of the body
                let continue_at = self.code.len();
                self.finish_loop(continue_at)?;
                let len = pool_index(self.code.len() - at - 1)?;
                if let Op::ForIn { body_len, .. } = &mut self.code[at] {
                    *body_len = len;
                }
            }

            Stmt::Break(_) => {
                let for_in = self.loop_stack.last().is_some_and(|ctx| ctx.for_in);
                if for_in {
                    self.code.push(Op::BreakForIn);
                } else {
                    let j = self.jump_forward(Op::Jump);
                    if let Some(ctx) = self.loop_stack.last_mut() {
                        ctx.break_jumps.push(j);
                    }
                }
            }

            Stmt::Continue(_) => {
                let j = self.jump_forward(Op::Jump);
                if let Some(ctx) = self.loop_stack.last_mut() {
                    ctx.continue_jumps.push(j);
                }
            }

            Stmt::Next(_) => self.code.push(Op::Next),
            Stmt::NextFile(_) => self.code.push(Op::NextFile),

            Stmt::Exit(status) => match status {
                Some(e) => {
                    self.expr(e)?;
                    self.code.push(Op::ExitStatus);
                }
                None => self.code.push(Op::Exit),
            },

            Stmt::Return(value) => match value {
                Some(e) => {
                    self.expr(e)?;
                    self.code.push(Op::Return);
                }
                None => self.code.push(Op::ReturnNull),
            },

            Stmt::Delete { array, index } => {
                let array = self.array_ref(array)?;
                match index {
                    Some(index) => {
                        self.keys(index)?;
                        self.code.push(Op::Delete(array));
                    }
                    None => self.code.push(Op::DeleteAll(array)),
                }
            }

            Stmt::Block(b) => self.stmts(b)?,
        }
        Ok(())
    }

    fn finish_loop(&mut self, continue_at: usize) -> Result<(), LowerError> {
        if let Some(ctx) = self.loop_stack.pop() {
            self.patch_loop(ctx, continue_at)?;
        }
        Ok(())
    }

    /// Expression statements that are assignments store directly instead of
    /// leaving a value to drop.
    fn expr_stmt(&mut self, expr: &Expr) -> Result<(), LowerError> {
        match expr {
            Expr::Assign { target, value } => {
                self.expr(value)?;
                self.assign(target)
            }
            Expr::AugAssign { target, op, value } => {
                self.expr(value)?;
                match target.as_ref() {
                    Expr::Var(v) => {
                        let fused = match self.scalar_ref(v)? {
                            ScalarRef::Global(index) => Op::AugAssignGlobal { op: *op, index },
                            ScalarRef::Local(index) => Op::AugAssignLocal { op: *op, index },
                            ScalarRef::Special(var) => Op::AugAssignSpecial { op: *op, var },
                        };
                        self.code.push(fused);
                    }
                    Expr::Field(index) => {
                        self.expr(index)?;
                        self.code.push(Op::AugAssignField(*op));
                    }
                    Expr::Index { array, index } => {
                        self.keys(index)?;
                        let fused = match self.array_ref(array)? {
                            ArrayRef::Global(index) => Op::AugAssignArrayGlobal { op: *op, index },
                            ArrayRef::Local(index) => Op::AugAssignArrayLocal { op: *op, index },
                        };
                        self.code.push(fused);
                    }
                    _ => {
                        self.code.push(Op::Drop);
                    }
                }
                Ok(())
            }
            Expr::Incr { target, decr, .. } => {
                let amount: i8 = if *decr { -1 } else { 1 };
                match target.as_ref() {
                    Expr::Var(v) => {
                        let fused = match self.scalar_ref(v)? {
                            ScalarRef::Global(index) => Op::IncrGlobal { amount, index },
                            ScalarRef::Local(index) => Op::IncrLocal { amount, index },
                            ScalarRef::Special(var) => Op::IncrSpecial { amount, var },
                        };
                        self.code.push(fused);
                    }
                    Expr::Field(index) => {
                        self.expr(index)?;
                        self.code.push(Op::IncrField(amount));
                    }
                    Expr::Index { array, index } => {
                        self.keys(index)?;
                        let fused = match self.array_ref(array)? {
                            ArrayRef::Global(index) => Op::IncrArrayGlobal { amount, index },
                            ArrayRef::Local(index) => Op::IncrArrayLocal { amount, index },
                        };
                        self.code.push(fused);
                    }
                    other => {
                        self.expr(other)?;
                        self.code.push(Op::Drop);
                    }
                }
                Ok(())
            }
            _ => {
                self.expr(expr)?;
                self.code.push(Op::Drop);
                Ok(())
            }
        }
    }

    /// Store the value on top of the stack into `target`, consuming it.
    fn assign(&mut self, target: &Expr) -> Result<(), LowerError> {
        match target {
            Expr::Var(v) => {
                let op = match self.scalar_ref(v)? {
                    ScalarRef::Global(i) => Op::AssignGlobal(i),
                    ScalarRef::Local(i) => Op::AssignLocal(i),
                    ScalarRef::Special(var) => Op::AssignSpecial(var),
                };
                self.code.push(op);
            }
            Expr::Field(index) => {
                self.expr(index)?;
                self.code.push(Op::AssignField);
            }
            Expr::Index { array, index } => {
                self.keys(index)?;
                let op = match self.array_ref(array)? {
                    ArrayRef::Global(i) => Op::AssignArrayGlobal(i),
                    ArrayRef::Local(i) => Op::AssignArrayLocal(i),
                };
                self.code.push(op);
            }
            _ => self.code.push(Op::Drop),
        }
        Ok(())
    }

    /// Push a single array key, joining multiple subscripts with SUBSEP.
    fn keys(&mut self, index: &[Expr]) -> Result<(), LowerError> {
        match index {
            [Expr::Num(n)] if is_integral(*n) => self.str(&format!("{}", *n as i64)),
            [single] => self.expr(single),
            many => {
                for e in many {
                    self.expr(e)?;
                }
                self.code.push(Op::IndexMulti(pool_index(many.len())?));
                Ok(())
            }
        }
    }

    // ── Expressions ──

    fn expr(&mut self, expr: &Expr) -> Result<(), LowerError> {
        match expr {
            Expr::Num(n) => self.num(*n)?,
            Expr::Str(s) => self.str(s)?,
            Expr::Regex(r) => self.regex(r)?,

            Expr::Field(index) => match index.as_ref() {
                Expr::Num(n) if *n >= 0.0 && n.fract() == 0.0 && *n <= u32::MAX as f64 => {
                    self.code.push(Op::FieldInt(*n as u32));
                }
                other => {
                    self.expr(other)?;
                    self.code.push(Op::Field);
                }
            },

            Expr::Var(v) => {
                let op = match self.scalar_ref(v)? {
                    ScalarRef::Global(i) => Op::Global(i),
                    ScalarRef::Local(i) => Op::Local(i),
                    ScalarRef::Special(var) => Op::Special(var),
                };
                self.code.push(op);
            }

            Expr::Index { array, index } => {
                self.keys(index)?;
                let op = match self.array_ref(array)? {
                    ArrayRef::Global(i) => Op::ArrayGlobal(i),
                    ArrayRef::Local(i) => Op::ArrayLocal(i),
                };
                self.code.push(op);
            }

            Expr::Assign { target, value } => {
                self.expr(value)?;
                self.code.push(Op::Dupe);
                self.assign(target)?;
            }

            Expr::AugAssign { target, op, value } => {
                self.read_modify_write(target, |this| {
                    this.expr(value)?;
                    this.code.push(aug_op(*op));
                    Ok(())
                }, false)?;
            }

            Expr::Incr { target, decr, pre } => {
                let step = if *decr { Op::Subtract } else { Op::Add };
                self.read_modify_write(target, |this| {
                    this.num(1.0)?;
                    this.code.push(step);
                    Ok(())
                }, !*pre)?;
            }

            Expr::Unary { op, expr } => {
                self.expr(expr)?;
                self.code.push(match op {
                    UnaryOp::Minus => Op::UnaryMinus,
                    UnaryOp::Plus => Op::UnaryPlus,
                    UnaryOp::Not => Op::Not,
                });
            }

            Expr::Binary {
                left,
                op: op @ (BinaryOp::And | BinaryOp::Or),
                right,
            } => {
                self.expr(left)?;
                self.code.push(Op::Dupe);
                let short = self.jump_forward(if *op == BinaryOp::And {
                    Op::JumpFalse
                } else {
                    Op::JumpTrue
                });
                self.code.push(Op::Drop);
                self.expr(right)?;
                self.patch_forward(short)?;
                self.code.push(Op::Boolean);
            }

            Expr::Binary {
                op: BinaryOp::Concat,
                ..
            } => {
                let mut operands = Vec::new();
                concat_operands(expr, &mut operands);
                for operand in &operands {
                    self.expr(operand)?;
                }
                if operands.len() == 2 {
                    self.code.push(Op::Concat);
                } else {
                    self.code.push(Op::ConcatMulti(pool_index(operands.len())?));
                }
            }

            Expr::Binary { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.code.push(binary_op(*op));
            }

            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                let op = self.cond_jump(cond, false)?;
                let to_else = self.jump_forward(op);
                self.expr(then)?;
                let to_end = self.jump_forward(Op::Jump);
                self.patch_forward(to_else)?;
                self.expr(otherwise)?;
                self.patch_forward(to_end)?;
            }

            Expr::In { index, array } => {
                self.keys(index)?;
                let op = match self.array_ref(array)? {
                    ArrayRef::Global(i) => Op::InGlobal(i),
                    ArrayRef::Local(i) => Op::InLocal(i),
                };
                self.code.push(op);
            }

            Expr::Call { func, args, .. } => self.builtin(*func, args)?,

            Expr::UserCall { name, args, .. } => self.user_call(name, args)?,

            Expr::Getline { source, target } => {
                let kind = match source {
                    GetlineSource::Main => GetlineKind::Main,
                    GetlineSource::File(e) => {
                        self.expr(e)?;
                        GetlineKind::File
                    }
                    GetlineSource::Command(e) => {
                        self.expr(e)?;
                        GetlineKind::Command
                    }
                };
                let op = match target.as_deref() {
                    None => Op::Getline(kind),
                    Some(Expr::Var(v)) => Op::GetlineVar {
                        kind,
                        var: self.scalar_ref(v)?,
                    },
                    Some(Expr::Field(index)) => {
                        self.expr(index)?;
                        Op::GetlineField(kind)
                    }
                    Some(Expr::Index { array, index }) => {
                        self.keys(index)?;
                        Op::GetlineArray {
                            kind,
                            array: self.array_ref(array)?,
                        }
                    }
                    Some(_) => Op::Getline(kind),
                };
                self.code.push(op);
            }
        }
        Ok(())
    }

    /// Expression form of `x op= v`, `++x` and `x++`. Field and element keys
    /// are evaluated once; `Rote` moves the key above the new value for the
    /// store. With `keep_old` the expression yields the numeric old value.
    fn read_modify_write(
        &mut self,
        target: &Expr,
        modify: impl FnOnce(&mut Self) -> Result<(), LowerError>,
        keep_old: bool,
    ) -> Result<(), LowerError> {
        let (fetch, store) = match target {
            Expr::Var(v) => {
                let (fetch, store) = match self.scalar_ref(v)? {
                    ScalarRef::Global(i) => (Op::Global(i), Op::AssignGlobal(i)),
                    ScalarRef::Local(i) => (Op::Local(i), Op::AssignLocal(i)),
                    ScalarRef::Special(var) => (Op::Special(var), Op::AssignSpecial(var)),
                };
                self.code.push(fetch);
                if keep_old {
                    self.code.extend([Op::UnaryPlus, Op::Dupe]);
                }
                modify(self)?;
                if !keep_old {
                    self.code.push(Op::Dupe);
                }
                self.code.push(store);
                return Ok(());
            }
            Expr::Field(index) => {
                self.expr(index)?;
                (Op::Field, Op::AssignField)
            }
            Expr::Index { array, index } => {
                self.keys(index)?;
                match self.array_ref(array)? {
                    ArrayRef::Global(i) => (Op::ArrayGlobal(i), Op::AssignArrayGlobal(i)),
                    ArrayRef::Local(i) => (Op::ArrayLocal(i), Op::AssignArrayLocal(i)),
                }
            }
            other => return self.expr(other),
        };
        // [key] -> [key, old]
        self.code.extend([Op::Dupe, fetch]);
        if keep_old {
            // [key, old, old] -> [key, old, new] -> [old, new, key]
            self.code.extend([Op::UnaryPlus, Op::Dupe]);
            modify(self)?;
        } else {
            // [key, new, new] -> [new, new, key]
            modify(self)?;
            self.code.push(Op::Dupe);
        }
        self.code.extend([Op::Rote, store]);
        Ok(())
    }

    fn builtin(&mut self, func: Builtin, args: &[Expr]) -> Result<(), LowerError> {
        match (func, args) {
            (Builtin::Length, [Expr::Var(v)]) if self.is_array(v) => {
                let array = self.array_ref(v)?;
                self.code.push(Op::CallLengthArray(array));
            }
            (Builtin::Split, [s, Expr::Var(v), rest @ ..]) => {
                self.expr(s)?;
                for sep in rest {
                    self.expr(sep)?;
                }
                let array = self.array_ref(v)?;
                self.code.push(Op::CallSplit {
                    array,
                    sep: !rest.is_empty(),
                });
            }
            (Builtin::Sub | Builtin::Gsub, [pattern, repl, target @ ..]) => {
                self.expr(pattern)?;
                self.expr(repl)?;
                let record = Expr::Field(Box::new(Expr::Num(0.0)));
                let target = target.first().unwrap_or(&record);
                self.expr(target)?;
                self.code.push(Op::CallSub {
                    global: func == Builtin::Gsub,
                });
                // [new, count]: the target is stored only if something was
                // replaced, so an unchanged field does not rebuild $0
                self.code.push(Op::Dupe);
                let changed = self.jump_forward(Op::JumpTrue);
                self.code.extend([Op::Swap, Op::Drop]);
                let done = self.jump_forward(Op::Jump);
                self.patch_forward(changed)?;
                self.code.push(Op::Swap);
                self.assign(target)?;
                self.patch_forward(done)?;
            }
            _ => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.code.push(Op::CallBuiltin {
                    func,
                    num_args: pool_index(args.len())?,
                });
            }
        }
        Ok(())
    }

    fn user_call(&mut self, name: &str, args: &[Expr]) -> Result<(), LowerError> {
        let info = self
            .resolved
            .lookup_func(name)
            .ok_or_else(|| LowerError::Unresolved {
                name: name.to_string(),
            })?;
        let func = pool_index(info.index)?;

        if info.native {
            for arg in args {
                self.expr(arg)?;
            }
            self.code.push(Op::CallNative {
                func,
                num_args: pool_index(args.len())?,
            });
            return Ok(());
        }

        let mut array_args = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            if info.arrays.get(i).copied().unwrap_or(false) {
                if let Expr::Var(v) = arg {
                    array_args.push(self.array_ref(v)?);
                }
            } else {
                self.expr(arg)?;
            }
        }
        let missing_scalars = info
            .arrays
            .iter()
            .skip(args.len())
            .filter(|is_array| !**is_array)
            .count();
        if missing_scalars > 0 {
            self.code.push(Op::Nulls(pool_index(missing_scalars)?));
        }
        self.code.push(Op::CallUser {
            func,
            num_array_args: pool_index(array_args.len())?,
        });
        self.code
            .extend(array_args.into_iter().map(Op::ArrayArg));
        Ok(())
    }
}

/// Flatten a left-leaning chain of concatenations.
fn concat_operands<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::Concat,
            right,
        } => {
            concat_operands(left, out);
            out.push(right);
        }
        other => out.push(other),
    }
}

fn binary_op(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Subtract,
        BinaryOp::Mul => Op::Multiply,
        BinaryOp::Div => Op::Divide,
        BinaryOp::Mod => Op::Modulo,
        BinaryOp::Pow => Op::Power,
        BinaryOp::Concat => Op::Concat,
        BinaryOp::Equals => Op::Equals,
        BinaryOp::NotEquals => Op::NotEquals,
        BinaryOp::Less => Op::Less,
        BinaryOp::LessOrEqual => Op::LessOrEqual,
        BinaryOp::Greater => Op::Greater,
        BinaryOp::GreaterOrEqual => Op::GreaterOrEqual,
        BinaryOp::Match => Op::Match,
        BinaryOp::NotMatch => Op::NotMatch,
        // Short-circuit ops are lowered with jumps before reaching here
        BinaryOp::And | BinaryOp::Or => Op::Boolean,
    }
}

fn aug_op(op: AugOp) -> Op {
    match op {
        AugOp::Add => Op::Add,
        AugOp::Sub => Op::Subtract,
        AugOp::Mul => Op::Multiply,
        AugOp::Div => Op::Divide,
        AugOp::Mod => Op::Modulo,
        AugOp::Pow => Op::Power,
    }
}

/// Compare-and-branch op taken when `left op right` is `when`.
fn compare_jump(op: BinaryOp, when: bool) -> fn(i32) -> Op {
    match (op, when) {
        (BinaryOp::Equals, true) | (BinaryOp::NotEquals, false) => Op::JumpEquals,
        (BinaryOp::NotEquals, true) | (BinaryOp::Equals, false) => Op::JumpNotEquals,
        (BinaryOp::Less, true) | (BinaryOp::GreaterOrEqual, false) => Op::JumpLess,
        (BinaryOp::GreaterOrEqual, true) | (BinaryOp::Less, false) => Op::JumpGreaterOrEqual,
        (BinaryOp::Greater, true) | (BinaryOp::LessOrEqual, false) => Op::JumpGreater,
        (BinaryOp::LessOrEqual, true) | (BinaryOp::Greater, false) => Op::JumpLessOrEqual,
        _ => {
            if when {
                Op::JumpTrue
            } else {
                Op::JumpFalse
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::lex;
    use crate::compiler::parser::parse;
    use crate::compiler::resolve::resolve;

    fn compile_src(src: &str) -> CompiledProgram {
        let program = parse(lex(src).unwrap()).unwrap();
        let resolved = resolve(program, &[]).unwrap();
        lower(&resolved, src).unwrap()
    }

    fn begin_ops(src: &str) -> Vec<Op> {
        compile_src(src).begin.remove(0)
    }

    /// Walk every jump and check it lands inside the block.
    fn assert_jumps_in_range(code: &[Op]) {
        for (pc, op) in code.iter().enumerate() {
            if let Some(offset) = op.jump_offset() {
                let target = pc as i64 + 1 + offset as i64;
                assert!(
                    (0..=code.len() as i64).contains(&target),
                    "jump at {} to {} out of range",
                    pc,
                    target
                );
            }
        }
    }

    #[test]
    fn test_assignment_statement_is_fused() {
        let ops = begin_ops("BEGIN { x = 1 }");
        assert_eq!(ops, vec![Op::Num(0), Op::AssignGlobal(0)]);
    }

    #[test]
    fn test_assignment_expression_keeps_value() {
        let ops = begin_ops("BEGIN { print x = 1 }");
        assert_eq!(
            ops,
            vec![
                Op::Num(0),
                Op::Dupe,
                Op::AssignGlobal(0),
                Op::Print {
                    num_args: 1,
                    redirect: Redirect::Stdout
                }
            ]
        );
    }

    #[test]
    fn test_increment_statements_are_fused() {
        let ops = begin_ops("BEGIN { x++; --x; a[\"k\"]++; $2 += 3; NR-- }");
        let incr = |amount, index| Op::IncrGlobal { amount, index };
        assert_eq!(ops[0], incr(1, 0));
        assert_eq!(ops[1], incr(-1, 0));
        assert!(ops.contains(&Op::IncrArrayGlobal {
            amount: 1,
            index: 2
        }));
        assert!(ops.contains(&Op::AugAssignField(AugOp::Add)));
        assert!(ops.contains(&Op::IncrSpecial {
            amount: -1,
            var: SpecialVar::Nr
        }));
        assert!(!ops.contains(&Op::Drop));
    }

    #[test]
    fn test_condition_fusion() {
        let ops = begin_ops("BEGIN { if (x < 3) y = 1 }");
        assert_eq!(ops[0], Op::Global(0));
        assert_eq!(ops[1], Op::Num(0));
        assert_eq!(ops[2], Op::JumpGreaterOrEqual(2));
        assert!(!ops.contains(&Op::Less));
    }

    #[test]
    fn test_if_else_jumps() {
        let ops = begin_ops("BEGIN { if (x) y = 1; else y = 2 }");
        // Global x, JumpFalse, Num, Assign, Jump, Num, Assign
        assert_eq!(ops[1], Op::JumpFalse(3));
        assert_eq!(ops[4], Op::Jump(2));
        assert_jumps_in_range(&ops);
    }

    #[test]
    fn test_while_loop_jumps_back() {
        let ops = begin_ops("BEGIN { while (i < 10) i++ }");
        // Global, Num, JumpGreaterOrEqual, IncrGlobal, Global, Num, JumpLess(-4)
        assert_eq!(ops.len(), 7);
        assert_eq!(ops[2], Op::JumpGreaterOrEqual(4));
        assert_eq!(ops[6], Op::JumpLess(-4));
    }

    #[test]
    fn test_break_and_continue_targets() {
        let src = "BEGIN { for (i = 0; i < 3; i++) {
                       for (j = 0; j < 3; j++) { if (j == 1) break; if (j == 2) continue; s++ } } }";
        let ops = begin_ops(src);
        assert_jumps_in_range(&ops);
        assert!(!ops.contains(&Op::BreakForIn));
    }

    #[test]
    fn test_for_in_body_inline() {
        let ops = begin_ops("BEGIN { for (k in a) { if (k == 1) break; n++ } }");
        let Op::ForIn { body_len, .. } = ops[0] else {
            panic!("expected ForIn, got {:?}", ops[0]);
        };
        assert_eq!(body_len as usize, ops.len() - 1);
        assert!(ops.contains(&Op::BreakForIn));
        assert_jumps_in_range(&ops[1..]);
    }

    #[test]
    fn test_multi_index_and_constant_key() {
        let ops = begin_ops("BEGIN { a[1, x] = 2; b[1] = 3 }");
        assert!(ops.contains(&Op::IndexMulti(2)));
        let prog = compile_src("BEGIN { b[1] = 3 }");
        assert!(prog.strs.contains(&"1".to_string()));
        let prog = compile_src("BEGIN { b[1e16] = 3; c[1152921504606846976] = 4 }");
        assert!(prog.strs.contains(&"10000000000000000".to_string()));
        assert!(prog.strs.contains(&"1152921504606846976".to_string()));
    }

    #[test]
    fn test_is_integral() {
        assert!(is_integral(-3.0));
        assert!(is_integral(1e18));
        assert!(!is_integral(0.5));
        assert!(!is_integral(1e19));
        assert!(!is_integral(f64::NAN));
    }

    #[test]
    fn test_concat_chain() {
        let ops = begin_ops("BEGIN { s = a b c d }");
        assert!(ops.contains(&Op::ConcatMulti(4)));
        let ops = begin_ops("BEGIN { s = a b }");
        assert!(ops.contains(&Op::Concat));
    }

    #[test]
    fn test_constant_field() {
        let ops = begin_ops("BEGIN { print $3, $i }");
        assert_eq!(ops[0], Op::FieldInt(3));
        assert_eq!(ops[2], Op::Field);
    }

    #[test]
    fn test_constant_pools_deduplicate() {
        let src = "BEGIN { x = 1; y = 1; s = \"a\"; t = \"a\" } /re/ { } /re/ { }";
        let prog = compile_src(src);
        assert_eq!(prog.nums, vec![1.0]);
        assert_eq!(prog.strs, vec!["a".to_string()]);
        assert_eq!(prog.regexes, vec!["re".to_string()]);
    }

    #[test]
    fn test_invalid_regex_is_compile_error() {
        let program = parse(lex("/a(/ { print }").unwrap()).unwrap();
        let resolved = resolve(program, &[]).unwrap();
        assert!(matches!(
            lower(&resolved, "").unwrap_err(),
            LowerError::InvalidRegex { .. }
        ));
    }

    #[test]
    fn test_user_call_array_args() {
        let prog = compile_src("function f(a, n, extra) { a[n] = 1 } BEGIN { f(x, 2) }");
        assert_eq!(
            prog.begin[0],
            vec![
                Op::Num(0),
                Op::Nulls(1),
                Op::CallUser {
                    func: 0,
                    num_array_args: 1
                },
                Op::ArrayArg(ArrayRef::Global(2)),
                Op::Drop,
            ]
        );
        let f = &prog.functions[0];
        assert_eq!(f.arrays, vec![true, false, false]);
        assert_eq!((f.num_scalars, f.num_arrays), (2, 1));
        assert_eq!(f.body.last(), Some(&Op::AssignArrayLocal(0)));
    }

    #[test]
    fn test_logical_ops_short_circuit() {
        let ops = begin_ops("BEGIN { x = a && b }");
        assert_eq!(
            ops,
            vec![
                Op::Global(0),
                Op::Dupe,
                Op::JumpFalse(2),
                Op::Drop,
                Op::Global(1),
                Op::Boolean,
                Op::AssignGlobal(2),
            ]
        );
    }

    #[test]
    fn test_incr_expression_on_element() {
        let ops = begin_ops("BEGIN { print a[k]++ }");
        assert_eq!(
            ops[..7],
            [
                Op::Global(0),
                Op::Dupe,
                Op::ArrayGlobal(2),
                Op::UnaryPlus,
                Op::Dupe,
                Op::Num(0),
                Op::Add,
            ]
        );
        assert_eq!(ops[7..9], [Op::Rote, Op::AssignArrayGlobal(2)]);
    }

    #[test]
    fn test_gsub_assigns_target() {
        let ops = begin_ops("BEGIN { n = gsub(/a/, \"b\", s) }");
        let at = ops
            .iter()
            .position(|op| *op == Op::CallSub { global: true })
            .unwrap();
        assert_eq!(
            ops[at + 1..at + 6],
            [Op::Dupe, Op::JumpTrue(3), Op::Swap, Op::Drop, Op::Jump(2)]
        );
        assert_eq!(ops[at + 6], Op::Swap);
        assert!(matches!(ops[at + 7], Op::AssignGlobal(_)));
    }

    #[test]
    fn test_source_hash() {
        let prog = compile_src("BEGIN { }");
        assert!(prog.source_hash.starts_with("sha256:"));
        assert_eq!(prog.source_hash.len(), "sha256:".len() + 64);
    }
}
