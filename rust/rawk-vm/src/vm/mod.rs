//! Stack VM dispatch loop for executing rawk bytecode.

pub mod fields;
pub mod format;
mod intrinsics;
pub mod io;
mod ops;
pub mod regex_cache;

use crate::config::VmConfig;
use crate::values::{compare, Value};
use fields::{FieldSep, Record, RecordSep, MAX_FIELD};
use format::FormatError;
use io::{IoState, Sink};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rawk_compiler::bytecode::*;
use rawk_compiler::compiler::ast::AugOp;
use rawk_compiler::compiler::specials::SpecialVar;
use regex::Regex;
use regex_cache::RegexCache;
use std::collections::HashMap;
use std::io::{BufWriter, Read, Write};
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("division by zero in mod")]
    DivisionByZeroMod,
    #[error("calling {name:?} exceeded maximum call depth of {max}")]
    CallDepthExceeded { name: String, max: usize },
    #[error("field index {0} out of range")]
    FieldIndex(f64),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("{0}")]
    Format(#[from] FormatError),
    #[error("{0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
    #[error("native function {name:?}: {message}")]
    NativeFunction { name: String, message: String },
    #[error("command execution is disabled: {0:?}")]
    NoExec(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// How a block of code finished. Everything but `Normal` is a signal that
/// travels up to the construct that absorbs it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Completion {
    Normal,
    /// Absorbed by the record loop
    Next,
    NextFile,
    /// Absorbed by the driver, which still runs END
    Exit,
    /// Absorbed by the call site
    Return(Value),
    /// Absorbed by the enclosing `ForIn`
    BreakForIn,
}

/// Result of evaluating a pattern.
enum Test {
    Match(bool),
    Signal(Completion),
}

/// Values of the special variables other than NF, which lives in the record.
#[derive(Debug, Clone)]
pub(crate) struct Specials {
    pub(crate) fs: String,
    pub(crate) ofs: String,
    pub(crate) ors: String,
    pub(crate) rs: String,
    pub(crate) subsep: String,
    pub(crate) convfmt: String,
    pub(crate) ofmt: String,
    pub(crate) filename: String,
    pub(crate) rt: String,
    pub(crate) nr: f64,
    pub(crate) fnr: f64,
    pub(crate) rstart: f64,
    pub(crate) rlength: f64,
    pub(crate) argc: f64,
}

impl Default for Specials {
    fn default() -> Self {
        Self {
            fs: " ".into(),
            ofs: " ".into(),
            ors: "\n".into(),
            rs: "\n".into(),
            subsep: "\x1c".into(),
            convfmt: "%.6g".into(),
            ofmt: "%.6g".into(),
            filename: String::new(),
            rt: String::new(),
            nr: 0.0,
            fnr: 0.0,
            rstart: 0.0,
            rlength: -1.0,
            argc: 0.0,
        }
    }
}

/// A host function callable from the program.
pub type NativeFn = Box<dyn FnMut(&[Value]) -> Result<Value, String>>;

pub(crate) type Array = HashMap<String, Value>;

pub struct VM {
    pub(crate) program: Arc<CompiledProgram>,
    pub(crate) config: VmConfig,
    /// Operand stack; a function's scalar locals are a window onto it
    pub(crate) stack: Vec<Value>,
    pub(crate) frame_base: usize,
    pub(crate) globals: Vec<Value>,
    /// Global arrays first, then arrays created for unsupplied array
    /// parameters of active calls
    pub(crate) arrays: Vec<Array>,
    /// Per active call: the `arrays` slot bound to each array parameter
    pub(crate) frames: Vec<Vec<usize>>,
    pub(crate) specials: Specials,
    pub(crate) record: Record,
    pub(crate) record_sep: RecordSep,
    pub(crate) regex_cache: RegexCache,
    /// Program regex constants, compiled up front
    pub(crate) regexes: Vec<Regex>,
    pub(crate) io: IoState,
    pub(crate) output: Sink,
    pub(crate) natives: Vec<Option<NativeFn>>,
    pub(crate) rng: StdRng,
    pub(crate) seed: f64,
    pub(crate) range_active: Vec<bool>,
    pub(crate) exit_status: i32,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) ticks: u32,
    pub(crate) args: Vec<String>,
}

impl VM {
    pub fn new(program: Arc<CompiledProgram>, config: VmConfig) -> Result<Self, VmError> {
        let regexes = program
            .regexes
            .iter()
            .map(|source| regex_cache::compile(source))
            .collect::<Result<Vec<_>, _>>()?;
        let natives = program.native_names.iter().map(|_| None).collect();
        let mut vm = Self {
            program,
            config,
            stack: Vec::new(),
            frame_base: 0,
            globals: Vec::new(),
            arrays: Vec::new(),
            frames: Vec::new(),
            specials: Specials::default(),
            record: Record::new(),
            record_sep: RecordSep::default(),
            regex_cache: RegexCache::new(),
            regexes,
            io: IoState::default(),
            output: Sink::Stdout(BufWriter::new(std::io::stdout())),
            natives,
            rng: StdRng::seed_from_u64(0),
            seed: 0.0,
            range_active: Vec::new(),
            exit_status: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            ticks: 0,
            args: Vec::new(),
        };
        vm.reset()?;
        Ok(vm)
    }

    // ── Host API ──

    /// Set the operands (files and `var=value` assignments), which become
    /// `ARGV[1]` onwards.
    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
        self.init_argv();
    }

    /// Read standard input from `input` instead of the process stdin.
    pub fn set_stdin(&mut self, input: impl Read + 'static) {
        self.io.stdin = Some(Box::new(input));
    }

    pub fn set_output(&mut self, output: impl Write + 'static) {
        self.output = Sink::Writer(Box::new(output));
    }

    /// Collect output in memory; see [`VM::take_output`].
    pub fn capture_output(&mut self) {
        self.output = Sink::Captured(Vec::new());
    }

    /// Output collected since the last call, if capturing.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            Sink::Captured(bytes) => String::from_utf8_lossy(&std::mem::take(bytes)).into_owned(),
            _ => String::new(),
        }
    }

    /// Provide the implementation of a native function the program was
    /// compiled against.
    pub fn register_native<F>(&mut self, name: &str, func: F) -> Result<(), VmError>
    where
        F: FnMut(&[Value]) -> Result<Value, String> + 'static,
    {
        let index = self
            .program
            .native_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| VmError::NativeFunction {
                name: name.to_string(),
                message: "not declared when the program was compiled".into(),
            })?;
        self.natives[index] = Some(Box::new(func));
        Ok(())
    }

    /// Setting the flag stops a running program with [`VmError::Cancelled`]
    /// at the next check.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Current value of a global scalar, by name.
    pub fn global(&self, name: &str) -> Option<&Value> {
        let index = self.program.scalar_names.iter().position(|n| n == name)?;
        self.globals.get(index)
    }

    /// Return to the state of a freshly created VM, keeping the program,
    /// configuration, operands, natives and output sink.
    pub fn reset(&mut self) -> Result<(), VmError> {
        self.stack.clear();
        self.frame_base = 0;
        self.frames.clear();
        self.globals = vec![Value::Null; self.program.scalar_names.len()];
        self.arrays = vec![Array::new(); self.program.array_names.len()];
        self.specials = Specials::default();
        self.record = Record::new();
        self.record_sep = RecordSep::default();
        self.io.main = None;
        self.io.next_arg = 1;
        self.io.opened_operand = false;
        self.io.outputs.clear();
        self.io.inputs.clear();
        self.rng = StdRng::seed_from_u64(0);
        self.seed = 0.0;
        self.range_active = vec![false; self.program.actions.len()];
        self.exit_status = 0;
        self.ticks = 0;
        self.cancel.store(false, atomic::Ordering::Relaxed);
        self.init_argv();
        self.init_environ();
        if let Some(fs) = self.config.field_sep.clone() {
            self.set_special(SpecialVar::Fs, Value::Str(io::unescape(&fs)))?;
        }
        let vars: Vec<(String, String)> = self
            .config
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, value) in vars {
            self.assign_command_line(&name, &value)?;
        }
        Ok(())
    }

    /// Run BEGIN, the record loop, then END. Returns the exit status.
    pub fn run(&mut self) -> Result<i32, VmError> {
        let program = Arc::clone(&self.program);
        debug!(
            begin = program.begin.len(),
            actions = program.actions.len(),
            end = program.end.len(),
            source = %program.source_hash,
            "running program"
        );
        let result = self.run_phases(&program);
        // Streams are closed even when the program failed
        let closed = self.close_all();
        result?;
        closed?;
        debug!(status = self.exit_status, "program finished");
        Ok(self.exit_status)
    }

    // ── Driver ──

    fn run_phases(&mut self, program: &CompiledProgram) -> Result<(), VmError> {
        let mut exited = false;
        for block in &program.begin {
            if self.run_block(block)? == Completion::Exit {
                exited = true;
                break;
            }
        }
        if !exited && program.reads_input() {
            debug!("entering record loop");
            self.record_loop(program)?;
        }
        if !program.end.is_empty() {
            debug!(records = self.specials.nr, "running END");
        }
        for block in &program.end {
            if self.run_block(block)? == Completion::Exit {
                break;
            }
        }
        Ok(())
    }

    fn run_block(&mut self, code: &[Op]) -> Result<Completion, VmError> {
        self.stack.clear();
        self.frame_base = 0;
        let completion = self.execute(code)?;
        self.stack.clear();
        Ok(completion)
    }

    fn record_loop(&mut self, program: &CompiledProgram) -> Result<(), VmError> {
        while let Some(record) = self.next_main_record()? {
            self.record.set_line(record);
            for (i, action) in program.actions.iter().enumerate() {
                let test = match &action.pattern {
                    CompiledPattern::All => Test::Match(true),
                    CompiledPattern::Expr(code) => self.test(code)?,
                    CompiledPattern::Range(start, stop) => self.test_range(i, start, stop)?,
                };
                let completion = match test {
                    Test::Match(false) => continue,
                    Test::Signal(signal) => signal,
                    Test::Match(true) => match &action.body {
                        Some(body) => self.run_block(body)?,
                        None => {
                            self.print_record()?;
                            Completion::Normal
                        }
                    },
                };
                match completion {
                    Completion::Next => break,
                    Completion::NextFile => {
                        self.skip_file();
                        break;
                    }
                    Completion::Exit => return Ok(()),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn test(&mut self, code: &[Op]) -> Result<Test, VmError> {
        self.stack.clear();
        self.frame_base = 0;
        Ok(match self.execute(code)? {
            Completion::Normal => Test::Match(self.pop().is_true()),
            signal => Test::Signal(signal),
        })
    }

    /// A range is active from a record matching `start` through the next
    /// record matching `stop`, which may be the same record.
    fn test_range(&mut self, action: usize, start: &[Op], stop: &[Op]) -> Result<Test, VmError> {
        if !self.range_active[action] {
            match self.test(start)? {
                Test::Match(true) => self.range_active[action] = true,
                other => return Ok(other),
            }
        }
        Ok(match self.test(stop)? {
            Test::Match(ended) => {
                if ended {
                    self.range_active[action] = false;
                }
                Test::Match(true)
            }
            signal => signal,
        })
    }

    fn print_record(&mut self) -> Result<(), VmError> {
        let mut line = self.record.line().to_string();
        line.push_str(&self.specials.ors);
        self.write_output(Redirect::Stdout, None, &line)
    }

    // ── Stack ──

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }

    /// Pop the top `n` values, in push order.
    pub(crate) fn pop_n(&mut self, n: u32) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(n as usize);
        self.stack.split_off(at)
    }

    fn tick(&mut self) -> Result<(), VmError> {
        self.ticks += 1;
        if self.ticks >= self.config.cancel_check_interval {
            self.ticks = 0;
            if self.cancel.load(atomic::Ordering::Relaxed) {
                return Err(VmError::Cancelled);
            }
        }
        Ok(())
    }

    // ── Variables ──

    fn local_index(&self, index: u32) -> usize {
        self.frame_base + index as usize
    }

    pub(crate) fn array_slot(&self, array: ArrayRef) -> Result<usize, VmError> {
        match array {
            ArrayRef::Global(i) => Ok(i as usize),
            ArrayRef::Local(i) => self
                .frames
                .last()
                .and_then(|frame| frame.get(i as usize))
                .copied()
                .ok_or_else(|| {
                    VmError::Runtime(format!("array parameter {} outside its function", i))
                }),
        }
    }

    pub(crate) fn array_mut(&mut self, array: ArrayRef) -> Result<&mut Array, VmError> {
        let slot = self.array_slot(array)?;
        self.arrays
            .get_mut(slot)
            .ok_or_else(|| VmError::Runtime(format!("no array in slot {}", slot)))
    }

    pub(crate) fn key(&self, value: Value) -> String {
        value.into_string(&self.specials.convfmt)
    }

    pub(crate) fn set_scalar(&mut self, var: ScalarRef, value: Value) -> Result<(), VmError> {
        match var {
            ScalarRef::Global(i) => self.globals[i as usize] = value,
            ScalarRef::Local(i) => {
                let at = self.local_index(i);
                self.stack[at] = value;
            }
            ScalarRef::Special(var) => self.set_special(var, value)?,
        }
        Ok(())
    }

    pub(crate) fn get_special(&mut self, var: SpecialVar) -> Value {
        let s = &self.specials;
        match var {
            SpecialVar::Nf => Value::Num(self.record.nf() as f64),
            SpecialVar::Nr => Value::Num(s.nr),
            SpecialVar::Fnr => Value::Num(s.fnr),
            SpecialVar::Rstart => Value::Num(s.rstart),
            SpecialVar::Rlength => Value::Num(s.rlength),
            SpecialVar::Argc => Value::Num(s.argc),
            SpecialVar::Fs => Value::Str(s.fs.clone()),
            SpecialVar::Ofs => Value::Str(s.ofs.clone()),
            SpecialVar::Ors => Value::Str(s.ors.clone()),
            SpecialVar::Rs => Value::Str(s.rs.clone()),
            SpecialVar::Subsep => Value::Str(s.subsep.clone()),
            SpecialVar::Convfmt => Value::Str(s.convfmt.clone()),
            SpecialVar::Ofmt => Value::Str(s.ofmt.clone()),
            SpecialVar::Filename => Value::Str(s.filename.clone()),
            SpecialVar::Rt => Value::Str(s.rt.clone()),
        }
    }

    pub(crate) fn set_special(&mut self, var: SpecialVar, value: Value) -> Result<(), VmError> {
        match var {
            SpecialVar::Nf => {
                let n = value.to_num();
                if !(0.0..=MAX_FIELD as f64).contains(&n) {
                    return Err(VmError::FieldIndex(n));
                }
                self.record.set_nf(n as usize, &self.specials.ofs);
            }
            SpecialVar::Nr => self.specials.nr = value.to_num(),
            SpecialVar::Fnr => self.specials.fnr = value.to_num(),
            SpecialVar::Rstart => self.specials.rstart = value.to_num(),
            SpecialVar::Rlength => self.specials.rlength = value.to_num(),
            SpecialVar::Argc => self.specials.argc = value.to_num(),
            SpecialVar::Fs => {
                let fs = self.key(value);
                let sep = FieldSep::new(&fs, &mut self.regex_cache)?;
                self.record.set_field_sep(sep);
                self.specials.fs = fs;
            }
            SpecialVar::Rs => {
                let rs = self.key(value);
                self.record_sep = RecordSep::new(&rs, &mut self.regex_cache)?;
                self.record.set_paragraph(self.record_sep.is_paragraph());
                self.specials.rs = rs;
            }
            SpecialVar::Ofs => self.specials.ofs = self.key(value),
            SpecialVar::Ors => self.specials.ors = self.key(value),
            SpecialVar::Subsep => self.specials.subsep = self.key(value),
            SpecialVar::Convfmt => self.specials.convfmt = self.key(value),
            SpecialVar::Ofmt => self.specials.ofmt = self.key(value),
            SpecialVar::Filename => self.specials.filename = self.key(value),
            SpecialVar::Rt => self.specials.rt = self.key(value),
        }
        Ok(())
    }

    // ── Fields ──

    pub(crate) fn field_index(value: &Value) -> Result<usize, VmError> {
        let n = value.to_num();
        if !(0.0..=MAX_FIELD as f64).contains(&n) {
            return Err(VmError::FieldIndex(n));
        }
        Ok(n as usize)
    }

    /// `$i` as a numeric string; a field past NF is uninitialized.
    pub(crate) fn get_field(&mut self, index: usize) -> Value {
        match self.record.field(index) {
            Some(text) => Value::NumStr(text.to_string()),
            None => Value::Null,
        }
    }

    pub(crate) fn set_field(&mut self, index: usize, value: Value) {
        let text = value.into_string(&self.specials.convfmt);
        self.record.set_field(index, text, &self.specials.ofs);
    }

    // ── ARGV, ENVIRON and command-line assignment ──

    fn named_array(&self, name: &str) -> Option<usize> {
        self.program.array_names.iter().position(|n| n == name)
    }

    fn init_argv(&mut self) {
        self.specials.argc = (self.args.len() + 1) as f64;
        let Some(slot) = self.named_array("ARGV") else {
            return;
        };
        let argv = &mut self.arrays[slot];
        argv.clear();
        argv.insert("0".into(), Value::Str("rawk".into()));
        for (i, arg) in self.args.iter().enumerate() {
            argv.insert((i + 1).to_string(), Value::NumStr(arg.clone()));
        }
    }

    fn init_environ(&mut self) {
        let Some(slot) = self.named_array("ENVIRON") else {
            return;
        };
        let environ: Array = match &self.config.environ {
            Some(vars) => vars
                .iter()
                .map(|(k, v)| (k.clone(), Value::NumStr(v.clone())))
                .collect(),
            None => std::env::vars()
                .map(|(k, v)| (k, Value::NumStr(v)))
                .collect(),
        };
        self.arrays[slot] = environ;
    }

    /// `ARGV[index]` as a string; empty if unset.
    pub(crate) fn argv(&self, index: usize) -> String {
        self.named_array("ARGV")
            .and_then(|slot| self.arrays[slot].get(&index.to_string()))
            .map(|v| v.to_str(&self.specials.convfmt).into_owned())
            .unwrap_or_default()
    }

    /// Apply a `-v` or operand assignment. The value is a numeric string.
    pub(crate) fn assign_command_line(&mut self, name: &str, value: &str) -> Result<(), VmError> {
        let value = Value::NumStr(io::unescape(value));
        if let Some(var) = SpecialVar::from_name(name) {
            return self.set_special(var, value);
        }
        if let Some(i) = self.program.scalar_names.iter().position(|n| n == name) {
            self.globals[i] = value;
        }
        Ok(())
    }

    // ── Execution ──

    /// Run `code` until it falls off the end or raises a signal.
    pub(crate) fn execute(&mut self, code: &[Op]) -> Result<Completion, VmError> {
        let mut pc = 0;
        while let Some(&op) = code.get(pc) {
            pc += 1;
            self.tick()?;
            match op {
                // Stack
                Op::Num(i) => {
                    let n = self.program.nums[i as usize];
                    self.push(Value::Num(n));
                }
                Op::Str(i) => {
                    let s = self.program.strs[i as usize].clone();
                    self.push(Value::Str(s));
                }
                Op::Dupe => {
                    let top = self.stack.last().cloned().unwrap_or_default();
                    self.push(top);
                }
                Op::Drop => {
                    self.pop();
                }
                Op::Swap => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(b);
                    self.push(a);
                }
                Op::Rote => {
                    let len = self.stack.len();
                    if len >= 3 {
                        self.stack[len - 3..].rotate_left(1);
                    }
                }

                // Fetch
                Op::Field => {
                    let index = Self::field_index(&self.pop())?;
                    let value = self.get_field(index);
                    self.push(value);
                }
                Op::FieldInt(i) => {
                    let index = Self::field_index(&Value::Num(i as f64))?;
                    let value = self.get_field(index);
                    self.push(value);
                }
                Op::Global(i) => {
                    let value = self.globals[i as usize].clone();
                    self.push(value);
                }
                Op::Local(i) => {
                    let value = self.stack[self.local_index(i)].clone();
                    self.push(value);
                }
                Op::Special(var) => {
                    let value = self.get_special(var);
                    self.push(value);
                }
                Op::ArrayGlobal(i) => self.fetch_element(ArrayRef::Global(i))?,
                Op::ArrayLocal(i) => self.fetch_element(ArrayRef::Local(i))?,
                Op::InGlobal(i) => self.test_element(ArrayRef::Global(i))?,
                Op::InLocal(i) => self.test_element(ArrayRef::Local(i))?,

                // Store
                Op::AssignField => {
                    let index = Self::field_index(&self.pop())?;
                    let value = self.pop();
                    self.set_field(index, value);
                }
                Op::AssignGlobal(i) => {
                    self.globals[i as usize] = self.pop();
                }
                Op::AssignLocal(i) => {
                    let value = self.pop();
                    let at = self.local_index(i);
                    self.stack[at] = value;
                }
                Op::AssignSpecial(var) => {
                    let value = self.pop();
                    self.set_special(var, value)?;
                }
                Op::AssignArrayGlobal(i) => self.store_element(ArrayRef::Global(i))?,
                Op::AssignArrayLocal(i) => self.store_element(ArrayRef::Local(i))?,
                Op::Delete(array) => {
                    let key = self.pop();
                    let key = self.key(key);
                    self.array_mut(array)?.remove(&key);
                }
                Op::DeleteAll(array) => self.array_mut(array)?.clear(),

                // Fused increments
                Op::IncrField(amount) => {
                    let index = Self::field_index(&self.pop())?;
                    let old = self.get_field(index).to_num();
                    self.set_field(index, Value::Num(old + amount as f64));
                }
                Op::IncrGlobal { amount, index } => {
                    let slot = &mut self.globals[index as usize];
                    *slot = Value::Num(slot.to_num() + amount as f64);
                }
                Op::IncrLocal { amount, index } => {
                    let at = self.local_index(index);
                    let slot = &mut self.stack[at];
                    *slot = Value::Num(slot.to_num() + amount as f64);
                }
                Op::IncrSpecial { amount, var } => {
                    let old = self.get_special(var).to_num();
                    self.set_special(var, Value::Num(old + amount as f64))?;
                }
                Op::IncrArrayGlobal { amount, index } => {
                    self.update_element(ArrayRef::Global(index), |old| Ok(old + amount as f64))?
                }
                Op::IncrArrayLocal { amount, index } => {
                    self.update_element(ArrayRef::Local(index), |old| Ok(old + amount as f64))?
                }

                // Fused augmented assignment
                Op::AugAssignField(op) => {
                    let index = Self::field_index(&self.pop())?;
                    let right = self.pop().to_num();
                    let old = self.get_field(index).to_num();
                    self.set_field(index, Value::Num(ops::aug(op, old, right)?));
                }
                Op::AugAssignGlobal { op, index } => {
                    let right = self.pop().to_num();
                    let slot = &mut self.globals[index as usize];
                    *slot = Value::Num(ops::aug(op, slot.to_num(), right)?);
                }
                Op::AugAssignLocal { op, index } => {
                    let right = self.pop().to_num();
                    let at = self.local_index(index);
                    let slot = &mut self.stack[at];
                    *slot = Value::Num(ops::aug(op, slot.to_num(), right)?);
                }
                Op::AugAssignSpecial { op, var } => {
                    let right = self.pop().to_num();
                    let old = self.get_special(var).to_num();
                    self.set_special(var, Value::Num(ops::aug(op, old, right)?))?;
                }
                Op::AugAssignArrayGlobal { op, index } => {
                    self.aug_element(ArrayRef::Global(index), op)?
                }
                Op::AugAssignArrayLocal { op, index } => {
                    self.aug_element(ArrayRef::Local(index), op)?
                }

                Op::Regex(i) => {
                    let matched = self.regexes[i as usize].is_match(self.record.line());
                    self.push(Value::from_bool(matched));
                }
                Op::IndexMulti(n) => {
                    let parts = self.pop_n(n);
                    let convfmt = &self.specials.convfmt;
                    let key = parts
                        .iter()
                        .map(|v| v.to_str(convfmt))
                        .collect::<Vec<_>>()
                        .join(&self.specials.subsep);
                    self.push(Value::Str(key));
                }
                Op::ConcatMulti(n) => {
                    let parts = self.pop_n(n);
                    let mut out = String::new();
                    for part in &parts {
                        out.push_str(&part.to_str(&self.specials.convfmt));
                    }
                    self.push(Value::Str(out));
                }

                // Binary
                Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Power | Op::Modulo => {
                    let right = self.pop().to_num();
                    let left = self.pop().to_num();
                    self.push(Value::Num(ops::arith(op, left, right)?));
                }
                Op::Equals
                | Op::NotEquals
                | Op::Less
                | Op::Greater
                | Op::LessOrEqual
                | Op::GreaterOrEqual => {
                    let right = self.pop();
                    let left = self.pop();
                    let ord = compare(&left, &right, &self.specials.convfmt);
                    self.push(Value::from_bool(ops::holds(op, ord)));
                }
                Op::Concat => {
                    let right = self.pop();
                    let left = self.pop();
                    let mut out = left.into_string(&self.specials.convfmt);
                    out.push_str(&right.to_str(&self.specials.convfmt));
                    self.push(Value::Str(out));
                }
                Op::Match | Op::NotMatch => {
                    let pattern = self.pop();
                    let text = self.pop();
                    let matched = self.regex_match(&text, &pattern)?;
                    self.push(Value::from_bool(matched == (op == Op::Match)));
                }

                // Unary
                Op::Not => {
                    let v = self.pop();
                    self.push(Value::from_bool(!v.is_true()));
                }
                Op::UnaryMinus => {
                    let n = self.pop().to_num();
                    self.push(Value::Num(-n));
                }
                Op::UnaryPlus => {
                    let n = self.pop().to_num();
                    self.push(Value::Num(n));
                }
                Op::Boolean => {
                    let v = self.pop();
                    self.push(Value::from_bool(v.is_true()));
                }

                // Control flow
                Op::Jump(offset) => pc = jump(pc, offset),
                Op::JumpFalse(offset) => {
                    if !self.pop().is_true() {
                        pc = jump(pc, offset);
                    }
                }
                Op::JumpTrue(offset) => {
                    if self.pop().is_true() {
                        pc = jump(pc, offset);
                    }
                }
                Op::JumpEquals(offset)
                | Op::JumpNotEquals(offset)
                | Op::JumpLess(offset)
                | Op::JumpGreater(offset)
                | Op::JumpLessOrEqual(offset)
                | Op::JumpGreaterOrEqual(offset) => {
                    let right = self.pop();
                    let left = self.pop();
                    let ord = compare(&left, &right, &self.specials.convfmt);
                    if ops::holds(op, ord) {
                        pc = jump(pc, offset);
                    }
                }
                Op::Next => return Ok(Completion::Next),
                Op::NextFile => return Ok(Completion::NextFile),
                Op::Exit => return Ok(Completion::Exit),
                Op::ExitStatus => {
                    self.exit_status = self.pop().to_num() as i32;
                    return Ok(Completion::Exit);
                }
                Op::Return => return Ok(Completion::Return(self.pop())),
                Op::ReturnNull => return Ok(Completion::Return(Value::Null)),
                Op::ForIn {
                    var,
                    array,
                    body_len,
                } => {
                    let end = (pc + body_len as usize).min(code.len());
                    let body = &code[pc..end];
                    pc = end;
                    match self.for_in(var, array, body)? {
                        Completion::Normal => {}
                        signal => return Ok(signal),
                    }
                }
                Op::BreakForIn => return Ok(Completion::BreakForIn),

                // Calls
                Op::CallBuiltin { func, num_args } => {
                    let args = self.pop_n(num_args);
                    let value = self.call_builtin(func, args)?;
                    self.push(value);
                }
                Op::CallLengthArray(array) => {
                    let len = self.array_mut(array)?.len();
                    self.push(Value::Num(len as f64));
                }
                Op::CallSplit { array, sep } => {
                    let sep = if sep { Some(self.pop()) } else { None };
                    let text = self.pop();
                    let count = self.split_into(array, text, sep)?;
                    self.push(Value::Num(count as f64));
                }
                Op::CallSub { global } => {
                    let target = self.pop();
                    let replacement = self.pop();
                    let pattern = self.pop();
                    let (value, count) = self.substitute(&pattern, &replacement, target, global)?;
                    self.push(value);
                    self.push(Value::Num(count as f64));
                }
                Op::CallUser {
                    func,
                    num_array_args,
                } => {
                    let end = (pc + num_array_args as usize).min(code.len());
                    let array_args: Vec<ArrayRef> = code[pc..end]
                        .iter()
                        .filter_map(|op| match op {
                            Op::ArrayArg(array) => Some(*array),
                            _ => None,
                        })
                        .collect();
                    pc = end;
                    match self.call_user(func as usize, &array_args)? {
                        Completion::Normal => {}
                        signal => return Ok(signal),
                    }
                }
                Op::ArrayArg(_) => {}
                Op::CallNative { func, num_args } => {
                    let args = self.pop_n(num_args);
                    let value = self.call_native(func as usize, &args)?;
                    self.push(value);
                }
                Op::Nulls(n) => {
                    let len = self.stack.len() + n as usize;
                    self.stack.resize(len, Value::Null);
                }

                // I/O
                Op::Print { num_args, redirect } => self.print(num_args, redirect)?,
                Op::Printf { num_args, redirect } => self.printf(num_args, redirect)?,
                Op::Getline(kind) => {
                    let name = self.getline_source(kind);
                    let (status, record) = self.getline_read(kind, name.as_deref())?;
                    if let Some(record) = record {
                        self.record.set_line(record);
                    }
                    self.push(Value::Num(status));
                }
                Op::GetlineVar { kind, var } => {
                    let name = self.getline_source(kind);
                    let (status, record) = self.getline_read(kind, name.as_deref())?;
                    if let Some(record) = record {
                        self.set_scalar(var, Value::NumStr(record))?;
                    }
                    self.push(Value::Num(status));
                }
                Op::GetlineField(kind) => {
                    let index = Self::field_index(&self.pop())?;
                    let name = self.getline_source(kind);
                    let (status, record) = self.getline_read(kind, name.as_deref())?;
                    if let Some(record) = record {
                        self.set_field(index, Value::NumStr(record));
                    }
                    self.push(Value::Num(status));
                }
                Op::GetlineArray { kind, array } => {
                    let key = self.pop();
                    let key = self.key(key);
                    let name = self.getline_source(kind);
                    let (status, record) = self.getline_read(kind, name.as_deref())?;
                    if let Some(record) = record {
                        self.array_mut(array)?.insert(key, Value::NumStr(record));
                    }
                    self.push(Value::Num(status));
                }
            }
        }
        Ok(Completion::Normal)
    }

    /// Run `body` once per key present when the loop starts, skipping keys
    /// deleted in the meantime.
    fn for_in(
        &mut self,
        var: ScalarRef,
        array: ArrayRef,
        body: &[Op],
    ) -> Result<Completion, VmError> {
        let keys: Vec<String> = self.array_mut(array)?.keys().cloned().collect();
        for key in keys {
            if !self.array_mut(array)?.contains_key(&key) {
                continue;
            }
            self.set_scalar(var, Value::Str(key))?;
            match self.execute(body)? {
                Completion::Normal => {}
                Completion::BreakForIn => break,
                signal => return Ok(signal),
            }
        }
        Ok(Completion::Normal)
    }

    /// Call a user function whose scalar arguments are on top of the stack.
    /// On normal completion the return value is pushed in their place.
    fn call_user(&mut self, index: usize, array_args: &[ArrayRef]) -> Result<Completion, VmError> {
        let program = Arc::clone(&self.program);
        let function = program
            .functions
            .get(index)
            .ok_or_else(|| VmError::Runtime(format!("unknown function {}", index)))?;
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded {
                name: function.name.clone(),
                max: self.config.max_call_depth,
            });
        }
        let depth = self.frames.len() + 1;
        trace!(function = %function.name, depth, "call");

        let fresh_from = self.arrays.len();
        let mut bound = Vec::with_capacity(function.num_arrays);
        let mut supplied = array_args.iter();
        for _ in 0..function.num_arrays {
            match supplied.next() {
                Some(array) => bound.push(self.array_slot(*array)?),
                None => {
                    self.arrays.push(Array::new());
                    bound.push(self.arrays.len() - 1);
                }
            }
        }

        let base = self.stack.len().saturating_sub(function.num_scalars);
        let saved_base = std::mem::replace(&mut self.frame_base, base);
        self.frames.push(bound);
        let result = self.execute(&function.body);
        self.frames.pop();
        self.arrays.truncate(fresh_from);
        self.stack.truncate(base);
        self.frame_base = saved_base;

        match result? {
            Completion::Return(value) => {
                self.push(value);
                Ok(Completion::Normal)
            }
            Completion::Normal | Completion::BreakForIn => {
                self.push(Value::Null);
                Ok(Completion::Normal)
            }
            signal => Ok(signal),
        }
    }

    fn call_native(&mut self, index: usize, args: &[Value]) -> Result<Value, VmError> {
        let result = match self.natives.get_mut(index).and_then(Option::as_mut) {
            Some(func) => func(args).map_err(Some),
            None => Err(None),
        };
        result.map_err(|message| VmError::NativeFunction {
            name: self
                .program
                .native_names
                .get(index)
                .cloned()
                .unwrap_or_default(),
            message: message.unwrap_or_else(|| "no implementation registered".into()),
        })
    }

    // ── Array elements ──

    fn fetch_element(&mut self, array: ArrayRef) -> Result<(), VmError> {
        let key = self.pop();
        let key = self.key(key);
        let value = self.array_mut(array)?.entry(key).or_default().clone();
        self.push(value);
        Ok(())
    }

    fn test_element(&mut self, array: ArrayRef) -> Result<(), VmError> {
        let key = self.pop();
        let key = self.key(key);
        let present = self.array_mut(array)?.contains_key(&key);
        self.push(Value::from_bool(present));
        Ok(())
    }

    fn store_element(&mut self, array: ArrayRef) -> Result<(), VmError> {
        let key = self.pop();
        let key = self.key(key);
        let value = self.pop();
        self.array_mut(array)?.insert(key, value);
        Ok(())
    }

    fn update_element(
        &mut self,
        array: ArrayRef,
        f: impl FnOnce(f64) -> Result<f64, VmError>,
    ) -> Result<(), VmError> {
        let key = self.pop();
        let key = self.key(key);
        let slot = self.array_mut(array)?.entry(key).or_default();
        *slot = Value::Num(f(slot.to_num())?);
        Ok(())
    }

    fn aug_element(&mut self, array: ArrayRef, op: AugOp) -> Result<(), VmError> {
        let key = self.pop();
        let right = self.pop().to_num();
        self.push(key);
        self.update_element(array, |old| ops::aug(op, old, right))
    }

    // ── Getline and print ──

    /// Pop the file or command name of a getline, if it has one.
    fn getline_source(&mut self, kind: GetlineKind) -> Option<String> {
        match kind {
            GetlineKind::Main => None,
            GetlineKind::File | GetlineKind::Command => {
                let name = self.pop();
                Some(self.key(name))
            }
        }
    }

    fn pop_dest(&mut self, redirect: Redirect) -> Option<String> {
        match redirect {
            Redirect::Stdout => None,
            _ => {
                let dest = self.pop();
                Some(self.key(dest))
            }
        }
    }

    fn print(&mut self, num_args: u32, redirect: Redirect) -> Result<(), VmError> {
        let dest = self.pop_dest(redirect);
        let mut line = if num_args == 0 {
            self.record.line().to_string()
        } else {
            let args = self.pop_n(num_args);
            let mut line = String::new();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    line.push_str(&self.specials.ofs);
                }
                match arg {
                    // Numbers print with OFMT rather than CONVFMT
                    Value::Num(n) => line.push_str(&format::format_number(*n, &self.specials.ofmt)),
                    other => line.push_str(&other.to_str(&self.specials.convfmt)),
                }
            }
            line
        };
        line.push_str(&self.specials.ors);
        self.write_output(redirect, dest.as_deref(), &line)
    }

    fn printf(&mut self, num_args: u32, redirect: Redirect) -> Result<(), VmError> {
        let dest = self.pop_dest(redirect);
        let args = self.pop_n(num_args);
        let Some((format, rest)) = args.split_first() else {
            return Ok(());
        };
        let format = format.to_str(&self.specials.convfmt);
        let text = format::sprintf(&format, rest, &self.specials.convfmt)?;
        self.write_output(redirect, dest.as_deref(), &text)
    }
}

fn jump(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64).max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_for(src: &str) -> VM {
        let program = rawk_compiler::compile(src).unwrap();
        let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
        vm.capture_output();
        vm
    }

    fn run(src: &str) -> String {
        let mut vm = vm_for(src);
        vm.run().unwrap();
        vm.take_output()
    }

    #[test]
    fn test_arithmetic_and_print() {
        assert_eq!(
            run("BEGIN { print 1 + 2 * 3, 7 % 4, 2 ^ 10 }"),
            "7 3 1024\n"
        );
        assert_eq!(run("BEGIN { print 1 / 4 }"), "0.25\n");
    }

    #[test]
    fn test_ofmt_applies_to_printed_numbers() {
        let src = "BEGIN { OFMT = \"%.2f\"; print 3.14159; x = 3.14159 \"\"; print x }";
        assert_eq!(run(src), "3.14\n3.14159\n");
    }

    #[test]
    fn test_fused_ops_on_every_scope() {
        let src = "function f(a, n) { n += 2; n++; a[1] += n; a[1]++; return n }
                   BEGIN { g = 1; g *= 5; g--; $0 = \"1 2\"; $2 += 3; $1++; NR += 2;
                           print g, $0, f(arr), arr[1], NR }";
        assert_eq!(run(src), "4 2 5 3 4 2\n");
    }

    #[test]
    fn test_assignment_expression_value() {
        assert_eq!(
            run("BEGIN { print (x = 5) + 1, x++ + 0, x, ++x, x-- }"),
            "6 5 6 7 7\n"
        );
    }

    #[test]
    fn test_call_depth_limit() {
        let src = "function f(n) { return f(n + 1) } BEGIN { f(0) }";
        let program = rawk_compiler::compile(src).unwrap();
        let config = VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        };
        let mut vm = VM::new(Arc::new(program), config).unwrap();
        vm.capture_output();
        let err = vm.run().unwrap_err();
        assert_eq!(
            err.to_string(),
            "calling \"f\" exceeded maximum call depth of 50"
        );
    }

    #[test]
    fn test_locals_are_stack_windows() {
        let src = "function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2) }
                   BEGIN { print fib(15) }";
        assert_eq!(run(src), "610\n");
    }

    #[test]
    fn test_fresh_local_arrays_do_not_leak() {
        let src = "function f(n, tmp) { tmp[n] = n; if (n > 0) f(n - 1); return length(tmp) }
                   BEGIN { print f(3) }";
        assert_eq!(run(src), "1\n");
    }

    #[test]
    fn test_nf_assignment_and_field_index_errors() {
        assert_eq!(
            run("BEGIN { $0 = \"a b c\"; NF = 2; print; print NF }"),
            "a b\n2\n"
        );
        let mut vm = vm_for("BEGIN { print $(-1) }");
        assert!(matches!(vm.run(), Err(VmError::FieldIndex(_))));
    }

    #[test]
    fn test_cancel_flag_stops_run() {
        let program = rawk_compiler::compile("BEGIN { while (1) x++ }").unwrap();
        let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
        let handle = vm.cancel_handle();
        handle.store(true, atomic::Ordering::Relaxed);
        // The flag is consulted during the run, not cleared by it
        assert!(matches!(vm.run(), Err(VmError::Cancelled)));
    }

    #[test]
    fn test_unregistered_native_fails() {
        let options = rawk_compiler::CompileOptions {
            natives: vec![rawk_compiler::compiler::resolve::NativeFunc {
                name: "twice".into(),
                arity: Some(1),
            }],
        };
        let src = "BEGIN { print twice(4) }";
        let program = rawk_compiler::compile_with_options(src, &options).unwrap();
        let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
        vm.capture_output();
        assert!(matches!(vm.run(), Err(VmError::NativeFunction { .. })));
        assert!(vm.register_native("thrice", |_| Ok(Value::Null)).is_err());
        vm.register_native("twice", |args| Ok(Value::Num(args[0].to_num() * 2.0)))
            .unwrap();
        vm.reset().unwrap();
        vm.run().unwrap();
        assert_eq!(vm.take_output(), "8\n");
    }
}
