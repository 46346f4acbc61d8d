//! Bytecode data types.
//! Stack machine, one `Vec<Op>` per top-level block or function body.

use crate::compiler::ast::AugOp;
use crate::compiler::specials::SpecialVar;
use crate::compiler::tokens::Builtin;
use serde::{Deserialize, Serialize};

/// Where an array lives: a global slot, or a parameter bound at call time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayRef {
    Global(u32),
    Local(u32),
}

/// A scalar storage location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarRef {
    Global(u32),
    Local(u32),
    Special(SpecialVar),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Redirect {
    Stdout,
    File,
    Append,
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetlineKind {
    /// Next record of the main input
    Main,
    /// Pops a file name
    File,
    /// Pops a command line
    Command,
}

/// Opcodes for the stack VM.
///
/// Jump offsets are relative to the instruction after the jump. Ops that
/// take a field or array key pop it from the top of the stack; assignment
/// ops pop the key first and then the value beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // Stack
    Num(u32),  // push nums[i]
    Str(u32),  // push strs[i]
    Dupe,
    Drop,
    Swap,
    Rote, // [a, b, c] -> [b, c, a]

    // Fetch
    Field,         // pop index, push $index
    FieldInt(u32), // push $n
    Global(u32),
    Local(u32),
    Special(SpecialVar),
    ArrayGlobal(u32), // pop key, push element (creating it)
    ArrayLocal(u32),
    InGlobal(u32), // pop key, push 1 if present
    InLocal(u32),

    // Store (pops the value)
    AssignField,
    AssignGlobal(u32),
    AssignLocal(u32),
    AssignSpecial(SpecialVar),
    AssignArrayGlobal(u32),
    AssignArrayLocal(u32),
    Delete(ArrayRef), // pop key
    DeleteAll(ArrayRef),

    // Fused increment (pops nothing except a key)
    IncrField(i8),
    IncrGlobal { amount: i8, index: u32 },
    IncrLocal { amount: i8, index: u32 },
    IncrSpecial { amount: i8, var: SpecialVar },
    IncrArrayGlobal { amount: i8, index: u32 },
    IncrArrayLocal { amount: i8, index: u32 },

    // Fused augmented assignment (pops the right-hand value)
    AugAssignField(AugOp),
    AugAssignGlobal { op: AugOp, index: u32 },
    AugAssignLocal { op: AugOp, index: u32 },
    AugAssignSpecial { op: AugOp, var: SpecialVar },
    AugAssignArrayGlobal { op: AugOp, index: u32 },
    AugAssignArrayLocal { op: AugOp, index: u32 },

    Regex(u32),       // push 1 if regexes[i] matches $0
    IndexMulti(u32),  // join n keys with SUBSEP
    ConcatMulti(u32), // concatenate n values

    // Binary: pop right, pop left, push result
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Modulo,
    Equals,
    NotEquals,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Concat,
    Match, // right operand is the pattern text
    NotMatch,

    // Unary
    Not,
    UnaryMinus,
    UnaryPlus, // numeric value
    Boolean,   // truthiness as 0/1

    // Control flow
    Jump(i32),
    JumpFalse(i32), // pop, jump if false
    JumpTrue(i32),
    JumpEquals(i32), // pop right, pop left, jump if left == right
    JumpNotEquals(i32),
    JumpLess(i32),
    JumpGreater(i32),
    JumpLessOrEqual(i32),
    JumpGreaterOrEqual(i32),
    Next,
    NextFile,
    Exit,       // status unchanged
    ExitStatus, // pop status
    Return,     // pop return value
    ReturnNull,
    /// Run the following `body_len` ops once per key of `array`
    ForIn {
        var: ScalarRef,
        array: ArrayRef,
        body_len: u32,
    },
    BreakForIn,

    // Calls
    CallBuiltin { func: Builtin, num_args: u32 },
    CallLengthArray(ArrayRef),
    /// Pop optional separator, pop string; push element count
    CallSplit { array: ArrayRef, sep: bool },
    /// Pop target, replacement, pattern; push new target then count
    CallSub { global: bool },
    /// Followed by `num_array_args` `ArrayArg` ops
    CallUser { func: u32, num_array_args: u32 },
    ArrayArg(ArrayRef),
    CallNative { func: u32, num_args: u32 },
    Nulls(u32), // push n nulls

    // I/O
    Print { num_args: u32, redirect: Redirect }, // dest popped first
    Printf { num_args: u32, redirect: Redirect },
    /// Read into $0; push status
    Getline(GetlineKind),
    GetlineVar { kind: GetlineKind, var: ScalarRef },
    GetlineField(GetlineKind), // pop field index
    GetlineArray { kind: GetlineKind, array: ArrayRef }, // pop key
}

impl Op {
    /// Opcode name as shown by the disassembler.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Num(_) => "Num",
            Op::Str(_) => "Str",
            Op::Dupe => "Dupe",
            Op::Drop => "Drop",
            Op::Swap => "Swap",
            Op::Rote => "Rote",
            Op::Field => "Field",
            Op::FieldInt(_) => "FieldInt",
            Op::Global(_) => "Global",
            Op::Local(_) => "Local",
            Op::Special(_) => "Special",
            Op::ArrayGlobal(_) => "ArrayGlobal",
            Op::ArrayLocal(_) => "ArrayLocal",
            Op::InGlobal(_) => "InGlobal",
            Op::InLocal(_) => "InLocal",
            Op::AssignField => "AssignField",
            Op::AssignGlobal(_) => "AssignGlobal",
            Op::AssignLocal(_) => "AssignLocal",
            Op::AssignSpecial(_) => "AssignSpecial",
            Op::AssignArrayGlobal(_) => "AssignArrayGlobal",
            Op::AssignArrayLocal(_) => "AssignArrayLocal",
            Op::Delete(_) => "Delete",
            Op::DeleteAll(_) => "DeleteAll",
            Op::IncrField(_) => "IncrField",
            Op::IncrGlobal { .. } => "IncrGlobal",
            Op::IncrLocal { .. } => "IncrLocal",
            Op::IncrSpecial { .. } => "IncrSpecial",
            Op::IncrArrayGlobal { .. } => "IncrArrayGlobal",
            Op::IncrArrayLocal { .. } => "IncrArrayLocal",
            Op::AugAssignField(_) => "AugAssignField",
            Op::AugAssignGlobal { .. } => "AugAssignGlobal",
            Op::AugAssignLocal { .. } => "AugAssignLocal",
            Op::AugAssignSpecial { .. } => "AugAssignSpecial",
            Op::AugAssignArrayGlobal { .. } => "AugAssignArrayGlobal",
            Op::AugAssignArrayLocal { .. } => "AugAssignArrayLocal",
            Op::Regex(_) => "Regex",
            Op::IndexMulti(_) => "IndexMulti",
            Op::ConcatMulti(_) => "ConcatMulti",
            Op::Add => "Add",
            Op::Subtract => "Subtract",
            Op::Multiply => "Multiply",
            Op::Divide => "Divide",
            Op::Power => "Power",
            Op::Modulo => "Modulo",
            Op::Equals => "Equals",
            Op::NotEquals => "NotEquals",
            Op::Less => "Less",
            Op::Greater => "Greater",
            Op::LessOrEqual => "LessOrEqual",
            Op::GreaterOrEqual => "GreaterOrEqual",
            Op::Concat => "Concat",
            Op::Match => "Match",
            Op::NotMatch => "NotMatch",
            Op::Not => "Not",
            Op::UnaryMinus => "UnaryMinus",
            Op::UnaryPlus => "UnaryPlus",
            Op::Boolean => "Boolean",
            Op::Jump(_) => "Jump",
            Op::JumpFalse(_) => "JumpFalse",
            Op::JumpTrue(_) => "JumpTrue",
            Op::JumpEquals(_) => "JumpEquals",
            Op::JumpNotEquals(_) => "JumpNotEquals",
            Op::JumpLess(_) => "JumpLess",
            Op::JumpGreater(_) => "JumpGreater",
            Op::JumpLessOrEqual(_) => "JumpLessOrEqual",
            Op::JumpGreaterOrEqual(_) => "JumpGreaterOrEqual",
            Op::Next => "Next",
            Op::NextFile => "NextFile",
            Op::Exit => "Exit",
            Op::ExitStatus => "ExitStatus",
            Op::Return => "Return",
            Op::ReturnNull => "ReturnNull",
            Op::ForIn { .. } => "ForIn",
            Op::BreakForIn => "BreakForIn",
            Op::CallBuiltin { .. } => "CallBuiltin",
            Op::CallLengthArray(_) => "CallLengthArray",
            Op::CallSplit { .. } => "CallSplit",
            Op::CallSub { .. } => "CallSub",
            Op::CallUser { .. } => "CallUser",
            Op::ArrayArg(_) => "ArrayArg",
            Op::CallNative { .. } => "CallNative",
            Op::Nulls(_) => "Nulls",
            Op::Print { .. } => "Print",
            Op::Printf { .. } => "Printf",
            Op::Getline(_) => "Getline",
            Op::GetlineVar { .. } => "GetlineVar",
            Op::GetlineField(_) => "GetlineField",
            Op::GetlineArray { .. } => "GetlineArray",
        }
    }

    /// Relative offset of a jump op.
    pub fn jump_offset(&self) -> Option<i32> {
        match *self {
            Op::Jump(o)
            | Op::JumpFalse(o)
            | Op::JumpTrue(o)
            | Op::JumpEquals(o)
            | Op::JumpNotEquals(o)
            | Op::JumpLess(o)
            | Op::JumpGreater(o)
            | Op::JumpLessOrEqual(o)
            | Op::JumpGreaterOrEqual(o) => Some(o),
            _ => None,
        }
    }

    /// Replace the offset of a jump op; other ops are left untouched.
    pub fn set_jump_offset(&mut self, offset: i32) {
        match self {
            Op::Jump(o)
            | Op::JumpFalse(o)
            | Op::JumpTrue(o)
            | Op::JumpEquals(o)
            | Op::JumpNotEquals(o)
            | Op::JumpLess(o)
            | Op::JumpGreater(o)
            | Op::JumpLessOrEqual(o)
            | Op::JumpGreaterOrEqual(o) => *o = offset,
            _ => {}
        }
    }
}

/// Guard for one pattern-action rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompiledPattern {
    All,
    Expr(Vec<Op>),
    Range(Vec<Op>, Vec<Op>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledAction {
    pub pattern: CompiledPattern,
    /// `None` prints the record
    pub body: Option<Vec<Op>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: String,
    pub params: Vec<String>,
    /// Parallel to `params`
    pub arrays: Vec<bool>,
    pub num_scalars: usize,
    pub num_arrays: usize,
    pub body: Vec<Op>,
}

/// Output of the compiler: immutable, runnable any number of times
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub begin: Vec<Vec<Op>>,
    pub actions: Vec<CompiledAction>,
    pub end: Vec<Vec<Op>>,
    pub functions: Vec<CompiledFunction>,
    pub nums: Vec<f64>,
    pub strs: Vec<String>,
    /// Regex sources, already validated
    pub regexes: Vec<String>,
    pub scalar_names: Vec<String>,
    pub array_names: Vec<String>,
    pub native_names: Vec<String>,
    /// sha256 of the program source
    pub source_hash: String,
}

impl CompiledProgram {
    /// Whether running this program needs the record loop.
    pub fn reads_input(&self) -> bool {
        !self.actions.is_empty() || !self.end.is_empty()
    }
}
