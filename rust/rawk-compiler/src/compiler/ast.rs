use crate::compiler::tokens::{Builtin, Span};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A complete AWK program, with items grouped by kind in source order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub begin: Vec<Block>,
    pub actions: Vec<Action>,
    pub end: Vec<Block>,
    pub functions: Vec<Function>,
}

pub type Block = Vec<Stmt>;

/// A pattern-action rule. A missing body means `{ print $0 }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub pattern: Pattern,
    pub body: Option<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Pattern {
    /// Matches every record
    All,
    Expr(Expr),
    /// `start, stop` range pattern
    Range(Expr, Expr),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Block,
    pub span: Span,
}

/// A variable reference by name, before resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarRef {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectKind {
    /// `> file`
    File,
    /// `>> file`
    Append,
    /// `| command`
    Pipe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRedirect {
    pub kind: RedirectKind,
    pub dest: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    Print {
        args: Vec<Expr>,
        redirect: Option<OutputRedirect>,
    },
    Printf {
        args: Vec<Expr>,
        redirect: Option<OutputRedirect>,
    },
    Expr(Expr),
    If {
        cond: Expr,
        body: Block,
        else_body: Option<Block>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Block,
    },
    ForIn {
        var: VarRef,
        array: VarRef,
        body: Block,
    },
    While {
        cond: Expr,
        body: Block,
    },
    DoWhile {
        body: Block,
        cond: Expr,
    },
    Break(Span),
    Continue(Span),
    Next(Span),
    NextFile(Span),
    Exit(Option<Expr>),
    Return(Option<Expr>),
    Delete {
        array: VarRef,
        /// `None` deletes every element
        index: Option<Vec<Expr>>,
    },
    Block(Block),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Equals,
    NotEquals,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Match,
    NotMatch,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equals
                | BinaryOp::NotEquals
                | BinaryOp::Less
                | BinaryOp::LessOrEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterOrEqual
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Minus,
    Plus,
    Not,
}

/// Arithmetic operator of an augmented assignment such as `+=`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr,
)]
pub enum AugOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl AugOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AugOp::Add => "+=",
            AugOp::Sub => "-=",
            AugOp::Mul => "*=",
            AugOp::Div => "/=",
            AugOp::Mod => "%=",
            AugOp::Pow => "^=",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GetlineSource {
    /// Plain `getline`: next record of the main input
    Main,
    /// `getline < file`
    File(Box<Expr>),
    /// `cmd | getline`
    Command(Box<Expr>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Num(f64),
    Str(String),
    /// A regex literal; as a value it matches against `$0`
    Regex(String),
    Field(Box<Expr>),
    Var(VarRef),
    Index {
        array: VarRef,
        index: Vec<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    AugAssign {
        target: Box<Expr>,
        op: AugOp,
        value: Box<Expr>,
    },
    Incr {
        target: Box<Expr>,
        decr: bool,
        pre: bool,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    In {
        index: Vec<Expr>,
        array: VarRef,
    },
    Call {
        func: Builtin,
        args: Vec<Expr>,
        span: Span,
    },
    UserCall {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    Getline {
        source: GetlineSource,
        target: Option<Box<Expr>>,
    },
}

impl Expr {
    /// Whether this expression can be assigned to.
    pub fn is_lvalue(&self) -> bool {
        matches!(self, Expr::Var(_) | Expr::Index { .. } | Expr::Field(_))
    }
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Concat => " ",
            BinaryOp::Equals => "==",
            BinaryOp::NotEquals => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::Match => "~",
            BinaryOp::NotMatch => "!~",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", e)?;
    }
    Ok(())
}

/// Renders expressions back to (fully parenthesized) source text for error messages.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(n) => write!(f, "{}", n),
            Expr::Str(s) => write!(f, "{:?}", s),
            Expr::Regex(r) => write!(f, "/{}/", r),
            Expr::Field(e) => write!(f, "${}", e),
            Expr::Var(v) => write!(f, "{}", v.name),
            Expr::Index { array, index } => {
                write!(f, "{}[", array.name)?;
                write_list(f, index)?;
                write!(f, "]")
            }
            Expr::Assign { target, value } => write!(f, "{} = {}", target, value),
            Expr::AugAssign { target, op, value } => {
                write!(f, "{} {} {}", target, op.symbol(), value)
            }
            Expr::Incr { target, decr, pre } => {
                let sym = if *decr { "--" } else { "++" };
                if *pre {
                    write!(f, "{}{}", sym, target)
                } else {
                    write!(f, "{}{}", target, sym)
                }
            }
            Expr::Unary { op, expr } => {
                let sym = match op {
                    UnaryOp::Minus => "-",
                    UnaryOp::Plus => "+",
                    UnaryOp::Not => "!",
                };
                write!(f, "{}{}", sym, expr)
            }
            Expr::Binary { left, op, right } => write!(f, "({}{}{})", left, op.symbol(), right),
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => write!(f, "({} ? {} : {})", cond, then, otherwise),
            Expr::In { index, array } => {
                write!(f, "((")?;
                write_list(f, index)?;
                write!(f, ") in {})", array.name)
            }
            Expr::Call { func, args, .. } => {
                write!(f, "{}(", func.name())?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::UserCall { name, args, .. } => {
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::Getline { source, target } => {
                if let GetlineSource::Command(cmd) = source {
                    write!(f, "{} | ", cmd)?;
                }
                write!(f, "getline")?;
                if let Some(t) = target {
                    write!(f, " {}", t)?;
                }
                if let GetlineSource::File(file) = source {
                    write!(f, " < {}", file)?;
                }
                Ok(())
            }
        }
    }
}
