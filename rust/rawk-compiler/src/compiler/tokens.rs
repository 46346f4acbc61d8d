use serde::{Deserialize, Serialize};
use std::fmt;

/// Source location in the program text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the start in the source
    pub start: usize,
    /// Byte offset of the end (exclusive) in the source
    pub end: usize,
    /// 1-based line number
    pub line: usize,
    /// 1-based column number
    pub col: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, col: usize) -> Self {
        Self {
            start,
            end,
            line,
            col,
        }
    }

    pub fn dummy() -> Self {
        Self::default()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Built-in functions callable by name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    Atan2,
    Close,
    Cos,
    Exp,
    Fflush,
    Gsub,
    Index,
    Int,
    Length,
    Log,
    Match,
    Rand,
    Sin,
    Split,
    Sprintf,
    Sqrt,
    Srand,
    Sub,
    Substr,
    System,
    Tolower,
    Toupper,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Accepted argument counts as (min, max). `None` max means variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Builtin::Atan2 => (2, Some(2)),
            Builtin::Close => (1, Some(1)),
            Builtin::Cos | Builtin::Exp | Builtin::Int | Builtin::Log => (1, Some(1)),
            Builtin::Sin | Builtin::Sqrt | Builtin::System => (1, Some(1)),
            Builtin::Tolower | Builtin::Toupper => (1, Some(1)),
            Builtin::Fflush => (0, Some(1)),
            Builtin::Gsub | Builtin::Sub => (2, Some(3)),
            Builtin::Index => (2, Some(2)),
            Builtin::Length => (0, Some(1)),
            Builtin::Match => (2, Some(2)),
            Builtin::Rand => (0, Some(0)),
            Builtin::Split => (2, Some(3)),
            Builtin::Sprintf => (1, None),
            Builtin::Srand => (0, Some(1)),
            Builtin::Substr => (2, Some(3)),
        }
    }
}

/// Token types for the AWK language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Str(String),
    Regex(String),

    // Names
    Name(String),
    /// A name immediately followed by `(`, i.e. a user function call
    FuncName(String),
    Builtin(Builtin),

    // Keywords
    Begin,
    End,
    Function,
    If,
    Else,
    While,
    For,
    Do,
    Break,
    Continue,
    Next,
    NextFile,
    Exit,
    Return,
    Delete,
    In,
    Getline,
    Print,
    Printf,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    PowAssign,
    Equals,
    NotEquals,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Append,
    Pipe,
    Match,
    NotMatch,
    Not,
    And,
    Or,
    Question,
    Colon,
    Incr,
    Decr,
    Dollar,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Newline,
    Eof,
}

impl TokenKind {
    /// Whether a `/` following this token is division rather than a regex.
    pub fn ends_operand(&self) -> bool {
        matches!(
            self,
            TokenKind::Number(_)
                | TokenKind::Str(_)
                | TokenKind::Regex(_)
                | TokenKind::Name(_)
                | TokenKind::Builtin(Builtin::Length)
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::Incr
                | TokenKind::Decr
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Str(s) => write!(f, "string {:?}", s),
            TokenKind::Regex(r) => write!(f, "regex /{}/", r),
            TokenKind::Name(n) => write!(f, "name {}", n),
            TokenKind::FuncName(n) => write!(f, "function {}", n),
            TokenKind::Builtin(b) => write!(f, "builtin {}", b.name()),
            TokenKind::Begin => write!(f, "BEGIN"),
            TokenKind::End => write!(f, "END"),
            TokenKind::Function => write!(f, "function"),
            TokenKind::If => write!(f, "if"),
            TokenKind::Else => write!(f, "else"),
            TokenKind::While => write!(f, "while"),
            TokenKind::For => write!(f, "for"),
            TokenKind::Do => write!(f, "do"),
            TokenKind::Break => write!(f, "break"),
            TokenKind::Continue => write!(f, "continue"),
            TokenKind::Next => write!(f, "next"),
            TokenKind::NextFile => write!(f, "nextfile"),
            TokenKind::Exit => write!(f, "exit"),
            TokenKind::Return => write!(f, "return"),
            TokenKind::Delete => write!(f, "delete"),
            TokenKind::In => write!(f, "in"),
            TokenKind::Getline => write!(f, "getline"),
            TokenKind::Print => write!(f, "print"),
            TokenKind::Printf => write!(f, "printf"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Caret => write!(f, "^"),
            TokenKind::Assign => write!(f, "="),
            TokenKind::AddAssign => write!(f, "+="),
            TokenKind::SubAssign => write!(f, "-="),
            TokenKind::MulAssign => write!(f, "*="),
            TokenKind::DivAssign => write!(f, "/="),
            TokenKind::ModAssign => write!(f, "%="),
            TokenKind::PowAssign => write!(f, "^="),
            TokenKind::Equals => write!(f, "=="),
            TokenKind::NotEquals => write!(f, "!="),
            TokenKind::Less => write!(f, "<"),
            TokenKind::LessOrEqual => write!(f, "<="),
            TokenKind::Greater => write!(f, ">"),
            TokenKind::GreaterOrEqual => write!(f, ">="),
            TokenKind::Append => write!(f, ">>"),
            TokenKind::Pipe => write!(f, "|"),
            TokenKind::Match => write!(f, "~"),
            TokenKind::NotMatch => write!(f, "!~"),
            TokenKind::Not => write!(f, "!"),
            TokenKind::And => write!(f, "&&"),
            TokenKind::Or => write!(f, "||"),
            TokenKind::Question => write!(f, "?"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Incr => write!(f, "++"),
            TokenKind::Decr => write!(f, "--"),
            TokenKind::Dollar => write!(f, "$"),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}
