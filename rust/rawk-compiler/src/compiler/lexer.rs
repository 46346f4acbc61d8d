//! Line-oriented lexer for AWK source code.
//!
//! Newlines are significant (they terminate statements), so they are
//! emitted as tokens. Whether `/` starts a regex literal or is a division
//! operator depends on the previous token.

use crate::compiler::tokens::{Builtin, Span, Token, TokenKind};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("unexpected character '{ch}' at line {line}, col {col}")]
    UnexpectedChar { ch: char, line: usize, col: usize },
    #[error("unterminated string at line {line}, col {col}")]
    UnterminatedString { line: usize, col: usize },
    #[error("unterminated regex at line {line}, col {col}")]
    UnterminatedRegex { line: usize, col: usize },
    #[error("invalid number at line {line}, col {col}")]
    InvalidNumber { line: usize, col: usize },
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    byte_offset: usize,
    last: Option<TokenKind>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            byte_offset: 0,
            last: None,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        self.byte_offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn span_from(&self, so: usize, sl: usize, sc: usize) -> Span {
        Span::new(so, self.byte_offset, sl, sc)
    }

    /// Tokenize the whole source, always ending with an `Eof` token.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            self.last = Some(tok.kind.clone());
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn skip_blanks(&mut self) {
        loop {
            match self.current() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('\\') if self.peek() == Some('\n') => {
                    self.advance();
                    self.advance();
                }
                Some('\\') if self.peek() == Some('\r') => {
                    self.advance();
                    self.advance();
                    if self.current() == Some('\n') {
                        self.advance();
                    }
                }
                Some('#') => {
                    while !matches!(self.current(), None | Some('\n')) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_blanks();
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        let Some(ch) = self.current() else {
            return Ok(Token::new(TokenKind::Eof, self.span_from(so, sl, sc)));
        };

        if ch.is_ascii_digit() || (ch == '.' && self.peek().is_some_and(|c| c.is_ascii_digit())) {
            return self.read_number();
        }
        if ch.is_alphabetic() || ch == '_' {
            return Ok(self.read_name());
        }
        if ch == '"' {
            return self.read_string();
        }
        if ch == '/' && !self.last.as_ref().is_some_and(|t| t.ends_operand()) {
            return self.read_regex();
        }

        self.advance();
        let next = self.current();
        let two = |lexer: &mut Self, kind: TokenKind| {
            lexer.advance();
            kind
        };
        let kind = match (ch, next) {
            ('\n', _) => TokenKind::Newline,
            ('{', _) => TokenKind::LBrace,
            ('}', _) => TokenKind::RBrace,
            ('(', _) => TokenKind::LParen,
            (')', _) => TokenKind::RParen,
            ('[', _) => TokenKind::LBracket,
            (']', _) => TokenKind::RBracket,
            (',', _) => TokenKind::Comma,
            (';', _) => TokenKind::Semicolon,
            ('?', _) => TokenKind::Question,
            (':', _) => TokenKind::Colon,
            ('$', _) => TokenKind::Dollar,
            ('~', _) => TokenKind::Match,
            ('+', Some('+')) => two(self, TokenKind::Incr),
            ('+', Some('=')) => two(self, TokenKind::AddAssign),
            ('+', _) => TokenKind::Plus,
            ('-', Some('-')) => two(self, TokenKind::Decr),
            ('-', Some('=')) => two(self, TokenKind::SubAssign),
            ('-', _) => TokenKind::Minus,
            ('*', Some('*')) => {
                self.advance();
                if self.current() == Some('=') {
                    two(self, TokenKind::PowAssign)
                } else {
                    TokenKind::Caret
                }
            }
            ('*', Some('=')) => two(self, TokenKind::MulAssign),
            ('*', _) => TokenKind::Star,
            ('/', Some('=')) => two(self, TokenKind::DivAssign),
            ('/', _) => TokenKind::Slash,
            ('%', Some('=')) => two(self, TokenKind::ModAssign),
            ('%', _) => TokenKind::Percent,
            ('^', Some('=')) => two(self, TokenKind::PowAssign),
            ('^', _) => TokenKind::Caret,
            ('=', Some('=')) => two(self, TokenKind::Equals),
            ('=', _) => TokenKind::Assign,
            ('!', Some('=')) => two(self, TokenKind::NotEquals),
            ('!', Some('~')) => two(self, TokenKind::NotMatch),
            ('!', _) => TokenKind::Not,
            ('<', Some('=')) => two(self, TokenKind::LessOrEqual),
            ('<', _) => TokenKind::Less,
            ('>', Some('=')) => two(self, TokenKind::GreaterOrEqual),
            ('>', Some('>')) => two(self, TokenKind::Append),
            ('>', _) => TokenKind::Greater,
            ('&', Some('&')) => two(self, TokenKind::And),
            ('|', Some('|')) => two(self, TokenKind::Or),
            ('|', _) => TokenKind::Pipe,
            _ => {
                return Err(LexError::UnexpectedChar {
                    ch,
                    line: sl,
                    col: sc,
                })
            }
        };
        Ok(Token::new(kind, self.span_from(so, sl, sc)))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        let mut text = String::new();
        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            while let Some(c) = self.current().filter(|c| c.is_ascii_hexdigit()) {
                text.push(c);
                self.advance();
            }
            let n = i64::from_str_radix(&text, 16)
                .map_err(|_| LexError::InvalidNumber { line: sl, col: sc })?;
            let span = self.span_from(so, sl, sc);
            return Ok(Token::new(TokenKind::Number(n as f64), span));
        }
        while let Some(c) = self.current().filter(|c| c.is_ascii_digit()) {
            text.push(c);
            self.advance();
        }
        if self.current() == Some('.') {
            text.push('.');
            self.advance();
            while let Some(c) = self.current().filter(|c| c.is_ascii_digit()) {
                text.push(c);
                self.advance();
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let sign = self.peek();
            let exp_follows = match sign {
                Some('+') | Some('-') => self
                    .source
                    .get(self.pos + 2)
                    .is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if exp_follows {
                text.push('e');
                self.advance();
                if let Some(s @ ('+' | '-')) = self.current() {
                    text.push(s);
                    self.advance();
                }
                while let Some(c) = self.current().filter(|c| c.is_ascii_digit()) {
                    text.push(c);
                    self.advance();
                }
            }
        }
        let n: f64 = text
            .parse()
            .map_err(|_| LexError::InvalidNumber { line: sl, col: sc })?;
        Ok(Token::new(TokenKind::Number(n), self.span_from(so, sl, sc)))
    }

    fn read_name(&mut self) -> Token {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        let mut name = String::new();
        while let Some(c) = self.current().filter(|c| c.is_alphanumeric() || *c == '_') {
            name.push(c);
            self.advance();
        }
        let kind = match name.as_str() {
            "BEGIN" => TokenKind::Begin,
            "END" => TokenKind::End,
            "function" | "func" => TokenKind::Function,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "do" => TokenKind::Do,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "next" => TokenKind::Next,
            "nextfile" => TokenKind::NextFile,
            "exit" => TokenKind::Exit,
            "return" => TokenKind::Return,
            "delete" => TokenKind::Delete,
            "in" => TokenKind::In,
            "getline" => TokenKind::Getline,
            "print" => TokenKind::Print,
            "printf" => TokenKind::Printf,
            _ => match Builtin::from_str(&name) {
                Ok(b) => TokenKind::Builtin(b),
                Err(_) if self.current() == Some('(') => TokenKind::FuncName(name),
                Err(_) => TokenKind::Name(name),
            },
        };
        Token::new(kind, self.span_from(so, sl, sc))
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.current() {
                None | Some('\n') => return Err(LexError::UnterminatedString { line: sl, col: sc }),
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => s.push('\n'),
                        Some('t') => s.push('\t'),
                        Some('r') => s.push('\r'),
                        Some('\\') => s.push('\\'),
                        Some('"') => s.push('"'),
                        Some('/') => s.push('/'),
                        Some('a') => s.push('\x07'),
                        Some('b') => s.push('\x08'),
                        Some('f') => s.push('\x0c'),
                        Some('v') => s.push('\x0b'),
                        Some('\n') => {}
                        Some(c @ '0'..='7') => {
                            let mut code = c.to_digit(8).unwrap_or(0);
                            for _ in 0..2 {
                                match self.peek().and_then(|d| d.to_digit(8)) {
                                    Some(d) => {
                                        self.advance();
                                        code = code * 8 + d;
                                    }
                                    None => break,
                                }
                            }
                            s.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                        }
                        Some(c) => {
                            s.push('\\');
                            s.push(c);
                        }
                        None => return Err(LexError::UnterminatedString { line: sl, col: sc }),
                    }
                    self.advance();
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    s.push(c);
                    self.advance();
                }
            }
        }
        Ok(Token::new(TokenKind::Str(s), self.span_from(so, sl, sc)))
    }

    fn read_regex(&mut self) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance(); // opening slash
        let mut re = String::new();
        let mut in_bracket = false;
        loop {
            match self.current() {
                None | Some('\n') => return Err(LexError::UnterminatedRegex { line: sl, col: sc }),
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('/') => re.push('/'),
                        Some(c) if c != '\n' => {
                            re.push('\\');
                            re.push(c);
                        }
                        _ => return Err(LexError::UnterminatedRegex { line: sl, col: sc }),
                    }
                    self.advance();
                }
                Some('[') if !in_bracket => {
                    in_bracket = true;
                    re.push('[');
                    self.advance();
                    // A leading `]` (or `^]`) is literal inside a bracket expression.
                    if self.current() == Some('^') {
                        re.push('^');
                        self.advance();
                    }
                    if self.current() == Some(']') {
                        re.push(']');
                        self.advance();
                    }
                }
                Some(']') if in_bracket => {
                    in_bracket = false;
                    re.push(']');
                    self.advance();
                }
                Some('/') if !in_bracket => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    re.push(c);
                    self.advance();
                }
            }
        }
        Ok(Token::new(TokenKind::Regex(re), self.span_from(so, sl, sc)))
    }
}

/// Convenience wrapper: tokenize a whole program.
pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_division_vs_regex() {
        assert_eq!(
            kinds("a / 2"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Slash,
                TokenKind::Number(2.0),
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("/a+/ { }"),
            vec![
                TokenKind::Regex("a+".into()),
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_regex_escaped_slash_and_bracket() {
        assert_eq!(kinds("/a\\/b/")[0], TokenKind::Regex("a/b".into()));
        assert_eq!(kinds("/[/]x/")[0], TokenKind::Regex("[/]x".into()));
        assert_eq!(kinds("/\\./")[0], TokenKind::Regex("\\.".into()));
    }

    #[test]
    fn test_func_name_requires_adjacent_paren() {
        assert_eq!(kinds("f(1)")[0], TokenKind::FuncName("f".into()));
        assert_eq!(kinds("f (1)")[0], TokenKind::Name("f".into()));
        assert_eq!(kinds("substr(s,1)")[0], TokenKind::Builtin(Builtin::Substr));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\tb\n\"\101""#)[0],
            TokenKind::Str("a\tb\n\"A".into())
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("1.5e3")[0], TokenKind::Number(1500.0));
        assert_eq!(kinds(".5")[0], TokenKind::Number(0.5));
        assert_eq!(kinds("0x1F")[0], TokenKind::Number(31.0));
        // `e` not followed by digits belongs to the next token
        assert_eq!(kinds("1e")[1], TokenKind::Name("e".into()));
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a **= 2 >> !~ ||"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::PowAssign,
                TokenKind::Number(2.0),
                TokenKind::Append,
                TokenKind::NotMatch,
                TokenKind::Or,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_and_continuation() {
        assert_eq!(
            kinds("a # comment\nb \\\n c"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Newline,
                TokenKind::Name("b".into()),
                TokenKind::Name("c".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            lex("\"abc"),
            Err(LexError::UnterminatedString { line: 1, col: 1 })
        ));
    }

    #[test]
    fn test_spans() {
        let toks = lex("x\n  y").unwrap();
        assert_eq!(toks[2].span.line, 2);
        assert_eq!(toks[2].span.col, 3);
    }
}
