//! Scalar value representation for the rawk VM.

use crate::vm::format::format_number;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Runtime scalar values.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// Uninitialized: "" as a string, 0 as a number
    #[default]
    Null,
    /// A true string, from a literal or string operation
    Str(String),
    Num(f64),
    /// Text that came from input; numeric if it looks like a number
    NumStr(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn num_str(s: impl Into<String>) -> Self {
        Value::NumStr(s.into())
    }

    pub fn from_bool(b: bool) -> Self {
        Value::Num(if b { 1.0 } else { 0.0 })
    }

    pub fn to_num(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Num(n) => *n,
            Value::Str(s) | Value::NumStr(s) => parse_num_prefix(s),
        }
    }

    /// String form, formatting non-integral numbers with `convfmt`.
    pub fn to_str(&self, convfmt: &str) -> Cow<'_, str> {
        match self {
            Value::Null => Cow::Borrowed(""),
            Value::Str(s) | Value::NumStr(s) => Cow::Borrowed(s),
            Value::Num(n) => Cow::Owned(format_number(*n, convfmt)),
        }
    }

    pub fn into_string(self, convfmt: &str) -> String {
        match self {
            Value::Null => String::new(),
            Value::Str(s) | Value::NumStr(s) => s,
            Value::Num(n) => format_number(n, convfmt),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::NumStr(s) => {
                if looks_numeric(s) {
                    parse_num_prefix(s) != 0.0
                } else {
                    !s.is_empty()
                }
            }
        }
    }

    /// Whether comparisons involving this value must compare as strings.
    pub fn is_true_string(&self) -> bool {
        match self {
            Value::Str(_) => true,
            Value::NumStr(s) => !looks_numeric(s),
            Value::Null | Value::Num(_) => false,
        }
    }
}

/// AWK comparison: as strings if either side is a true string, otherwise
/// as numbers.
pub fn compare(left: &Value, right: &Value, convfmt: &str) -> Ordering {
    if left.is_true_string() || right.is_true_string() {
        left.to_str(convfmt).cmp(&right.to_str(convfmt))
    } else {
        left.to_num()
            .partial_cmp(&right.to_num())
            .unwrap_or(Ordering::Equal)
    }
}

fn number_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut has_digits = i > digits_start;
    if i < bytes.len() && bytes[i] == b'.' {
        let frac_start = i + 1;
        let mut j = frac_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if has_digits || j > frac_start {
            has_digits = true;
            i = j;
        }
    }
    if !has_digits {
        return start;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    i
}

fn is_blank(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0b' | b'\x0c')
}

/// Value of the longest numeric prefix after leading blanks; 0 if none.
pub fn parse_num_prefix(s: &str) -> f64 {
    let bytes = s.as_bytes();
    let start = bytes.iter().take_while(|b| is_blank(**b)).count();
    let end = number_end(bytes, start);
    if end == start {
        return 0.0;
    }
    s[start..end].parse().unwrap_or(0.0)
}

/// Whether the whole string, ignoring surrounding blanks, is a number.
pub fn looks_numeric(s: &str) -> bool {
    let bytes = s.as_bytes();
    let start = bytes.iter().take_while(|b| is_blank(**b)).count();
    let end = number_end(bytes, start);
    end > start && bytes[end..].iter().all(|b| is_blank(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMT: &str = "%.6g";

    #[test]
    fn test_parse_num_prefix() {
        assert_eq!(parse_num_prefix("42"), 42.0);
        assert_eq!(parse_num_prefix("  1.5abc"), 1.5);
        assert_eq!(parse_num_prefix("abc"), 0.0);
        assert_eq!(parse_num_prefix("-3e2x"), -300.0);
        assert_eq!(parse_num_prefix(".5"), 0.5);
        assert_eq!(parse_num_prefix("1e"), 1.0);
        assert_eq!(parse_num_prefix("+"), 0.0);
        assert_eq!(parse_num_prefix(""), 0.0);
    }

    #[test]
    fn test_looks_numeric() {
        assert!(looks_numeric("1"));
        assert!(looks_numeric(" 1.0 "));
        assert!(looks_numeric("-2e5"));
        assert!(!looks_numeric("1x"));
        assert!(!looks_numeric(""));
        assert!(!looks_numeric("abc"));
        assert!(!looks_numeric("."));
    }

    #[test]
    fn test_to_str() {
        assert_eq!(Value::Num(3.0).to_str(FMT), "3");
        assert_eq!(Value::Num(-0.5).to_str(FMT), "-0.5");
        assert_eq!(Value::Num(3.14159265).to_str(FMT), "3.14159");
        assert_eq!(Value::Num(1e20).to_str(FMT), "1e+20");
        assert_eq!(Value::Null.to_str(FMT), "");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_true());
        assert!(!Value::Num(0.0).is_true());
        assert!(Value::str("0").is_true());
        assert!(!Value::str("").is_true());
        assert!(!Value::num_str("0.0").is_true());
        assert!(Value::num_str("a").is_true());
    }

    #[test]
    fn test_comparison_rules() {
        // A string literal is always a string
        assert_ne!(
            compare(&Value::str("1.0"), &Value::Num(1.0), FMT),
            Ordering::Equal
        );
        assert_eq!(
            compare(&Value::str("1"), &Value::Num(1.0), FMT),
            Ordering::Equal
        );
        // Input that looks numeric compares as a number
        assert_eq!(
            compare(&Value::num_str("1.0"), &Value::Num(1.0), FMT),
            Ordering::Equal
        );
        assert_eq!(
            compare(&Value::num_str(" 10 "), &Value::num_str("9"), FMT),
            Ordering::Greater
        );
        assert_eq!(
            compare(&Value::num_str("abc"), &Value::Num(0.0), FMT),
            Ordering::Greater
        );
        assert_eq!(
            compare(&Value::Null, &Value::Num(0.0), FMT),
            Ordering::Equal
        );
        assert_eq!(compare(&Value::Null, &Value::str(""), FMT), Ordering::Equal);
        assert_eq!(
            compare(&Value::Num(2.0), &Value::Num(10.0), FMT),
            Ordering::Less
        );
        assert_eq!(
            compare(&Value::str("2"), &Value::str("10"), FMT),
            Ordering::Greater
        );
    }
}
