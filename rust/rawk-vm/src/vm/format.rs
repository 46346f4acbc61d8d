//! printf-style formatting and number-to-string conversion.

use crate::values::{looks_numeric, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    #[error("not enough arguments ({have}) for format string {format:?}")]
    NotEnoughArgs { format: String, have: usize },
}

/// Convert a number to its string form: integers print exactly, anything
/// else goes through `fmt` (CONVFMT or OFMT).
pub fn format_number(n: f64, fmt: &str) -> String {
    if let Some(i) = integral(n) {
        return i.to_string();
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if fmt == "%.6g" {
        let mut out = String::new();
        if n < 0.0 {
            out.push('-');
        }
        out.push_str(&fmt_g(n.abs(), 6, false, false));
        return out;
    }
    sprintf(fmt, &[Value::Num(n)], "%.6g").unwrap_or_else(|_| format!("{}", n))
}

/// `n` as an integer, if it is whole and within i64 range.
pub fn integral(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(&n) {
        Some(n as i64)
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

/// Format `args` according to the printf-style `format`.
pub fn sprintf(format: &str, args: &[Value], convfmt: &str) -> Result<String, FormatError> {
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::with_capacity(format.len());
    let mut next_arg = 0;
    let take = |next_arg: &mut usize| take_arg(args, next_arg, format);

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '%' {
            out.push(c);
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&flag) = chars.get(i) {
            match flag {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alt = true,
                '0' => spec.zero = true,
                _ => break,
            }
            i += 1;
        }
        if chars.get(i) == Some(&'*') {
            let w = take(&mut next_arg)?.to_num() as i64;
            if w < 0 {
                spec.minus = true;
            }
            spec.width = w.unsigned_abs() as usize;
            i += 1;
        } else {
            while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
                spec.width = spec.width * 10 + d as usize;
                i += 1;
            }
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            if chars.get(i) == Some(&'*') {
                let p = take(&mut next_arg)?.to_num() as i64;
                spec.precision = if p < 0 { None } else { Some(p as usize) };
                i += 1;
            } else {
                let mut p = 0;
                while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
                    p = p * 10 + d as usize;
                    i += 1;
                }
                spec.precision = Some(p);
            }
        }

        let Some(&verb) = chars.get(i) else {
            out.extend(&chars[start..]);
            break;
        };
        i += 1;
        let formatted = match verb {
            'd' | 'i' => format_int(&spec, take(&mut next_arg)?.to_num()),
            'o' | 'x' | 'X' | 'u' => format_unsigned(&spec, verb, take(&mut next_arg)?.to_num()),
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
                format_float(&spec, verb, take(&mut next_arg)?.to_num())
            }
            'c' => {
                let arg = take(&mut next_arg)?;
                let s = match arg {
                    Value::Num(n) => char_from_code(*n),
                    Value::NumStr(s) if looks_numeric(s) => char_from_code(arg.to_num()),
                    other => other.to_str(convfmt).chars().take(1).collect(),
                };
                pad(&spec, String::new(), s, false)
            }
            's' => {
                let arg = take(&mut next_arg)?;
                let s = arg.to_str(convfmt);
                let s: String = match spec.precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s.into_owned(),
                };
                pad(&spec, String::new(), s, false)
            }
            _ => chars[start..i].iter().collect(),
        };
        out.push_str(&formatted);
    }
    Ok(out)
}

fn take_arg<'a>(
    args: &'a [Value],
    next: &mut usize,
    format: &str,
) -> Result<&'a Value, FormatError> {
    let arg = args.get(*next).ok_or_else(|| FormatError::NotEnoughArgs {
        format: format.to_string(),
        have: args.len(),
    })?;
    *next += 1;
    Ok(arg)
}

fn char_from_code(n: f64) -> String {
    char::from_u32(n as u32).map_or_else(String::new, String::from)
}

fn sign(spec: &Spec, negative: bool) -> &'static str {
    if negative {
        "-"
    } else if spec.plus {
        "+"
    } else if spec.space {
        " "
    } else {
        ""
    }
}

/// Pad `prefix` + `body` to the field width. Zero padding goes between
/// the prefix (sign, `0x`) and the digits.
fn pad(spec: &Spec, prefix: String, body: String, zero_ok: bool) -> String {
    let len = prefix.chars().count() + body.chars().count();
    if len >= spec.width {
        return prefix + &body;
    }
    let fill = spec.width - len;
    if spec.minus {
        format!("{}{}{}", prefix, body, " ".repeat(fill))
    } else if spec.zero && zero_ok {
        format!("{}{}{}", prefix, "0".repeat(fill), body)
    } else {
        format!("{}{}{}", " ".repeat(fill), prefix, body)
    }
}

fn non_finite(spec: &Spec, n: f64, upper: bool) -> String {
    let body = if n.is_nan() { "nan" } else { "inf" };
    let body = if upper {
        body.to_uppercase()
    } else {
        body.to_string()
    };
    pad(spec, sign(spec, n < 0.0).to_string(), body, false)
}

fn format_int(spec: &Spec, n: f64) -> String {
    if !n.is_finite() {
        return non_finite(spec, n, false);
    }
    let v = n as i64;
    let mut digits = v.unsigned_abs().to_string();
    if let Some(p) = spec.precision {
        if p == 0 && v == 0 {
            digits.clear();
        } else if digits.len() < p {
            digits = "0".repeat(p - digits.len()) + &digits;
        }
    }
    pad(
        spec,
        sign(spec, v < 0).to_string(),
        digits,
        spec.precision.is_none(),
    )
}

fn format_unsigned(spec: &Spec, verb: char, n: f64) -> String {
    if !n.is_finite() {
        return non_finite(spec, n, verb == 'X');
    }
    let v = if n < 0.0 { n as i64 as u64 } else { n as u64 };
    let mut digits = match verb {
        'o' => format!("{:o}", v),
        'x' => format!("{:x}", v),
        'X' => format!("{:X}", v),
        _ => v.to_string(),
    };
    if let Some(p) = spec.precision {
        if p == 0 && v == 0 {
            digits.clear();
        } else if digits.len() < p {
            digits = "0".repeat(p - digits.len()) + &digits;
        }
    }
    let prefix = match verb {
        'o' if spec.alt && !digits.starts_with('0') => {
            digits.insert(0, '0');
            ""
        }
        'x' if spec.alt && v != 0 => "0x",
        'X' if spec.alt && v != 0 => "0X",
        _ => "",
    };
    pad(spec, prefix.to_string(), digits, spec.precision.is_none())
}

fn format_float(spec: &Spec, verb: char, n: f64) -> String {
    let upper = verb.is_ascii_uppercase();
    if !n.is_finite() {
        return non_finite(spec, n, upper);
    }
    let negative = n < 0.0 || (n == 0.0 && n.is_sign_negative());
    let x = n.abs();
    let prec = spec.precision.unwrap_or(6);
    let body = match verb {
        'e' | 'E' => fmt_e(x, prec, spec.alt, upper),
        'f' | 'F' => fmt_f(x, prec, spec.alt),
        _ => fmt_g(x, prec, spec.alt, upper),
    };
    pad(spec, sign(spec, negative).to_string(), body, true)
}

fn fmt_f(x: f64, prec: usize, alt: bool) -> String {
    let mut s = format!("{:.*}", prec, x);
    if alt && prec == 0 {
        s.push('.');
    }
    s
}

/// Split Rust's `{:e}` output into mantissa and exponent.
fn exp_parts(x: f64, prec: usize) -> (String, i32) {
    let s = format!("{:.*e}", prec, x);
    match s.split_once('e') {
        Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
        None => (s, 0),
    }
}

fn fmt_e(x: f64, prec: usize, alt: bool, upper: bool) -> String {
    let (mut mantissa, exp) = exp_parts(x, prec);
    if alt && prec == 0 {
        mantissa.push('.');
    }
    format!(
        "{}{}{}{:02}",
        mantissa,
        if upper { 'E' } else { 'e' },
        if exp < 0 { '-' } else { '+' },
        exp.abs()
    )
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn fmt_g(x: f64, prec: usize, alt: bool, upper: bool) -> String {
    let p = if prec == 0 { 1 } else { prec };
    let exp = if x == 0.0 { 0 } else { exp_parts(x, p - 1).1 };
    if exp < -4 || exp >= p as i32 {
        let s = fmt_e(x, p - 1, alt, upper);
        if alt {
            return s;
        }
        let at = s.find(|c: char| c == 'e' || c == 'E').unwrap_or(s.len());
        format!("{}{}", strip_zeros(&s[..at]), &s[at..])
    } else {
        let s = fmt_f(x, (p as i32 - 1 - exp) as usize, alt);
        if alt {
            s
        } else {
            strip_zeros(&s).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: &str, args: &[Value]) -> String {
        sprintf(format, args, "%.6g").unwrap()
    }

    fn fmt_nums(format: &str, nums: &[f64]) -> String {
        let args: Vec<Value> = nums.iter().map(|n| Value::Num(*n)).collect();
        fmt(format, &args)
    }

    #[test]
    fn test_integers() {
        assert_eq!(fmt("%d", &[Value::Num(42.9)]), "42");
        assert_eq!(
            fmt_nums("%5d|%-5d|%05d", &[-7.0, 7.0, -7.0]),
            "   -7|7    |-0007"
        );
        assert_eq!(fmt("%+d % d", &[Value::Num(3.0), Value::Num(3.0)]), "+3  3");
        assert_eq!(fmt("%.3d", &[Value::Num(5.0)]), "005");
        assert_eq!(fmt("%i", &[Value::str("12abc")]), "12");
    }

    #[test]
    fn test_unsigned() {
        assert_eq!(
            fmt_nums("%x %X %o %u", &[255.0, 255.0, 8.0, 3.0]),
            "ff FF 10 3"
        );
        assert_eq!(fmt_nums("%#x %#o", &[255.0, 8.0]), "0xff 010");
    }

    #[test]
    fn test_floats() {
        assert_eq!(fmt("%f", &[Value::Num(3.14159)]), "3.141590");
        assert_eq!(fmt("%.2f", &[Value::Num(2.675)]), "2.67");
        assert_eq!(fmt("%e", &[Value::Num(1234.5)]), "1.234500e+03");
        assert_eq!(fmt("%E", &[Value::Num(0.00012)]), "1.200000E-04");
        assert_eq!(fmt("%g", &[Value::Num(100000.0)]), "100000");
        assert_eq!(fmt("%g", &[Value::Num(1000000.0)]), "1e+06");
        assert_eq!(fmt("%g", &[Value::Num(0.0001)]), "0.0001");
        assert_eq!(fmt("%g", &[Value::Num(0.00001)]), "1e-05");
        assert_eq!(fmt("%.3g", &[Value::Num(3.14159)]), "3.14");
        assert_eq!(fmt("%08.3f", &[Value::Num(-3.14159)]), "-003.142");
    }

    #[test]
    fn test_strings_and_chars() {
        let abc = [Value::str("a"), Value::str("b"), Value::str("c")];
        assert_eq!(fmt("%s-%5s-%-5s|", &abc), "a-    b-c    |");
        assert_eq!(fmt("%.2s", &[Value::str("hello")]), "he");
        assert_eq!(fmt("%c%c", &[Value::Num(65.0), Value::str("hi")]), "Ah");
        assert_eq!(fmt("%s", &[Value::Num(0.1)]), "0.1");
        assert_eq!(fmt_nums("%*d|%-*d|", &[4.0, 1.0, 3.0, 2.0]), "   1|2  |");
    }

    #[test]
    fn test_literals_and_errors() {
        assert_eq!(fmt("100%%", &[]), "100%");
        assert_eq!(fmt("%z", &[]), "%z");
        assert_eq!(fmt("tail %", &[]), "tail %");
        assert!(matches!(
            sprintf("%d %d", &[Value::Num(1.0)], "%.6g"),
            Err(FormatError::NotEnoughArgs { have: 1, .. })
        ));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0, "%.6g"), "5");
        assert_eq!(format_number(0.1 + 0.2, "%.6g"), "0.3");
        assert_eq!(format_number(123456789.123, "%.6g"), "1.23457e+08");
        assert_eq!(format_number(3.14159, "%.2f"), "3.14");
        assert_eq!(format_number(f64::INFINITY, "%.6g"), "inf");
    }

    #[test]
    fn test_large_integers_print_exactly() {
        assert_eq!(format_number(1e16, "%.6g"), "10000000000000000");
        assert_eq!(format_number(2f64.powi(60), "%.6g"), "1152921504606846976");
        assert_eq!(format_number(-1e18, "%.6g"), "-1000000000000000000");
        assert_eq!(format_number(1e19, "%.6g"), "1e+19");
        assert_eq!(integral(2.5), None);
        assert_eq!(integral(-7.0), Some(-7));
    }
}
