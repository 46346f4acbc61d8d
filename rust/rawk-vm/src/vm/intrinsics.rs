//! Builtin function dispatch for the VM.

use super::*;
use rand::Rng;
use rawk_compiler::compiler::tokens::Builtin;
use std::time::{SystemTime, UNIX_EPOCH};

impl VM {
    fn text(&self, arg: Option<&Value>) -> String {
        arg.map(|v| v.to_str(&self.specials.convfmt).into_owned())
            .unwrap_or_default()
    }

    /// Execute a builtin with its already-evaluated arguments.
    pub(crate) fn call_builtin(
        &mut self,
        func: Builtin,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let num = |i: usize| args.get(i).map(Value::to_num).unwrap_or(0.0);
        let value = match func {
            Builtin::Atan2 => Value::Num(num(0).atan2(num(1))),
            Builtin::Cos => Value::Num(num(0).cos()),
            Builtin::Sin => Value::Num(num(0).sin()),
            Builtin::Exp => Value::Num(num(0).exp()),
            Builtin::Log => Value::Num(num(0).ln()),
            Builtin::Sqrt => Value::Num(num(0).sqrt()),
            Builtin::Int => Value::Num(num(0).trunc()),
            Builtin::Length => {
                let len = match args.first() {
                    Some(v) => v.to_str(&self.specials.convfmt).chars().count(),
                    None => self.record.line().chars().count(),
                };
                Value::Num(len as f64)
            }
            Builtin::Index => {
                let haystack = self.text(args.first());
                let needle = self.text(args.get(1));
                let pos = haystack
                    .find(&needle)
                    .map(|at| haystack[..at].chars().count() + 1)
                    .unwrap_or(0);
                Value::Num(pos as f64)
            }
            Builtin::Match => {
                let text = self.text(args.first());
                let pattern = self.text(args.get(1));
                let re = self.regex_cache.get(&pattern)?;
                let (start, len) = match re.find(&text) {
                    Some(m) => (
                        text[..m.start()].chars().count() as f64 + 1.0,
                        m.as_str().chars().count() as f64,
                    ),
                    None => (0.0, -1.0),
                };
                self.specials.rstart = start;
                self.specials.rlength = len;
                Value::Num(start)
            }
            Builtin::Substr => {
                let text = self.text(args.first());
                let len = args.get(2).map(Value::to_num);
                Value::Str(substr(&text, num(1), len))
            }
            Builtin::Tolower => Value::Str(self.text(args.first()).to_lowercase()),
            Builtin::Toupper => Value::Str(self.text(args.first()).to_uppercase()),
            Builtin::Sprintf => {
                let Some((format, rest)) = args.split_first() else {
                    return Ok(Value::Str(String::new()));
                };
                let format = format.to_str(&self.specials.convfmt);
                Value::Str(format::sprintf(&format, rest, &self.specials.convfmt)?)
            }
            Builtin::Rand => Value::Num(self.rng.gen::<f64>()),
            Builtin::Srand => {
                let previous = self.seed;
                self.seed = match args.first() {
                    Some(v) => v.to_num(),
                    None => SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as f64)
                        .unwrap_or(0.0),
                };
                self.rng = StdRng::seed_from_u64(self.seed.to_bits());
                Value::Num(previous)
            }
            Builtin::System => {
                let command = self.text(args.first());
                Value::Num(self.run_system(&command)?)
            }
            Builtin::Close => {
                let name = self.text(args.first());
                Value::Num(self.close_stream(&name)?)
            }
            Builtin::Fflush => {
                let name = args.first().map(|v| self.text(Some(v)));
                Value::Num(self.flush_stream(name.as_deref())?)
            }
            Builtin::Split | Builtin::Sub | Builtin::Gsub => {
                return Err(VmError::Runtime(format!(
                    "{} must be compiled to its own opcode",
                    func.name()
                )))
            }
        };
        Ok(value)
    }

    /// `split(text, array [, sep])`: refill `array` with the pieces, indexed
    /// from 1, and return how many there are.
    pub(crate) fn split_into(
        &mut self,
        array: ArrayRef,
        text: Value,
        sep: Option<Value>,
    ) -> Result<usize, VmError> {
        let text = self.key(text);
        let pieces = match sep {
            Some(sep) => {
                let sep = self.key(sep);
                FieldSep::new(&sep, &mut self.regex_cache)?.split(&text, false)
            }
            None => self.record.field_sep().split(&text, false),
        };
        let count = pieces.len();
        let array = self.array_mut(array)?;
        array.clear();
        for (i, piece) in pieces.into_iter().enumerate() {
            array.insert((i + 1).to_string(), Value::NumStr(piece));
        }
        Ok(count)
    }

    /// `sub`/`gsub`: the new target value and the number of replacements.
    /// With no match the target comes back unchanged.
    pub(crate) fn substitute(
        &mut self,
        pattern: &Value,
        replacement: &Value,
        target: Value,
        global: bool,
    ) -> Result<(Value, usize), VmError> {
        let re = self
            .regex_cache
            .get(&pattern.to_str(&self.specials.convfmt))?;
        let text = target.to_str(&self.specials.convfmt).into_owned();
        let replacement = replacement.to_str(&self.specials.convfmt);

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut count = 0;
        for m in re.find_iter(&text) {
            out.push_str(&text[last..m.start()]);
            expand_replacement(&replacement, m.as_str(), &mut out);
            last = m.end();
            count += 1;
            if !global {
                break;
            }
        }
        if count == 0 {
            return Ok((target, 0));
        }
        out.push_str(&text[last..]);
        Ok((Value::Str(out), count))
    }
}

/// Append `replacement` with `&` standing for the matched text. `\&` is a
/// literal ampersand and `\\` a literal backslash.
fn expand_replacement(replacement: &str, matched: &str, out: &mut String) {
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some(&next @ ('&' | '\\')) => {
                    out.push(next);
                    chars.next();
                }
                _ => out.push('\\'),
            },
            '&' => out.push_str(matched),
            c => out.push(c),
        }
    }
}

/// Characters `start..start+len` (1-based, rounded), clamped to the string.
fn substr(text: &str, start: f64, len: Option<f64>) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len() as f64;
    let from = start.round();
    let to = match len {
        Some(len) => from + len.round(),
        None => total + 1.0,
    };
    if from.is_nan() || to.is_nan() {
        return String::new();
    }
    let from = from.max(1.0);
    let to = to.min(total + 1.0);
    if to <= from {
        return String::new();
    }
    let (from, to) = (from as usize - 1, to as usize - 1);
    chars[from..to].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> String {
        let program = rawk_compiler::compile(src).unwrap();
        let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
        vm.capture_output();
        vm.run().unwrap();
        vm.take_output()
    }

    #[test]
    fn test_substr_clamps() {
        assert_eq!(substr("hello", 2.0, Some(3.0)), "ell");
        assert_eq!(substr("hello", 0.0, None), "hello");
        assert_eq!(substr("hello", -1.0, Some(3.0)), "h");
        assert_eq!(substr("hello", 4.0, Some(100.0)), "lo");
        assert_eq!(substr("hello", 9.0, None), "");
        assert_eq!(substr("héllo", 2.0, Some(1.0)), "é");
        assert_eq!(substr("hello", 1.5, Some(1.0)), "e");
    }

    #[test]
    fn test_expand_replacement() {
        let mut out = String::new();
        expand_replacement("[&] \\& \\\\ \\n", "x", &mut out);
        assert_eq!(out, "[x] & \\ \\n");
    }

    #[test]
    fn test_string_builtins() {
        let src = "BEGIN { print length(\"héllo\"), index(\"abcabc\", \"ca\"),
                                 toupper(\"aé\"), tolower(\"AB\") }";
        assert_eq!(run(src), "5 3 AÉ ab\n");
        let src = "BEGIN { print index(\"abc\", \"\"), index(\"\", \"\"), index(\"abc\", \"z\") }";
        assert_eq!(run(src), "1 1 0\n");
    }

    #[test]
    fn test_match_sets_rstart_rlength() {
        let src = "BEGIN { print match(\"foobar\", /o+b/), RSTART, RLENGTH;
                           print match(\"x\", /y/), RSTART, RLENGTH }";
        assert_eq!(run(src), "2 2 3\n0 0 -1\n");
    }

    #[test]
    fn test_sub_and_gsub() {
        let src = "BEGIN { s = \"aaa\"; n = gsub(/a/, \"<&>\", s); print n, s;
                           t = \"hello\"; sub(/l+/, \"L\", t); print t;
                           u = \"x\"; print gsub(/z/, \"y\", u), u }";
        assert_eq!(run(src), "3 <a><a><a>\nheLo\n0 x\n");
    }

    #[test]
    fn test_gsub_on_record_rebuilds_fields() {
        assert_eq!(
            run("BEGIN { $0 = \"a-b c\"; gsub(/-/, \" \"); print NF, $2 }"),
            "3 b\n"
        );
    }

    #[test]
    fn test_unmatched_sub_leaves_record_alone() {
        assert_eq!(
            run("BEGIN { $0 = \"a   b\"; sub(/z/, \"y\", $2); print }"),
            "a   b\n"
        );
    }

    #[test]
    fn test_split() {
        let src = "BEGIN { n = split(\"a:b:c\", parts, \":\"); print n, parts[1], parts[3];
                           n = split(\"  x  y \", w); print n, w[2];
                           n = split(\"1,2;3\", v, /[,;]/); print n, v[1] + v[3] }";
        assert_eq!(run(src), "3 a c\n2 y\n3 4\n");
    }

    #[test]
    fn test_split_values_are_numeric_strings() {
        let src = "BEGIN { split(\"10 9\", a); print (a[1] > a[2]) }";
        assert_eq!(run(src), "1\n");
    }

    #[test]
    fn test_math() {
        let src = "BEGIN { print int(3.9), int(-3.9), sqrt(16), exp(0), log(1),
                                 (atan2(0, -1) > 3.14) }";
        assert_eq!(run(src), "3 -3 4 1 0 1\n");
    }

    #[test]
    fn test_srand_returns_previous_seed_and_rand_repeats() {
        let src = "BEGIN { print srand(5); a = rand(); print srand(5); b = rand();
                           print (a == b), (a >= 0 && a < 1) }";
        assert_eq!(run(src), "0\n5\n1 1\n");
    }

    #[test]
    fn test_sprintf() {
        let src = "BEGIN { s = sprintf(\"%05.1f|%-3s|%c\", 3.14159, \"a\", 65); print s }";
        assert_eq!(run(src), "003.1|a  |A\n");
    }
}
