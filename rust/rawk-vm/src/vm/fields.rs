//! The current record, its fields, and the FS/RS separator modes.

use crate::vm::regex_cache::RegexCache;
use regex::Regex;

/// Largest field index a program may read or assign.
pub const MAX_FIELD: usize = 1_000_000;

/// How FS splits a record into fields.
#[derive(Debug, Clone)]
pub enum FieldSep {
    /// `" "`: runs of blanks and newlines, ignoring leading and trailing ones
    Whitespace,
    /// Any other single character, taken literally
    Char(char),
    /// `""`: every character is a field
    Chars,
    Regex(Regex),
}

impl FieldSep {
    pub fn new(fs: &str, cache: &mut RegexCache) -> Result<Self, regex::Error> {
        let mut chars = fs.chars();
        Ok(match (chars.next(), chars.next()) {
            (None, _) => FieldSep::Chars,
            (Some(' '), None) => FieldSep::Whitespace,
            (Some(c), None) => FieldSep::Char(c),
            _ => FieldSep::Regex(cache.get(fs)?),
        })
    }

    /// Split `text`. In paragraph mode a newline always ends a field.
    pub fn split(&self, text: &str, paragraph: bool) -> Vec<String> {
        if paragraph && !matches!(self, FieldSep::Whitespace) {
            return text
                .split('\n')
                .flat_map(|line| self.split(line, false))
                .collect();
        }
        if text.is_empty() {
            return Vec::new();
        }
        match self {
            FieldSep::Whitespace => text
                .split(|c: char| c == ' ' || c == '\t' || c == '\n')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            FieldSep::Char(c) => text.split(*c).map(String::from).collect(),
            FieldSep::Chars => text.chars().map(String::from).collect(),
            FieldSep::Regex(re) => {
                let mut fields = Vec::new();
                let mut last = 0;
                for m in re.find_iter(text) {
                    if m.start() == m.end() {
                        continue;
                    }
                    fields.push(text[last..m.start()].to_string());
                    last = m.end();
                }
                fields.push(text[last..].to_string());
                fields
            }
        }
    }
}

/// How RS splits input into records.
#[derive(Debug, Clone)]
pub enum RecordSep {
    Char(char),
    /// `""`: records are separated by blank lines
    Paragraph,
    Regex(Regex),
}

impl RecordSep {
    pub fn new(rs: &str, cache: &mut RegexCache) -> Result<Self, regex::Error> {
        let mut chars = rs.chars();
        Ok(match (chars.next(), chars.next()) {
            (None, _) => RecordSep::Paragraph,
            (Some(c), None) => RecordSep::Char(c),
            _ => RecordSep::Regex(cache.get(rs)?),
        })
    }

    pub fn is_paragraph(&self) -> bool {
        matches!(self, RecordSep::Paragraph)
    }
}

impl Default for RecordSep {
    fn default() -> Self {
        RecordSep::Char('\n')
    }
}

/// `$0` plus its fields, split on first use.
#[derive(Debug)]
pub struct Record {
    line: String,
    fields: Vec<String>,
    split: bool,
    sep: FieldSep,
    paragraph: bool,
}

impl Default for Record {
    fn default() -> Self {
        Record {
            line: String::new(),
            fields: Vec::new(),
            split: false,
            sep: FieldSep::Whitespace,
            paragraph: false,
        }
    }
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_line(&mut self, line: String) {
        self.line = line;
        self.fields.clear();
        self.split = false;
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Change the field separator. The current record keeps the fields it
    /// had under the old one.
    pub fn set_field_sep(&mut self, sep: FieldSep) {
        self.ensure_split();
        self.sep = sep;
    }

    pub fn field_sep(&self) -> &FieldSep {
        &self.sep
    }

    pub fn set_paragraph(&mut self, paragraph: bool) {
        self.ensure_split();
        self.paragraph = paragraph;
    }

    fn ensure_split(&mut self) {
        if !self.split {
            self.fields = self.sep.split(&self.line, self.paragraph);
            self.split = true;
        }
    }

    pub fn nf(&mut self) -> usize {
        self.ensure_split();
        self.fields.len()
    }

    /// `$i`; `None` past the last field.
    pub fn field(&mut self, i: usize) -> Option<&str> {
        if i == 0 {
            return Some(&self.line);
        }
        self.ensure_split();
        self.fields.get(i - 1).map(String::as_str)
    }

    /// Assign `$i`. `$0` re-splits lazily; any other field is padded out
    /// and `$0` is rebuilt with `ofs`.
    pub fn set_field(&mut self, i: usize, value: String, ofs: &str) {
        if i == 0 {
            self.set_line(value);
            return;
        }
        self.ensure_split();
        if self.fields.len() < i {
            self.fields.resize(i, String::new());
        }
        self.fields[i - 1] = value;
        self.rebuild(ofs);
    }

    pub fn set_nf(&mut self, n: usize, ofs: &str) {
        self.ensure_split();
        self.fields.resize(n, String::new());
        self.rebuild(ofs);
    }

    fn rebuild(&mut self, ofs: &str) {
        self.line = self.fields.join(ofs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sep(fs: &str) -> FieldSep {
        FieldSep::new(fs, &mut RegexCache::new()).unwrap()
    }

    #[test]
    fn test_whitespace_split() {
        assert_eq!(sep(" ").split("  a\tb  c \n", false), vec!["a", "b", "c"]);
        assert!(sep(" ").split("   ", false).is_empty());
    }

    #[test]
    fn test_single_char_is_literal() {
        assert_eq!(sep("|").split("a|b||c", false), vec!["a", "b", "", "c"]);
        assert_eq!(sep(".").split("1.2", false), vec!["1", "2"]);
        assert!(sep(",").split("", false).is_empty());
    }

    #[test]
    fn test_regex_split_skips_empty_matches() {
        assert_eq!(sep("[,;]+").split("a,;b;c", false), vec!["a", "b", "c"]);
        assert_eq!(sep("x*").split("ab", false), vec!["ab"]);
        assert_eq!(sep("").split("abc", false), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_paragraph_newline_separates() {
        assert_eq!(sep(",").split("a,b\nc", true), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_record_sep_modes() {
        let mut cache = RegexCache::new();
        assert!(matches!(
            RecordSep::new("\n", &mut cache).unwrap(),
            RecordSep::Char('\n')
        ));
        assert!(RecordSep::new("", &mut cache).unwrap().is_paragraph());
        assert!(matches!(
            RecordSep::new("ab+", &mut cache).unwrap(),
            RecordSep::Regex(_)
        ));
    }

    #[test]
    fn test_field_assignment_rebuilds() {
        let mut record = Record::new();
        record.set_line("a b c".into());
        assert_eq!(record.nf(), 3);
        record.set_field(5, "e".into(), "-");
        assert_eq!(record.line(), "a-b-c--e");
        assert_eq!(record.nf(), 5);
        assert_eq!(record.field(4), Some(""));
        assert_eq!(record.field(6), None);
    }

    #[test]
    fn test_set_nf() {
        let mut record = Record::new();
        record.set_line("a b c d".into());
        record.set_nf(2, " ");
        assert_eq!(record.line(), "a b");
        record.set_nf(4, ":");
        assert_eq!(record.line(), "a:b::");
    }

    #[test]
    fn test_fs_change_keeps_current_split() {
        let mut record = Record::new();
        record.set_line("a:b c".into());
        record.set_field_sep(sep(":"));
        assert_eq!(record.field(1), Some("a:b"));
        record.set_line("a:b c".into());
        assert_eq!(record.field(1), Some("a"));
    }
}
