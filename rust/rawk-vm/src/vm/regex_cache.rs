//! Compiled regex cache for dynamic patterns.

use regex::Regex;
use std::collections::HashMap;

const MAX_CACHED: usize = 100;

/// Compile an AWK pattern. `.` matches newlines, as records may contain them.
pub fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?s:{})", pattern))
}

/// Patterns built at runtime (`$0 ~ s`, `split(s, a, fs)`) are compiled once
/// and reused. The cache is cleared wholesale when it fills up.
#[derive(Debug, Default)]
pub struct RegexCache {
    entries: HashMap<String, Regex>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(re) = self.entries.get(pattern) {
            return Ok(re.clone());
        }
        let re = compile(pattern)?;
        if self.entries.len() >= MAX_CACHED {
            self.entries.clear();
        }
        self.entries.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_matches_newline() {
        assert!(compile("a.b").unwrap().is_match("a\nb"));
    }

    #[test]
    fn test_cache_reuses_and_bounds() {
        let mut cache = RegexCache::new();
        cache.get("x+").unwrap();
        cache.get("x+").unwrap();
        assert_eq!(cache.len(), 1);
        for i in 0..MAX_CACHED + 5 {
            cache.get(&format!("y{}", i)).unwrap();
        }
        assert!(cache.len() <= MAX_CACHED);
        assert!(cache.get("(").is_err());
    }
}
