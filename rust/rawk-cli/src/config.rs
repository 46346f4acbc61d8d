//! Configuration file parsing for `rawk.toml`.
//!
//! Searches the current directory then its ancestors. Flags given on the
//! command line override whatever the file sets.

use rawk_vm::VmConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct RawkConfig {
    #[serde(default)]
    pub vm: VmConfig,
}

impl RawkConfig {
    /// Load config from `rawk.toml`, searching current dir then parents.
    /// Returns `Default` when no file is found.
    pub fn load() -> Result<Self, String> {
        match Self::find() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        Self::parse(&content)
            .map_err(|e| format!("invalid toml in '{}': {}", path.display(), e))
    }

    /// Parse a TOML string directly.
    pub fn parse(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    fn find() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join("rawk.toml");
            if config_path.is_file() {
                return Some(config_path);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_section() {
        let toml_str = r#"
[vm]
max_call_depth = 200
field_sep = ":"
no_exec = true

[vm.vars]
greeting = "hello"
"#;
        let cfg = RawkConfig::parse(toml_str).expect("should parse");
        assert_eq!(cfg.vm.max_call_depth, 200);
        assert_eq!(cfg.vm.field_sep.as_deref(), Some(":"));
        assert!(cfg.vm.no_exec);
        assert_eq!(
            cfg.vm.vars.get("greeting").map(String::as_str),
            Some("hello")
        );
        assert_eq!(
            cfg.vm.cancel_check_interval,
            VmConfig::default().cancel_check_interval
        );
    }

    #[test]
    fn test_empty_string_returns_default() {
        let cfg = RawkConfig::parse("").expect("should parse");
        assert_eq!(cfg, RawkConfig::default());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        assert!(RawkConfig::parse("[vm\nmax_call_depth = ").is_err());
        let wrong_type = "[vm]\nmax_call_depth = \"deep\"";
        assert!(RawkConfig::parse(wrong_type).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("rawk_config_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rawk.toml");
        std::fs::write(&path, "[vm]\nenviron = { HOME = \"/tmp\" }\n").unwrap();
        let cfg = RawkConfig::load_from(&path).unwrap();
        let environ = cfg.vm.environ.expect("environ should be set");
        assert_eq!(environ.get("HOME").map(String::as_str), Some("/tmp"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = RawkConfig::load_from(Path::new("/nonexistent/rawk.toml")).unwrap_err();
        assert!(err.starts_with("cannot read"));
    }
}
