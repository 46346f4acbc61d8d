//! VM configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;
pub const DEFAULT_CANCEL_CHECK_INTERVAL: u32 = 1000;

/// Settings for one VM instance. Every field has a default, so a partial
/// `[vm]` table in `rawk.toml` deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Deepest allowed user function recursion
    pub max_call_depth: usize,
    /// Initial FS, as given to `-F`
    pub field_sep: Option<String>,
    /// `-v name=value` assignments, applied before BEGIN
    pub vars: BTreeMap<String, String>,
    /// ENVIRON contents; `None` reads the process environment
    pub environ: Option<BTreeMap<String, String>>,
    /// Reject `system()`, pipes, and output redirection to files
    pub no_exec: bool,
    /// Instructions executed between cancellation checks
    pub cancel_check_interval: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            field_sep: None,
            vars: BTreeMap::new(),
            environ: None,
            no_exec: false,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: VmConfig = serde_json::from_str(r#"{"no_exec": true}"#).unwrap();
        assert!(config.no_exec);
        assert_eq!(config.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(config.cancel_check_interval, DEFAULT_CANCEL_CHECK_INTERVAL);
        assert!(config.environ.is_none());
    }
}
