//! Escape analysis options
//!
//! Options are read from the `[escape]` table of a TOML file. The environment
//! variables `ESCJIT_NO_SYNC_REMOVAL` and `ESCJIT_NO_SCALAR` switch the two
//! transform families off regardless of the file.

use super::error::{EscapeError, EscapeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_NO_SYNC_REMOVAL: &str = "ESCJIT_NO_SYNC_REMOVAL";
pub const ENV_NO_SCALAR: &str = "ESCJIT_NO_SCALAR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EscapeOptions {
    /// Remove monitors on objects that never escape
    pub sync_removal: bool,
    /// Lazy-lock objects that reach virtual calls
    pub sync_removal_virtual: bool,
    /// Guard monitors on `this` with the caller-held flag
    pub sync_removal_this: bool,
    /// Scalar replacement of non-escaping allocations
    pub scalar_replacement: bool,
    /// Cache repeated reads of final fields
    pub scalarize_final_fields: bool,
    /// Scalar replacement of objects passed to direct calls
    pub scalarize_escaped: bool,
    /// Maximum nesting of callee analyses
    pub max_depth: usize,
    /// Minimum share of entry frequency reaching exits without a call before
    /// an escaped object is scalarized
    pub profit_ratio: f64,
    /// Minimum reads of a final field worth caching
    pub min_final_loads: usize,
}

impl Default for EscapeOptions {
    fn default() -> Self {
        Self {
            sync_removal: true,
            sync_removal_virtual: true,
            sync_removal_this: true,
            scalar_replacement: true,
            scalarize_final_fields: true,
            scalarize_escaped: true,
            max_depth: 3,
            profit_ratio: 0.0,
            min_final_loads: 2,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    escape: EscapeOptions,
}

impl EscapeOptions {
    /// Parse the `[escape]` table of a TOML document. Missing keys keep
    /// their defaults.
    pub fn from_toml_str(src: &str) -> EscapeResult<Self> {
        let file: ConfigFile = toml::from_str(src)?;
        file.escape.validate()?;
        Ok(file.escape)
    }

    pub fn from_file(path: &Path) -> EscapeResult<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| EscapeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&src)
    }

    /// Apply the process environment's kill switches
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply kill switches looked up through `lookup`. Any value other than
    /// empty, `0` or `false` counts as set.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let set = |key: &str| {
            lookup(key)
                .map(|v| !matches!(v.trim(), "" | "0" | "false"))
                .unwrap_or(false)
        };
        if set(ENV_NO_SYNC_REMOVAL) {
            log::info!("{} set, monitor elimination disabled", ENV_NO_SYNC_REMOVAL);
            self.sync_removal = false;
        }
        if set(ENV_NO_SCALAR) {
            log::info!("{} set, scalar replacement disabled", ENV_NO_SCALAR);
            self.scalar_replacement = false;
        }
        self
    }

    pub fn validate(&self) -> EscapeResult<()> {
        if !self.profit_ratio.is_finite() || self.profit_ratio < 0.0 {
            return Err(EscapeError::Config(format!(
                "profit_ratio must be a non-negative number, got {}",
                self.profit_ratio
            )));
        }
        if self.min_final_loads == 0 {
            return Err(EscapeError::Config(
                "min_final_loads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Options with every transform switched off; analysis only
    pub fn analysis_only() -> Self {
        Self {
            sync_removal: false,
            scalar_replacement: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_table_keeps_defaults() {
        let opts = EscapeOptions::from_toml_str(
            r#"
            [escape]
            max_depth = 1
            scalarize_escaped = false
            "#,
        )
        .unwrap();
        assert_eq!(opts.max_depth, 1);
        assert!(!opts.scalarize_escaped);
        assert!(opts.sync_removal);
        assert_eq!(opts.min_final_loads, 2);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(
            EscapeOptions::from_toml_str("").unwrap(),
            EscapeOptions::default()
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = EscapeOptions::from_toml_str("[escape]\nprofit_ratio = -1.0\n").unwrap_err();
        assert!(matches!(err, EscapeError::Config(_)));
        let err = EscapeOptions::from_toml_str("[escape]\nunknown_knob = true\n").unwrap_err();
        assert!(matches!(err, EscapeError::Config(_)));
    }

    #[test]
    fn test_kill_switches() {
        let opts = EscapeOptions::default().with_overrides_from(|key| match key {
            ENV_NO_SCALAR => Some("1".to_string()),
            ENV_NO_SYNC_REMOVAL => Some("0".to_string()),
            _ => None,
        });
        assert!(!opts.scalar_replacement);
        assert!(opts.sync_removal);
    }
}
