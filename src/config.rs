//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - planrules.toml (default configuration)
//! - planrules.local.toml (git-ignored local overrides)
//! - Environment variables (PLANRULES_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # planrules.toml
//! [optimizer]
//! implicit_aggregate = "first_if_unique"
//! bloom_filter_enabled = false
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! PLANRULES_OPTIMIZER__IMPLICIT_AGGREGATE=first
//! PLANRULES_OPTIMIZER__LOOKAHEAD_QUANTUM=4
//! ```
//!
//! The configuration is resolved once per compilation and handed to the
//! passes read-only through `PlanContext`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How a column referenced outside GROUP BY (and outside any aggregate) is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImplicitAggregate {
    /// Reject the statement
    #[default]
    Error,
    /// Wrap the column in an implicit `FIRST()` aggregate
    First,
    /// Like `First`, but only when a unique index of the column's table is
    /// covered by the GROUP BY keys
    FirstIfUnique,
}

impl ImplicitAggregate {
    /// Property-style spelling (`error`, `first`, `firstIfUnique`)
    pub fn as_property(self) -> &'static str {
        match self {
            ImplicitAggregate::Error => "error",
            ImplicitAggregate::First => "first",
            ImplicitAggregate::FirstIfUnique => "firstIfUnique",
        }
    }

    /// Parse either the property spelling or the snake_case spelling
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(ImplicitAggregate::Error),
            "first" => Some(ImplicitAggregate::First),
            "firstifunique" | "first_if_unique" => Some(ImplicitAggregate::FirstIfUnique),
            _ => None,
        }
    }
}

impl fmt::Display for ImplicitAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_property())
    }
}

/// Rewrite pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Policy for ungrouped column references
    #[serde(default)]
    pub implicit_aggregate: ImplicitAggregate,

    /// Joins may be lowered into nested-loop maps
    #[serde(default = "default_true")]
    pub map_join_enabled: bool,

    /// Rows requested ahead by each nested loop
    #[serde(default = "default_lookahead_quantum")]
    pub lookahead_quantum: usize,

    /// Bloom-filter semi-joins are lowered as such (nested loop otherwise)
    #[serde(default = "default_true")]
    pub bloom_filter_enabled: bool,

    /// Hash-table joins are lowered as such (nested loop otherwise)
    #[serde(default = "default_true")]
    pub hash_join_enabled: bool,

    /// Depth bound for equivalence searches
    #[serde(default = "default_equivalence_search_depth")]
    pub equivalence_search_depth: usize,

    /// Check plan invariants and rule postconditions after every pass
    #[serde(default = "default_verify_plan")]
    pub verify_plan: bool,

    /// Record explain text before and after every pass
    #[serde(default)]
    pub trace_rules: bool,

    /// Compile deadline in milliseconds, checked between passes. 0 = none.
    #[serde(default)]
    pub compile_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_lookahead_quantum() -> usize {
    1
}
fn default_equivalence_search_depth() -> usize {
    32
}
fn default_verify_plan() -> bool {
    cfg!(debug_assertions)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. planrules.toml (base configuration)
    /// 2. planrules.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (PLANRULES_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("planrules.toml"))
            .merge(Toml::file("planrules.local.toml"))
            .merge(Env::prefixed("PLANRULES_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PLANRULES_").split("__"))
            .extract()
    }

    /// Key-value view of the properties the passes consume
    pub fn properties(&self) -> BTreeMap<&'static str, String> {
        let opt = &self.optimizer;
        let mut props = BTreeMap::new();
        props.insert("implicitAggregate", opt.implicit_aggregate.to_string());
        props.insert("mapJoinEnabled", opt.map_join_enabled.to_string());
        props.insert("lookaheadQuantum", opt.lookahead_quantum.to_string());
        props.insert("bloomFilterEnabled", opt.bloom_filter_enabled.to_string());
        props.insert("hashJoinEnabled", opt.hash_join_enabled.to_string());
        props
    }

    /// Overlay one property by its key-value name
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<(), String> {
        let opt = &mut self.optimizer;
        let parse_bool = |v: &str| {
            v.parse::<bool>()
                .map_err(|_| format!("Invalid boolean for {key}: '{v}'"))
        };
        match key {
            "implicitAggregate" => {
                opt.implicit_aggregate = ImplicitAggregate::parse(value)
                    .ok_or_else(|| format!("Invalid implicitAggregate: '{value}'"))?;
            }
            "mapJoinEnabled" => opt.map_join_enabled = parse_bool(value)?,
            "bloomFilterEnabled" => opt.bloom_filter_enabled = parse_bool(value)?,
            "hashJoinEnabled" => opt.hash_join_enabled = parse_bool(value)?,
            "lookaheadQuantum" => {
                opt.lookahead_quantum = value
                    .parse()
                    .map_err(|_| format!("Invalid lookaheadQuantum: '{value}'"))?;
            }
            _ => return Err(format!("Unknown property: '{key}'")),
        }
        Ok(())
    }

    /// Compile deadline, if any
    pub fn compile_timeout(&self) -> Option<Duration> {
        match self.optimizer.compile_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            optimizer: OptimizerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            implicit_aggregate: ImplicitAggregate::Error,
            map_join_enabled: true,
            lookahead_quantum: default_lookahead_quantum(),
            bloom_filter_enabled: true,
            hash_join_enabled: true,
            equivalence_search_depth: default_equivalence_search_depth(),
            verify_plan: default_verify_plan(),
            trace_rules: false,
            compile_timeout_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_optimizer_config() {
        let config = Config::default();
        assert_eq!(config.optimizer.implicit_aggregate, ImplicitAggregate::Error);
        assert!(config.optimizer.map_join_enabled);
        assert!(config.optimizer.bloom_filter_enabled);
        assert!(config.optimizer.hash_join_enabled);
        assert_eq!(config.optimizer.lookahead_quantum, 1);
        assert_eq!(config.optimizer.equivalence_search_depth, 32);
        assert!(config.compile_timeout().is_none());
    }

    #[test]
    fn test_default_logging_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::default();
        config.optimizer.implicit_aggregate = ImplicitAggregate::FirstIfUnique;
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[optimizer]"));
        assert!(toml_str.contains("implicit_aggregate = \"first_if_unique\""));
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.optimizer.implicit_aggregate, ImplicitAggregate::FirstIfUnique);
    }

    #[test]
    fn test_implicit_aggregate_serde() {
        let json = serde_json::to_string(&ImplicitAggregate::First).unwrap();
        assert_eq!(json, "\"first\"");
        let parsed: ImplicitAggregate = serde_json::from_str("\"first_if_unique\"").unwrap();
        assert_eq!(parsed, ImplicitAggregate::FirstIfUnique);
    }

    #[test]
    fn test_properties_view() {
        let config = Config::default();
        let props = config.properties();
        assert_eq!(props["implicitAggregate"], "error");
        assert_eq!(props["mapJoinEnabled"], "true");
        assert_eq!(props["lookaheadQuantum"], "1");
    }

    #[test]
    fn test_set_property() {
        let mut config = Config::default();
        config.set_property("implicitAggregate", "firstIfUnique").unwrap();
        config.set_property("bloomFilterEnabled", "false").unwrap();
        config.set_property("lookaheadQuantum", "8").unwrap();
        assert_eq!(config.optimizer.implicit_aggregate, ImplicitAggregate::FirstIfUnique);
        assert!(!config.optimizer.bloom_filter_enabled);
        assert_eq!(config.optimizer.lookahead_quantum, 8);

        assert!(config.set_property("implicitAggregate", "sometimes").is_err());
        assert!(config.set_property("noSuchKey", "1").is_err());
    }

    #[test]
    fn test_compile_timeout() {
        let mut config = Config::default();
        config.optimizer.compile_timeout_ms = 250;
        assert_eq!(config.compile_timeout(), Some(Duration::from_millis(250)));
    }
}
