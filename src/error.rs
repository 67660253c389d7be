//! # Plan Errors
//!
//! Every error aborts the whole compilation; no partial plan is usable and
//! nothing is retried (the passes are deterministic).
//!
//! | Variant | Kind |
//! |---------|------|
//! | `Unsupported` | unsupported SQL shape (user error) |
//! | `GroupBy` | ungrouped column use (user error) |
//! | `Internal` | plan shape invariant violated (defect) |
//! | `Schema` | catalog lookup failed |
//! | `Timeout` | compile deadline expired between passes |
//! | `Config` | configuration could not be extracted |

use std::time::Duration;

/// Result alias used throughout the crate
pub type PlanResult<T> = Result<T, PlanError>;

/// Error raised by a rewrite pass or the rule driver
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// The statement uses a construct the pipeline cannot compile
    #[error("Unsupported SQL: {message} ({construct})")]
    Unsupported {
        message: String,
        /// The offending source construct
        construct: String,
    },

    /// A column is used outside the GROUP BY without an aggregate
    #[error("Column {column} must appear in the GROUP BY clause or be used in an aggregate function: {message}")]
    GroupBy { column: String, message: String },

    /// The plan violates a shape invariant
    #[error("Internal planner error: {message}\n{subtree}")]
    Internal {
        message: String,
        /// Explain text of the malformed subtree
        subtree: String,
    },

    /// Catalog metadata missing or inconsistent
    #[error("Schema error: {0}")]
    Schema(String),

    /// Compile deadline expired
    #[error("Plan compilation exceeded {budget:?} (ran for {elapsed:?})")]
    Timeout { elapsed: Duration, budget: Duration },

    /// Configuration extraction failed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PlanError {
    pub fn unsupported(message: impl Into<String>, construct: impl Into<String>) -> Self {
        PlanError::Unsupported {
            message: message.into(),
            construct: construct.into(),
        }
    }

    pub fn internal(message: impl Into<String>, subtree: impl Into<String>) -> Self {
        PlanError::Internal {
            message: message.into(),
            subtree: subtree.into(),
        }
    }

    pub fn group_by(column: impl Into<String>, message: impl Into<String>) -> Self {
        PlanError::GroupBy {
            column: column.into(),
            message: message.into(),
        }
    }

    /// True for errors caused by the statement rather than by a planner defect
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PlanError::Unsupported { .. } | PlanError::GroupBy { .. }
        )
    }
}

impl From<figment::Error> for PlanError {
    fn from(err: figment::Error) -> Self {
        PlanError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        assert!(PlanError::unsupported("aggregate not allowed here", "SUM(x)").is_user_error());
        assert!(PlanError::group_by("t.a", "no unique index").is_user_error());
        assert!(!PlanError::internal("dangling column", "Select[..]").is_user_error());
        assert!(!PlanError::Schema("no table".to_string()).is_user_error());
    }

    #[test]
    fn test_display_carries_construct() {
        let err = PlanError::unsupported("nested aggregate functions", "SUM(COUNT(x))");
        let text = err.to_string();
        assert!(text.contains("nested aggregate functions"));
        assert!(text.contains("SUM(COUNT(x))"));
    }
}
