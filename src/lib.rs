//! # planrules
//!
//! Rule-based rewrite pipeline for type-resolved SQL query plans. A plan
//! arrives from SQL-to-plan conversion as a logical operator tree and
//! leaves in the shape physical operator generation expects: joins lowered
//! to nested-loop maps, correlation folded into loop nesting, aggregates
//! bound to their aggregation source and sorts split from their keys.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! PlanGraph (type-resolved)
//!     ↓
//! [ColumnEquivalenceFinder]   → equivalences + non-null columns per query
//!     ↓
//! [AggregateMapper]           → aggregates bound to AggregateSource columns
//!     ↓
//! [AggregateToDistinctMapper] → key-only aggregation becomes Distinct
//!     ↓
//! [OuterJoinPromoter]         → null-rejected outer joins become INNER
//!     ↓
//! [NestedLoopMapper]          → JoinNode lowered to MapJoin / hash / bloom
//!     ↓
//! [MapFolder]                 → join types folded, loops nested, captures
//!     ↓
//! [SortSplitter]              → Sort keys computed by an input Project
//!     ↓
//! PlanGraph (physical-ready)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use planrules::{optimize, Config, Schema};
//!
//! let config = Config::load()?;
//! let plan = optimize(plan, Arc::new(schema), config)?;
//! println!("{}", plan.explain());
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `plan` | Arena plan graph, expressions, traversal, explain output |
//! | `schema` | Read-only catalog metadata |
//! | `equivalence` | Bounded equivalence classes |
//! | `rules` | Rewrite passes and the rule driver |
//! | `pipeline_trace` | Per-rule trace of a compilation |
//! | `config` | Configuration loading |
//! | `error` | Error taxonomy |

pub mod config;
pub mod equivalence;
pub mod error;
pub mod pipeline_trace;
pub mod plan;
pub mod rules;
pub mod schema;

// Re-export public types
pub use config::{Config, ImplicitAggregate, LoggingConfig, OptimizerConfig};
pub use equivalence::EquivalenceFinder;
pub use error::{PlanError, PlanResult};
pub use pipeline_trace::{PipelineTrace, RewriteStats, RuleTrace};
pub use plan::builders::PlanBuilder;
pub use plan::{Expr, NodeId, NodeKind, PlanGraph};
pub use rules::{optimize, PlanContext, PlanRule, RulesDriver};
pub use schema::{Schema, TableDef};
