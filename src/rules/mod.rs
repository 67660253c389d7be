//! # Rewrite Rules
//!
//! Ordered rewrite passes applied to a plan between SQL-to-plan conversion
//! and physical operator generation.
//!
//! ```text
//! PlanGraph -> ColumnEquivalence -> AggregateMapper -> AggregateToDistinct
//!           -> OuterJoinPromoter -> NestedLoopMapper -> MapFolder
//!           -> SortSplitter -> PlanGraph (ready for operator generation)
//! ```
//!
//! Every pass mutates the shared `PlanContext` in place; an error from any
//! pass aborts the whole compilation.

pub mod aggregate_mapper;
pub mod aggregate_to_distinct;
pub mod column_equivalence;
pub mod invariants;
pub mod map_folder;
pub mod nested_loop_mapper;
pub mod outer_join_promoter;
pub mod sort_splitter;

pub use aggregate_mapper::AggregateMapper;
pub use aggregate_to_distinct::AggregateToDistinctMapper;
pub use column_equivalence::ColumnEquivalenceFinder;
pub use invariants::PlanInvariants;
pub use map_folder::MapFolder;
pub use nested_loop_mapper::NestedLoopMapper;
pub use outer_join_promoter::OuterJoinPromoter;
pub use sort_splitter::SortSplitter;

use crate::config::Config;
use crate::error::{PlanError, PlanResult};
use crate::pipeline_trace::PipelineTrace;
use crate::plan::{NodeId, PlanGraph};
use crate::schema::Schema;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info_span};

/// Everything a pass sees: the plan, the catalog and the configuration
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub plan: PlanGraph,
    pub schema: Arc<Schema>,
    pub config: Config,
}

impl PlanContext {
    pub fn new(plan: PlanGraph, schema: Arc<Schema>, config: Config) -> Self {
        PlanContext {
            plan,
            schema,
            config,
        }
    }

    pub fn root(&self) -> PlanResult<NodeId> {
        self.plan.root()
    }
}

/// One rewrite pass
pub trait PlanRule {
    fn name(&self) -> &'static str;

    /// Rewrite the plan in place
    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()>;

    /// Shape guarantees after `apply`, checked when plan verification is on
    fn check_postconditions(&self, _plan: &PlanContext) -> PlanResult<()> {
        Ok(())
    }
}

/// Applies an ordered list of rules
pub struct RulesDriver {
    rules: Vec<Box<dyn PlanRule>>,
}

impl RulesDriver {
    pub fn new(rules: Vec<Box<dyn PlanRule>>) -> Self {
        RulesDriver { rules }
    }

    /// The standard pipeline
    pub fn default_rules() -> Vec<Box<dyn PlanRule>> {
        vec![
            Box::new(ColumnEquivalenceFinder),
            Box::new(AggregateMapper),
            Box::new(AggregateToDistinctMapper),
            Box::new(OuterJoinPromoter),
            Box::new(NestedLoopMapper),
            Box::new(MapFolder),
            Box::new(SortSplitter),
        ]
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Run every rule in order. The compile deadline is checked between
    /// rules; a rule is never interrupted.
    pub fn apply(&self, plan: &mut PlanContext) -> PlanResult<PipelineTrace> {
        let started = Instant::now();
        let budget = plan.config.compile_timeout();
        let verify = plan.config.optimizer.verify_plan;
        let mut trace = PipelineTrace::new(plan.config.optimizer.trace_rules);
        trace.record_input(&plan.plan);

        for rule in &self.rules {
            if let Some(budget) = budget {
                let elapsed = started.elapsed();
                if elapsed > budget {
                    return Err(PlanError::Timeout { elapsed, budget });
                }
            }

            let span = info_span!("rule", name = rule.name());
            let _guard = span.enter();
            let before = trace.snapshot(&plan.plan);
            let rule_started = Instant::now();

            rule.apply(plan)?;

            if verify {
                PlanInvariants::check(&plan.plan)?;
                rule.check_postconditions(plan)?;
            }
            debug!(
                nodes = plan.plan.node_count(),
                elapsed_us = u64::try_from(rule_started.elapsed().as_micros()).unwrap_or(u64::MAX),
                "rule applied"
            );
            trace.record_rule(rule.name(), before, &plan.plan, rule_started.elapsed());
        }
        Ok(trace)
    }
}

impl Default for RulesDriver {
    fn default() -> Self {
        RulesDriver::new(Self::default_rules())
    }
}

/// Compile `plan` with the standard pipeline
pub fn optimize(plan: PlanGraph, schema: Arc<Schema>, config: Config) -> PlanResult<PlanGraph> {
    let mut context = PlanContext::new(plan, schema, config);
    RulesDriver::default().apply(&mut context)?;
    Ok(context.plan)
}
