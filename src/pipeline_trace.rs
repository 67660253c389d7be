//! # Pipeline Trace
//!
//! Records what each rewrite rule did to the plan: node counts and timing
//! always, explain text before and after each rule when tracing is enabled.
//!
//! Useful for debugging how a statement's plan changes shape through the
//! pipeline (see the `planrules-debug` binary).

use crate::plan::PlanGraph;
use serde::Serialize;
use std::time::Duration;

/// Trace of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineTrace {
    /// Explain text is captured only when enabled
    pub enabled: bool,

    /// Plan as handed to the first rule
    pub input: Option<String>,

    /// One entry per applied rule, in order
    pub rules: Vec<RuleTrace>,

    pub stats: RewriteStats,
}

/// What one rule did
#[derive(Debug, Clone, Serialize)]
pub struct RuleTrace {
    pub rule: String,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub elapsed_us: u64,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl RuleTrace {
    /// Whether the rule changed the plan; `None` when explain text was not captured
    pub fn changed(&self) -> Option<bool> {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => Some(before != after),
            _ => None,
        }
    }
}

/// Totals over the run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RewriteStats {
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub rules_applied: usize,
    pub total_us: u64,
}

/// Plan state captured before a rule runs
#[derive(Debug, Clone)]
pub struct PlanSnapshot {
    nodes: usize,
    explain: Option<String>,
}

impl PipelineTrace {
    pub fn new(enabled: bool) -> Self {
        PipelineTrace {
            enabled,
            input: None,
            rules: Vec::new(),
            stats: RewriteStats::default(),
        }
    }

    /// Record the plan before the first rule
    pub fn record_input(&mut self, plan: &PlanGraph) {
        self.stats.nodes_before = plan.node_count();
        self.stats.nodes_after = self.stats.nodes_before;
        if self.enabled {
            self.input = Some(plan.explain());
        }
    }

    pub fn snapshot(&self, plan: &PlanGraph) -> PlanSnapshot {
        PlanSnapshot {
            nodes: plan.node_count(),
            explain: self.enabled.then(|| plan.explain()),
        }
    }

    /// Record a rule's effect on the plan
    pub fn record_rule(
        &mut self,
        rule: &str,
        before: PlanSnapshot,
        plan: &PlanGraph,
        elapsed: Duration,
    ) {
        let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let nodes_after = plan.node_count();
        self.rules.push(RuleTrace {
            rule: rule.to_string(),
            nodes_before: before.nodes,
            nodes_after,
            elapsed_us,
            before: before.explain,
            after: self.enabled.then(|| plan.explain()),
        });
        self.stats.nodes_after = nodes_after;
        self.stats.rules_applied += 1;
        self.stats.total_us = self.stats.total_us.saturating_add(elapsed_us);
    }

    /// Trace as JSON, for tooling
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Format the trace for display
    pub fn format_trace(&self) -> String {
        let mut output = String::new();

        output.push_str("═══════════════════════════════════════════════════════════\n");
        output.push_str("                    PIPELINE TRACE                          \n");
        output.push_str("═══════════════════════════════════════════════════════════\n\n");

        if let Some(input) = &self.input {
            output.push_str("┌---------------------------------------------------------┐\n");
            output.push_str("| INPUT PLAN                                              |\n");
            output.push_str("`---------------------------------------------------------┘\n");
            output.push_str(&indent(input, 2));
            output.push('\n');
        }

        for trace in &self.rules {
            output.push_str("┌---------------------------------------------------------┐\n");
            output.push_str(&format!("| {:<56}|\n", trace.rule));
            output.push_str("`---------------------------------------------------------┘\n");
            output.push_str(&format!(
                "  Nodes: {} -> {} ({} us)\n",
                trace.nodes_before, trace.nodes_after, trace.elapsed_us
            ));
            match (trace.changed(), &trace.after) {
                (Some(false), _) => output.push_str("  (no change)\n"),
                (_, Some(after)) => output.push_str(&indent(after, 2)),
                (_, None) => {}
            }
            output.push('\n');
        }

        output.push_str(&format!(
            "  Rules applied: {}, nodes {} -> {}, {} us total\n",
            self.stats.rules_applied,
            self.stats.nodes_before,
            self.stats.nodes_after,
            self.stats.total_us
        ));
        output.push_str("═══════════════════════════════════════════════════════════\n");
        output
    }
}

fn indent(text: &str, width: usize) -> String {
    let prefix = " ".repeat(width);
    text.lines().map(|line| format!("{prefix}{line}\n")).collect()
}
