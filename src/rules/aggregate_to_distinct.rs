//! AggregateSources left without aggregate functions are plain duplicate
//! elimination: `AggregateSource(keys, [])` becomes `Distinct(Project(keys))`,
//! and one with no keys either is removed.
//!
//! A Sort above the new Distinct (possibly through Selects) whose keys are
//! all columns of the Project is folded into the Distinct as an explicit
//! sort, since sorting on those keys also groups the duplicates.

use super::{PlanContext, PlanRule};
use crate::error::PlanResult;
use crate::plan::{
    DistinctImplementation, Expr, NodeFinder, NodeId, NodeKind, OrderByExpr, PlanGraph,
};
use tracing::debug;

pub struct AggregateToDistinctMapper;

impl PlanRule for AggregateToDistinctMapper {
    fn name(&self) -> &'static str {
        "AggregateToDistinctMapper"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let root = plan.root()?;
        let sources = NodeFinder::new(|kind| {
            matches!(kind, NodeKind::AggregateSource { aggregates, .. } if aggregates.is_empty())
        })
        .find(&mut plan.plan, root)?;

        for source in sources {
            to_distinct(&mut plan.plan, source)?;
        }
        Ok(())
    }
}

fn to_distinct(graph: &mut PlanGraph, source: NodeId) -> PlanResult<()> {
    let NodeKind::AggregateSource {
        input, group_by, ..
    } = graph.kind(source)?
    else {
        return Err(graph.malformed(source, "expected an AggregateSource"));
    };
    let input = *input;
    let group_by = group_by.clone();

    if group_by.is_empty() {
        debug!(source = %source, "removing empty aggregate source");
        return graph.splice_out(source);
    }

    let width = group_by.len();
    let project = graph.add(NodeKind::Project {
        input,
        fields: group_by,
    });
    let distinct = graph.add(NodeKind::Distinct {
        input: project,
        implementation: DistinctImplementation::Unsorted,
        orderings: Vec::new(),
    });
    graph.replace_node(source, distinct)?;
    graph.discard(source);
    graph.remap_columns(source, project, |position| (position < width).then_some(position))?;
    debug!(source = %source, distinct = %distinct, "aggregate source without aggregates is a distinct");

    absorb_sort(graph, distinct, project, width)
}

fn absorb_sort(
    graph: &mut PlanGraph,
    distinct: NodeId,
    project: NodeId,
    width: usize,
) -> PlanResult<()> {
    let mut current = distinct;
    let sort = loop {
        let Some(parent) = graph.output(current)? else {
            return Ok(());
        };
        match graph.kind(parent)? {
            NodeKind::Select { .. } => current = parent,
            NodeKind::Sort { .. } => break parent,
            _ => return Ok(()),
        }
    };

    let NodeKind::Sort { orderings, .. } = graph.kind(sort)? else {
        return Ok(());
    };
    let sorted_positions: Option<Vec<usize>> = orderings
        .iter()
        .map(|o| match &o.expr {
            Expr::Column(column) if column.source == project => Some(column.position),
            _ => None,
        })
        .collect();
    let Some(sorted_positions) = sorted_positions else {
        return Ok(());
    };

    let mut orderings = orderings.clone();
    for position in 0..width {
        if !sorted_positions.contains(&position) {
            orderings.push(OrderByExpr {
                expr: Expr::Column(graph.column_expr(project, position)?),
                ascending: true,
            });
        }
    }
    if let NodeKind::Distinct {
        implementation,
        orderings: distinct_orderings,
        ..
    } = graph.kind_mut(distinct)?
    {
        *implementation = DistinctImplementation::ExplicitSort;
        *distinct_orderings = orderings;
    }
    debug!(sort = %sort, distinct = %distinct, "sort folded into distinct");
    graph.splice_out(sort)
}
