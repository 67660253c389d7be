//! Give every Sort a Project input that computes its keys.
//!
//! ```text
//! Project[a.x, a.y + 1]          Project[#p.0, #p.1]      (or removed)
//!   Sort[a.z]              =>      Sort[#p.2]
//!     TableSource(a)                 Project#p[a.x, a.y + 1, a.z]
//!                                      TableSource(a)
//! ```
//!
//! The input Project starts with the fields of the output Project (found
//! above the Sort, possibly through a Limit) and appends the sort keys it
//! does not already compute. When no key had to be appended the output
//! Project is redundant and is removed.
//!
//! A Sort with no output Project still gets an input Project. It carries
//! the input's whole row when the sorted rows are returned as they are,
//! then every column the operators above read from below the Sort, then the
//! keys. Those readers are rewritten to the new Project.

use super::{PlanContext, PlanRule};
use crate::error::PlanResult;
use crate::plan::{
    ColumnExpr, ColumnRedirect, ColumnsOutside, Expr, NodeFinder, NodeId, NodeKind, OrderByExpr,
    PlanGraph,
};
use tracing::debug;

pub struct SortSplitter;

impl PlanRule for SortSplitter {
    fn name(&self) -> &'static str {
        "SortSplitter"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let root = plan.root()?;
        let sorts = NodeFinder::new(|kind| matches!(kind, NodeKind::Sort { .. }))
            .find(&mut plan.plan, root)?;
        for sort in sorts {
            split(&mut plan.plan, sort)?;
        }
        Ok(())
    }

    fn check_postconditions(&self, plan: &PlanContext) -> PlanResult<()> {
        for id in plan.plan.live_nodes() {
            let NodeKind::Sort { input, .. } = plan.plan.kind(id)? else {
                continue;
            };
            if !matches!(plan.plan.kind(*input)?, NodeKind::Project { .. }) {
                return Err(plan.plan.malformed(id, "sort input is not a project"));
            }
        }
        Ok(())
    }
}

/// The Project consuming the sorted rows, looking through a Limit
fn output_project(graph: &PlanGraph, sort: NodeId) -> PlanResult<Option<NodeId>> {
    let mut current = sort;
    while let Some(parent) = graph.output(current)? {
        match graph.kind(parent)? {
            NodeKind::Project { .. } => return Ok(Some(parent)),
            NodeKind::Limit { .. } => current = parent,
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn split(graph: &mut PlanGraph, sort: NodeId) -> PlanResult<()> {
    let NodeKind::Sort { input, orderings } = graph.kind(sort)? else {
        return Err(graph.malformed(sort, "expected a Sort"));
    };
    if matches!(graph.kind(*input)?, NodeKind::Project { .. }) {
        return Ok(());
    }
    let (input, orderings) = (*input, orderings.clone());

    let Some(output) = output_project(graph, sort)? else {
        return split_unprojected(graph, sort, input, orderings);
    };
    let NodeKind::Project {
        fields: output_fields,
        ..
    } = graph.kind(output)?
    else {
        return Err(graph.malformed(output, "expected a Project"));
    };
    let width = output_fields.len();
    let fields = output_fields.clone();
    let (project, appended) = insert_key_project(graph, sort, input, fields, orderings)?;

    if appended > 0 {
        let mut rewritten = Vec::with_capacity(width);
        for position in 0..width {
            rewritten.push(Expr::Column(graph.column_expr(project, position)?));
        }
        if let NodeKind::Project { fields, .. } = graph.kind_mut(output)? {
            *fields = rewritten;
        }
        debug!(sort = %sort, project = %project, keys = appended, "sort split");
    } else {
        graph.splice_out(output)?;
        graph.remap_columns(output, project, Some)?;
        debug!(sort = %sort, project = %project, "sort split, output project removed");
    }
    Ok(())
}

fn split_unprojected(
    graph: &mut PlanGraph,
    sort: NodeId,
    input: NodeId,
    orderings: Vec<OrderByExpr>,
) -> PlanResult<()> {
    let mut fields: Vec<Expr> = if is_returned_as_is(graph, sort)? {
        row_columns(graph, input)?
            .into_iter()
            .map(Expr::Column)
            .collect()
    } else {
        Vec::new()
    };

    let scope = graph.enclosing_query(sort)?;
    let sources = graph.sources_below(input)?;
    for column in ColumnsOutside::new(sort, sources).collect(graph, scope)? {
        let field = Expr::Column(column);
        if !fields.contains(&field) {
            fields.push(field);
        }
    }

    let columns: Vec<ColumnExpr> = fields.iter().filter_map(Expr::as_column).cloned().collect();
    let (project, appended) = insert_key_project(graph, sort, input, fields, orderings)?;
    let mut replacements = Vec::with_capacity(columns.len());
    for position in 0..columns.len() {
        replacements.push(graph.column_expr(project, position)?);
    }
    ColumnRedirect::new(sort, columns, replacements).apply(graph, scope)?;
    debug!(sort = %sort, project = %project, keys = appended, "sort split without an output project");
    Ok(())
}

/// Add a Project over `input` computing `fields` and any sort key they lack,
/// and point the keys at it. Returns the Project and the number of keys
/// appended.
fn insert_key_project(
    graph: &mut PlanGraph,
    sort: NodeId,
    input: NodeId,
    mut fields: Vec<Expr>,
    mut orderings: Vec<OrderByExpr>,
) -> PlanResult<(NodeId, usize)> {
    let width = fields.len();
    let mut key_positions = Vec::with_capacity(orderings.len());
    for ordering in &orderings {
        let position = match fields.iter().position(|field| *field == ordering.expr) {
            Some(position) => position,
            None => {
                fields.push(ordering.expr.clone());
                fields.len() - 1
            }
        };
        key_positions.push(position);
    }
    let appended = fields.len() - width;

    let project = graph.add(NodeKind::Project { input, fields });
    graph.set_slot(sort, input, project)?;
    for (ordering, position) in orderings.iter_mut().zip(key_positions) {
        ordering.expr = Expr::Column(graph.column_expr(project, position)?);
    }
    if let NodeKind::Sort {
        orderings: slot, ..
    } = graph.kind_mut(sort)?
    {
        *slot = orderings;
    }
    Ok((project, appended))
}

/// Whether the sorted rows reach the statement result (or a derived table)
/// without an operator that picks columns out of them
fn is_returned_as_is(graph: &PlanGraph, sort: NodeId) -> PlanResult<bool> {
    let mut current = sort;
    while let Some(parent) = graph.output(current)? {
        match graph.kind(parent)? {
            NodeKind::Project { .. } | NodeKind::AggregateSource { .. } => return Ok(false),
            NodeKind::ResultSet { .. }
            | NodeKind::Query(_)
            | NodeKind::SubquerySource { .. }
            | NodeKind::UpdateInput { .. } => return Ok(true),
            _ => current = parent,
        }
    }
    Ok(false)
}

/// Columns making up the rows of `id`, in row order
fn row_columns(graph: &PlanGraph, id: NodeId) -> PlanResult<Vec<ColumnExpr>> {
    let kind = graph.kind(id)?;
    let width = match kind {
        NodeKind::TableSource(table) => Some(table.columns.len()),
        NodeKind::Project { fields, .. } => Some(fields.len()),
        NodeKind::AggregateSource {
            group_by,
            aggregates,
            ..
        } => Some(group_by.len() + aggregates.len()),
        NodeKind::SubquerySource { subquery, .. } => Some(graph.output_fields(*subquery)?.len()),
        _ => None,
    };
    if let Some(width) = width {
        return (0..width)
            .map(|position| graph.column_expr(id, position))
            .collect();
    }

    let inputs = match kind {
        NodeKind::MapJoin(map) if map.join_type.is_none() => vec![map.inner],
        NodeKind::Join(join) => vec![join.left, join.right],
        NodeKind::UsingHashTable { input, .. } | NodeKind::UsingBloomFilter { input, .. } => {
            vec![*input]
        }
        other => other.inputs(),
    };
    let mut columns = Vec::new();
    for input in inputs {
        columns.extend(row_columns(graph, input)?);
    }
    Ok(columns)
}
