//! Fold nested-loop maps into physical loop nesting.
//!
//! Four passes over every MapJoin, in order:
//!
//! 1. join semantics move into the inner side
//!    (`LEFT` -> NullIfEmpty, `SEMI` -> Limit 1, `ANTI` -> OnlyIfEmpty);
//! 2. a map whose outer input is another map is rotated so nesting reads
//!    as loop nesting: `Map(Map(a, b), c)` -> `Map(a, Map(b, c))`;
//! 3. the Selects above a map, up to and including a Project or
//!    UpdateInput, are moved inside the loop, between the map and its inner
//!    side;
//! 4. when the loop output is consumed by a Sort, an AggregateSource, a
//!    Distinct or another map, columns bound inside the loop but not emitted
//!    by its inner side are captured by a Project before they leave it.
//!
//! ```text
//! Project[a.x, b.y]             MapJoin()
//!   Select[b.y > 1]               TableSource(a)
//!     MapJoin(LEFT)        =>     Project[a.x, b.y]
//!       TableSource(a)              Select[b.y > 1]
//!       TableSource(b)                NullIfEmpty
//!                                       TableSource(b)
//! ```

use super::{PlanContext, PlanRule};
use crate::error::{PlanError, PlanResult};
use crate::plan::{
    ColumnRedirect, ColumnsOutside, Expr, JoinType, NodeFinder, NodeId, NodeKind, PlanGraph,
};
use tracing::{debug, trace};

pub struct MapFolder;

impl PlanRule for MapFolder {
    fn name(&self) -> &'static str {
        "MapFolder"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let graph = &mut plan.plan;
        let root = graph.root()?;

        for map in find_maps(graph, root)? {
            materialize_join_type(graph, map)?;
        }
        for map in find_maps(graph, root)? {
            unnest_outer(graph, map)?;
        }
        for map in find_maps(graph, root)? {
            fold(graph, map)?;
        }
        Ok(())
    }

    fn check_postconditions(&self, plan: &PlanContext) -> PlanResult<()> {
        for id in plan.plan.live_nodes() {
            if let NodeKind::MapJoin(map) = plan.plan.kind(id)? {
                if map.join_type.is_some() {
                    return Err(plan.plan.malformed(id, "map join type left after folding"));
                }
            }
        }
        Ok(())
    }
}

fn find_maps(graph: &mut PlanGraph, root: NodeId) -> PlanResult<Vec<NodeId>> {
    NodeFinder::new(|kind| matches!(kind, NodeKind::MapJoin(_))).find(graph, root)
}

fn map_sides(graph: &PlanGraph, map: NodeId) -> PlanResult<(NodeId, NodeId)> {
    match graph.kind(map)? {
        NodeKind::MapJoin(join) => Ok((join.outer, join.inner)),
        _ => Err(graph.malformed(map, "expected a MapJoin")),
    }
}

/// Point both sides of `map` and fix the output pointers of the new inputs
fn set_sides(graph: &mut PlanGraph, map: NodeId, outer: NodeId, inner: NodeId) -> PlanResult<()> {
    if let NodeKind::MapJoin(join) = graph.kind_mut(map)? {
        join.outer = outer;
        join.inner = inner;
    }
    graph.node_mut(outer)?.output = Some(map);
    graph.node_mut(inner)?.output = Some(map);
    Ok(())
}

fn materialize_join_type(graph: &mut PlanGraph, map: NodeId) -> PlanResult<()> {
    let NodeKind::MapJoin(join) = graph.kind(map)? else {
        return Err(graph.malformed(map, "expected a MapJoin"));
    };
    let (inner, join_type) = (join.inner, join.join_type);
    let Some(join_type) = join_type else {
        return Ok(());
    };

    match join_type {
        JoinType::Inner => {}
        JoinType::Left => {
            graph.wrap(inner, |input| NodeKind::NullIfEmpty { input })?;
        }
        JoinType::Semi => {
            graph.wrap(inner, |input| NodeKind::Limit {
                input,
                offset: 0,
                limit: Some(1),
            })?;
        }
        JoinType::Anti => {
            graph.wrap(inner, |input| NodeKind::OnlyIfEmpty { input })?;
        }
        JoinType::Right => {
            return Err(PlanError::unsupported(
                "complex join type",
                graph.explain_subtree(map),
            ));
        }
    }
    if let NodeKind::MapJoin(join) = graph.kind_mut(map)? {
        join.join_type = None;
    }
    trace!(map = %map, join_type = %join_type, "join type folded into inner side");
    Ok(())
}

/// Rotate outer-side maps until `map`'s outer input is not a map
fn unnest_outer(graph: &mut PlanGraph, map: NodeId) -> PlanResult<()> {
    loop {
        let (nested, c) = map_sides(graph, map)?;
        if !matches!(graph.kind(nested)?, NodeKind::MapJoin(_)) {
            return Ok(());
        }
        let (a, b) = map_sides(graph, nested)?;
        set_sides(graph, map, a, nested)?;
        set_sides(graph, nested, b, c)?;
        debug!(map = %map, nested = %nested, "outer map moved to inner side");
        unnest_outer(graph, nested)?;
    }
}

fn fold(graph: &mut PlanGraph, map: NodeId) -> PlanResult<()> {
    // Hash and bloom wrappers stay directly above their map.
    let mut head = map;
    while let Some(parent) = graph.output(head)? {
        let wraps_head = match graph.kind(parent)? {
            NodeKind::UsingHashTable { input, .. } | NodeKind::UsingBloomFilter { input, .. } => {
                *input == head
            }
            _ => false,
        };
        if !wraps_head {
            break;
        }
        head = parent;
    }

    let mut chain = Vec::new();
    let mut current = head;
    while let Some(parent) = graph.output(current)? {
        match graph.kind(parent)? {
            NodeKind::Select { .. } => chain.push(parent),
            NodeKind::Project { .. } | NodeKind::UpdateInput { .. } => {
                chain.push(parent);
                break;
            }
            _ => break,
        }
        current = parent;
    }

    if let (Some(&bottom), Some(&top)) = (chain.first(), chain.last()) {
        let (_, inner) = map_sides(graph, map)?;
        graph.replace_node(top, head)?;
        graph.set_slot(bottom, head, inner)?;
        let (outer, _) = map_sides(graph, map)?;
        set_sides(graph, map, outer, top)?;
        debug!(map = %map, moved = chain.len(), "operators moved inside loop");

        if matches!(graph.kind(top)?, NodeKind::Project { .. })
            && !is_referenced(graph, top)?
            && !is_positionally_consumed(graph, top)?
        {
            debug!(map = %map, project = %top, "dead project removed from loop");
            graph.splice_out(top)?;
        }
    }

    if captures_loop_output(graph, head)? {
        capture(graph, map, head)?;
    }
    Ok(())
}

/// Whether any column expression reads from `source`
fn is_referenced(graph: &PlanGraph, source: NodeId) -> PlanResult<bool> {
    for id in graph.live_nodes() {
        for expr in graph.kind(id)?.expressions() {
            if expr.columns().iter().any(|column| column.source == source) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Whether the rows of `node` reach a consumer that reads them by position
fn is_positionally_consumed(graph: &PlanGraph, node: NodeId) -> PlanResult<bool> {
    let mut current = node;
    while let Some(parent) = graph.output(current)? {
        match graph.kind(parent)? {
            NodeKind::ResultSet { .. }
            | NodeKind::UpdateInput { .. }
            | NodeKind::Query(_)
            | NodeKind::SubquerySource { .. } => return Ok(true),
            NodeKind::MapJoin(join) if join.inner == current => {}
            NodeKind::Select { .. }
            | NodeKind::Sort { .. }
            | NodeKind::Limit { .. }
            | NodeKind::Distinct { .. }
            | NodeKind::NullIfEmpty { .. }
            | NodeKind::OnlyIfEmpty { .. }
            | NodeKind::UsingHashTable { .. }
            | NodeKind::UsingBloomFilter { .. } => {}
            _ => return Ok(false),
        }
        current = parent;
    }
    Ok(false)
}

/// Consumers that read loop-bound columns after the loop has finished
fn captures_loop_output(graph: &PlanGraph, head: NodeId) -> PlanResult<bool> {
    let Some(parent) = graph.output(head)? else {
        return Ok(false);
    };
    Ok(match graph.kind(parent)? {
        NodeKind::MapJoin(_)
        | NodeKind::Sort { .. }
        | NodeKind::AggregateSource { .. }
        | NodeKind::Distinct { .. } => true,
        _ => false,
    })
}

fn capture(graph: &mut PlanGraph, map: NodeId, head: NodeId) -> PlanResult<()> {
    let (outer, inner) = map_sides(graph, map)?;
    // Outer sides of maps nested in `inner` are bound inside this loop too,
    // but their columns are not part of the rows leaving it.
    let emitted = graph.row_sources(inner)?;
    let mut loop_sources = graph.sources_below(outer)?;
    loop_sources.extend(graph.sources_below(inner)?);

    let scope = graph.enclosing_query(head)?;
    let columns = ColumnsOutside::new(head, loop_sources).collect(graph, scope)?;
    if columns.iter().all(|column| emitted.contains(&column.source)) {
        return Ok(());
    }

    let captured = columns.len();
    let fields: Vec<Expr> = columns.iter().cloned().map(Expr::Column).collect();
    let project = graph.wrap(inner, |input| NodeKind::Project { input, fields })?;
    let mut replacements = Vec::with_capacity(captured);
    for position in 0..captured {
        replacements.push(graph.column_expr(project, position)?);
    }
    ColumnRedirect::new(head, columns, replacements).apply(graph, scope)?;
    debug!(map = %map, project = %project, captured, "loop columns captured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DataType, MapJoin, ResultType, TableSource};

    fn table(graph: &mut PlanGraph, name: &str) -> NodeId {
        graph.add(NodeKind::TableSource(TableSource {
            table: name.to_string(),
            alias: None,
            columns: vec![("x".to_string(), ResultType::nullable(DataType::Int))],
            required: false,
        }))
    }

    fn map(graph: &mut PlanGraph, outer: NodeId, inner: NodeId) -> NodeId {
        graph.add(NodeKind::MapJoin(MapJoin {
            outer,
            inner,
            join_type: None,
            lookahead_quantum: 1,
        }))
    }

    #[test]
    fn test_outer_map_is_rotated() {
        let mut graph = PlanGraph::new();
        let a = table(&mut graph, "a");
        let b = table(&mut graph, "b");
        let c = table(&mut graph, "c");
        let nested = map(&mut graph, a, b);
        let top = map(&mut graph, nested, c);
        graph.set_root(top);

        unnest_outer(&mut graph, top).unwrap();

        assert_eq!(map_sides(&graph, top).unwrap(), (a, nested));
        assert_eq!(map_sides(&graph, nested).unwrap(), (b, c));
        assert_eq!(graph.output(a).unwrap(), Some(top));
        assert_eq!(graph.output(nested).unwrap(), Some(top));
        assert_eq!(graph.output(b).unwrap(), Some(nested));
        assert_eq!(graph.output(c).unwrap(), Some(nested));
    }

    #[test]
    fn test_right_join_type_is_rejected() {
        let mut graph = PlanGraph::new();
        let a = table(&mut graph, "a");
        let b = table(&mut graph, "b");
        let top = graph.add(NodeKind::MapJoin(MapJoin {
            outer: a,
            inner: b,
            join_type: Some(JoinType::Right),
            lookahead_quantum: 1,
        }));
        graph.set_root(top);

        let err = materialize_join_type(&mut graph, top).unwrap_err();
        assert!(err.is_user_error());
    }
}
