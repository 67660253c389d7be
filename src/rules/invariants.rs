//! Plan shape checks run between passes when `verify_plan` is on.

use super::{PlanContext, PlanRule};
use crate::error::{PlanError, PlanResult};
use crate::plan::{Expr, NodeId, NodeKind, PlanGraph};
use std::collections::{BTreeMap, BTreeSet};

/// Generic plan invariants. Also usable as a standalone pass.
pub struct PlanInvariants;

impl PlanInvariants {
    /// Every input is live and points back to its parent, every column and
    /// subquery reference resolves to a source the reading node can see, and
    /// no aggregate list has duplicates.
    pub fn check(graph: &PlanGraph) -> PlanResult<()> {
        let root = graph.root()?;
        if !graph.contains(root) {
            return Err(PlanError::internal(
                format!("plan root {root} not found"),
                String::new(),
            ));
        }

        let owners = subquery_owners(graph)?;
        for id in graph.live_nodes() {
            let kind = graph.kind(id)?;
            for input in kind.inputs() {
                if !graph.contains(input) {
                    return Err(graph.malformed(id, &format!("input {input} not found")));
                }
                if graph.output(input)? != Some(id) {
                    return Err(graph.malformed(input, &format!("output does not point at {id}")));
                }
            }

            for expr in kind.expressions() {
                let mut dangling = None;
                expr.for_each(&mut |e| match e {
                    Expr::Column(column) => {
                        let resolves = graph
                            .kind(column.source)
                            .is_ok_and(NodeKind::is_column_source);
                        if !resolves && dangling.is_none() {
                            dangling = Some(format!("column {} has no live source", column.name));
                        }
                    }
                    Expr::Subquery(subquery) if !graph.contains(subquery.subquery) => {
                        if dangling.is_none() {
                            dangling = Some(format!("subquery {} not found", subquery.subquery));
                        }
                    }
                    _ => {}
                });
                if let Some(message) = dangling {
                    return Err(graph.malformed(id, &message));
                }
            }

            let columns: Vec<_> = kind
                .expressions()
                .into_iter()
                .flat_map(|e| e.columns())
                .collect();
            if !columns.is_empty() {
                let visible = visible_sources(graph, id, &owners)?;
                if let Some(column) = columns.iter().find(|c| !visible.contains(&c.source)) {
                    return Err(graph.malformed(
                        id,
                        &format!("column {} is not reachable from {id}", column.name),
                    ));
                }
            }

            if let NodeKind::AggregateSource { aggregates, .. } = kind {
                for (i, aggregate) in aggregates.iter().enumerate() {
                    if aggregates[..i].contains(aggregate) {
                        return Err(graph.malformed(
                            id,
                            &format!("duplicate aggregate {aggregate}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Node holding the expression that embeds each subquery plan
fn subquery_owners(graph: &PlanGraph) -> PlanResult<BTreeMap<NodeId, NodeId>> {
    let mut owners = BTreeMap::new();
    for id in graph.live_nodes() {
        for expr in graph.kind(id)?.expressions() {
            expr.for_each(&mut |e| {
                if let Expr::Subquery(subquery) = e {
                    owners.insert(subquery.subquery, id);
                }
            });
        }
    }
    Ok(owners)
}

/// Sources whose columns `node` may read: the rows of its inputs, the outer
/// row of every loop it runs inside, and the scopes enclosing its query.
fn visible_sources(
    graph: &PlanGraph,
    node: NodeId,
    owners: &BTreeMap<NodeId, NodeId>,
) -> PlanResult<BTreeSet<NodeId>> {
    let mut visible = BTreeSet::new();
    for input in graph.inputs(node)? {
        visible.extend(graph.row_sources(input)?);
    }

    let mut seen = BTreeSet::new();
    let mut current = node;
    while seen.insert(current) {
        if let NodeKind::Query(query) = graph.kind(current)? {
            visible.extend(query.outer_tables.iter().copied());
        }
        let parent = match graph.output(current)? {
            Some(parent) => parent,
            None => match owners.get(&current) {
                // A subquery sees everything its owning expression sees.
                Some(&owner) => {
                    for input in graph.inputs(owner)? {
                        visible.extend(graph.row_sources(input)?);
                    }
                    current = owner;
                    continue;
                }
                None => break,
            },
        };
        match graph.kind(parent)? {
            NodeKind::MapJoin(map) if map.inner == current => {
                visible.extend(graph.row_sources(map.outer)?);
            }
            NodeKind::BloomFilterFilter { outer, inner, .. } if *inner == current => {
                visible.extend(graph.row_sources(*outer)?);
            }
            _ => {}
        }
        current = parent;
    }
    Ok(visible)
}

impl PlanRule for PlanInvariants {
    fn name(&self) -> &'static str {
        "PlanInvariants"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        Self::check(&plan.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DataType, JoinType, MapJoin, ResultType, TableSource};

    fn scan(graph: &mut PlanGraph) -> NodeId {
        graph.add(NodeKind::TableSource(TableSource {
            table: "t".to_string(),
            alias: None,
            columns: vec![("a".to_string(), ResultType::nullable(DataType::Int))],
            required: false,
        }))
    }

    #[test]
    fn test_consistent_plan_passes() {
        let mut graph = PlanGraph::new();
        let t = scan(&mut graph);
        let a = graph.column_expr(t, 0).unwrap();
        let project = graph.add(NodeKind::Project {
            input: t,
            fields: vec![Expr::Column(a)],
        });
        graph.set_root(project);
        PlanInvariants::check(&graph).unwrap();
    }

    #[test]
    fn test_dangling_column_is_internal_error() {
        let mut graph = PlanGraph::new();
        let t = scan(&mut graph);
        let other = scan(&mut graph);
        let a = graph.column_expr(other, 0).unwrap();
        let project = graph.add(NodeKind::Project {
            input: t,
            fields: vec![Expr::Column(a)],
        });
        graph.set_root(project);
        graph.discard(other);

        let err = PlanInvariants::check(&graph).unwrap_err();
        assert!(matches!(err, PlanError::Internal { .. }));
        assert!(err.to_string().contains("no live source"));
    }

    #[test]
    fn test_live_but_unreachable_source_is_reported() {
        let mut graph = PlanGraph::new();
        let t = scan(&mut graph);
        let other = scan(&mut graph);
        let a = graph.column_expr(other, 0).unwrap();
        let project = graph.add(NodeKind::Project {
            input: t,
            fields: vec![Expr::Column(a)],
        });
        graph.set_root(project);

        let err = PlanInvariants::check(&graph).unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn test_folded_loop_only_emits_its_inner_rows() {
        let mut graph = PlanGraph::new();
        let outer = scan(&mut graph);
        let inner = scan(&mut graph);
        let outer_col = graph.column_expr(outer, 0).unwrap();
        // Inside the loop the outer row is bound.
        let select = graph.add(NodeKind::Select {
            input: inner,
            conditions: vec![Expr::IsNull(Box::new(Expr::Column(outer_col.clone())))],
        });
        let map = graph.add(NodeKind::MapJoin(MapJoin {
            outer,
            inner: select,
            join_type: None,
            lookahead_quantum: 1,
        }));
        let project = graph.add(NodeKind::Project {
            input: map,
            fields: vec![Expr::Column(outer_col)],
        });
        graph.set_root(project);

        let err = PlanInvariants::check(&graph).unwrap_err();
        assert!(err.to_string().contains("not reachable"));

        // Before folding the map still emits both sides.
        if let NodeKind::MapJoin(join) = graph.kind_mut(map).unwrap() {
            join.join_type = Some(JoinType::Inner);
        }
        PlanInvariants::check(&graph).unwrap();
    }

    #[test]
    fn test_broken_back_pointer_is_reported() {
        let mut graph = PlanGraph::new();
        let t = scan(&mut graph);
        let first = graph.add(NodeKind::Select {
            input: t,
            conditions: Vec::new(),
        });
        // A second parent steals the output pointer.
        let _second = graph.add(NodeKind::Select {
            input: t,
            conditions: Vec::new(),
        });
        graph.set_root(first);

        assert!(PlanInvariants::check(&graph).is_err());
    }
}
