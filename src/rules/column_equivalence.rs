//! Column equivalences from equality predicates and foreign keys.
//!
//! Two sub-passes per query scope:
//!
//! 1. Every `col = col` conjunct of a Select or an INNER join condition
//!    marks the two columns equivalent in the enclosing query and both are
//!    proven non-null (an equality never holds on NULL).
//! 2. Foreign keys whose columns are exactly the child's primary key link
//!    each child row to exactly one parent row. Those pairs are recorded in
//!    the query's FK equivalences and copied into its general ones, walking
//!    up the parent chain.

use super::{PlanContext, PlanRule};
use crate::error::PlanResult;
use crate::plan::builders::table_source;
use crate::plan::{
    ColumnRef, ComparisonOp, Expr, JoinType, LogicalOp, NodeId, NodeKind, PlanGraph,
    PlanVisitor,
};
use crate::schema::Schema;
use std::collections::BTreeSet;
use tracing::debug;

pub struct ColumnEquivalenceFinder;

impl PlanRule for ColumnEquivalenceFinder {
    fn name(&self) -> &'static str {
        "ColumnEquivalenceFinder"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let root = plan.root()?;
        let mut finder = ConditionEquivalences {
            scopes: Vec::new(),
            queries: Vec::new(),
            max_depth: plan.config.optimizer.equivalence_search_depth,
        };
        plan.plan.accept(root, &mut finder)?;

        for query in finder.queries {
            add_foreign_key_equivalences(&mut plan.plan, &plan.schema, query)?;
        }
        Ok(())
    }
}

struct ConditionEquivalences {
    scopes: Vec<NodeId>,
    queries: Vec<NodeId>,
    max_depth: usize,
}

impl PlanVisitor for ConditionEquivalences {
    fn visit_enter(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if let NodeKind::Query(query) = graph.kind_mut(node)? {
            query.equivalences.set_max_depth(self.max_depth);
            query.fk_equivalences.set_max_depth(self.max_depth);
            self.scopes.push(node);
            self.queries.push(node);
        }
        Ok(true)
    }

    fn visit_leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        let Some(&scope) = self.scopes.last() else {
            return Ok(true);
        };
        if scope == node {
            self.scopes.pop();
        } else {
            record_equalities(graph, scope, node)?;
        }
        Ok(true)
    }
}

fn record_equalities(graph: &mut PlanGraph, scope: NodeId, node: NodeId) -> PlanResult<()> {
    let mut pairs = Vec::new();
    match graph.kind_mut(node)? {
        NodeKind::Select { conditions, .. } => equality_columns(conditions, &mut pairs),
        NodeKind::Join(join) if join.join_type == JoinType::Inner => {
            equality_columns(&mut join.conditions, &mut pairs);
        }
        _ => return Ok(()),
    }
    if pairs.is_empty() {
        return Ok(());
    }

    debug!(node = %node, count = pairs.len(), "equality predicates");
    let query = graph.query_mut(scope)?;
    for (left, right) in pairs {
        query.not_nullable.insert(left);
        query.not_nullable.insert(right);
        query.equivalences.mark_equivalent(left, right);
    }
    Ok(())
}

/// Collect `col = col` conjuncts, marking both columns non-nullable
fn equality_columns(conditions: &mut [Expr], pairs: &mut Vec<(ColumnRef, ColumnRef)>) {
    for condition in conditions {
        match condition {
            Expr::Logical {
                op: LogicalOp::And,
                operands,
            } => equality_columns(operands, pairs),
            Expr::Comparison {
                op: ComparisonOp::Eq,
                left,
                right,
            } => {
                if let (Expr::Column(left), Expr::Column(right)) = (left.as_mut(), right.as_mut())
                {
                    if left != right {
                        left.ty.nullable = false;
                        right.ty.nullable = false;
                        pairs.push((left.key(), right.key()));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Table sources of each join island of a query scope
fn join_islands(graph: &PlanGraph, query: NodeId) -> PlanResult<Vec<Vec<NodeId>>> {
    let mut islands = Vec::new();
    for node in graph.subtree(graph.query(query)?.input)? {
        if !matches!(graph.kind(node)?, NodeKind::Join(_) | NodeKind::TableSource(_)) {
            continue;
        }
        if inside_join(graph, node)? {
            continue;
        }
        let mut tables = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            match graph.kind(current)? {
                NodeKind::TableSource(_) => tables.push(current),
                NodeKind::Join(join) => stack.extend([join.right, join.left]),
                NodeKind::Select { input, .. } => stack.push(*input),
                _ => {}
            }
        }
        islands.push(tables);
    }
    Ok(islands)
}

/// Whether the nearest non-Select ancestor of `node` is a join
fn inside_join(graph: &PlanGraph, node: NodeId) -> PlanResult<bool> {
    let mut current = node;
    while let Some(parent) = graph.output(current)? {
        match graph.kind(parent)? {
            NodeKind::Select { .. } => current = parent,
            NodeKind::Join(join) => return Ok(join.left == current || join.right == current),
            _ => return Ok(false),
        }
    }
    Ok(false)
}

fn add_foreign_key_equivalences(
    graph: &mut PlanGraph,
    schema: &Schema,
    query: NodeId,
) -> PlanResult<()> {
    let mut links = ParentLinks::default();
    for island in join_islands(graph, query)? {
        for &table in &island {
            let mut chain = BTreeSet::new();
            links.follow(graph, schema, query, &island, table, &mut chain)?;
        }
    }
    if links.pairs.is_empty() {
        return Ok(());
    }

    debug!(
        query = %query,
        pairs = links.pairs.len(),
        synthesized = links.synthesized.len(),
        "foreign key equivalences"
    );
    let query = graph.query_mut(query)?;
    for (child, parent) in links.pairs {
        query.fk_equivalences.mark_equivalent(child, parent);
    }
    query.fk_tables.extend(links.synthesized);
    let fk_equivalences = query.fk_equivalences.clone();
    query.equivalences.copy_equivalences(&fk_equivalences);
    Ok(())
}

#[derive(Default)]
struct ParentLinks {
    pairs: Vec<(ColumnRef, ColumnRef)>,
    synthesized: Vec<NodeId>,
}

impl ParentLinks {
    /// Link `child` to the parent row of every FK that covers its primary key
    fn follow(
        &mut self,
        graph: &mut PlanGraph,
        schema: &Schema,
        query: NodeId,
        island: &[NodeId],
        child: NodeId,
        chain: &mut BTreeSet<String>,
    ) -> PlanResult<()> {
        let NodeKind::TableSource(source) = graph.kind(child)? else {
            return Ok(());
        };
        let table = schema.table(&source.table)?;
        let Some(primary_key) = table.primary_key() else {
            return Ok(());
        };
        chain.insert(table.name.clone());

        for fk in &table.foreign_keys {
            if fk.columns != primary_key.columns || chain.contains(&fk.referenced_table) {
                continue;
            }
            let parent_table = schema.table(&fk.referenced_table)?;
            if parent_table
                .primary_key()
                .is_none_or(|pk| pk.name != fk.referenced_index)
            {
                continue;
            }

            let key_pairs: Vec<(usize, usize)> = fk
                .columns
                .iter()
                .copied()
                .zip(fk.referenced_columns.iter().copied())
                .collect();
            let existing =
                joined_parent(graph, query, island, child, &fk.referenced_table, &key_pairs)?;
            let parent = match existing {
                Some(parent) => parent,
                None => {
                    let source = table_source(schema, &fk.referenced_table, None)?;
                    let parent = graph.add(NodeKind::TableSource(source));
                    self.synthesized.push(parent);
                    parent
                }
            };

            for &(child_column, parent_column) in &key_pairs {
                self.pairs.push((
                    ColumnRef {
                        source: child,
                        position: child_column,
                    },
                    ColumnRef {
                        source: parent,
                        position: parent_column,
                    },
                ));
            }
            self.follow(graph, schema, query, island, parent, chain)?;
        }
        chain.remove(&table.name);
        Ok(())
    }
}

/// A source of `parent_table` in the island already joined to `child` on the key
fn joined_parent(
    graph: &PlanGraph,
    query: NodeId,
    island: &[NodeId],
    child: NodeId,
    parent_table: &str,
    key_pairs: &[(usize, usize)],
) -> PlanResult<Option<NodeId>> {
    let equivalences = &graph.query(query)?.equivalences;
    for &candidate in island {
        if candidate == child {
            continue;
        }
        let NodeKind::TableSource(source) = graph.kind(candidate)? else {
            continue;
        };
        if source.table != parent_table {
            continue;
        }
        let joined = key_pairs.iter().all(|&(c, p)| {
            equivalences.are_equivalent(
                &ColumnRef {
                    source: child,
                    position: c,
                },
                &ColumnRef {
                    source: candidate,
                    position: p,
                },
            )
        });
        if joined {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}
