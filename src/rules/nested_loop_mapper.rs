//! Lower logical joins into nested-loop maps.
//!
//! ```text
//! JoinNode(t, NESTED_LOOPS)      -> MapJoin(t, Select(outer), Select(inner))
//! JoinNode(SEMI, BLOOM_FILTER)   -> UsingBloomFilter(loader project,
//!                                      BloomFilterFilter(outer, inner))
//! JoinNode(t, HASH_TABLE)        -> UsingHashTable(loader, MapJoin(t, ...))
//! ```
//!
//! Join conditions are split: for INNER and SEMI joins, conjuncts that only
//! need sources of the outer side (or of enclosing queries) filter the
//! outer side; everything else is evaluated per inner row.

use super::{PlanContext, PlanRule};
use crate::config::OptimizerConfig;
use crate::error::{PlanError, PlanResult};
use crate::plan::{
    Expr, JoinImplementation, JoinNode, JoinType, MapJoin, NodeFinder, NodeId, NodeKind,
    PlanGraph,
};
use std::collections::BTreeSet;
use tracing::{debug, trace};

pub struct NestedLoopMapper;

impl PlanRule for NestedLoopMapper {
    fn name(&self) -> &'static str {
        "NestedLoopMapper"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let root = plan.root()?;
        let joins = NodeFinder::new(|kind| matches!(kind, NodeKind::Join(_)))
            .find(&mut plan.plan, root)?;
        for join in joins {
            lower_join(&mut plan.plan, &plan.config.optimizer, join)?;
        }
        Ok(())
    }

    fn check_postconditions(&self, plan: &PlanContext) -> PlanResult<()> {
        for id in plan.plan.live_nodes() {
            if matches!(plan.plan.kind(id)?, NodeKind::Join(_)) {
                return Err(plan.plan.malformed(id, "join left after lowering"));
            }
        }
        Ok(())
    }
}

/// Strategy after applying the enable flags
fn effective_implementation(
    join: &JoinNode,
    config: &OptimizerConfig,
) -> JoinImplementation {
    match join.implementation {
        JoinImplementation::BloomFilter if !config.bloom_filter_enabled => {
            JoinImplementation::NestedLoops
        }
        JoinImplementation::HashTable if !config.hash_join_enabled => {
            JoinImplementation::NestedLoops
        }
        other => other,
    }
}

fn lower_join(graph: &mut PlanGraph, config: &OptimizerConfig, id: NodeId) -> PlanResult<()> {
    let NodeKind::Join(join) = graph.kind(id)? else {
        return Err(graph.malformed(id, "expected a JoinNode"));
    };
    let join = join.clone();
    if !config.map_join_enabled {
        return Err(PlanError::unsupported(
            "join requires nested loops, which are disabled",
            graph.explain_subtree(id),
        ));
    }

    let implementation = effective_implementation(&join, config);
    let (mut outer, mut inner, mut join_type) = (join.left, join.right, join.join_type);
    if join_type == JoinType::Right && implementation == JoinImplementation::NestedLoops {
        std::mem::swap(&mut outer, &mut inner);
        join_type = JoinType::Left;
    }
    let supported = match implementation {
        JoinImplementation::NestedLoops => join_type != JoinType::Right,
        JoinImplementation::BloomFilter => join_type == JoinType::Semi,
        JoinImplementation::HashTable => matches!(
            join_type,
            JoinType::Inner | JoinType::Left | JoinType::Semi | JoinType::Anti
        ),
        JoinImplementation::Merge => false,
    };
    if !supported {
        return Err(PlanError::unsupported(
            format!("unsupported join: {join_type} {implementation}"),
            graph.explain_subtree(id),
        ));
    }

    let (hoisted, remaining) = split_conditions(graph, id, outer, join_type, join.conditions)?;
    if !hoisted.is_empty() {
        outer = graph.add(NodeKind::Select {
            input: outer,
            conditions: hoisted,
        });
    }
    if !remaining.is_empty() {
        inner = graph.add(NodeKind::Select {
            input: inner,
            conditions: remaining,
        });
    }

    let lowered = match (implementation, join.hash) {
        (JoinImplementation::BloomFilter, Some(hash)) => {
            let loader = graph.add(NodeKind::Project {
                input: hash.loader,
                fields: hash.hash_columns,
            });
            let check = graph.add(NodeKind::BloomFilterFilter {
                filter: hash.table.clone(),
                match_columns: hash.match_columns,
                outer,
                inner,
            });
            graph.add(NodeKind::UsingBloomFilter {
                filter: hash.table,
                loader,
                input: check,
            })
        }
        (JoinImplementation::HashTable, Some(hash)) => {
            let map = graph.add(NodeKind::MapJoin(MapJoin {
                outer,
                inner,
                join_type: Some(join_type),
                lookahead_quantum: config.lookahead_quantum,
            }));
            graph.add(NodeKind::UsingHashTable {
                table: hash.table,
                loader: hash.loader,
                input: map,
                hash_columns: hash.hash_columns,
                key_comparators: hash.key_comparators,
                collators: hash.collators,
            })
        }
        (JoinImplementation::BloomFilter | JoinImplementation::HashTable, None) => {
            return Err(graph.malformed(id, "hashed join without a build side"));
        }
        (_, hash) => {
            // A disabled hash or bloom strategy leaves no use for the build side.
            if let Some(hash) = hash {
                for node in graph.subtree(hash.loader)? {
                    graph.discard(node);
                }
                trace!(join = %id, loader = %hash.loader, "unused build side discarded");
            }
            graph.add(NodeKind::MapJoin(MapJoin {
                outer,
                inner,
                join_type: Some(join_type),
                lookahead_quantum: config.lookahead_quantum,
            }))
        }
    };

    graph.replace_node(id, lowered)?;
    graph.discard(id);
    debug!(join = %id, lowered = %lowered, join_type = %join_type, implementation = %implementation, "join lowered");
    Ok(())
}

/// Partition join conditions into (outer filter, per-inner-row filter)
fn split_conditions(
    graph: &PlanGraph,
    join: NodeId,
    outer: NodeId,
    join_type: JoinType,
    conditions: Vec<Expr>,
) -> PlanResult<(Vec<Expr>, Vec<Expr>)> {
    if !matches!(join_type, JoinType::Inner | JoinType::Semi) {
        return Ok((Vec::new(), conditions));
    }
    let query = graph.enclosing_query(join)?;
    let outer_tables = &graph.query(query)?.outer_tables;
    let provided = graph.sources_below(outer)?;

    let mut hoisted = Vec::new();
    let mut remaining = Vec::new();
    for condition in conditions.into_iter().flat_map(Expr::conjuncts) {
        let needed: BTreeSet<NodeId> = condition
            .column_sources()
            .difference(outer_tables)
            .copied()
            .collect();
        if !condition.contains_subquery() && needed.is_subset(&provided) {
            hoisted.push(condition);
        } else {
            remaining.push(condition);
        }
    }
    Ok((hoisted, remaining))
}
