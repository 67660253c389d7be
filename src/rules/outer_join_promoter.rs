//! Turn outer joins into inner joins when a condition above them rejects
//! the NULL-padded rows anyway.
//!
//! For every Select directly over a join tree, the set of sources that must
//! be non-null for the conditions to hold is computed (together with the
//! conditions of inner joins reachable through preserved sides). An outer
//! join whose optional side provides one of those sources can only produce
//! surviving rows where the optional side matched, so it becomes INNER.
//! Promotion exposes more inner-join conditions, so this repeats until
//! nothing changes.

use super::{PlanContext, PlanRule};
use crate::error::PlanResult;
use crate::plan::{Expr, JoinType, LogicalOp, NodeFinder, NodeId, NodeKind, PlanGraph};
use std::collections::BTreeSet;
use tracing::debug;

/// Functions that produce a non-null result from null inputs
const NULL_TOLERANT_FUNCTIONS: &[&str] = &[
    "isnull",
    "isnotnull",
    "ifnull",
    "coalesce",
    "istrue",
    "isfalse",
    "isunknown",
    "isnottrue",
    "isnotfalse",
    "isnotunknown",
];

pub struct OuterJoinPromoter;

impl PlanRule for OuterJoinPromoter {
    fn name(&self) -> &'static str {
        "OuterJoinPromoter"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let root = plan.root()?;
        let selects = NodeFinder::new(|kind| matches!(kind, NodeKind::Select { .. }))
            .find(&mut plan.plan, root)?;

        for select in selects {
            let NodeKind::Select { input, conditions } = plan.plan.kind(select)? else {
                continue;
            };
            if !matches!(plan.plan.kind(*input)?, NodeKind::Join(_)) {
                continue;
            }
            let join = *input;
            let mut required = BTreeSet::new();
            for condition in conditions {
                required.extend(required_sources(condition));
            }

            loop {
                let mut all_required = required.clone();
                inner_join_requirements(&plan.plan, join, &mut all_required)?;
                if !promote(&mut plan.plan, join, &all_required)? {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn is_null_tolerant(name: &str) -> bool {
    NULL_TOLERANT_FUNCTIONS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

/// Sources that must be non-null for `condition` to be true
pub fn required_sources(condition: &Expr) -> BTreeSet<NodeId> {
    match condition {
        Expr::Logical {
            op: LogicalOp::And,
            operands,
        } => operands.iter().flat_map(required_sources).collect(),
        Expr::Logical {
            op: LogicalOp::Or,
            operands,
        } => {
            let mut operands = operands.iter().map(required_sources);
            let Some(first) = operands.next() else {
                return BTreeSet::new();
            };
            operands.fold(first, |acc, next| acc.intersection(&next).copied().collect())
        }
        Expr::Logical {
            op: LogicalOp::Not, ..
        }
        | Expr::IsNull(_)
        | Expr::Subquery(_) => BTreeSet::new(),
        Expr::Function { name, .. } if is_null_tolerant(name) => BTreeSet::new(),
        other => {
            let mut sources = BTreeSet::new();
            null_rejecting_columns(other, &mut sources);
            sources
        }
    }
}

fn null_rejecting_columns(expr: &Expr, sources: &mut BTreeSet<NodeId>) {
    match expr {
        Expr::Column(column) => {
            sources.insert(column.source);
        }
        Expr::IsNull(_) | Expr::Subquery(_) => {}
        Expr::Function { name, .. } if is_null_tolerant(name) => {}
        other => {
            for child in other.children() {
                null_rejecting_columns(child, sources);
            }
        }
    }
}

/// Add the requirements of inner-join conditions reachable through
/// preserved sides of `node`
fn inner_join_requirements(
    graph: &PlanGraph,
    node: NodeId,
    required: &mut BTreeSet<NodeId>,
) -> PlanResult<()> {
    let NodeKind::Join(join) = graph.kind(node)? else {
        return Ok(());
    };
    match join.join_type {
        JoinType::Inner => {
            for condition in &join.conditions {
                required.extend(required_sources(condition));
            }
            inner_join_requirements(graph, join.left, required)?;
            inner_join_requirements(graph, join.right, required)
        }
        JoinType::Left | JoinType::Semi | JoinType::Anti => {
            inner_join_requirements(graph, join.left, required)
        }
        JoinType::Right => inner_join_requirements(graph, join.right, required),
    }
}

/// Promote outer joins below `node` (deepest first). Returns whether any
/// join changed.
fn promote(graph: &mut PlanGraph, node: NodeId, required: &BTreeSet<NodeId>) -> PlanResult<bool> {
    let NodeKind::Join(join) = graph.kind(node)? else {
        return Ok(false);
    };
    let (left, right, join_type) = (join.left, join.right, join.join_type);
    let mut changed = promote(graph, left, required)?;
    changed |= promote(graph, right, required)?;

    let optional = match join_type {
        JoinType::Left => right,
        JoinType::Right => left,
        _ => return Ok(changed),
    };
    let provided = graph.sources_below(optional)?;
    if provided.is_disjoint(required) {
        return Ok(changed);
    }

    if let NodeKind::Join(join) = graph.kind_mut(node)? {
        join.join_type = JoinType::Inner;
    }
    mark_required(graph, optional)?;
    debug!(join = %node, from = %join_type, "outer join promoted to inner");
    Ok(true)
}

/// Mark table sources that now always produce a row, without entering the
/// optional sides of nested outer joins
fn mark_required(graph: &mut PlanGraph, node: NodeId) -> PlanResult<()> {
    let next = match graph.kind_mut(node)? {
        NodeKind::TableSource(source) => {
            source.required = true;
            Vec::new()
        }
        NodeKind::Join(join) => match join.join_type {
            JoinType::Inner => vec![join.left, join.right],
            JoinType::Left | JoinType::Semi | JoinType::Anti => vec![join.left],
            JoinType::Right => vec![join.right],
        },
        NodeKind::Select { input, .. } => vec![*input],
        _ => Vec::new(),
    };
    for child in next {
        mark_required(graph, child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ColumnExpr, ComparisonOp, Constant, DataType, ResultType};

    fn col(source: usize) -> Expr {
        Expr::Column(ColumnExpr {
            source: NodeId::new(source),
            position: 0,
            name: format!("t{source}.a"),
            ty: ResultType::nullable(DataType::Int),
        })
    }

    fn gt(left: Expr) -> Expr {
        Expr::comparison(ComparisonOp::Gt, left, Expr::Constant(Constant::Int(0)))
    }

    fn ids(set: BTreeSet<NodeId>) -> Vec<usize> {
        set.into_iter().map(NodeId::index).collect()
    }

    #[test]
    fn test_and_is_union_or_is_intersection() {
        let and = Expr::Logical {
            op: LogicalOp::And,
            operands: vec![gt(col(1)), gt(col(2))],
        };
        assert_eq!(ids(required_sources(&and)), vec![1, 2]);

        let or = Expr::Logical {
            op: LogicalOp::Or,
            operands: vec![
                Expr::Logical {
                    op: LogicalOp::And,
                    operands: vec![gt(col(1)), gt(col(2))],
                },
                gt(col(2)),
            ],
        };
        assert_eq!(ids(required_sources(&or)), vec![2]);
    }

    #[test]
    fn test_null_tolerant_conditions_require_nothing() {
        assert!(required_sources(&Expr::IsNull(Box::new(col(1)))).is_empty());
        let not = Expr::Logical {
            op: LogicalOp::Not,
            operands: vec![gt(col(1))],
        };
        assert!(required_sources(&not).is_empty());
        let coalesce = gt(Expr::function(
            "COALESCE",
            vec![col(1), Expr::Constant(Constant::Int(0))],
            ResultType::nullable(DataType::Int),
        ));
        assert!(required_sources(&coalesce).is_empty());
    }
}
