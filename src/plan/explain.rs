//! Explain output: one line per node, inputs indented below their parent.
//! Subquery plans are printed under the node whose expressions own them.
//!
//! ```text
//! Query(Statement)
//!   ResultSet[dept]
//!     Project[emp.dept]
//!       AggregateSource([emp.dept], [])
//!         TableSource(emp)
//! ```

use super::{
    ComparisonOp, Constant, DistinctImplementation, Expr, LogicalOp, NodeId, NodeKind,
    OrderByExpr, PlanGraph, QueryKind, SubqueryKind,
};
use std::fmt::{self, Write};

impl PlanGraph {
    /// Explain text of the whole plan
    pub fn explain(&self) -> String {
        match self.root() {
            Ok(root) => self.explain_subtree(root),
            Err(_) => String::from("<empty plan>"),
        }
    }

    /// Explain text of the subtree rooted at `id`
    pub fn explain_subtree(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.explain_into(id, 0, &mut out);
        out
    }

    fn explain_into(&self, id: NodeId, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        let Ok(node) = self.node(id) else {
            let _ = writeln!(out, "{indent}<missing {id}>");
            return;
        };
        let _ = writeln!(out, "{indent}{}", describe(&node.kind));

        for expr in node.kind.expressions() {
            expr.for_each(&mut |e| {
                if let Expr::Subquery(sub) = e {
                    let _ = writeln!(out, "{indent}  subquery {}:", sub.subquery);
                    self.explain_into(sub.subquery, depth + 2, out);
                }
            });
        }
        for input in node.kind.inputs() {
            self.explain_into(input, depth + 1, out);
        }
    }
}

fn list(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn orderings(orderings: &[OrderByExpr]) -> String {
    orderings
        .iter()
        .map(|o| format!("{} {}", o.expr, if o.ascending { "ASC" } else { "DESC" }))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(kind: &NodeKind) -> String {
    match kind {
        NodeKind::TableSource(table) => {
            let mut text = table.table.clone();
            if let Some(alias) = &table.alias {
                text = format!("{text} AS {alias}");
            }
            if table.required {
                text.push_str(", required");
            }
            format!("TableSource({text})")
        }
        NodeKind::Select { conditions, .. } => format!("Select[{}]", list(conditions)),
        NodeKind::Project { fields, .. } => format!("Project[{}]", list(fields)),
        NodeKind::Sort { orderings: o, .. } => format!("Sort[{}]", orderings(o)),
        NodeKind::Limit { offset, limit, .. } => match limit {
            Some(limit) => format!("Limit({offset}, {limit})"),
            None => format!("Limit({offset}, ALL)"),
        },
        NodeKind::AggregateSource {
            group_by,
            aggregates,
            ..
        } => format!("AggregateSource([{}], [{}])", list(group_by), list(aggregates)),
        NodeKind::Distinct {
            implementation,
            orderings: o,
            ..
        } => match implementation {
            DistinctImplementation::Unsorted => "Distinct".to_string(),
            DistinctImplementation::ExplicitSort => {
                format!("Distinct(EXPLICIT_SORT[{}])", orderings(o))
            }
        },
        NodeKind::Join(join) => {
            let mut text = format!(
                "JoinNode({}/{}[{}])",
                join.join_type,
                join.implementation,
                list(&join.conditions)
            );
            if let Some(hash) = &join.hash {
                let _ = write!(
                    text,
                    " using {}[{}] = [{}]",
                    hash.table,
                    list(&hash.hash_columns),
                    list(&hash.match_columns)
                );
            }
            text
        }
        NodeKind::MapJoin(map) => match map.join_type {
            Some(join_type) => format!("MapJoin({join_type})"),
            None => "MapJoin()".to_string(),
        },
        NodeKind::NullIfEmpty { .. } => "NullIfEmpty".to_string(),
        NodeKind::OnlyIfEmpty { .. } => "OnlyIfEmpty".to_string(),
        NodeKind::UsingBloomFilter { filter, .. } => format!("UsingBloomFilter({filter})"),
        NodeKind::BloomFilterFilter {
            filter,
            match_columns,
            ..
        } => format!("BloomFilterFilter({filter}, [{}])", list(match_columns)),
        NodeKind::UsingHashTable {
            table,
            hash_columns,
            ..
        } => format!("UsingHashTable({table}, [{}])", list(hash_columns)),
        NodeKind::SubquerySource { name, .. } => format!("SubquerySource({name})"),
        NodeKind::Query(query) => match query.kind {
            QueryKind::Statement => "Query(Statement)".to_string(),
            QueryKind::Subquery => "Query(Subquery)".to_string(),
        },
        NodeKind::ResultSet { fields, .. } => format!("ResultSet[{}]", fields.join(", ")),
        NodeKind::UpdateInput { table, .. } => format!("UpdateInput({table})"),
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(column) => f.write_str(&column.name),
            Expr::Constant(constant) => match constant {
                Constant::Null => f.write_str("NULL"),
                Constant::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
                Constant::Int(i) => write!(f, "{i}"),
                Constant::Text(s) => write!(f, "'{s}'"),
            },
            Expr::Parameter { position, .. } => write!(f, "${position}"),
            Expr::Comparison { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::Logical { op, operands } => match op {
                LogicalOp::Not => match operands.first() {
                    Some(operand) => write!(f, "NOT {operand}"),
                    None => f.write_str("NOT"),
                },
                LogicalOp::And => f.write_str(
                    &operands
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" AND "),
                ),
                LogicalOp::Or => write!(
                    f,
                    "({})",
                    operands
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" OR ")
                ),
            },
            Expr::IsNull(operand) => write!(f, "{operand} IS NULL"),
            Expr::Function { name, operands, .. } => write!(f, "{name}({})", list(operands)),
            Expr::Aggregate(aggregate) => {
                write!(f, "{}(", aggregate.function)?;
                if aggregate.distinct {
                    f.write_str("DISTINCT ")?;
                }
                match &aggregate.operand {
                    Some(operand) => write!(f, "{operand}")?,
                    None => f.write_str("*")?,
                }
                if !aggregate.order_by.is_empty() {
                    write!(f, " ORDER BY {}", orderings(&aggregate.order_by))?;
                }
                f.write_str(")")
            }
            Expr::Subquery(subquery) => match subquery.kind {
                SubqueryKind::Value => write!(f, "VALUE({})", subquery.subquery),
                SubqueryKind::Exists => write!(f, "EXISTS({})", subquery.subquery),
                SubqueryKind::Any => write!(f, "ANY({})", subquery.subquery),
            },
        }
    }
}
