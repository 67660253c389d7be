//! Builder Patterns for Plan Construction
//!
//! Fluent helpers for assembling plan graphs the way the SQL front end
//! delivers them, particularly useful for tests, benchmarks and the debug
//! binary.
//!
//! ## Example
//!
//! ```rust
//! use planrules::plan::builders::{eq, PlanBuilder};
//! use planrules::plan::DataType;
//! use planrules::schema::{Schema, TableDef};
//!
//! let mut schema = Schema::new();
//! schema.add_table(TableDef::new("emp", &[("id", DataType::Int, false), ("dept", DataType::Int, true)]));
//! schema.add_table(TableDef::new("dept", &[("id", DataType::Int, false)]));
//!
//! // SELECT emp.id FROM emp, dept WHERE emp.dept = dept.id
//! let mut b = PlanBuilder::new(&schema);
//! let emp = b.table("emp").unwrap();
//! let dept = b.table("dept").unwrap();
//! let join = b.inner_join(emp, dept, vec![]);
//! let cond = eq(b.col(emp, "dept").unwrap(), b.col(dept, "id").unwrap());
//! let select = b.select(join, vec![cond]);
//! let project = b.project(select, vec![b.col(emp, "id").unwrap()]);
//! let plan = b.statement(project, &["id"]);
//! assert!(plan.explain().contains("JoinNode(INNER"));
//! ```

use super::{
    AggregateFunctionExpr, BaseQuery, ComparisonOp, Constant, Expr, HashJoinSpec,
    JoinImplementation, JoinNode, JoinType, LogicalOp, NodeId, NodeKind, OrderByExpr,
    PlanGraph, QueryKind, ResultType, SubqueryExpr, SubqueryKind, TableSource,
};
use crate::error::{PlanError, PlanResult};
use crate::schema::Schema;
use std::collections::BTreeSet;

/// Builder for plan graphs resolved against a schema
#[derive(Debug)]
pub struct PlanBuilder<'a> {
    schema: &'a Schema,
    graph: PlanGraph,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        PlanBuilder {
            schema,
            graph: PlanGraph::new(),
        }
    }

    /// Scan of a base table
    pub fn table(&mut self, name: &str) -> PlanResult<NodeId> {
        self.table_source(name, None)
    }

    /// Scan of a base table under an alias
    pub fn table_as(&mut self, name: &str, alias: &str) -> PlanResult<NodeId> {
        self.table_source(name, Some(alias))
    }

    fn table_source(&mut self, name: &str, alias: Option<&str>) -> PlanResult<NodeId> {
        let source = table_source(self.schema, name, alias)?;
        Ok(self.graph.add(NodeKind::TableSource(source)))
    }

    /// Column of a table source by name
    pub fn col(&self, source: NodeId, name: &str) -> PlanResult<Expr> {
        let NodeKind::TableSource(table) = self.graph.kind(source)? else {
            return Err(PlanError::internal(
                format!("{source} is not a table source"),
                self.graph.explain_subtree(source),
            ));
        };
        let position = table
            .columns
            .iter()
            .position(|(column, _)| column == name)
            .ok_or_else(|| {
                PlanError::Schema(format!(
                    "Column '{name}' not found in table '{}'",
                    table.table
                ))
            })?;
        self.col_at(source, position)
    }

    /// Column of any column source by position
    pub fn col_at(&self, source: NodeId, position: usize) -> PlanResult<Expr> {
        Ok(Expr::Column(self.graph.column_expr(source, position)?))
    }

    pub fn select(&mut self, input: NodeId, conditions: Vec<Expr>) -> NodeId {
        self.graph.add(NodeKind::Select { input, conditions })
    }

    pub fn project(&mut self, input: NodeId, fields: Vec<Expr>) -> NodeId {
        self.graph.add(NodeKind::Project { input, fields })
    }

    pub fn sort(&mut self, input: NodeId, orderings: Vec<OrderByExpr>) -> NodeId {
        self.graph.add(NodeKind::Sort { input, orderings })
    }

    pub fn limit(&mut self, input: NodeId, limit: usize) -> NodeId {
        self.graph.add(NodeKind::Limit {
            input,
            offset: 0,
            limit: Some(limit),
        })
    }

    /// GROUP BY with an initially empty aggregate list
    pub fn aggregate(&mut self, input: NodeId, group_by: Vec<Expr>) -> NodeId {
        self.graph.add(NodeKind::AggregateSource {
            input,
            group_by,
            aggregates: Vec::new(),
        })
    }

    pub fn distinct(&mut self, input: NodeId) -> NodeId {
        self.graph.add(NodeKind::Distinct {
            input,
            implementation: super::DistinctImplementation::Unsorted,
            orderings: Vec::new(),
        })
    }

    /// Nested-loop join
    pub fn join(
        &mut self,
        left: NodeId,
        right: NodeId,
        join_type: JoinType,
        conditions: Vec<Expr>,
    ) -> NodeId {
        self.graph.add(NodeKind::Join(JoinNode {
            left,
            right,
            join_type,
            implementation: JoinImplementation::NestedLoops,
            conditions,
            hash: None,
        }))
    }

    pub fn inner_join(&mut self, left: NodeId, right: NodeId, conditions: Vec<Expr>) -> NodeId {
        self.join(left, right, JoinType::Inner, conditions)
    }

    pub fn left_join(&mut self, left: NodeId, right: NodeId, conditions: Vec<Expr>) -> NodeId {
        self.join(left, right, JoinType::Left, conditions)
    }

    /// Join whose build side is a hash table or bloom filter over `loader`
    #[allow(clippy::too_many_arguments)]
    pub fn hashed_join(
        &mut self,
        left: NodeId,
        right: NodeId,
        join_type: JoinType,
        implementation: JoinImplementation,
        table: &str,
        loader: NodeId,
        hash_columns: Vec<Expr>,
        match_columns: Vec<Expr>,
    ) -> NodeId {
        let keys = hash_columns.len();
        self.graph.add(NodeKind::Join(JoinNode {
            left,
            right,
            join_type,
            implementation,
            conditions: Vec::new(),
            hash: Some(HashJoinSpec {
                table: table.to_string(),
                loader,
                hash_columns,
                match_columns,
                key_comparators: vec![None; keys],
                collators: vec![None; keys],
            }),
        }))
    }

    /// Derived table in FROM over a subquery plan
    pub fn subquery_source(&mut self, subquery: NodeId, name: &str) -> NodeId {
        self.graph.add(NodeKind::SubquerySource {
            subquery,
            name: name.to_string(),
        })
    }

    /// Subquery scope; `outer_tables` are the enclosing sources it references
    pub fn subquery(&mut self, input: NodeId, outer_tables: &[NodeId]) -> NodeId {
        let mut query = BaseQuery::new(input, QueryKind::Subquery);
        query.outer_tables = outer_tables.iter().copied().collect::<BTreeSet<_>>();
        self.graph.add(NodeKind::Query(query))
    }

    /// `EXISTS (subquery)`
    pub fn exists(&self, subquery: NodeId) -> Expr {
        Expr::Subquery(SubqueryExpr {
            subquery,
            kind: SubqueryKind::Exists,
            ty: ResultType::not_null(super::DataType::Boolean),
        })
    }

    /// Scalar subquery, typed by its single output field
    pub fn scalar(&self, subquery: NodeId) -> PlanResult<Expr> {
        let ty = self
            .graph
            .output_fields(subquery)?
            .first()
            .map_or(ResultType::nullable(super::DataType::Int), |f| {
                ResultType::nullable(f.result_type().data_type)
            });
        Ok(Expr::Subquery(SubqueryExpr {
            subquery,
            kind: SubqueryKind::Value,
            ty,
        }))
    }

    /// UPDATE source rows
    pub fn update_input(&mut self, input: NodeId, table: &str) -> NodeId {
        self.graph.add(NodeKind::UpdateInput {
            input,
            table: table.to_string(),
        })
    }

    /// Finish a SELECT statement: `Query(ResultSet(input))`
    pub fn statement(mut self, input: NodeId, names: &[&str]) -> PlanGraph {
        let result = self.graph.add(NodeKind::ResultSet {
            input,
            fields: names.iter().map(ToString::to_string).collect(),
        });
        let root = self
            .graph
            .add(NodeKind::Query(BaseQuery::new(result, QueryKind::Statement)));
        self.graph.set_root(root);
        self.graph
    }

    /// Finish with `input` wrapped in a statement Query and no ResultSet
    pub fn statement_without_result(mut self, input: NodeId) -> PlanGraph {
        let root = self
            .graph
            .add(NodeKind::Query(BaseQuery::new(input, QueryKind::Statement)));
        self.graph.set_root(root);
        self.graph
    }

    /// Access the graph under construction
    pub fn graph(&self) -> &PlanGraph {
        &self.graph
    }
}

/// Table source with every column typed from the schema
pub fn table_source(schema: &Schema, name: &str, alias: Option<&str>) -> PlanResult<TableSource> {
    let table = schema.table(name)?;
    Ok(TableSource {
        table: table.name.clone(),
        alias: alias.map(ToString::to_string),
        columns: table
            .columns
            .iter()
            .map(|c| (c.name.clone(), ResultType::new(c.data_type, c.nullable)))
            .collect(),
        required: false,
    })
}

pub fn eq(left: Expr, right: Expr) -> Expr {
    Expr::comparison(ComparisonOp::Eq, left, right)
}

pub fn gt(left: Expr, right: Expr) -> Expr {
    Expr::comparison(ComparisonOp::Gt, left, right)
}

pub fn lt(left: Expr, right: Expr) -> Expr {
    Expr::comparison(ComparisonOp::Lt, left, right)
}

pub fn and(operands: Vec<Expr>) -> Expr {
    Expr::Logical {
        op: LogicalOp::And,
        operands,
    }
}

pub fn or(operands: Vec<Expr>) -> Expr {
    Expr::Logical {
        op: LogicalOp::Or,
        operands,
    }
}

pub fn not(operand: Expr) -> Expr {
    Expr::Logical {
        op: LogicalOp::Not,
        operands: vec![operand],
    }
}

pub fn is_null(operand: Expr) -> Expr {
    Expr::IsNull(Box::new(operand))
}

pub fn int(value: i64) -> Expr {
    Expr::Constant(Constant::Int(value))
}

/// Scalar function typed like its first operand
pub fn func(name: &str, operands: Vec<Expr>) -> Expr {
    let ty = operands
        .first()
        .map_or(ResultType::nullable(super::DataType::Int), Expr::result_type);
    Expr::function(name, operands, ty)
}

/// Aggregate call, e.g. `agg("sum", col)`
pub fn agg(function: &str, operand: Expr) -> Expr {
    Expr::Aggregate(AggregateFunctionExpr::new(function, Some(operand), false))
}

pub fn agg_distinct(function: &str, operand: Expr) -> Expr {
    Expr::Aggregate(AggregateFunctionExpr::new(function, Some(operand), true))
}

pub fn count_star() -> Expr {
    Expr::Aggregate(AggregateFunctionExpr::new("COUNT", None, false))
}

pub fn asc(expr: Expr) -> OrderByExpr {
    OrderByExpr {
        expr,
        ascending: true,
    }
}

pub fn desc(expr: Expr) -> OrderByExpr {
    OrderByExpr {
        expr,
        ascending: false,
    }
}
