//! Expression trees embedded in plan nodes.
//!
//! Expressions are owned values. A `ColumnExpr` refers to the plan node that
//! produces the column by `NodeId` (a non-owning back-reference), and a
//! `SubqueryExpr` owns a nested plan rooted at a `Query` node.

use super::NodeId;
use std::collections::BTreeSet;

/// Resolved SQL data types (as delivered by type resolution)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Int,
    BigInt,
    Double,
    Decimal,
    Varchar,
    Date,
    Timestamp,
}

/// Result type of an expression: data type plus nullability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultType {
    pub data_type: DataType,
    pub nullable: bool,
}

impl ResultType {
    pub fn new(data_type: DataType, nullable: bool) -> Self {
        ResultType {
            data_type,
            nullable,
        }
    }

    pub fn not_null(data_type: DataType) -> Self {
        ResultType::new(data_type, false)
    }

    pub fn nullable(data_type: DataType) -> Self {
        ResultType::new(data_type, true)
    }

    pub fn boolean() -> Self {
        ResultType::nullable(DataType::Boolean)
    }
}

/// Identity of a column: the producing node and the position in its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub source: NodeId,
    pub position: usize,
}

/// Reference to one output column of a column source
#[derive(Debug, Clone)]
pub struct ColumnExpr {
    /// Node producing the column (TableSource, Project, AggregateSource, ...)
    pub source: NodeId,
    /// Position in the source's output row
    pub position: usize,
    /// Display name, e.g. `emp.salary`
    pub name: String,
    pub ty: ResultType,
}

impl ColumnExpr {
    pub fn key(&self) -> ColumnRef {
        ColumnRef {
            source: self.source,
            position: self.position,
        }
    }
}

// Identity is (source, position); name and type are descriptive only.
impl PartialEq for ColumnExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.position == other.position
    }
}

impl Eq for ColumnExpr {}

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Null,
    Boolean(bool),
    Int(i64),
    Text(String),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Boolean connectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// One ORDER BY key
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expr,
    pub ascending: bool,
}

/// Aggregate function call, e.g. `SUM(DISTINCT x)`
#[derive(Debug, Clone)]
pub struct AggregateFunctionExpr {
    /// Upper-case function name
    pub function: String,
    /// `None` for `COUNT(*)`
    pub operand: Option<Box<Expr>>,
    pub distinct: bool,
    pub order_by: Vec<OrderByExpr>,
    /// AggregateSource of an enclosing query this call binds to
    pub source: Option<NodeId>,
    pub ty: ResultType,
}

impl AggregateFunctionExpr {
    /// Build a call, deriving its result type from the function and operand
    pub fn new(function: &str, operand: Option<Expr>, distinct: bool) -> Self {
        let function = function.to_ascii_uppercase();
        let operand_type = operand.as_ref().map(Expr::result_type);
        let ty = aggregate_result_type(&function, operand_type);
        AggregateFunctionExpr {
            function,
            operand: operand.map(Box::new),
            distinct,
            order_by: Vec::new(),
            source: None,
            ty,
        }
    }

    /// Another function over the same operand, keeping the DISTINCT flag and ordering
    pub fn derive(&self, function: &str) -> Self {
        let mut derived = AggregateFunctionExpr::new(
            function,
            self.operand.as_deref().cloned(),
            self.distinct,
        );
        derived.order_by = self.order_by.clone();
        derived
    }
}

// The enclosing-source tag and the type do not take part in identity:
// `SUM(x)` is one aggregate output no matter how it was discovered.
impl PartialEq for AggregateFunctionExpr {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function
            && self.operand == other.operand
            && self.distinct == other.distinct
            && self.order_by == other.order_by
    }
}

fn aggregate_result_type(function: &str, operand: Option<ResultType>) -> ResultType {
    let operand_type = operand.map_or(DataType::BigInt, |t| t.data_type);
    match function {
        "COUNT" => ResultType::not_null(DataType::BigInt),
        "SUM" => ResultType::nullable(match operand_type {
            DataType::Int | DataType::BigInt => DataType::BigInt,
            other => other,
        }),
        "AVG" => ResultType::nullable(match operand_type {
            DataType::Decimal => DataType::Decimal,
            _ => DataType::Double,
        }),
        "VAR_POP" | "VAR_SAMP" | "STDDEV_POP" | "STDDEV_SAMP" | "_VAR_SUM" | "_VAR_SUM_2" => {
            ResultType::nullable(DataType::Double)
        }
        _ => ResultType::nullable(operand_type),
    }
}

/// How a subquery's result is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubqueryKind {
    /// Scalar value
    Value,
    /// `EXISTS (...)`
    Exists,
    /// `x = ANY (...)`, `x IN (...)`
    Any,
}

/// Expression owning a nested subquery plan
#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryExpr {
    /// Root `Query` node of the subquery plan
    pub subquery: NodeId,
    pub kind: SubqueryKind,
    pub ty: ResultType,
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column of a column source
    Column(ColumnExpr),
    /// Literal
    Constant(Constant),
    /// Statement parameter (`$1`)
    Parameter { position: usize, ty: ResultType },
    /// Binary comparison condition
    Comparison {
        op: ComparisonOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// AND / OR / NOT condition
    Logical { op: LogicalOp, operands: Vec<Expr> },
    /// `operand IS NULL`
    IsNull(Box<Expr>),
    /// Scalar function call; a condition when its type is boolean
    Function {
        name: String,
        operands: Vec<Expr>,
        ty: ResultType,
    },
    /// Aggregate function call
    Aggregate(AggregateFunctionExpr),
    /// Subquery used as an expression
    Subquery(SubqueryExpr),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Constant(Constant::Null)
    }
}

impl Expr {
    pub fn column(column: ColumnExpr) -> Self {
        Expr::Column(column)
    }

    pub fn comparison(op: ComparisonOp, left: Expr, right: Expr) -> Self {
        Expr::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(name: &str, operands: Vec<Expr>, ty: ResultType) -> Self {
        Expr::Function {
            name: name.to_string(),
            operands,
            ty,
        }
    }

    /// Result type of this expression
    pub fn result_type(&self) -> ResultType {
        match self {
            Expr::Column(column) => column.ty,
            Expr::Constant(constant) => match constant {
                Constant::Null => ResultType::nullable(DataType::Int),
                Constant::Boolean(_) => ResultType::not_null(DataType::Boolean),
                Constant::Int(_) => ResultType::not_null(DataType::BigInt),
                Constant::Text(_) => ResultType::not_null(DataType::Varchar),
            },
            Expr::Parameter { ty, .. } => *ty,
            Expr::Comparison { .. } | Expr::Logical { .. } => ResultType::boolean(),
            Expr::IsNull(_) => ResultType::not_null(DataType::Boolean),
            Expr::Function { ty, .. } => *ty,
            Expr::Aggregate(aggregate) => aggregate.ty,
            Expr::Subquery(subquery) => subquery.ty,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnExpr> {
        match self {
            Expr::Column(column) => Some(column),
            _ => None,
        }
    }

    /// Direct children (subquery plans are not expressions and are not included)
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Constant(_) | Expr::Parameter { .. } | Expr::Subquery(_) => {
                Vec::new()
            }
            Expr::Comparison { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::Logical { operands, .. } | Expr::Function { operands, .. } => {
                operands.iter().collect()
            }
            Expr::IsNull(operand) => vec![operand.as_ref()],
            Expr::Aggregate(aggregate) => aggregate
                .operand
                .iter()
                .map(AsRef::as_ref)
                .chain(aggregate.order_by.iter().map(|o| &o.expr))
                .collect(),
        }
    }

    /// Mutable direct children, in the same order as `children`
    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Column(_) | Expr::Constant(_) | Expr::Parameter { .. } | Expr::Subquery(_) => {
                Vec::new()
            }
            Expr::Comparison { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            Expr::Logical { operands, .. } | Expr::Function { operands, .. } => {
                operands.iter_mut().collect()
            }
            Expr::IsNull(operand) => vec![operand.as_mut()],
            Expr::Aggregate(aggregate) => aggregate
                .operand
                .iter_mut()
                .map(AsMut::as_mut)
                .chain(aggregate.order_by.iter_mut().map(|o| &mut o.expr))
                .collect(),
        }
    }

    /// Pre-order walk over this expression tree (not into subquery plans)
    pub fn for_each<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        for child in self.children() {
            child.for_each(f);
        }
    }

    /// Every column referenced by this expression (not into subquery plans)
    pub fn columns(&self) -> Vec<&ColumnExpr> {
        let mut columns = Vec::new();
        self.for_each(&mut |expr| {
            if let Expr::Column(column) = expr {
                columns.push(column);
            }
        });
        columns
    }

    /// Sources of every referenced column
    pub fn column_sources(&self) -> BTreeSet<NodeId> {
        self.columns().into_iter().map(|c| c.source).collect()
    }

    /// Whether an aggregate function call appears anywhere in this tree
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.for_each(&mut |expr| {
            if matches!(expr, Expr::Aggregate(_)) {
                found = true;
            }
        });
        found
    }

    /// Whether a subquery appears anywhere in this tree
    pub fn contains_subquery(&self) -> bool {
        let mut found = false;
        self.for_each(&mut |expr| {
            if matches!(expr, Expr::Subquery(_)) {
                found = true;
            }
        });
        found
    }

    /// Rewrite every column (not into subquery plans) through `f`
    pub fn map_columns(&mut self, f: &mut dyn FnMut(&mut ColumnExpr)) {
        if let Expr::Column(column) = self {
            f(column);
            return;
        }
        for child in self.children_mut() {
            child.map_columns(f);
        }
    }

    /// Split a condition into its top-level conjuncts
    pub fn conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::Logical {
                op: LogicalOp::And,
                operands,
            } => operands.into_iter().flat_map(Expr::conjuncts).collect(),
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(source: usize, position: usize) -> Expr {
        Expr::Column(ColumnExpr {
            source: NodeId::new(source),
            position,
            name: format!("t{source}.c{position}"),
            ty: ResultType::nullable(DataType::Int),
        })
    }

    #[test]
    fn test_column_identity_ignores_type() {
        let a = col(1, 0);
        let mut b = col(1, 0);
        if let Expr::Column(c) = &mut b {
            c.ty.nullable = false;
            c.name = "renamed".to_string();
        }
        assert_eq!(a, b);
        assert_ne!(col(1, 0), col(1, 1));
    }

    #[test]
    fn test_aggregate_identity_ignores_source_tag() {
        let mut a = AggregateFunctionExpr::new("sum", Some(col(1, 0)), false);
        let b = AggregateFunctionExpr::new("SUM", Some(col(1, 0)), false);
        a.source = Some(NodeId::new(9));
        assert_eq!(a, b);
        assert_ne!(a, AggregateFunctionExpr::new("SUM", Some(col(1, 0)), true));
    }

    #[test]
    fn test_aggregate_types() {
        let count = AggregateFunctionExpr::new("count", Some(col(1, 0)), false);
        assert_eq!(count.ty, ResultType::not_null(DataType::BigInt));
        let avg = AggregateFunctionExpr::new("avg", Some(col(1, 0)), false);
        assert_eq!(avg.ty.data_type, DataType::Double);
        let sum = avg.derive("SUM");
        assert_eq!(sum.function, "SUM");
        assert_eq!(sum.ty.data_type, DataType::BigInt);
    }

    #[test]
    fn test_derive_keeps_operand_and_distinct() {
        let mut avg = AggregateFunctionExpr::new("avg", Some(col(1, 2)), true);
        avg.order_by = vec![OrderByExpr {
            expr: col(1, 0),
            ascending: false,
        }];
        let count = avg.derive("COUNT");
        assert_eq!(count.function, "COUNT");
        assert_eq!(count.operand.as_deref(), Some(&col(1, 2)));
        assert!(count.distinct);
        assert_eq!(count.order_by, avg.order_by);
    }

    #[test]
    fn test_conjuncts_flatten_nested_and() {
        let cond = Expr::Logical {
            op: LogicalOp::And,
            operands: vec![
                Expr::comparison(ComparisonOp::Eq, col(1, 0), col(2, 0)),
                Expr::Logical {
                    op: LogicalOp::And,
                    operands: vec![Expr::IsNull(Box::new(col(1, 1))), col(2, 1)],
                },
            ],
        };
        assert_eq!(cond.conjuncts().len(), 3);
    }

    #[test]
    fn test_columns_and_sources() {
        let expr = Expr::function(
            "plus",
            vec![col(1, 0), Expr::comparison(ComparisonOp::Gt, col(2, 3), col(1, 0))],
            ResultType::nullable(DataType::Int),
        );
        assert_eq!(expr.columns().len(), 3);
        let sources: Vec<_> = expr.column_sources().into_iter().collect();
        assert_eq!(sources, vec![NodeId::new(1), NodeId::new(2)]);
    }
}
