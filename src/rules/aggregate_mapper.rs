//! Resolve aggregate function calls against their AggregateSource.
//!
//! For every AggregateSource, the nodes consuming its rows (Select, Sort,
//! Limit, up to and including the first Project) are rewritten so that:
//!
//! - expressions equal to a GROUP BY key read column `i` of the source
//! - aggregate calls are appended to the source's aggregate list (reusing
//!   an identical call) and read column `group_by.len() + j`
//! - `AVG(x)` becomes `divide(SUM(x), COUNT(x))`; the variance family
//!   becomes a helper function over `_VAR_SUM_2(x)`, `_VAR_SUM(x)`,
//!   `COUNT(x)`
//!
//! A second walk then handles columns still reaching below the source,
//! following the `implicit_aggregate` policy.
//!
//! Aggregates inside a subquery whose operand columns all belong to an
//! enclosing query's AggregateSource are tagged with that source and
//! resolved by it.

use super::{PlanContext, PlanRule};
use crate::config::ImplicitAggregate;
use crate::error::{PlanError, PlanResult};
use crate::plan::{
    AggregateFunctionExpr, ColumnExpr, Expr, NodeId, NodeKind, PlanGraph, PlanVisitor,
};
use crate::schema::Schema;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

pub struct AggregateMapper;

impl PlanRule for AggregateMapper {
    fn name(&self) -> &'static str {
        "AggregateMapper"
    }

    fn apply(&self, plan: &mut PlanContext) -> PlanResult<()> {
        let root = plan.root()?;

        let mut discovery = Discovery::default();
        plan.plan.accept(root, &mut discovery)?;
        if let Some(err) = discovery.error {
            return Err(err);
        }
        if discovery.sources.is_empty() {
            return match discovery.functions.first() {
                Some(function) => Err(PlanError::unsupported(
                    "aggregate not allowed here",
                    function.clone(),
                )),
                None => Ok(()),
            };
        }

        let mut owners = HashMap::new();
        for &(source, query) in &discovery.sources {
            let NodeKind::AggregateSource { input, .. } = plan.plan.kind(source)? else {
                return Err(plan.plan.malformed(source, "expected an AggregateSource"));
            };
            for below in plan.plan.sources_below(*input)? {
                owners.insert(below, (source, query));
            }
        }
        let mut annotator = OuterAggregates {
            owners,
            scopes: Vec::new(),
        };
        plan.plan.accept(root, &mut annotator)?;

        let policy = plan.config.optimizer.implicit_aggregate;
        for &(source, _) in &discovery.sources {
            map_aggregate_source(&mut plan.plan, &plan.schema, source, policy)?;
        }
        check_no_aggregates_left(&plan.plan)
    }

    fn check_postconditions(&self, plan: &PlanContext) -> PlanResult<()> {
        check_no_aggregates_left(&plan.plan)
    }
}

/// Finds AggregateSources (with their query) and aggregate calls
#[derive(Default)]
struct Discovery {
    scopes: Vec<NodeId>,
    sources: Vec<(NodeId, NodeId)>,
    functions: Vec<String>,
    error: Option<PlanError>,
}

impl PlanVisitor for Discovery {
    fn visit_enter(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        match graph.kind(node)? {
            NodeKind::Query(_) => self.scopes.push(node),
            NodeKind::AggregateSource { .. } => {
                let query = self
                    .scopes
                    .last()
                    .copied()
                    .ok_or_else(|| graph.malformed(node, "aggregate outside any query"))?;
                self.sources.push((node, query));
            }
            _ => {}
        }
        Ok(true)
    }

    fn visit_leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if matches!(graph.kind(node)?, NodeKind::Query(_)) {
            self.scopes.pop();
        }
        Ok(true)
    }

    fn visit_enter_expr(&mut self, _graph: &PlanGraph, expr: &Expr) -> bool {
        if let Expr::Aggregate(aggregate) = expr {
            self.functions.push(expr.to_string());
            let nested = aggregate
                .operand
                .as_deref()
                .is_some_and(Expr::contains_aggregate);
            if nested && self.error.is_none() {
                self.error = Some(PlanError::unsupported(
                    "nested aggregate functions",
                    expr.to_string(),
                ));
            }
        }
        true
    }
}

/// Tags aggregates that bind to an enclosing query's AggregateSource
struct OuterAggregates {
    /// column source -> (AggregateSource above it, query of that source)
    owners: HashMap<NodeId, (NodeId, NodeId)>,
    scopes: Vec<NodeId>,
}

impl PlanVisitor for OuterAggregates {
    fn visit_enter(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if matches!(graph.kind(node)?, NodeKind::Query(_)) {
            self.scopes.push(node);
        }
        Ok(true)
    }

    fn visit_leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if matches!(graph.kind(node)?, NodeKind::Query(_)) {
            self.scopes.pop();
        }
        Ok(true)
    }

    fn rewrite_expr(&mut self, _graph: &PlanGraph, expr: Expr) -> PlanResult<Expr> {
        let Expr::Aggregate(mut aggregate) = expr else {
            return Ok(expr);
        };
        if aggregate.source.is_none() {
            let mut owners = BTreeSet::new();
            let mut unowned = false;
            if let Some(operand) = &aggregate.operand {
                for column in operand.columns() {
                    match self.owners.get(&column.source) {
                        Some(owner) => {
                            owners.insert(*owner);
                        }
                        None => unowned = true,
                    }
                }
            }
            let owners: Vec<(NodeId, NodeId)> = owners.into_iter().collect();
            if let (false, [(source, query)]) = (unowned, owners.as_slice()) {
                if self.scopes.last() != Some(query) {
                    aggregate.source = Some(*source);
                }
            }
        }
        Ok(Expr::Aggregate(aggregate))
    }
}

/// Working copy of one AggregateSource's output lists
struct AggregateState {
    source: NodeId,
    group_by: Vec<Expr>,
    aggregates: Vec<Expr>,
}

impl AggregateState {
    fn column(&self, position: usize) -> Expr {
        let field = if position < self.group_by.len() {
            &self.group_by[position]
        } else {
            &self.aggregates[position - self.group_by.len()]
        };
        Expr::Column(ColumnExpr {
            source: self.source,
            position,
            name: field.to_string(),
            ty: field.result_type(),
        })
    }

    fn group_by_position(&self, expr: &Expr) -> Option<usize> {
        self.group_by.iter().position(|key| key == expr)
    }

    /// Column reading `aggregate`, appending it unless already present
    fn add_aggregate(&mut self, mut aggregate: AggregateFunctionExpr) -> Expr {
        aggregate.source = None;
        let aggregate = Expr::Aggregate(aggregate);
        let index = match self.aggregates.iter().position(|a| *a == aggregate) {
            Some(index) => index,
            None => {
                self.aggregates.push(aggregate);
                self.aggregates.len() - 1
            }
        };
        self.column(self.group_by.len() + index)
    }

    /// Column reading a new GROUP BY key; only valid while no aggregates exist
    fn add_group_by(&mut self, key: Expr) -> Expr {
        let position = match self.group_by_position(&key) {
            Some(position) => position,
            None => {
                self.group_by.push(key);
                self.group_by.len() - 1
            }
        };
        self.column(position)
    }

    fn map_aggregate(&mut self, aggregate: AggregateFunctionExpr) -> Expr {
        match aggregate.function.as_str() {
            "AVG" => {
                let sum = self.add_aggregate(aggregate.derive("SUM"));
                let count = self.add_aggregate(aggregate.derive("COUNT"));
                Expr::function("divide", vec![sum, count], aggregate.ty)
            }
            "VAR_POP" | "VAR_SAMP" | "STDDEV_POP" | "STDDEV_SAMP" => {
                let sum_squares = self.add_aggregate(aggregate.derive("_VAR_SUM_2"));
                let sum = self.add_aggregate(aggregate.derive("_VAR_SUM"));
                let count = self.add_aggregate(aggregate.derive("COUNT"));
                Expr::function(
                    &format!("_{}", aggregate.function),
                    vec![sum_squares, sum, count],
                    aggregate.ty,
                )
            }
            _ => self.add_aggregate(aggregate),
        }
    }
}

fn map_aggregate_source(
    graph: &mut PlanGraph,
    schema: &Schema,
    source: NodeId,
    policy: ImplicitAggregate,
) -> PlanResult<()> {
    let NodeKind::AggregateSource {
        input,
        group_by,
        aggregates,
    } = graph.kind(source)?
    else {
        return Err(graph.malformed(source, "expected an AggregateSource"));
    };
    let below = graph.sources_below(*input)?;
    let mut state = AggregateState {
        source,
        group_by: group_by.clone(),
        aggregates: aggregates.clone(),
    };

    let consumers = consumers(graph, source)?;
    let mut remapper = Remapper {
        state: &mut state,
        depth: 0,
    };
    for &node in &consumers {
        graph.accept_node_expressions(node, &mut remapper)?;
    }
    let mut checker = UngroupedColumns {
        state: &mut state,
        below,
        policy,
        schema,
    };
    for &node in &consumers {
        graph.accept_node_expressions(node, &mut checker)?;
    }

    debug!(
        source = %source,
        group_by = state.group_by.len(),
        aggregates = state.aggregates.len(),
        "aggregate source mapped"
    );
    if let NodeKind::AggregateSource {
        group_by,
        aggregates,
        ..
    } = graph.kind_mut(source)?
    {
        *group_by = state.group_by;
        *aggregates = state.aggregates;
    }
    Ok(())
}

/// Nodes reading the AggregateSource's rows, through the first Project
fn consumers(graph: &PlanGraph, source: NodeId) -> PlanResult<Vec<NodeId>> {
    let mut consumers = Vec::new();
    let mut current = source;
    while let Some(parent) = graph.output(current)? {
        match graph.kind(parent)? {
            NodeKind::Select { .. } | NodeKind::Sort { .. } | NodeKind::Limit { .. } => {
                consumers.push(parent);
            }
            NodeKind::Project { .. } => {
                consumers.push(parent);
                break;
            }
            _ => break,
        }
        current = parent;
    }
    Ok(consumers)
}

/// Replaces GROUP BY matches and aggregate calls with source columns
struct Remapper<'s> {
    state: &'s mut AggregateState,
    /// Subquery nesting below the consumer being rewritten
    depth: usize,
}

impl Remapper<'_> {
    fn binds(&self, aggregate: &AggregateFunctionExpr) -> bool {
        match aggregate.source {
            None => self.depth == 0,
            Some(source) => source == self.state.source,
        }
    }
}

impl PlanVisitor for Remapper<'_> {
    fn visit_enter(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if matches!(graph.kind(node)?, NodeKind::Query(_)) {
            self.depth += 1;
        }
        Ok(true)
    }

    fn visit_leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if matches!(graph.kind(node)?, NodeKind::Query(_)) {
            self.depth -= 1;
        }
        Ok(true)
    }

    fn visit_children_first(&self, _expr: &Expr) -> bool {
        false
    }

    fn rewrite_expr(&mut self, _graph: &PlanGraph, expr: Expr) -> PlanResult<Expr> {
        if let Some(position) = self.state.group_by_position(&expr) {
            return Ok(self.state.column(position));
        }
        match expr {
            Expr::Aggregate(aggregate) if self.binds(&aggregate) => {
                if aggregate
                    .operand
                    .as_deref()
                    .is_some_and(Expr::contains_aggregate)
                {
                    return Err(PlanError::unsupported(
                        "nested aggregate functions",
                        Expr::Aggregate(aggregate).to_string(),
                    ));
                }
                Ok(self.state.map_aggregate(aggregate))
            }
            other => Ok(other),
        }
    }
}

/// Applies the implicit-aggregate policy to columns still reaching below
/// the AggregateSource
struct UngroupedColumns<'s> {
    state: &'s mut AggregateState,
    below: BTreeSet<NodeId>,
    policy: ImplicitAggregate,
    schema: &'s Schema,
}

impl UngroupedColumns<'_> {
    /// Whether a unique index of the column's table is covered by GROUP BY
    /// columns of the same table source
    fn unique_key_grouped(&self, graph: &PlanGraph, column: &ColumnExpr) -> PlanResult<bool> {
        let NodeKind::TableSource(source) = graph.kind(column.source)? else {
            return Ok(false);
        };
        let table = self.schema.table(&source.table)?;
        let grouped: BTreeSet<usize> = self
            .state
            .group_by
            .iter()
            .filter_map(Expr::as_column)
            .filter(|key| key.source == column.source)
            .map(|key| key.position)
            .collect();
        Ok(table
            .unique_indexes()
            .any(|index| index.columns.iter().all(|p| grouped.contains(p))))
    }
}

impl PlanVisitor for UngroupedColumns<'_> {
    fn rewrite_expr(&mut self, graph: &PlanGraph, expr: Expr) -> PlanResult<Expr> {
        let Expr::Column(column) = &expr else {
            return Ok(expr);
        };
        if !self.below.contains(&column.source) {
            return Ok(expr);
        }
        let first = AggregateFunctionExpr::new("FIRST", Some(expr.clone()), false);
        match self.policy {
            ImplicitAggregate::Error => Err(PlanError::group_by(
                column.name.clone(),
                "not grouped and not inside an aggregate function",
            )),
            ImplicitAggregate::First => Ok(self.state.add_aggregate(first)),
            ImplicitAggregate::FirstIfUnique => {
                if !self.unique_key_grouped(graph, column)? {
                    return Err(PlanError::group_by(
                        column.name.clone(),
                        "no unique index of its table is covered by the GROUP BY columns",
                    ));
                }
                if self.state.aggregates.is_empty() {
                    Ok(self.state.add_group_by(expr))
                } else {
                    Ok(self.state.add_aggregate(first))
                }
            }
        }
    }
}

fn check_no_aggregates_left(graph: &PlanGraph) -> PlanResult<()> {
    for id in graph.live_nodes() {
        let kind = graph.kind(id)?;
        if matches!(kind, NodeKind::AggregateSource { .. }) {
            continue;
        }
        for expr in kind.expressions() {
            let mut leftover = None;
            expr.for_each(&mut |e| {
                if leftover.is_none() && matches!(e, Expr::Aggregate(_)) {
                    leftover = Some(e.to_string());
                }
            });
            if let Some(function) = leftover {
                return Err(PlanError::unsupported("aggregate not allowed here", function));
            }
        }
    }
    Ok(())
}
