//! Plan traversal
//!
//! `PlanGraph::accept` walks a subtree: `visit_enter`, the inputs in slot
//! order, the node's expressions (descending into subquery plans), then
//! `visit_leave`. Expressions are detached from the node while they are
//! walked, so a visitor may rewrite them and still mutate the graph from
//! inside node callbacks.
//!
//! `rewrite_expr` runs post-order by default. A visitor that returns false
//! from `visit_children_first` gets it pre-order for that expression; if the
//! rewrite changes the expression, the replacement is not descended into.

use super::{ColumnExpr, Expr, NodeId, NodeKind, PlanGraph};
use crate::error::{PlanError, PlanResult};
use std::collections::BTreeSet;

/// Callbacks for a plan walk. Every method has a pass-through default.
pub trait PlanVisitor {
    /// Return false to skip the node's inputs and expressions
    fn visit_enter(&mut self, _graph: &mut PlanGraph, _node: NodeId) -> PlanResult<bool> {
        Ok(true)
    }

    /// Return false to stop visiting the node's remaining siblings
    fn visit_leave(&mut self, _graph: &mut PlanGraph, _node: NodeId) -> PlanResult<bool> {
        Ok(true)
    }

    /// Return false to skip the expression's children
    fn visit_enter_expr(&mut self, _graph: &PlanGraph, _expr: &Expr) -> bool {
        true
    }

    /// Return false to stop visiting the expression's remaining siblings
    fn visit_leave_expr(&mut self, _graph: &PlanGraph, _expr: &Expr) -> bool {
        true
    }

    fn visit_children_first(&self, _expr: &Expr) -> bool {
        true
    }

    fn rewrite_expr(&mut self, _graph: &PlanGraph, expr: Expr) -> PlanResult<Expr> {
        Ok(expr)
    }

    /// Return false for node-only walks
    fn visits_expressions(&self) -> bool {
        true
    }
}

impl PlanGraph {
    /// Walk the subtree rooted at `node`. Returns false when the walk was
    /// cut short by `visit_leave`.
    pub fn accept<V: PlanVisitor + ?Sized>(
        &mut self,
        node: NodeId,
        visitor: &mut V,
    ) -> PlanResult<bool> {
        if visitor.visit_enter(self, node)? && self.contains(node) {
            let mut complete = true;
            for input in self.inputs(node)? {
                // A callback may have restructured the node's inputs.
                if !self.contains(input) {
                    continue;
                }
                if !self.accept(input, visitor)? {
                    complete = false;
                    break;
                }
            }
            if complete && visitor.visits_expressions() {
                self.accept_node_expressions(node, visitor)?;
            }
        }
        if !self.contains(node) {
            return Ok(true);
        }
        visitor.visit_leave(self, node)
    }

    /// Walk only the expressions of `node` (and the subquery plans inside them)
    pub fn accept_node_expressions<V: PlanVisitor + ?Sized>(
        &mut self,
        node: NodeId,
        visitor: &mut V,
    ) -> PlanResult<()> {
        let detached: Vec<Expr> = self
            .kind_mut(node)?
            .expressions_mut()
            .into_iter()
            .map(std::mem::take)
            .collect();
        if detached.is_empty() {
            return Ok(());
        }

        let mut walked = Vec::with_capacity(detached.len());
        let mut stopped = false;
        for expr in detached {
            if stopped {
                walked.push(expr);
                continue;
            }
            let (expr, keep_going) = self.accept_expr(expr, visitor)?;
            walked.push(expr);
            stopped = !keep_going;
        }

        let slots = self.kind_mut(node)?.expressions_mut();
        if slots.len() != walked.len() {
            return Err(PlanError::internal(
                format!("expressions of {node} changed shape during a walk"),
                String::new(),
            ));
        }
        for (slot, expr) in slots.into_iter().zip(walked) {
            *slot = expr;
        }
        Ok(())
    }

    fn accept_expr<V: PlanVisitor + ?Sized>(
        &mut self,
        mut expr: Expr,
        visitor: &mut V,
    ) -> PlanResult<(Expr, bool)> {
        let children_first = visitor.visit_children_first(&expr);
        if !children_first {
            let rewritten = visitor.rewrite_expr(self, expr.clone())?;
            if rewritten != expr {
                return Ok((rewritten, true));
            }
        }

        if visitor.visit_enter_expr(self, &expr) {
            let mut complete = true;
            for child in expr.children_mut() {
                let (walked, keep_going) = self.accept_expr(std::mem::take(child), visitor)?;
                *child = walked;
                if !keep_going {
                    complete = false;
                    break;
                }
            }
            if complete {
                if let Expr::Subquery(subquery) = &expr {
                    let plan = subquery.subquery;
                    self.accept(plan, visitor)?;
                }
            }
        }

        let keep_going = visitor.visit_leave_expr(self, &expr);
        if children_first {
            expr = visitor.rewrite_expr(self, expr)?;
        }
        Ok((expr, keep_going))
    }
}

/// Collects nodes matching a predicate, in post-order (deeper nodes first),
/// including nodes of subquery plans
pub struct NodeFinder<F: Fn(&NodeKind) -> bool> {
    matches: F,
    found: Vec<NodeId>,
}

impl<F: Fn(&NodeKind) -> bool> NodeFinder<F> {
    pub fn new(matches: F) -> Self {
        NodeFinder {
            matches,
            found: Vec::new(),
        }
    }

    /// Walk from `root` and return the matching nodes
    pub fn find(mut self, graph: &mut PlanGraph, root: NodeId) -> PlanResult<Vec<NodeId>> {
        graph.accept(root, &mut self)?;
        Ok(self.found)
    }
}

impl<F: Fn(&NodeKind) -> bool> PlanVisitor for NodeFinder<F> {
    fn visit_leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        if (self.matches)(graph.kind(node)?) {
            self.found.push(node);
        }
        Ok(true)
    }
}

/// Deduplicated columns of `sources` read anywhere in a walk except inside
/// the `excluded` subtree, in first-read order
pub struct ColumnsOutside {
    excluded: NodeId,
    sources: BTreeSet<NodeId>,
    columns: Vec<ColumnExpr>,
}

impl ColumnsOutside {
    pub fn new(excluded: NodeId, sources: BTreeSet<NodeId>) -> Self {
        ColumnsOutside {
            excluded,
            sources,
            columns: Vec::new(),
        }
    }

    pub fn collect(mut self, graph: &mut PlanGraph, scope: NodeId) -> PlanResult<Vec<ColumnExpr>> {
        graph.accept(scope, &mut self)?;
        Ok(self.columns)
    }
}

impl PlanVisitor for ColumnsOutside {
    fn visit_enter(&mut self, _graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        Ok(node != self.excluded)
    }

    fn visit_enter_expr(&mut self, _graph: &PlanGraph, expr: &Expr) -> bool {
        if let Expr::Column(column) = expr {
            if self.sources.contains(&column.source) && !self.columns.contains(column) {
                self.columns.push(column.clone());
            }
        }
        true
    }
}

/// Points every read of `columns[i]` at `replacements[i]`, except inside the
/// `excluded` subtree
pub struct ColumnRedirect {
    excluded: NodeId,
    columns: Vec<ColumnExpr>,
    replacements: Vec<ColumnExpr>,
}

impl ColumnRedirect {
    pub fn new(
        excluded: NodeId,
        columns: Vec<ColumnExpr>,
        replacements: Vec<ColumnExpr>,
    ) -> Self {
        ColumnRedirect {
            excluded,
            columns,
            replacements,
        }
    }

    pub fn apply(mut self, graph: &mut PlanGraph, scope: NodeId) -> PlanResult<()> {
        graph.accept(scope, &mut self)?;
        Ok(())
    }
}

impl PlanVisitor for ColumnRedirect {
    fn visit_enter(&mut self, _graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
        Ok(node != self.excluded)
    }

    fn rewrite_expr(&mut self, _graph: &PlanGraph, expr: Expr) -> PlanResult<Expr> {
        if let Expr::Column(column) = &expr {
            if let Some(index) = self.columns.iter().position(|c| c == column) {
                return Ok(Expr::Column(self.replacements[index].clone()));
            }
        }
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Constant, DataType, ResultType, TableSource};

    fn setup() -> (PlanGraph, NodeId, NodeId) {
        let mut graph = PlanGraph::new();
        let t = graph.add(NodeKind::TableSource(TableSource {
            table: "t".to_string(),
            alias: None,
            columns: vec![("a".to_string(), ResultType::nullable(DataType::Int))],
            required: false,
        }));
        let a = graph.column_expr(t, 0).unwrap();
        let select = graph.add(NodeKind::Select {
            input: t,
            conditions: vec![Expr::IsNull(Box::new(Expr::Column(a)))],
        });
        graph.set_root(select);
        (graph, t, select)
    }

    struct ColumnCounter {
        columns: usize,
        nodes: Vec<NodeId>,
    }

    impl PlanVisitor for ColumnCounter {
        fn visit_enter(&mut self, _graph: &mut PlanGraph, node: NodeId) -> PlanResult<bool> {
            self.nodes.push(node);
            Ok(true)
        }

        fn visit_enter_expr(&mut self, _graph: &PlanGraph, expr: &Expr) -> bool {
            if matches!(expr, Expr::Column(_)) {
                self.columns += 1;
            }
            true
        }
    }

    #[test]
    fn test_walk_order_and_expressions() {
        let (mut graph, t, select) = setup();
        let mut counter = ColumnCounter {
            columns: 0,
            nodes: Vec::new(),
        };
        assert!(graph.accept(select, &mut counter).unwrap());
        assert_eq!(counter.nodes, vec![select, t]);
        assert_eq!(counter.columns, 1);
    }

    struct NullToFalse;

    impl PlanVisitor for NullToFalse {
        fn rewrite_expr(&mut self, _graph: &PlanGraph, expr: Expr) -> PlanResult<Expr> {
            Ok(match expr {
                Expr::IsNull(_) => Expr::Constant(Constant::Boolean(false)),
                other => other,
            })
        }
    }

    #[test]
    fn test_rewrite_is_written_back() {
        let (mut graph, _, select) = setup();
        graph.accept(select, &mut NullToFalse).unwrap();
        let NodeKind::Select { conditions, .. } = graph.kind(select).unwrap() else {
            panic!("expected Select");
        };
        assert_eq!(conditions[0], Expr::Constant(Constant::Boolean(false)));
    }

    #[test]
    fn test_node_finder_is_post_order() {
        let (mut graph, t, select) = setup();
        let found = NodeFinder::new(|_| true).find(&mut graph, select).unwrap();
        assert_eq!(found, vec![t, select]);
    }
}
