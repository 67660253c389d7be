//! # Plan Graph
//!
//! Operator tree of a compiled statement. Nodes live in an arena owned by
//! `PlanGraph` and are addressed by `NodeId`; every node records the node
//! consuming its output so passes can walk upward, and a node's input slots
//! are the downward edges.
//!
//! ```text
//! Query(Statement)
//!   ResultSet[name]
//!     Project[emp.name]
//!       Select[emp.dept = dept.id]
//!         JoinNode(INNER)
//!           TableSource(emp)
//!           TableSource(dept)
//! ```
//!
//! Ownership rules:
//! - a node is the input of at most one parent (`output`)
//! - removed nodes become tombstones; looking one up is an internal error
//! - expressions are owned by their node; `ColumnExpr::source` and
//!   `SubqueryExpr::subquery` are non-owning references into the arena

pub mod builders;
pub mod explain;
pub mod expr;
pub mod visit;

pub use expr::{
    AggregateFunctionExpr, ColumnExpr, ColumnRef, ComparisonOp, Constant, DataType, Expr,
    LogicalOp, OrderByExpr, ResultType, SubqueryExpr, SubqueryKind,
};
pub use visit::{ColumnRedirect, ColumnsOutside, NodeFinder, PlanVisitor};

use crate::equivalence::EquivalenceFinder;
use crate::error::{PlanError, PlanResult};
use std::collections::BTreeSet;
use std::fmt;

/// Arena index of a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(index: usize) -> Self {
        NodeId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Join semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Semi,
    Anti,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Semi => "SEMI",
            JoinType::Anti => "ANTI",
        })
    }
}

/// Physical join strategy chosen by the join picker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinImplementation {
    NestedLoops,
    BloomFilter,
    HashTable,
    Merge,
}

impl fmt::Display for JoinImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinImplementation::NestedLoops => "NESTED_LOOPS",
            JoinImplementation::BloomFilter => "BLOOM_FILTER",
            JoinImplementation::HashTable => "HASH_TABLE",
            JoinImplementation::Merge => "MERGE",
        })
    }
}

/// Hash/bloom build side of a join, attached by the join picker
#[derive(Debug, Clone, PartialEq)]
pub struct HashJoinSpec {
    /// Name of the hash table or bloom filter
    pub table: String,
    /// Subtree whose rows are loaded into the table
    pub loader: NodeId,
    /// Key expressions evaluated on loader rows
    pub hash_columns: Vec<Expr>,
    /// Key expressions evaluated on probe rows
    pub match_columns: Vec<Expr>,
    pub key_comparators: Vec<Option<String>>,
    pub collators: Vec<Option<String>>,
}

/// Logical join of two subtrees
#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    pub left: NodeId,
    pub right: NodeId,
    pub join_type: JoinType,
    pub implementation: JoinImplementation,
    /// Implicitly ANDed join conditions
    pub conditions: Vec<Expr>,
    pub hash: Option<HashJoinSpec>,
}

/// Nested-loop map: for every outer row, evaluate inner with the outer row bound
#[derive(Debug, Clone, PartialEq)]
pub struct MapJoin {
    pub outer: NodeId,
    pub inner: NodeId,
    /// Cleared once the join semantics are folded into the inner side
    pub join_type: Option<JoinType>,
    pub lookahead_quantum: usize,
}

/// Physical strategy of a Distinct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DistinctImplementation {
    /// Left to later physical planning
    #[default]
    Unsorted,
    /// Duplicates removed by sorting on `orderings`
    ExplicitSort,
}

/// Whether a query is the statement itself or a nested subquery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Statement,
    Subquery,
}

/// Root of a query scope
#[derive(Debug, Clone)]
pub struct BaseQuery {
    pub input: NodeId,
    pub kind: QueryKind,
    /// Column sources of enclosing scopes visible to this query
    pub outer_tables: BTreeSet<NodeId>,
    /// Column equalities proven by predicates and foreign keys
    pub equivalences: EquivalenceFinder<ColumnRef>,
    /// Column equalities implied by foreign keys alone
    pub fk_equivalences: EquivalenceFinder<ColumnRef>,
    /// Columns proven non-null by equality predicates
    pub not_nullable: BTreeSet<ColumnRef>,
    /// Detached table sources synthesized for foreign-key parents
    pub fk_tables: Vec<NodeId>,
}

impl BaseQuery {
    pub fn new(input: NodeId, kind: QueryKind) -> Self {
        BaseQuery {
            input,
            kind,
            outer_tables: BTreeSet::new(),
            equivalences: EquivalenceFinder::new(),
            fk_equivalences: EquivalenceFinder::new(),
            not_nullable: BTreeSet::new(),
            fk_tables: Vec::new(),
        }
    }
}

/// Scan of one base table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSource {
    pub table: String,
    pub alias: Option<String>,
    /// `(name, type)` of every column, in table order
    pub columns: Vec<(String, ResultType)>,
    /// At least one row must be produced for the enclosing join to survive
    pub required: bool,
}

impl TableSource {
    /// Name used to qualify column names
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// Closed set of plan operators
#[derive(Debug, Clone)]
pub enum NodeKind {
    TableSource(TableSource),
    Select {
        input: NodeId,
        conditions: Vec<Expr>,
    },
    Project {
        input: NodeId,
        fields: Vec<Expr>,
    },
    Sort {
        input: NodeId,
        orderings: Vec<OrderByExpr>,
    },
    Limit {
        input: NodeId,
        offset: usize,
        limit: Option<usize>,
    },
    /// Output row: group-by values followed by aggregate results
    AggregateSource {
        input: NodeId,
        group_by: Vec<Expr>,
        aggregates: Vec<Expr>,
    },
    Distinct {
        input: NodeId,
        implementation: DistinctImplementation,
        orderings: Vec<OrderByExpr>,
    },
    Join(JoinNode),
    MapJoin(MapJoin),
    /// Emits one all-null row when its input is empty
    NullIfEmpty {
        input: NodeId,
    },
    /// Emits one row only when its input is empty
    OnlyIfEmpty {
        input: NodeId,
    },
    UsingBloomFilter {
        filter: String,
        loader: NodeId,
        input: NodeId,
    },
    BloomFilterFilter {
        filter: String,
        match_columns: Vec<Expr>,
        outer: NodeId,
        inner: NodeId,
    },
    UsingHashTable {
        table: String,
        loader: NodeId,
        input: NodeId,
        hash_columns: Vec<Expr>,
        key_comparators: Vec<Option<String>>,
        collators: Vec<Option<String>>,
    },
    /// Derived table in FROM; `subquery` is a `Query` node
    SubquerySource {
        subquery: NodeId,
        name: String,
    },
    Query(BaseQuery),
    ResultSet {
        input: NodeId,
        fields: Vec<String>,
    },
    UpdateInput {
        input: NodeId,
        table: String,
    },
}

impl NodeKind {
    /// Operator name
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::TableSource(_) => "TableSource",
            NodeKind::Select { .. } => "Select",
            NodeKind::Project { .. } => "Project",
            NodeKind::Sort { .. } => "Sort",
            NodeKind::Limit { .. } => "Limit",
            NodeKind::AggregateSource { .. } => "AggregateSource",
            NodeKind::Distinct { .. } => "Distinct",
            NodeKind::Join(_) => "JoinNode",
            NodeKind::MapJoin(_) => "MapJoin",
            NodeKind::NullIfEmpty { .. } => "NullIfEmpty",
            NodeKind::OnlyIfEmpty { .. } => "OnlyIfEmpty",
            NodeKind::UsingBloomFilter { .. } => "UsingBloomFilter",
            NodeKind::BloomFilterFilter { .. } => "BloomFilterFilter",
            NodeKind::UsingHashTable { .. } => "UsingHashTable",
            NodeKind::SubquerySource { .. } => "SubquerySource",
            NodeKind::Query(_) => "Query",
            NodeKind::ResultSet { .. } => "ResultSet",
            NodeKind::UpdateInput { .. } => "UpdateInput",
        }
    }

    /// Input nodes in slot order
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeKind::TableSource(_) => Vec::new(),
            NodeKind::Select { input, .. }
            | NodeKind::Project { input, .. }
            | NodeKind::Sort { input, .. }
            | NodeKind::Limit { input, .. }
            | NodeKind::AggregateSource { input, .. }
            | NodeKind::Distinct { input, .. }
            | NodeKind::NullIfEmpty { input }
            | NodeKind::OnlyIfEmpty { input }
            | NodeKind::ResultSet { input, .. }
            | NodeKind::UpdateInput { input, .. } => vec![*input],
            NodeKind::Join(join) => {
                let mut inputs = vec![join.left, join.right];
                if let Some(hash) = &join.hash {
                    inputs.push(hash.loader);
                }
                inputs
            }
            NodeKind::MapJoin(map) => vec![map.outer, map.inner],
            NodeKind::UsingBloomFilter { loader, input, .. }
            | NodeKind::UsingHashTable { loader, input, .. } => vec![*loader, *input],
            NodeKind::BloomFilterFilter { outer, inner, .. } => vec![*outer, *inner],
            NodeKind::SubquerySource { subquery, .. } => vec![*subquery],
            NodeKind::Query(query) => vec![query.input],
        }
    }

    /// Mutable input slots, in the same order as `inputs`
    pub fn input_slots_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            NodeKind::TableSource(_) => Vec::new(),
            NodeKind::Select { input, .. }
            | NodeKind::Project { input, .. }
            | NodeKind::Sort { input, .. }
            | NodeKind::Limit { input, .. }
            | NodeKind::AggregateSource { input, .. }
            | NodeKind::Distinct { input, .. }
            | NodeKind::NullIfEmpty { input }
            | NodeKind::OnlyIfEmpty { input }
            | NodeKind::ResultSet { input, .. }
            | NodeKind::UpdateInput { input, .. } => vec![input],
            NodeKind::Join(join) => {
                let mut slots = vec![&mut join.left, &mut join.right];
                if let Some(hash) = &mut join.hash {
                    slots.push(&mut hash.loader);
                }
                slots
            }
            NodeKind::MapJoin(map) => vec![&mut map.outer, &mut map.inner],
            NodeKind::UsingBloomFilter { loader, input, .. }
            | NodeKind::UsingHashTable { loader, input, .. } => vec![loader, input],
            NodeKind::BloomFilterFilter { outer, inner, .. } => vec![outer, inner],
            NodeKind::SubquerySource { subquery, .. } => vec![subquery],
            NodeKind::Query(query) => vec![&mut query.input],
        }
    }

    /// Every expression embedded in this node
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            NodeKind::Select { conditions, .. } => conditions.iter().collect(),
            NodeKind::Project { fields, .. } => fields.iter().collect(),
            NodeKind::Sort { orderings, .. } | NodeKind::Distinct { orderings, .. } => {
                orderings.iter().map(|o| &o.expr).collect()
            }
            NodeKind::AggregateSource {
                group_by,
                aggregates,
                ..
            } => group_by.iter().chain(aggregates.iter()).collect(),
            NodeKind::Join(join) => {
                let mut exprs: Vec<&Expr> = join.conditions.iter().collect();
                if let Some(hash) = &join.hash {
                    exprs.extend(hash.hash_columns.iter());
                    exprs.extend(hash.match_columns.iter());
                }
                exprs
            }
            NodeKind::BloomFilterFilter { match_columns, .. } => match_columns.iter().collect(),
            NodeKind::UsingHashTable { hash_columns, .. } => hash_columns.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Mutable expressions, in the same order as `expressions`
    pub fn expressions_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            NodeKind::Select { conditions, .. } => conditions.iter_mut().collect(),
            NodeKind::Project { fields, .. } => fields.iter_mut().collect(),
            NodeKind::Sort { orderings, .. } | NodeKind::Distinct { orderings, .. } => {
                orderings.iter_mut().map(|o| &mut o.expr).collect()
            }
            NodeKind::AggregateSource {
                group_by,
                aggregates,
                ..
            } => group_by.iter_mut().chain(aggregates.iter_mut()).collect(),
            NodeKind::Join(join) => {
                let mut exprs: Vec<&mut Expr> = join.conditions.iter_mut().collect();
                if let Some(hash) = &mut join.hash {
                    exprs.extend(hash.hash_columns.iter_mut());
                    exprs.extend(hash.match_columns.iter_mut());
                }
                exprs
            }
            NodeKind::BloomFilterFilter { match_columns, .. } => {
                match_columns.iter_mut().collect()
            }
            NodeKind::UsingHashTable { hash_columns, .. } => hash_columns.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `ColumnExpr`s may refer to this node
    pub fn is_column_source(&self) -> bool {
        matches!(
            self,
            NodeKind::TableSource(_)
                | NodeKind::Project { .. }
                | NodeKind::AggregateSource { .. }
                | NodeKind::SubquerySource { .. }
        )
    }
}

/// Arena slot
#[derive(Debug, Clone)]
pub struct PlanNode {
    /// Node consuming this node's rows
    pub output: Option<NodeId>,
    pub kind: NodeKind,
}

/// Arena of plan nodes plus the statement root
#[derive(Debug, Clone, Default)]
pub struct PlanGraph {
    nodes: Vec<Option<PlanNode>>,
    root: Option<NodeId>,
}

impl PlanGraph {
    pub fn new() -> Self {
        PlanGraph {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Add a node; its inputs now output to it
    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        for input in kind.inputs() {
            if let Some(Some(node)) = self.nodes.get_mut(input.0) {
                node.output = Some(id);
            }
        }
        self.nodes.push(Some(PlanNode { output: None, kind }));
        id
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    pub fn root(&self) -> PlanResult<NodeId> {
        self.root
            .ok_or_else(|| PlanError::internal("plan has no root", String::new()))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    pub fn node(&self, id: NodeId) -> PlanResult<&PlanNode> {
        match self.nodes.get(id.0) {
            Some(Some(node)) => Ok(node),
            _ => Err(PlanError::internal(
                format!("node {id} not found"),
                String::new(),
            )),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> PlanResult<&mut PlanNode> {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => Ok(node),
            _ => Err(PlanError::internal(
                format!("node {id} not found"),
                String::new(),
            )),
        }
    }

    pub fn kind(&self, id: NodeId) -> PlanResult<&NodeKind> {
        Ok(&self.node(id)?.kind)
    }

    pub fn kind_mut(&mut self, id: NodeId) -> PlanResult<&mut NodeKind> {
        Ok(&mut self.node_mut(id)?.kind)
    }

    pub fn output(&self, id: NodeId) -> PlanResult<Option<NodeId>> {
        Ok(self.node(id)?.output)
    }

    pub fn inputs(&self, id: NodeId) -> PlanResult<Vec<NodeId>> {
        Ok(self.kind(id)?.inputs())
    }

    /// Ids of all live nodes, in creation order
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    /// Point `parent`'s slot holding `old` at `new`; `new` outputs to `parent`.
    /// `old` keeps its output pointer.
    pub fn set_slot(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> PlanResult<()> {
        let node = self.node_mut(parent)?;
        let slot = node
            .kind
            .input_slots_mut()
            .into_iter()
            .find(|slot| **slot == old)
            .ok_or_else(|| {
                PlanError::internal(format!("{old} is not an input of {parent}"), String::new())
            })?;
        *slot = new;
        self.node_mut(new)?.output = Some(parent);
        Ok(())
    }

    /// Replace input `old` of `parent` with `new`, detaching `old`
    pub fn replace_input(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> PlanResult<()> {
        self.set_slot(parent, old, new)?;
        if old != new {
            self.node_mut(old)?.output = None;
        }
        Ok(())
    }

    /// Put `new` where `old` was: in `old`'s parent slot, or as the root
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> PlanResult<()> {
        match self.output(old)? {
            Some(parent) => self.set_slot(parent, old, new),
            None if self.root == Some(old) => {
                self.root = Some(new);
                self.node_mut(new)?.output = None;
                Ok(())
            }
            None => Err(self.malformed(old, "detached node cannot be replaced")),
        }
    }

    /// Insert a node built by `make` directly above `child`
    pub fn wrap(
        &mut self,
        child: NodeId,
        make: impl FnOnce(NodeId) -> NodeKind,
    ) -> PlanResult<NodeId> {
        let parent = self.output(child)?;
        let was_root = self.root == Some(child);
        let wrapper = self.add(make(child));
        match parent {
            Some(parent) => self.set_slot(parent, child, wrapper)?,
            None if was_root => self.root = Some(wrapper),
            None => {}
        }
        Ok(wrapper)
    }

    /// Remove a single-input node, connecting its input to its parent
    pub fn splice_out(&mut self, id: NodeId) -> PlanResult<()> {
        let inputs = self.inputs(id)?;
        let [input] = inputs.as_slice() else {
            return Err(self.malformed(id, "only single-input nodes can be spliced out"));
        };
        self.replace_node(id, *input)?;
        self.discard(id);
        Ok(())
    }

    /// Tombstone one node (its inputs are left alone)
    pub fn discard(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Rewrite every column of `from` into a column of `to` through `mapping`.
    /// Returns the number of rewritten columns.
    pub fn remap_columns(
        &mut self,
        from: NodeId,
        to: NodeId,
        mapping: impl Fn(usize) -> Option<usize>,
    ) -> PlanResult<usize> {
        let mut targets = Vec::new();
        for id in self.live_nodes() {
            for expr in self.kind(id)?.expressions() {
                for column in expr.columns() {
                    if column.source == from {
                        let position = mapping(column.position).ok_or_else(|| {
                            self.malformed(id, "column has no counterpart after rewrite")
                        })?;
                        targets.push(position);
                    }
                }
            }
        }
        let mut replacements = Vec::with_capacity(targets.len());
        for position in targets {
            replacements.push(self.column_expr(to, position)?);
        }
        let count = replacements.len();
        let mut replacements = replacements.into_iter();
        for id in self.live_nodes() {
            for expr in self.kind_mut(id)?.expressions_mut() {
                expr.map_columns(&mut |column| {
                    if column.source == from {
                        if let Some(replacement) = replacements.next() {
                            *column = replacement;
                        }
                    }
                });
            }
        }
        Ok(count)
    }

    /// Column `position` of column source `source`
    pub fn column_expr(&self, source: NodeId, position: usize) -> PlanResult<ColumnExpr> {
        let (name, ty) = match self.kind(source)? {
            NodeKind::TableSource(table) => {
                let (name, ty) = table
                    .columns
                    .get(position)
                    .ok_or_else(|| self.malformed(source, "column position out of range"))?;
                (format!("{}.{name}", table.qualifier()), *ty)
            }
            NodeKind::Project { fields, .. } => {
                let field = fields
                    .get(position)
                    .ok_or_else(|| self.malformed(source, "column position out of range"))?;
                (field.to_string(), field.result_type())
            }
            NodeKind::AggregateSource {
                group_by,
                aggregates,
                ..
            } => {
                let field = group_by
                    .iter()
                    .chain(aggregates.iter())
                    .nth(position)
                    .ok_or_else(|| self.malformed(source, "column position out of range"))?;
                (field.to_string(), field.result_type())
            }
            NodeKind::SubquerySource { subquery, name } => {
                let fields = self.output_fields(*subquery)?;
                let field = fields
                    .get(position)
                    .ok_or_else(|| self.malformed(source, "column position out of range"))?;
                (
                    format!("{name}.{field}"),
                    field.result_type(),
                )
            }
            _ => return Err(self.malformed(source, "not a column source")),
        };
        Ok(ColumnExpr {
            source,
            position,
            name,
            ty,
        })
    }

    /// Fields of the Project producing the rows of `id`, looking through
    /// row-preserving operators
    pub fn output_fields(&self, id: NodeId) -> PlanResult<&[Expr]> {
        let mut current = id;
        loop {
            match self.kind(current)? {
                NodeKind::Project { fields, .. } => return Ok(fields),
                NodeKind::Query(_)
                | NodeKind::ResultSet { .. }
                | NodeKind::Select { .. }
                | NodeKind::Sort { .. }
                | NodeKind::Limit { .. }
                | NodeKind::Distinct { .. } => current = self.inputs(current)?[0],
                _ => return Err(self.malformed(id, "subquery has no output project")),
            }
        }
    }

    /// Nearest enclosing `Query` node (the node itself if it is one)
    pub fn enclosing_query(&self, id: NodeId) -> PlanResult<NodeId> {
        let mut current = id;
        loop {
            let node = self.node(current)?;
            if matches!(node.kind, NodeKind::Query(_)) {
                return Ok(current);
            }
            current = node
                .output
                .ok_or_else(|| self.malformed(id, "node is outside any query"))?;
        }
    }

    pub fn query(&self, id: NodeId) -> PlanResult<&BaseQuery> {
        match self.kind(id)? {
            NodeKind::Query(query) => Ok(query),
            _ => Err(self.malformed(id, "expected a Query node")),
        }
    }

    pub fn query_mut(&mut self, id: NodeId) -> PlanResult<&mut BaseQuery> {
        if !matches!(self.kind(id)?, NodeKind::Query(_)) {
            return Err(self.malformed(id, "expected a Query node"));
        }
        match self.kind_mut(id)? {
            NodeKind::Query(query) => Ok(query),
            _ => Err(PlanError::internal("expected a Query node", String::new())),
        }
    }

    /// Column sources in the subtree rooted at `id`, not crossing into
    /// nested query scopes
    pub fn sources_below(&self, id: NodeId) -> PlanResult<BTreeSet<NodeId>> {
        let mut sources = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let kind = self.kind(current)?;
            if kind.is_column_source() {
                sources.insert(current);
            }
            match kind {
                NodeKind::Query(_) | NodeKind::SubquerySource { .. } => {}
                _ => stack.extend(kind.inputs()),
            }
        }
        Ok(sources)
    }

    /// Column sources whose columns leave the subtree rooted at `id` in its
    /// rows. A folded map only emits its inner side's rows, and hash or bloom
    /// loaders never reach the output.
    pub fn row_sources(&self, id: NodeId) -> PlanResult<BTreeSet<NodeId>> {
        let mut sources = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let kind = self.kind(current)?;
            if kind.is_column_source() {
                sources.insert(current);
            }
            match kind {
                NodeKind::Query(_) | NodeKind::SubquerySource { .. } => {}
                NodeKind::MapJoin(map) if map.join_type.is_none() => stack.push(map.inner),
                NodeKind::UsingHashTable { input, .. }
                | NodeKind::UsingBloomFilter { input, .. } => stack.push(*input),
                _ => stack.extend(kind.inputs()),
            }
        }
        Ok(sources)
    }

    /// Every node in the subtree rooted at `id`, not crossing into nested
    /// query scopes
    pub fn subtree(&self, id: NodeId) -> PlanResult<BTreeSet<NodeId>> {
        let mut nodes = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            nodes.insert(current);
            match self.kind(current)? {
                NodeKind::Query(_) if current != id => {}
                NodeKind::SubquerySource { .. } => {}
                kind => stack.extend(kind.inputs()),
            }
        }
        Ok(nodes)
    }

    /// Internal error carrying the explain text of `id`
    pub fn malformed(&self, id: NodeId, message: &str) -> PlanError {
        PlanError::internal(format!("{message} at {id}"), self.explain_subtree(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(graph: &mut PlanGraph, name: &str) -> NodeId {
        graph.add(NodeKind::TableSource(TableSource {
            table: name.to_string(),
            alias: None,
            columns: vec![
                ("a".to_string(), ResultType::nullable(DataType::Int)),
                ("b".to_string(), ResultType::nullable(DataType::Int)),
            ],
            required: false,
        }))
    }

    #[test]
    fn test_add_sets_output() {
        let mut graph = PlanGraph::new();
        let t = table(&mut graph, "t");
        let select = graph.add(NodeKind::Select {
            input: t,
            conditions: Vec::new(),
        });
        assert_eq!(graph.output(t).unwrap(), Some(select));
        assert_eq!(graph.inputs(select).unwrap(), vec![t]);
    }

    #[test]
    fn test_splice_out_reconnects_input() {
        let mut graph = PlanGraph::new();
        let t = table(&mut graph, "t");
        let select = graph.add(NodeKind::Select {
            input: t,
            conditions: Vec::new(),
        });
        let limit = graph.add(NodeKind::Limit {
            input: select,
            offset: 0,
            limit: Some(1),
        });
        graph.splice_out(select).unwrap();
        assert!(!graph.contains(select));
        assert_eq!(graph.inputs(limit).unwrap(), vec![t]);
        assert_eq!(graph.output(t).unwrap(), Some(limit));
        assert!(graph.node(select).is_err());
    }

    #[test]
    fn test_wrap_root() {
        let mut graph = PlanGraph::new();
        let t = table(&mut graph, "t");
        graph.set_root(t);
        let limit = graph
            .wrap(t, |input| NodeKind::Limit {
                input,
                offset: 0,
                limit: None,
            })
            .unwrap();
        assert_eq!(graph.root().unwrap(), limit);
        assert_eq!(graph.output(t).unwrap(), Some(limit));
    }

    #[test]
    fn test_remap_columns() {
        let mut graph = PlanGraph::new();
        let t = table(&mut graph, "t");
        let b = graph.column_expr(t, 1).unwrap();
        let project = graph.add(NodeKind::Project {
            input: t,
            fields: vec![Expr::Column(b.clone())],
        });
        let select = graph.add(NodeKind::Select {
            input: project,
            conditions: vec![Expr::IsNull(Box::new(Expr::Column(b)))],
        });
        let rewritten = graph
            .remap_columns(t, project, |p| (p == 1).then_some(0))
            .unwrap();
        // The Project's own field is rewritten too; callers decide the scope.
        assert_eq!(rewritten, 2);
        let NodeKind::Select { conditions, .. } = graph.kind(select).unwrap() else {
            panic!("expected Select");
        };
        assert_eq!(conditions[0].columns()[0].key(), ColumnRef { source: project, position: 0 });
    }

    #[test]
    fn test_sources_below_stops_at_subquery() {
        let mut graph = PlanGraph::new();
        let inner = table(&mut graph, "inner_t");
        let inner_project = graph.add(NodeKind::Project {
            input: inner,
            fields: Vec::new(),
        });
        let query = graph.add(NodeKind::Query(BaseQuery::new(
            inner_project,
            QueryKind::Subquery,
        )));
        let derived = graph.add(NodeKind::SubquerySource {
            subquery: query,
            name: "d".to_string(),
        });
        let sources = graph.sources_below(derived).unwrap();
        assert_eq!(sources.into_iter().collect::<Vec<_>>(), vec![derived]);
    }

    #[test]
    fn test_row_sources_skip_folded_outer_side() {
        let mut graph = PlanGraph::new();
        let a = table(&mut graph, "a");
        let b = table(&mut graph, "b");
        let map = graph.add(NodeKind::MapJoin(MapJoin {
            outer: a,
            inner: b,
            join_type: None,
            lookahead_quantum: 1,
        }));
        assert_eq!(graph.row_sources(map).unwrap().into_iter().collect::<Vec<_>>(), vec![b]);
        assert_eq!(graph.sources_below(map).unwrap().len(), 2);

        if let NodeKind::MapJoin(join) = graph.kind_mut(map).unwrap() {
            join.join_type = Some(JoinType::Left);
        }
        assert_eq!(graph.row_sources(map).unwrap().len(), 2);
    }
}
