//! Map Folding Tests
//!
//! Join types folded into the inner side, loop nesting, operators moved
//! inside loops and capture projects.

use planrules::plan::builders::{asc, eq, gt, int, PlanBuilder};
use planrules::plan::{DataType, JoinImplementation, JoinType, MapJoin, NodeId, NodeKind};
use planrules::rules::{MapFolder, NestedLoopMapper, PlanInvariants};
use planrules::schema::{Schema, TableDef};
use planrules::{Config, Expr, PlanContext, PlanGraph, PlanRule};
use std::sync::Arc;

fn schema() -> Schema {
    let mut schema = Schema::new();
    for name in ["a", "b", "c"] {
        schema.add_table(TableDef::new(
            name,
            &[
                ("id", DataType::Int, false),
                ("parent", DataType::Int, true),
                ("val", DataType::Int, true),
            ],
        ));
    }
    schema
}

fn fold(plan: PlanGraph) -> PlanContext {
    let mut context = PlanContext::new(plan, Arc::new(schema()), Config::default());
    NestedLoopMapper.apply(&mut context).unwrap();
    MapFolder.apply(&mut context).unwrap();
    MapFolder.check_postconditions(&context).unwrap();
    PlanInvariants::check(&context.plan).unwrap();
    context
}

fn maps(context: &PlanContext) -> Vec<(NodeId, MapJoin)> {
    context
        .plan
        .live_nodes()
        .into_iter()
        .filter_map(|id| match context.plan.kind(id).unwrap() {
            NodeKind::MapJoin(map) => Some((id, map.clone())),
            _ => None,
        })
        .collect()
}

fn only_map(context: &PlanContext) -> MapJoin {
    let mut maps = maps(context);
    assert_eq!(maps.len(), 1, "expected exactly one MapJoin");
    maps.remove(0).1
}

fn projects(context: &PlanContext) -> Vec<NodeId> {
    context
        .plan
        .live_nodes()
        .into_iter()
        .filter(|&id| matches!(context.plan.kind(id).unwrap(), NodeKind::Project { .. }))
        .collect()
}

/// SELECT a.val FROM a <join_type> JOIN b ON a.id = b.parent
fn joined(join_type: JoinType) -> (PlanGraph, NodeId, NodeId, NodeId) {
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let on = eq(b.col(a, "id").unwrap(), b.col(b_src, "parent").unwrap());
    let join = b.join(a, b_src, join_type, vec![on]);
    let field = b.col(a, "val").unwrap();
    let project = b.project(join, vec![field]);
    (b.statement(project, &["val"]), a, b_src, project)
}

/// Kind names from `id` down through single-input nodes
fn chain(context: &PlanContext, mut id: NodeId) -> Vec<&'static str> {
    let mut names = Vec::new();
    loop {
        let kind = context.plan.kind(id).unwrap();
        names.push(kind.name());
        match kind.inputs().as_slice() {
            [input] => id = *input,
            _ => return names,
        }
    }
}

#[test]
fn test_left_join_becomes_null_if_empty() {
    let (plan, a, _, project) = joined(JoinType::Left);
    let context = fold(plan);

    let map = only_map(&context);
    assert_eq!(map.join_type, None);
    assert_eq!(map.outer, a);
    assert_eq!(map.inner, project);
    assert_eq!(
        chain(&context, map.inner),
        vec!["Project", "NullIfEmpty", "Select", "TableSource"]
    );
}

#[test]
fn test_semi_and_anti_joins_fold_into_inner_side() {
    let (plan, _, _, _) = joined(JoinType::Semi);
    let context = fold(plan);
    let map = only_map(&context);
    assert_eq!(
        chain(&context, map.inner),
        vec!["Project", "Limit", "Select", "TableSource"]
    );

    let (plan, _, _, _) = joined(JoinType::Anti);
    let context = fold(plan);
    let map = only_map(&context);
    assert_eq!(
        chain(&context, map.inner),
        vec!["Project", "OnlyIfEmpty", "Select", "TableSource"]
    );
}

#[test]
fn test_exists_subquery_keeps_no_capture_project() {
    // SELECT a.val FROM a WHERE EXISTS (SELECT * FROM b WHERE b.parent = a.id),
    // compiled to a semi join
    let (plan, _, _, project) = joined(JoinType::Semi);
    let context = fold(plan);

    assert_eq!(projects(&context), vec![project]);
    let root = context.plan.root().unwrap();
    let result = context.plan.query(root).unwrap().input;
    let NodeKind::ResultSet { input, .. } = context.plan.kind(result).unwrap() else {
        panic!("expected the result set below the query");
    };
    assert!(matches!(context.plan.kind(*input).unwrap(), NodeKind::MapJoin(_)));
}

#[test]
fn test_sort_over_loop_captures_exactly_the_sorted_column() {
    // SELECT a.val FROM a JOIN b ON a.id = b.parent ORDER BY a.val
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let on = eq(b.col(a, "id").unwrap(), b.col(b_src, "parent").unwrap());
    let join = b.inner_join(a, b_src, vec![on]);
    let key = asc(b.col(a, "val").unwrap());
    let sort = b.sort(join, vec![key]);
    let field = b.col(a, "val").unwrap();
    let output = b.project(sort, vec![field]);
    let plan = b.statement(output, &["val"]);

    let context = fold(plan);
    let map = only_map(&context);
    let NodeKind::Project { input, fields } = context.plan.kind(map.inner).unwrap() else {
        panic!("expected a capture project inside the loop");
    };
    assert!(matches!(context.plan.kind(*input).unwrap(), NodeKind::Select { .. }));
    assert_eq!(fields.len(), 1);
    let captured = fields[0].as_column().expect("captured field is a column");
    assert_eq!((captured.source, captured.position), (a, 2));

    let NodeKind::Sort { orderings, .. } = context.plan.kind(sort).unwrap() else {
        panic!("sort was removed");
    };
    let key = orderings[0].expr.as_column().expect("sort key is a column");
    assert_eq!((key.source, key.position), (map.inner, 0));
    let NodeKind::Project { fields, .. } = context.plan.kind(output).unwrap() else {
        panic!("output project was removed");
    };
    assert_eq!(fields[0].as_column().map(|c| c.source), Some(map.inner));
}

#[test]
fn test_selects_move_inside_the_loop() {
    // SELECT a.id, b.val FROM a LEFT JOIN b ON a.id = b.parent WHERE b.val > 1
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let on = eq(b.col(a, "id").unwrap(), b.col(b_src, "parent").unwrap());
    let join = b.left_join(a, b_src, vec![on]);
    let filter = gt(b.col(b_src, "val").unwrap(), int(1));
    let select = b.select(join, vec![filter]);
    let fields = vec![b.col(a, "id").unwrap(), b.col(b_src, "val").unwrap()];
    let project = b.project(select, fields);
    let plan = b.statement(project, &["id", "val"]);

    let context = fold(plan);
    let map = only_map(&context);
    assert_eq!(map.outer, a);
    assert_eq!(map.inner, project);
    assert_eq!(
        chain(&context, map.inner),
        vec!["Project", "Select", "NullIfEmpty", "Select", "TableSource"]
    );
    let NodeKind::Select { input, .. } = context.plan.kind(select).unwrap() else {
        panic!("where clause was removed");
    };
    assert!(matches!(context.plan.kind(*input).unwrap(), NodeKind::NullIfEmpty { .. }));
}

#[test]
fn test_nested_maps_read_as_loop_nesting() {
    // SELECT c.val FROM a JOIN b ON a.id = b.parent JOIN c ON b.id = c.parent
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let c = b.table("c").unwrap();
    let on_ab = eq(b.col(a, "id").unwrap(), b.col(b_src, "parent").unwrap());
    let lower = b.inner_join(a, b_src, vec![on_ab]);
    let on_bc = eq(b.col(b_src, "id").unwrap(), b.col(c, "parent").unwrap());
    let upper = b.inner_join(lower, c, vec![on_bc]);
    let field = b.col(c, "val").unwrap();
    let project = b.project(upper, vec![field]);
    let plan = b.statement(project, &["val"]);

    let context = fold(plan);
    let maps = maps(&context);
    assert_eq!(maps.len(), 2);
    for (_, map) in &maps {
        assert!(
            !matches!(context.plan.kind(map.outer).unwrap(), NodeKind::MapJoin(_)),
            "a loop is nested on an outer side"
        );
    }
    let (_, top) = maps
        .iter()
        .find(|(_, map)| map.outer == a)
        .expect("outermost loop scans a");
    assert_eq!(top.inner, project);
}

#[test]
fn test_unreferenced_project_under_aggregate_is_pruned() {
    // SELECT a.val FROM a JOIN b ON a.id = b.parent GROUP BY a.val, where the
    // grouping reads the scan directly rather than the projected rows
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let on = eq(b.col(a, "id").unwrap(), b.col(b_src, "parent").unwrap());
    let join = b.inner_join(a, b_src, vec![on]);
    let fields = vec![b.col(b_src, "val").unwrap()];
    let dead = b.project(join, fields);
    let key = b.col(a, "val").unwrap();
    let source = b.aggregate(dead, vec![key]);
    let plan = b.statement_without_result(source);

    let context = fold(plan);
    assert!(!context.plan.contains(dead));

    let map = only_map(&context);
    let NodeKind::Project { fields, .. } = context.plan.kind(map.inner).unwrap() else {
        panic!("expected a capture project for the grouping key");
    };
    assert_eq!(fields.len(), 1);
    let NodeKind::AggregateSource { group_by, .. } = context.plan.kind(source).unwrap() else {
        panic!("aggregate source was removed");
    };
    assert_eq!(
        group_by[0].as_column().map(|c| (c.source, c.position)),
        Some((map.inner, 0))
    );
    assert!(matches!(fields[0], Expr::Column(ref c) if c.source == a));
}

#[test]
fn test_nested_loop_captures_its_outer_binding() {
    // SELECT c.val FROM a JOIN b ON a.id = b.parent JOIN c ON b.id = c.parent
    // ORDER BY b.val
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let c = b.table("c").unwrap();
    let on_ab = eq(b.col(a, "id").unwrap(), b.col(b_src, "parent").unwrap());
    let lower = b.inner_join(a, b_src, vec![on_ab]);
    let on_bc = eq(b.col(b_src, "id").unwrap(), b.col(c, "parent").unwrap());
    let upper = b.inner_join(lower, c, vec![on_bc]);
    let key = asc(b.col(b_src, "val").unwrap());
    let sort = b.sort(upper, vec![key]);
    let field = b.col(c, "val").unwrap();
    let output = b.project(sort, vec![field]);
    let plan = b.statement(output, &["val"]);

    let context = fold(plan);
    let maps = maps(&context);
    assert_eq!(maps.len(), 2);
    let (_, nested) = maps
        .iter()
        .find(|(_, map)| map.outer != a)
        .expect("inner loop binds b");

    // b is only bound by the nested loop, so it must leave through a capture
    let NodeKind::Project { fields, .. } = context.plan.kind(nested.inner).unwrap() else {
        panic!("expected a capture project inside the nested loop");
    };
    let captured: Vec<_> = fields
        .iter()
        .map(|field| field.as_column().map(|c| (c.source, c.position)))
        .collect();
    assert_eq!(captured, vec![Some((b_src, 2)), Some((c, 2))]);

    let NodeKind::Sort { orderings, .. } = context.plan.kind(sort).unwrap() else {
        panic!("sort was removed");
    };
    let key = orderings[0].expr.as_column().expect("sort key is a column");
    assert_eq!((key.source, key.position), (nested.inner, 0));
    let NodeKind::Project { fields, .. } = context.plan.kind(output).unwrap() else {
        panic!("output project was removed");
    };
    assert_eq!(
        fields[0].as_column().map(|c| (c.source, c.position)),
        Some((nested.inner, 1))
    );
    assert_eq!(projects(&context).len(), 2);
}

#[test]
fn test_hash_table_stays_above_folded_map() {
    // SELECT a.val, b.val FROM a JOIN b USING HASH TABLE ht_c WHERE b.val > 1
    let schema = schema();
    let mut b = PlanBuilder::new(&schema);
    let a = b.table("a").unwrap();
    let b_src = b.table("b").unwrap();
    let c = b.table("c").unwrap();
    let hash_columns = vec![b.col(c, "id").unwrap()];
    let match_columns = vec![b.col(a, "parent").unwrap()];
    let join = b.hashed_join(
        a,
        b_src,
        JoinType::Inner,
        JoinImplementation::HashTable,
        "ht_c",
        c,
        hash_columns,
        match_columns,
    );
    let filter = gt(b.col(b_src, "val").unwrap(), int(1));
    let select = b.select(join, vec![filter]);
    let fields = vec![b.col(a, "val").unwrap(), b.col(b_src, "val").unwrap()];
    let project = b.project(select, fields);
    let plan = b.statement(project, &["a_val", "b_val"]);

    let context = fold(plan);
    let root = context.plan.root().unwrap();
    let result = context.plan.query(root).unwrap().input;
    let NodeKind::ResultSet { input: wrapper, .. } = context.plan.kind(result).unwrap() else {
        panic!("expected the result set below the query");
    };
    let NodeKind::UsingHashTable { loader, input, .. } = context.plan.kind(*wrapper).unwrap() else {
        panic!("hash table no longer heads the loop");
    };
    assert_eq!(*loader, c);

    let NodeKind::MapJoin(map) = context.plan.kind(*input).unwrap() else {
        panic!("hash table does not wrap the map directly");
    };
    assert_eq!(map.outer, a);
    assert_eq!(map.inner, project);
    assert_eq!(
        chain(&context, map.inner),
        vec!["Project", "Select", "TableSource"]
    );
    assert_eq!(context.plan.output(select).unwrap(), Some(project));
}
