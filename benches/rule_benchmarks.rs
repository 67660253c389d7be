//! Rule pipeline benchmarks: join chains, grouping, correlated folding.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use planrules::plan::builders::{agg, asc, eq, gt, int, PlanBuilder};
use planrules::plan::{DataType, NodeId};
use planrules::schema::{Schema, TableDef};
use planrules::{Config, PlanContext, PlanGraph, RulesDriver};
use std::sync::Arc;

fn bench_schema(tables: usize) -> Schema {
    let mut schema = Schema::new();
    for i in 0..tables {
        let table = TableDef::new(
            format!("t{i}"),
            &[
                ("id", DataType::Int, false),
                ("parent", DataType::Int, true),
                ("v", DataType::Int, true),
            ],
        )
        .with_primary_key(&["id"])
        .expect("primary key");
        schema.add_table(table);
    }
    schema
}

/// `t0 JOIN t1 ON t0.id = t1.parent JOIN t2 ... WHERE tn.v > 0 ORDER BY t0.v`
fn join_chain(schema: &Schema, tables: usize, outer: bool) -> PlanGraph {
    let mut b = PlanBuilder::new(schema);
    let first = b.table("t0").expect("table");
    let mut sources: Vec<NodeId> = vec![first];
    let mut tree = first;
    for i in 1..tables {
        let next = b.table(&format!("t{i}")).expect("table");
        let on = eq(
            b.col(sources[i - 1], "id").expect("column"),
            b.col(next, "parent").expect("column"),
        );
        tree = if outer {
            b.left_join(tree, next, vec![on])
        } else {
            b.inner_join(tree, next, vec![on])
        };
        sources.push(next);
    }
    let last = sources[tables - 1];
    let filter = gt(b.col(last, "v").expect("column"), int(0));
    let select = b.select(tree, vec![filter]);
    let key = asc(b.col(first, "v").expect("column"));
    let sort = b.sort(select, vec![key]);
    let field = b.col(last, "id").expect("column");
    let project = b.project(sort, vec![field]);
    b.statement(project, &["id"])
}

fn grouped(schema: &Schema) -> PlanGraph {
    let mut b = PlanBuilder::new(schema);
    let t = b.table("t0").expect("table");
    let key = b.col(t, "parent").expect("column");
    let source = b.aggregate(t, vec![key.clone()]);
    let value = b.col(t, "v").expect("column");
    let fields = vec![
        key,
        agg("AVG", value.clone()),
        agg("SUM", value.clone()),
        agg("VAR_POP", value),
    ];
    let project = b.project(source, fields);
    b.statement(project, &["parent", "avg", "sum", "var"])
}

fn run(plan: &PlanGraph, schema: &Arc<Schema>, config: &Config) {
    let mut context = PlanContext::new(plan.clone(), Arc::clone(schema), config.clone());
    RulesDriver::default()
        .apply(&mut context)
        .expect("pipeline");
}

fn bench_join_chain(c: &mut Criterion) {
    let mut config = Config::default();
    config.optimizer.verify_plan = false;

    let mut group = c.benchmark_group("join_chain");
    for tables in [2usize, 4, 8, 16] {
        let schema = Arc::new(bench_schema(tables));
        let inner = join_chain(&schema, tables, false);
        let outer = join_chain(&schema, tables, true);

        group.bench_with_input(BenchmarkId::new("inner", tables), &tables, |b, _| {
            b.iter(|| run(&inner, &schema, &config));
        });
        group.bench_with_input(BenchmarkId::new("left", tables), &tables, |b, _| {
            b.iter(|| run(&outer, &schema, &config));
        });
    }
    group.finish();
}

fn bench_grouping(c: &mut Criterion) {
    let schema = Arc::new(bench_schema(1));
    let plan = grouped(&schema);
    let mut config = Config::default();
    config.optimizer.verify_plan = false;

    c.bench_function("aggregate_mapping", |b| {
        b.iter(|| run(&plan, &schema, &config));
    });
}

fn bench_verified_pipeline(c: &mut Criterion) {
    let schema = Arc::new(bench_schema(8));
    let plan = join_chain(&schema, 8, true);
    let mut config = Config::default();
    config.optimizer.verify_plan = true;
    config.optimizer.trace_rules = true;

    c.bench_function("verified_traced_pipeline", |b| {
        b.iter(|| run(&plan, &schema, &config));
    });
}

criterion_group!(
    benches,
    bench_join_chain,
    bench_grouping,
    bench_verified_pipeline
);
criterion_main!(benches);
