//! Plan rewrite debugging binary
//!
//! Builds one of the sample plans below, runs the rule pipeline over it and
//! prints the per-rule trace.
//!
//! ## Usage
//!
//! ```bash
//! # Trace the outer-join sample
//! cargo run --bin planrules-debug -- --sample outer-join
//!
//! # JSON trace, debug logging from the passes
//! PLANRULES_LOG=planrules=debug cargo run --bin planrules-debug -- --sample group-by --json
//! ```
//!
//! Samples: `outer-join`, `group-by`, `distinct`, `exists`, `order-by`.

use anyhow::{bail, Context, Result};
use planrules::config::LoggingConfig;
use planrules::plan::builders::{agg, asc, eq, gt, int, PlanBuilder};
use planrules::plan::DataType;
use planrules::schema::{Schema, TableDef};
use planrules::{Config, PlanContext, PlanError, PlanGraph, RulesDriver};

use std::env;
use std::sync::Arc;

const SAMPLES: &[&str] = &["outer-join", "group-by", "distinct", "exists", "order-by"];

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let sample = get_arg(&args, "--sample").unwrap_or_else(|| "outer-join".to_string());
    let json = args.iter().any(|a| a == "--json");

    let mut config = Config::load()
        .map_err(PlanError::from)
        .context("loading planrules.toml")?;
    init_tracing(&config.logging);
    config.optimizer.trace_rules = true;
    config.optimizer.verify_plan = true;

    let schema = sample_schema().context("building sample schema")?;
    let plan = sample_plan(&schema, &sample)?;

    println!("Sample: {sample}");
    println!("=======");
    println!();

    let mut context = PlanContext::new(plan, Arc::new(schema), config);
    let driver = RulesDriver::default();
    let trace = driver
        .apply(&mut context)
        .with_context(|| format!("rewriting sample '{sample}'"))?;

    if json {
        println!("{}", trace.to_json()?);
    } else {
        println!("{}", trace.format_trace());
        println!("Final plan:");
        println!("{}", context.plan.explain());
    }
    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // PLANRULES_LOG takes precedence over the configured level
    let level = env::var("PLANRULES_LOG").unwrap_or_else(|_| logging_config.level.clone());
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_writer(std::io::stderr)
    };
    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if logging_config.format == "json"
    {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn sample_schema() -> planrules::PlanResult<Schema> {
    let dept = TableDef::new(
        "dept",
        &[("id", DataType::Int, false), ("name", DataType::Varchar, true)],
    )
    .with_primary_key(&["id"])?;
    let emp = TableDef::new(
        "emp",
        &[
            ("id", DataType::Int, false),
            ("dept", DataType::Int, true),
            ("salary", DataType::Int, true),
            ("name", DataType::Varchar, true),
        ],
    )
    .with_primary_key(&["id"])?;

    let mut schema = Schema::new();
    schema.add_table(dept);
    schema.add_table(emp);
    Ok(schema)
}

fn sample_plan(schema: &Schema, sample: &str) -> Result<PlanGraph> {
    let mut b = PlanBuilder::new(schema);
    let plan = match sample {
        // SELECT emp.name, dept.name FROM emp LEFT JOIN dept ON emp.dept = dept.id
        // WHERE dept.id > 10
        "outer-join" => {
            let emp = b.table("emp")?;
            let dept = b.table("dept")?;
            let on = eq(b.col(emp, "dept")?, b.col(dept, "id")?);
            let join = b.left_join(emp, dept, vec![on]);
            let filter = gt(b.col(dept, "id")?, int(10));
            let select = b.select(join, vec![filter]);
            let fields = vec![b.col(emp, "name")?, b.col(dept, "name")?];
            let project = b.project(select, fields);
            b.statement(project, &["name", "dept_name"])
        }
        // SELECT dept, AVG(salary) FROM emp GROUP BY dept
        "group-by" => {
            let emp = b.table("emp")?;
            let dept = b.col(emp, "dept")?;
            let source = b.aggregate(emp, vec![dept.clone()]);
            let average = agg("AVG", b.col(emp, "salary")?);
            let project = b.project(source, vec![dept, average]);
            b.statement(project, &["dept", "avg_salary"])
        }
        // SELECT DISTINCT dept, name FROM emp ORDER BY dept
        "distinct" => {
            let emp = b.table("emp")?;
            let keys = vec![b.col(emp, "dept")?, b.col(emp, "name")?];
            let source = b.aggregate(emp, keys.clone());
            let sort = b.sort(source, vec![asc(keys[0].clone())]);
            let project = b.project(sort, keys);
            b.statement(project, &["dept", "name"])
        }
        // SELECT dept.name FROM dept WHERE EXISTS (SELECT 1 FROM emp WHERE emp.dept = dept.id)
        "exists" => {
            let dept = b.table("dept")?;
            let emp = b.table("emp")?;
            let on = eq(b.col(emp, "dept")?, b.col(dept, "id")?);
            let join = b.join(dept, emp, planrules::plan::JoinType::Semi, vec![on]);
            let name = b.col(dept, "name")?;
            let project = b.project(join, vec![name]);
            b.statement(project, &["name"])
        }
        // SELECT emp.name FROM emp JOIN dept ON emp.dept = dept.id ORDER BY dept.name
        "order-by" => {
            let emp = b.table("emp")?;
            let dept = b.table("dept")?;
            let on = eq(b.col(emp, "dept")?, b.col(dept, "id")?);
            let join = b.inner_join(emp, dept, vec![on]);
            let key = asc(b.col(dept, "name")?);
            let sort = b.sort(join, vec![key]);
            let name = b.col(emp, "name")?;
            let project = b.project(sort, vec![name]);
            b.statement(project, &["name"])
        }
        other => bail!("unknown sample '{other}' (expected one of {})", SAMPLES.join(", ")),
    };
    Ok(plan)
}

fn get_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}
