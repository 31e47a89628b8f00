//! relgraph command-line tools.
//!
//! Provides the `relgraph` binary:
//! - `check` validates a schema and summarises its types;
//! - `order` prints the DDL table layers (or the drop order);
//! - `plan` seeds an in-memory store from a fixture and prints the persist
//!   plan for the fixture's save and delete lists.
//!
//! Exit codes: 0 = success, 1 = schema or analysis error, 3 = I/O or parse
//! error.

mod fixture;

use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use relgraph_core::{ddl_order, CoreError, DefinitionSet, EntityContext};
use relgraph_persist::{AnalyserConfig, MemoryDatabase, PersistAnalyser};
use serde_json::json;
use tracing::Level;

use crate::fixture::{Fixture, FixtureError};

/// Relational entity graph tools.
#[derive(Parser)]
#[command(name = "relgraph", about = "Relational entity graph tools")]
struct Cli {
    /// Log analysis decisions at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a schema and print its types.
    Check {
        /// Path to the schema JSON file.
        #[arg(short, long)]
        schema: PathBuf,
    },
    /// Print tables in DDL creation order.
    Order {
        #[arg(short, long)]
        schema: PathBuf,

        /// Print the drop order instead.
        #[arg(long)]
        drop: bool,
    },
    /// Print the persist plan for a fixture.
    Plan {
        #[arg(short, long)]
        schema: PathBuf,

        /// Path to the fixture JSON file.
        #[arg(short, long)]
        fixture: PathBuf,

        /// Keep dependency order without table-rank tie breaking.
        #[arg(long)]
        no_deadlock_avoidance: bool,

        /// Also apply the plan to the in-memory store.
        #[arg(long)]
        apply: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Check { schema } => run_check(&schema),
        Commands::Order { schema, drop } => run_order(&schema, drop),
        Commands::Plan {
            schema,
            fixture,
            no_deadlock_avoidance,
            apply,
        } => run_plan(&schema, &fixture, !no_deadlock_avoidance, apply),
    };
    process::exit(exit_code);
}

fn print_json(value: &serde_json::Value) {
    let text = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize output: {}\"}}", e));
    println!("{}", text);
}

fn read_file(path: &Path) -> Result<String, i32> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: failed to read '{}': {}", path.display(), e);
        3
    })
}

fn load_schema(path: &Path) -> Result<DefinitionSet, i32> {
    let text = read_file(path)?;
    DefinitionSet::from_json(&text).map_err(|e| match e {
        CoreError::Serialization(e) => {
            eprintln!("Error: failed to parse schema '{}': {}", path.display(), e);
            3
        }
        e => {
            eprintln!("Schema error: {}", e);
            1
        }
    })
}

/// Execute the check subcommand.
fn run_check(schema: &Path) -> i32 {
    let defs = match load_schema(schema) {
        Ok(defs) => defs,
        Err(code) => return code,
    };
    let types: Vec<_> = defs
        .types()
        .map(|t| {
            let downcast: Vec<String> = if t.is_abstract() {
                defs.subtypes_of(t.name())
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect()
            } else {
                Vec::new()
            };
            json!({
                "name": t.name(),
                "table": t.table(),
                "key": t.key_node(),
                "abstract": t.is_abstract(),
                "extends": t.extends(),
                "downcast": downcast,
            })
        })
        .collect();
    tracing::info!(types = defs.len(), "schema ok");
    print_json(&json!({ "namespace": defs.namespace(), "types": types }));
    0
}

/// Execute the order subcommand.
fn run_order(schema: &Path, drop: bool) -> i32 {
    let defs = match load_schema(schema) {
        Ok(defs) => defs,
        Err(code) => return code,
    };
    let order = match ddl_order(&defs) {
        Ok(order) if drop => order.reversed(),
        Ok(order) => order,
        Err(e) => {
            eprintln!("Ordering error: {}", e);
            return 1;
        }
    };
    let layers: Vec<Vec<&str>> = order
        .layers()
        .iter()
        .map(|layer| layer.iter().map(|t| t.table()).collect())
        .collect();
    print_json(&json!({
        "direction": if drop { "drop" } else { "create" },
        "layers": layers,
    }));
    0
}

fn fixture_exit_code(err: &FixtureError) -> i32 {
    match err {
        FixtureError::Parse(_) => 3,
        _ => 1,
    }
}

/// Execute the plan subcommand.
fn run_plan(schema: &Path, fixture_path: &Path, deadlock_avoidance: bool, apply: bool) -> i32 {
    let defs = match load_schema(schema) {
        Ok(defs) => Arc::new(defs),
        Err(code) => return code,
    };
    let text = match read_file(fixture_path) {
        Ok(text) => text,
        Err(code) => return code,
    };
    let fixture = match Fixture::from_json(&text) {
        Ok(fixture) => fixture,
        Err(e) => {
            eprintln!("Error: {}", e);
            return fixture_exit_code(&e);
        }
    };

    let db = Rc::new(MemoryDatabase::new(Arc::clone(&defs)));
    let ctx = EntityContext::new(defs);
    ctx.set_fetcher(db.clone());

    let request = match fixture.seed(&db).and_then(|_| fixture.request(&ctx)) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Fixture error: {}", e);
            return fixture_exit_code(&e);
        }
    };

    let config = AnalyserConfig { deadlock_avoidance };
    let plan = match PersistAnalyser::with_config(&ctx, config).analyse(&request) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Analysis error: {}", e);
            return 1;
        }
    };
    tracing::info!(%plan, "plan ready");

    let mut output = json!({
        "create": plan.create().labels(),
        "update": plan.update().labels(),
        "delete": plan.delete().labels(),
        "depends_on": plan.depends_on().labels(),
        "loaded_during_analysis": plan
            .loaded_during_analysis()
            .iter()
            .map(|e| e.borrow().label())
            .collect::<Vec<_>>(),
    });

    if apply {
        match db.apply(&ctx, &plan) {
            Ok(report) => {
                tracing::info!(?report, "plan applied");
                output["applied"] = json!(report);
            }
            Err(e) => {
                eprintln!("Apply error: {}", e);
                return 1;
            }
        }
    }

    print_json(&output);
    0
}
