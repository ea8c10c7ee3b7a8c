//! schema-reconciler CLI
//!
//! Run before the application starts:
//! - `run`: inspect, apply missing tables/columns/indexes/constraints, validate
//! - `plan`: show the units a run would apply
//! - `inspect`: print the live schema
//! - `validate`: check the live schema without changing it
//! - `history`: show recent ledger entries
//!
//! Exit status: 0 when the schema is safe to use, 1 when a unit or validation
//! failed, 2 when the run could not be carried out.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use schema_reconciler::db::{checkout, create_pool};
use schema_reconciler::{ExpectedSchema, PostgresTarget, ReconcileError, SchemaReconciler, Settings};

#[derive(Parser, Debug)]
#[command(name = "schema-reconciler", version, about = "Additive PostgreSQL schema reconciliation")]
struct Cli {
    /// Expected schema definition (overrides EXPECTED_SCHEMA_PATH)
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Reconcile the live schema and validate the result (default)
    Run,
    /// Show the units a run would apply, without applying them
    Plan,
    /// Print the live schema
    Inspect,
    /// Validate the live schema without changing it
    Validate,
    /// Show recent ledger entries
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    // .env may carry RUST_LOG / LOG_FORMAT
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<ReconcileError>() {
            Some(err) => {
                error!(code = err.code(), "❌ {}", err);
                if cli.json {
                    print_json(&err.summary());
                }
                err.exit_code()
            }
            None => {
                error!("❌ {:#}", e);
                2
            }
        },
    };

    std::process::exit(code);
}

async fn execute(cli: &Cli) -> anyhow::Result<i32> {
    let settings = Settings::load().map_err(|e| ReconcileError::Config(e.to_string()))?;
    info!("📋 Configuration loaded ({})", settings.database.to_display_string());

    let command = cli.command.unwrap_or(Command::Run);
    let schema_path = cli.schema.clone().unwrap_or_else(|| settings.expected_schema_path.clone());

    let expected = match command {
        Command::Run | Command::Plan | Command::Validate => {
            let expected = ExpectedSchema::load(&schema_path).map_err(ReconcileError::from)?;
            info!(
                path = %schema_path.display(),
                tables = expected.tables.len(),
                "Expected schema loaded"
            );
            Some(expected)
        }
        Command::Inspect | Command::History { .. } => None,
    };

    let pool = create_pool(&settings.database, &settings.timeouts)?;
    let client = checkout(&pool).await?;
    let target = PostgresTarget::new(client, &settings.database.schema, &settings.ledger.table);
    let reconciler = SchemaReconciler::new(&target, settings.lock.clone());

    match (command, expected) {
        (Command::Run, Some(expected)) => {
            let report = reconciler.run(&expected).await?;
            if cli.json {
                print_json(&report);
            } else {
                println!("{}", report);
            }
            Ok(report.exit_code())
        }
        (Command::Plan, Some(expected)) => {
            let units = reconciler.plan(&expected).await?;
            if cli.json {
                print_json(&units);
            } else if units.is_empty() {
                println!("Schema is up to date, nothing to apply");
            } else {
                println!("{} unit(s) to apply:", units.len());
                for unit in &units {
                    println!("  {} [{}]", unit, unit.identifier);
                    println!("    {}", unit.sql.replace('\n', "\n    "));
                }
            }
            Ok(0)
        }
        (Command::Validate, Some(expected)) => {
            let outcome = reconciler.check(&expected).await?;
            if cli.json {
                print_json(&outcome);
            } else {
                if outcome.valid {
                    println!("Schema is valid");
                }
                for violation in &outcome.violations {
                    println!("  - {}", violation);
                }
                for note in &outcome.drift {
                    println!("  drift: {}", note);
                }
            }
            Ok(if outcome.valid {
                0
            } else {
                ReconcileError::Validation(outcome.messages()).exit_code()
            })
        }
        (Command::Inspect, _) => {
            let live = reconciler.inspect().await?;
            if cli.json {
                print_json(&live);
            } else {
                for table in live.tables.values() {
                    println!(
                        "{} ({} columns, {} indexes, {} constraints)",
                        table.name,
                        table.columns.len(),
                        table.indexes.len(),
                        table.constraints.len()
                    );
                    for column in &table.columns {
                        println!(
                            "  {} {}{}",
                            column.name,
                            column.data_type,
                            if column.nullable { "" } else { " not null" }
                        );
                    }
                }
            }
            Ok(0)
        }
        (Command::History { limit }, _) => {
            let entries = reconciler.history(limit).await?;
            if cli.json {
                print_json(&entries);
            } else {
                for entry in &entries {
                    println!(
                        "{} {:<9} {} {}",
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.status.as_str(),
                        entry.identifier,
                        entry.error_message.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(0)
        }
        (_, None) => Err(anyhow::anyhow!("expected schema was not loaded")),
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

/// Initialize tracing with structured logging.
///
/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schema_reconciler=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .init();
    }
}
