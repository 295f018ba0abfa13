//! Tutela CLI Entry Point
//!
//! This is the main binary entry point for the Tutela CLI. Each subcommand
//! maps onto the same control surface the MCP server exposes:
//! - `draft` / `test` / `deploy` / `rollback` / `versions` / `discard` -
//!   stored-procedure lifecycle
//! - `exec` - validated ad-hoc mutation (wrapped in its own transaction)
//! - `cat` - read a virtual path
//! - `mcp` - MCP server mode (hidden, for AI agent integration)
//!
//! All output to stdout is JSON-only. Audit events and diagnostics go to
//! stderr. Explicit cross-invocation transactions only exist on the MCP
//! surface, where the process (and its sessions) stay alive.

#[cfg(not(feature = "sqlite"))]
compile_error!("the tutela binary requires the 'sqlite' feature");

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};

use tutela::config::{resolve_config, EngineConfig};
use tutela::control::Tutela;
use tutela::error::{Result, TutelaError};
use tutela::output::{ErrorEnvelope, Metadata, SuccessEnvelope};

/// Tutela - Agent-First Safe-Mutation Engine
#[derive(Parser)]
#[command(name = "tutela")]
#[command(about = "Agent-first safe-mutation engine with stored-procedure version control")]
#[command(version)]
struct Cli {
    /// SQLite database file (overrides the configured one)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Actor recorded on audit events
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a stored-procedure draft in the isolated draft schema
    Draft {
        /// Target schema
        schema: String,
        /// Procedure name
        name: String,
        /// Definition text, inline
        #[arg(long, conflicts_with = "file")]
        definition: Option<String>,
        /// Read the definition from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run the draft's body in an always-rolled-back transaction
    Test {
        /// Target schema
        schema: String,
        /// Procedure name
        name: String,
        /// Parameters as JSON (object binds by name, array positionally)
        #[arg(long)]
        params: Option<String>,
    },

    /// Deploy the tested draft as the new active version
    Deploy {
        /// Target schema
        schema: String,
        /// Procedure name
        name: String,
    },

    /// Restore an archived version as the live definition
    Rollback {
        /// Target schema
        schema: String,
        /// Procedure name
        name: String,
        /// Explicit version to restore (defaults to the preceding one)
        #[arg(long)]
        version: Option<i64>,
    },

    /// List the full version history
    Versions {
        /// Target schema
        schema: String,
        /// Procedure name
        name: String,
    },

    /// Discard the draft without deploying it
    Discard {
        /// Target schema
        schema: String,
        /// Procedure name
        name: String,
    },

    /// Execute one validated mutating statement in its own transaction
    Exec {
        /// SQL statement
        sql: String,
        /// Parameters as JSON (object binds by name, array positionally)
        #[arg(long)]
        params: Option<String>,
    },

    /// Read a virtual path (prints the active definition text)
    Cat {
        /// Virtual path, e.g. /database/stored_procedures/dbo/GetCustomerOrders.sql
        path: String,
    },

    /// Start MCP server (hidden from help, for AI agent integration)
    #[command(hide = true)]
    Mcp {},
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.database.clone()) {
        Ok(config) => config,
        Err(e) => return print_error("config", &e),
    };

    let engine = match Tutela::open(&config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => return print_error("open", &e),
    };

    if let Commands::Mcp {} = cli.command {
        return match tutela::mcp::serve(engine).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("mcp server error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    run_command(&engine, &cli)
}

fn load_config(database: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = resolve_config()?;
    if let Some(database) = database {
        config.database = Some(database);
    }
    if config.database.is_none() {
        return Err(TutelaError::config_error(
            "no database configured; pass --database or set one in .tutela/config.json",
        ));
    }
    Ok(config)
}

fn run_command(engine: &Tutela, cli: &Cli) -> ExitCode {
    let started = Instant::now();

    let (command, result): (&str, Result<serde_json::Value>) = match &cli.command {
        Commands::Draft { schema, name, definition, file } => (
            "create_sp_draft",
            read_definition(definition.as_deref(), file.as_deref()).and_then(|text| {
                let draft = engine.create_sp_draft(schema, name, &text, &cli.actor)?;
                to_value(draft)
            }),
        ),
        Commands::Test { schema, name, params } => (
            "test_sp_draft",
            parse_params(params.as_deref()).and_then(|params| {
                let outcome = engine.test_sp_draft(schema, name, params.as_ref(), &cli.actor)?;
                to_value(outcome)
            }),
        ),
        Commands::Deploy { schema, name } => (
            "deploy_sp",
            engine.deploy_sp(schema, name, &cli.actor).and_then(to_value),
        ),
        Commands::Rollback { schema, name, version } => (
            "rollback_sp",
            engine.rollback_sp(schema, name, *version, &cli.actor).and_then(to_value),
        ),
        Commands::Versions { schema, name } => (
            "list_sp_versions",
            engine
                .list_sp_versions(schema, name)
                .map(|versions| serde_json::json!({ "versions": versions })),
        ),
        Commands::Discard { schema, name } => (
            "discard_sp_draft",
            engine
                .discard_sp_draft(schema, name, &cli.actor)
                .map(|()| serde_json::json!({ "discarded": true })),
        ),
        Commands::Exec { sql, params } => (
            "execute_query_write",
            parse_params(params.as_deref()).and_then(|params| {
                exec_in_own_transaction(engine, sql, params.as_ref(), &cli.actor)
            }),
        ),
        Commands::Cat { path } => (
            "read_object",
            engine
                .read_object(path)
                .map(|definition| serde_json::json!({ "path": path, "definition": definition })),
        ),
        Commands::Mcp {} => unreachable!("handled before dispatch"),
    };

    let execution_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(data) => {
            let meta = Metadata {
                execution_ms,
                rows_affected: data
                    .get("rows_affected")
                    .and_then(serde_json::Value::as_u64),
                audit_degraded: engine.audit_degraded(),
            };
            print_success(command, data, meta)
        }
        Err(e) => print_error(command, &e),
    }
}

/// CLI `exec` wraps the statement in an explicit transaction of its own, so
/// the transaction policy holds even though the process is one-shot
fn exec_in_own_transaction(
    engine: &Tutela,
    sql: &str,
    params: Option<&serde_json::Value>,
    session: &str,
) -> Result<serde_json::Value> {
    let record = engine.begin_transaction(session, None)?;
    let txn_id = record.id.to_string();

    match engine.execute_query_write(sql, params, session) {
        Ok(outcome) => {
            engine.commit_transaction(&txn_id)?;
            to_value(outcome)
        }
        Err(e) => {
            let _ = engine.rollback_transaction(&txn_id);
            Err(e)
        }
    }
}

fn read_definition(definition: Option<&str>, file: Option<&std::path::Path>) -> Result<String> {
    match (definition, file) {
        (Some(text), None) => Ok(text.to_string()),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            TutelaError::invalid_input(format!("could not read definition file: {e}"))
        }),
        _ => Err(TutelaError::invalid_input("pass exactly one of --definition or --file")),
    }
}

fn parse_params(params: Option<&str>) -> Result<Option<serde_json::Value>> {
    match params {
        None => Ok(None),
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| TutelaError::invalid_input(format!("params is not valid JSON: {e}"))),
    }
}

fn to_value(data: impl serde::Serialize) -> Result<serde_json::Value> {
    serde_json::to_value(data)
        .map_err(|e| TutelaError::store_error(format!("could not serialize payload: {e}")))
}

fn print_success(command: &str, data: serde_json::Value, meta: Metadata) -> ExitCode {
    let envelope = SuccessEnvelope::new(command, data, meta);
    match serde_json::to_string(&envelope) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("could not serialize envelope: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_error(command: &str, err: &TutelaError) -> ExitCode {
    let envelope = ErrorEnvelope::from_error(command, err);
    match serde_json::to_string(&envelope) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("could not serialize envelope: {e}"),
    }
    ExitCode::FAILURE
}
