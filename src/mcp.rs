//! MCP (Model Context Protocol) Server
//!
//! This module implements an MCP server using manual JSON-RPC 2.0 over stdio.
//! We follow the proven pattern from reflex-search rather than using the
//! unstable rmcp crate.
//!
//! # Architecture
//!
//! - **Transport**: JSON-RPC 2.0 over stdio (line-based)
//! - **Dependencies**: Only `serde_json`, `schemars` and `anyhow` (no
//!   MCP-specific crates)
//! - **Protocol**: Implements the MCP specification manually
//!
//! # Design Principles
//!
//! 1. **Stateful where it matters**: transactions are per-session state owned
//!    by the engine; everything else is independent per call
//! 2. **Simple**: Direct JSON-RPC implementation, no macro magic
//! 3. **Reusable**: All tools call the same [`Tutela`] control surface the
//!    CLI uses
//!
//! # MCP Tools
//!
//! - `create_sp_draft` / `test_sp_draft` / `deploy_sp` / `rollback_sp` /
//!   `list_sp_versions` / `discard_sp_draft` - stored-procedure lifecycle
//! - `execute_query_write` - validated, transaction-capped ad-hoc mutation
//! - `begin_transaction` / `commit_transaction` / `rollback_transaction` -
//!   explicit transaction control per session
//! - `read_object` - virtual-path read surface
//!
//! # Usage
//!
//! Start the MCP server with: `tutela mcp`

use anyhow::{anyhow, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Instant;

use crate::control::{Tutela, DEFAULT_SESSION};
use crate::engine::IsolationLevel;
use crate::error::TutelaError;
use crate::output::{ErrorEnvelope, Metadata, SuccessEnvelope};

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

impl TextContent {
    fn new(text: String) -> Self {
        Self { content_type: "text".to_string(), text }
    }
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    /// Create a successful tool result with JSON data
    fn success(data: impl Serialize) -> Result<Value> {
        let json_text = serde_json::to_string_pretty(&data)?;
        let result = Self { content: vec![TextContent::new(json_text)], is_error: false };
        Ok(serde_json::to_value(result)?)
    }

    /// Create a failed tool result carrying a structured error envelope
    fn failure(command: &str, err: &TutelaError) -> Result<Value> {
        let envelope = ErrorEnvelope::from_error(command, err);
        let json_text = serde_json::to_string_pretty(&envelope)?;
        let result = Self { content: vec![TextContent::new(json_text)], is_error: true };
        Ok(serde_json::to_value(result)?)
    }
}

// ============================================================================
// Tool Parameter Schemas
// ============================================================================

/// Parameters for `create_sp_draft`
#[derive(Debug, Deserialize, JsonSchema)]
struct CreateDraftParams {
    /// Target schema of the procedure
    schema: String,
    /// Procedure name
    name: String,
    /// Full CREATE [OR ALTER] PROCEDURE definition text
    definition: String,
    /// Actor recorded on audit events (defaults to the session name)
    actor: Option<String>,
}

/// Parameters for `test_sp_draft`
#[derive(Debug, Deserialize, JsonSchema)]
struct TestDraftParams {
    /// Target schema of the procedure
    schema: String,
    /// Procedure name
    name: String,
    /// Procedure parameters: object binds by name, array binds positionally
    params: Option<Value>,
    /// Actor recorded on audit events
    actor: Option<String>,
}

/// Parameters for `deploy_sp` and `discard_sp_draft`
#[derive(Debug, Deserialize, JsonSchema)]
struct SpTargetParams {
    /// Target schema of the procedure
    schema: String,
    /// Procedure name
    name: String,
    /// Actor recorded on audit events
    actor: Option<String>,
}

/// Parameters for `rollback_sp`
#[derive(Debug, Deserialize, JsonSchema)]
struct RollbackSpParams {
    /// Target schema of the procedure
    schema: String,
    /// Procedure name
    name: String,
    /// Explicit version to restore; omitted restores the immediately
    /// preceding version
    version: Option<i64>,
    /// Actor recorded on audit events
    actor: Option<String>,
}

/// Parameters for `list_sp_versions`
#[derive(Debug, Deserialize, JsonSchema)]
struct ListVersionsParams {
    /// Target schema of the procedure
    schema: String,
    /// Procedure name
    name: String,
}

/// Parameters for `execute_query_write`
#[derive(Debug, Deserialize, JsonSchema)]
struct ExecuteWriteParams {
    /// SQL statement to validate and execute
    sql: String,
    /// Statement parameters: object binds by name, array binds positionally
    params: Option<Value>,
    /// Session the statement executes under (shares that session's
    /// transaction)
    session: Option<String>,
}

/// Parameters for `begin_transaction`
#[derive(Debug, Deserialize, JsonSchema)]
struct BeginTransactionParams {
    /// Session that will own the transaction
    session: Option<String>,
    /// Isolation level: deferred, immediate (default), or exclusive
    isolation: Option<String>,
}

/// Parameters for `commit_transaction` and `rollback_transaction`
#[derive(Debug, Deserialize, JsonSchema)]
struct TransactionIdParams {
    /// Transaction id returned by begin_transaction
    transaction_id: String,
}

/// Parameters for `read_object`
#[derive(Debug, Deserialize, JsonSchema)]
struct ReadObjectParams {
    /// Virtual path, e.g. /database/stored_procedures/dbo/GetCustomerOrders.sql
    path: String,
}

fn tool_entry<T: JsonSchema>(name: &str, description: &str) -> Result<Value> {
    let schema = schemars::schema_for!(T);
    Ok(serde_json::json!({
        "name": name,
        "description": description,
        "inputSchema": serde_json::to_value(schema)?,
    }))
}

// ============================================================================
// MCP Server
// ============================================================================

/// Start the MCP server over the given engine
///
/// Reads JSON-RPC requests from stdin, one per line, and writes one JSON-RPC
/// response per line to stdout. Transactions begun through
/// `begin_transaction` live for the lifetime of the process (bounded by the
/// engine's own timeout watchdog).
pub async fn serve(engine: Arc<Tutela>) -> Result<()> {
    let stdin = io::stdin();
    let reader = stdin.lock();
    let mut stdout = io::stdout();

    for line in reader.lines() {
        let line = line?;

        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let error_response = JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: None,
                    result: None,
                    error: Some(JsonRpcError {
                        code: -32700, // Parse error
                        message: format!("Parse error: {e}"),
                        data: None,
                    }),
                };
                let response_json = serde_json::to_string(&error_response)?;
                writeln!(stdout, "{response_json}")?;
                stdout.flush()?;
                continue;
            }
        };

        let response = handle_request(&engine, request);

        let response_json = serde_json::to_string(&response)?;
        writeln!(stdout, "{response_json}")?;
        stdout.flush()?;
    }

    Ok(())
}

/// Handle a JSON-RPC request
fn handle_request(engine: &Tutela, request: JsonRpcRequest) -> JsonRpcResponse {
    let result = match request.method.as_str() {
        "initialize" => handle_initialize(),
        "tools/list" => handle_list_tools(),
        "tools/call" => handle_call_tool(engine, request.params),
        _ => Err(anyhow!("Unknown method: {}", request.method)),
    };

    match result {
        Ok(value) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(e) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: None,
            error: Some(JsonRpcError {
                code: -32603, // Internal error
                message: e.to_string(),
                data: None,
            }),
        },
    }
}

/// Handle MCP initialize request
fn handle_initialize() -> Result<Value> {
    Ok(serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "tutela",
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Handle tools/list request
fn handle_list_tools() -> Result<Value> {
    let tools = vec![
        tool_entry::<CreateDraftParams>(
            "create_sp_draft",
            "Create a stored-procedure draft in the isolated draft schema. The definition is \
             validated (denylist, injection heuristics, procedure-DDL shape) before it is \
             stored. One draft per procedure at a time: fails with DRAFT_ALREADY_EXISTS while \
             an undiscarded draft is present. WORKFLOW: create_sp_draft -> test_sp_draft -> \
             deploy_sp; rollback_sp restores an earlier version at any point.",
        )?,
        tool_entry::<TestDraftParams>(
            "test_sp_draft",
            "Execute the draft's body with the supplied parameters inside a transaction that \
             is ALWAYS rolled back - a test never leaves residual state. Returns the result \
             set/rows-affected and marks the draft tested on success. Deploy requires a \
             tested draft.",
        )?,
        tool_entry::<SpTargetParams>(
            "deploy_sp",
            "Deploy the tested draft as the new active version. Atomically: archives the \
             currently active version (the automatic backup - no skippable backup step), \
             appends a new version row, rewrites the live definition, and consumes the draft. \
             Fails with DRAFT_NOT_TESTED if the draft is missing or untested, and with \
             CONCURRENT_DEPLOY_CONFLICT if a racing deploy wins the store's write lock (the \
             draft survives for retry).",
        )?,
        tool_entry::<RollbackSpParams>(
            "rollback_sp",
            "Restore an archived version as the live definition. Omit 'version' to restore \
             the immediately preceding version. History is never deleted - only the active \
             marker moves, and list_sp_versions keeps showing every version.",
        )?,
        tool_entry::<ListVersionsParams>(
            "list_sp_versions",
            "List the full version history for a procedure, ordered by version number \
             ascending, with exactly one row marked active. Read-only.",
        )?,
        tool_entry::<SpTargetParams>(
            "discard_sp_draft",
            "Explicitly destroy the draft without deploying it. The version history is \
             untouched.",
        )?,
        tool_entry::<ExecuteWriteParams>(
            "execute_query_write",
            "Execute a single ad-hoc mutating statement through the safety gate: SQL \
             validation (denylist, multi-statement, injection heuristics), mandatory \
             parameterization, transaction policy, and the rows-affected cap. By default \
             mutations REQUIRE an explicit transaction (begin_transaction first); the \
             statement fails with VALIDATION_FAILED otherwise. Exceeding the row cap rolls \
             the whole transaction back and fails with TXN_ROW_CAP_EXCEEDED.",
        )?,
        tool_entry::<BeginTransactionParams>(
            "begin_transaction",
            "Begin an explicit transaction for a session. Exactly one active transaction per \
             session: a second begin fails with TXN_ALREADY_ACTIVE. An idle transaction is \
             rolled back automatically when it exceeds the configured timeout; a later \
             commit then fails with TXN_INVALID_STATE.",
        )?,
        tool_entry::<TransactionIdParams>(
            "commit_transaction",
            "Commit a transaction by id. Fails with TXN_INVALID_STATE if the transaction is \
             no longer active (already committed, rolled back, or timed out).",
        )?,
        tool_entry::<TransactionIdParams>(
            "rollback_transaction",
            "Roll a transaction back by id. Idempotent: once terminal, the existing terminal \
             state is returned rather than an error.",
        )?,
        tool_entry::<ReadObjectParams>(
            "read_object",
            "Read a virtual path. /database/stored_procedures/{schema}/{name}.sql returns \
             the currently active version's definition text.",
        )?,
    ];

    Ok(serde_json::json!({ "tools": tools }))
}

/// Handle tools/call request
fn handle_call_tool(engine: &Tutela, params: Option<Value>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow!("Missing params"))?;

    let tool_name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Missing tool name"))?
        .to_string();

    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    let started = Instant::now();
    let result = dispatch_tool(engine, &tool_name, arguments);
    let execution_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok((data, rows_affected)) => {
            let meta = Metadata {
                execution_ms,
                rows_affected,
                audit_degraded: engine.audit_degraded(),
            };
            CallToolResult::success(SuccessEnvelope::new(tool_name.clone(), data, meta))
        }
        Err(e) => CallToolResult::failure(&tool_name, &e),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: Value,
) -> std::result::Result<T, TutelaError> {
    serde_json::from_value(arguments)
        .map_err(|e| TutelaError::invalid_input(format!("invalid tool arguments: {e}")))
}

fn parse_isolation(
    isolation: Option<&str>,
) -> std::result::Result<Option<IsolationLevel>, TutelaError> {
    match isolation {
        None => Ok(None),
        Some("deferred") => Ok(Some(IsolationLevel::Deferred)),
        Some("immediate") => Ok(Some(IsolationLevel::Immediate)),
        Some("exclusive") => Ok(Some(IsolationLevel::Exclusive)),
        Some(other) => Err(TutelaError::invalid_input(format!(
            "unknown isolation level '{other}' (expected deferred, immediate, or exclusive)"
        ))),
    }
}

/// Route one tool call into the control surface
///
/// Returns the payload plus the rows-affected count for the metadata block.
fn dispatch_tool(
    engine: &Tutela,
    tool_name: &str,
    arguments: Value,
) -> std::result::Result<(Value, Option<u64>), TutelaError> {
    match tool_name {
        "create_sp_draft" => {
            let args: CreateDraftParams = parse_args(arguments)?;
            let actor = args.actor.as_deref().unwrap_or(DEFAULT_SESSION);
            let draft = engine.create_sp_draft(&args.schema, &args.name, &args.definition, actor)?;
            Ok((serde_json::to_value(draft).map_err(to_internal)?, None))
        }
        "test_sp_draft" => {
            let args: TestDraftParams = parse_args(arguments)?;
            let actor = args.actor.as_deref().unwrap_or(DEFAULT_SESSION);
            let outcome =
                engine.test_sp_draft(&args.schema, &args.name, args.params.as_ref(), actor)?;
            let rows = outcome.rows_affected;
            Ok((serde_json::to_value(outcome).map_err(to_internal)?, rows))
        }
        "deploy_sp" => {
            let args: SpTargetParams = parse_args(arguments)?;
            let actor = args.actor.as_deref().unwrap_or(DEFAULT_SESSION);
            let outcome = engine.deploy_sp(&args.schema, &args.name, actor)?;
            Ok((serde_json::to_value(outcome).map_err(to_internal)?, None))
        }
        "rollback_sp" => {
            let args: RollbackSpParams = parse_args(arguments)?;
            let actor = args.actor.as_deref().unwrap_or(DEFAULT_SESSION);
            let outcome = engine.rollback_sp(&args.schema, &args.name, args.version, actor)?;
            Ok((serde_json::to_value(outcome).map_err(to_internal)?, None))
        }
        "list_sp_versions" => {
            let args: ListVersionsParams = parse_args(arguments)?;
            let versions = engine.list_sp_versions(&args.schema, &args.name)?;
            Ok((serde_json::json!({ "versions": versions }), None))
        }
        "discard_sp_draft" => {
            let args: SpTargetParams = parse_args(arguments)?;
            let actor = args.actor.as_deref().unwrap_or(DEFAULT_SESSION);
            engine.discard_sp_draft(&args.schema, &args.name, actor)?;
            Ok((serde_json::json!({ "discarded": true }), None))
        }
        "execute_query_write" => {
            let args: ExecuteWriteParams = parse_args(arguments)?;
            let session = args.session.as_deref().unwrap_or(DEFAULT_SESSION);
            let outcome = engine.execute_query_write(&args.sql, args.params.as_ref(), session)?;
            let rows = outcome.rows_affected;
            Ok((serde_json::to_value(outcome).map_err(to_internal)?, rows))
        }
        "begin_transaction" => {
            let args: BeginTransactionParams = parse_args(arguments)?;
            let session = args.session.as_deref().unwrap_or(DEFAULT_SESSION);
            let isolation = parse_isolation(args.isolation.as_deref())?;
            let record = engine.begin_transaction(session, isolation)?;
            Ok((serde_json::to_value(record).map_err(to_internal)?, None))
        }
        "commit_transaction" => {
            let args: TransactionIdParams = parse_args(arguments)?;
            let record = engine.commit_transaction(&args.transaction_id)?;
            Ok((serde_json::to_value(record).map_err(to_internal)?, None))
        }
        "rollback_transaction" => {
            let args: TransactionIdParams = parse_args(arguments)?;
            let record = engine.rollback_transaction(&args.transaction_id)?;
            Ok((serde_json::to_value(record).map_err(to_internal)?, None))
        }
        "read_object" => {
            let args: ReadObjectParams = parse_args(arguments)?;
            let definition = engine.read_object(&args.path)?;
            Ok((serde_json::json!({ "path": args.path, "definition": definition }), None))
        }
        other => Err(TutelaError::invalid_input(format!("unknown tool: {other}"))),
    }
}

fn to_internal(e: serde_json::Error) -> TutelaError {
    TutelaError::store_error(format!("could not serialize payload: {e}"))
}
