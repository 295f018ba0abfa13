//! SQL Statement Validation
//!
//! This module classifies a SQL statement as allowed, blocked, or requiring a
//! transaction, independent of execution. It never executes SQL itself.
//!
//! # Validation Strategy
//! - Conservative approach (fail-safe defaults: unrecognized statements are rejected)
//! - Comments and string-literal *contents* are stripped before keyword
//!   scanning, so a denylisted keyword hiding in a comment is caught and a
//!   keyword appearing only inside a literal is not a false positive
//! - Word-boundary denylist matching (DROP, TRUNCATE, xp_cmdshell, ...)
//! - Literal-adjacent concatenation is rejected as an injection heuristic
//!
//! This is defense-in-depth, not a parser-grade safety proof. The real
//! injection defense is mandatory parameterization at the store boundary;
//! the validator exists to stop obviously destructive or suspicious text
//! before it ever reaches a connection.

use crate::config::SafetyConfig;

/// Statements denied regardless of context.
///
/// Matched against tokens after comment and literal stripping, so these
/// cannot be smuggled in through comments, and literal contents never
/// trigger them.
const DENYLIST: &[&str] = &[
    "DROP",
    "TRUNCATE",
    "GRANT",
    "REVOKE",
    "ATTACH",
    "DETACH",
    "SHUTDOWN",
    "VACUUM",
    "XP_CMDSHELL",
    "SP_CONFIGURE",
];

/// Validation verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Statement may execute
    Allowed,
    /// Statement must not execute
    Blocked,
    /// Statement is a mutation and the policy demands an explicit transaction
    RequiresTransaction,
}

/// Result of validating a single statement
///
/// Produced fresh per statement; never cached across statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// The verdict
    pub verdict: Verdict,
    /// The rule that fired, for Blocked/RequiresTransaction verdicts
    pub rule: Option<String>,
    /// Human-readable explanation
    pub reason: Option<String>,
}

impl ValidationResult {
    fn allowed() -> Self {
        Self { verdict: Verdict::Allowed, rule: None, reason: None }
    }

    fn blocked(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { verdict: Verdict::Blocked, rule: Some(rule.into()), reason: Some(reason.into()) }
    }

    fn requires_transaction() -> Self {
        Self {
            verdict: Verdict::RequiresTransaction,
            rule: Some("requires_transaction".to_string()),
            reason: Some(
                "mutating statements require an explicit transaction; call begin_transaction first"
                    .to_string(),
            ),
        }
    }

    /// Whether the statement may execute
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allowed)
    }
}

/// Caller-side context consulted during classification
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Whether the caller's session currently owns an Active transaction
    pub has_active_transaction: bool,
    /// Safety policy in effect
    pub config: &'a SafetyConfig,
}

/// Validate an ad-hoc statement
///
/// Classifies the statement without executing it. Mutating statements
/// (INSERT/UPDATE/DELETE/MERGE/REPLACE) yield `RequiresTransaction` when the
/// policy demands one and the session has none. DDL is never allowed on this
/// path; procedure definitions go through [`validate_procedure_definition`].
#[must_use]
pub fn validate(sql: &str, ctx: ValidationContext<'_>) -> ValidationResult {
    let stripped = strip_comments_and_literals(sql);
    let trimmed = stripped.trim();

    if trimmed.is_empty() {
        return ValidationResult::blocked("empty_statement", "statement is empty");
    }

    // Conservative: reject any interior semicolon (trailing one is fine)
    if trimmed.trim_end_matches(';').trim().contains(';') {
        return ValidationResult::blocked(
            "multi_statement",
            "multi-statement batches are not permitted",
        );
    }

    let upper = trimmed.to_uppercase();

    if let Some(result) = scan_denylist(&upper, ctx.config) {
        return result;
    }
    if let Some(result) = scan_dynamic_exec(&upper) {
        return result;
    }
    if let Some(result) = scan_literal_concatenation(&upper) {
        return result;
    }

    classify(&upper, ctx)
}

/// Validate a stored-procedure definition for the lifecycle pipeline
///
/// The definition must be `CREATE [OR ALTER] PROCEDURE` or `ALTER PROCEDURE`;
/// its body is scanned with the same denylist and injection heuristics as
/// ad-hoc statements. Bodies are batches, so the multi-statement rule does
/// not apply here.
#[must_use]
pub fn validate_procedure_definition(definition: &str, config: &SafetyConfig) -> ValidationResult {
    let stripped = strip_comments_and_literals(definition);
    let trimmed = stripped.trim();

    if trimmed.is_empty() {
        return ValidationResult::blocked("empty_statement", "procedure definition is empty");
    }

    let upper = trimmed.to_uppercase();

    if !is_procedure_ddl(&upper) {
        return ValidationResult::blocked(
            "not_procedure_ddl",
            "definition must be CREATE [OR ALTER] PROCEDURE or ALTER PROCEDURE",
        );
    }

    if let Some(result) = scan_denylist(&upper, config) {
        return result;
    }
    if let Some(result) = scan_dynamic_exec(&upper) {
        return result;
    }
    if let Some(result) = scan_literal_concatenation(&upper) {
        return result;
    }

    ValidationResult::allowed()
}

/// Extract the body of a procedure definition: the text after the first
/// top-level `AS` keyword (comments and literals are honored when locating
/// it). The draft tester executes this body directly.
#[must_use]
pub fn procedure_body(definition: &str) -> Option<&str> {
    let mut chars = definition.char_indices().peekable();
    let mut in_string = false;
    let mut prev_alnum = false;

    while let Some((idx, ch)) = chars.next() {
        if in_string {
            if ch == '\'' {
                if chars.peek().map(|&(_, c)| c) == Some('\'') {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
            continue;
        }
        match ch {
            '\'' => in_string = true,
            '-' if chars.peek().map(|&(_, c)| c) == Some('-') => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek().map(|&(_, c)| c) == Some('*') => {
                chars.next();
                let mut prev = ' ';
                for (_, c) in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            'a' | 'A' if !prev_alnum => {
                let is_s = matches!(chars.peek().map(|&(_, c)| c), Some('s' | 'S'));
                if is_s {
                    let after = definition[idx..].chars().nth(2);
                    let boundary = after.map_or(true, |c| !c.is_alphanumeric() && c != '_');
                    if boundary {
                        let body = definition[idx + 2..].trim();
                        if body.is_empty() {
                            return None;
                        }
                        return Some(body);
                    }
                }
            }
            _ => {}
        }
        prev_alnum = ch.is_alphanumeric() || ch == '_';
    }

    None
}

/// Strip comments and string-literal contents in a single pass
///
/// Handles:
/// - Line comments: `-- comment` (newline preserved)
/// - Block comments: `/* comment */` (replaced with a space)
/// - String literals: contents dropped, quotes kept, `''` escapes honored
fn strip_comments_and_literals(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if in_string {
            if ch == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next(); // escaped quote, still inside the literal
                } else {
                    in_string = false;
                    result.push('\'');
                }
            }
            continue;
        }
        match ch {
            '\'' => {
                in_string = true;
                result.push('\'');
            }
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                result.push(' ');
            }
            _ => result.push(ch),
        }
    }

    result
}

/// Split preprocessed text into keyword tokens (word-boundary matching)
fn tokens(upper: &str) -> impl Iterator<Item = &str> {
    upper.split(|c: char| !c.is_alphanumeric() && c != '_').filter(|t| !t.is_empty())
}

fn scan_denylist(upper: &str, config: &SafetyConfig) -> Option<ValidationResult> {
    for token in tokens(upper) {
        if DENYLIST.contains(&token)
            || config.denied_keywords.iter().any(|k| k.eq_ignore_ascii_case(token))
        {
            return Some(ValidationResult::blocked(
                format!("denied_keyword:{token}"),
                format!("statements containing {token} are not permitted"),
            ));
        }
    }
    None
}

/// Reject dynamic SQL execution: `EXEC(...)` / `EXECUTE(...)` runs a string,
/// which defeats both the denylist and parameterization.
fn scan_dynamic_exec(upper: &str) -> Option<ValidationResult> {
    let bytes = upper.as_bytes();
    for (start, _) in upper.match_indices("EXEC") {
        let boundary_before =
            start == 0 || !(bytes[start - 1].is_ascii_alphanumeric() || bytes[start - 1] == b'_');
        if !boundary_before {
            continue;
        }
        let mut rest = &upper[start + 4..];
        if let Some(r) = rest.strip_prefix("UTE") {
            rest = r;
        }
        if rest.trim_start().starts_with('(') {
            return Some(ValidationResult::blocked(
                "dynamic_sql",
                "dynamic string execution is not permitted",
            ));
        }
    }
    None
}

/// Injection heuristic: a string literal directly concatenated with `+` or
/// `||` is the classic shape of unparameterized SQL assembly. Best-effort,
/// documented as such.
fn scan_literal_concatenation(upper: &str) -> Option<ValidationResult> {
    // After stripping, every literal is exactly ''. Flag '' adjacent to a
    // concatenation operator in either direction.
    let flagged = {
        let compact: String = upper.chars().filter(|c| !c.is_whitespace()).collect();
        compact.contains("''+")
            || compact.contains("+''")
            || compact.contains("''||")
            || compact.contains("||''")
    };
    if flagged {
        return Some(ValidationResult::blocked(
            "string_concatenation",
            "string literals concatenated into SQL look like injection; use parameters instead",
        ));
    }
    None
}

fn is_procedure_ddl(upper: &str) -> bool {
    let normalized: Vec<&str> = tokens(upper).take(4).collect();
    matches!(
        normalized.as_slice(),
        ["CREATE", "PROCEDURE", ..]
            | ["CREATE", "OR", "ALTER", "PROCEDURE"]
            | ["ALTER", "PROCEDURE", ..]
    )
}

fn classify(upper: &str, ctx: ValidationContext<'_>) -> ValidationResult {
    let first = tokens(upper).next().unwrap_or("");

    match first {
        "SELECT" | "WITH" | "EXPLAIN" | "PRAGMA" | "VALUES" => ValidationResult::allowed(),
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" => {
            if ctx.config.require_transactions && !ctx.has_active_transaction {
                ValidationResult::requires_transaction()
            } else {
                ValidationResult::allowed()
            }
        }
        "CREATE" | "ALTER" => ValidationResult::blocked(
            "ddl_not_allowed",
            "ad-hoc DDL is not permitted; stored procedures go through the draft pipeline",
        ),
        "BEGIN" | "COMMIT" | "ROLLBACK" | "START" | "SAVEPOINT" | "RELEASE" => {
            ValidationResult::blocked(
                "transaction_control",
                "transaction control belongs to begin/commit/rollback_transaction, not raw SQL",
            )
        }
        other => ValidationResult::blocked(
            "unrecognized_statement",
            format!("statement kind '{other}' is not recognized; refusing to execute"),
        ),
    }
}
