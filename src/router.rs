//! Statement routing policy.
//!
//! A pure, stateless classifier from statement text to a destination. This is
//! a lexical approximation, not a SQL parser: keywords are matched on a
//! trimmed, ASCII-uppercased copy, so a quoted identifier or string literal
//! containing `INSERT` or `FOR UPDATE` produces a false positive toward the
//! primary. That trade-off is accepted; the conservative direction is always
//! the primary.

/// Where a statement should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Primary,
    Replica,
}

const WRITE_PREFIXES: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "BEGIN", "COMMIT", "ROLLBACK",
];

const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

/// Classify a statement.
///
/// `stick_to_primary` is the session's `in_transaction || has_session_variables`
/// flag; when set, routing is not consulted at all.
pub fn route(statement: &str, stick_to_primary: bool) -> Destination {
    if stick_to_primary {
        return Destination::Primary;
    }

    let statement = normalize(statement);

    if WRITE_PREFIXES.iter().any(|p| statement.starts_with(p)) {
        return Destination::Primary;
    }

    if statement.starts_with("WITH") {
        // A CTE is only replica-safe when no DML hides in its body.
        if DML_KEYWORDS.iter().any(|k| statement.contains(k)) {
            return Destination::Primary;
        }
        return Destination::Replica;
    }

    if statement.starts_with("SELECT") && statement.contains("FOR UPDATE") {
        return Destination::Primary;
    }

    if statement.starts_with("SELECT") || statement.starts_with("SHOW") {
        return Destination::Replica;
    }

    Destination::Primary
}

/// `BEGIN` or `START TRANSACTION`.
pub fn is_transaction_start(statement: &str) -> bool {
    let statement = normalize(statement);
    statement.starts_with("BEGIN") || statement.starts_with("START TRANSACTION")
}

/// `COMMIT`, `ROLLBACK`, or `ABORT`.
pub fn is_transaction_end(statement: &str) -> bool {
    let statement = normalize(statement);
    statement.starts_with("COMMIT")
        || statement.starts_with("ROLLBACK")
        || statement.starts_with("ABORT")
}

/// `SET` or `RESET`: mutates session-local state that replicas never see.
pub fn is_session_modification(statement: &str) -> bool {
    let statement = normalize(statement);
    statement.starts_with("SET") || statement.starts_with("RESET")
}

fn normalize(statement: &str) -> String {
    statement.trim().to_ascii_uppercase()
}
