//! SQL text for the lock table.
//!
//! The table name comes from configuration, so it is always quoted; the
//! cluster id is always bound as a parameter.

use std::time::Duration;

use crate::config::CLUSTER_ID_MAX_LEN;

pub fn quote_ident(ident: &str) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quotes `table` or `schema.table` part by part.
pub fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Statements bound to one lock table.
#[derive(Debug, Clone)]
pub struct Statements {
    table: String,
    quoted: String,
}

impl Statements {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            quoted: quote_table(table),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn create_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                 owner_marker BIGINT NOT NULL,\
                 cluster_id VARCHAR({CLUSTER_ID_MAX_LEN}) NOT NULL\
             )",
            self.quoted
        )
    }

    pub fn select_markers(&self) -> String {
        format!(
            "SELECT owner_marker FROM {} WHERE cluster_id = $1",
            self.quoted
        )
    }

    pub fn insert_row(&self) -> String {
        format!(
            "INSERT INTO {} (owner_marker, cluster_id) VALUES ($1, $2)",
            self.quoted
        )
    }

    /// Row-exclusive locking read. With `nowait` the server fails the
    /// statement at once instead of queueing behind another holder.
    pub fn lock_rows(&self, nowait: bool) -> String {
        let mut sql = format!(
            "SELECT owner_marker FROM {} WHERE cluster_id = $1 FOR UPDATE",
            self.quoted
        );
        if nowait {
            sql.push_str(" NOWAIT");
        }
        sql
    }

    pub fn touch(&self) -> String {
        format!(
            "UPDATE {} SET owner_marker = $1 WHERE cluster_id = $2",
            self.quoted
        )
    }
}

/// `SET LOCAL lock_timeout` for a bounded wait. PostgreSQL reads `0` as
/// "wait forever", so callers must use NOWAIT for a zero budget instead.
pub fn set_lock_timeout(wait: Duration) -> String {
    format!("SET LOCAL lock_timeout = '{}ms'", wait.as_millis().max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("node_lock"), "\"node_lock\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("x\"; DROP TABLE y; --"), "\"x\"\"; DROP TABLE y; --\"");
    }

    #[test]
    fn schema_qualified_tables_quote_each_part() {
        assert_eq!(quote_table("node_lock"), "\"node_lock\"");
        assert_eq!(quote_table("ops.node_lock"), "\"ops\".\"node_lock\"");

        let stmts = Statements::new("ops.node_lock");
        assert_eq!(stmts.table(), "ops.node_lock");
        assert_eq!(
            stmts.select_markers(),
            "SELECT owner_marker FROM \"ops\".\"node_lock\" WHERE cluster_id = $1"
        );
    }

    #[test]
    fn statements_target_quoted_table() {
        let stmts = Statements::new("Node_Lock");
        assert_eq!(stmts.table(), "Node_Lock");
        assert!(stmts.create_table().contains("\"Node_Lock\""));
        assert!(stmts.create_table().contains("VARCHAR(20)"));
        assert_eq!(
            stmts.select_markers(),
            "SELECT owner_marker FROM \"Node_Lock\" WHERE cluster_id = $1"
        );
        assert!(stmts.touch().starts_with("UPDATE \"Node_Lock\""));
        assert!(stmts.insert_row().contains("VALUES ($1, $2)"));
    }

    #[test]
    fn lock_rows_appends_nowait_only_when_asked() {
        let stmts = Statements::new("node_lock");
        assert!(stmts.lock_rows(false).ends_with("FOR UPDATE"));
        assert!(stmts.lock_rows(true).ends_with("FOR UPDATE NOWAIT"));
    }

    #[test]
    fn lock_timeout_never_renders_zero() {
        assert_eq!(
            set_lock_timeout(Duration::from_secs(5)),
            "SET LOCAL lock_timeout = '5000ms'"
        );
        assert_eq!(
            set_lock_timeout(Duration::from_micros(10)),
            "SET LOCAL lock_timeout = '1ms'"
        );
    }
}
