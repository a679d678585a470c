use crate::error::{ServiceError, ServiceResult};
use duckdb::Connection;
use serde::Serialize;
use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};
use tracing::{debug, info};

/// Longest table or column name accepted as an identifier.
pub const MAX_IDENT_LEN: usize = 128;

/// Every column of a ledger table, in declaration order.
pub const LEDGER_COLUMNS: [&str; 10] = [
    "id",
    "date",
    "memo",
    "num",
    "source_name",
    "qty",
    "received",
    "rcvd_date",
    "freight",
    "notes",
];

/// A caller-supplied table or column name that is safe to splice into SQL
/// once double-quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: &str) -> ServiceResult<Self> {
        let ok = !name.is_empty()
            && name.chars().count() <= MAX_IDENT_LEN
            && !name.chars().any(char::is_control);
        if ok {
            Ok(Ident(name.to_string()))
        } else {
            Err(ServiceError::InvalidIdentifier(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `"name"` with embedded double quotes doubled.
    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// One ledger row as stored. Only `id` is guaranteed to be set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub id: i64,
    pub date: Option<String>,
    pub memo: Option<String>,
    pub num: Option<String>,
    pub source_name: Option<String>,
    pub qty: Option<f64>,
    pub received: Option<f64>,
    pub rcvd_date: Option<String>,
    pub freight: Option<f64>,
    pub notes: Option<String>,
}

/// Handle to the embedded DuckDB database shared by every request.
///
/// The root connection lives for the lifetime of the process; each operation
/// works on its own clone of it so statements never cross request borders.
pub struct Store {
    root: Mutex<Connection>,
}

impl Store {
    /// Open a DuckDB database on disk at `path`, creating the file if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened store");
        Ok(Store {
            root: Mutex::new(conn),
        })
    }

    /// Open a DuckDB in‐memory database
    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Store {
            root: Mutex::new(conn),
        })
    }

    /// A fresh connection to the same database.
    pub fn connection(&self) -> ServiceResult<Connection> {
        let root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(root.try_clone()?)
    }
}

fn sequence_name(table: &Ident) -> String {
    format!("{}_id_seq", table.as_str())
}

fn create_table_sql(table: &Ident) -> String {
    let seq = quote_ident(&sequence_name(table));
    format!(
        "CREATE SEQUENCE IF NOT EXISTS {seq};
        CREATE TABLE IF NOT EXISTS {table} (
            \"id\" BIGINT PRIMARY KEY DEFAULT nextval({seq_lit}),
            \"date\" VARCHAR,
            \"memo\" VARCHAR,
            \"num\" VARCHAR,
            \"source_name\" VARCHAR,
            \"qty\" DOUBLE,
            \"received\" DOUBLE,
            \"rcvd_date\" VARCHAR,
            \"freight\" DOUBLE,
            \"notes\" VARCHAR
        );",
        seq = seq,
        table = table.quoted(),
        seq_lit = quote_literal(&seq),
    )
}

/// Create `table` with the fixed ledger shape unless it already exists.
/// An existing table is never altered, whatever its shape.
pub fn ensure_table(conn: &Connection, table: &Ident) -> ServiceResult<()> {
    conn.execute_batch(&create_table_sql(table))
        .map_err(|source| ServiceError::CreateTable {
            table: table.to_string(),
            source,
        })?;
    debug!(table = %table, "ensured table");
    Ok(())
}

/// Parameterised insert of the five columns ingestion populates.
pub fn insert_entry_sql(table: &Ident) -> String {
    format!(
        "INSERT INTO {} (\"date\", \"memo\", \"num\", \"source_name\", \"qty\") VALUES (?, ?, ?, ?, ?)",
        table.quoted()
    )
}

pub fn select_all_sql(table: &Ident) -> String {
    let cols: Vec<String> = LEDGER_COLUMNS.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {} FROM {} ORDER BY \"id\"",
        cols.join(", "),
        table.quoted()
    )
}

pub fn delete_all_sql(table: &Ident) -> String {
    format!("DELETE FROM {}", table.quoted())
}

/// `UPDATE "t" SET "a" = ?, "b" = ? WHERE "id" = ?`
pub fn update_row_sql(table: &Ident, columns: &[Ident]) -> String {
    let set_clause: Vec<String> = columns
        .iter()
        .map(|c| format!("{} = ?", c.quoted()))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE \"id\" = ?",
        table.quoted(),
        set_clause.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ident_rejects_empty_and_control_chars() {
        assert!(Ident::new("").is_err());
        assert!(Ident::new("bad\nname").is_err());
        assert!(Ident::new(&"x".repeat(MAX_IDENT_LEN + 1)).is_err());
        assert!(Ident::new("ledger_2024").is_ok());
        assert!(Ident::new("my ledger").is_ok());
    }

    #[test]
    fn ident_quotes_embedded_double_quotes() {
        let ident = Ident::new(r#"we"ird"#).unwrap();
        assert_eq!(ident.quoted(), r#""we""ird""#);
    }

    #[test]
    fn update_sql_lists_every_column() {
        let table = Ident::new("ledger").unwrap();
        let cols = vec![Ident::new("memo").unwrap(), Ident::new("qty").unwrap()];
        assert_eq!(
            update_row_sql(&table, &cols),
            r#"UPDATE "ledger" SET "memo" = ?, "qty" = ? WHERE "id" = ?"#
        );
    }

    #[test]
    fn ensure_table_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection().unwrap();
        let table = Ident::new("ledger").unwrap();

        ensure_table(&conn, &table).unwrap();
        ensure_table(&conn, &table).unwrap();

        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.columns WHERE table_name = 'ledger'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, LEDGER_COLUMNS.len() as i64);
    }

    #[test]
    fn ids_are_assigned_from_a_per_table_sequence() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection().unwrap();
        let a = Ident::new("a").unwrap();
        let b = Ident::new("b").unwrap();
        ensure_table(&conn, &a).unwrap();
        ensure_table(&conn, &b).unwrap();

        for t in [&a, &a, &b] {
            conn.execute(
                &insert_entry_sql(t),
                duckdb::params![Some("d"), None::<String>, None::<String>, None::<String>, 1],
            )
            .unwrap();
        }

        let ids_a: Vec<i64> = conn
            .prepare(r#"SELECT "id" FROM "a" ORDER BY "id""#)
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let id_b: i64 = conn
            .query_row(r#"SELECT "id" FROM "b""#, [], |r| r.get(0))
            .unwrap();
        assert_eq!(ids_a, vec![1, 2]);
        assert_eq!(id_b, 1);
    }

    #[test]
    fn connections_share_one_database_file() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("finance.db")).unwrap();
        let table = Ident::new("shared").unwrap();

        ensure_table(&store.connection().unwrap(), &table).unwrap();
        let other = store.connection().unwrap();
        let n: i64 = other
            .query_row(r#"SELECT COUNT(*) FROM "shared""#, [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
        assert!(dir.path().join("finance.db").exists());
    }
}
