use crate::{
    error::{ServiceError, ServiceResult},
    store::{self, Ident, Row, Store},
};
use duckdb::{params_from_iter, types::Value as SqlValue};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

/// Every row of `table`, ordered by id.
pub fn read_all(store: &Store, table: &str) -> ServiceResult<Vec<Row>> {
    let table = Ident::new(table)?;
    let conn = store.connection()?;
    let mut stmt = conn.prepare(&store::select_all_sql(&table))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Row {
                id: r.get(0)?,
                date: r.get(1)?,
                memo: r.get(2)?,
                num: r.get(3)?,
                source_name: r.get(4)?,
                qty: r.get(5)?,
                received: r.get(6)?,
                rcvd_date: r.get(7)?,
                freight: r.get(8)?,
                notes: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    debug!(table = %table, rows = rows.len(), "read table");
    Ok(rows)
}

/// Delete every row of `table`, returning how many were removed.
pub fn clear(store: &Store, table: &str) -> ServiceResult<usize> {
    let table = Ident::new(table)?;
    let conn = store.connection()?;
    let deleted = conn.execute(&store::delete_all_sql(&table), [])?;
    info!(table = %table, deleted, "cleared table");
    Ok(deleted)
}

/// Body of a single-row update: `{"id": 1, "updates": {"memo": "fixed"}}`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub updates: Option<Value>,
}

/// Set the named columns of the row matching `id`.
///
/// Matching zero rows is not an error. Unknown columns or tables surface as
/// storage errors from the database.
pub fn update_row(store: &Store, table: &str, request: UpdateRequest) -> ServiceResult<Value> {
    let id = match request.id {
        Some(id) if is_present(&id) => id,
        _ => return Err(ServiceError::Validation("missing row id".into())),
    };
    let updates = match request.updates {
        Some(Value::Object(map)) if !map.is_empty() => map,
        _ => {
            return Err(ServiceError::Validation(
                "updates must be a non-empty object".into(),
            ))
        }
    };

    let table = Ident::new(table)?;
    let mut columns = Vec::with_capacity(updates.len());
    let mut values = Vec::with_capacity(updates.len() + 1);
    for (column, value) in &updates {
        columns.push(Ident::new(column)?);
        values.push(to_sql_value(value));
    }
    values.push(to_sql_value(&id));

    let conn = store.connection()?;
    let changed = conn.execute(
        &store::update_row_sql(&table, &columns),
        params_from_iter(values),
    )?;
    info!(table = %table, id = %display_id(&id), changed, "updated row");
    Ok(id)
}

/// `null`, `false`, `0` and `""` do not identify a row.
fn is_present(id: &Value) -> bool {
    match id {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::BigInt(i),
            None => SqlValue::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Row id as it appears in messages: strings without their JSON quotes.
pub fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
