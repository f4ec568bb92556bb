//! JSON-typed query execution.
//!
//! Reactive subscriptions carry arbitrary SQL; results are materialized as
//! JSON objects so they can be compared for change detection and handed to
//! components without a typed row mapper.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use serde_json::{Map, Number, Value};

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;
pub type Rows = Vec<Row>;

/// Execute `sql` with JSON params and collect every row as a JSON object.
pub fn run_json(
    conn: &Connection,
    sql: &str,
    params: &[Value],
) -> Result<Rows, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
    let mut rows = stmt.query(params_from_iter(bound.iter().map(|v| v as &dyn ToSql)))?;

    let mut out = Rows::new();
    while let Some(row) = rows.next()? {
        let mut obj = Row::new();
        for (i, name) in column_names.iter().enumerate() {
            obj.insert(name.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(obj);
    }
    Ok(out)
}

/// Map a JSON parameter onto an sqlite value. Booleans become integers;
/// arrays and objects are bound as their JSON text.
fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Which of the known tables a query references. Matching is by word
/// boundary, so `state` does not match `state_history`.
pub fn referenced_tables(sql: &str, known: &[&'static str]) -> Vec<&'static str> {
    let lowered = sql.to_lowercase();
    let bytes = lowered.as_bytes();
    known
        .iter()
        .copied()
        .filter(|table| {
            let mut from = 0;
            while let Some(pos) = lowered[from..].find(table) {
                let start = from + pos;
                let end = start + table.len();
                let left_ok = start == 0 || !is_ident_byte(bytes[start - 1]);
                let right_ok = end == bytes.len() || !is_ident_byte(bytes[end]);
                if left_ok && right_ok {
                    return true;
                }
                from = end;
            }
            false
        })
        .collect()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
