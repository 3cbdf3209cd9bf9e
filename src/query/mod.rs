//! The document query/update translator (`spec.md` §4.3).
//!
//! Queries (`map<field, constraint>`) and update specs (`map<op, body>`)
//! arrive as `serde_json::Value` objects from the binding façade and are
//! translated here into a SQL fragment plus bound parameters, built against
//! SQLite's `json_extract`/`json_set`/`json_remove`/`json_each` functions
//! over the `app_docs.data` column. No string concatenation of values ever
//! reaches the SQL text; every constraint and update value is bound.

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

use crate::error::StorageError;
use crate::value::marshal;

/// A translated WHERE clause fragment (without the `WHERE` keyword) and its
/// positional bind parameters, in the order `?` placeholders appear.
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// A translated update expression: `json_set`/`json_remove`-composed SQL
/// that, bound to `data = <sql>`, produces the updated document.
pub struct UpdateExpr {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// The JSON path reference for `field` in `app_docs`: the `id` column
/// itself, or `json_extract(data, '$.<field>')` for anything else.
/// `spec.md` §4.3: "the reserved field `id` refers to the `id` column... all
/// other fields refer to `json_extract`."
fn field_reference(field: &str) -> String {
    if field == "id" {
        "id".to_string()
    } else {
        format!("json_extract(data, '$.{field}')")
    }
}

/// Translates a query object into a predicate. An empty query matches
/// everything (`1=1`); top-level fields are AND-combined.
pub fn translate_query(query: &Map<String, Value>) -> Result<Predicate, StorageError> {
    if query.is_empty() {
        return Ok(Predicate {
            sql: "1=1".to_string(),
            params: Vec::new(),
        });
    }

    let mut clauses = Vec::with_capacity(query.len());
    let mut params = Vec::new();

    for (field, constraint) in query {
        let reference = field_reference(field);
        let clause = match constraint {
            Value::Object(ops) => translate_field_operators(&reference, ops, &mut params)?,
            literal => {
                params.push(scalar_to_sql(literal)?);
                format!("{reference} = ?")
            }
        };
        clauses.push(clause);
    }

    Ok(Predicate {
        sql: clauses.join(" AND "),
        params,
    })
}

fn translate_field_operators(
    reference: &str,
    ops: &Map<String, Value>,
    params: &mut Vec<SqlValue>,
) -> Result<String, StorageError> {
    let mut clauses = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let clause = match op.as_str() {
            "$eq" => {
                params.push(scalar_to_sql(operand)?);
                format!("{reference} = ?")
            }
            "$ne" => {
                params.push(scalar_to_sql(operand)?);
                format!("({reference} IS NULL OR {reference} != ?)")
            }
            "$gt" => {
                params.push(scalar_to_sql(operand)?);
                format!("{reference} > ?")
            }
            "$lt" => {
                params.push(scalar_to_sql(operand)?);
                format!("{reference} < ?")
            }
            "$gte" => {
                params.push(scalar_to_sql(operand)?);
                format!("{reference} >= ?")
            }
            "$lte" => {
                params.push(scalar_to_sql(operand)?);
                format!("{reference} <= ?")
            }
            "$in" => translate_in(reference, operand, params, false)?,
            "$nin" => translate_in(reference, operand, params, true)?,
            "$contains" => {
                params.push(scalar_to_sql(operand)?);
                format!("EXISTS (SELECT 1 FROM json_each({reference}) WHERE json_each.value = ?)")
            }
            other => {
                return Err(StorageError::InvalidArgument(format!(
                    "unknown query operator {other}"
                )));
            }
        };
        clauses.push(clause);
    }
    Ok(clauses.join(" AND "))
}

fn translate_in(
    reference: &str,
    operand: &Value,
    params: &mut Vec<SqlValue>,
    negate: bool,
) -> Result<String, StorageError> {
    let items = match operand {
        Value::Array(items) => items,
        _ => return Err(StorageError::InvalidArgument("$in/$nin requires an array".to_string())),
    };

    if items.is_empty() {
        // spec.md §4.3: empty $in matches nothing, empty $nin matches everything.
        return Ok(if negate { "1=1".to_string() } else { "0=1".to_string() });
    }

    let placeholders = std::iter::repeat_n("?", items.len()).collect::<Vec<_>>().join(", ");
    for item in items {
        params.push(scalar_to_sql(item)?);
    }

    Ok(if negate {
        format!("({reference} IS NULL OR {reference} NOT IN ({placeholders}))")
    } else {
        format!("{reference} IN ({placeholders})")
    })
}

/// Translates an update spec into a chained `json_set`/`json_remove`
/// expression over `data`, applied left to right. A bare field name with a
/// non-object value is treated as `$set` on that field, per `spec.md` §4.3.
pub fn translate_update(update: &Map<String, Value>) -> Result<UpdateExpr, StorageError> {
    let mut expr = "data".to_string();
    let mut params = Vec::new();

    for (op, body) in update {
        match op.as_str() {
            "$set" => apply_set(&mut expr, &mut params, body)?,
            "$unset" => apply_unset(&mut expr, body)?,
            "$inc" => apply_inc(&mut expr, &mut params, body)?,
            field => {
                // Bare field name aliased to $set on a single key.
                let mut single = Map::new();
                single.insert(field.to_string(), body.clone());
                apply_set(&mut expr, &mut params, &Value::Object(single))?;
            }
        }
    }

    Ok(UpdateExpr { sql: expr, params })
}

fn apply_set(expr: &mut String, params: &mut Vec<SqlValue>, body: &Value) -> Result<(), StorageError> {
    let fields = match body {
        Value::Object(map) => map,
        _ => return Err(StorageError::InvalidArgument("$set requires an object".to_string())),
    };
    for (field, value) in fields {
        params.push(SqlValue::Text(marshal(value)?));
        *expr = format!("json_set({expr}, '$.{field}', json(?))");
    }
    Ok(())
}

fn apply_unset(expr: &mut String, body: &Value) -> Result<(), StorageError> {
    let fields: Vec<&String> = match body {
        Value::Object(map) => map.keys().collect(),
        _ => return Err(StorageError::InvalidArgument("$unset requires an object".to_string())),
    };
    for field in fields {
        *expr = format!("json_remove({expr}, '$.{field}')");
    }
    Ok(())
}

fn apply_inc(expr: &mut String, params: &mut Vec<SqlValue>, body: &Value) -> Result<(), StorageError> {
    let fields = match body {
        Value::Object(map) => map,
        _ => return Err(StorageError::InvalidArgument("$inc requires an object".to_string())),
    };
    for (field, amount) in fields {
        if !amount.is_number() {
            return Err(StorageError::InvalidArgument("$inc amount must be numeric".to_string()));
        }
        params.push(scalar_to_sql(amount)?);
        *expr = format!("json_set({expr}, '$.{field}', COALESCE(json_extract({expr}, '$.{field}'), 0) + ?)");
    }
    Ok(())
}

fn scalar_to_sql(value: &Value) -> Result<SqlValue, StorageError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(if *b { 1 } else { 0 })),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(StorageError::InvalidArgument("unsupported number literal".to_string()))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(StorageError::InvalidArgument(
            "query operators only compare scalar values".to_string(),
        )),
    }
}
