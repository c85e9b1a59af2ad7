//! Filter-document translator (spec 4.G): maps a MongoDB filter document into a
//! parameterized SQL predicate over the `doc_json` column of a collection table.
//! Every user-supplied literal becomes a bound parameter; only trusted path
//! strings are interpolated into the SQL text.

use crate::error::{Error, Result};
use bson::{Bson, Document};
use rusqlite::types::Value as SqlValue;

/// A SQL fragment plus its positional parameters, collected in the order they
/// must be bound.
#[derive(Debug, Clone, Default)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl WhereClause {
    pub fn always_true() -> Self {
        Self {
            sql: "1".to_string(),
            params: Vec::new(),
        }
    }

    fn combine(parts: Vec<WhereClause>, joiner: &str) -> WhereClause {
        if parts.is_empty() {
            return WhereClause::always_true();
        }
        if parts.len() == 1 {
            return parts.into_iter().next().unwrap();
        }
        let mut sql = String::from("(");
        let mut params = Vec::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                sql.push_str(joiner);
            }
            sql.push_str(&part.sql);
            params.extend(part.params);
        }
        sql.push(')');
        WhereClause { sql, params }
    }
}

/// Converts a dotted Mongo field path into a SQLite `json_extract` path
/// expression, e.g. `"a.b"` -> `"$.a.b"`.
fn json_path(field: &str) -> String {
    let mut path = String::from("$");
    for part in field.split('.') {
        path.push('.');
        path.push_str(part);
    }
    path
}

fn path_extract(field: &str) -> String {
    format!("json_extract(doc_json, '{}')", json_path(field).replace('\'', "''"))
}

pub fn bson_to_sql_value(value: &Bson) -> SqlValue {
    match value {
        Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey => SqlValue::Null,
        Bson::Boolean(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        Bson::Int32(n) => SqlValue::Integer(*n as i64),
        Bson::Int64(n) => SqlValue::Integer(*n),
        Bson::Double(d) => SqlValue::Real(*d),
        Bson::String(s) => SqlValue::Text(s.clone()),
        Bson::DateTime(dt) => SqlValue::Integer(dt.timestamp_millis()),
        Bson::ObjectId(oid) => SqlValue::Text(oid.to_hex()),
        Bson::Document(_) | Bson::Array(_) => {
            let json = serde_json::to_string(&bson_to_json_value(value)).unwrap_or_else(|_| "null".to_string());
            SqlValue::Text(json)
        }
        other => SqlValue::Text(
            serde_json::to_string(&bson_to_json_value(other)).unwrap_or_else(|_| "null".to_string()),
        ),
    }
}

/// Converts a BSON value into the flattened JSON representation used by the
/// `doc_json` storage column, so that literal filter values (built above) and
/// stored documents agree on how ObjectIds, dates, and nested structures look
/// under `json_extract`/`json(...)`. Full BSON fidelity lives separately in
/// the `doc_bson` column; this representation exists only to make SQLite's
/// JSON1 functions usable for querying.
pub fn bson_to_json_value(value: &Bson) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey => J::Null,
        Bson::Boolean(b) => J::Bool(*b),
        Bson::Int32(n) => J::Number((*n).into()),
        Bson::Int64(n) => J::Number((*n).into()),
        Bson::Double(d) => serde_json::Number::from_f64(*d).map(J::Number).unwrap_or(J::Null),
        Bson::String(s) => J::String(s.clone()),
        Bson::DateTime(dt) => J::Number(dt.timestamp_millis().into()),
        Bson::ObjectId(oid) => J::String(oid.to_hex()),
        Bson::Timestamp(ts) => J::Number((((ts.time as i64) << 32) | ts.increment as i64).into()),
        Bson::Document(d) => {
            let mut map = serde_json::Map::with_capacity(d.len());
            for (k, v) in d.iter() {
                map.insert(k.clone(), bson_to_json_value(v));
            }
            J::Object(map)
        }
        Bson::Array(arr) => J::Array(arr.iter().map(bson_to_json_value).collect()),
        other => J::String(other.to_string()),
    }
}

/// Converts a full document to its flattened JSON storage form in one call.
pub fn document_to_json_value(doc: &Document) -> serde_json::Value {
    bson_to_json_value(&Bson::Document(doc.clone()))
}

/// Whether `value` requires comparison via `json(...)` normalization (documents
/// and arrays) rather than direct scalar comparison.
fn is_structural(value: &Bson) -> bool {
    matches!(value, Bson::Document(_) | Bson::Array(_))
}

fn eq_clause(field: &str, value: &Bson) -> WhereClause {
    let extract = path_extract(field);
    if is_structural(value) {
        WhereClause {
            sql: format!("{extract} = json(?)"),
            params: vec![bson_to_sql_value(value)],
        }
    } else if matches!(value, Bson::Null) {
        WhereClause {
            sql: format!("{extract} IS NULL"),
            params: vec![],
        }
    } else {
        WhereClause {
            sql: format!("{extract} = ?"),
            params: vec![bson_to_sql_value(value)],
        }
    }
}

fn cmp_clause(field: &str, op: &str, value: &Bson) -> WhereClause {
    let extract = path_extract(field);
    WhereClause {
        sql: format!("{extract} {op} ?"),
        params: vec![bson_to_sql_value(value)],
    }
}

fn in_clause(field: &str, values: &[Bson], negate: bool) -> WhereClause {
    if values.is_empty() {
        return WhereClause {
            sql: (if negate { "1" } else { "0" }).to_string(),
            params: vec![],
        };
    }
    let extract = path_extract(field);
    let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let op = if negate { "NOT IN" } else { "IN" };
    WhereClause {
        sql: format!("{extract} {op} ({placeholders})"),
        params: values.iter().map(bson_to_sql_value).collect(),
    }
}

/// Builds the WHERE clause for a top-level filter document.
pub fn build_where_from_filter(filter: &Document) -> Result<WhereClause> {
    build_conjunction(filter)
}

fn build_conjunction(filter: &Document) -> Result<WhereClause> {
    let mut parts = Vec::new();
    for (key, value) in filter.iter() {
        if key.starts_with('$') {
            parts.push(build_logical(key, value)?);
        } else {
            parts.push(build_field_predicate(key, value)?);
        }
    }
    Ok(WhereClause::combine(parts, " AND "))
}

fn build_logical(op: &str, value: &Bson) -> Result<WhereClause> {
    match op {
        "$and" => {
            let arr = value
                .as_array()
                .ok_or_else(|| Error::bad_value("$and requires an array"))?;
            let mut parts = Vec::with_capacity(arr.len());
            for item in arr {
                let d = item
                    .as_document()
                    .ok_or_else(|| Error::bad_value("$and elements must be documents"))?;
                parts.push(build_conjunction(d)?);
            }
            Ok(WhereClause::combine(parts, " AND "))
        }
        "$or" => {
            let arr = value
                .as_array()
                .ok_or_else(|| Error::bad_value("$or requires an array"))?;
            let mut parts = Vec::with_capacity(arr.len());
            for item in arr {
                let d = item
                    .as_document()
                    .ok_or_else(|| Error::bad_value("$or elements must be documents"))?;
                parts.push(build_conjunction(d)?);
            }
            Ok(WhereClause::combine(parts, " OR "))
        }
        "$nor" => {
            let arr = value
                .as_array()
                .ok_or_else(|| Error::bad_value("$nor requires an array"))?;
            let mut parts = Vec::with_capacity(arr.len());
            for item in arr {
                let d = item
                    .as_document()
                    .ok_or_else(|| Error::bad_value("$nor elements must be documents"))?;
                parts.push(build_conjunction(d)?);
            }
            let inner = WhereClause::combine(parts, " OR ");
            Ok(WhereClause {
                sql: format!("NOT ({})", inner.sql),
                params: inner.params,
            })
        }
        "$text" => {
            // Routed to 4.H search; the top-level filter translator only rejects
            // it here so callers that don't handle $text separately fail loudly.
            Err(Error::bad_value(
                "$text must be handled by the search translator, not the filter translator",
            ))
        }
        other => Err(Error::bad_value(format!("unknown logical operator {other}"))),
    }
}

fn build_field_predicate(field: &str, value: &Bson) -> Result<WhereClause> {
    match value {
        Bson::Document(opdoc) if opdoc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => {
            build_operator_doc(field, opdoc)
        }
        other => Ok(eq_clause(field, other)),
    }
}

fn build_operator_doc(field: &str, opdoc: &Document) -> Result<WhereClause> {
    let mut parts = Vec::new();
    for (op, value) in opdoc.iter() {
        parts.push(match op.as_str() {
            "$eq" => eq_clause(field, value),
            "$ne" => {
                let inner = eq_clause(field, value);
                WhereClause {
                    sql: format!("NOT ({})", inner.sql),
                    params: inner.params,
                }
            }
            "$gt" => cmp_clause(field, ">", value),
            "$gte" => cmp_clause(field, ">=", value),
            "$lt" => cmp_clause(field, "<", value),
            "$lte" => cmp_clause(field, "<=", value),
            "$in" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::bad_value("$in requires an array"))?;
                in_clause(field, arr, false)
            }
            "$nin" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::bad_value("$nin requires an array"))?;
                in_clause(field, arr, true)
            }
            "$not" => {
                let inner = match value {
                    Bson::Document(d) => build_operator_doc(field, d)?,
                    other => eq_clause(field, other),
                };
                WhereClause {
                    sql: format!("NOT ({})", inner.sql),
                    params: inner.params,
                }
            }
            "$exists" => {
                let want = value.as_bool().unwrap_or(true);
                let extract = path_extract(field);
                let sql = if want {
                    format!("{extract} IS NOT NULL")
                } else {
                    format!("{extract} IS NULL")
                };
                WhereClause { sql, params: vec![] }
            }
            "$type" => {
                let type_name = value
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| value.to_string());
                let extract = path_extract(field);
                let sql = match type_name.as_str() {
                    "string" => format!("json_type({extract}) = 'text'"),
                    "number" | "double" | "int" | "long" => {
                        format!("json_type({extract}) IN ('integer','real')")
                    }
                    "object" => format!("json_type({extract}) = 'object'"),
                    "array" => format!("json_type({extract}) = 'array'"),
                    "bool" => format!("json_type({extract}) IN ('true','false')"),
                    "null" => format!("json_type({extract}) = 'null'"),
                    _ => format!("json_type({extract}) IS NOT NULL"),
                };
                WhereClause { sql, params: vec![] }
            }
            "$regex" => {
                let pattern = match value {
                    Bson::String(s) => s.clone(),
                    Bson::RegularExpression(r) => r.pattern.clone(),
                    _ => return Err(Error::bad_value("$regex must be a string or regex")),
                };
                let case_insensitive = opdoc
                    .get_str("$options")
                    .map(|o| o.contains('i'))
                    .unwrap_or(false);
                let extract = path_extract(field);
                let func = if case_insensitive { "oxlite_regex_ci" } else { "oxlite_regex" };
                WhereClause {
                    sql: format!("{func}(?, {extract}) = 1"),
                    params: vec![SqlValue::Text(pattern)],
                }
            }
            "$options" => continue, // consumed alongside $regex
            "$size" => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| Error::bad_value("$size requires an integer"))?;
                let extract = path_extract(field);
                WhereClause {
                    sql: format!("json_array_length({extract}) = ?"),
                    params: vec![SqlValue::Integer(n)],
                }
            }
            "$all" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::bad_value("$all requires an array"))?;
                let mut parts = Vec::with_capacity(arr.len());
                for item in arr {
                    let extract = path_extract(field);
                    parts.push(WhereClause {
                        sql: format!(
                            "EXISTS (SELECT 1 FROM json_each({extract}) WHERE json_each.value = ?)"
                        ),
                        params: vec![bson_to_sql_value(item)],
                    });
                }
                WhereClause::combine(parts, " AND ")
            }
            "$elemMatch" => {
                let sub = value
                    .as_document()
                    .ok_or_else(|| Error::bad_value("$elemMatch requires a document"))?;
                build_elem_match(field, sub)?
            }
            other => return Err(Error::bad_value(format!("unsupported operator {other}"))),
        });
    }
    Ok(WhereClause::combine(parts, " AND "))
}

fn build_elem_match(field: &str, sub: &Document) -> Result<WhereClause> {
    let extract = path_extract(field);
    // Re-root a synthetic filter against each array element's json_each.value,
    // by re-using the field-predicate machinery on a relative path of "".
    let mut parts = Vec::new();
    for (key, value) in sub.iter() {
        if key.starts_with('$') {
            parts.push(build_logical(key, value)?);
            continue;
        }
        let elem_extract = format!(
            "json_extract(json_each.value, '{}')",
            json_path(key).replace('\'', "''")
        );
        parts.push(match value {
            Bson::Document(opdoc) if opdoc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => {
                build_operator_doc_with_extract(&elem_extract, opdoc)?
            }
            other => WhereClause {
                sql: format!("{elem_extract} = ?"),
                params: vec![bson_to_sql_value(other)],
            },
        });
    }
    let inner = WhereClause::combine(parts, " AND ");
    Ok(WhereClause {
        sql: format!(
            "EXISTS (SELECT 1 FROM json_each({extract}) WHERE {})",
            inner.sql
        ),
        params: inner.params,
    })
}

/// Like `build_operator_doc` but against an arbitrary extraction expression
/// instead of a path rooted at `doc_json` — used inside `$elemMatch`.
fn build_operator_doc_with_extract(extract: &str, opdoc: &Document) -> Result<WhereClause> {
    let mut parts = Vec::new();
    for (op, value) in opdoc.iter() {
        let clause = match op.as_str() {
            "$eq" => WhereClause {
                sql: format!("{extract} = ?"),
                params: vec![bson_to_sql_value(value)],
            },
            "$ne" => WhereClause {
                sql: format!("{extract} != ?"),
                params: vec![bson_to_sql_value(value)],
            },
            "$gt" => WhereClause { sql: format!("{extract} > ?"), params: vec![bson_to_sql_value(value)] },
            "$gte" => WhereClause { sql: format!("{extract} >= ?"), params: vec![bson_to_sql_value(value)] },
            "$lt" => WhereClause { sql: format!("{extract} < ?"), params: vec![bson_to_sql_value(value)] },
            "$lte" => WhereClause { sql: format!("{extract} <= ?"), params: vec![bson_to_sql_value(value)] },
            other => return Err(Error::bad_value(format!("unsupported operator {other} in $elemMatch"))),
        };
        parts.push(clause);
    }
    Ok(WhereClause::combine(parts, " AND "))
}

/// Validates a collection/database name per 4.G: non-empty, no NUL, no leading
/// `$`, at most 120 bytes.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::bad_value("name must not be empty"));
    }
    if name.len() > 120 {
        return Err(Error::bad_value("name exceeds 120 bytes"));
    }
    if name.starts_with('$') {
        return Err(Error::bad_value("name must not begin with '$'"));
    }
    if name.contains('\0') {
        return Err(Error::bad_value("name must not contain NUL"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn equality_is_parameterized() {
        let filter = doc! { "n": 2i32 };
        let clause = build_where_from_filter(&filter).unwrap();
        assert!(clause.sql.contains('?'));
        assert_eq!(clause.params.len(), 1);
        assert!(!clause.sql.contains('2'));
    }

    #[test]
    fn gt_operator() {
        let filter = doc! { "n": { "$gt": 1i32 } };
        let clause = build_where_from_filter(&filter).unwrap();
        assert!(clause.sql.contains('>'));
        assert_eq!(clause.params.len(), 1);
    }

    #[test]
    fn and_or_combinators() {
        let filter = doc! { "$or": [ { "a": 1i32 }, { "b": 2i32 } ] };
        let clause = build_where_from_filter(&filter).unwrap();
        assert!(clause.sql.contains(" OR "));
        assert_eq!(clause.params.len(), 2);
    }
}
