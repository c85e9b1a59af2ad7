//! Update-document translator (spec 4.G, update half): applies a MongoDB
//! update document — either an operator document (`$set`, `$inc`, ...) or a
//! full replacement document — to an in-memory [`Document`]. The backend
//! calls this after fetching the matching rows; there is no SQL pushdown for
//! updates, since SQLite's JSON1 functions only read JSON, they don't let us
//! express arbitrary-depth `$push`/`$pull` mutations as a single `UPDATE`.

use crate::error::{Error, Result};
use bson::{Bson, Document};

/// Applies `update` to `doc` in place. Returns whether anything changed, so
/// callers can distinguish "matched but not modified" from "modified".
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool> {
    let is_operator_update = update.keys().next().map(|k| k.starts_with('$')).unwrap_or(false);
    if !is_operator_update {
        return Ok(apply_replacement(doc, update));
    }

    let mut changed = false;
    for (op, spec) in update.iter() {
        let spec_doc = spec
            .as_document()
            .ok_or_else(|| Error::bad_value(format!("{op} requires a document")))?;
        changed |= match op.as_str() {
            "$set" => apply_set(doc, spec_doc),
            "$unset" => apply_unset(doc, spec_doc),
            "$inc" => apply_numeric(doc, spec_doc, NumericOp::Inc)?,
            "$mul" => apply_numeric(doc, spec_doc, NumericOp::Mul)?,
            "$min" => apply_numeric(doc, spec_doc, NumericOp::Min)?,
            "$max" => apply_numeric(doc, spec_doc, NumericOp::Max)?,
            "$rename" => apply_rename(doc, spec_doc)?,
            "$push" => apply_push(doc, spec_doc)?,
            "$pull" => apply_pull(doc, spec_doc)?,
            "$pullAll" => apply_pull_all(doc, spec_doc)?,
            "$addToSet" => apply_add_to_set(doc, spec_doc)?,
            "$pop" => apply_pop(doc, spec_doc)?,
            "$currentDate" => apply_current_date(doc, spec_doc)?,
            other => return Err(Error::bad_value(format!("unsupported update operator {other}"))),
        };
    }
    Ok(changed)
}

/// Full-document replacement: keeps the existing `_id` (Mongo rejects
/// attempts to change it, so we just carry the old one forward) and swaps
/// everything else in.
fn apply_replacement(doc: &mut Document, replacement: &Document) -> bool {
    let id = doc.get("_id").cloned();
    let mut new_doc = replacement.clone();
    if let Some(id) = id {
        new_doc.insert("_id", id);
    }
    let changed = *doc != new_doc;
    *doc = new_doc;
    changed
}

/// Splits a dotted path into its component keys.
fn path_parts(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Walks `doc` along `parts`, creating intermediate documents as needed, and
/// returns a mutable reference to the final slot.
fn navigate_mut<'a>(doc: &'a mut Document, parts: &[&str]) -> Option<&'a mut Bson> {
    if parts.is_empty() {
        return None;
    }
    if parts.len() == 1 {
        return Some(doc.entry(parts[0].to_string()).or_insert(Bson::Null));
    }
    let head = parts[0];
    let entry = doc.entry(head.to_string()).or_insert(Bson::Document(Document::new()));
    if !matches!(entry, Bson::Document(_)) {
        *entry = Bson::Document(Document::new());
    }
    match entry {
        Bson::Document(sub) => navigate_mut(sub, &parts[1..]),
        _ => None,
    }
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let parts = path_parts(path);
    for (i, part) in parts.iter().enumerate() {
        let value = current.get(*part)?;
        if i == parts.len() - 1 {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> bool {
    let parts = path_parts(path);
    let prev = get_path(doc, path).cloned();
    if let Some(slot) = navigate_mut(doc, &parts) {
        let changed = prev.as_ref() != Some(&value);
        *slot = value;
        changed
    } else {
        false
    }
}

fn remove_path(doc: &mut Document, path: &str) -> bool {
    let parts = path_parts(path);
    if parts.len() == 1 {
        return doc.remove(parts[0]).is_some();
    }
    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        match current.get_mut(*part) {
            Some(Bson::Document(sub)) => current = sub,
            _ => return false,
        }
    }
    current.remove(parts[parts.len() - 1]).is_some()
}

fn apply_set(doc: &mut Document, spec: &Document) -> bool {
    let mut changed = false;
    for (path, value) in spec.iter() {
        changed |= set_path(doc, path, value.clone());
    }
    changed
}

fn apply_unset(doc: &mut Document, spec: &Document) -> bool {
    let mut changed = false;
    for (path, _) in spec.iter() {
        changed |= remove_path(doc, path);
    }
    changed
}

enum NumericOp {
    Inc,
    Mul,
    Min,
    Max,
}

fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

/// Rebuilds a numeric BSON value with the widest type of `a`/`b`, preferring
/// int64 over int32 and double over either, mirroring Mongo's numeric
/// promotion rules for `$inc`/`$mul`.
fn numeric_result(a: &Bson, b: &Bson, f: impl Fn(f64, f64) -> f64) -> Bson {
    let result = f(as_f64(a).unwrap_or(0.0), as_f64(b).unwrap_or(0.0));
    if matches!(a, Bson::Double(_)) || matches!(b, Bson::Double(_)) {
        Bson::Double(result)
    } else if matches!(a, Bson::Int64(_)) || matches!(b, Bson::Int64(_)) {
        Bson::Int64(result as i64)
    } else {
        Bson::Int32(result as i32)
    }
}

fn apply_numeric(doc: &mut Document, spec: &Document, op: NumericOp) -> Result<bool> {
    let mut changed = false;
    for (path, delta) in spec.iter() {
        if as_f64(delta).is_none() {
            return Err(Error::bad_value(format!("{path}: expected a numeric operand")));
        }
        let current = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
        let existing_numeric = if matches!(current, Bson::Null) {
            Bson::Int32(0)
        } else {
            current.clone()
        };
        if as_f64(&existing_numeric).is_none() {
            return Err(Error::type_mismatch(format!(
                "{path}: cannot apply a numeric update to a non-numeric field"
            )));
        }
        let new_value = match op {
            NumericOp::Inc => numeric_result(&existing_numeric, delta, |a, b| a + b),
            NumericOp::Mul => numeric_result(&existing_numeric, delta, |a, b| a * b),
            NumericOp::Min => numeric_result(&existing_numeric, delta, f64::min),
            NumericOp::Max => numeric_result(&existing_numeric, delta, f64::max),
        };
        changed |= set_path(doc, path, new_value);
    }
    Ok(changed)
}

fn apply_rename(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (from, to) in spec.iter() {
        let to = to
            .as_str()
            .ok_or_else(|| Error::bad_value("$rename target must be a string"))?;
        if let Some(value) = get_path(doc, from).cloned() {
            remove_path(doc, from);
            set_path(doc, to, value);
            changed = true;
        }
    }
    Ok(changed)
}

fn apply_current_date(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (path, directive) in spec.iter() {
        let as_timestamp = match directive {
            Bson::Boolean(true) => false,
            Bson::Document(d) => match d.get_str("$type") {
                Ok("timestamp") => true,
                Ok("date") | Err(_) => false,
                Ok(other) => {
                    return Err(Error::bad_value(format!("unsupported $currentDate type {other}")));
                }
            },
            _ => return Err(Error::bad_value("$currentDate operand must be true or {$type: ...}")),
        };
        let value = if as_timestamp {
            let now = bson::DateTime::now();
            Bson::Timestamp(bson::Timestamp {
                time: (now.timestamp_millis() / 1000) as u32,
                increment: 0,
            })
        } else {
            Bson::DateTime(bson::DateTime::now())
        };
        changed |= set_path(doc, path, value);
    }
    Ok(changed)
}

fn as_array_mut<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Vec<Bson>> {
    let parts = path_parts(path);
    let slot = navigate_mut(doc, &parts).ok_or_else(|| Error::bad_value(format!("invalid path {path}")))?;
    if matches!(slot, Bson::Null) {
        *slot = Bson::Array(Vec::new());
    }
    match slot {
        Bson::Array(arr) => Ok(arr),
        _ => Err(Error::type_mismatch(format!("{path}: not an array"))),
    }
}

fn apply_push(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (path, value) in spec.iter() {
        let (items, slice, sort, position): (Vec<Bson>, Option<i64>, Option<Bson>, Option<i64>) =
            match value.as_document() {
                Some(modifiers) if modifiers.contains_key("$each") => {
                    let each = modifiers
                        .get_array("$each")
                        .map_err(|_| Error::bad_value("$push $each requires an array"))?
                        .clone();
                    (
                        each,
                        modifiers.get_i64("$slice").ok().or_else(|| modifiers.get_i32("$slice").ok().map(i64::from)),
                        modifiers.get("$sort").cloned(),
                        modifiers.get_i64("$position").ok().or_else(|| modifiers.get_i32("$position").ok().map(i64::from)),
                    )
                }
                _ => (vec![value.clone()], None, None, None),
            };

        let arr = as_array_mut(doc, path)?;
        match position {
            Some(pos) if pos >= 0 && (pos as usize) <= arr.len() => {
                let mut idx = pos as usize;
                for item in items {
                    arr.insert(idx, item);
                    idx += 1;
                }
            }
            _ => arr.extend(items),
        }

        if let Some(sort_spec) = sort {
            sort_array(arr, &sort_spec);
        }
        if let Some(n) = slice {
            slice_array(arr, n);
        }
        changed = true;
    }
    Ok(changed)
}

fn sort_array(arr: &mut [Bson], spec: &Bson) {
    let ascending = match spec {
        Bson::Int32(n) => *n >= 0,
        Bson::Int64(n) => *n >= 0,
        Bson::Double(d) => *d >= 0.0,
        _ => true,
    };
    arr.sort_by(|a, b| {
        let ord = crate::aggregation::values::bson_cmp(a, b);
        if ascending { ord } else { ord.reverse() }
    });
}

fn slice_array(arr: &mut Vec<Bson>, n: i64) {
    let len = arr.len();
    if n >= 0 {
        arr.truncate(n as usize);
    } else {
        let keep = (-n) as usize;
        if keep < len {
            arr.drain(0..(len - keep));
        }
    }
}

fn apply_pull(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (path, condition) in spec.iter() {
        let arr = as_array_mut(doc, path)?;
        let before = arr.len();
        match condition.as_document() {
            Some(opdoc) if opdoc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => {
                arr.retain(|item| !matches_simple_predicate(item, opdoc));
            }
            Some(filter_doc) => {
                arr.retain(|item| {
                    let item_doc = item.as_document();
                    !filter_doc.iter().all(|(k, v)| {
                        item_doc.and_then(|d| d.get(k)).map(|iv| iv == v).unwrap_or(false)
                    })
                });
            }
            None => {
                arr.retain(|item| item != condition);
            }
        }
        changed |= arr.len() != before;
    }
    Ok(changed)
}

fn matches_simple_predicate(value: &Bson, opdoc: &Document) -> bool {
    opdoc.iter().all(|(op, operand)| match op.as_str() {
        "$gt" => crate::aggregation::values::bson_cmp(value, operand) == std::cmp::Ordering::Greater,
        "$gte" => crate::aggregation::values::bson_cmp(value, operand) != std::cmp::Ordering::Less,
        "$lt" => crate::aggregation::values::bson_cmp(value, operand) == std::cmp::Ordering::Less,
        "$lte" => crate::aggregation::values::bson_cmp(value, operand) != std::cmp::Ordering::Greater,
        "$eq" => value == operand,
        "$ne" => value != operand,
        "$in" => operand.as_array().map(|a| a.contains(value)).unwrap_or(false),
        _ => false,
    })
}

fn apply_pull_all(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (path, values) in spec.iter() {
        let to_remove = values
            .as_array()
            .ok_or_else(|| Error::bad_value("$pullAll requires an array"))?;
        let arr = as_array_mut(doc, path)?;
        let before = arr.len();
        arr.retain(|item| !to_remove.contains(item));
        changed |= arr.len() != before;
    }
    Ok(changed)
}

fn apply_add_to_set(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (path, value) in spec.iter() {
        let items: Vec<Bson> = match value.as_document() {
            Some(modifiers) if modifiers.contains_key("$each") => modifiers
                .get_array("$each")
                .map_err(|_| Error::bad_value("$addToSet $each requires an array"))?
                .clone(),
            _ => vec![value.clone()],
        };
        let arr = as_array_mut(doc, path)?;
        for item in items {
            if !arr.contains(&item) {
                arr.push(item);
                changed = true;
            }
        }
    }
    Ok(changed)
}

fn apply_pop(doc: &mut Document, spec: &Document) -> Result<bool> {
    let mut changed = false;
    for (path, direction) in spec.iter() {
        let from_end = direction.as_i32().map(|n| n >= 0).unwrap_or(true);
        let arr = as_array_mut(doc, path)?;
        if arr.is_empty() {
            continue;
        }
        if from_end {
            arr.pop();
        } else {
            arr.remove(0);
        }
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn set_creates_nested_path() {
        let mut d = doc! { "_id": 1i32 };
        apply_update(&mut d, &doc! { "$set": { "a.b": 5i32 } }).unwrap();
        assert_eq!(d.get_document("a").unwrap().get_i32("b").unwrap(), 5);
    }

    #[test]
    fn inc_promotes_numeric_type() {
        let mut d = doc! { "n": 1i32 };
        apply_update(&mut d, &doc! { "$inc": { "n": 2.5f64 } }).unwrap();
        assert_eq!(d.get_f64("n").unwrap(), 3.5);
    }

    #[test]
    fn unset_removes_field() {
        let mut d = doc! { "a": 1i32, "b": 2i32 };
        apply_update(&mut d, &doc! { "$unset": { "a": "" } }).unwrap();
        assert!(!d.contains_key("a"));
    }

    #[test]
    fn push_each_slice_sort() {
        let mut d = doc! { "scores": [3i32, 1i32] };
        apply_update(
            &mut d,
            &doc! { "$push": { "scores": { "$each": [2i32], "$sort": 1i32, "$slice": 2i32 } } },
        )
        .unwrap();
        let arr = d.get_array("scores").unwrap();
        assert_eq!(arr, &vec![Bson::Int32(1), Bson::Int32(2)]);
    }

    #[test]
    fn add_to_set_dedupes() {
        let mut d = doc! { "tags": ["a"] };
        apply_update(&mut d, &doc! { "$addToSet": { "tags": "a" } }).unwrap();
        assert_eq!(d.get_array("tags").unwrap().len(), 1);
    }

    #[test]
    fn rename_moves_value() {
        let mut d = doc! { "old": 1i32 };
        apply_update(&mut d, &doc! { "$rename": { "old": "new" } }).unwrap();
        assert!(!d.contains_key("old"));
        assert_eq!(d.get_i32("new").unwrap(), 1);
    }

    #[test]
    fn replacement_preserves_id() {
        let mut d = doc! { "_id": 7i32, "a": 1i32 };
        apply_update(&mut d, &doc! { "a": 2i32 }).unwrap();
        assert_eq!(d.get_i32("_id").unwrap(), 7);
        assert_eq!(d.get_i32("a").unwrap(), 2);
    }
}
