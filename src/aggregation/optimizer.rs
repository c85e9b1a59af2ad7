//! Pipeline optimizer (spec component I): predicate pushdown, adjacent-stage
//! merging, redundant-stage elimination, and a lookup pre-filter heuristic.
//! Runs once over a parsed [`Pipeline`]'s stages before execution. Every
//! rewrite here must be a no-op on results — only position/stage-count can
//! change, never which documents survive or their final shape.

use crate::aggregation::pipeline::Stage;
use bson::{doc, Bson, Document};
use std::collections::HashSet;

pub fn optimize(stages: Vec<Stage>) -> Vec<Stage> {
    let stages = push_down_matches(stages);
    let stages = merge_adjacent(stages);
    let stages = eliminate_redundant(stages);
    optimize_lookups(stages)
}

/// Field names a `$match` filter reads, or `None` if the filter contains an
/// opaque operator (`$expr`, `$where`, `$text`) that could reference anything,
/// in which case the match can never be pushed past another stage.
fn referenced_fields(filter: &Document) -> Option<HashSet<String>> {
    let mut out = HashSet::new();
    if !collect_fields(filter, &mut out) {
        return None;
    }
    Some(out)
}

fn collect_fields(filter: &Document, out: &mut HashSet<String>) -> bool {
    for (key, value) in filter.iter() {
        if key == "$expr" || key == "$where" || key == "$text" || key == "$jsonSchema" {
            return false;
        }
        if key == "$and" || key == "$or" || key == "$nor" {
            let Some(arr) = value.as_array() else { return false };
            for item in arr {
                match item.as_document() {
                    Some(sub) => {
                        if !collect_fields(sub, out) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        } else if !key.starts_with('$') {
            out.insert(key.clone());
        }
    }
    true
}

/// True if `field` is `barrier_field` itself, a dotted descendant, or a
/// dotted ancestor of it (either one rewriting the other makes a match
/// unsafe to hoist across).
fn overlaps(field: &str, barrier_field: &str) -> bool {
    field == barrier_field
        || field.starts_with(&format!("{barrier_field}."))
        || barrier_field.starts_with(&format!("{field}."))
}

fn any_overlap(refs: &HashSet<String>, barrier_field: &str) -> bool {
    refs.iter().any(|f| overlaps(f, barrier_field))
}

/// Whether `stage` blocks a `$match` referencing `refs` from moving past it.
/// Only `$sort` (and anything not named in the spec's barrier list) is
/// treated as transparent; everything that can rewrite or drop fields, or
/// change the document multiset, blocks pushdown.
fn blocks_pushdown(stage: &Stage, refs: &HashSet<String>) -> bool {
    match stage {
        Stage::Sort(_) => false,
        Stage::Group { .. } => true,
        Stage::Project(spec) | Stage::AddFields(spec) | Stage::Set(spec) => {
            spec.keys().any(|k| any_overlap(refs, k))
        }
        Stage::Unset(fields) => fields.iter().any(|f| any_overlap(refs, f)),
        Stage::Unwind { path, .. } => {
            let path = path.trim_start_matches('$');
            any_overlap(refs, path)
        }
        Stage::Lookup { as_field, .. } => any_overlap(refs, as_field),
        Stage::Limit(_) | Stage::Skip(_) => true,
        _ => true,
    }
}

/// Walks each `$match` backwards over transparent stages and reinserts it at
/// the earliest position that is still safe, so storage-level filtering
/// (which only the leading stage benefits from, per `exec.rs`'s
/// `is_self_sourcing`) sees the tightest possible predicate.
fn push_down_matches(mut stages: Vec<Stage>) -> Vec<Stage> {
    let mut i = 1;
    while i < stages.len() {
        if !matches!(stages[i], Stage::Match(_)) {
            i += 1;
            continue;
        }
        let refs = match &stages[i] {
            Stage::Match(filter) => referenced_fields(filter),
            _ => unreachable!(),
        };
        let Some(refs) = refs else {
            i += 1;
            continue;
        };

        let mut pos = i;
        while pos > 0 && !blocks_pushdown(&stages[pos - 1], &refs) {
            stages.swap(pos - 1, pos);
            pos -= 1;
        }
        i += 1;
    }
    stages
}

fn is_empty_match(stage: &Stage) -> bool {
    matches!(stage, Stage::Match(doc) if doc.is_empty())
}

/// `Some(true)` = pure inclusion projection, `Some(false)` = pure exclusion,
/// `None` = mixed (can't classify, so two such stages never merge). `_id`'s
/// either-inclusion-or-exclusion value is ignored since it's valid in both
/// kinds of projection.
fn project_kind(spec: &Document) -> Option<bool> {
    let mut kind = None;
    for (k, v) in spec.iter() {
        if k == "_id" {
            continue;
        }
        let truthy = match v {
            Bson::Boolean(b) => *b,
            Bson::Int32(n) => *n != 0,
            Bson::Int64(n) => *n != 0,
            Bson::Double(d) => *d != 0.0,
            _ => return None, // expression projections aren't plain inclusion/exclusion
        };
        match kind {
            None => kind = Some(truthy),
            Some(prev) if prev != truthy => return None,
            _ => {}
        }
    }
    kind
}

fn merge_filters(a: Document, b: Document) -> Document {
    let mut and = Vec::new();
    and.push(Bson::Document(a));
    and.push(Bson::Document(b));
    doc! { "$and": and }
}

fn merge_adjacent(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        match (out.last_mut(), stage) {
            (Some(Stage::Match(prev)), Stage::Match(next)) => {
                let merged = merge_filters(std::mem::take(prev), next);
                *out.last_mut().unwrap() = Stage::Match(merged);
            }
            (Some(Stage::AddFields(prev)), Stage::AddFields(next)) => {
                for (k, v) in next {
                    prev.insert(k, v);
                }
            }
            (Some(Stage::Set(prev)), Stage::Set(next)) => {
                for (k, v) in next {
                    prev.insert(k, v);
                }
            }
            (Some(Stage::Project(prev)), Stage::Project(next))
                if project_kind(prev).is_some() && project_kind(prev) == project_kind(&next) =>
            {
                for (k, v) in next {
                    prev.insert(k, v);
                }
            }
            (_, stage) => out.push(stage),
        }
    }
    out
}

fn eliminate_redundant(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        if is_empty_match(&stage) {
            continue;
        }
        if let (Some(Stage::Sort(_)), Stage::Sort(_)) = (out.last(), &stage) {
            out.pop();
        }
        out.push(stage);
    }
    out
}

/// Strips the `<as>.` prefix from every key of `filter` that is under the
/// lookup's `as_field`, returning `None` if any key references a different
/// field (in which case the match must stay where it is, unsplit).
fn strip_as_prefix(filter: &Document, as_field: &str) -> Option<Document> {
    let prefix = format!("{as_field}.");
    let mut rewritten = Document::new();
    for (k, v) in filter.iter() {
        if k.starts_with('$') {
            return None;
        }
        let stripped = k.strip_prefix(&prefix)?;
        rewritten.insert(stripped, v.clone());
    }
    Some(rewritten)
}

/// Implements `4.I`'s lookup optimization: a `$match` immediately following a
/// pipeline-form `$lookup` that filters exclusively on `<as>.<field>` becomes
/// a `$match` prepended to the lookup's own sub-pipeline instead, so the
/// join only ever materializes matching foreign documents.
fn optimize_lookups(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    let mut iter = stages.into_iter().peekable();
    while let Some(stage) = iter.next() {
        match stage {
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
                let_vars,
                pipeline: Some(mut sub_pipeline),
            } => {
                if let Some(Stage::Match(next_filter)) = iter.peek() {
                    if let Some(prefiltered) = strip_as_prefix(next_filter, &as_field) {
                        sub_pipeline.insert(0, Bson::Document(doc! { "$match": prefiltered }));
                        iter.next();
                    }
                }
                out.push(Stage::Lookup {
                    from,
                    local_field,
                    foreign_field,
                    as_field,
                    let_vars,
                    pipeline: Some(sub_pipeline),
                });
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn pushes_match_before_sort() {
        let stages = vec![Stage::Sort(doc! { "age": 1i32 }), Stage::Match(doc! { "status": "active" })];
        let optimized = optimize(stages);
        assert!(matches!(optimized[0], Stage::Match(_)));
        assert!(matches!(optimized[1], Stage::Sort(_)));
    }

    #[test]
    fn stops_at_group_barrier() {
        let stages = vec![
            Stage::Group { id: Bson::Null, accumulators: doc! { "total": { "$sum": 1i32 } } },
            Stage::Match(doc! { "total": { "$gt": 5i32 } }),
        ];
        let optimized = optimize(stages);
        assert!(matches!(optimized[0], Stage::Group { .. }));
        assert!(matches!(optimized[1], Stage::Match(_)));
    }

    #[test]
    fn merges_adjacent_matches() {
        let stages = vec![Stage::Match(doc! { "a": 1i32 }), Stage::Match(doc! { "b": 2i32 })];
        let optimized = optimize(stages);
        assert_eq!(optimized.len(), 1);
        match &optimized[0] {
            Stage::Match(merged) => assert!(merged.contains_key("$and")),
            _ => panic!("expected merged $match"),
        }
    }

    #[test]
    fn drops_empty_match() {
        let stages = vec![Stage::Match(Document::new()), Stage::Limit(10)];
        let optimized = optimize(stages);
        assert_eq!(optimized.len(), 1);
        assert!(matches!(optimized[0], Stage::Limit(10)));
    }

    #[test]
    fn collapses_back_to_back_sorts() {
        let stages = vec![Stage::Sort(doc! { "a": 1i32 }), Stage::Sort(doc! { "b": -1i32 })];
        let optimized = optimize(stages);
        assert_eq!(optimized.len(), 1);
        match &optimized[0] {
            Stage::Sort(spec) => assert!(spec.contains_key("b")),
            _ => panic!("expected the second sort to win"),
        }
    }

    #[test]
    fn pushes_prefilter_into_lookup_pipeline() {
        let stages = vec![
            Stage::Lookup {
                from: "orders".into(),
                local_field: None,
                foreign_field: None,
                as_field: "o".into(),
                let_vars: None,
                pipeline: Some(vec![]),
            },
            Stage::Match(doc! { "o.status": "shipped" }),
        ];
        let optimized = optimize(stages);
        assert_eq!(optimized.len(), 1);
        match &optimized[0] {
            Stage::Lookup { pipeline: Some(p), .. } => {
                assert_eq!(p.len(), 1);
            }
            _ => panic!("expected lookup with prefilter"),
        }
    }
}
