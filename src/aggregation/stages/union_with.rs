use crate::aggregation::pipeline::Stage;
use crate::backend::{Backend, FindOptions};
use bson::Document;
use std::collections::HashMap;

pub async fn execute(
    docs: Vec<Document>,
    backend: &dyn Backend,
    db: &str,
    coll: &str,
    pipeline: &[Stage],
    vars: &HashMap<String, bson::Bson>,
) -> anyhow::Result<Vec<Document>> {
    let mut result = docs;

    let union_docs = backend
        .find(db, coll, &Document::new(), &FindOptions::default())
        .await?;

    let mut processed_union = union_docs;
    for stage in pipeline {
        processed_union = match stage {
            Stage::Match(filter) => {
                crate::aggregation::stages::match_stage::execute(processed_union, filter)?
            }
            Stage::Project(spec) => {
                crate::aggregation::stages::project::execute(processed_union, spec, vars)?
            }
            Stage::AddFields(spec) => {
                crate::aggregation::stages::add_fields::execute(processed_union, spec, vars)?
            }
            Stage::Set(spec) => crate::aggregation::stages::set::execute(processed_union, spec, vars)?,
            Stage::Unset(fields) => {
                crate::aggregation::stages::unset::execute(processed_union, fields)?
            }
            Stage::Sort(spec) => crate::aggregation::stages::sort::execute(processed_union, spec)?,
            Stage::Limit(n) => crate::aggregation::stages::limit::execute(processed_union, *n)?,
            Stage::Skip(n) => crate::aggregation::stages::skip::execute(processed_union, *n)?,
            _ => processed_union,
        };
    }

    result.extend(processed_union);

    Ok(result)
}
