use crate::aggregation::expr::{ExprEvalContext, eval_expr, parse_expr};
use crate::aggregation::pipeline::Stage;
use crate::backend::{Backend, FindOptions};
use bson::{Bson, Document};
use std::collections::HashMap;

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    docs: Vec<Document>,
    backend: &dyn Backend,
    db: &str,
    from: &str,
    local_field: Option<&str>,
    foreign_field: Option<&str>,
    as_field: &str,
    let_vars: Option<&Document>,
    pipeline: Option<&Vec<Bson>>,
    outer_vars: &HashMap<String, Bson>,
) -> anyhow::Result<Vec<Document>> {
    let mut result = Vec::new();

    if let (Some(local), Some(foreign)) = (local_field, foreign_field) {
        // Simple form: left outer join on localField == foreignField.
        for doc in docs {
            let local_val = doc.get(local).cloned();

            let matches = if let Some(val) = local_val {
                let mut filter = Document::new();
                filter.insert(foreign.to_string(), val);
                backend
                    .find(db, from, &filter, &FindOptions::default())
                    .await?
            } else {
                Vec::new()
            };

            let mut new_doc = doc.clone();
            new_doc.insert(
                as_field.to_string(),
                Bson::Array(matches.into_iter().map(Bson::Document).collect()),
            );
            result.push(new_doc);
        }
    } else if let Some(pipe) = pipeline {
        for doc in docs {
            let mut vars = outer_vars.clone();

            if let Some(let_doc) = let_vars {
                for (key, value) in let_doc.iter() {
                    let ctx = ExprEvalContext::with_vars(doc.clone(), doc.clone(), vars.clone());
                    let expr = parse_expr(value)?;
                    let evaluated = eval_expr(&expr, &ctx)?;
                    vars.insert(key.clone(), evaluated);
                }
            }

            // Only $match/$project/$addFields/$limit sub-stages are honored here;
            // anything richer should be expressed as a top-level pipeline with $lookup+$unwind.
            let mut stages = Vec::new();
            for stage_bson in pipe.iter() {
                if let Bson::Document(stage_doc) = stage_bson
                    && let Some((stage_name, stage_value)) = stage_doc.iter().next()
                {
                    match stage_name.as_str() {
                        "$match" => {
                            if let Bson::Document(filter) = stage_value {
                                stages.push(Stage::Match(filter.clone()));
                            }
                        }
                        "$project" => {
                            if let Bson::Document(spec) = stage_value {
                                stages.push(Stage::Project(spec.clone()));
                            }
                        }
                        "$addFields" => {
                            if let Bson::Document(spec) = stage_value {
                                stages.push(Stage::AddFields(spec.clone()));
                            }
                        }
                        "$limit" => {
                            if let Some(n) = stage_value.as_i64().or_else(|| stage_value.as_i32().map(i64::from)) {
                                stages.push(Stage::Limit(n));
                            }
                        }
                        _ => {}
                    }
                }
            }

            let mut pipeline_docs = backend
                .find(db, from, &Document::new(), &FindOptions::default())
                .await?;

            for stage in stages {
                pipeline_docs = match stage {
                    Stage::Match(filter) => {
                        crate::aggregation::stages::match_stage::execute(pipeline_docs, &filter)?
                    }
                    Stage::Project(spec) => {
                        crate::aggregation::stages::project::execute(pipeline_docs, &spec, &vars)?
                    }
                    Stage::AddFields(spec) => {
                        crate::aggregation::stages::add_fields::execute(pipeline_docs, &spec, &vars)?
                    }
                    Stage::Limit(n) => {
                        crate::aggregation::stages::limit::execute(pipeline_docs, n)?
                    }
                    _ => pipeline_docs,
                };
            }

            let mut new_doc = doc.clone();
            new_doc.insert(
                as_field.to_string(),
                Bson::Array(pipeline_docs.into_iter().map(Bson::Document).collect()),
            );
            result.push(new_doc);
        }
    } else {
        return Err(anyhow::anyhow!(
            "$lookup requires either localField/foreignField or pipeline"
        ));
    }

    Ok(result)
}
