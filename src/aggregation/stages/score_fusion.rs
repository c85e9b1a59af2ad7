//! `$scoreFusion` — runs two named sub-pipelines and fuses by weighted score
//! combination, optionally min-max normalizing each pipeline's scores first.
use crate::aggregation::exec::{ExecContext, ExecResult, execute_pipeline};
use crate::aggregation::pipeline::{AggregateOptions, Pipeline, Stage};
use bson::{Bson, Document};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ScoreFusionSpec {
    pub vector_pipeline: Vec<Stage>,
    pub text_pipeline: Vec<Stage>,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub normalize_scores: bool,
    pub limit: Option<i64>,
}

impl ScoreFusionSpec {
    pub fn parse(value: &Bson) -> anyhow::Result<Self> {
        let doc = value
            .as_document()
            .ok_or_else(|| anyhow::anyhow!("$scoreFusion value must be a document"))?;
        let input = doc
            .get_document("input")
            .map_err(|_| anyhow::anyhow!("$scoreFusion requires input"))?;
        let pipelines = input
            .get_document("pipelines")
            .map_err(|_| anyhow::anyhow!("$scoreFusion requires input.pipelines"))?;

        let vector_pipeline = parse_named_pipeline(pipelines, "vector")
            .ok_or_else(|| anyhow::anyhow!("$scoreFusion requires both vector and text pipelines"))??;
        let text_pipeline = parse_named_pipeline(pipelines, "text")
            .ok_or_else(|| anyhow::anyhow!("$scoreFusion requires both vector and text pipelines"))??;

        let combination = doc.get_document("combination").ok();
        let weights = combination.and_then(|c| c.get_document("weights").ok());
        let raw_vector_weight = weights.and_then(|w| w.get_f64("vector").ok()).unwrap_or(1.0);
        let raw_text_weight = weights.and_then(|w| w.get_f64("text").ok()).unwrap_or(1.0);
        let (vector_weight, text_weight) = normalize_weights(raw_vector_weight, raw_text_weight);

        let normalize_scores = combination
            .and_then(|c| c.get_bool("normalizeScores").ok())
            .unwrap_or(false);
        let limit = doc
            .get_i64("limit")
            .ok()
            .or_else(|| doc.get_i32("limit").ok().map(i64::from));

        Ok(Self {
            vector_pipeline,
            text_pipeline,
            vector_weight,
            text_weight,
            normalize_scores,
            limit,
        })
    }
}

/// Renormalizes a pair of weights to sum to 1. `(0,0)` becomes `(0.5,0.5)`;
/// a sum already within 0.001 of 1 is accepted as-is to avoid amplifying
/// floating-point noise from hand-typed weights like `0.333 + 0.667`.
fn normalize_weights(a: f64, b: f64) -> (f64, f64) {
    let sum = a + b;
    if sum == 0.0 {
        return (0.5, 0.5);
    }
    if (sum - 1.0).abs() <= 0.001 {
        return (a, b);
    }
    (a / sum, b / sum)
}

fn parse_named_pipeline(pipelines: &Document, name: &str) -> Option<anyhow::Result<Vec<Stage>>> {
    let arr = pipelines.get_array(name).ok()?;
    Some(
        arr.iter()
            .map(|v| {
                v.as_document()
                    .ok_or_else(|| anyhow::anyhow!("pipeline stage must be a document"))
                    .and_then(Pipeline::parse_one_stage)
            })
            .collect(),
    )
}

async fn run_sub_pipeline(ctx: &ExecContext<'_>, stages: Vec<Stage>) -> anyhow::Result<Vec<Document>> {
    let pipeline = Pipeline {
        stages,
        options: AggregateOptions::default(),
    };
    match execute_pipeline(ctx, pipeline).await? {
        ExecResult::Cursor(docs) => Ok(docs),
        ExecResult::WriteOut(_) => Ok(Vec::new()),
    }
}

fn doc_key(doc: &Document) -> String {
    doc.get("_id")
        .map(|v| v.to_string())
        .unwrap_or_else(|| serde_json::to_string(doc).unwrap_or_default())
}

fn doc_score(doc: &Document) -> f64 {
    doc.get("_searchScore")
        .or_else(|| doc.get("_vectorSearchScore"))
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0)
}

fn min_max_normalize(scores: &mut HashMap<String, f64>) {
    if scores.is_empty() {
        return;
    }
    let min = scores.values().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        for v in scores.values_mut() {
            *v = 1.0;
        }
        return;
    }
    for v in scores.values_mut() {
        *v = (*v - min) / (max - min);
    }
}

pub async fn execute(ctx: &ExecContext<'_>, spec: &ScoreFusionSpec) -> anyhow::Result<Vec<Document>> {
    let vector_docs = run_sub_pipeline(ctx, spec.vector_pipeline.clone()).await?;
    let text_docs = run_sub_pipeline(ctx, spec.text_pipeline.clone()).await?;

    let mut vector_scores: HashMap<String, f64> = HashMap::new();
    let mut text_scores: HashMap<String, f64> = HashMap::new();
    let mut by_key: HashMap<String, Document> = HashMap::new();

    for doc in vector_docs {
        let key = doc_key(&doc);
        vector_scores.insert(key.clone(), doc_score(&doc));
        by_key.entry(key).or_insert(doc);
    }
    for doc in text_docs {
        let key = doc_key(&doc);
        text_scores.insert(key.clone(), doc_score(&doc));
        by_key.entry(key).or_insert(doc);
    }

    if spec.normalize_scores {
        min_max_normalize(&mut vector_scores);
        min_max_normalize(&mut text_scores);
    }

    let mut fused: Vec<(Document, f64)> = by_key
        .into_iter()
        .map(|(key, doc)| {
            let v = vector_scores.get(&key).copied().unwrap_or(0.0);
            let t = text_scores.get(&key).copied().unwrap_or(0.0);
            let combined = spec.vector_weight * v + spec.text_weight * t;
            (doc, combined)
        })
        .collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(limit) = spec.limit {
        fused.truncate(limit.max(0) as usize);
    }

    Ok(fused
        .into_iter()
        .map(|(mut doc, score)| {
            doc.insert("_scoreFusionScore", Bson::Double(score));
            doc
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_weights_become_half_half() {
        assert_eq!(normalize_weights(0.0, 0.0), (0.5, 0.5));
    }

    #[test]
    fn weights_close_to_one_are_accepted_as_is() {
        assert_eq!(normalize_weights(0.4, 0.6005), (0.4, 0.6005));
    }

    #[test]
    fn weights_renormalize_to_sum_one() {
        let (v, t) = normalize_weights(1.0, 3.0);
        assert!((v - 0.25).abs() < 1e-9);
        assert!((t - 0.75).abs() < 1e-9);
    }

    #[test]
    fn min_max_normalize_maps_to_unit_interval() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 1.0);
        scores.insert("b".to_string(), 3.0);
        min_max_normalize(&mut scores);
        assert_eq!(scores["a"], 0.0);
        assert_eq!(scores["b"], 1.0);
    }
}
