//! `$rankFusion` — runs two named sub-pipelines and fuses their result order
//! via Reciprocal Rank Fusion: `RRF(doc) = Σ 1/(k + rank_i)`.
use crate::aggregation::exec::{ExecContext, ExecResult, execute_pipeline};
use crate::aggregation::pipeline::{AggregateOptions, Pipeline, Stage};
use bson::{Bson, Document};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RankFusionSpec {
    pub vector_pipeline: Vec<Stage>,
    pub text_pipeline: Vec<Stage>,
    pub k: f64,
    pub limit: Option<i64>,
}

impl RankFusionSpec {
    pub fn parse(value: &Bson) -> anyhow::Result<Self> {
        let doc = value
            .as_document()
            .ok_or_else(|| anyhow::anyhow!("$rankFusion value must be a document"))?;
        let input = doc
            .get_document("input")
            .map_err(|_| anyhow::anyhow!("$rankFusion requires input"))?;
        let pipelines = input
            .get_document("pipelines")
            .map_err(|_| anyhow::anyhow!("$rankFusion requires input.pipelines"))?;

        let vector_pipeline = parse_named_pipeline(pipelines, "vector")
            .ok_or_else(|| anyhow::anyhow!("$rankFusion requires both vector and text pipelines"))??;
        let text_pipeline = parse_named_pipeline(pipelines, "text")
            .ok_or_else(|| anyhow::anyhow!("$rankFusion requires both vector and text pipelines"))??;

        let k = doc
            .get_document("combination")
            .ok()
            .and_then(|c| c.get_f64("k").ok())
            .unwrap_or(60.0);
        let limit = doc
            .get_i64("limit")
            .ok()
            .or_else(|| doc.get_i32("limit").ok().map(i64::from));

        Ok(Self {
            vector_pipeline,
            text_pipeline,
            k,
            limit,
        })
    }
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

pub async fn execute(ctx: &ExecContext<'_>, spec: &RankFusionSpec) -> anyhow::Result<Vec<Document>> {
    let vector_docs = run_sub_pipeline(ctx, spec.vector_pipeline.clone()).await?;
    let text_docs = run_sub_pipeline(ctx, spec.text_pipeline.clone()).await?;

    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut by_key: HashMap<String, Document> = HashMap::new();

    for (rank, doc) in vector_docs.into_iter().enumerate() {
        let key = doc_key(&doc);
        *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (spec.k + (rank + 1) as f64);
        by_key.entry(key).or_insert(doc);
    }
    for (rank, doc) in text_docs.into_iter().enumerate() {
        let key = doc_key(&doc);
        *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (spec.k + (rank + 1) as f64);
        by_key.entry(key).or_insert(doc);
    }

    let mut fused: Vec<(Document, f64)> = by_key
        .into_iter()
        .map(|(key, doc)| (doc, scores.get(&key).copied().unwrap_or(0.0)))
        .collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(limit) = spec.limit {
        fused.truncate(limit.max(0) as usize);
    }

    Ok(fused
        .into_iter()
        .map(|(mut doc, score)| {
            doc.insert("_rankFusionScore", Bson::Double(score));
            doc
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn identical_order_yields_2_over_k_plus_rank() {
        let mut scores: HashMap<String, f64> = HashMap::new();
        let k = 60.0;
        for (rank, id) in ["a", "b"].into_iter().enumerate() {
            *scores.entry(id.to_string()).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        }
        for (rank, id) in ["a", "b"].into_iter().enumerate() {
            *scores.entry(id.to_string()).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        }
        let expected_a = 2.0 / (k + 1.0);
        assert!((scores["a"] - expected_a).abs() < 1e-9);
        assert!(scores["a"] > scores["b"]);
    }

    #[test]
    fn doc_key_prefers_id() {
        let d = doc! { "_id": 1i32, "x": 2i32 };
        assert_eq!(doc_key(&d), Bson::Int32(1).to_string());
    }
}
