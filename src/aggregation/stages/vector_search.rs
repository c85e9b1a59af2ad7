//! `$vectorSearch` — brute-force similarity scoring over a field storing a
//! JSON array of f64 (no native ANN index in this backend; see 4.H/9).
use crate::backend::{Backend, FindOptions};
use bson::{Bson, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMetric {
    Cosine,
    DotProduct,
    Euclidean,
}

#[derive(Debug, Clone)]
pub struct VectorSearchSpec {
    pub path: String,
    pub query_vector: Vec<f64>,
    pub num_candidates: Option<i64>,
    pub limit: i64,
    pub filter: Option<Document>,
    pub metric: VectorMetric,
}

impl VectorSearchSpec {
    pub fn parse(value: &Bson) -> anyhow::Result<Self> {
        let doc = value
            .as_document()
            .ok_or_else(|| anyhow::anyhow!("$vectorSearch value must be a document"))?;
        let path = doc
            .get_str("path")
            .map_err(|_| anyhow::anyhow!("$vectorSearch requires path"))?
            .to_string();
        let query_vector = doc
            .get_array("queryVector")
            .map_err(|_| anyhow::anyhow!("$vectorSearch requires queryVector"))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .or_else(|| v.as_i32().map(f64::from))
                    .or_else(|| v.as_i64().map(|n| n as f64))
                    .ok_or_else(|| anyhow::anyhow!("queryVector elements must be numeric"))
            })
            .collect::<anyhow::Result<Vec<f64>>>()?;
        let num_candidates = doc.get_i64("numCandidates").ok();
        let limit = doc
            .get_i64("limit")
            .or_else(|_| doc.get_i32("limit").map(i64::from))
            .map_err(|_| anyhow::anyhow!("$vectorSearch requires limit"))?;
        let filter = doc.get_document("filter").ok().cloned();
        let metric = match doc.get_str("metric").unwrap_or("cosine") {
            "dotProduct" => VectorMetric::DotProduct,
            "euclidean" => VectorMetric::Euclidean,
            _ => VectorMetric::Cosine,
        };
        Ok(Self {
            path,
            query_vector,
            num_candidates,
            limit,
            filter,
            metric,
        })
    }
}

fn extract_vector(doc: &Document, path: &str) -> Option<Vec<f64>> {
    let field = doc.get(path)?;
    match field {
        Bson::Array(arr) => arr
            .iter()
            .map(|v| v.as_f64().or_else(|| v.as_i32().map(f64::from)))
            .collect(),
        _ => None,
    }
}

fn score(metric: VectorMetric, a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return f64::NEG_INFINITY;
    }
    match metric {
        VectorMetric::DotProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        VectorMetric::Euclidean => {
            let dist: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt();
            -dist
        }
        VectorMetric::Cosine => {
            let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
    }
}

pub async fn execute(
    backend: &dyn Backend,
    db: &str,
    coll: &str,
    spec: &VectorSearchSpec,
) -> anyhow::Result<Vec<Document>> {
    let candidates = spec.num_candidates.unwrap_or(spec.limit).max(spec.limit);
    let filter = spec.filter.clone().unwrap_or_default();
    let docs = backend
        .find(
            db,
            coll,
            &filter,
            &FindOptions {
                limit: Some(candidates.max(10_000)),
                ..Default::default()
            },
        )
        .await?;

    let mut scored: Vec<(Document, f64)> = docs
        .into_iter()
        .filter_map(|doc| {
            let vec = extract_vector(&doc, &spec.path)?;
            Some((doc, score(spec.metric, &spec.query_vector, &vec)))
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(spec.limit.max(0) as usize);

    Ok(scored
        .into_iter()
        .map(|(mut doc, s)| {
            doc.insert("_vectorSearchScore", Bson::Double(s));
            doc
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((score(VectorMetric::Cosine, &a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dot_product_sums_componentwise() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert_eq!(score(VectorMetric::DotProduct, &a, &b), 32.0);
    }

    #[test]
    fn mismatched_lengths_sink_to_bottom() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert_eq!(score(VectorMetric::Cosine, &a, &b), f64::NEG_INFINITY);
    }
}
