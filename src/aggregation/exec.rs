use crate::aggregation::memory::MemoryManager;
use crate::aggregation::pipeline::{Pipeline, Stage};
use crate::backend::{Backend, FindOptions};
use bson::{Bson, Document};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;

/// Execution context threaded through a pipeline run and all of its nested
/// sub-pipelines (`$lookup` pipeline form, `$unionWith`, `$facet`,
/// `$rankFusion`/`$scoreFusion`).
pub struct ExecContext<'a> {
    pub backend: &'a dyn Backend,
    pub db: String,
    pub coll: String,
    pub memory: MemoryManager,
    pub vars: HashMap<String, Bson>,
    pub facet_concurrency: usize,
}

impl<'a> ExecContext<'a> {
    pub fn new(backend: &'a dyn Backend, db: String, coll: String, allow_disk_use: bool) -> Self {
        Self {
            backend,
            db,
            coll,
            memory: MemoryManager::new(allow_disk_use),
            vars: HashMap::new(),
            facet_concurrency: 3,
        }
    }

    pub fn with_vars(
        backend: &'a dyn Backend,
        db: String,
        coll: String,
        allow_disk_use: bool,
        vars: HashMap<String, Bson>,
    ) -> Self {
        Self {
            backend,
            db,
            coll,
            memory: MemoryManager::new(allow_disk_use),
            vars,
            facet_concurrency: 3,
        }
    }

    pub fn with_facet_concurrency(mut self, n: usize) -> Self {
        self.facet_concurrency = n.max(1);
        self
    }

    /// A context sharing this one's backend/namespace/concurrency but scoped
    /// to its own variable bindings and memory accounting — used for a
    /// `$facet`/`$unionWith`/fusion sub-pipeline.
    fn child(&self, vars: HashMap<String, Bson>) -> ExecContext<'_> {
        ExecContext {
            backend: self.backend,
            db: self.db.clone(),
            coll: self.coll.clone(),
            memory: MemoryManager::new(self.memory.allow_disk_use()),
            vars,
            facet_concurrency: self.facet_concurrency,
        }
    }
}

/// Execution result
pub enum ExecResult {
    Cursor(Vec<Document>),
    WriteOut(WriteStats),
}

/// Write statistics for $out/$merge
#[derive(Debug, Default)]
pub struct WriteStats {
    pub matched_count: i64,
    pub modified_count: i64,
    pub inserted_count: i64,
    pub deleted_count: i64,
}

/// Outcome of applying a single stage to an in-memory batch: either the
/// pipeline keeps going with a new batch, or the stage is terminal
/// (`$out`/`$merge`) and short-circuits the rest of the pipeline.
enum StageOutcome {
    Continue(Vec<Document>),
    Terminal(WriteStats),
}

/// Whether `stage` sources its own documents from the backend rather than
/// expecting the caller to have already fetched the collection.
fn is_self_sourcing(stage: &Stage) -> bool {
    matches!(
        stage,
        Stage::Match(_) | Stage::Search(_) | Stage::VectorSearch(_) | Stage::GeoNear(_)
    )
}

/// Executes a full pipeline: fetches the initial document batch from the
/// backend (pushing the leading `$match`/`$search`/`$vectorSearch`/`$geoNear`
/// down where possible) and then applies each stage in turn.
pub async fn execute_pipeline(
    ctx: &ExecContext<'_>,
    pipeline: Pipeline,
) -> anyhow::Result<ExecResult> {
    let mut docs: Vec<Document> = Vec::new();
    let mut fetched = false;

    for stage in pipeline.stages {
        if !fetched && !is_self_sourcing(&stage) {
            docs = ctx
                .backend
                .find(&ctx.db, &ctx.coll, &Document::new(), &FindOptions::default())
                .await?;
            fetched = true;
        }

        match apply_stage(ctx, docs, stage, fetched).await? {
            StageOutcome::Continue(next) => docs = next,
            StageOutcome::Terminal(stats) => return Ok(ExecResult::WriteOut(stats)),
        }
        fetched = true;
    }

    Ok(ExecResult::Cursor(docs))
}

/// Applies one stage to `docs`, fetching from the backend itself for
/// self-sourcing stages (`$match`/`$search`/`$vectorSearch`/`$geoNear`) when
/// `docs` hasn't been populated yet. `fetched` is threaded in by the caller
/// rather than inferred from `docs.is_empty()` — an empty `docs` can
/// legitimately be the real output of an earlier stage (e.g. a leading
/// `$match` that excludes everything), and re-sourcing the collection in
/// that case would silently undo it.
async fn apply_stage(
    ctx: &ExecContext<'_>,
    docs: Vec<Document>,
    stage: Stage,
    fetched: bool,
) -> anyhow::Result<StageOutcome> {
    let next = match stage {
        Stage::Match(filter) => {
            if !fetched {
                ctx.backend
                    .find(&ctx.db, &ctx.coll, &filter, &FindOptions::default())
                    .await?
            } else {
                crate::aggregation::stages::match_stage::execute(docs, &filter)?
            }
        }
        Stage::Project(spec) => crate::aggregation::stages::project::execute(docs, &spec, &ctx.vars)?,
        Stage::AddFields(spec) => crate::aggregation::stages::add_fields::execute(docs, &spec, &ctx.vars)?,
        Stage::Set(spec) => crate::aggregation::stages::set::execute(docs, &spec, &ctx.vars)?,
        Stage::Unset(fields) => crate::aggregation::stages::unset::execute(docs, &fields)?,
        Stage::ReplaceRoot { replacement } => {
            crate::aggregation::stages::replace_root::execute(docs, &replacement)?
        }
        Stage::ReplaceWith(replacement) => {
            crate::aggregation::stages::replace_root::execute(docs, &replacement)?
        }
        Stage::Sort(spec) => crate::aggregation::stages::sort::execute(docs, &spec)?,
        Stage::Limit(n) => crate::aggregation::stages::limit::execute(docs, n)?,
        Stage::Skip(n) => crate::aggregation::stages::skip::execute(docs, n)?,
        Stage::Count(field) => crate::aggregation::stages::count::execute(docs, &field)?,
        Stage::Group { id, accumulators } => {
            crate::aggregation::stages::group::execute(docs, &id, &accumulators, &ctx.vars)?
        }
        Stage::Bucket {
            group_by,
            boundaries,
            default,
            output,
        } => crate::aggregation::stages::bucket::execute(
            docs,
            &group_by,
            &boundaries,
            default.as_ref(),
            output.as_ref(),
            &ctx.vars,
        )?,
        Stage::BucketAuto {
            group_by,
            buckets,
            granularity,
            output,
        } => crate::aggregation::stages::bucket_auto::execute(
            docs,
            &group_by,
            buckets,
            granularity.as_deref(),
            output.as_ref(),
        )?,
        Stage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
            let_vars,
            pipeline,
        } => {
            crate::aggregation::stages::lookup::execute(
                docs,
                ctx.backend,
                &ctx.db,
                &from,
                local_field.as_deref(),
                foreign_field.as_deref(),
                &as_field,
                let_vars.as_ref(),
                pipeline.as_ref(),
                &ctx.vars,
            )
            .await?
        }
        Stage::Unwind {
            path,
            include_array_index,
            preserve_null_and_empty_arrays,
        } => crate::aggregation::stages::unwind::execute(
            docs,
            &path,
            include_array_index.as_deref(),
            preserve_null_and_empty_arrays,
        )?,
        Stage::Sample(size) => crate::aggregation::stages::sample::execute(docs, size)?,
        Stage::Facet(facets) => run_facets(ctx, docs, facets).await?,
        Stage::UnionWith {
            coll,
            pipeline: union_pipeline,
        } => {
            crate::aggregation::stages::union_with::execute(
                docs,
                ctx.backend,
                &ctx.db,
                &coll,
                &union_pipeline,
                &ctx.vars,
            )
            .await?
        }
        Stage::GeoNear(spec) => {
            crate::aggregation::stages::geo_near::execute(docs, ctx.backend, &ctx.db, &ctx.coll, &spec)
                .await?
        }
        Stage::Out(target_coll) => {
            let stats =
                crate::aggregation::stages::out::execute(docs, ctx.backend, &ctx.db, &target_coll)
                    .await?;
            return Ok(StageOutcome::Terminal(stats));
        }
        Stage::Merge(spec) => {
            let stats = crate::aggregation::stages::merge::execute(docs, ctx.backend, &ctx.db, &spec).await?;
            return Ok(StageOutcome::Terminal(stats));
        }
        Stage::SortByCount(expr) => crate::aggregation::stages::sort_by_count::execute(docs, &expr)?,
        Stage::SetWindowFields(spec) => {
            crate::aggregation::stages::set_window_fields::execute(docs, &spec, &ctx.vars)?
        }
        Stage::Densify(spec) => crate::aggregation::stages::densify::execute(docs, &spec)?,
        Stage::Fill(spec) => crate::aggregation::stages::fill::execute(docs, &spec)?,
        Stage::Redact(expr) => crate::aggregation::stages::redact::execute(docs, &expr, &ctx.vars)?,
        Stage::Search(spec) => {
            let match_expr = crate::aggregation::stages::search::compile(&spec.operator);
            ctx.backend
                .text_search(&ctx.db, &ctx.coll, &match_expr, None, spec.return_score)
                .await?
        }
        Stage::VectorSearch(spec) => {
            crate::aggregation::stages::vector_search::execute(ctx.backend, &ctx.db, &ctx.coll, &spec).await?
        }
        Stage::RankFusion(spec) => {
            crate::aggregation::stages::rank_fusion::execute(ctx, &spec).await?
        }
        Stage::ScoreFusion(spec) => {
            crate::aggregation::stages::score_fusion::execute(ctx, &spec).await?
        }
        Stage::Olap(spec) => crate::aggregation::stages::olap::execute(&spec).await?,
    };
    Ok(StageOutcome::Continue(next))
}

/// Runs each facet's sub-pipeline over the same input batch with bounded
/// concurrency (`ctx.facet_concurrency`, default 3) and assembles the results
/// into a single document keyed by facet name.
async fn run_facets(
    ctx: &ExecContext<'_>,
    docs: Vec<Document>,
    facets: HashMap<String, Vec<Stage>>,
) -> anyhow::Result<Vec<Document>> {
    let concurrency = ctx.facet_concurrency.max(1);
    let names: Vec<String> = facets.keys().cloned().collect();

    let results: Vec<anyhow::Result<(String, Vec<Document>)>> = stream::iter(facets.into_iter())
        .map(|(name, stages)| {
            let docs = docs.clone();
            let ctx = &*ctx;
            async move {
                let mut batch = docs;
                let sub_ctx = ctx.child(ctx.vars.clone());
                for stage in stages {
                    // Each facet sub-pipeline starts from the shared input
                    // batch, which is already fetched even when empty.
                    match apply_stage(&sub_ctx, batch, stage, true).await? {
                        StageOutcome::Continue(next) => batch = next,
                        StageOutcome::Terminal(_) => {
                            return Err(anyhow::anyhow!(
                                "$out/$merge are not allowed inside a $facet sub-pipeline"
                            ));
                        }
                    }
                }
                Ok((name, batch))
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut by_name: HashMap<String, Vec<Document>> = HashMap::new();
    for r in results {
        let (name, docs) = r?;
        by_name.insert(name, docs);
    }

    let mut out = Document::new();
    for name in names {
        let docs = by_name.remove(&name).unwrap_or_default();
        out.insert(name, Bson::Array(docs.into_iter().map(Bson::Document).collect()));
    }
    Ok(vec![out])
}
