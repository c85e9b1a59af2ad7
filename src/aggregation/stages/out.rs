use crate::aggregation::exec::WriteStats;
use crate::backend::Backend;
use bson::Document;

/// No rename-table primitive exists on the storage boundary, so `$out` drops
/// and fully reinserts the target collection instead of swapping a temp table in.
pub async fn execute(
    docs: Vec<Document>,
    backend: &dyn Backend,
    db: &str,
    target_coll: &str,
) -> anyhow::Result<WriteStats> {
    let mut stats = WriteStats::default();

    backend.drop_collection(db, target_coll).await?;
    backend.create_collection(db, target_coll).await?;

    if !docs.is_empty() {
        let count = docs.len() as i64;
        let result = backend.insert(db, target_coll, docs).await?;
        stats.inserted_count += count - result.write_errors.len() as i64;
    }

    Ok(stats)
}
