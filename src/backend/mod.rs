//! The storage boundary (spec component J): the command handlers, translators,
//! and aggregation stages never touch SQLite directly — they go through this
//! trait, implemented by [`sqlite::SqliteStore`].

pub mod sqlite;

use async_trait::async_trait;
use bson::Document;

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
    pub multi: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub multi: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    /// Present only for a text index: the language used for FTS5 tokenization.
    pub text_language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InsertResult {
    pub inserted_ids: Vec<Document>,
    pub write_errors: Vec<(usize, i32, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    pub matched_count: i64,
    pub modified_count: i64,
    pub upserted_id: Option<bson::Bson>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteResult {
    pub deleted_count: i64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_databases(&self) -> crate::error::Result<Vec<String>>;
    async fn list_collections(&self, db: &str) -> crate::error::Result<Vec<String>>;
    async fn create_collection(&self, db: &str, coll: &str) -> crate::error::Result<()>;
    async fn drop_collection(&self, db: &str, coll: &str) -> crate::error::Result<bool>;
    async fn drop_database(&self, db: &str) -> crate::error::Result<()>;

    async fn insert(&self, db: &str, coll: &str, docs: Vec<Document>) -> crate::error::Result<InsertResult>;

    async fn find(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> crate::error::Result<Vec<Document>>;

    async fn count(&self, db: &str, coll: &str, filter: &Document) -> crate::error::Result<i64>;

    async fn update(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> crate::error::Result<UpdateResult>;

    async fn delete(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        options: &DeleteOptions,
    ) -> crate::error::Result<DeleteResult>;

    async fn create_index(
        &self,
        db: &str,
        coll: &str,
        keys: &Document,
        options: &IndexOptions,
    ) -> crate::error::Result<String>;
    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> crate::error::Result<()>;
    async fn list_indexes(&self, db: &str, coll: &str) -> crate::error::Result<Vec<Document>>;

    /// Executes a pre-built FTS5 MATCH expression against `<coll>_fts`, returning
    /// matching documents (optionally carrying a `_searchScore` field).
    async fn text_search(
        &self,
        db: &str,
        coll: &str,
        match_expr: &str,
        limit: Option<i64>,
        with_score: bool,
    ) -> crate::error::Result<Vec<Document>>;

    /// Runs `raw_where`/`params` (produced by the query translator) directly,
    /// used by the aggregation SQL pushdown path.
    async fn raw_find(
        &self,
        db: &str,
        coll: &str,
        where_sql: &str,
        params: Vec<rusqlite::types::Value>,
        order_by: Option<String>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> crate::error::Result<Vec<Document>>;
}
