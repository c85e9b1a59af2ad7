//! SQLite-backed [`Backend`] (spec component J): one on-disk (or `:memory:`)
//! SQLite database holds every logical Mongo "database" as a table-name
//! prefix (SQLite has no Postgres-style schemas to map `db` onto directly —
//! see DESIGN.md). Each collection gets a document table plus a companion
//! FTS5 table for `$text`/`$search`. Mirrors the teacher's
//! `(id, doc, doc_bson)` table shape: `doc_json` is a flattened view used
//! only for JSON1 queries, `doc_bson` is the full-fidelity source of truth
//! returned to callers.

use super::{
    Backend, DeleteOptions, DeleteResult, FindOptions, IndexOptions, InsertResult, UpdateOptions,
    UpdateResult,
};
use crate::error::{Error, Result};
use crate::query::{build_where_from_filter, document_to_json_value, validate_name};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params_from_iter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static MEM_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

fn internal_err(e: impl std::fmt::Display) -> Error {
    Error::Internal(anyhow::anyhow!(e.to_string()))
}

/// Quotes a raw identifier for use as a SQLite table/index name, doubling any
/// embedded double quotes.
fn q_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn doc_table(db: &str, coll: &str) -> String {
    q_ident(&format!("doc__{db}__{coll}"))
}

fn fts_table(db: &str, coll: &str) -> String {
    q_ident(&format!("doc__{db}__{coll}__fts"))
}

fn idx_name(db: &str, coll: &str, name: &str) -> String {
    q_ident(&format!("idx__{db}__{coll}__{name}"))
}

/// A stable text key for a document's `_id`, used as the table's TEXT
/// PRIMARY KEY so duplicate inserts surface as a UNIQUE constraint failure.
fn id_key(id: &Bson) -> String {
    serde_json::to_string(&crate::query::bson_to_json_value(id)).unwrap_or_default()
}

/// Flattens a document's string leaves into one space-joined body, used as
/// the generic full-text index content: coarser than a per-field FTS schema,
/// but sufficient for `$text`/`$search` without knowing ahead of time which
/// fields a text index was declared over.
fn text_body(doc: &Document) -> String {
    fn walk(value: &Bson, out: &mut String) {
        match value {
            Bson::String(s) => {
                out.push_str(s);
                out.push(' ');
            }
            Bson::Document(d) => {
                for v in d.values() {
                    walk(v, out);
                }
            }
            Bson::Array(arr) => {
                for v in arr {
                    walk(v, out);
                }
            }
            _ => {}
        }
    }
    let mut out = String::new();
    for v in doc.values() {
        walk(v, &mut out);
    }
    out
}

fn register_regex_functions(conn: &Connection) -> rusqlite::Result<()> {
    let cache: Mutex<std::collections::HashMap<String, regex::Regex>> = Mutex::new(std::collections::HashMap::new());
    let cache = std::sync::Arc::new(cache);

    for (name, case_insensitive) in [("oxlite_regex", false), ("oxlite_regex_ci", true)] {
        let cache = cache.clone();
        conn.create_scalar_function(
            name,
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| {
                let pattern: String = ctx.get(0)?;
                let value: Option<String> = ctx.get(1)?;
                let value = match value {
                    Some(v) => v,
                    None => return Ok(0i64),
                };
                let key = if case_insensitive { format!("(?i){pattern}") } else { pattern.clone() };
                let mut cache = cache.lock().unwrap();
                let re = match cache.get(&key) {
                    Some(re) => re.clone(),
                    None => {
                        let re = regex::Regex::new(&key)
                            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
                        cache.insert(key.clone(), re.clone());
                        re
                    }
                };
                Ok(if re.is_match(&value) { 1i64 } else { 0i64 })
            },
        )?;
    }
    Ok(())
}

#[derive(Debug)]
struct ConnectionInit;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionInit {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", "WAL").or_else(|_| conn.pragma_update(None, "journal_mode", "MEMORY"))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        register_regex_functions(conn)?;
        Ok(())
    }
}

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _oxlitedb_databases (db TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS _oxlitedb_collections (
    db TEXT NOT NULL,
    coll TEXT NOT NULL,
    PRIMARY KEY (db, coll)
);
CREATE TABLE IF NOT EXISTS _oxlitedb_indexes (
    db TEXT NOT NULL,
    coll TEXT NOT NULL,
    name TEXT NOT NULL,
    keys_json TEXT NOT NULL,
    unique_idx INTEGER NOT NULL DEFAULT 0,
    text_language TEXT,
    PRIMARY KEY (db, coll, name)
);
"#;

impl SqliteStore {
    pub fn connect(db_path: &str, pool_size: u32) -> Result<Self> {
        // A plain `SqliteConnectionManager::memory()` hands out a fresh,
        // independent in-memory database on every pool checkout, which
        // silently drops writes once `pool_size > 1` and two calls land on
        // different connections. Use a named shared-cache URI instead so
        // every connection in the pool sees the same in-memory database.
        let manager = if db_path == ":memory:" {
            let id = MEM_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let uri = format!("file:oxlitedb_mem_{id}?mode=memory&cache=shared");
            SqliteConnectionManager::file(uri).with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            SqliteConnectionManager::file(db_path)
        };
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_customizer(Box::new(ConnectionInit))
            .build(manager)
            .map_err(internal_err)?;

        let conn = pool.get().map_err(internal_err)?;
        conn.execute_batch(BOOTSTRAP_SQL).map_err(internal_err)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(internal_err)
    }

    fn ensure_database_sync(conn: &Connection, db: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO _oxlitedb_databases(db) VALUES (?1)",
            [db],
        )?;
        Ok(())
    }

    fn ensure_collection_sync(conn: &Connection, db: &str, coll: &str) -> rusqlite::Result<()> {
        Self::ensure_database_sync(conn, db)?;
        let table = doc_table(db, coll);
        let fts = fts_table(db, coll);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, doc_json TEXT NOT NULL, doc_bson BLOB NOT NULL);
             CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(body, content='', tokenize='unicode61');"
        ))?;
        conn.execute(
            "INSERT OR IGNORE INTO _oxlitedb_collections(db, coll) VALUES (?1, ?2)",
            [db, coll],
        )?;
        Ok(())
    }

    fn fts_upsert(conn: &Connection, db: &str, coll: &str, rowid: i64, body: &str) -> rusqlite::Result<()> {
        let fts = fts_table(db, coll);
        conn.execute(&format!("DELETE FROM {fts} WHERE rowid = ?1"), [rowid])?;
        conn.execute(&format!("INSERT INTO {fts}(rowid, body) VALUES (?1, ?2)"), rusqlite::params![rowid, body])?;
        Ok(())
    }

    fn fts_delete(conn: &Connection, db: &str, coll: &str, rowid: i64) -> rusqlite::Result<()> {
        let fts = fts_table(db, coll);
        conn.execute(&format!("DELETE FROM {fts} WHERE rowid = ?1"), [rowid])?;
        Ok(())
    }

    fn row_to_document(bytes: &[u8]) -> Result<Document> {
        bson::from_slice(bytes).map_err(|e| internal_err(format!("corrupt stored document: {e}")))
    }
}

#[async_trait]
impl Backend for SqliteStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut stmt = conn
                .prepare("SELECT db FROM _oxlitedb_databases ORDER BY db")
                .map_err(internal_err)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(internal_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(internal_err)
        })
        .await
        .map_err(internal_err)?
    }

    async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let db = db.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut stmt = conn
                .prepare("SELECT coll FROM _oxlitedb_collections WHERE db = ?1 ORDER BY coll")
                .map_err(internal_err)?;
            let rows = stmt.query_map([&db], |r| r.get::<_, String>(0)).map_err(internal_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(internal_err)
        })
        .await
        .map_err(internal_err)?
    }

    async fn create_collection(&self, db: &str, coll: &str) -> Result<()> {
        validate_name(db)?;
        validate_name(coll)?;
        let conn = self.conn()?;
        let (db, coll) = (db.to_string(), coll.to_string());
        tokio::task::spawn_blocking(move || Self::ensure_collection_sync(&conn, &db, &coll).map_err(internal_err))
            .await
            .map_err(internal_err)?
    }

    async fn drop_collection(&self, db: &str, coll: &str) -> Result<bool> {
        let conn = self.conn()?;
        let (db, coll) = (db.to_string(), coll.to_string());
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let existed: bool = conn
                .query_row(
                    "SELECT 1 FROM _oxlitedb_collections WHERE db = ?1 AND coll = ?2",
                    [&db, &coll],
                    |_| Ok(true),
                )
                .optional()
                .map_err(internal_err)?
                .unwrap_or(false);
            if existed {
                let table = doc_table(&db, &coll);
                let fts = fts_table(&db, &coll);
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}; DROP TABLE IF EXISTS {fts};"))
                    .map_err(internal_err)?;
                conn.execute(
                    "DELETE FROM _oxlitedb_collections WHERE db = ?1 AND coll = ?2",
                    [&db, &coll],
                )
                .map_err(internal_err)?;
                conn.execute(
                    "DELETE FROM _oxlitedb_indexes WHERE db = ?1 AND coll = ?2",
                    [&db, &coll],
                )
                .map_err(internal_err)?;
            }
            Ok(existed)
        })
        .await
        .map_err(internal_err)?
    }

    async fn drop_database(&self, db: &str) -> Result<()> {
        let colls = self.list_collections(db).await?;
        for coll in colls {
            self.drop_collection(db, &coll).await?;
        }
        let conn = self.conn()?;
        let db = db.to_string();
        tokio::task::spawn_blocking(move || {
            conn.execute("DELETE FROM _oxlitedb_databases WHERE db = ?1", [&db])
                .map_err(internal_err)
        })
        .await
        .map_err(internal_err)??;
        Ok(())
    }

    async fn insert(&self, db: &str, coll: &str, docs: Vec<Document>) -> Result<InsertResult> {
        let conn = self.conn()?;
        let (db, coll) = (db.to_string(), coll.to_string());
        tokio::task::spawn_blocking(move || -> Result<InsertResult> {
            Self::ensure_collection_sync(&conn, &db, &coll).map_err(internal_err)?;
            let table = doc_table(&db, &coll);
            let mut result = InsertResult::default();

            for (idx, mut doc) in docs.into_iter().enumerate() {
                if !doc.contains_key("_id") {
                    doc.insert("_id", Bson::ObjectId(bson::oid::ObjectId::new()));
                }
                let id = doc.get("_id").cloned().unwrap();
                let key = id_key(&id);
                let json = serde_json::to_string(&document_to_json_value(&doc)).map_err(internal_err)?;
                let bytes = bson::to_vec(&doc).map_err(internal_err)?;

                let outcome = conn.execute(
                    &format!("INSERT INTO {table}(id, doc_json, doc_bson) VALUES (?1, ?2, ?3)"),
                    rusqlite::params![key, json, bytes],
                );
                match outcome {
                    Ok(_) => {
                        let rowid = conn.last_insert_rowid();
                        Self::fts_upsert(&conn, &db, &coll, rowid, &text_body(&doc)).map_err(internal_err)?;
                        result.inserted_ids.push(doc! { "_id": id });
                    }
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        result
                            .write_errors
                            .push((idx, 11000, format!("duplicate key error for _id {key}")));
                    }
                    Err(e) => return Err(internal_err(e)),
                }
            }
            Ok(result)
        })
        .await
        .map_err(internal_err)?
    }

    async fn find(&self, db: &str, coll: &str, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        let where_clause = build_where_from_filter(filter)?;
        let order_by = sort_to_order_by(options.sort.as_ref());
        self.raw_find(
            db,
            coll,
            &where_clause.sql,
            where_clause.params,
            order_by,
            options.limit,
            options.skip,
        )
        .await
        .map(|docs| apply_projection_all(docs, options.projection.as_ref()))
    }

    async fn count(&self, db: &str, coll: &str, filter: &Document) -> Result<i64> {
        let where_clause = build_where_from_filter(filter)?;
        let conn = self.conn()?;
        let (db, coll) = (db.to_string(), coll.to_string());
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let table = doc_table(&db, &coll);
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM _oxlitedb_collections WHERE db = ?1 AND coll = ?2",
                    [&db, &coll],
                    |_| Ok(true),
                )
                .optional()
                .map_err(internal_err)?
                .unwrap_or(false);
            if !exists {
                return Ok(0);
            }
            let sql = format!("SELECT COUNT(*) FROM {table} WHERE {}", where_clause.sql);
            conn.query_row(&sql, params_from_iter(where_clause.params.iter()), |r| r.get::<_, i64>(0))
                .map_err(internal_err)
        })
        .await
        .map_err(internal_err)?
    }

    async fn update(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update_doc: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        let where_clause = build_where_from_filter(filter)?;
        let conn = self.conn()?;
        let (db, coll, update_doc, multi, upsert) =
            (db.to_string(), coll.to_string(), update_doc.clone(), options.multi, options.upsert);
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || -> Result<UpdateResult> {
            Self::ensure_collection_sync(&conn, &db, &coll).map_err(internal_err)?;
            let table = doc_table(&db, &coll);
            let sql = format!("SELECT rowid, doc_bson FROM {table} WHERE {}", where_clause.sql);
            let mut stmt = conn.prepare(&sql).map_err(internal_err)?;
            let mut rows = stmt
                .query_map(params_from_iter(where_clause.params.iter()), |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
                })
                .map_err(internal_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(internal_err)?;
            if !multi {
                rows.truncate(1);
            }

            let mut result = UpdateResult::default();
            result.matched_count = rows.len() as i64;

            for (rowid, bytes) in rows {
                let mut doc = Self::row_to_document(&bytes)?;
                let changed = crate::update::apply_update(&mut doc, &update_doc).map_err(internal_err)?;
                if changed {
                    let key = id_key(doc.get("_id").unwrap_or(&Bson::Null));
                    let json = serde_json::to_string(&document_to_json_value(&doc)).map_err(internal_err)?;
                    let new_bytes = bson::to_vec(&doc).map_err(internal_err)?;
                    conn.execute(
                        &format!("UPDATE {table} SET id = ?1, doc_json = ?2, doc_bson = ?3 WHERE rowid = ?4"),
                        rusqlite::params![key, json, new_bytes, rowid],
                    )
                    .map_err(internal_err)?;
                    Self::fts_upsert(&conn, &db, &coll, rowid, &text_body(&doc)).map_err(internal_err)?;
                    result.modified_count += 1;
                }
            }

            if result.matched_count == 0 && upsert {
                let mut new_doc = filter_to_upsert_seed(&filter);
                crate::update::apply_update(&mut new_doc, &update_doc).map_err(internal_err)?;
                if !new_doc.contains_key("_id") {
                    new_doc.insert("_id", Bson::ObjectId(bson::oid::ObjectId::new()));
                }
                let id = new_doc.get("_id").cloned().unwrap();
                let key = id_key(&id);
                let json = serde_json::to_string(&document_to_json_value(&new_doc)).map_err(internal_err)?;
                let bytes = bson::to_vec(&new_doc).map_err(internal_err)?;
                conn.execute(
                    &format!("INSERT INTO {table}(id, doc_json, doc_bson) VALUES (?1, ?2, ?3)"),
                    rusqlite::params![key, json, bytes],
                )
                .map_err(internal_err)?;
                let rowid = conn.last_insert_rowid();
                Self::fts_upsert(&conn, &db, &coll, rowid, &text_body(&new_doc)).map_err(internal_err)?;
                result.upserted_id = Some(id);
            }

            Ok(result)
        })
        .await
        .map_err(internal_err)?
    }

    async fn delete(&self, db: &str, coll: &str, filter: &Document, options: &DeleteOptions) -> Result<DeleteResult> {
        let where_clause = build_where_from_filter(filter)?;
        let conn = self.conn()?;
        let (db, coll, multi) = (db.to_string(), coll.to_string(), options.multi);
        tokio::task::spawn_blocking(move || -> Result<DeleteResult> {
            let table = doc_table(&db, &coll);
            let sql = format!("SELECT rowid FROM {table} WHERE {}", where_clause.sql);
            let mut stmt = match conn.prepare(&sql) {
                Ok(s) => s,
                Err(_) => return Ok(DeleteResult::default()),
            };
            let mut rowids: Vec<i64> = stmt
                .query_map(params_from_iter(where_clause.params.iter()), |r| r.get::<_, i64>(0))
                .map_err(internal_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(internal_err)?;
            if !multi {
                rowids.truncate(1);
            }
            for rowid in &rowids {
                conn.execute(&format!("DELETE FROM {table} WHERE rowid = ?1"), [rowid])
                    .map_err(internal_err)?;
                Self::fts_delete(&conn, &db, &coll, *rowid).map_err(internal_err)?;
            }
            Ok(DeleteResult { deleted_count: rowids.len() as i64 })
        })
        .await
        .map_err(internal_err)?
    }

    async fn create_index(&self, db: &str, coll: &str, keys: &Document, options: &IndexOptions) -> Result<String> {
        let conn = self.conn()?;
        let (db, coll, keys, options) = (db.to_string(), coll.to_string(), keys.clone(), options.clone());
        tokio::task::spawn_blocking(move || -> Result<String> {
            Self::ensure_collection_sync(&conn, &db, &coll).map_err(internal_err)?;
            let is_text = keys.iter().any(|(_, v)| v.as_str() == Some("text"));
            let name = options.name.clone().unwrap_or_else(|| default_index_name(&keys));
            let keys_json = serde_json::to_string(&document_to_json_value(&keys)).map_err(internal_err)?;

            if !is_text {
                let table = doc_table(&db, &coll);
                let index_ident = idx_name(&db, &coll, &name);
                let cols: Vec<String> = keys
                    .keys()
                    .map(|field| format!("json_extract(doc_json, '$.{field}')"))
                    .collect();
                let unique_sql = if options.unique { "UNIQUE" } else { "" };
                conn.execute(
                    &format!("CREATE {unique_sql} INDEX IF NOT EXISTS {index_ident} ON {table}({})", cols.join(", ")),
                    [],
                )
                .map_err(internal_err)?;
            }

            conn.execute(
                "INSERT OR REPLACE INTO _oxlitedb_indexes(db, coll, name, keys_json, unique_idx, text_language) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![db, coll, name, keys_json, options.unique as i64, options.text_language],
            )
            .map_err(internal_err)?;
            Ok(name)
        })
        .await
        .map_err(internal_err)?
    }

    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let (db, coll, name) = (db.to_string(), coll.to_string(), name.to_string());
        tokio::task::spawn_blocking(move || -> Result<()> {
            let index_ident = idx_name(&db, &coll, &name);
            conn.execute(&format!("DROP INDEX IF EXISTS {index_ident}"), []).map_err(internal_err)?;
            conn.execute(
                "DELETE FROM _oxlitedb_indexes WHERE db = ?1 AND coll = ?2 AND name = ?3",
                [&db, &coll, &name],
            )
            .map_err(internal_err)?;
            Ok(())
        })
        .await
        .map_err(internal_err)?
    }

    async fn list_indexes(&self, db: &str, coll: &str) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let (db, coll) = (db.to_string(), coll.to_string());
        tokio::task::spawn_blocking(move || -> Result<Vec<Document>> {
            let mut stmt = conn
                .prepare("SELECT name, keys_json, unique_idx FROM _oxlitedb_indexes WHERE db = ?1 AND coll = ?2 ORDER BY name")
                .map_err(internal_err)?;
            let rows = stmt
                .query_map([&db, &coll], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
                })
                .map_err(internal_err)?;
            let mut out = Vec::new();
            for row in rows {
                let (name, keys_json, unique_idx) = row.map_err(internal_err)?;
                let keys_value: serde_json::Value = serde_json::from_str(&keys_json).map_err(internal_err)?;
                let keys_doc: Document = bson::to_document(&keys_value).unwrap_or_default();
                out.push(doc! { "name": &name, "key": keys_doc, "unique": unique_idx != 0 });
            }
            Ok(out)
        })
        .await
        .map_err(internal_err)?
    }

    async fn text_search(&self, db: &str, coll: &str, match_expr: &str, limit: Option<i64>, with_score: bool) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let (db, coll, match_expr) = (db.to_string(), coll.to_string(), match_expr.to_string());
        tokio::task::spawn_blocking(move || -> Result<Vec<Document>> {
            let table = doc_table(&db, &coll);
            let fts = fts_table(&db, &coll);
            let limit_sql = limit.map(|n| format!("LIMIT {n}")).unwrap_or_default();
            let sql = format!(
                "SELECT t.doc_bson, -bm25({fts}) AS score FROM {fts} JOIN {table} t ON t.rowid = {fts}.rowid WHERE {fts} MATCH ?1 ORDER BY score DESC {limit_sql}"
            );
            let mut stmt = conn.prepare(&sql).map_err(internal_err)?;
            let rows = stmt
                .query_map([&match_expr], |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, f64>(1)?)))
                .map_err(internal_err)?;
            let mut out = Vec::new();
            for row in rows {
                let (bytes, score) = row.map_err(internal_err)?;
                let mut d = Self::row_to_document(&bytes)?;
                if with_score {
                    d.insert("_searchScore", Bson::Double(score));
                }
                out.push(d);
            }
            Ok(out)
        })
        .await
        .map_err(internal_err)?
    }

    async fn raw_find(
        &self,
        db: &str,
        coll: &str,
        where_sql: &str,
        params: Vec<SqlValue>,
        order_by: Option<String>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let (db, coll, where_sql) = (db.to_string(), coll.to_string(), where_sql.to_string());
        tokio::task::spawn_blocking(move || -> Result<Vec<Document>> {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM _oxlitedb_collections WHERE db = ?1 AND coll = ?2",
                    [&db, &coll],
                    |_| Ok(true),
                )
                .optional()
                .map_err(internal_err)?
                .unwrap_or(false);
            if !exists {
                return Ok(Vec::new());
            }
            let table = doc_table(&db, &coll);
            let mut sql = format!("SELECT doc_bson FROM {table} WHERE {where_sql}");
            if let Some(order) = &order_by {
                sql.push_str(" ORDER BY ");
                sql.push_str(order);
            }
            if let Some(n) = limit {
                sql.push_str(&format!(" LIMIT {n}"));
            }
            if let Some(n) = offset {
                if limit.is_none() {
                    sql.push_str(" LIMIT -1");
                }
                sql.push_str(&format!(" OFFSET {n}"));
            }
            let mut stmt = conn.prepare(&sql).map_err(internal_err)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |r| r.get::<_, Vec<u8>>(0))
                .map_err(internal_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(Self::row_to_document(&row.map_err(internal_err)?)?);
            }
            Ok(out)
        })
        .await
        .map_err(internal_err)?
    }
}

/// Builds an `ORDER BY` fragment from a Mongo sort document (`1`/`-1` per
/// field); returns `None` for an empty or absent sort so callers omit the
/// clause entirely.
fn sort_to_order_by(sort: Option<&Document>) -> Option<String> {
    let sort = sort?;
    if sort.is_empty() {
        return None;
    }
    let parts: Vec<String> = sort
        .iter()
        .map(|(field, dir)| {
            let desc = matches!(dir, Bson::Int32(n) if *n < 0) || matches!(dir, Bson::Int64(n) if *n < 0);
            let extract = format!("json_extract(doc_json, '$.{}')", field.replace('\'', "''"));
            format!("{extract} {}", if desc { "DESC" } else { "ASC" })
        })
        .collect();
    Some(parts.join(", "))
}

fn default_index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(k, v)| format!("{k}_{}", v.as_i32().or_else(|| v.as_i64().map(|n| n as i32)).unwrap_or(1)))
        .collect::<Vec<_>>()
        .join("_")
}

/// Seeds a fresh document for an upsert from the equality terms of `filter`
/// (dotted/operator terms are skipped — Mongo does the same).
fn filter_to_upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter.iter() {
        if key.starts_with('$') || key.contains('.') {
            continue;
        }
        if matches!(value, Bson::Document(d) if d.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)) {
            continue;
        }
        seed.insert(key.clone(), value.clone());
    }
    seed
}

fn apply_projection_all(docs: Vec<Document>, projection: Option<&Document>) -> Vec<Document> {
    match projection {
        None => docs,
        Some(p) => docs.into_iter().map(|d| apply_projection(d, p)).collect(),
    }
}

/// Applies a Mongo projection document in memory. An inclusion projection
/// (any non-`_id` value truthy) keeps only the named fields plus `_id`
/// (unless `_id` is explicitly excluded); an exclusion projection removes
/// the named fields and keeps everything else.
fn apply_projection(doc: Document, projection: &Document) -> Document {
    let id_excluded = matches!(projection.get("_id"), Some(v) if !truthy(v));
    let is_inclusion = projection
        .iter()
        .filter(|(k, _)| *k != "_id")
        .any(|(_, v)| truthy(v));

    if !is_inclusion {
        let mut out = doc;
        for (k, v) in projection.iter() {
            if k != "_id" && !truthy(v) {
                out.remove(k);
            }
        }
        if id_excluded {
            out.remove("_id");
        }
        return out;
    }

    let mut out = Document::new();
    if !id_excluded {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (k, v) in projection.iter() {
        if k == "_id" || !truthy(v) {
            continue;
        }
        if let Some(value) = doc.get(k) {
            out.insert(k.clone(), value.clone());
        }
    }
    out
}

fn truthy(v: &Bson) -> bool {
    match v {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(d) => *d != 0.0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeleteOptions, FindOptions, IndexOptions, UpdateOptions};

    fn store() -> SqliteStore {
        SqliteStore::connect(":memory:", 2).unwrap()
    }

    #[tokio::test]
    async fn insert_and_find_roundtrips() {
        let s = store();
        s.insert("db", "c", vec![doc! { "name": "a" }, doc! { "name": "b" }]).await.unwrap();
        let docs = s.find("db", "c", &Document::new(), &FindOptions::default()).await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_id_reports_write_error() {
        let s = store();
        let r1 = s.insert("db", "c", vec![doc! { "_id": 1i32 }]).await.unwrap();
        assert_eq!(r1.write_errors.len(), 0);
        let r2 = s.insert("db", "c", vec![doc! { "_id": 1i32 }]).await.unwrap();
        assert_eq!(r2.write_errors.len(), 1);
        assert_eq!(r2.write_errors[0].1, 11000);
    }

    #[tokio::test]
    async fn filter_matches_nested_field() {
        let s = store();
        s.insert("db", "c", vec![doc! { "a": { "b": 1i32 } }, doc! { "a": { "b": 2i32 } }])
            .await
            .unwrap();
        let filter = doc! { "a.b": 2i32 };
        let docs = s.find("db", "c", &filter, &FindOptions::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn update_applies_set_operator() {
        let s = store();
        s.insert("db", "c", vec![doc! { "_id": 1i32, "n": 1i32 }]).await.unwrap();
        let result = s
            .update("db", "c", &doc! { "_id": 1i32 }, &doc! { "$set": { "n": 5i32 } }, &UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(result.modified_count, 1);
        let docs = s.find("db", "c", &doc! { "_id": 1i32 }, &FindOptions::default()).await.unwrap();
        assert_eq!(docs[0].get_i32("n").unwrap(), 5);
    }

    #[tokio::test]
    async fn upsert_inserts_when_no_match() {
        let s = store();
        let result = s
            .update(
                "db",
                "c",
                &doc! { "sku": "abc" },
                &doc! { "$set": { "qty": 3i32 } },
                &UpdateOptions { upsert: true, multi: false },
            )
            .await
            .unwrap();
        assert!(result.upserted_id.is_some());
        let docs = s.find("db", "c", &Document::new(), &FindOptions::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_str("sku").unwrap(), "abc");
    }

    #[tokio::test]
    async fn delete_removes_matching_rows() {
        let s = store();
        s.insert("db", "c", vec![doc! { "x": 1i32 }, doc! { "x": 1i32 }]).await.unwrap();
        let result = s
            .delete("db", "c", &doc! { "x": 1i32 }, &DeleteOptions { multi: true })
            .await
            .unwrap();
        assert_eq!(result.deleted_count, 2);
    }

    #[tokio::test]
    async fn text_search_finds_indexed_words() {
        let s = store();
        s.insert("db", "c", vec![doc! { "body": "the quick fox" }, doc! { "body": "lazy dog" }])
            .await
            .unwrap();
        let docs = s.text_search("db", "c", "quick", None, true).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains_key("_searchScore"));
    }

    #[tokio::test]
    async fn create_index_then_list() {
        let s = store();
        s.create_collection("db", "c").await.unwrap();
        let name = s
            .create_index("db", "c", &doc! { "a": 1i32 }, &IndexOptions::default())
            .await
            .unwrap();
        let indexes = s.list_indexes("db", "c").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].get_str("name").unwrap(), name);
    }

    #[tokio::test]
    async fn regex_operator_matches() {
        let s = store();
        s.insert("db", "c", vec![doc! { "name": "hello" }, doc! { "name": "world" }]).await.unwrap();
        let docs = s.find("db", "c", &doc! { "name": { "$regex": "^h" } }, &FindOptions::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
    }
}
