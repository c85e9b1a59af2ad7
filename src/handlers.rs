//! Command handlers (spec component E): one function per Mongo command,
//! sharing the [`AppContext`] (backend + cursor manager + config) threaded in
//! from `server.rs`. Shaped like the teacher's `WriteResult::to_document`
//! convention in `session.rs` — build a `Document` reply, set `ok: 1.0` last.

use crate::backend::{Backend, DeleteOptions, FindOptions, IndexOptions, UpdateOptions};
use crate::config::Config;
use crate::cursor::CursorManager;
use crate::error::{Error, Result};
use crate::session::ConnectionState;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct AppContext {
    pub backend: Arc<dyn Backend>,
    pub cursors: Arc<CursorManager>,
    pub config: Config,
    pub boot_id: ObjectId,
    pub started_at: Instant,
    topology_counter: AtomicI64,
}

impl AppContext {
    pub fn new(backend: Arc<dyn Backend>, cursors: Arc<CursorManager>, config: Config) -> Self {
        Self {
            backend,
            cursors,
            config,
            boot_id: ObjectId::new(),
            started_at: Instant::now(),
            topology_counter: AtomicI64::new(0),
        }
    }
}

const DEFAULT_BATCH_SIZE: i64 = 101;
const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
const MAX_WRITE_BATCH_SIZE: i32 = 100_000;

pub async fn handle(ctx: &AppContext, conn: &mut ConnectionState, db: &str, name: &str, command: Document) -> Result<Document> {
    match name {
        "hello" | "ismaster" | "isMaster" => hello(ctx, conn, &command),
        "ping" => Ok(doc! { "ok": 1.0 }),
        "buildInfo" | "buildinfo" => Ok(build_info()),
        "hostInfo" => Ok(host_info()),
        "whatsmyuri" => Ok(doc! { "you": "127.0.0.1:0", "ok": 1.0 }),
        "getLog" => Ok(doc! { "totalLinesWritten": 0i64, "log": Vec::<String>::new(), "ok": 1.0 }),
        "getParameter" => Ok(doc! { "ok": 0.0, "errmsg": "no option found to get", "code": 59 }),
        "getCmdLineOpts" => Ok(doc! { "argv": Vec::<String>::new(), "parsed": {}, "ok": 1.0 }),
        "listDatabases" => list_databases(ctx).await,
        "listCollections" => list_collections(ctx, db, &command).await,
        "create" => create_collection(ctx, db, &command).await,
        "drop" => drop_collection(ctx, db, &command).await,
        "dropDatabase" => drop_database(ctx, db).await,
        "insert" => insert(ctx, db, &command).await,
        "find" => find(ctx, conn, db, &command).await,
        "count" => count(ctx, db, &command).await,
        "distinct" => distinct(ctx, db, &command).await,
        "update" => update(ctx, db, &command).await,
        "delete" => delete(ctx, db, &command).await,
        "findAndModify" | "findandmodify" => find_and_modify(ctx, db, &command).await,
        "aggregate" => aggregate(ctx, conn, db, &command).await,
        "getMore" => get_more(ctx, conn, &command).await,
        "killCursors" => kill_cursors(ctx, conn, &command).await,
        "createIndexes" => create_indexes(ctx, db, &command).await,
        "dropIndexes" => drop_indexes(ctx, db, &command).await,
        "listIndexes" => list_indexes(ctx, db, &command).await,
        "renameCollection" => rename_collection(ctx, &command).await,
        other => Err(Error::command_not_found(other)),
    }
}

fn hello(ctx: &AppContext, conn: &mut ConnectionState, command: &Document) -> Result<Document> {
    conn.hello_ok = command.get_bool("helloOk").unwrap_or(false) || command.contains_key("hello");
    conn.client_metadata = command.get_document("client").ok().cloned();
    let topology_version = doc! {
        "processId": ctx.boot_id,
        "counter": ctx.topology_counter.fetch_add(1, Ordering::Relaxed),
    };
    Ok(doc! {
        "ismaster": true,
        "isWritablePrimary": true,
        "helloOk": true,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "maxMessageSizeBytes": ctx.config.max_message_size_bytes,
        "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE,
        "minWireVersion": 0i32,
        "maxWireVersion": 17i32,
        "logicalSessionTimeoutMinutes": 30i32,
        "readOnly": false,
        "topologyVersion": topology_version,
        "localTime": bson::DateTime::now(),
        "ok": 1.0,
    })
}

fn build_info() -> Document {
    doc! {
        "version": "7.0.0-oxlitedb",
        "gitVersion": "unknown",
        "versionArray": [7i32, 0i32, 0i32, 0i32],
        "bits": 64i32,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "ok": 1.0,
    }
}

fn host_info() -> Document {
    doc! {
        "system": { "hostname": "oxlitedb", "currentTime": bson::DateTime::now() },
        "os": { "type": "unknown" },
        "ok": 1.0,
    }
}

async fn list_databases(ctx: &AppContext) -> Result<Document> {
    let dbs = ctx.backend.list_databases().await?;
    let mut total_size: i64 = 0;
    let items: Vec<Document> = dbs
        .iter()
        .map(|name| {
            total_size += 1;
            doc! { "name": name, "sizeOnDisk": 0i64, "empty": false }
        })
        .collect();
    Ok(doc! { "databases": items, "totalSize": total_size, "ok": 1.0 })
}

async fn list_collections(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let _ = command;
    let colls = ctx.backend.list_collections(db).await?;
    let items: Vec<Document> = colls
        .into_iter()
        .map(|name| doc! { "name": name, "type": "collection", "options": {} })
        .collect();
    Ok(doc! {
        "cursor": { "id": 0i64, "ns": format!("{db}.$cmd.listCollections"), "firstBatch": items },
        "ok": 1.0,
    })
}

async fn create_collection(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = command
        .get_str("create")
        .map_err(|_| Error::bad_value("create requires a collection name"))?;
    ctx.backend.create_collection(db, coll).await?;
    Ok(doc! { "ok": 1.0 })
}

async fn drop_collection(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = command
        .get_str("drop")
        .map_err(|_| Error::bad_value("drop requires a collection name"))?;
    let existed = ctx.backend.drop_collection(db, coll).await?;
    if !existed {
        return Err(Error::Command { code: 26, code_name: "NamespaceNotFound", message: "ns not found".into() });
    }
    Ok(doc! { "ns": format!("{db}.{coll}"), "nIndexesWas": 1i32, "ok": 1.0 })
}

async fn drop_database(ctx: &AppContext, db: &str) -> Result<Document> {
    ctx.backend.drop_database(db).await?;
    Ok(doc! { "dropped": db, "ok": 1.0 })
}

fn extract_collection_name(command: &Document, field: &str) -> Result<String> {
    command
        .get_str(field)
        .map(str::to_string)
        .map_err(|_| Error::bad_value(format!("{field} command requires a collection name")))
}

async fn insert(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "insert")?;
    let docs = command
        .get_array("documents")
        .map_err(|_| Error::bad_value("insert requires a documents array"))?
        .iter()
        .map(|b| b.as_document().cloned().ok_or_else(|| Error::bad_value("documents entries must be objects")))
        .collect::<Result<Vec<Document>>>()?;

    let result = ctx.backend.insert(db, &coll, docs).await?;
    let n = result.inserted_ids.len() as i32;
    let mut reply = doc! { "n": n, "ok": 1.0 };
    if !result.write_errors.is_empty() {
        let errors: Vec<Document> = result
            .write_errors
            .into_iter()
            .map(|(idx, code, msg)| doc! { "index": idx as i32, "code": code, "errmsg": msg })
            .collect();
        reply.insert("writeErrors", errors);
    }
    Ok(reply)
}

fn parse_find_options(command: &Document) -> FindOptions {
    FindOptions {
        projection: command.get_document("projection").ok().cloned(),
        sort: command.get_document("sort").ok().cloned(),
        skip: command.get_i64("skip").ok().or_else(|| command.get_i32("skip").ok().map(i64::from)),
        limit: command.get_i64("limit").ok().or_else(|| command.get_i32("limit").ok().map(i64::from)),
    }
}

fn parse_max_time_ms(command: &Document) -> Option<i64> {
    command.get_i64("maxTimeMS").ok().or_else(|| command.get_i32("maxTimeMS").ok().map(i64::from))
}

/// Checks a `maxTimeMS` deadline against the wall-clock time a blocking
/// backend fetch actually took. Since `find`/`aggregate` buffer their entire
/// result before any row is put on the wire, a deadline crossed during that
/// fetch always counts as "reached before any row" (§5/§7) and fails the
/// whole command rather than opening a cursor.
fn check_max_time_ms(max_time_ms: Option<i64>, started: Instant) -> Result<()> {
    if let Some(ms) = max_time_ms {
        if ms > 0 && started.elapsed().as_millis() as i64 > ms {
            return Err(Error::MaxTimeMsExpired);
        }
    }
    Ok(())
}

async fn find(ctx: &AppContext, conn: &mut ConnectionState, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "find")?;
    let filter = command.get_document("filter").ok().cloned().unwrap_or_default();
    let options = parse_find_options(command);
    let batch_size = command.get_i64("batchSize").ok().unwrap_or(DEFAULT_BATCH_SIZE);
    let max_time_ms = parse_max_time_ms(command);

    let started = Instant::now();
    let docs = ctx.backend.find(db, &coll, &filter, &options).await?;
    check_max_time_ms(max_time_ms, started)?;
    Ok(open_cursor_reply(ctx, conn, db, &coll, docs, batch_size, "firstBatch").await)
}

async fn count(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "count")?;
    let filter = command.get_document("query").ok().cloned().unwrap_or_default();
    let n = ctx.backend.count(db, &coll, &filter).await?;
    Ok(doc! { "n": n, "ok": 1.0 })
}

/// `distinct`: not a cursor-producing command, so it never touches the
/// cursor manager — runs the filter through the same backend `find` path as
/// `count` and then dedupes the requested field's values in memory, the way
/// `$group`'s key extraction works in [`crate::aggregation::stages::group`].
async fn distinct(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "distinct")?;
    let key = command
        .get_str("key")
        .map_err(|_| Error::bad_value("distinct requires a key"))?;
    let filter = command.get_document("query").ok().cloned().unwrap_or_default();

    let docs = ctx.backend.find(db, &coll, &filter, &FindOptions::default()).await?;
    let field_ref = crate::aggregation::Expr::FieldRef(key.to_string());

    let mut seen: Vec<(String, Bson)> = Vec::new();
    for d in &docs {
        let ctx_eval = crate::aggregation::ExprEvalContext::new(d.clone(), d.clone());
        let value = crate::aggregation::eval_expr(&field_ref, &ctx_eval).map_err(|e| Error::bad_value(e.to_string()))?;
        if matches!(value, Bson::Null) {
            continue;
        }
        let dedup_key = format!("{value:?}");
        if !seen.iter().any(|(k, _)| k == &dedup_key) {
            seen.push((dedup_key, value));
        }
    }
    seen.sort_by(|a, b| crate::aggregation::bson_cmp(&a.1, &b.1));
    let values: Vec<Bson> = seen.into_iter().map(|(_, v)| v).collect();
    Ok(doc! { "values": values, "ok": 1.0 })
}

async fn update(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "update")?;
    let updates = command
        .get_array("updates")
        .map_err(|_| Error::bad_value("update requires an updates array"))?;

    let mut n_matched: i64 = 0;
    let mut n_modified: i64 = 0;
    let mut upserted: Vec<Document> = Vec::new();
    let mut write_errors: Vec<Document> = Vec::new();

    for (idx, spec) in updates.iter().enumerate() {
        let spec = spec.as_document().ok_or_else(|| Error::bad_value("updates entries must be objects"))?;
        let filter = spec.get_document("q").cloned().unwrap_or_default();
        let update_doc = spec.get_document("u").cloned().unwrap_or_default();
        let options = UpdateOptions {
            upsert: spec.get_bool("upsert").unwrap_or(false),
            multi: spec.get_bool("multi").unwrap_or(false),
        };
        match ctx.backend.update(db, &coll, &filter, &update_doc, &options).await {
            Ok(result) => {
                n_matched += result.matched_count;
                n_modified += result.modified_count;
                if let Some(id) = result.upserted_id {
                    upserted.push(doc! { "index": idx as i32, "_id": id });
                }
            }
            Err(e) => write_errors.push(doc! { "index": idx as i32, "code": e.code_and_name().0, "errmsg": e.to_string() }),
        }
    }

    let mut reply = doc! { "n": n_matched, "nModified": n_modified, "ok": 1.0 };
    if !upserted.is_empty() {
        reply.insert("upserted", upserted);
    }
    if !write_errors.is_empty() {
        reply.insert("writeErrors", write_errors);
    }
    Ok(reply)
}

async fn delete(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "delete")?;
    let deletes = command
        .get_array("deletes")
        .map_err(|_| Error::bad_value("delete requires a deletes array"))?;

    let mut n: i64 = 0;
    for spec in deletes {
        let spec = spec.as_document().ok_or_else(|| Error::bad_value("deletes entries must be objects"))?;
        let filter = spec.get_document("q").cloned().unwrap_or_default();
        let limit = spec.get_i32("limit").unwrap_or(0);
        let options = DeleteOptions { multi: limit == 0 };
        let result = ctx.backend.delete(db, &coll, &filter, &options).await?;
        n += result.deleted_count;
    }
    Ok(doc! { "n": n, "ok": 1.0 })
}

async fn find_and_modify(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "findAndModify")?;
    let filter = command.get_document("query").ok().cloned().unwrap_or_default();
    let new_requested = command.get_bool("new").unwrap_or(false);
    let remove = command.get_bool("remove").unwrap_or(false);

    if remove {
        let before = ctx.backend.find(db, &coll, &filter, &FindOptions { limit: Some(1), ..Default::default() }).await?;
        if let Some(doc0) = before.first().cloned() {
            ctx.backend.delete(db, &coll, &filter, &DeleteOptions { multi: false }).await?;
            return Ok(doc! { "lastErrorObject": { "n": 1i32 }, "value": doc0, "ok": 1.0 });
        }
        return Ok(doc! { "lastErrorObject": { "n": 0i32 }, "value": Bson::Null, "ok": 1.0 });
    }

    let update_doc = command.get_document("update").ok().cloned().unwrap_or_default();
    let upsert = command.get_bool("upsert").unwrap_or(false);
    let before = ctx
        .backend
        .find(db, &coll, &filter, &FindOptions { limit: Some(1), ..Default::default() })
        .await?
        .into_iter()
        .next();

    let result = ctx
        .backend
        .update(db, &coll, &filter, &update_doc, &UpdateOptions { upsert, multi: false })
        .await?;

    let value = if new_requested {
        let id_filter = result
            .upserted_id
            .clone()
            .map(|id| doc! { "_id": id })
            .unwrap_or_else(|| filter.clone());
        ctx.backend
            .find(db, &coll, &id_filter, &FindOptions { limit: Some(1), ..Default::default() })
            .await?
            .into_iter()
            .next()
            .map(Bson::Document)
            .unwrap_or(Bson::Null)
    } else {
        before.map(Bson::Document).unwrap_or(Bson::Null)
    };

    let updated_existing = result.matched_count > 0;
    let mut last_error = doc! { "n": if updated_existing { 1i32 } else { result.upserted_id.is_some() as i32 }, "updatedExisting": updated_existing };
    if let Some(id) = result.upserted_id {
        last_error.insert("upserted", id);
    }
    Ok(doc! { "lastErrorObject": last_error, "value": value, "ok": 1.0 })
}

async fn aggregate(ctx: &AppContext, conn: &mut ConnectionState, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "aggregate")?;
    let pipeline = crate::aggregation::Pipeline::parse(command).map_err(|e| Error::bad_value(e.to_string()))?;
    let allow_disk_use = pipeline.options.allow_disk_use;
    let vars: std::collections::HashMap<String, Bson> =
        pipeline.options.let_vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let batch_size = command
        .get_document("cursor")
        .ok()
        .and_then(|c| c.get_i64("batchSize").ok().or_else(|| c.get_i32("batchSize").ok().map(i64::from)))
        .unwrap_or(DEFAULT_BATCH_SIZE);

    let max_time_ms = pipeline.options.max_time_ms.map(|ms| ms as i64);
    let exec_ctx = crate::aggregation::ExecContext::with_vars(ctx.backend.as_ref(), db.to_string(), coll.clone(), allow_disk_use, vars)
        .with_facet_concurrency(ctx.config.facet_concurrency);

    let started = Instant::now();
    let result = crate::aggregation::execute_pipeline(&exec_ctx, pipeline)
        .await
        .map_err(|e| Error::bad_value(e.to_string()))?;
    check_max_time_ms(max_time_ms, started)?;

    match result {
        crate::aggregation::ExecResult::Cursor(docs) => {
            Ok(open_cursor_reply(ctx, conn, db, &coll, docs, batch_size, "firstBatch").await)
        }
        crate::aggregation::ExecResult::WriteOut(stats) => Ok(doc! {
            "cursor": { "id": 0i64, "ns": format!("{db}.{coll}"), "firstBatch": Vec::<Document>::new() },
            "nInserted": stats.inserted_count,
            "nMatched": stats.matched_count,
            "nModified": stats.modified_count,
            "nDeleted": stats.deleted_count,
            "ok": 1.0,
        }),
    }
}

/// Shared getMore-cursor opening logic for `find`/`aggregate`: carves off the
/// first `batch_size` documents, opens a cursor for the remainder if any are
/// left, and renders the `{cursor: {id, ns, <batch_field>: [...]}}` reply.
async fn open_cursor_reply(
    ctx: &AppContext,
    conn: &mut ConnectionState,
    db: &str,
    coll: &str,
    mut docs: Vec<Document>,
    batch_size: i64,
    batch_field: &str,
) -> Document {
    let batch_size = batch_size.max(0) as usize;
    let first_batch: Vec<Document> = if docs.len() > batch_size {
        docs.drain(..batch_size).collect()
    } else {
        std::mem::take(&mut docs)
    };

    let cursor_id = if docs.is_empty() {
        0i64
    } else {
        let id = ctx.cursors.open(db.to_string(), coll.to_string(), docs, conn.id).await;
        conn.track_cursor(id);
        id
    };

    doc! {
        "cursor": { "id": cursor_id, "ns": format!("{db}.{coll}"), batch_field: first_batch },
        "ok": 1.0,
    }
}

async fn get_more(ctx: &AppContext, conn: &mut ConnectionState, command: &Document) -> Result<Document> {
    let cursor_id = command
        .get_i64("getMore")
        .map_err(|_| Error::bad_value("getMore requires a cursor id"))?;
    let coll = extract_collection_name(command, "collection")?;
    let db = command.get_str("$db").unwrap_or("admin");
    let batch_size = command
        .get_i64("batchSize")
        .ok()
        .or_else(|| command.get_i32("batchSize").ok().map(i64::from))
        .unwrap_or(DEFAULT_BATCH_SIZE)
        .max(0) as usize;
    let max_time_ms = parse_max_time_ms(command);

    // Cursors are only reachable via the connection that opened them
    // (§3/§8 cursor isolation) — `next_batch` folds "unknown id" and
    // "owned by a different connection" into the same `None`.
    let started = Instant::now();
    let (batch, has_more) = ctx.cursors.next_batch(cursor_id, batch_size, conn.id).await.ok_or(Error::CursorNotFound)?;
    // The cursor's buffer is already in memory, so a `getMore` call never
    // genuinely suspends mid-batch; per §5, a deadline that is only reached
    // after rows have already been produced leaves the cursor live, so the
    // check only fires when nothing was returned at all.
    if let Some(ms) = max_time_ms {
        if ms > 0 && batch.is_empty() && started.elapsed().as_millis() as i64 > ms {
            return Err(Error::MaxTimeMsExpired);
        }
    }
    let reply_cursor_id = if has_more {
        cursor_id
    } else {
        conn.untrack_cursor(cursor_id);
        0
    };
    Ok(doc! {
        "cursor": { "id": reply_cursor_id, "ns": format!("{db}.{coll}"), "nextBatch": batch },
        "ok": 1.0,
    })
}

async fn kill_cursors(ctx: &AppContext, conn: &mut ConnectionState, command: &Document) -> Result<Document> {
    let ids = command
        .get_array("cursors")
        .map_err(|_| Error::bad_value("killCursors requires a cursors array"))?
        .iter()
        .filter_map(|v| v.as_i64())
        .collect::<Vec<i64>>();
    let (killed, not_found) = ctx.cursors.kill(&ids, conn.id).await;
    for id in &killed {
        conn.untrack_cursor(*id);
    }
    Ok(doc! {
        "cursorsKilled": killed,
        "cursorsNotFound": not_found,
        "cursorsAlive": Vec::<i64>::new(),
        "cursorsUnknown": Vec::<i64>::new(),
        "ok": 1.0,
    })
}

async fn create_indexes(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "createIndexes")?;
    let specs = command
        .get_array("indexes")
        .map_err(|_| Error::bad_value("createIndexes requires an indexes array"))?;

    let mut created = 0i32;
    for spec in specs {
        let spec = spec.as_document().ok_or_else(|| Error::bad_value("index spec must be an object"))?;
        let keys = spec.get_document("key").cloned().unwrap_or_default();
        let options = IndexOptions {
            name: spec.get_str("name").ok().map(str::to_string),
            unique: spec.get_bool("unique").unwrap_or(false),
            text_language: spec.get_str("default_language").ok().map(str::to_string),
        };
        ctx.backend.create_index(db, &coll, &keys, &options).await?;
        created += 1;
    }
    Ok(doc! { "numIndexesBefore": 0i32, "numIndexesAfter": created, "createdCollectionAutomatically": false, "ok": 1.0 })
}

async fn drop_indexes(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "dropIndexes")?;
    match command.get("index") {
        Some(Bson::String(name)) => {
            ctx.backend.drop_index(db, &coll, name).await?;
        }
        _ => {
            for idx in ctx.backend.list_indexes(db, &coll).await? {
                if let Ok(name) = idx.get_str("name") {
                    if name != "_id_" {
                        ctx.backend.drop_index(db, &coll, name).await?;
                    }
                }
            }
        }
    }
    Ok(doc! { "ok": 1.0 })
}

async fn list_indexes(ctx: &AppContext, db: &str, command: &Document) -> Result<Document> {
    let coll = extract_collection_name(command, "listIndexes")?;
    let indexes = ctx.backend.list_indexes(db, &coll).await?;
    Ok(doc! {
        "cursor": { "id": 0i64, "ns": format!("{db}.{coll}"), "firstBatch": indexes },
        "ok": 1.0,
    })
}

async fn rename_collection(ctx: &AppContext, command: &Document) -> Result<Document> {
    let from_ns = command
        .get_str("renameCollection")
        .map_err(|_| Error::bad_value("renameCollection requires a namespace"))?;
    let to_ns = command
        .get_str("to")
        .map_err(|_| Error::bad_value("renameCollection requires a to namespace"))?;
    let (from_db, from_coll) = from_ns
        .split_once('.')
        .ok_or_else(|| Error::bad_value("invalid namespace"))?;
    let (to_db, to_coll) = to_ns.split_once('.').ok_or_else(|| Error::bad_value("invalid namespace"))?;
    if from_db != to_db {
        return Err(Error::bad_value("renameCollection across databases is not supported"));
    }

    let docs = ctx.backend.find(from_db, from_coll, &Document::new(), &FindOptions::default()).await?;
    ctx.backend.create_collection(to_db, to_coll).await?;
    if !docs.is_empty() {
        ctx.backend.insert(to_db, to_coll, docs).await?;
    }
    ctx.backend.drop_collection(from_db, from_coll).await?;
    Ok(doc! { "ok": 1.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration as StdDuration;

    #[test]
    fn parse_max_time_ms_reads_either_int_width() {
        assert_eq!(parse_max_time_ms(&doc! { "maxTimeMS": 100i64 }), Some(100));
        assert_eq!(parse_max_time_ms(&doc! { "maxTimeMS": 100i32 }), Some(100));
        assert_eq!(parse_max_time_ms(&doc! {}), None);
    }

    #[test]
    fn check_max_time_ms_passes_when_no_deadline_set() {
        let started = Instant::now();
        assert!(check_max_time_ms(None, started).is_ok());
    }

    #[test]
    fn check_max_time_ms_treats_zero_as_no_limit() {
        let started = Instant::now();
        sleep(StdDuration::from_millis(5));
        assert!(check_max_time_ms(Some(0), started).is_ok());
    }

    #[test]
    fn check_max_time_ms_fails_once_elapsed_exceeds_deadline() {
        let started = Instant::now();
        sleep(StdDuration::from_millis(5));
        let err = check_max_time_ms(Some(1), started).unwrap_err();
        assert!(matches!(err, Error::MaxTimeMsExpired));
    }
}
