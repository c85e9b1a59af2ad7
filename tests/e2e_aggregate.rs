//! End-to-end aggregate: `$match` + `$group` through the real wire protocol,
//! and a `$search` text query (scenario-5-adjacent, minus a `path` prefix
//! since the FTS5 companion table carries a single flattened `body` column).

mod common;

use bson::{doc, Bson};

#[tokio::test]
async fn match_then_group_sums_by_key() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "orders",
        "documents": [
            { "region": "east", "amount": 10i32, "status": "paid" },
            { "region": "east", "amount": 5i32, "status": "paid" },
            { "region": "west", "amount": 7i32, "status": "paid" },
            { "region": "east", "amount": 100i32, "status": "pending" },
        ],
        "$db": "db",
    };
    server.send(&insert, 1).await;

    let pipeline = vec![
        Bson::Document(doc! { "$match": { "status": "paid" } }),
        Bson::Document(doc! { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } }),
        Bson::Document(doc! { "$sort": { "_id": 1i32 } }),
    ];
    let aggregate = doc! {
        "aggregate": "orders",
        "pipeline": pipeline,
        "cursor": {},
        "$db": "db",
    };
    let (reply, _) = server.send(&aggregate, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 2);
    let east = batch[0].as_document().unwrap();
    assert_eq!(east.get_str("_id").unwrap(), "east");
    assert_eq!(east.get_f64("total").unwrap(), 15.0);
    let west = batch[1].as_document().unwrap();
    assert_eq!(west.get_str("_id").unwrap(), "west");
    assert_eq!(west.get_f64("total").unwrap(), 7.0);
}

#[tokio::test]
async fn match_after_empty_intermediate_batch_does_not_resource_the_collection() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "widgets",
        "documents": [
            { "a": 1i32, "b": 1i32 },
            { "a": 1i32, "b": 1i32 },
            { "a": 1i32, "b": 1i32 },
        ],
        "$db": "db",
    };
    server.send(&insert, 1).await;

    // The leading $match excludes every document, so the batch reaching the
    // third stage is legitimately empty. That must not be confused with
    // "not yet fetched" and trigger a fresh, unfiltered collection read.
    let pipeline = vec![
        Bson::Document(doc! { "$match": { "a": 999i32 } }),
        Bson::Document(doc! { "$limit": 5i32 }),
        Bson::Document(doc! { "$match": { "b": 1i32 } }),
    ];
    let aggregate = doc! {
        "aggregate": "widgets",
        "pipeline": pipeline,
        "cursor": {},
        "$db": "db",
    };
    let (reply, _) = server.send(&aggregate, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert!(batch.is_empty(), "empty intermediate batch must stay empty, not re-source the collection");
}

#[tokio::test]
async fn search_text_query_matches_indexed_documents() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "articles",
        "documents": [
            { "title": "mongo internals", "body": "a deep dive into the storage engine" },
            { "title": "gardening tips", "body": "how to grow tomatoes" },
        ],
        "$db": "db",
    };
    server.send(&insert, 1).await;

    let pipeline = vec![Bson::Document(doc! {
        "$search": { "text": { "query": "mongo" } },
    })];
    let aggregate = doc! {
        "aggregate": "articles",
        "pipeline": pipeline,
        "cursor": {},
        "$db": "db",
    };
    let (reply, _) = server.send(&aggregate, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].as_document().unwrap().get_str("title").unwrap(), "mongo internals");
}
