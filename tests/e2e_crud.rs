//! End-to-end scenario 2: insert then find with a comparison operator.
//! Also exercises update/delete/distinct/count over the same wire connection,
//! since they share the insert's fixture data.

mod common;

use bson::doc;

#[tokio::test]
async fn insert_then_find_with_gt_filter() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "c",
        "documents": [
            { "_id": "a", "n": 1i32 },
            { "_id": "b", "n": 2i32 },
        ],
        "$db": "db",
    };
    let (reply, response_to) = server.send(&insert, 1).await;
    assert_eq!(response_to, 1);
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_i32("n").unwrap(), 2);

    let find = doc! {
        "find": "c",
        "filter": { "n": { "$gt": 1i32 } },
        "$db": "db",
    };
    let (reply, _) = server.send(&find, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0, "entire result fits in firstBatch");
    let batch = cursor.get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    let doc0 = batch[0].as_document().unwrap();
    assert_eq!(doc0.get_str("_id").unwrap(), "b");
    assert_eq!(doc0.get_i32("n").unwrap(), 2);
}

#[tokio::test]
async fn update_delete_count_and_distinct_round_trip() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "widgets",
        "documents": [
            { "_id": 1i32, "color": "red", "qty": 5i32 },
            { "_id": 2i32, "color": "red", "qty": 7i32 },
            { "_id": 3i32, "color": "blue", "qty": 1i32 },
        ],
        "$db": "db",
    };
    server.send(&insert, 1).await;

    let distinct = doc! { "distinct": "widgets", "key": "color", "$db": "db" };
    let (reply, _) = server.send(&distinct, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let values: Vec<String> = reply
        .get_array("values")
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["blue".to_string(), "red".to_string()]);

    let count = doc! { "count": "widgets", "query": { "color": "red" }, "$db": "db" };
    let (reply, _) = server.send(&count, 3).await;
    assert_eq!(reply.get_i64("n").unwrap(), 2);

    let update = doc! {
        "update": "widgets",
        "updates": [
            { "q": { "color": "red" }, "u": { "$inc": { "qty": 1i32 } }, "multi": true },
        ],
        "$db": "db",
    };
    let (reply, _) = server.send(&update, 4).await;
    assert_eq!(reply.get_i64("n").unwrap(), 2);
    assert_eq!(reply.get_i64("nModified").unwrap(), 2);

    let delete = doc! {
        "delete": "widgets",
        "deletes": [{ "q": { "color": "blue" }, "limit": 0i32 }],
        "$db": "db",
    };
    let (reply, _) = server.send(&delete, 5).await;
    assert_eq!(reply.get_i64("n").unwrap(), 1);

    let count2 = doc! { "count": "widgets", "query": {}, "$db": "db" };
    let (reply, _) = server.send(&count2, 6).await;
    assert_eq!(reply.get_i64("n").unwrap(), 2);
}
