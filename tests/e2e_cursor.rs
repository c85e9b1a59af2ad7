//! End-to-end scenario 3 (cursor batching) and scenario 6 (killCursors) from
//! the spec's testable properties, driven over the real wire protocol.

mod common;

use bson::{doc, Bson};

#[tokio::test]
async fn cursor_batches_across_two_getmores() {
    let mut server = common::TestServer::start().await;

    let docs: Vec<Bson> = (0..250).map(|i| Bson::Document(doc! { "i": i as i32 })).collect();
    let insert = doc! { "insert": "big", "documents": docs, "$db": "db" };
    let (reply, _) = server.send(&insert, 1).await;
    assert_eq!(reply.get_i32("n").unwrap(), 250);

    let find = doc! { "find": "big", "filter": {}, "batchSize": 100i32, "$db": "db" };
    let (reply, _) = server.send(&find, 2).await;
    let cursor = reply.get_document("cursor").unwrap();
    let cursor_id = cursor.get_i64("id").unwrap();
    assert_ne!(cursor_id, 0);
    assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 100);

    let get_more1 = doc! { "getMore": cursor_id, "collection": "big", "batchSize": 100i32, "$db": "db" };
    let (reply, _) = server.send(&get_more1, 3).await;
    let cursor2 = reply.get_document("cursor").unwrap();
    assert_eq!(cursor2.get_array("nextBatch").unwrap().len(), 100);
    let cursor_id2 = cursor2.get_i64("id").unwrap();
    assert_eq!(cursor_id2, cursor_id, "cursor id is stable across getMore");

    let get_more2 = doc! { "getMore": cursor_id2, "collection": "big", "batchSize": 100i32, "$db": "db" };
    let (reply, _) = server.send(&get_more2, 4).await;
    let cursor3 = reply.get_document("cursor").unwrap();
    assert_eq!(cursor3.get_array("nextBatch").unwrap().len(), 50);
    assert_eq!(cursor3.get_i64("id").unwrap(), 0, "cursor id is 0 once exhausted");
}

#[tokio::test]
async fn kill_cursors_partitions_killed_and_not_found() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "c",
        "documents": [doc! {"n": 1i32}, doc! {"n": 2i32}, doc! {"n": 3i32}],
        "$db": "db",
    };
    server.send(&insert, 1).await;

    let find1 = doc! { "find": "c", "filter": {}, "batchSize": 1i32, "$db": "db" };
    let (reply, _) = server.send(&find1, 2).await;
    let id1 = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
    assert_ne!(id1, 0);

    let find2 = doc! { "find": "c", "filter": {}, "batchSize": 1i32, "$db": "db" };
    let (reply, _) = server.send(&find2, 3).await;
    let id2 = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
    assert_ne!(id2, 0);
    assert_ne!(id1, id2);

    let bogus_id = id1.wrapping_add(id2).wrapping_add(1);
    let kill = doc! {
        "killCursors": "c",
        "cursors": [Bson::Int64(id1), Bson::Int64(id2), Bson::Int64(bogus_id)],
        "$db": "db",
    };
    let (reply, _) = server.send(&kill, 4).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let mut killed: Vec<i64> = reply.get_array("cursorsKilled").unwrap().iter().map(|v| v.as_i64().unwrap()).collect();
    killed.sort();
    let mut expected = vec![id1, id2];
    expected.sort();
    assert_eq!(killed, expected);
    let not_found: Vec<i64> = reply.get_array("cursorsNotFound").unwrap().iter().map(|v| v.as_i64().unwrap()).collect();
    assert_eq!(not_found, vec![bogus_id]);

    let get_more = doc! { "getMore": id1, "collection": "c", "$db": "db" };
    let (reply, _) = server.send(&get_more, 5).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0, "killed cursor id is no longer known");
    assert_eq!(reply.get_str("codeName").unwrap(), "CursorNotFound");
}

#[tokio::test]
async fn cursor_is_not_reachable_from_a_different_connection() {
    let mut server = common::TestServer::start().await;

    let insert = doc! {
        "insert": "c",
        "documents": [doc! {"n": 1i32}, doc! {"n": 2i32}, doc! {"n": 3i32}],
        "$db": "db",
    };
    server.send(&insert, 1).await;

    let find = doc! { "find": "c", "filter": {}, "batchSize": 1i32, "$db": "db" };
    let (reply, _) = server.send(&find, 2).await;
    let cursor_id = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
    assert_ne!(cursor_id, 0);

    // A second connection must not be able to drain or kill the first
    // connection's cursor, even though the id is live on the server.
    let mut other = server.connect_second().await;

    let get_more = doc! { "getMore": cursor_id, "collection": "c", "$db": "db" };
    let (reply, _) = common::send_on(&mut other, &get_more, 1).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0, "cursor is owned by a different connection");
    assert_eq!(reply.get_str("codeName").unwrap(), "CursorNotFound");

    let kill = doc! { "killCursors": "c", "cursors": [Bson::Int64(cursor_id)], "$db": "db" };
    let (reply, _) = common::send_on(&mut other, &kill, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_array("cursorsKilled").unwrap().len(), 0);
    let not_found: Vec<i64> = reply.get_array("cursorsNotFound").unwrap().iter().map(|v| v.as_i64().unwrap()).collect();
    assert_eq!(not_found, vec![cursor_id]);

    // The owning connection can still drain it normally afterwards.
    let get_more = doc! { "getMore": cursor_id, "collection": "c", "$db": "db" };
    let (reply, _) = server.send(&get_more, 3).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_document("cursor").unwrap().get_array("nextBatch").unwrap().len(), 1);
}
