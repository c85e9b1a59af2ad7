//! End-to-end scenario 1 from the spec's testable properties: a driver's
//! pre-negotiation handshake arrives as a legacy OP_QUERY against
//! `admin.$cmd`, numberToReturn = -1, and must come back as a single-document
//! OP_REPLY advertising `ismaster`/`maxWireVersion`.

mod common;

use bson::{doc, Document};
use oxlitedb::protocol::{MessageHeader, OP_QUERY, OP_REPLY};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn encode_op_query(full_collection_name: &str, number_to_return: i32, query: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // flags
    body.extend_from_slice(full_collection_name.as_bytes());
    body.push(0); // cstring terminator
    body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    body.extend_from_slice(&number_to_return.to_le_bytes());
    body.extend_from_slice(&bson::to_vec(query).unwrap());

    let message_length = 16 + body.len() as i32;
    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&1i32.to_le_bytes()); // requestID
    out.extend_from_slice(&0i32.to_le_bytes()); // responseTo
    out.extend_from_slice(&OP_QUERY.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[tokio::test]
async fn legacy_op_query_ismaster_handshake() {
    let mut server = common::TestServer::start().await;

    let query = doc! { "isMaster": 1i32 };
    let bytes = encode_op_query("admin.$cmd", -1, &query);
    server.stream.write_all(&bytes).await.unwrap();

    let mut header_bytes = [0u8; 16];
    server.stream.read_exact(&mut header_bytes).await.unwrap();
    let (header, _) = MessageHeader::parse(&header_bytes).unwrap();
    assert_eq!(header.op_code, OP_REPLY);
    assert_eq!(header.response_to, 1);

    let mut rest = vec![0u8; (header.message_length as usize) - 16];
    server.stream.read_exact(&mut rest).await.unwrap();
    // responseFlags(4) + cursorID(8) + startingFrom(4) + numberReturned(4)
    let number_returned = i32::from_le_bytes([rest[16], rest[17], rest[18], rest[19]]);
    assert_eq!(number_returned, 1);
    let reply: Document = bson::from_slice(&rest[20..]).unwrap();

    assert_eq!(reply.get_bool("ismaster").unwrap(), true);
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_i32("maxWireVersion").unwrap(), 17);
}
