//! Shared e2e harness: boot a real server on an ephemeral loopback port
//! backed by an isolated in-memory SQLite database, and speak raw OP_MSG
//! frames against it exactly like an unmodified driver would.

use bson::Document;
use oxlitedb::config::Config;
use oxlitedb::protocol::{MessageHeader, OP_MSG, decode_op_msg, encode_op_msg};
use oxlitedb::server::spawn_with_shutdown;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub stream: TcpStream,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<bool>>,
    handle: Option<JoinHandle<oxlitedb::error::Result<()>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let mut cfg = Config::default();
        cfg.listen_addr = "127.0.0.1:0".to_string();
        cfg.db_path = ":memory:".to_string();
        cfg.pool_size = 4;
        let (_state, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.expect("spawn server");
        let stream = TcpStream::connect(addr).await.expect("connect to loopback server");
        Self {
            stream,
            addr,
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    /// Opens a second raw connection to the same running server, for tests
    /// that need to exercise behavior across distinct connections (e.g.
    /// cursor ownership isolation).
    pub async fn connect_second(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect second client to loopback server")
    }

    /// Sends `body` as a single kind-0-section `OP_MSG` with the given request id
    /// and returns the parsed reply document plus the header's `responseTo`.
    pub async fn send(&mut self, body: &Document, request_id: i32) -> (Document, i32) {
        send_on(&mut self.stream, body, request_id).await
    }
}

/// Same as [`TestServer::send`] but against an arbitrary stream, so tests can
/// drive a second connection opened via [`TestServer::connect_second`].
pub async fn send_on(stream: &mut TcpStream, body: &Document, request_id: i32) -> (Document, i32) {
    let bytes = encode_op_msg(body, 0, request_id);
    stream.write_all(&bytes).await.expect("write request");
    let mut header_bytes = [0u8; 16];
    stream.read_exact(&mut header_bytes).await.expect("read header");
    let (header, _) = MessageHeader::parse(&header_bytes).expect("parse header");
    assert_eq!(header.op_code, OP_MSG, "server always replies with OP_MSG except legacy handshakes");
    let mut rest = vec![0u8; (header.message_length as usize) - 16];
    stream.read_exact(&mut rest).await.expect("read body");
    let msg = decode_op_msg(&header_bytes, &rest).expect("decode OP_MSG");
    (msg.body, header.response_to)
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
