//! TCP accept loop and per-connection drive (spec component A): frames wire
//! messages via `protocol::read_message`, dispatches each command through
//! `dispatch::dispatch`, and writes the reply back with `protocol::encode_op_msg`.
//! Mirrors the teacher's `server.rs` shape (one task per connection, a shared
//! `Arc<AppContext>`-style handle, a background reaper) but against a single
//! embedded SQLite store instead of a Postgres pool per tenant.

use crate::backend::sqlite::SqliteStore;
use crate::config::Config;
use crate::cursor::CursorManager;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::handlers::AppContext;
use crate::protocol::{self, Message, OpQuery};
use crate::session::ConnectionState;
use bson::doc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub async fn run(cfg: Config) -> Result<()> {
    let (ctx, listener) = bootstrap(cfg).await?;
    accept_loop(ctx, listener, None).await
}

/// Boots the backend, cursor manager/reaper, and `AppContext`, then binds
/// the listener without entering the accept loop — shared by [`run`] and
/// [`spawn_with_shutdown`].
async fn bootstrap(cfg: Config) -> Result<(Arc<AppContext>, TcpListener)> {
    let store = SqliteStore::connect(&cfg.db_path, cfg.pool_size)?;
    let cursors = Arc::new(CursorManager::new(Duration::from_secs(cfg.cursor_timeout_secs.unwrap_or(1800))));
    crate::cursor::spawn_reaper(cursors.clone(), Duration::from_secs(cfg.cursor_sweep_interval_secs.unwrap_or(60)));

    let ctx = Arc::new(AppContext::new(Arc::new(store), cursors, cfg.clone()));
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!(listen_addr = %cfg.listen_addr, db_path = %cfg.db_path, "oxlitedb listening");
    Ok((ctx, listener))
}

async fn accept_loop(ctx: Arc<AppContext>, listener: TcpListener, mut shutdown: Option<oneshot::Receiver<bool>>) -> Result<()> {
    let max_message_size_bytes = ctx.config.max_message_size_bytes;
    loop {
        let (socket, addr) = match &mut shutdown {
            Some(rx) => tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = rx => return Ok(()),
            },
            None => listener.accept().await?,
        };
        tracing::debug!(%addr, "accepted connection");
        let ctx = ctx.clone();
        let conn = ConnectionState::new();
        let conn_id = conn.id;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &ctx, conn, max_message_size_bytes).await {
                if e.is_protocol() {
                    tracing::debug!(%addr, error = %e, "connection closed: protocol error");
                } else {
                    tracing::debug!(%addr, error = %format!("{e:?}"), "connection closed with error");
                }
            }
            ctx.cursors.release_owned_by(conn_id).await;
        });
    }
}

/// Test/bench entry point: boots the server against an ephemeral port
/// (`cfg.listen_addr` should be `"127.0.0.1:0"`) and returns the resolved
/// address plus a shutdown handle, instead of looping forever like [`run`].
/// Mirrors the teacher's loopback-`TcpStream` driver pattern in its own
/// test suite.
pub async fn spawn_with_shutdown(cfg: Config) -> Result<(Arc<AppContext>, SocketAddr, oneshot::Sender<bool>, JoinHandle<Result<()>>)> {
    let (ctx, listener) = bootstrap(cfg).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    let state = ctx.clone();
    let handle = tokio::spawn(async move { accept_loop(ctx, listener, Some(rx)).await });
    Ok((state, addr, tx, handle))
}

async fn handle_connection(mut socket: TcpStream, ctx: &AppContext, mut conn: ConnectionState, max_message_size: i32) -> Result<()> {
    let mut next_request_id: i32 = 1;

    loop {
        let (header, message) = match protocol::read_message(&mut socket, max_message_size).await {
            Ok(v) => v,
            Err(Error::Io(e)) if is_clean_eof(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        match message {
            Message::Msg(msg) => {
                let reply = dispatch::dispatch(ctx, &mut conn, &msg).await;
                let bytes = protocol::encode_op_msg(&reply, header.request_id, next_request_id);
                socket.write_all(&bytes).await?;
            }
            Message::Query(query) => {
                let reply = handle_legacy_query(ctx, &mut conn, &query).await;
                let bytes = protocol::encode_op_reply(&[reply], header.request_id, next_request_id);
                socket.write_all(&bytes).await?;
            }
        }
        next_request_id = next_request_id.wrapping_add(1);
    }
}

/// Legacy `OP_QUERY` is only still seen for the pre-handshake
/// `{isMaster: 1}`/`{ismaster: 1}` probe some older drivers send before
/// negotiating `OP_MSG`; everything else routes through the same dispatcher
/// as if `$db` were derived from the collection namespace.
async fn handle_legacy_query(ctx: &AppContext, conn: &mut ConnectionState, query: &OpQuery) -> bson::Document {
    let db = query
        .full_collection_name
        .split('.')
        .next()
        .unwrap_or("admin")
        .to_string();
    let name = match dispatch::command_name(&query.query) {
        Ok(n) => n,
        Err(_) => return doc! { "ok": 0.0, "errmsg": "empty command" },
    };
    match crate::handlers::handle(ctx, conn, &db, &name, query.query.clone()).await {
        Ok(reply) => reply,
        Err(e) => e.to_command_reply(),
    }
}

fn is_clean_eof(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::UnexpectedEof) || e.to_string().contains("early eof")
}
