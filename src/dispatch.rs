//! Command dispatch (spec component D): pulls `$db` and the command name out
//! of an `OP_MSG`, merges its kind-1 document sequences into the command
//! body under their declared identifiers, and hands the result to
//! [`crate::handlers`]. Errors from handlers become `{ok: 0, ...}` replies
//! without closing the connection; only [`crate::error::Error::Protocol`]
//! does that (handled by the caller in `server.rs`).

use crate::error::{Error, Result};
use crate::handlers::AppContext;
use crate::protocol::OpMsg;
use crate::session::ConnectionState;
use bson::Document;

/// The command name is always the first key of the command document.
pub fn command_name(command: &Document) -> Result<String> {
    command
        .keys()
        .next()
        .cloned()
        .ok_or_else(|| Error::bad_value("empty command document"))
}

/// Builds the full command document from an `OP_MSG`: the kind-0 body plus
/// every kind-1 sequence inserted under its own identifier (`documents` for
/// insert, `updates` for update, `deletes` for delete, ...).
pub fn merge_command(msg: &OpMsg) -> Document {
    let mut command = msg.body.clone();
    for seq in &msg.sequences {
        let docs: Vec<bson::Bson> = seq.documents.iter().cloned().map(bson::Bson::Document).collect();
        command.insert(seq.identifier.clone(), docs);
    }
    command
}

/// Extracts the target database: `$db` is required on every command in the
/// modern wire protocol.
pub fn extract_db(command: &Document) -> Result<String> {
    command
        .get_str("$db")
        .map(str::to_string)
        .map_err(|_| Error::bad_value("command is missing required $db field"))
}

pub async fn dispatch(
    ctx: &AppContext,
    conn: &mut ConnectionState,
    msg: &OpMsg,
) -> Document {
    let command = merge_command(msg);
    match dispatch_inner(ctx, conn, command).await {
        Ok(reply) => reply,
        Err(e) => {
            if matches!(e, Error::Internal(_) | Error::Io(_)) {
                tracing::error!(error = %format!("{e:?}"), "command failed with internal error");
            }
            e.to_command_reply()
        }
    }
}

async fn dispatch_inner(ctx: &AppContext, conn: &mut ConnectionState, command: Document) -> Result<Document> {
    let db = extract_db(&command)?;
    let name = command_name(&command)?;
    crate::handlers::handle(ctx, conn, &db, &name, command).await
}
