use bson::{Document, doc};

/// Top-level error taxonomy. Variants map to wire-level `{ok: 0, code, codeName, errmsg}`
/// documents except `Protocol`, which is fatal to the connection and never replied to.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{message}")]
    Command {
        code: i32,
        code_name: &'static str,
        message: String,
    },

    #[error("cursor not found")]
    CursorNotFound,

    #[error("cursor in use")]
    CursorInUse,

    #[error("operation exceeded time limit")]
    MaxTimeMsExpired,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Error::Command {
            code: 2,
            code_name: "BadValue",
            message: msg.into(),
        }
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Error::Command {
            code: 14,
            code_name: "TypeMismatch",
            message: msg.into(),
        }
    }

    pub fn failed_to_parse(msg: impl Into<String>) -> Self {
        Error::Command {
            code: 9,
            code_name: "FailedToParse",
            message: msg.into(),
        }
    }

    pub fn command_not_found(name: impl Into<String>) -> Self {
        Error::Command {
            code: 59,
            code_name: "CommandNotFound",
            message: format!("no such command: '{}'", name.into()),
        }
    }

    pub fn duplicate_key(msg: impl Into<String>) -> Self {
        Error::Command {
            code: 11000,
            code_name: "DuplicateKey",
            message: msg.into(),
        }
    }

    /// `(code, codeName)` pair used when shaping the wire-level error document.
    pub fn code_and_name(&self) -> (i32, &'static str) {
        match self {
            Error::Command { code, code_name, .. } => (*code, code_name),
            Error::CursorNotFound => (43, "CursorNotFound"),
            Error::CursorInUse => (211, "CursorInUse"),
            Error::MaxTimeMsExpired => (50, "MaxTimeMSExpired"),
            Error::Internal(_) | Error::Io(_) => (1, "InternalError"),
            Error::Protocol(_) => (1, "InternalError"),
        }
    }

    /// Renders this error as the `{ok: 0, code, codeName, errmsg}` reply document.
    /// Internal causes are sanitized: the caller is expected to have already logged
    /// the detailed cause via `tracing::error!` before this is sent on the wire.
    pub fn to_command_reply(&self) -> Document {
        let (code, code_name) = self.code_and_name();
        let errmsg = match self {
            Error::Internal(_) | Error::Io(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        doc! {
            "ok": 0.0,
            "code": code,
            "codeName": code_name,
            "errmsg": errmsg,
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}
