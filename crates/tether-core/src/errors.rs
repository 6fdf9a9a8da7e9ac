use crate::formatter::FormatError;

/// Typed error taxonomy for hub operations.
/// Transport and liveness failures are fatal to their connection; everything
/// else leaves the connection open.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HubError {
    // Non-fatal: connection stays open
    #[error("malformed envelope: {0}")]
    Decode(#[from] FormatError),
    #[error("unknown method: {method}")]
    UnknownMethod { method: String },
    #[error("method {method} expects {expected} arguments, got {got}")]
    ArityMismatch {
        method: String,
        expected: usize,
        got: usize,
    },
    #[error("argument {index} has the wrong type: {reason}")]
    BadArgument { index: usize, reason: String },
    #[error("invocation failed: {0}")]
    Invocation(String),

    // Fatal to this connection only
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("reaped after {missed} missed heartbeat intervals")]
    Reaped { missed: u32 },
}

impl HubError {
    pub fn invocation(reason: impl Into<String>) -> Self {
        Self::Invocation(reason.into())
    }

    /// Fatal errors tear the connection down; everything else is reported
    /// through a hook and dispatch continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Reaped { .. })
    }

    /// True for method-resolution failures (unknown name, arity, coercion).
    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            Self::UnknownMethod { .. } | Self::ArityMismatch { .. } | Self::BadArgument { .. }
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::UnknownMethod { .. } => "unknown_method",
            Self::ArityMismatch { .. } => "arity_mismatch",
            Self::BadArgument { .. } => "bad_argument",
            Self::Invocation(_) => "invocation",
            Self::Transport(_) => "transport",
            Self::Reaped { .. } => "reaped",
        }
    }
}
