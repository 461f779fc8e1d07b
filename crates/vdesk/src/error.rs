//! Error taxonomy shared by the supervisor, the action agent and the relay.
//!
//! Every fallible library call returns [`Error`], a code/message/context triple
//! in the same shape the agent and the CLI report on the wire. [`ErrorCode`]
//! is closed so callers can match on the category instead of parsing strings.

use miette::Diagnostic;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid or missing configuration.
    Config,
    /// Local I/O failure (filesystem, sockets, child processes).
    Io,
    /// Malformed request or response on a wire protocol.
    Protocol,
    /// An operation exceeded its ceiling.
    Timeout,
    /// A remote command could not be run or returned garbage.
    Remote,
    /// The persisted supervisor state is held by another invocation.
    StateLocked,
    /// A listener could not be bound.
    Bind,
    /// Invariant violation inside this crate.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "E_CONFIG",
            Self::Io => "E_IO",
            Self::Protocol => "E_PROTOCOL",
            Self::Timeout => "E_TIMEOUT",
            Self::Remote => "E_REMOTE",
            Self::StateLocked => "E_STATE_LOCKED",
            Self::Bind => "E_BIND",
            Self::Internal => "E_INTERNAL",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "E_CONFIG" => Some(Self::Config),
            "E_IO" => Some(Self::Io),
            "E_PROTOCOL" => Some(Self::Protocol),
            "E_TIMEOUT" => Some(Self::Timeout),
            "E_REMOTE" => Some(Self::Remote),
            "E_STATE_LOCKED" => Some(Self::StateLocked),
            "E_BIND" => Some(Self::Bind),
            "E_INTERNAL" => Some(Self::Internal),
            _ => None,
        }
    }

    /// Process exit code used when an error aborts a CLI invocation.
    ///
    /// Follows the supervisor contract: `1` means "try again later",
    /// `2` means "needs an operator".
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Timeout | Self::StateLocked => 1,
            Self::Config
            | Self::Io
            | Self::Protocol
            | Self::Remote
            | Self::Bind
            | Self::Internal => 2,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

impl Error {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        context: impl Into<Option<Value>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn config(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Config, message, context)
    }

    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message, None)
    }

    pub fn timeout(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Timeout, message, context)
    }

    pub fn remote(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Remote, message, context)
    }

    pub fn state_locked(path: &std::path::Path) -> Self {
        Self::new(
            ErrorCode::StateLocked,
            "supervisor state is locked by another invocation",
            serde_json::json!({ "lock": path.display().to_string() }),
        )
    }

    pub fn bind(addr: impl fmt::Display, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Bind,
            format!("failed to bind {addr}"),
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, None)
    }

    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }
}

impl Diagnostic for Error {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let context = self.context.as_ref()?;
        let rendered = context
            .get("hint")
            .and_then(Value::as_str)
            .map_or_else(|| context.to_string(), str::to_string);
        Some(Box::new(rendered))
    }
}
