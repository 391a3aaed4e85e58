//! Error handling helpers and primitives.

use anyhow::Error;
use thiserror::Error;

/// The closed set of error kinds surfaced on output frames and in the audit
/// log. The kind is a tag; it is never derived from or matched against
/// message text.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ErrorKind {
    // Policy
    #[error("PATH_TRAVERSAL")]
    PathTraversal,
    #[error("OUTSIDE_REPO")]
    OutsideRepo,
    #[error("EXCLUDED")]
    Excluded,
    #[error("EXTENSION_DENIED")]
    ExtensionDenied,
    #[error("RESOURCE_LIMIT")]
    ResourceLimit,
    #[error("EXEC_VALIDATION")]
    ExecValidation,
    #[error("EMPTY_WHITELIST")]
    EmptyWhitelist,
    #[error("TOO_LONG")]
    TooLong,
    #[error("CONTROL_CHARS")]
    ControlChars,

    // Filesystem
    #[error("FILE_NOT_FOUND")]
    FileNotFound,
    #[error("PERMISSION_DENIED")]
    PermissionDenied,
    #[error("READ_ERROR")]
    ReadError,
    #[error("BACKUP_FAILED")]
    BackupFailed,
    #[error("WRITE_CONTAINER")]
    WriteContainer,
    #[error("DIRECTORY_CREATION_FAILED")]
    DirectoryCreationFailed,

    // Sandbox
    #[error("DOCKER_UNAVAILABLE")]
    DockerUnavailable,
    #[error("DOCKER_IMAGE")]
    DockerImage,
    #[error("EXEC_TIMEOUT")]
    ExecTimeout,
    #[error("EXEC_FAILED({0})")]
    ExecFailed(i64),
    #[error("EXEC_ERROR")]
    ExecError,
    #[error("LOG_DECODE")]
    LogDecode,

    // Pool
    #[error("POOL_CLOSED")]
    PoolClosed,
    #[error("POOL_EXHAUSTED")]
    PoolExhausted,
    #[error("POOL_CONFIG")]
    PoolConfig,

    // Search
    #[error("SEARCH_DISABLED")]
    SearchDisabled,
    #[error("SEARCH_INIT_FAILED")]
    SearchInitFailed,
    #[error("SEARCH_FAILED")]
    SearchFailed,

    // Framing
    #[error("UNKNOWN_COMMAND")]
    UnknownCommand,
}

/// A failed command outcome. The message holds the full, unsanitized error
/// text; it reaches the audit log verbatim while callers present the
/// sanitized form to the LLM.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct CommandError {
    kind: ErrorKind,
    message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an error stack, preserving a typed `CommandError` found anywhere
    /// in the chain and otherwise falling back to the provided kind. The
    /// message keeps the whole context chain.
    pub fn wrap(fallback: ErrorKind, err: &Error) -> Self {
        for cause in err.chain() {
            if let Some(command_error) = cause.downcast_ref::<CommandError>() {
                return command_error.clone();
            }
        }
        Self::new(fallback, format!("{err:#}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The full error text, including host paths and runtime diagnostics.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The LLM-facing form of the message.
    pub fn sanitized(&self) -> String {
        crate::sanitize::sanitize(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn kind_display() {
        assert_eq!(ErrorKind::PathTraversal.to_string(), "PATH_TRAVERSAL");
        assert_eq!(ErrorKind::ExecFailed(2).to_string(), "EXEC_FAILED(2)");
        assert_eq!(ErrorKind::LogDecode.to_string(), "LOG_DECODE");
    }

    #[test]
    fn wrap_preserves_typed_error() {
        let inner = CommandError::new(ErrorKind::Excluded, "pattern matched");
        let err = anyhow::Error::new(inner).context("validate path");

        let wrapped = CommandError::wrap(ErrorKind::ExecError, &err);
        assert_eq!(wrapped.kind(), ErrorKind::Excluded);
        assert_eq!(wrapped.message(), "pattern matched");
    }

    #[test]
    fn wrap_falls_back_to_default_kind() {
        let err = anyhow!("socket gone").context("ping daemon");
        let wrapped = CommandError::wrap(ErrorKind::DockerUnavailable, &err);
        assert_eq!(wrapped.kind(), ErrorKind::DockerUnavailable);
        assert_eq!(wrapped.message(), "ping daemon: socket gone");
    }
}
