use std::fmt;
use std::path::PathBuf;

use crate::store::StoreError;

/// Machine-readable error codes for fatal migration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SourceUnreadable,
    SourceParse,
    InvalidConfig,
    TargetUnreachable,
    TargetFailure,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SourceUnreadable => "E1001",
            Self::SourceParse => "E1002",
            Self::InvalidConfig => "E1003",
            Self::TargetUnreachable => "E2001",
            Self::TargetFailure => "E2002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::SourceUnreadable => "Source snapshot unreadable",
            Self::SourceParse => "Source snapshot is not valid JSON",
            Self::InvalidConfig => "Invalid configuration",
            Self::TargetUnreachable => "Target store unreachable",
            Self::TargetFailure => "Target store failure",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::SourceUnreadable => Some("Check the source path in haul.toml and file permissions."),
            Self::SourceParse => {
                Some("Fix the JSON syntax; the top level must be an object of collections.")
            }
            Self::InvalidConfig => Some("Fix haul.toml or the HAUL_* environment variables."),
            Self::TargetUnreachable => {
                Some("Check that the server in HAUL_TARGET_URI is running, or point it at sqlite://<dir> or memory://.")
            }
            Self::TargetFailure => Some("Re-run the migration; reconciliation is idempotent."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Fatal errors that abort a migration run.
///
/// Everything below this level (per-record, per-batch, index and backup
/// failures) is converted to tallies and warnings instead.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("cannot read source {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse source {}: {reason}", path.display())]
    SourceParse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot connect to target {uri}: {reason}")]
    TargetUnreachable { uri: String, reason: String },

    #[error("target store failure: {0}")]
    Store(#[from] StoreError),
}

impl MigrateError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SourceUnreadable { .. } => ErrorCode::SourceUnreadable,
            Self::SourceParse { .. } => ErrorCode::SourceParse,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::TargetUnreachable { .. } => ErrorCode::TargetUnreachable,
            Self::Store(_) => ErrorCode::TargetFailure,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
