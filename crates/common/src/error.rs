use thiserror::Error;

/// Canonical keel error taxonomy used across crates.
///
/// Classification guidance:
/// - [`KeelError::StatementNotFound`]: `EXECUTE` names/ids with no registered prepared statement
/// - [`KeelError::PlanBuild`]: query shape/name/type issues discovered while building a plan
/// - [`KeelError::PrivilegeDenied`] / [`KeelError::TableLocked`]: validation gates after build
/// - [`KeelError::NoPlanFound`]: optimizer could not produce a physical plan (internal class)
/// - [`KeelError::SnapshotTooOld`] / [`KeelError::SafePointUnavailable`]: GC consistency guard
/// - [`KeelError::Cancelled`]: the query context was cancelled while waiting on I/O
/// - [`KeelError::InvalidConfig`]: catalog/config/environment contract violations
/// - [`KeelError::Unsupported`]: syntactically valid but intentionally unimplemented behavior
/// - [`KeelError::Storage`]: failures reported by the restricted system query interface
/// - [`KeelError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum KeelError {
    /// Prepared statement lookup failed (by name or by numeric id).
    #[error("prepared statement not found: {0}")]
    StatementNotFound(String),

    /// Logical plan construction failures.
    ///
    /// Examples:
    /// - unknown table/column
    /// - wrong number of values for INSERT
    /// - wrong number of EXECUTE arguments
    #[error("plan build error: {0}")]
    PlanBuild(String),

    /// None of the session's active roles holds the required privilege.
    #[error("{privilege} command denied to roles [{roles}] for table '{object}'")]
    PrivilegeDenied {
        /// Privilege that was required.
        privilege: String,
        /// Rendered active roles.
        roles: String,
        /// Qualified object name.
        object: String,
    },

    /// Referenced table lock state is incompatible with the statement access mode.
    #[error("table '{table}' is locked: {reason}")]
    TableLocked {
        /// Qualified table name.
        table: String,
        /// Human-readable conflict description.
        reason: String,
    },

    /// Optimizer exhausted the search space without a valid physical plan.
    #[error("internal error: no physical plan found: {0}")]
    NoPlanFound(String),

    /// Requested snapshot is older than the GC safe point.
    #[error("snapshot is older than GC safe point {safe_point}")]
    SnapshotTooOld {
        /// Rendered safe point time.
        safe_point: String,
    },

    /// GC safe point could not be read (missing or ambiguous row).
    #[error("can not get '{0}'")]
    SafePointUnavailable(String),

    /// The query context was cancelled.
    #[error("query cancelled")]
    Cancelled,

    /// Invalid or inconsistent configuration/catalog state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure reported by the restricted system query interface.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fieldless error classification, used for metrics labels and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StatementNotFound,
    PlanBuild,
    PrivilegeDenied,
    TableLocked,
    NoPlanFound,
    SnapshotTooOld,
    SafePointUnavailable,
    Cancelled,
    InvalidConfig,
    Unsupported,
    Storage,
    Io,
}

impl ErrorKind {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StatementNotFound => "statement_not_found",
            ErrorKind::PlanBuild => "plan_build",
            ErrorKind::PrivilegeDenied => "privilege_denied",
            ErrorKind::TableLocked => "table_locked",
            ErrorKind::NoPlanFound => "no_plan_found",
            ErrorKind::SnapshotTooOld => "snapshot_too_old",
            ErrorKind::SafePointUnavailable => "safe_point_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Storage => "storage",
            ErrorKind::Io => "io",
        }
    }
}

impl KeelError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeelError::StatementNotFound(_) => ErrorKind::StatementNotFound,
            KeelError::PlanBuild(_) => ErrorKind::PlanBuild,
            KeelError::PrivilegeDenied { .. } => ErrorKind::PrivilegeDenied,
            KeelError::TableLocked { .. } => ErrorKind::TableLocked,
            KeelError::NoPlanFound(_) => ErrorKind::NoPlanFound,
            KeelError::SnapshotTooOld { .. } => ErrorKind::SnapshotTooOld,
            KeelError::SafePointUnavailable(_) => ErrorKind::SafePointUnavailable,
            KeelError::Cancelled => ErrorKind::Cancelled,
            KeelError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            KeelError::Unsupported(_) => ErrorKind::Unsupported,
            KeelError::Storage(_) => ErrorKind::Storage,
            KeelError::Io(_) => ErrorKind::Io,
        }
    }

    /// Internal-error class: should not happen for well-formed input.
    pub fn is_internal(&self) -> bool {
        matches!(self, KeelError::NoPlanFound(_))
    }
}

/// Standard keel result alias.
pub type Result<T> = std::result::Result<T, KeelError>;
