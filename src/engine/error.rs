use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, fmt_ms};

/// A row that blocks a requested window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRef {
    pub id: Ulid,
    pub kind: &'static str,
    pub start: Ms,
    pub end: Option<Ms>,
}

impl std::fmt::Display for ConflictRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "{} {} [{}, {}]", self.kind, self.id, fmt_ms(self.start), fmt_ms(end)),
            None => write!(f, "{} {} [{}, open]", self.kind, self.id, fmt_ms(self.start)),
        }
    }
}

fn fmt_at(ms: &Ms) -> String {
    fmt_ms(*ms)
}

fn list_conflicts(conflicts: &[ConflictRef]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("window conflicts with {}", list_conflicts(.conflicts))]
    Conflict { conflicts: Vec<ConflictRef> },

    #[error(
        "driver {driver_id} license expires {expires_on}, before planned return {}",
        fmt_at(.planned_return_at)
    )]
    LicenseExpired {
        driver_id: Ulid,
        expires_on: NaiveDate,
        planned_return_at: Ms,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("{actor} may not {action}")]
    Forbidden { actor: String, action: &'static str },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// Errors that abort a whole batch instead of being reported per row.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InvariantViolation(_) | EngineError::WalError(_)
        )
    }

    /// Ids of the rows that caused a conflict, empty for other errors.
    pub fn conflicting_ids(&self) -> Vec<Ulid> {
        match self {
            EngineError::Conflict { conflicts } => conflicts.iter().map(|c| c.id).collect(),
            _ => Vec::new(),
        }
    }
}
