use thiserror::Error;

use crate::agent::{machine::machine::MachineState, migration::MigrationStage};

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("unsupported source scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("machine '{name}' is {actual}, operation requires {expected}")]
    StateConflict {
        name: String,
        expected: MachineState,
        actual: MachineState,
    },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{stage}: {source:#}")]
    ExternalTool {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The process never came up; there is nothing to kill.
    #[error("machine '{0}' exited during start")]
    StartFailed(String),

    /// The process would not die; needs escalation.
    #[error("machine '{0}' could not be signalled: {1}")]
    KillFailed(String, String),

    #[error("migration failed at {stage}: {source}")]
    Migration {
        stage: MigrationStage,
        #[source]
        source: Box<AgentError>,
    },

    #[error("store: {0:#}")]
    Store(anyhow::Error),
}

impl AgentError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn state_conflict(
        name: impl Into<String>,
        expected: MachineState,
        actual: MachineState,
    ) -> Self {
        Self::StateConflict {
            name: name.into(),
            expected,
            actual,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Validation and state errors describe the request, not the host; retrying them unchanged
    /// cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalTool { .. } | Self::StartFailed(_) | Self::Store(_) => true,
            Self::Migration { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn migration_stage(&self) -> Option<MigrationStage> {
        match self {
            Self::Migration { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Tags a host-level failure with the operation stage it happened in.
pub trait StageContext<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E> StageContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| AgentError::ExternalTool {
            stage,
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_context_wraps_source() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        let err = result.stage("disk resize").unwrap_err();

        assert!(matches!(err, AgentError::ExternalTool { stage: "disk resize", .. }));
        assert_eq!(err.to_string(), "disk resize: boom");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_migration_error_keeps_stage() {
        let err = AgentError::Migration {
            stage: MigrationStage::Transfer,
            source: Box::new(AgentError::not_found("image", "base")),
        };

        assert_eq!(err.migration_stage(), Some(MigrationStage::Transfer));
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "migration failed at transfer: image 'base' not found"
        );
    }
}
