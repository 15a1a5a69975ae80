use thiserror::Error;

use crate::OperationCategory;

/// Error taxonomy shared by every pipeline stage.
///
/// Only [`PipelineError::WriteFailure`] and [`PipelineError::NoInput`] abort an
/// invocation; everything else is collected into the run summary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{category} mapping incomplete: no header resolves {}", missing.join(", "))]
    MappingIncomplete {
        category: OperationCategory,
        missing: Vec<String>,
    },
    #[error("mapping oracle unavailable: {0}")]
    OracleUnavailable(String),
    #[error("{category} row {row} rejected: {reason}")]
    RecordRejected {
        category: OperationCategory,
        row: usize,
        reason: String,
    },
    #[error("{category} master write failed: {message}")]
    WriteFailure {
        category: OperationCategory,
        message: String,
    },
    #[error("no input tables supplied")]
    NoInput,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WriteFailure { .. } | Self::NoInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_write_failures_and_missing_input_are_fatal() {
        assert!(PipelineError::NoInput.is_fatal());
        assert!(PipelineError::WriteFailure {
            category: OperationCategory::Toa,
            message: "disk full".into()
        }
        .is_fatal());
        assert!(!PipelineError::OracleUnavailable("timeout".into()).is_fatal());
        let incomplete = PipelineError::MappingIncomplete {
            category: OperationCategory::Moa,
            missing: vec!["Operation_Time".into(), "Operation_Type".into()],
        };
        assert!(!incomplete.is_fatal());
        assert_eq!(
            incomplete.to_string(),
            "MOA mapping incomplete: no header resolves Operation_Time, Operation_Type"
        );
    }
}
