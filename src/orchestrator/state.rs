use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::autofix::FixAttempt;
use crate::store::{BuildStatus, GeneratedFile, ValidationSummary};
use crate::validation::{Diagnostic, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Generating,
    Generated,
    Validating,
    AiFixing,
    FinalValidation,
    Complete,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Generated => "generated",
            Self::Validating => "validating",
            Self::AiFixing => "ai_fixing",
            Self::FinalValidation => "final_validation",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Edges of the build pipeline. Any non-terminal phase may fail.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Generating)
                | (Self::Generating, Self::Generated)
                | (Self::Generated, Self::Validating)
                | (Self::Validating, Self::AiFixing)
                | (Self::Validating, Self::FinalValidation)
                | (Self::AiFixing, Self::FinalValidation)
                | (Self::FinalValidation, Self::Complete)
        ) || (!self.is_terminal() && next == Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "generating" => Ok(Self::Generating),
            "generated" => Ok(Self::Generated),
            "validating" => Ok(Self::Validating),
            "ai_fixing" => Ok(Self::AiFixing),
            "final_validation" => Ok(Self::FinalValidation),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Phase after the first validation pass.
pub fn after_validation(errors: usize, max_fix_iterations: u32) -> Phase {
    if errors > 0 && max_fix_iterations > 0 {
        Phase::AiFixing
    } else {
        Phase::FinalValidation
    }
}

/// Terminal status for a build that reached `complete`.
pub fn completed_status(final_errors: usize) -> BuildStatus {
    if final_errors == 0 {
        BuildStatus::Completed
    } else {
        BuildStatus::CompletedWithWarnings
    }
}

/// Everything known when a build completes.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub files: Vec<GeneratedFile>,
    pub validation: ValidationResult,
    pub fix: Option<FixAttempt>,
    pub summary: ValidationSummary,
    pub status: BuildStatus,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub phase: Phase,
    /// Stable machine-readable kind, e.g. `provider_timeout`.
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// Pipeline state with the data each phase hands to the next.
#[derive(Debug, Clone)]
pub enum BuildState {
    Queued,
    Generating,
    Generated {
        files: Vec<GeneratedFile>,
        warnings: Vec<String>,
    },
    Validating {
        files: Vec<GeneratedFile>,
        warnings: Vec<String>,
    },
    AiFixing {
        files: Vec<GeneratedFile>,
        errors: Vec<Diagnostic>,
        errors_fixed: usize,
        warnings: Vec<String>,
    },
    FinalValidation {
        files: Vec<GeneratedFile>,
        fix: Option<FixAttempt>,
        errors_fixed: usize,
        warnings: Vec<String>,
    },
    Complete(Box<BuildReport>),
    Failed(BuildFailure),
}

impl BuildState {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Queued => Phase::Queued,
            Self::Generating => Phase::Generating,
            Self::Generated { .. } => Phase::Generated,
            Self::Validating { .. } => Phase::Validating,
            Self::AiFixing { .. } => Phase::AiFixing,
            Self::FinalValidation { .. } => Phase::FinalValidation,
            Self::Complete(_) => Phase::Complete,
            Self::Failed(_) => Phase::Failed,
        }
    }

    pub fn failed(phase: Phase, kind: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Failed(BuildFailure {
            phase,
            kind: kind.to_string(),
            message: message.into(),
            retryable,
        })
    }

    /// File count carried by the state, for phase events.
    pub fn files_count(&self) -> Option<usize> {
        match self {
            Self::Generated { files, .. }
            | Self::Validating { files, .. }
            | Self::AiFixing { files, .. }
            | Self::FinalValidation { files, .. } => Some(files.len()),
            Self::Complete(report) => Some(report.files.len()),
            _ => None,
        }
    }
}
