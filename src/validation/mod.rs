//! Network-free static validation of generated files.
//!
//! Findings are classified as errors (block a clean result), warnings and
//! suggestions. With `auto_fix` set, a bounded number of local fix passes
//! run and the files are re-checked after each pass.

mod checks;
mod fixes;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{GeneratedFile, ValidationSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    UnbalancedDelimiter,
    MissingUseClient,
    MisplacedDirective,
    InvalidJson,
    SetterMismatch,
    MissingTypeAnnotation,
    ConsoleLog,
    EmptyFile,
    ExplicitAny,
    TrailingWhitespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Suggestion,
}

/// Machine-applicable fix attached to a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixHint {
    Rename { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: Option<usize>,
    pub rule: Rule,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixHint>,
}

impl Diagnostic {
    pub fn new(
        file: &str,
        line: Option<usize>,
        rule: Rule,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.to_string(),
            line,
            rule,
            severity,
            message: message.into(),
            fix: None,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file, line, self.message),
            None => write!(f, "{}: {}", self.file, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    pub auto_fix: bool,
    pub strict_mode: bool,
    /// Upper bound on local fix passes.
    pub max_iterations: u32,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            auto_fix: false,
            strict_mode: false,
            max_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub files_checked: usize,
    pub errors_fixed: usize,
    pub fix_passes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub suggestions: Vec<Diagnostic>,
    pub stats: ValidationStats,
    /// Present only when local fixes changed at least one file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_files: Option<Vec<GeneratedFile>>,
}

impl ValidationResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary {
            errors: self.errors.len(),
            warnings: self.warnings.len(),
            suggestions: self.suggestions.len(),
            errors_fixed: self.stats.errors_fixed,
            is_clean: self.is_clean(),
            fix_iterations: None,
        }
    }

    /// Paths of files with at least one error.
    pub fn files_with_errors(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.errors.iter().map(|d| d.file.as_str()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    fn from_diagnostics(diagnostics: Vec<Diagnostic>, files_checked: usize) -> Self {
        let mut result = Self {
            stats: ValidationStats {
                files_checked,
                ..Default::default()
            },
            ..Default::default()
        };
        for d in diagnostics {
            match d.severity {
                Severity::Error => result.errors.push(d),
                Severity::Warning => result.warnings.push(d),
                Severity::Suggestion => result.suggestions.push(d),
            }
        }
        result
    }
}

/// Stateless; cheap to call more than once per build.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn validate(&self, files: &[GeneratedFile], options: &ValidationOptions) -> ValidationResult {
        let initial = run_checks(files, options.strict_mode);
        if !options.auto_fix {
            return ValidationResult::from_diagnostics(initial, files.len());
        }

        let initial_errors = count_errors(&initial);
        let mut current = files.to_vec();
        let mut diagnostics = initial;
        let mut passes = 0u32;
        while passes < options.max_iterations.max(1) {
            let changed = fixes::apply_fixes(&mut current, &diagnostics);
            if changed == 0 {
                break;
            }
            passes += 1;
            diagnostics = run_checks(&current, options.strict_mode);
            debug!(pass = passes, changed, errors = count_errors(&diagnostics), "Local fix pass");
        }

        let mut result = ValidationResult::from_diagnostics(diagnostics, files.len());
        result.stats.errors_fixed = initial_errors.saturating_sub(result.errors.len());
        result.stats.fix_passes = passes;
        if passes > 0 {
            result.fixed_files = Some(current);
        }
        result
    }
}

fn run_checks(files: &[GeneratedFile], strict: bool) -> Vec<Diagnostic> {
    files
        .iter()
        .flat_map(|f| checks::check_file(f, strict))
        .collect()
}

fn count_errors(diagnostics: &[Diagnostic]) -> usize {
    diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count()
}
