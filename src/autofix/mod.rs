//! AI-assisted repair loop.
//!
//! Each iteration sends only the files that still have errors, together with
//! their diagnostics, merges the returned files by path and re-validates.
//! The loop ends on zero errors, at `max_iterations`, after
//! `stagnation_limit` consecutive iterations without improvement, or on the
//! first provider error. The best file set seen so far is always returned.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::ProviderError;
use crate::generation::{GenerationEngine, parse_file_blocks};
use crate::store::{GeneratedFile, ProviderKey};
use crate::validation::{Diagnostic, ValidationOptions, Validator};

pub const REPAIR_SYSTEM_PROMPT: &str = "You repair source files that failed static validation. \
Return every file you change in full as a fenced code block whose info string is `language:path`, \
using exactly the same path. Do not rename, split or omit files you were given.";

const MAX_EXPLANATION_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct AutoFixOptions {
    pub model: String,
    pub max_iterations: u32,
    pub explain_fixes: bool,
    /// Consecutive non-improving iterations before giving up. 0 disables.
    pub stagnation_limit: u32,
    pub strict_mode: bool,
    pub budget: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Resolved,
    MaxIterations,
    Stagnated,
    ProviderError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixChange {
    pub iteration: u32,
    pub path: String,
    pub description: String,
}

/// Outcome of one repair loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    /// Iterations actually run.
    pub iteration: u32,
    pub changes: Vec<FixChange>,
    pub explanation: Option<String>,
    pub confidence: f32,
    pub success: bool,
    pub stop_reason: StopReason,
    pub initial_errors: usize,
    pub remaining_errors: usize,
    #[serde(skip)]
    pub files: Vec<GeneratedFile>,
    #[serde(skip)]
    pub provider_error: Option<ProviderError>,
}

#[derive(Clone)]
pub struct AutoFixEngine {
    generation: GenerationEngine,
    validator: Validator,
}

impl AutoFixEngine {
    pub fn new(generation: GenerationEngine) -> Self {
        Self {
            generation,
            validator: Validator,
        }
    }

    pub async fn run(
        &self,
        files: &[GeneratedFile],
        errors: &[Diagnostic],
        key: &ProviderKey,
        options: &AutoFixOptions,
        cancel: &CancellationToken,
    ) -> FixAttempt {
        let initial_errors = errors.len();
        let mut current = files.to_vec();
        let mut current_errors = errors.to_vec();
        let mut best_files = current.clone();
        let mut best_errors = initial_errors;
        let mut changes = Vec::new();
        let mut explanations = Vec::new();
        // Changes and explanations that produced `best_files`.
        let mut best_changes = Vec::new();
        let mut best_explanations = Vec::new();
        let mut stagnant = 0u32;
        let mut iteration = 0u32;
        let mut stop_reason = StopReason::MaxIterations;
        let mut provider_error = None;

        let validation_options = ValidationOptions {
            auto_fix: true,
            strict_mode: options.strict_mode,
            ..Default::default()
        };

        while iteration < options.max_iterations && !current_errors.is_empty() {
            iteration += 1;
            let prompt = build_repair_prompt(&current, &current_errors, options.explain_fixes);
            let text = match self
                .generation
                .complete_once(
                    REPAIR_SYSTEM_PROMPT,
                    prompt,
                    &options.model,
                    key,
                    options.budget,
                    cancel,
                )
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(iteration, error = %e, "Repair call failed, keeping best files");
                    stop_reason = StopReason::ProviderError;
                    provider_error = Some(e);
                    break;
                }
            };

            let repaired = parse_file_blocks(&text).files;
            for change in merge_files(&mut current, repaired) {
                changes.push(FixChange {
                    iteration,
                    description: describe_change(&change, &current_errors),
                    path: change,
                });
            }
            if options.explain_fixes
                && let Some(explanation) = extract_explanation(&text)
            {
                explanations.push(explanation);
            }

            let validation = self.validator.validate(&current, &validation_options);
            if let Some(fixed) = validation.fixed_files.clone() {
                current = fixed;
            }
            let remaining = validation.errors.len();
            info!(iteration, remaining, best = best_errors, "Repair iteration finished");
            if remaining < best_errors {
                best_errors = remaining;
                best_files = current.clone();
                best_changes = changes.clone();
                best_explanations = explanations.clone();
                stagnant = 0;
            } else {
                stagnant += 1;
            }
            current_errors = validation.errors;

            if remaining == 0 {
                stop_reason = StopReason::Resolved;
                break;
            }
            if options.stagnation_limit > 0 && stagnant >= options.stagnation_limit {
                stop_reason = StopReason::Stagnated;
                break;
            }
        }

        if initial_errors == 0 {
            stop_reason = StopReason::Resolved;
        }
        let success = best_errors == 0;
        let confidence = if initial_errors == 0 {
            1.0
        } else {
            (initial_errors - best_errors) as f32 / initial_errors as f32
        };
        FixAttempt {
            iteration,
            changes: best_changes,
            explanation: (!best_explanations.is_empty()).then(|| best_explanations.join("\n\n")),
            confidence,
            success,
            stop_reason,
            initial_errors,
            remaining_errors: best_errors,
            files: best_files,
            provider_error,
        }
    }
}

pub fn build_repair_prompt(
    files: &[GeneratedFile],
    errors: &[Diagnostic],
    explain: bool,
) -> String {
    let mut by_file: HashMap<&str, Vec<&Diagnostic>> = HashMap::new();
    for d in errors {
        by_file.entry(d.file.as_str()).or_default().push(d);
    }
    let mut out = String::from("The following files failed validation. Fix every listed error.\n\n");
    for file in files {
        let Some(diags) = by_file.get(file.path.as_str()) else {
            continue;
        };
        out.push_str(&format!("File: {}\nErrors:\n", file.path));
        for d in diags {
            out.push_str(&format!("- {}\n", d));
        }
        out.push_str(&format!(
            "\n```{}:{}\n{}\n```\n\n",
            file.language,
            file.path,
            file.content.trim_end()
        ));
    }
    if explain {
        out.push_str("Before the code, briefly explain each fix in plain sentences.\n");
    } else {
        out.push_str("Respond with the corrected files only.\n");
    }
    out
}

/// Replace files by path (appending new ones). Returns changed paths.
fn merge_files(current: &mut Vec<GeneratedFile>, repaired: Vec<GeneratedFile>) -> Vec<String> {
    let mut changed = Vec::new();
    for file in repaired {
        match current.iter_mut().find(|f| f.path == file.path) {
            Some(existing) if existing.content == file.content => {}
            Some(existing) => {
                existing.content = file.content;
                changed.push(existing.path.clone());
            }
            None => {
                changed.push(file.path.clone());
                current.push(file);
            }
        }
    }
    changed
}

fn describe_change(path: &str, errors: &[Diagnostic]) -> String {
    let addressed: Vec<String> = errors
        .iter()
        .filter(|d| d.file == path)
        .map(|d| d.message.clone())
        .collect();
    if addressed.is_empty() {
        "Updated file".to_string()
    } else {
        format!("Addressed: {}", addressed.join("; "))
    }
}

fn extract_explanation(text: &str) -> Option<String> {
    let prose: String = text
        .split("```")
        .step_by(2)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if prose.is_empty() {
        return None;
    }
    Some(prose.chars().take(MAX_EXPLANATION_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::generation::testing::{ScriptedProvider, test_key};
    use crate::validation::Rule;

    const BROKEN: &str = "export function Button(): JSX.Element {\n  return <button>Click</button>;\n";
    const FIXED: &str = "export function Button(): JSX.Element {\n  return <button>Click</button>;\n}\n";

    fn broken_files() -> (Vec<GeneratedFile>, Vec<Diagnostic>) {
        let files = vec![
            GeneratedFile::new("src/Button.tsx", BROKEN, "tsx"),
            GeneratedFile::new("src/index.ts", "export * from './Button';\n", "typescript"),
        ];
        let result = Validator.validate(&files, &ValidationOptions::default());
        assert_eq!(result.errors.len(), 1);
        (files, result.errors)
    }

    fn options(max_iterations: u32) -> AutoFixOptions {
        AutoFixOptions {
            model: "m".into(),
            max_iterations,
            explain_fixes: true,
            stagnation_limit: 2,
            strict_mode: false,
            budget: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_first_iteration_resolves_errors() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(format!(
            "Added the missing closing brace.\n```tsx:src/Button.tsx\n{}```\n",
            FIXED
        ))]));
        let engine = AutoFixEngine::new(GenerationEngine::new(provider.clone(), 1024));
        let (files, errors) = broken_files();
        let attempt = engine
            .run(&files, &errors, &test_key(), &options(3), &CancellationToken::new())
            .await;
        assert!(attempt.success);
        assert_eq!(attempt.iteration, 1);
        assert_eq!(attempt.stop_reason, StopReason::Resolved);
        assert_eq!(attempt.changes.len(), 1);
        assert_eq!(attempt.changes[0].path, "src/Button.tsx");
        assert_eq!(attempt.confidence, 1.0);
        assert_eq!(
            attempt.explanation.as_deref(),
            Some("Added the missing closing brace.")
        );
        assert_eq!(attempt.files.len(), 2);
        assert_eq!(attempt.files[0].content, FIXED);

        // Only the offending file was sent.
        let sent = &provider.requests.lock().unwrap()[0];
        assert!(sent.prompt.contains("src/Button.tsx"));
        assert!(!sent.prompt.contains("src/index.ts"));
        assert_eq!(sent.system, REPAIR_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn test_stagnation_stops_early() {
        let same = format!("```tsx:src/Button.tsx\n{}```\n", BROKEN);
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(same.clone()),
            Ok(same.clone()),
            Ok(same),
        ]));
        let engine = AutoFixEngine::new(GenerationEngine::new(provider.clone(), 1024));
        let (files, errors) = broken_files();
        let attempt = engine
            .run(&files, &errors, &test_key(), &options(5), &CancellationToken::new())
            .await;
        assert!(!attempt.success);
        assert_eq!(attempt.stop_reason, StopReason::Stagnated);
        assert_eq!(attempt.iteration, 2);
        assert_eq!(provider.request_count(), 2);
        assert_eq!(attempt.remaining_errors, 1);
        assert_eq!(attempt.files, files);
    }

    #[tokio::test]
    async fn test_changes_that_did_not_help_are_not_reported() {
        let reworded = format!(
            "Renamed the label.\n```tsx:src/Button.tsx\n{}```\n",
            BROKEN.replace("Click", "Press")
        );
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(reworded.clone()), Ok(reworded)]));
        let engine = AutoFixEngine::new(GenerationEngine::new(provider, 1024));
        let (files, errors) = broken_files();
        let attempt = engine
            .run(&files, &errors, &test_key(), &options(2), &CancellationToken::new())
            .await;
        assert_eq!(attempt.iteration, 2);
        assert!(!attempt.success);
        assert_eq!(attempt.files, files);
        assert!(attempt.changes.is_empty());
        assert!(attempt.explanation.is_none());
    }

    #[tokio::test]
    async fn test_exhausts_iterations_without_stagnation_limit() {
        let same = format!("```tsx:src/Button.tsx\n{}```\n", BROKEN);
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(same.clone()),
            Ok(same.clone()),
            Ok(same),
        ]));
        let engine = AutoFixEngine::new(GenerationEngine::new(provider, 1024));
        let (files, errors) = broken_files();
        let mut opts = options(3);
        opts.stagnation_limit = 0;
        let attempt = engine
            .run(&files, &errors, &test_key(), &opts, &CancellationToken::new())
            .await;
        assert_eq!(attempt.iteration, 3);
        assert_eq!(attempt.stop_reason, StopReason::MaxIterations);
        assert!(!attempt.success);
    }

    #[tokio::test]
    async fn test_provider_error_returns_best_files() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Http {
            status: 500,
            body: "down".into(),
        })]));
        let engine = AutoFixEngine::new(GenerationEngine::new(provider, 1024));
        let (files, errors) = broken_files();
        let attempt = engine
            .run(&files, &errors, &test_key(), &options(3), &CancellationToken::new())
            .await;
        assert_eq!(attempt.stop_reason, StopReason::ProviderError);
        assert!(attempt.provider_error.is_some());
        assert_eq!(attempt.files, files);
        assert!(attempt.changes.is_empty());
        assert_eq!(attempt.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_zero_iterations_is_noop() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let engine = AutoFixEngine::new(GenerationEngine::new(provider.clone(), 1024));
        let (files, errors) = broken_files();
        let attempt = engine
            .run(&files, &errors, &test_key(), &options(0), &CancellationToken::new())
            .await;
        assert_eq!(attempt.iteration, 0);
        assert_eq!(provider.request_count(), 0);
        assert_eq!(attempt.stop_reason, StopReason::MaxIterations);
    }

    #[test]
    fn test_repair_prompt_lists_diagnostics() {
        let (files, errors) = broken_files();
        assert_eq!(errors[0].rule, Rule::UnbalancedDelimiter);
        let prompt = build_repair_prompt(&files, &errors, false);
        assert!(prompt.contains("File: src/Button.tsx"));
        assert!(prompt.contains("- src/Button.tsx:1: Unclosed '{'"));
        assert!(prompt.ends_with("Respond with the corrected files only.\n"));
    }
}
