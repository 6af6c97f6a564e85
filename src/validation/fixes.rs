//! Deterministic local corrections. Only rules with a mechanical, safe fix
//! are handled; delimiter balance is left to the AI repair loop.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::checks::{first_statement_line, strip_trailing_commas};
use super::{Diagnostic, FixHint, Rule};
use crate::store::GeneratedFile;

static USE_CLIENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*['"]use client['"];?\s*$"#).expect("valid directive regex"));

/// Apply fixes for the given diagnostics in place. Returns how many files
/// changed.
pub(crate) fn apply_fixes(files: &mut [GeneratedFile], diagnostics: &[Diagnostic]) -> usize {
    let mut by_file: HashMap<&str, Vec<&Diagnostic>> = HashMap::new();
    for d in diagnostics {
        by_file.entry(d.file.as_str()).or_default().push(d);
    }

    let mut changed = 0;
    for file in files.iter_mut() {
        let Some(diags) = by_file.get(file.path.as_str()) else {
            continue;
        };
        let mut content = file.content.clone();
        for d in diags {
            content = match (&d.rule, &d.fix) {
                (Rule::MissingUseClient | Rule::MisplacedDirective, _) => ensure_use_client(&content),
                (Rule::InvalidJson, _) => fix_json(&content).unwrap_or(content),
                (Rule::SetterMismatch, Some(FixHint::Rename { from, to })) => {
                    rename_calls(&content, from, to)
                }
                (Rule::TrailingWhitespace, _) => trim_trailing_whitespace(&content),
                _ => content,
            };
        }
        if content != file.content {
            file.content = content;
            changed += 1;
        }
    }
    changed
}

/// Put `"use client";` as the first statement, removing any later copy.
pub(crate) fn ensure_use_client(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if let Some(first) = first_statement_line(content)
        && USE_CLIENT_LINE.is_match(lines[first])
    {
        return content.to_string();
    }
    let rest: Vec<&str> = lines
        .into_iter()
        .filter(|l| !USE_CLIENT_LINE.is_match(l))
        .collect();
    let mut out = String::from("\"use client\";\n\n");
    out.push_str(rest.join("\n").trim_start_matches('\n'));
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn fix_json(content: &str) -> Option<String> {
    let candidate = strip_trailing_commas(content);
    serde_json::from_str::<serde_json::Value>(&candidate)
        .ok()
        .map(|_| candidate)
}

fn rename_calls(content: &str, from: &str, to: &str) -> String {
    let Ok(pattern) = Regex::new(&format!(r"(^|[^.\w]){}(\s*\()", regex::escape(from))) else {
        return content.to_string();
    };
    pattern
        .replace_all(content, format!("${{1}}{}${{2}}", to).as_str())
        .into_owned()
}

fn trim_trailing_whitespace(content: &str) -> String {
    let mut out: String = content
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}
