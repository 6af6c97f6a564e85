//! Extracts file blocks from a completion.
//!
//! Primary form, a fence whose info string carries the path:
//!
//! ````text
//! ```tsx:src/components/Button.tsx
//! export function Button() { ... }
//! ```
//! ````
//!
//! `path=` / `file=` attributes (```` ```tsx path=src/App.tsx ````) are accepted too.
//! Only when the primary form yields nothing, a permissive pass looks for a
//! label line (`**src/App.tsx**`, `### src/App.tsx`, `// File: src/App.tsx`)
//! before a plain fence, or a path comment on the fence's first line.
//!
//! Scanning is line-by-line over a size-capped input, so malformed output
//! costs linear time.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::store::{GeneratedFile, language_for_path};

/// Completions larger than this are truncated before parsing.
pub const MAX_INPUT_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_FILES: usize = 200;

static LABEL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:#{1,6}\s+)?(?:(?://|#|<!--)\s*)?(?:(?i:file(?:name)?|path)\s*:\s*)?(?:\*\*)?`?(?P<path>[\w@.\-/\[\]()]+\.[A-Za-z0-9]+)`?(?:\*\*)?:?\s*(?:-->)?\s*$",
    )
    .expect("valid label regex")
});

static PATH_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?://|#|/\*|<!--)\s*(?i:file(?:name)?|path)\s*:\s*(?P<path>[\w@.\-/\[\]()]+\.[A-Za-z0-9]+)\s*(?:\*/|-->)?\s*$",
    )
    .expect("valid path comment regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Fenced,
    Labelled,
    None,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub files: Vec<GeneratedFile>,
    pub warnings: Vec<String>,
    pub strategy: ParseStrategy,
}

pub fn parse_file_blocks(text: &str) -> ParseOutcome {
    let mut warnings = Vec::new();
    let text = if text.len() > MAX_INPUT_BYTES {
        let mut end = MAX_INPUT_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        warnings.push(format!(
            "Response truncated to {} bytes before parsing",
            MAX_INPUT_BYTES
        ));
        &text[..end]
    } else {
        text
    };

    let mut files = FileSet::default();
    parse_fenced(text, &mut files, &mut warnings);
    let mut strategy = ParseStrategy::Fenced;
    if files.is_empty() {
        parse_labelled(text, &mut files, &mut warnings);
        strategy = ParseStrategy::Labelled;
    }
    if files.is_empty() {
        warnings.push("No file blocks found in response".to_string());
        strategy = ParseStrategy::None;
    }
    ParseOutcome {
        files: files.into_vec(),
        warnings,
        strategy,
    }
}

/// Ordered set keyed by path; a later block for the same path replaces the
/// earlier content but keeps its position.
#[derive(Default)]
struct FileSet {
    files: Vec<GeneratedFile>,
    index: HashMap<String, usize>,
}

impl FileSet {
    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn is_full(&self) -> bool {
        self.files.len() >= MAX_FILES
    }

    fn insert(&mut self, file: GeneratedFile) {
        match self.index.get(&file.path) {
            Some(&i) => self.files[i] = file,
            None => {
                self.index.insert(file.path.clone(), self.files.len());
                self.files.push(file);
            }
        }
    }

    fn into_vec(self) -> Vec<GeneratedFile> {
        self.files
    }
}

fn fence_info(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("```")?;
    Some(rest.trim_start_matches('`').trim())
}

fn is_closing_fence(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 3 && trimmed.bytes().all(|b| b == b'`')
}

/// Normalize and vet a candidate path. Rejects absolute paths, parent
/// traversal and anything that does not look like a file path.
pub fn clean_path(raw: &str) -> Option<String> {
    let path = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let path = path.strip_prefix("./").unwrap_or(path);
    if path.is_empty()
        || path.starts_with('/')
        || path.contains("://")
        || path.chars().any(char::is_whitespace)
        || path.split('/').any(|seg| seg == ".." || seg.is_empty())
    {
        return None;
    }
    if !path.contains('.') && !path.contains('/') {
        return None;
    }
    Some(path.to_string())
}

/// `lang:path`, `lang path=...` or `path=...`.
fn primary_info(info: &str) -> Option<(String, String)> {
    if info.is_empty() {
        return None;
    }
    let mut tokens = info.split_whitespace();
    let first = tokens.next()?;
    if let Some((lang, path)) = first.split_once(':')
        && !lang.contains('=')
        && let Some(path) = clean_path(path)
    {
        return Some((lang.to_lowercase(), path));
    }
    let lang = if first.contains('=') { "" } else { first };
    for token in info.split_whitespace() {
        if let Some(value) = token
            .strip_prefix("path=")
            .or_else(|| token.strip_prefix("file="))
            .or_else(|| token.strip_prefix("filename="))
            && let Some(path) = clean_path(value)
        {
            return Some((lang.to_lowercase(), path));
        }
    }
    None
}

fn make_file(lang: &str, path: String, lines: &[&str]) -> GeneratedFile {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    let language = if lang.is_empty() {
        language_for_path(&path).to_string()
    } else {
        lang.to_string()
    };
    GeneratedFile {
        path,
        content,
        language,
    }
}

fn parse_fenced(text: &str, files: &mut FileSet, warnings: &mut Vec<String>) {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(info) = fence_info(line) else {
            continue;
        };
        let target = primary_info(info);
        let mut body = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            if is_closing_fence(inner) {
                closed = true;
                break;
            }
            body.push(inner);
        }
        let Some((lang, path)) = target else {
            continue;
        };
        if !closed {
            warnings.push(format!("Unterminated block for {}", path));
        }
        if files.is_full() {
            warnings.push(format!("File limit {} reached, ignoring {}", MAX_FILES, path));
            return;
        }
        files.insert(make_file(&lang, path, &body));
    }
}

fn parse_labelled(text: &str, files: &mut FileSet, warnings: &mut Vec<String>) {
    let mut pending_label: Option<String> = None;
    let mut blank_run = 0usize;
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(info) = fence_info(line) else {
            if line.trim().is_empty() {
                blank_run += 1;
                if blank_run > 1 {
                    pending_label = None;
                }
                continue;
            }
            blank_run = 0;
            pending_label = LABEL_LINE
                .captures(line)
                .and_then(|c| clean_path(&c["path"]));
            continue;
        };
        blank_run = 0;
        let lang = info.split_whitespace().next().unwrap_or("").to_lowercase();
        let mut body = Vec::new();
        for inner in lines.by_ref() {
            if is_closing_fence(inner) {
                break;
            }
            body.push(inner);
        }

        let mut path = pending_label.take();
        if path.is_none()
            && let Some(first) = body.first()
            && let Some(caps) = PATH_COMMENT.captures(first)
        {
            path = clean_path(&caps["path"]);
            if path.is_some() {
                body.remove(0);
            }
        }
        let Some(path) = path else {
            continue;
        };
        if files.is_full() {
            warnings.push(format!("File limit {} reached, ignoring {}", MAX_FILES, path));
            return;
        }
        files.insert(make_file(&lang, path, &body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colon_form() {
        let text = "Here is your component.\n\n```tsx:src/components/Button.tsx\nexport function Button() {\n  return <button>Click</button>;\n}\n```\n";
        let outcome = parse_file_blocks(text);
        assert_eq!(outcome.strategy, ParseStrategy::Fenced);
        assert_eq!(outcome.files.len(), 1);
        let file = &outcome.files[0];
        assert_eq!(file.path, "src/components/Button.tsx");
        assert_eq!(file.language, "tsx");
        assert!(file.content.starts_with("export function Button()"));
        assert!(file.content.ends_with("}\n"));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_path_attribute_form() {
        let text = "```json path=\"package.json\"\n{\"name\": \"app\"}\n```\n```css file=styles/site.css\nbody {}\n```";
        let outcome = parse_file_blocks(text);
        let paths: Vec<_> = outcome.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["package.json", "styles/site.css"]);
    }

    #[test]
    fn test_plain_fences_are_ignored_by_primary() {
        let text = "```tsx:app/page.tsx\nexport default function Page() {}\n```\n\nRun it with:\n```bash\nnpm run dev\n```\n";
        let outcome = parse_file_blocks(text);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.strategy, ParseStrategy::Fenced);
    }

    #[test]
    fn test_labelled_fallback_only_when_primary_empty() {
        let text = "**src/App.tsx**\n```tsx\nexport default function App() {}\n```\n\n### src/index.css\n```css\nbody { margin: 0; }\n```\n";
        let outcome = parse_file_blocks(text);
        assert_eq!(outcome.strategy, ParseStrategy::Labelled);
        let paths: Vec<_> = outcome.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["src/App.tsx", "src/index.css"]);

        // With a primary block present, labelled blocks are not considered.
        let mixed = format!("{}```ts:lib/util.ts\nexport {{}}\n```\n", text);
        let outcome = parse_file_blocks(&mixed);
        assert_eq!(outcome.strategy, ParseStrategy::Fenced);
        assert_eq!(outcome.files.len(), 1);
    }

    #[test]
    fn test_path_comment_inside_fence() {
        let text = "```typescript\n// File: lib/math.ts\nexport const add = (a: number, b: number) => a + b;\n```";
        let outcome = parse_file_blocks(text);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].path, "lib/math.ts");
        assert!(!outcome.files[0].content.contains("File:"));
    }

    #[test]
    fn test_zero_files_is_a_warning() {
        let outcome = parse_file_blocks("I cannot help with that.");
        assert!(outcome.files.is_empty());
        assert_eq!(outcome.strategy, ParseStrategy::None);
        assert_eq!(outcome.warnings, ["No file blocks found in response"]);
    }

    #[test]
    fn test_duplicate_paths_last_wins() {
        let text = "```ts:a.ts\none\n```\n```ts:b.ts\nb\n```\n```ts:a.ts\ntwo\n```";
        let outcome = parse_file_blocks(text);
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.files[0].path, "a.ts");
        assert_eq!(outcome.files[0].content, "two\n");
    }

    #[test]
    fn test_unterminated_block_is_kept_with_warning() {
        let outcome = parse_file_blocks("```ts:a.ts\nexport const x = 1;\n");
        assert_eq!(outcome.files.len(), 1);
        assert!(outcome.warnings[0].contains("Unterminated"));
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(clean_path("../etc/passwd").is_none());
        assert!(clean_path("/etc/passwd").is_none());
        assert!(clean_path("https://x.y/z.js").is_none());
        assert!(clean_path("README").is_none());
        assert_eq!(clean_path("./src/a.ts").as_deref(), Some("src/a.ts"));
        assert_eq!(clean_path("src/Dockerfile").as_deref(), Some("src/Dockerfile"));
    }

    #[test]
    fn test_pathological_input_is_bounded() {
        let mut text = String::new();
        for i in 0..(MAX_FILES + 10) {
            text.push_str(&format!("```ts:f{}.ts\nx\n```\n", i));
        }
        text.push_str(&"`".repeat(10_000));
        let outcome = parse_file_blocks(&text);
        assert_eq!(outcome.files.len(), MAX_FILES);
        assert!(outcome.warnings.iter().any(|w| w.contains("File limit")));
    }

    #[test]
    fn test_oversized_input_truncated() {
        let mut text = String::from("```ts:a.ts\n");
        text.push_str(&"é".repeat(MAX_INPUT_BYTES));
        let outcome = parse_file_blocks(&text);
        assert!(outcome.warnings.iter().any(|w| w.contains("truncated")));
        assert_eq!(outcome.files.len(), 1);
    }
}
