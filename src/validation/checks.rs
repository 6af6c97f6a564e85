//! Individual static checks. Each takes one file and returns its findings.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{Diagnostic, FixHint, Rule, Severity};
use crate::store::GeneratedFile;

static CLIENT_HOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\buse(?:State|Effect|Reducer|Ref|Context|LayoutEffect|Callback|Memo|Transition|Router|Pathname|SearchParams)\s*[(<]",
    )
    .expect("valid hook regex")
});

static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bon(?:Click|Change|Submit|KeyDown|Input)=\{").expect("valid handler regex"));

static USE_CLIENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*['"]use client['"];?\s*$"#).expect("valid directive regex"));

static USE_STATE_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(?P<state>\w+)\s*,\s*(?P<setter>\w+)\s*\]\s*=\s*(?:React\.)?useState\b")
        .expect("valid useState regex")
});

static SETTER_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<pre>[.\w]?)\b(?P<name>set[A-Za-z0-9_]*)\s*\(").expect("valid setter regex"));

static EXPORTED_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"export\s+(?:default\s+)?(?:async\s+)?function\s*(?P<name>\w*)\s*(?:<[^>]*>)?\s*\((?P<params>[^)]*)\)")
        .expect("valid export regex")
});

static EXPLICIT_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\s*any\b|\bas\s+any\b|<any>").expect("valid any regex"));

static CONSOLE_LOG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bconsole\.log\s*\(").expect("valid console regex"));

/// Timer and DOM helpers that look like setters.
const NON_STATE_SETTERS: &[&str] = &[
    "setTimeout",
    "setInterval",
    "setImmediate",
    "setAttribute",
    "setProperty",
    "setItem",
    "setState",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Script { typed: bool, jsx: bool },
    Json { relaxed: bool },
    Css,
    Other,
}

pub(crate) fn file_kind(path: &str) -> FileKind {
    let name = path.rsplit('/').next().unwrap_or(path);
    let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "ts" | "mts" | "cts" => FileKind::Script {
            typed: !name.ends_with(".d.ts"),
            jsx: false,
        },
        "tsx" => FileKind::Script {
            typed: true,
            jsx: true,
        },
        "js" | "mjs" | "cjs" => FileKind::Script {
            typed: false,
            jsx: false,
        },
        "jsx" => FileKind::Script {
            typed: false,
            jsx: true,
        },
        "json" => FileKind::Json {
            relaxed: name.starts_with("tsconfig")
                || name == "jsconfig.json"
                || path.starts_with(".vscode/"),
        },
        "css" | "scss" => FileKind::Css,
        _ => FileKind::Other,
    }
}

pub(crate) fn check_file(file: &GeneratedFile, strict: bool) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    if file.content.trim().is_empty() {
        out.push(Diagnostic::new(
            &file.path,
            None,
            Rule::EmptyFile,
            Severity::Warning,
            "File is empty",
        ));
        return out;
    }

    match file_kind(&file.path) {
        FileKind::Script { typed, .. } => {
            if let Some(d) = check_delimiters(&file.path, &file.content, true) {
                out.push(d);
            }
            out.extend(check_use_client(file));
            out.extend(check_setters(file));
            if typed {
                out.extend(check_type_annotations(file, strict));
                out.extend(check_explicit_any(file));
            }
            out.extend(check_console_log(file));
        }
        FileKind::Json { relaxed } => out.extend(check_json(file, relaxed)),
        FileKind::Css => {
            if let Some(d) = check_delimiters(&file.path, &file.content, false) {
                out.push(d);
            }
        }
        FileKind::Other => {}
    }
    out.extend(check_trailing_whitespace(file));
    out
}

#[derive(Clone, Copy, PartialEq)]
enum LexState {
    Code,
    LineComment,
    BlockComment,
    Str(u8),
    Template,
    Regex { class: bool },
}

/// Keywords after which a `/` starts a regex literal.
const REGEX_KEYWORDS: &[&[u8]] = &[
    b"return", b"typeof", b"case", b"do", b"else", b"in", b"of", b"new", b"delete", b"void",
    b"throw", b"yield", b"await",
];

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Whether the `/` at `at` opens a regex literal rather than dividing,
/// judged by the token in front of it.
fn regex_allowed(bytes: &[u8], at: usize) -> bool {
    let before = &bytes[..at];
    let Some(end) = before.iter().rposition(|b| !b.is_ascii_whitespace()) else {
        return true;
    };
    match before[end] {
        b'(' | b',' | b'=' | b':' | b'[' | b'!' | b'&' | b'|' | b'?' | b'{' | b';' => true,
        // Arrow body; a bare `>` is more often JSX text or a comparison.
        b'>' => end > 0 && before[end - 1] == b'=',
        b if is_ident_byte(b) => {
            let start = before[..end]
                .iter()
                .rposition(|b| !is_ident_byte(*b))
                .map_or(0, |p| p + 1);
            REGEX_KEYWORDS.contains(&&before[start..=end])
        }
        _ => false,
    }
}

/// Checks `()[]{}` balance, skipping strings, comments, regex literals and
/// template text while tracking `${ }` nesting. Reports the first problem only.
pub(crate) fn check_delimiters(path: &str, src: &str, script: bool) -> Option<Diagnostic> {
    let bytes = src.as_bytes();
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut state = LexState::Code;
    let mut line = 1usize;
    let mut i = 0usize;
    let issue = |line: usize, message: String| {
        Some(Diagnostic::new(
            path,
            Some(line),
            Rule::UnbalancedDelimiter,
            Severity::Error,
            message,
        ))
    };

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        if c == b'\n' {
            line += 1;
        }
        match state {
            LexState::Code => match c {
                b'/' if script && next == Some(b'/') => {
                    state = LexState::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = LexState::BlockComment;
                    i += 1;
                }
                b'/' if script && regex_allowed(bytes, i) => state = LexState::Regex { class: false },
                b'"' | b'\'' => state = LexState::Str(c),
                b'`' if script => {
                    stack.push((b'`', line));
                    state = LexState::Template;
                }
                b'(' | b'[' | b'{' => stack.push((c, line)),
                b')' | b']' | b'}' => {
                    let expected = match c {
                        b')' => b'(',
                        b']' => b'[',
                        _ => b'{',
                    };
                    match stack.pop() {
                        Some((b'$', _)) if c == b'}' => state = LexState::Template,
                        Some((open, _)) if open == expected => {}
                        Some((open, opened_at)) => {
                            let open = if open == b'$' { "${".to_string() } else { (open as char).to_string() };
                            return issue(
                                line,
                                format!(
                                    "Mismatched '{}' on line {}: '{}' opened on line {} is still open",
                                    c as char, line, open, opened_at
                                ),
                            );
                        }
                        None => {
                            return issue(line, format!("Unexpected '{}' on line {}", c as char, line));
                        }
                    }
                }
                _ => {}
            },
            LexState::LineComment => {
                if c == b'\n' {
                    state = LexState::Code;
                }
            }
            LexState::BlockComment => {
                if c == b'*' && next == Some(b'/') {
                    state = LexState::Code;
                    i += 1;
                }
            }
            LexState::Str(quote) => {
                if c == b'\\' {
                    if next == Some(b'\n') {
                        line += 1;
                    }
                    i += 1;
                } else if c == quote || c == b'\n' {
                    state = LexState::Code;
                }
            }
            LexState::Regex { class } => {
                if c == b'\\' && next != Some(b'\n') {
                    i += 1;
                } else if c == b'\n' {
                    // Unterminated; resume as code rather than swallow the file.
                    state = LexState::Code;
                } else if class {
                    if c == b']' {
                        state = LexState::Regex { class: false };
                    }
                } else if c == b'[' {
                    state = LexState::Regex { class: true };
                } else if c == b'/' {
                    state = LexState::Code;
                }
            }
            LexState::Template => {
                if c == b'\\' {
                    if next == Some(b'\n') {
                        line += 1;
                    }
                    i += 1;
                } else if c == b'`' {
                    stack.pop();
                    state = LexState::Code;
                } else if c == b'$' && next == Some(b'{') {
                    stack.push((b'$', line));
                    state = LexState::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    if let Some((open, opened_at)) = stack.last() {
        let what = match open {
            b'`' => "template literal".to_string(),
            b'$' => "'${'".to_string(),
            other => format!("'{}'", *other as char),
        };
        return issue(
            *opened_at,
            format!("Unclosed {} opened on line {}", what, opened_at),
        );
    }
    None
}

fn in_client_tree(path: &str) -> bool {
    path.split('/')
        .rev()
        .skip(1)
        .any(|seg| seg == "app" || seg == "components")
}

/// Index of the first line that is not blank or a comment.
pub(crate) fn first_statement_line(content: &str) -> Option<usize> {
    let mut in_block = false;
    for (idx, line) in content.lines().enumerate() {
        let t = line.trim();
        if in_block {
            if t.contains("*/") {
                in_block = false;
            }
            continue;
        }
        if t.is_empty() || t.starts_with("//") {
            continue;
        }
        if t.starts_with("/*") {
            in_block = !t.contains("*/");
            continue;
        }
        return Some(idx);
    }
    None
}

fn check_use_client(file: &GeneratedFile) -> Vec<Diagnostic> {
    if !in_client_tree(&file.path) {
        return Vec::new();
    }
    let directive_at = file
        .content
        .lines()
        .position(|line| USE_CLIENT_LINE.is_match(line));
    let first = first_statement_line(&file.content);
    match directive_at {
        Some(at) if Some(at) == first => Vec::new(),
        Some(at) => vec![Diagnostic::new(
            &file.path,
            Some(at + 1),
            Rule::MisplacedDirective,
            Severity::Error,
            "\"use client\" must be the first statement in the file",
        )],
        None if CLIENT_HOOK.is_match(&file.content) || EVENT_HANDLER.is_match(&file.content) => {
            vec![Diagnostic::new(
                &file.path,
                Some(1),
                Rule::MissingUseClient,
                Severity::Error,
                "Uses client-side hooks or event handlers but is missing the \"use client\" directive",
            )]
        }
        None => Vec::new(),
    }
}

fn line_of(content: &str, byte_offset: usize) -> usize {
    content[..byte_offset].bytes().filter(|b| *b == b'\n').count() + 1
}

fn check_setters(file: &GeneratedFile) -> Vec<Diagnostic> {
    let content = &file.content;
    let declared: Vec<(String, String)> = USE_STATE_DECL
        .captures_iter(content)
        .map(|c| (c["state"].to_string(), c["setter"].to_string()))
        .collect();
    if declared.is_empty() {
        return Vec::new();
    }
    let declared_setters: HashSet<&str> = declared.iter().map(|(_, s)| s.as_str()).collect();
    let called: HashSet<String> = SETTER_CALL
        .captures_iter(content)
        .filter(|c| c["pre"].is_empty())
        .map(|c| c["name"].to_string())
        .collect();

    let mut out = Vec::new();
    let mut reported = HashSet::new();
    for caps in SETTER_CALL.captures_iter(content) {
        if !caps["pre"].is_empty() {
            continue;
        }
        let name = &caps["name"];
        if declared_setters.contains(name)
            || NON_STATE_SETTERS.contains(&name)
            || reported.contains(name)
            || is_defined_elsewhere(content, name)
        {
            continue;
        }
        reported.insert(name.to_string());

        let suggestion = declared
            .iter()
            .find(|(_, setter)| setter.eq_ignore_ascii_case(name))
            .or_else(|| {
                let unused: Vec<_> = declared
                    .iter()
                    .filter(|(_, setter)| !called.contains(setter))
                    .collect();
                (unused.len() == 1).then(|| unused[0])
            });
        let offset = caps.name("name").map(|m| m.start()).unwrap_or(0);
        let mut diagnostic = Diagnostic::new(
            &file.path,
            Some(line_of(content, offset)),
            Rule::SetterMismatch,
            Severity::Error,
            match suggestion {
                Some((state, setter)) => format!(
                    "`{}` is not declared; the setter for `{}` is `{}`",
                    name, state, setter
                ),
                None => format!("`{}` is called but never declared", name),
            },
        );
        if let Some((_, setter)) = suggestion {
            diagnostic.fix = Some(FixHint::Rename {
                from: name.to_string(),
                to: setter.clone(),
            });
        }
        out.push(diagnostic);
    }
    out
}

/// True when `name` appears somewhere other than as a plain call: a prop,
/// parameter, import or function declaration.
fn is_defined_elsewhere(content: &str, name: &str) -> bool {
    let Ok(any_use) = Regex::new(&format!(r"(?:function\s+)?\b{}\b\s*(\()?", regex::escape(name))) else {
        return false;
    };
    any_use.captures_iter(content).any(|c| {
        let whole = c.get(0).map(|m| m.as_str()).unwrap_or("");
        c.get(1).is_none() || whole.starts_with("function")
    })
}

fn check_type_annotations(file: &GeneratedFile, strict: bool) -> Vec<Diagnostic> {
    let severity = if strict {
        Severity::Error
    } else {
        Severity::Warning
    };
    EXPORTED_FN
        .captures_iter(&file.content)
        .filter(|c| {
            let params = c["params"].trim();
            !params.is_empty() && !params.contains(':')
        })
        .map(|c| {
            let name = if c["name"].is_empty() {
                "default export".to_string()
            } else {
                format!("`{}`", &c["name"])
            };
            let offset = c.get(0).map(|m| m.start()).unwrap_or(0);
            Diagnostic::new(
                &file.path,
                Some(line_of(&file.content, offset)),
                Rule::MissingTypeAnnotation,
                severity,
                format!("Exported function {} has untyped parameters", name),
            )
        })
        .collect()
}

fn check_explicit_any(file: &GeneratedFile) -> Vec<Diagnostic> {
    EXPLICIT_ANY
        .find_iter(&file.content)
        .next()
        .map(|m| {
            let count = EXPLICIT_ANY.find_iter(&file.content).count();
            Diagnostic::new(
                &file.path,
                Some(line_of(&file.content, m.start())),
                Rule::ExplicitAny,
                Severity::Suggestion,
                format!("{} use(s) of `any`; prefer a concrete type", count),
            )
        })
        .into_iter()
        .collect()
}

fn check_console_log(file: &GeneratedFile) -> Vec<Diagnostic> {
    CONSOLE_LOG
        .find_iter(&file.content)
        .map(|m| {
            Diagnostic::new(
                &file.path,
                Some(line_of(&file.content, m.start())),
                Rule::ConsoleLog,
                Severity::Warning,
                "console.log left in source",
            )
        })
        .collect()
}

/// Removes `//` and `/* */` comments outside strings (JSONC).
pub(crate) fn strip_json_comments(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_str = false;
    while i < bytes.len() {
        let c = bytes[i];
        if in_str {
            out.push(c);
            if c == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 1;
            } else if c == b'"' {
                in_str = false;
            }
        } else if c == b'"' {
            in_str = true;
            out.push(c);
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                if bytes[i] == b'\n' {
                    out.push(b'\n');
                }
                i += 1;
            }
            i += 2;
            continue;
        } else {
            out.push(c);
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Removes commas directly followed (after whitespace) by `}` or `]`,
/// outside strings.
pub(crate) fn strip_trailing_commas(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut in_str = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_str {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 1;
            } else if c == '"' {
                in_str = false;
            }
        } else if c == '"' {
            in_str = true;
            out.push(c);
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(c);
            }
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

fn check_json(file: &GeneratedFile, relaxed: bool) -> Vec<Diagnostic> {
    let source = if relaxed {
        strip_trailing_commas(&strip_json_comments(&file.content))
    } else {
        file.content.clone()
    };
    match serde_json::from_str::<serde_json::Value>(&source) {
        Ok(_) => Vec::new(),
        Err(e) => vec![Diagnostic::new(
            &file.path,
            Some(e.line()),
            Rule::InvalidJson,
            Severity::Error,
            format!("Invalid JSON: {}", e),
        )],
    }
}

fn check_trailing_whitespace(file: &GeneratedFile) -> Vec<Diagnostic> {
    let mut lines = file
        .content
        .lines()
        .enumerate()
        .filter(|(_, l)| l.ends_with(' ') || l.ends_with('\t'));
    let Some((first, _)) = lines.next() else {
        return Vec::new();
    };
    let count = 1 + lines.count();
    vec![Diagnostic::new(
        &file.path,
        Some(first + 1),
        Rule::TrailingWhitespace,
        Severity::Suggestion,
        format!("{} line(s) with trailing whitespace", count),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> GeneratedFile {
        GeneratedFile::new(path, content, "tsx")
    }

    fn rules(diags: &[Diagnostic]) -> Vec<Rule> {
        diags.iter().map(|d| d.rule).collect()
    }

    #[test]
    fn test_balanced_source_passes() {
        let src = "export function Button({ label }: { label: string }) {\n  return <button onClick={() => alert(`hi ${label}`)}>{label}</button>;\n}\n";
        assert!(check_delimiters("a.tsx", src, true).is_none());
    }

    #[test]
    fn test_missing_closing_brace() {
        let src = "export function Button() {\n  return <button>Hi</button>;\n";
        let d = check_delimiters("a.tsx", src, true).unwrap();
        assert_eq!(d.rule, Rule::UnbalancedDelimiter);
        assert_eq!(d.line, Some(1));
        assert!(d.message.contains("Unclosed '{'"));
    }

    #[test]
    fn test_mismatched_closer_reports_first_only() {
        let src = "const a = [1, 2);\nconst b = (3]);\n";
        let d = check_delimiters("a.ts", src, true).unwrap();
        assert_eq!(d.line, Some(1));
        assert!(d.message.contains("Mismatched ')'"));
    }

    #[test]
    fn test_delimiters_in_strings_and_comments_ignored() {
        let src = "// (unbalanced comment\nconst s = \"{[(\";\nconst t = '}';\n/* ) */\nconst u = `a ${ {x: 1}.x } }`;\n";
        assert!(check_delimiters("a.ts", src, true).is_none());
    }

    #[test]
    fn test_regex_literals_do_not_count_as_delimiters() {
        let cases = [
            "export const isOpen = (s: string) => /[(]/.test(s);\n",
            "const closes = /\\}/g;\n",
            "if (!/[\\])]+$/.test(x)) { run(); }\n",
            "function f(s) {\n  return /^[{]/.test(s) ? 1 : 0;\n}\n",
            "const parts = s.split(/[/(]/);\n",
        ];
        for src in cases {
            assert!(check_delimiters("a.ts", src, true).is_none(), "{}", src);
        }
    }

    #[test]
    fn test_division_is_not_a_regex() {
        let src = "const half = (total / 2) + items[0] / (count);\n";
        assert!(check_delimiters("a.ts", src, true).is_none());
        let jsx = "export const A = () => <div>{a}</div>;\nconst B = () => (<p>{b}</p>);\n";
        assert!(check_delimiters("a.tsx", jsx, true).is_none());
        let broken = "const half = (total / 2;\n";
        assert!(check_delimiters("a.ts", broken, true).is_some());
    }

    #[test]
    fn test_unterminated_string_ends_at_newline() {
        let src = "const s = \"oops;\nconst ok = { a: 1 };\n";
        assert!(check_delimiters("a.ts", src, true).is_none());
    }

    #[test]
    fn test_css_braces() {
        assert!(check_delimiters("a.css", "a { color: red; }\n", false).is_none());
        assert!(check_delimiters("a.css", "a { color: red;\n", false).is_some());
        // `//` is not a comment in CSS, so URLs do not hide braces.
        assert!(check_delimiters("a.css", "a { background: url(http://x/y.png); }", false).is_none());
    }

    #[test]
    fn test_missing_use_client_in_app_dir() {
        let f = file(
            "app/counter/page.tsx",
            "import { useState } from 'react';\nexport default function Page() {\n  const [n, setN] = useState(0);\n  return <p>{n}</p>;\n}\n",
        );
        assert_eq!(rules(&check_use_client(&f)), vec![Rule::MissingUseClient]);

        let outside = file("lib/hooks.ts", "export const x = useState(0);\n");
        assert!(check_use_client(&outside).is_empty());
    }

    #[test]
    fn test_use_client_after_comments_is_first_statement() {
        let f = file(
            "src/app/page.tsx",
            "// Counter page\n/* multi\n line */\n'use client';\nimport { useState } from 'react';\n",
        );
        assert!(check_use_client(&f).is_empty());
    }

    #[test]
    fn test_misplaced_use_client() {
        let f = file(
            "components/Toggle.tsx",
            "import { useState } from 'react';\n\"use client\";\nexport function Toggle() {}\n",
        );
        let diags = check_use_client(&f);
        assert_eq!(rules(&diags), vec![Rule::MisplacedDirective]);
        assert_eq!(diags[0].line, Some(2));
    }

    #[test]
    fn test_setter_case_mismatch_has_fix() {
        let f = file(
            "a.tsx",
            "const [count, setCount] = useState(0);\nconst inc = () => setcount(count + 1);\nsetTimeout(inc, 10);\n",
        );
        let diags = check_setters(&f);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, Some(2));
        assert_eq!(
            diags[0].fix,
            Some(FixHint::Rename {
                from: "setcount".into(),
                to: "setCount".into()
            })
        );
    }

    #[test]
    fn test_setter_renamed_unused_declared_setter() {
        let f = file(
            "a.tsx",
            "const [open, setOpen] = useState(false);\nreturn <button onClick={() => setIsOpen(!open)} />;\n",
        );
        let diags = check_setters(&f);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("setOpen"));
    }

    #[test]
    fn test_setter_from_props_not_flagged() {
        let f = file(
            "a.tsx",
            "export function Modal({ setVisible }: Props) {\n  const [x, setX] = useState(1);\n  setX(2);\n  setVisible(false);\n  el.setAttribute('a', 'b');\n}\n",
        );
        assert!(check_setters(&f).is_empty());
    }

    #[test]
    fn test_type_annotations() {
        let untyped = file("a.ts", "export function add(a, b) { return a + b; }\n");
        let diags = check_type_annotations(&untyped, false);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(check_type_annotations(&untyped, true)[0].severity, Severity::Error);
        let typed = file("a.ts", "export function add(a: number, b: number): number { return a + b; }\nexport function now() { return 1; }\n");
        assert!(check_type_annotations(&typed, true).is_empty());
    }

    #[test]
    fn test_json_checks() {
        let bad = GeneratedFile::new("package.json", "{\n  \"name\": \"app\",\n}\n", "json");
        let diags = check_json(&bad, false);
        assert_eq!(rules(&diags), vec![Rule::InvalidJson]);
        assert_eq!(diags[0].line, Some(3));

        let tsconfig = GeneratedFile::new(
            "tsconfig.json",
            "{\n  // compiler\n  \"compilerOptions\": { \"strict\": true, },\n}\n",
            "json",
        );
        assert!(check_json(&tsconfig, true).is_empty());
    }

    #[test]
    fn test_trailing_commas_inside_strings_preserved() {
        assert_eq!(strip_trailing_commas(r#"{"a": "x,}", }"#), r#"{"a": "x,}" }"#);
    }

    #[test]
    fn test_check_file_collects_suggestions() {
        let f = file(
            "src/util.ts",
            "export function parse(input: any): number {  \n  console.log(input);\n  return 1;\n}\n",
        );
        let diags = check_file(&f, false);
        let found = rules(&diags);
        assert!(found.contains(&Rule::ExplicitAny));
        assert!(found.contains(&Rule::ConsoleLog));
        assert!(found.contains(&Rule::TrailingWhitespace));
        assert!(diags.iter().all(|d| d.severity != Severity::Error));
    }

    #[test]
    fn test_empty_file_warning() {
        let diags = check_file(&file("a.ts", "  \n"), true);
        assert_eq!(rules(&diags), vec![Rule::EmptyFile]);
    }

    #[test]
    fn test_file_kinds() {
        assert_eq!(file_kind("types.d.ts"), FileKind::Script { typed: false, jsx: false });
        assert_eq!(file_kind("tsconfig.base.json"), FileKind::Json { relaxed: true });
        assert_eq!(file_kind("README.md"), FileKind::Other);
    }
}
