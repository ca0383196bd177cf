//==============================================
// File: transform/mod.rs
// License: Duality Public License (DPL v1.0)
// Goal: Guest source transformation
// Objective: Rewrite blocking input calls into host-mediated async calls
//            and wrap guest programs in an async entry point
//==============================================

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

pub mod line_map;


pub use line_map::{LineMapper, MapContext};

/// Canonical path of the main program file in the workspace.
pub const MAIN_FILE: &str = "/main.py";

/// Placeholder filenames the interpreter reports for code executed from
/// an in-memory string.
pub const SYNTHETIC_MARKERS: &[&str] = &["<stdin>", "<exec>", "<string>"];

/// First line of a guest stack trace.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// Raised by the transform footer when no async runner is available.
pub const NO_RUNNER_MARKER: &str = "tidepool: no async runner available";

const BRIDGE_ALIAS: &str = "__tp_bridge";
const WRAPPER_NAME: &str = "__tidepool_main";
const INPUT_CALL: &str = "input";
const INPUT_REWRITE: &str = "await __tp_bridge.get_input";
const TAB_WIDTH: usize = 4;

/// Fixed preamble emitted ahead of the user's code. Entries are logical
/// statements; several span multiple physical lines, so header
/// arithmetic must count newlines in the joined text, never entries.
const PREAMBLE: &[&str] = &[
    "import asyncio as __tp_asyncio",
    "import tidepool_bridge as __tp_bridge",
    "__tp_runner = None",
    "try:\n    __tp_runner = __tp_asyncio.ensure_future\nexcept AttributeError:\n    __tp_runner = None",
    "if __tp_runner is None:\n    try:\n        __tp_runner = __tp_asyncio.get_event_loop().run_until_complete\n    except Exception:\n        __tp_runner = None",
    "async def __tidepool_main():",
];

const FOOTER: &[&str] = &[
    "if __tp_runner is None:",
    "    raise RuntimeError(\"tidepool: no async runner available\")",
    "__tp_runner(__tidepool_main())",
];

/// Output of one transformation pass. Immutable; discarded at run end.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub code: String,
    pub header_line_count: usize,
    /// Transformed line -> original line. Present when the pass moved
    /// statements across lines (walrus splits, trace instrumentation).
    pub line_map: Option<HashMap<usize, usize>>,
    /// Lines emitted per original line (K in the arithmetic fallback).
    pub expansion: usize,
}

/// Number of physical lines occupied by the preamble, including the
/// wrapper `async def` line. The user's first line lands directly after.
pub fn header_line_count() -> usize {
    PREAMBLE.join("\n").lines().count()
}

/// Rewrite blocking `input(...)` call sites into awaited bridge calls
/// and wrap the program so the VM can drive it as one async task.
pub fn transform(user_source: &str) -> TransformResult {
    build(user_source, false)
}

/// Instrumented variant: emits a `__tp_bridge.trace(line)` call ahead
/// of each traceable statement and always returns an explicit line map.
/// The per-line expansion factor is fixed at 2.
pub fn transform_with_trace(user_source: &str) -> TransformResult {
    build(user_source, true)
}

fn build(user_source: &str, traced: bool) -> TransformResult {
    let normalized = normalize_walrus_lines(user_source);
    let any_split = normalized.iter().any(|entry| entry.split);

    let joined: String = normalized
        .iter()
        .map(|entry| entry.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let rewritten = rewrite_input_calls(&joined);

    let header = PREAMBLE.join("\n");
    let header_lines = header.lines().count();

    let mut body = String::new();
    let mut map: HashMap<usize, usize> = HashMap::new();
    let mut emitted = 0usize;
    let mut any_body = false;

    for (rewritten_line, entry) in rewritten.split('\n').zip(normalized.iter()) {
        let converted = expand_leading_tabs(rewritten_line);
        if traced && wants_trace(&converted) {
            let indent: String = converted
                .chars()
                .take_while(|ch| *ch == ' ')
                .collect();
            push_body_line(
                &mut body,
                &format!("{indent}{BRIDGE_ALIAS}.trace({})", entry.original_line),
            );
            emitted += 1;
            map.insert(header_lines + emitted, entry.original_line);
        }
        if !converted.trim().is_empty() {
            any_body = true;
        }
        push_body_line(&mut body, &converted);
        emitted += 1;
        map.insert(header_lines + emitted, entry.original_line);
    }

    if !any_body {
        body.clear();
        body.push_str("    pass\n");
        map.clear();
    }

    let mut code = String::with_capacity(header.len() + body.len() + 128);
    code.push_str(&header);
    code.push('\n');
    code.push_str(&body);
    code.push_str(&FOOTER.join("\n"));
    code.push('\n');

    let expansion = if traced { 2 } else { 1 };
    let line_map = if traced || any_split { Some(map) } else { None };

    TransformResult {
        code,
        header_line_count: header_lines,
        line_map,
        expansion,
    }
}

fn push_body_line(body: &mut String, line: &str) {
    if line.trim().is_empty() {
        body.push('\n');
    } else {
        body.push_str("    ");
        body.push_str(line);
        body.push('\n');
    }
}

/// Statements that must stay adjacent to their block header cannot take
/// a trace call in front of them.
fn wants_trace(line: &str) -> bool {
    let stripped = line.trim_start();
    if stripped.is_empty() || stripped.starts_with('#') {
        return false;
    }
    for prefix in ["else", "elif", "except", "finally", "@", ")", "]", "}"] {
        if stripped.starts_with(prefix) {
            return false;
        }
    }
    true
}

struct NormalizedLine {
    text: String,
    original_line: usize,
    split: bool,
}

static WALRUS_CONDITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<indent>\s*)(?P<kw>if|while)\s+(?P<var>[A-Za-z_][A-Za-z0-9_]*)\s*:=\s*(?P<call>input\s*\(.*?\))\s*:(?P<rest>.*)$",
    )
    .expect("walrus pattern compiles")
});

/// Split `if x := input("p"):` style conditions into an assignment plus
/// a plain test. The awaited rewrite of the call cannot be inlined into
/// a boolean test expression, so the pattern is normalized first.
/// String state is tracked across lines: a matching line inside a
/// triple-quoted literal is data, not code, and is never split.
fn normalize_walrus_lines(source: &str) -> Vec<NormalizedLine> {
    let mut out = Vec::new();
    let mut state = ScanState::Normal;
    for (idx, line) in source.split('\n').enumerate() {
        let original_line = idx + 1;
        let caps = if state == ScanState::Normal {
            WALRUS_CONDITION.captures(line)
        } else {
            None
        };
        state = advance_scan_state(state, line);
        if let Some(caps) = caps {
            let indent = &caps["indent"];
            let var = &caps["var"];
            out.push(NormalizedLine {
                text: format!("{indent}{var} = {}", &caps["call"]),
                original_line,
                split: true,
            });
            out.push(NormalizedLine {
                text: format!("{indent}{} {var}:{}", &caps["kw"], &caps["rest"]),
                original_line,
                split: true,
            });
        } else {
            out.push(NormalizedLine {
                text: line.to_string(),
                original_line,
                split: false,
            });
        }
    }
    out
}

/// Advance the string-scanner state across one physical line, using the
/// same quoting rules as `rewrite_input_calls`. Only triple-quoted
/// state survives the newline; single-line strings terminate with it.
fn advance_scan_state(mut state: ScanState, line: &str) -> ScanState {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        match state {
            ScanState::Normal => {
                if chars[i] == '#' {
                    break;
                }
                if starts_with_at(&chars, i, "'''") {
                    state = ScanState::TripleSingle;
                    i += 3;
                    continue;
                }
                if starts_with_at(&chars, i, "\"\"\"") {
                    state = ScanState::TripleDouble;
                    i += 3;
                    continue;
                }
                if chars[i] == '\'' {
                    state = ScanState::Single;
                } else if chars[i] == '"' {
                    state = ScanState::Double;
                }
                i += 1;
            }
            ScanState::Single | ScanState::Double => {
                let quote = if state == ScanState::Single { '\'' } else { '"' };
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    state = ScanState::Normal;
                }
                i += 1;
            }
            ScanState::TripleSingle | ScanState::TripleDouble => {
                let close = if state == ScanState::TripleSingle {
                    "'''"
                } else {
                    "\"\"\""
                };
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if starts_with_at(&chars, i, close) {
                    state = ScanState::Normal;
                    i += 3;
                    continue;
                }
                i += 1;
            }
        }
    }
    if matches!(state, ScanState::Single | ScanState::Double) {
        ScanState::Normal
    } else {
        state
    }
}

fn expand_leading_tabs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_leading = true;
    for ch in line.chars() {
        if in_leading && ch == '\t' {
            out.push_str(&" ".repeat(TAB_WIDTH));
        } else {
            if ch != ' ' && ch != '\t' {
                in_leading = false;
            }
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    Single,
    Double,
    TripleSingle,
    TripleDouble,
}

/// Rewrite `input(` call sites to awaited bridge calls, skipping string
/// literals and comments. Runs over the whole body so triple-quoted
/// strings spanning lines keep their state. Unterminated strings at end
/// of input are passed through literally.
fn rewrite_input_calls(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len() + 64);
    let mut state = ScanState::Normal;
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];
        match state {
            ScanState::Normal => {
                if ch == '#' {
                    // Comment: copy verbatim to end of line.
                    while i < chars.len() && chars[i] != '\n' {
                        out.push(chars[i]);
                        i += 1;
                    }
                    continue;
                }
                if starts_with_at(&chars, i, "'''") {
                    state = ScanState::TripleSingle;
                    out.push_str("'''");
                    i += 3;
                    continue;
                }
                if starts_with_at(&chars, i, "\"\"\"") {
                    state = ScanState::TripleDouble;
                    out.push_str("\"\"\"");
                    i += 3;
                    continue;
                }
                if ch == '\'' {
                    state = ScanState::Single;
                    out.push(ch);
                    i += 1;
                    continue;
                }
                if ch == '"' {
                    state = ScanState::Double;
                    out.push(ch);
                    i += 1;
                    continue;
                }
                if is_input_call_site(&chars, i) {
                    out.push_str(INPUT_REWRITE);
                    i += INPUT_CALL.len();
                    continue;
                }
                out.push(ch);
                i += 1;
            }
            ScanState::Single | ScanState::Double => {
                let quote = if state == ScanState::Single { '\'' } else { '"' };
                if ch == '\\' && i + 1 < chars.len() {
                    out.push(ch);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if ch == quote || ch == '\n' {
                    state = ScanState::Normal;
                }
                out.push(ch);
                i += 1;
            }
            ScanState::TripleSingle | ScanState::TripleDouble => {
                let close = if state == ScanState::TripleSingle {
                    "'''"
                } else {
                    "\"\"\""
                };
                if ch == '\\' && i + 1 < chars.len() {
                    out.push(ch);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if starts_with_at(&chars, i, close) {
                    state = ScanState::Normal;
                    out.push_str(close);
                    i += 3;
                    continue;
                }
                out.push(ch);
                i += 1;
            }
        }
    }
    out
}

fn starts_with_at(chars: &[char], at: usize, pat: &str) -> bool {
    let pat_chars: Vec<char> = pat.chars().collect();
    if at + pat_chars.len() > chars.len() {
        return false;
    }
    chars[at..at + pat_chars.len()] == pat_chars[..]
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// A rewrite site is the bare identifier `input` followed (after
/// optional whitespace) by an opening parenthesis. Attribute access
/// (`obj.input(...)`) is left alone.
fn is_input_call_site(chars: &[char], at: usize) -> bool {
    if !starts_with_at(chars, at, INPUT_CALL) {
        return false;
    }
    if at > 0 {
        let prev = chars[at - 1];
        if is_ident_char(prev) || prev == '.' {
            return false;
        }
    }
    let mut j = at + INPUT_CALL.len();
    if j < chars.len() && is_ident_char(chars[j]) {
        return false;
    }
    while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
        j += 1;
    }
    j < chars.len() && chars[j] == '('
}
