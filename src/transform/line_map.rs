use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{MAIN_FILE, SYNTHETIC_MARKERS};
use crate::host::{Editor, FileStore};

/// `File "<name>", line <N>` fragments as the interpreter prints them.
/// Quote style varies between builds.
static LOCATION_FRAGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"File ["'](?P<file>[^"']+)["'], line (?P<line>\d+)"#)
        .expect("location pattern compiles")
});

/// Inputs for one mapping pass, captured from the transform that
/// produced the code the diagnostic refers to.
pub struct MapContext<'a> {
    pub header_line_count: usize,
    pub original_path: &'a str,
    pub line_map: Option<&'a HashMap<usize, usize>>,
    /// Lines emitted per original line by the instrumentation pass;
    /// 1 for the plain transform. Best-effort heuristic — the explicit
    /// map wins whenever present.
    pub expansion: usize,
}

/// Rewrites interpreter-reported locations (which point into the
/// transformed source) back to the user's original line numbers, and
/// highlights each mapped location in the editor.
pub struct LineMapper {
    editor: Arc<dyn Editor>,
    files: Arc<dyn FileStore>,
}

impl LineMapper {
    pub fn new(editor: Arc<dyn Editor>, files: Arc<dyn FileStore>) -> Self {
        Self { editor, files }
    }

    pub fn map_locations(&self, raw: &str, ctx: &MapContext<'_>) -> String {
        let target_file = canonical_target(ctx.original_path);
        let expansion = ctx.expansion.max(1);
        let known_files: HashSet<String> = self.files.list().into_iter().collect();
        let mut highlighted: HashSet<(String, usize)> = HashSet::new();

        let mapped = LOCATION_FRAGMENT.replace_all(raw, |caps: &Captures<'_>| {
            let file = &caps["file"];
            let line: usize = caps["line"].parse().unwrap_or(1);
            let out_file = if is_synthetic(file) {
                target_file.as_str()
            } else {
                file
            };

            let out_line = if ctx.header_line_count == 0 {
                // Native-async passthrough: the code ran unmodified, so
                // reported lines are already correct.
                line
            } else if line <= ctx.header_line_count {
                // Frame inside the synthetic preamble; should not
                // normally surface. Clamp instead of pointing at code
                // the user never wrote.
                1
            } else if let Some(original) = ctx.line_map.and_then(|map| map.get(&line)) {
                *original
            } else {
                (line - ctx.header_line_count).div_ceil(expansion).max(1)
            };

            if highlighted.insert((out_file.to_string(), out_line))
                && known_files.contains(out_file)
            {
                self.editor.highlight_line(out_file, out_line);
            }

            format!("File \"{out_file}\", line {out_line}")
        });

        mapped.into_owned()
    }
}

fn is_synthetic(file: &str) -> bool {
    SYNTHETIC_MARKERS.contains(&file)
}

/// The caller-supplied original path, unless it does not look like a
/// real workspace path, in which case the canonical main file is used.
fn canonical_target(original_path: &str) -> String {
    let looks_real = original_path.starts_with('/')
        && original_path.len() > 1
        && original_path.rsplit('/').next().is_some_and(|name| name.contains('.'));
    if looks_real {
        original_path.to_string()
    } else {
        MAIN_FILE.to_string()
    }
}
