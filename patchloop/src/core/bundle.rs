//! Multi-file bundle codec for model responses.
//!
//! Providers return one text blob encoding zero or more named files delimited
//! by `=== <name> ===` marker lines. Decoding is lenient: stray code fences
//! are stripped and a blob with no markers is treated as the entry file.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Primary entry file of a generated project.
pub const ENTRY_FILE: &str = "main.py";

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*===\s*(.+?)\s*===[ \t]*$").expect("marker regex"));

/// Serialize a file map into one bundle blob.
pub fn encode(files: &BTreeMap<String, String>) -> String {
    let mut buf = String::new();
    for (name, content) in files {
        buf.push_str(&format!("=== {name} ===\n"));
        buf.push_str(content);
        if !content.is_empty() && !content.ends_with('\n') {
            buf.push('\n');
        }
    }
    buf
}

/// Parse a bundle blob into a file map.
///
/// No marker means the whole text is the content of [`ENTRY_FILE`]. An empty
/// block for a named file is a valid empty file, not an omission.
pub fn decode(text: &str) -> BTreeMap<String, String> {
    let cleaned = strip_outer_fence(text);

    let markers: Vec<(usize, usize, String)> = MARKER_RE
        .captures_iter(cleaned)
        .map(|caps| {
            let whole = caps.get(0).expect("match 0");
            let name = caps.get(1).expect("marker name").as_str().trim().to_string();
            (whole.start(), whole.end(), name)
        })
        .collect();

    let mut files = BTreeMap::new();
    if markers.is_empty() {
        files.insert(ENTRY_FILE.to_string(), clean_body(cleaned));
        return files;
    }

    for (i, (_, end, name)) in markers.iter().enumerate() {
        let body_end = markers
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(cleaned.len());
        let body = &cleaned[*end..body_end];
        files.insert(name.clone(), clean_body(body));
    }
    files
}

/// Strip a single fenced-code block wrapping the whole text, if present.
fn strip_outer_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text;
    }
    let Some(first_newline) = trimmed.find('\n') else {
        return text;
    };
    let inner = &trimmed[first_newline + 1..];
    let Some(rest) = inner.trim_end().strip_suffix("```") else {
        return text;
    };
    rest
}

/// Trim blank edges and one fence pair from a file body.
///
/// Non-empty bodies are normalized to end with exactly one newline, so
/// newline-terminated source files survive an encode/decode round trip.
fn clean_body(body: &str) -> String {
    let mut lines: Vec<&str> = body.lines().collect();
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    // Opening fence may carry a language tag; the closing one must be bare.
    if lines.first().is_some_and(|l| l.trim().starts_with("```")) {
        lines.remove(0);
        if lines.last().is_some_and(|l| l.trim() == "```") {
            lines.pop();
        }
        while lines.first().is_some_and(|l| l.trim().is_empty()) {
            lines.remove(0);
        }
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
    }
    if lines.is_empty() {
        String::new()
    } else {
        let mut body = lines.join("\n");
        body.push('\n');
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trips_a_multi_file_map() {
        let files = map(&[
            ("main.py", "print('hi')\n"),
            ("requirements.txt", "requests\n"),
            ("utils.py", "def f():\n    return 1\n"),
        ]);
        assert_eq!(decode(&encode(&files)), files);
    }

    #[test]
    fn decode_is_idempotent_under_reencoding() {
        let raw = "=== main.py ===\n```python\nprint('x')\n```\n=== b.py ===\n\ny = 2\n\n";
        let first = decode(raw);
        let second = decode(&encode(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn no_marker_becomes_the_entry_file() {
        let decoded = decode("print('standalone')\n");
        assert_eq!(decoded, map(&[("main.py", "print('standalone')\n")]));
    }

    #[test]
    fn strips_fences_around_whole_response_and_per_file() {
        let raw = "```python\n=== main.py ===\n```python\nx = 1\n```\n```";
        let decoded = decode(raw);
        assert_eq!(decoded, map(&[("main.py", "x = 1\n")]));
    }

    #[test]
    fn empty_named_block_is_an_empty_file() {
        let decoded = decode("=== main.py ===\nx = 1\n=== empty.py ===\n");
        assert_eq!(decoded, map(&[("main.py", "x = 1\n"), ("empty.py", "")]));
    }

    #[test]
    fn marker_names_are_whitespace_trimmed() {
        let decoded = decode("===   sub/app.py   ===\npass\n");
        assert_eq!(decoded, map(&[("sub/app.py", "pass\n")]));
    }

    #[test]
    fn blank_edges_are_trimmed_from_bodies() {
        let decoded = decode("=== main.py ===\n\n\nx = 1\n\n");
        assert_eq!(decoded, map(&[("main.py", "x = 1\n")]));
    }

    #[test]
    fn newline_terminated_files_round_trip_exactly() {
        let files = map(&[("main.py", "print('tip')\n")]);
        assert_eq!(decode(&encode(&files)), files);
        assert_eq!(
            decode("=== main.py ===\nprint('tip')\n"),
            map(&[("main.py", "print('tip')\n")])
        );
    }
}
