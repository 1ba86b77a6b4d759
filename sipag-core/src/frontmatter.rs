//! Frontmatter Gateway: the only path through which stage/ticket/epic state
//! is persisted.
//!
//! Work-item files are UTF-8 text: a `---`-delimited YAML header ("the
//! frontmatter") followed by a markdown body. This module hand-parses a
//! deliberately small YAML subset — scalars, inline `[a, b]` lists, block
//! lists of scalars, and block lists of small maps (for
//! `pending_merge_parents`) — the same way `task.rs` elsewhere in this
//! workspace hand-parses its own frontmatter dialect, rather than pulling in
//! a general YAML engine with its own notion of key ordering. Unknown keys
//! are never dropped: `write` re-serializes exactly the map it was given.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

/// A loosely-typed frontmatter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Map(FrontmatterMap),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&FrontmatterMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

/// An ordered string-keyed map. Preserves insertion order so unknown keys
/// round-trip through `read`/`write` unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontmatterMap(Vec<(String, Value)>);

impl FrontmatterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or overwrite a key, preserving its original position if it
    /// already existed, otherwise appending.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // ── Typed accessors ────────────────────────────────────────────────

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_map_list(&self, key: &str) -> Vec<&FrontmatterMap> {
        self.get(key)
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(Value::as_map).collect())
            .unwrap_or_default()
    }

    pub fn set_string_list(&mut self, key: impl Into<String>, items: &[String]) {
        self.insert(
            key,
            Value::List(items.iter().map(|s| Value::Str(s.clone())).collect()),
        );
    }
}

/// A parsed work-item file: the frontmatter map and the markdown body text
/// that follows the closing `---`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontmatterDoc {
    pub data: FrontmatterMap,
    pub body: String,
}

/// Read a frontmatter file as `(data, body)`.
pub fn read(path: &Path) -> Result<FrontmatterDoc> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse(&content).with_context(|| format!("failed to parse frontmatter in {}", path.display()))
}

/// Write `(data, body)` back to `path`, replacing its entire contents.
pub fn write(path: &Path, data: &FrontmatterMap, body: &str) -> Result<()> {
    let content = serialize(data, body);
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Parse a frontmatter document from its raw text.
pub fn parse(content: &str) -> Result<FrontmatterDoc> {
    let mut lines = content.lines();
    let Some(first) = lines.next() else {
        return Ok(FrontmatterDoc::default());
    };
    if first.trim_end() != "---" {
        // No frontmatter header: treat the whole file as body.
        return Ok(FrontmatterDoc {
            data: FrontmatterMap::new(),
            body: content.to_string(),
        });
    }

    let rest: Vec<&str> = lines.collect();
    let close_idx = rest
        .iter()
        .position(|l| l.trim_end() == "---")
        .ok_or_else(|| anyhow::anyhow!("unterminated frontmatter header (missing closing ---)"))?;

    let header_lines = &rest[..close_idx];
    let (data, consumed) = parse_map(header_lines, 0, 0)?;
    if consumed != header_lines.len() {
        bail!(
            "unexpected indentation at line {} of frontmatter header",
            consumed + 1
        );
    }

    let body_lines = &rest[close_idx + 1..];
    let mut body = body_lines.join("\n");
    if !body.is_empty() && !body_lines.is_empty() {
        body.push('\n');
    }
    // Strip a single leading blank line, matching how these files are
    // typically authored (blank line right after the closing `---`).
    if let Some(stripped) = body.strip_prefix('\n') {
        body = stripped.to_string();
    }

    Ok(FrontmatterDoc { data, body })
}

fn serialize(data: &FrontmatterMap, body: &str) -> String {
    let mut out = String::from("---\n");
    write_map(&mut out, data, 0);
    out.push_str("---\n");
    if !body.is_empty() {
        out.push('\n');
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn write_map(out: &mut String, map: &FrontmatterMap, indent: usize) {
    let pad = " ".repeat(indent);
    for (key, value) in map.iter() {
        match value {
            Value::Null => out.push_str(&format!("{pad}{key}:\n")),
            Value::Bool(b) => out.push_str(&format!("{pad}{key}: {b}\n")),
            Value::Int(n) => out.push_str(&format!("{pad}{key}: {n}\n")),
            Value::Str(s) => out.push_str(&format!("{pad}{key}: {}\n", quote_if_needed(s))),
            Value::List(items) => {
                if items.is_empty() {
                    out.push_str(&format!("{pad}{key}: []\n"));
                } else {
                    out.push_str(&format!("{pad}{key}:\n"));
                    write_list(out, items, indent);
                }
            }
            Value::Map(m) => {
                if m.is_empty() {
                    out.push_str(&format!("{pad}{key}: {{}}\n"));
                } else {
                    out.push_str(&format!("{pad}{key}:\n"));
                    write_map(out, m, indent + 2);
                }
            }
        }
    }
}

fn write_list(out: &mut String, items: &[Value], indent: usize) {
    let pad = " ".repeat(indent);
    for item in items {
        match item {
            Value::Map(m) => {
                let mut entries = m.iter();
                if let Some((k, v)) = entries.next() {
                    out.push_str(&format!("{pad}- {}: {}\n", k, scalar_repr(v)));
                } else {
                    out.push_str(&format!("{pad}- {{}}\n"));
                }
                for (k, v) in entries {
                    out.push_str(&format!("{pad}  {}: {}\n", k, scalar_repr(v)));
                }
            }
            other => out.push_str(&format!("{pad}- {}\n", scalar_repr(other))),
        }
    }
}

fn scalar_repr(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Str(s) => quote_if_needed(s),
        Value::List(_) | Value::Map(_) => String::new(),
    }
}

fn quote_if_needed(s: &str) -> String {
    let needs_quote = s.is_empty()
        || s.starts_with(['#', '[', '{', '"', '\''])
        || s.contains(": ")
        || matches!(s, "true" | "false" | "null" | "~")
        || s.parse::<i64>().is_ok();
    if needs_quote {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

// ── Parsing internals ───────────────────────────────────────────────────

fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ').count()
}

fn is_blank_or_comment(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t.starts_with('#')
}

fn next_meaningful(lines: &[&str], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < lines.len() {
        if !is_blank_or_comment(lines[i]) {
            return Some((i, indent_of(lines[i])));
        }
        i += 1;
    }
    None
}

/// Parse a block of `key: value` entries at exactly `indent` columns,
/// starting at `idx`. Returns the map and the index of the first line that
/// is no longer part of this block.
fn parse_map(lines: &[&str], mut idx: usize, indent: usize) -> Result<(FrontmatterMap, usize)> {
    let mut map = FrontmatterMap::new();
    loop {
        let Some((line_idx, line_indent)) = next_meaningful(lines, idx) else {
            idx = lines.len();
            break;
        };
        if line_indent != indent {
            idx = line_idx;
            break;
        }
        let content = lines[line_idx][line_indent..].trim_end();
        if content.starts_with("- ") || content == "-" {
            // A list at this indentation, not a map entry — stop here and
            // let the caller (which expected a list) consume it.
            idx = line_idx;
            break;
        }
        let Some(colon) = find_key_colon(content) else {
            bail!("expected `key: value` at line {}", line_idx + 1);
        };
        let key = content[..colon].trim().to_string();
        let rest = content[colon + 1..].trim();
        idx = line_idx + 1;

        if rest.is_empty() {
            match next_meaningful(lines, idx) {
                Some((peek_line_idx, peek_indent)) if peek_indent >= indent => {
                    let peek_line = lines[peek_line_idx][peek_indent..].trim_end();
                    let is_list_item = peek_line.starts_with("- ") || peek_line == "-";
                    if is_list_item {
                        let (items, new_idx) = parse_list(lines, idx, peek_indent)?;
                        map.insert(key, Value::List(items));
                        idx = new_idx;
                    } else if peek_indent > indent {
                        let (sub, new_idx) = parse_map(lines, idx, peek_indent)?;
                        map.insert(key, Value::Map(sub));
                        idx = new_idx;
                    } else {
                        map.insert(key, Value::Null);
                    }
                }
                _ => {
                    map.insert(key, Value::Null);
                }
            }
        } else if rest.starts_with('[') {
            map.insert(key, Value::List(parse_inline_list(rest)?));
        } else if rest.starts_with('{') {
            map.insert(key, Value::Map(parse_inline_map(rest)?));
        } else {
            map.insert(key, parse_scalar(rest));
        }
    }
    Ok((map, idx))
}

/// Find the colon that separates a key from its value, ignoring colons
/// inside a quoted value (simple heuristic: only the first colon matters
/// since keys in this dialect never contain colons).
fn find_key_colon(content: &str) -> Option<usize> {
    content.find(':')
}

/// Parse a block list (`- item` lines) at exactly `indent` columns.
fn parse_list(lines: &[&str], mut idx: usize, indent: usize) -> Result<(Vec<Value>, usize)> {
    let mut items = Vec::new();
    loop {
        let Some((line_idx, line_indent)) = next_meaningful(lines, idx) else {
            idx = lines.len();
            break;
        };
        if line_indent != indent {
            idx = line_idx;
            break;
        }
        let content = lines[line_idx][line_indent..].trim_end();
        if !(content.starts_with("- ") || content == "-") {
            idx = line_idx;
            break;
        }
        let item_content = if content == "-" { "" } else { content[2..].trim_start() };
        idx = line_idx + 1;

        if item_content.is_empty() {
            // Item is a nested map on following, more-indented lines.
            let Some((_, peek_indent)) = next_meaningful(lines, idx) else {
                items.push(Value::Null);
                continue;
            };
            let (sub, new_idx) = parse_map(lines, idx, peek_indent)?;
            items.push(Value::Map(sub));
            idx = new_idx;
        } else if item_content.starts_with('{') {
            items.push(Value::Map(parse_inline_map(item_content)?));
        } else if let Some(colon) = find_key_colon(item_content) {
            // "- key: value" starts an inline map; continuation lines sit
            // two columns past the dash.
            let map_indent = indent + 2;
            let mut map = FrontmatterMap::new();
            let key = item_content[..colon].trim().to_string();
            let rest = item_content[colon + 1..].trim();
            map.insert(key, parse_value_token(rest));
            loop {
                let Some((next_idx, next_indent)) = next_meaningful(lines, idx) else {
                    break;
                };
                if next_indent != map_indent {
                    break;
                }
                let next_content = lines[next_idx][next_indent..].trim_end();
                if next_content.starts_with("- ") || next_content == "-" {
                    break;
                }
                let Some(c) = find_key_colon(next_content) else {
                    break;
                };
                let k = next_content[..c].trim().to_string();
                let r = next_content[c + 1..].trim();
                map.insert(k, parse_value_token(r));
                idx = next_idx + 1;
            }
            items.push(Value::Map(map));
        } else {
            items.push(parse_scalar(item_content));
        }
    }
    Ok((items, idx))
}

fn parse_value_token(rest: &str) -> Value {
    if rest.is_empty() {
        Value::Null
    } else if rest.starts_with('[') {
        Value::List(parse_inline_list(rest).unwrap_or_default())
    } else {
        parse_scalar(rest)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

fn parse_inline_list(rest: &str) -> Result<Vec<Value>> {
    let inner = rest
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| anyhow::anyhow!("malformed inline list: {rest}"))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(split_commas(inner)
        .into_iter()
        .map(|tok| parse_scalar(tok.trim()))
        .collect())
}

fn parse_inline_map(rest: &str) -> Result<FrontmatterMap> {
    let inner = rest
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| anyhow::anyhow!("malformed inline map: {rest}"))?;
    let mut map = FrontmatterMap::new();
    if inner.trim().is_empty() {
        return Ok(map);
    }
    for tok in split_commas(inner) {
        let tok = tok.trim();
        let Some(colon) = find_key_colon(tok) else {
            bail!("malformed inline map entry: {tok}");
        };
        let key = tok[..colon].trim().to_string();
        let val = tok[colon + 1..].trim();
        map.insert(key, parse_scalar(val));
    }
    Ok(map)
}

/// Split on top-level commas, ignoring commas inside quotes.
fn split_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' | '\'' => {
                if in_quote == Some(c) {
                    in_quote = None;
                } else if in_quote.is_none() {
                    in_quote = Some(c);
                }
            }
            '[' | '{' if in_quote.is_none() => depth += 1,
            ']' | '}' if in_quote.is_none() => depth -= 1,
            ',' if in_quote.is_none() && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_scalar(raw: &str) -> Value {
    let raw = raw.trim();
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Value::Str(raw[1..raw.len() - 1].replace("\\\"", "\""));
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "~" | "" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Int(n);
    }
    Value::Str(raw.to_string())
}

impl fmt::Display for FrontmatterDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serialize(&self.data, &self.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_scalars() {
        let content = "---\nid: STAGE-1-1-1\npriority: 3\nis_draft: false\ntitle: \"Fix: the bug\"\n---\nBody text\n";
        let doc = parse(content).unwrap();
        assert_eq!(doc.data.get_str("id"), Some("STAGE-1-1-1"));
        assert_eq!(doc.data.get_int("priority", 0), 3);
        assert!(!doc.data.get_bool("is_draft"));
        assert_eq!(doc.data.get_str("title"), Some("Fix: the bug"));
        assert_eq!(doc.body, "Body text\n");
    }

    #[test]
    fn parses_inline_and_block_lists() {
        let content = "---\ntags: [frontend, backend]\ndepends_on:\n  - STAGE-1-1-1\n  - STAGE-1-1-2\n---\n";
        let doc = parse(content).unwrap();
        assert_eq!(doc.data.get_string_list("tags"), vec!["frontend", "backend"]);
        assert_eq!(
            doc.data.get_string_list("depends_on"),
            vec!["STAGE-1-1-1", "STAGE-1-1-2"]
        );
    }

    #[test]
    fn parses_block_list_of_maps() {
        let content = "---\npending_merge_parents:\n  - parent_stage_id: STAGE-1-1-1\n    branch: feat/a\n    pr_url: https://x/1\n  - parent_stage_id: STAGE-1-1-2\n    branch: feat/b\n---\n";
        let doc = parse(content).unwrap();
        let rows = doc.data.get_map_list("pending_merge_parents");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str("parent_stage_id"), Some("STAGE-1-1-1"));
        assert_eq!(rows[0].get_str("branch"), Some("feat/a"));
        assert_eq!(rows[1].get_str("parent_stage_id"), Some("STAGE-1-1-2"));
    }

    #[test]
    fn no_frontmatter_is_all_body() {
        let doc = parse("just text\nmore text\n").unwrap();
        assert!(doc.data.is_empty());
        assert_eq!(doc.body, "just text\nmore text\n");
    }

    #[test]
    fn unterminated_header_errors() {
        assert!(parse("---\nkey: value\n").is_err());
    }

    #[test]
    fn write_then_read_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stage.md");
        let mut data = FrontmatterMap::new();
        data.insert("id", Value::from("STAGE-1-1-1"));
        data.insert("session_active", Value::from(true));
        data.insert("priority", Value::from(5i64));
        data.set_string_list("refinement_type", &["frontend".to_string(), "ux".to_string()]);
        write(&path, &data, "Some body\n").unwrap();

        let doc = read(&path).unwrap();
        assert_eq!(doc.data.get_str("id"), Some("STAGE-1-1-1"));
        assert!(doc.data.get_bool("session_active"));
        assert_eq!(doc.data.get_int("priority", 0), 5);
        assert_eq!(doc.data.get_string_list("refinement_type"), vec!["frontend", "ux"]);
        assert_eq!(doc.body, "Some body\n");
    }

    #[test]
    fn write_preserves_unknown_keys() {
        let content = "---\nid: STAGE-1\nweird_future_key: 42\n---\nBody\n";
        let mut doc = parse(content).unwrap();
        doc.data.insert("status", Value::from("Build"));
        let serialized = serialize(&doc.data, &doc.body);
        let reparsed = parse(&serialized).unwrap();
        assert_eq!(reparsed.data.get_int("weird_future_key", -1), 42);
        assert_eq!(reparsed.data.get_str("status"), Some("Build"));
    }
}
