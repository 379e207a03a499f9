//! The single template renderer shared by command rendering, target-path
//! rendering and setup-file rendering.
//!
//! Substitution syntax is a flat `{{name}}` placeholder — no conditionals,
//! no loops. Every scalar is rendered through [`RenderValue`], which decides
//! whether the value is shell-escaped (strings, file lists) or passed through
//! verbatim (numbers, booleans).

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A fully-resolved value ready to be substituted into a template.
///
/// Kept separate from `serde_json::Value` because the render rules are not
/// "however JSON prints" — they are a specific allowlist-escaping policy.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderValue {
    /// Passed through unescaped: INT, FLOAT, BOOL render as their literal text.
    Raw(String),
    /// A single string, shell-escaped and single-quoted.
    Quoted(String),
    /// A list of strings, each shell-escaped/quoted, joined with spaces.
    QuotedList(Vec<String>),
}

impl RenderValue {
    fn render(&self) -> String {
        match self {
            RenderValue::Raw(s) => s.clone(),
            RenderValue::Quoted(s) => quote(s),
            RenderValue::QuotedList(items) => items
                .iter()
                .map(|s| quote(s))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Sanitize then single-quote one scalar per a conservative allowlist:
/// letters, digits, `-_.+` pass through; everything else (including
/// spaces) becomes `_`. The result is wrapped in single quotes, which is
/// safe because the allowlist can never contain a `'`.
fn quote(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("'{sanitized}'")
}

/// A `{{name}} -> value` context built once per render call.
#[derive(Debug, Default, Clone)]
pub struct RenderContext {
    values: BTreeMap<String, RenderValue>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: RenderValue) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RenderValue> {
        self.values.get(name)
    }
}

/// Errors produced while rendering a template.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template references unknown placeholder '{{{{{0}}}}}'")]
    UnknownPlaceholder(String),
}

/// Render `template`, substituting every `{{name}}` occurrence from `ctx`.
///
/// Placeholders not present in `ctx` are an error — the Planner is expected
/// to have already populated every declared parameter (with defaults) before
/// calling this, so a missing key means the template references a name the
/// schema never declared.
pub fn render(template: &str, ctx: &RenderContext) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find("}}") {
                let name = template[i + 2..i + 2 + end].trim();
                let value = ctx
                    .get(name)
                    .ok_or_else(|| RenderError::UnknownPlaceholder(name.to_string()))?;
                write!(out, "{}", value.render()).ok();
                i += 2 + end + 2;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    Ok(out)
}

/// Expand the `{{version}}` / `{{ version }}` macro used by sandbox
/// manifests. A plain string replace, not the general renderer above — the
/// manifest is YAML text the tool author controls, not user input needing
/// escaping.
pub fn expand_version_macro(text: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => text.replace("{{version}}", v).replace("{{ version }}", v),
        None => text.to_string(),
    }
}
