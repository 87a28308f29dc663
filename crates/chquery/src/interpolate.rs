/// Dashboard variable interpolation
///
/// A variable's rendering depends on where it appears: raw inside string
/// literals and identifiers, a quoted comma list inside `IN (...)` and other
/// scalar positions, an array literal inside array functions.
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::parser::between_braces;

/// Value the UI uses for the "All" option
pub const ALL_VALUE: &str = "$__all";

/// Functions whose arguments are arrays
const ARRAY_FUNCTIONS: &[&str] = &[
    "array",
    "arrayall",
    "arrayconcat",
    "arraydistinct",
    "arrayexists",
    "arrayintersect",
    "arrayjoin",
    "arrayreversesort",
    "arraysort",
    "arrayuniq",
    "arrayzip",
    "hasall",
    "hasany",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unable to find closing brace for {name} at [{remainder}]")]
    Unclosed { name: &'static str, remainder: String },

    #[error("$conditionalTest expects an expression and a variable, got [{0}]")]
    MissingVariable(String),
}

/// Current selection of a variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Single(String),
    Multi(Vec<String>),
}

impl VariableValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            VariableValue::Single(value) => vec![value.as_str()],
            VariableValue::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Single(value.to_string())
    }
}

impl From<Vec<&str>> for VariableValue {
    fn from(values: Vec<&str>) -> Self {
        VariableValue::Multi(values.into_iter().map(str::to_string).collect())
    }
}

/// A dashboard template variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub current: VariableValue,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub include_all: bool,
    /// Every selectable value
    #[serde(default)]
    pub options: Vec<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>, current: impl Into<VariableValue>) -> Self {
        Self {
            name: name.into(),
            current: current.into(),
            multi: false,
            include_all: false,
            options: Vec::new(),
        }
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn include_all(mut self) -> Self {
        self.include_all = true;
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    fn is_all_selected(&self) -> bool {
        self.include_all && self.current.values().first() == Some(&ALL_VALUE)
    }

    /// Selected values, with "All" expanded to every option
    pub fn selected(&self) -> Vec<&str> {
        if self.is_all_selected() {
            return self
                .options
                .iter()
                .map(String::as_str)
                .filter(|o| *o != ALL_VALUE)
                .collect();
        }
        self.current.values()
    }

    /// Nothing selected: an empty value, an empty list or "All"
    pub fn is_unset(&self) -> bool {
        self.is_all_selected() || self.current.values().iter().all(|v| v.is_empty())
    }

    /// Quote unless every option, or every selected value when there are no
    /// options, is an unsigned integer
    fn is_numeric(&self) -> bool {
        let numeric = |v: &str| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit());
        if self.options.is_empty() {
            self.current.values().into_iter().all(numeric)
        } else {
            self.options
                .iter()
                .filter(|o| *o != ALL_VALUE)
                .all(|o| numeric(o.as_str()))
        }
    }
}

/// Syntactic position of a variable occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Inside a string literal or part of an identifier: raw text
    Bare,
    /// Scalar position: comma separated escaped literals
    Quoted,
    /// Argument of an array function: `['a', 'b']`
    ArrayBracketed,
}

/// Context of the occurrence of `name` starting at byte `offset` of `query`
pub fn classify(query: &str, offset: usize, name: &str) -> Context {
    let before = &query[..offset];
    let line = &before[before.rfind('\n').map_or(0, |i| i + 1)..];
    if unescaped_quotes(line) % 2 == 1 {
        return Context::Bare;
    }

    if let Some(func) = enclosing_call(before) {
        let func = func.to_ascii_lowercase();
        if func == "in" || func == "tuple" {
            return Context::Quoted;
        }
        if ARRAY_FUNCTIONS.contains(&func.as_str()) {
            return Context::ArrayBracketed;
        }
    }

    let end = occurrence_end(query, offset, name);
    if before.ends_with('.') || query[end..].starts_with('.') {
        return Context::Bare;
    }
    Context::Quoted
}

fn unescaped_quotes(text: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in text.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '\'' => count += 1,
            _ => {}
        }
    }
    count
}

/// Name of the function (or keyword) whose parenthesis encloses the end of `before`
fn enclosing_call(before: &str) -> Option<&str> {
    let mut depth = 0;
    for (i, c) in before.char_indices().rev() {
        match c {
            ')' => depth += 1,
            '(' if depth == 0 => {
                let head = before[..i].trim_end();
                let name = head
                    .rsplit(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .next()?;
                return (!name.is_empty()).then_some(name);
            }
            '(' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn occurrence_end(query: &str, offset: usize, name: &str) -> usize {
    let rest = &query[offset..];
    let len = if rest.starts_with("${") || rest.starts_with("[[") {
        name.len() + 4 - usize::from(rest.starts_with("${"))
    } else {
        name.len() + 1
    };
    (offset + len).min(query.len())
}

fn escape(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Render a variable for the given context
pub fn render(variable: &Variable, context: Context) -> String {
    let values = variable.selected();
    if (!variable.multi && !variable.include_all) || context == Context::Bare {
        return values.join(",");
    }

    let quoted: Vec<String> = if variable.is_numeric() {
        values.iter().map(|v| v.to_string()).collect()
    } else {
        values.iter().map(|v| escape(v)).collect()
    };
    match context {
        Context::ArrayBracketed => format!("[{}]", quoted.join(", ")),
        _ => quoted.join(","),
    }
}

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(\w+)(?::(\w+))?\}|\$(\w+)|\[\[(\w+)\]\]").expect("variable pattern is valid")
});

fn join_quoted(values: &[&str], quote: char, escape: impl Fn(&str) -> String) -> String {
    values
        .iter()
        .map(|v| format!("{quote}{}{quote}", escape(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a `${name:format}` occurrence, `None` for formats we don't know
pub fn render_format(variable: &Variable, format: &str) -> Option<String> {
    let values = variable.selected();
    let rendered = match format {
        "csv" | "raw" | "text" => values.join(","),
        "pipe" => values.join("|"),
        "singlequote" => join_quoted(&values, '\'', |v| v.replace('\'', "\\'")),
        "doublequote" => join_quoted(&values, '"', |v| v.replace('"', "\\\"")),
        "sqlstring" => join_quoted(&values, '\'', |v| v.replace('\'', "''")),
        _ => return None,
    };
    Some(rendered)
}

/// Replace every known variable occurrence; unknown names are left in place
pub fn interpolate(query: &str, variables: &[Variable]) -> String {
    if variables.is_empty() {
        return query.to_string();
    }

    let mut out = String::with_capacity(query.len());
    let mut last = 0;
    for captures in VARIABLE_RE.captures_iter(query) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let Some(name) = captures
            .get(1)
            .or_else(|| captures.get(3))
            .or_else(|| captures.get(4))
            .map(|m| m.as_str())
        else {
            continue;
        };
        let Some(variable) = variables.iter().find(|v| v.name == name) else {
            continue;
        };

        let format = captures.get(2).map(|m| m.as_str());
        let rendered = match format.map(|format| (format, render_format(variable, format))) {
            Some((_, Some(rendered))) => rendered,
            Some((format, None)) => {
                warn!(variable = name, format, "unknown variable format, rendering by context");
                render(variable, classify(query, whole.start(), name))
            }
            None => render(variable, classify(query, whole.start(), name)),
        };
        out.push_str(&query[last..whole.start()]);
        out.push_str(&rendered);
        last = whole.end();
    }
    out.push_str(&query[last..]);
    out
}

/// Replace every `name(...)` call in `query` with `replacement(body)`
fn replace_calls(
    query: &str,
    name: &'static str,
    mut replacement: impl FnMut(&str) -> Result<String, TemplateError>,
) -> Result<String, TemplateError> {
    let call = format!("{name}(");
    let mut query = query.to_string();
    while let Some(start) = query.find(&call) {
        let body_start = start + call.len();
        let body = between_braces(&query[body_start..])
            .map_err(|_| TemplateError::Unclosed {
                name,
                remainder: query[start..].to_string(),
            })?
            .to_string();
        let replaced = replacement(&body)?;
        query.replace_range(start..body_start + body.len() + 1, &replaced);
    }
    Ok(query)
}

/// `$conditionalTest(expr, $var)` keeps `expr` only when `$var` has a selection
pub fn conditional_test(query: &str, variables: &[Variable]) -> Result<String, TemplateError> {
    replace_calls(query, "$conditionalTest", |body| {
        let Some((expr, reference)) = body.rsplit_once(',') else {
            return Err(TemplateError::MissingVariable(body.to_string()));
        };
        let name = reference
            .trim()
            .trim_start_matches('$')
            .trim_start_matches('{')
            .trim_end_matches('}')
            .split(':')
            .next()
            .unwrap_or_default();
        let keep = match variables.iter().find(|v| v.name == name) {
            Some(variable) => !variable.is_unset(),
            None => {
                warn!(variable = name, "unknown variable in $conditionalTest, keeping the expression");
                true
            }
        };
        Ok(if keep { expr.trim().to_string() } else { String::new() })
    })
}

/// `$unescape('expr')` strips the quotes around an interpolated expression
pub fn unescape(query: &str) -> Result<String, TemplateError> {
    replace_calls(query, "$unescape", |body| {
        Ok(body.trim().replace(['\'', '"'], ""))
    })
}
