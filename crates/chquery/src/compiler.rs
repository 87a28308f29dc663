/// Query compilation pipeline
///
/// Template text goes through `$conditionalTest`, parsing, ad-hoc injection,
/// macro expansion, placeholder substitution, `$unescape` and finally variable
/// interpolation. Parse failures abort; rewrite failures (bad macro arguments,
/// a `FROM` the injector can't read) are logged and the un-rewritten text is
/// compiled instead.
use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::adhoc::{self, AdHocError, AdHocFilter};
use super::ast::Query;
use super::interpolate::{self, TemplateError, Variable};
use super::macros::{self, MacroError};
use super::parser::{self, ParseError, DEFAULT_MAX_DEPTH};
use super::printer;
use super::time::{self, DateTimeType, TimeError, TimeRange};

/// Time column used by annotation queries
pub const ANNOTATION_DATE_TIME_COL: &str = "time";
/// Interval used by annotation queries
pub const ANNOTATION_INTERVAL: &str = "30s";

/// A panel query and the table it reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Target {
    pub query: String,
    pub database: String,
    pub table: String,
    /// `Date` column used for partition pruning, may be empty
    #[serde(rename = "dateColDataType")]
    pub date_col: String,
    /// Column holding the event time
    #[serde(rename = "dateTimeColDataType")]
    pub date_time_col: String,
    #[serde(rename = "dateTimeType")]
    pub date_time_type: DateTimeType,
    /// Bucket width, falls back to the panel interval when empty
    pub interval: String,
    pub interval_factor: u32,
    /// Range rounding: empty, `$step` or a duration
    pub round: String,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            query: String::new(),
            database: String::new(),
            table: String::new(),
            date_col: String::new(),
            date_time_col: String::new(),
            date_time_type: DateTimeType::default(),
            interval: String::new(),
            interval_factor: 1,
            round: String::new(),
        }
    }
}

impl Target {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Annotation queries always bucket on `time` every 30 seconds
    pub fn for_annotation(mut self) -> Self {
        self.date_time_col = ANNOTATION_DATE_TIME_COL.to_string();
        self.interval = ANNOTATION_INTERVAL.to_string();
        self
    }

    /// `db.table`, or the bare table without a database
    pub fn qualified_table(&self) -> String {
        if self.database.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.database, self.table)
        }
    }
}

/// Per-request inputs shared by every target of a panel
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub range: TimeRange,
    /// Panel interval, used when the target has none
    pub interval: String,
    pub adhoc_filters: Vec<AdHocFilter>,
    pub variables: Vec<Variable>,
}

impl QueryOptions {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            interval: "30s".to_string(),
            adhoc_filters: Vec::new(),
            variables: Vec::new(),
        }
    }
}

/// Errors that abort compilation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Interval(#[from] TimeError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Failures that fall back to the un-rewritten query
#[derive(Error, Debug)]
enum RewriteError {
    #[error(transparent)]
    Macro(#[from] MacroError),

    #[error(transparent)]
    AdHoc(#[from] AdHocError),
}

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$table\b").expect("pattern is valid"));
static DATE_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$dateCol\b").expect("pattern is valid"));
static DATE_TIME_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$dateTimeCol\b").expect("pattern is valid"));
static INTERVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$interval\b").expect("pattern is valid"));
static INTERVAL_MS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$__interval_ms\b").expect("pattern is valid"));
static ADHOC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$adhoc\b").expect("pattern is valid"));

/// Compiles one target against the request options
pub struct SqlQuery<'a> {
    target: &'a Target,
    options: &'a QueryOptions,
    max_depth: usize,
}

impl<'a> SqlQuery<'a> {
    pub fn new(target: &'a Target, options: &'a QueryOptions) -> Self {
        Self {
            target,
            options,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Produce the final SQL
    pub fn replace(&self) -> Result<String, CompileError> {
        let target = self.target;
        let options = self.options;

        let query = interpolate::conditional_test(target.query.trim(), &options.variables)?;

        let interval_text = if target.interval.is_empty() {
            options.interval.as_str()
        } else {
            target.interval.as_str()
        };
        let interval = time::convert_interval(interval_text, target.interval_factor)?;
        let interval_ms = time::convert_interval_ms(interval_text, target.interval_factor)?;
        let round = time::parse_round(&target.round, interval)?;
        debug!(interval, interval_ms, round, "resolved query interval");

        let ast = parser::parse_with_max_depth(&query, self.max_depth)?;
        let (query, conditions) = match self.rewrite(&query, ast) {
            Ok(rewritten) => rewritten,
            Err(err) => {
                warn!(error = %err, "query rewrite failed, using the query as written");
                (query, Vec::new())
            }
        };

        let adhoc = if conditions.is_empty() {
            "1".to_string()
        } else {
            format!("({})", conditions.join(" AND "))
        };

        let query = time::replace_time_filters(
            &query,
            &options.range,
            target.date_time_type,
            !target.date_col.is_empty(),
            round,
        )?;
        let table = target.qualified_table();
        let interval = interval.to_string();
        let interval_ms = interval_ms.to_string();
        let query = TABLE_RE.replace_all(&query, NoExpand(&table));
        let query = DATE_COL_RE.replace_all(&query, NoExpand(&target.date_col));
        let query = DATE_TIME_COL_RE.replace_all(&query, NoExpand(&target.date_time_col));
        let query = INTERVAL_RE.replace_all(&query, NoExpand(&interval));
        let query = INTERVAL_MS_RE.replace_all(&query, NoExpand(&interval_ms));
        let query = ADHOC_RE.replace_all(&query, NoExpand(&adhoc));

        let query = interpolate::unescape(&query)?;
        let query = interpolate::interpolate(&query, &options.variables);

        debug!(sql = %query, "compiled query");
        Ok(query)
    }

    /// Ad-hoc injection followed by macro expansion
    fn rewrite(&self, query: &str, mut ast: Query) -> Result<(String, Vec<String>), RewriteError> {
        let filters = &self.options.adhoc_filters;
        let conditions = adhoc::inject(&mut ast, self.target, filters)?;
        let query = if filters.is_empty() {
            query.to_string()
        } else {
            printer::print(&ast, "")
        };
        let query = macros::expand(&query, &ast)?;
        Ok((query, conditions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> QueryOptions {
        QueryOptions::new(TimeRange::from_timestamps(1_700_000_000, 1_700_003_600).unwrap())
    }

    fn target(query: &str) -> Target {
        Target {
            database: "default".to_string(),
            table: "requests".to_string(),
            date_col: "EventDate".to_string(),
            date_time_col: "EventTime".to_string(),
            ..Target::new(query)
        }
    }

    #[test]
    fn test_placeholders() {
        let target = target(
            "SELECT $timeSeries AS t, count() FROM $table WHERE $timeFilter GROUP BY t",
        );
        let sql = SqlQuery::new(&target, &options()).replace().unwrap();
        assert_eq!(
            sql,
            "SELECT (intDiv(toUInt32(EventTime), 30) * 30) * 1000 AS t, count() \
             FROM default.requests \
             WHERE EventDate >= toDate(1700000000) AND EventDate <= toDate(1700003600) \
             AND EventTime >= toDateTime(1700000000) AND EventTime <= toDateTime(1700003600) \
             GROUP BY t"
        );
    }

    #[test]
    fn test_target_interval_overrides_panel_interval() {
        let mut target = target("SELECT $interval, $__interval_ms");
        target.interval = "1m".to_string();
        target.interval_factor = 2;
        let sql = SqlQuery::new(&target, &options()).replace().unwrap();
        assert_eq!(sql, "SELECT 120, 120000");
    }

    #[test]
    fn test_invalid_interval() {
        let mut target = target("SELECT 1");
        target.interval = "often".to_string();
        let err = SqlQuery::new(&target, &options()).replace().unwrap_err();
        assert!(matches!(err, CompileError::Interval(_)));
    }

    #[test]
    fn test_adhoc_placeholder() {
        let target = target("SELECT count() FROM $table WHERE $adhoc");
        let mut options = options();
        assert!(SqlQuery::new(&target, &options)
            .replace()
            .unwrap()
            .ends_with("WHERE 1"));

        options.adhoc_filters = vec![
            AdHocFilter::new("requests.status", "=", "ok"),
            AdHocFilter::new("requests.code", ">=", "500"),
        ];
        let sql = SqlQuery::new(&target, &options).replace().unwrap();
        assert_eq!(
            sql,
            "SELECT count()\nFROM default.requests\nWHERE\n    (status = 'ok' AND code >= 500)\n    AND status = 'ok'\n    AND code >= 500"
        );
    }

    #[test]
    fn test_macro_failure_falls_back() {
        let target = target("$columns(a) FROM $table");
        let sql = SqlQuery::new(&target, &options()).replace().unwrap();
        assert_eq!(sql, "$columns(a) FROM default.requests");
    }

    #[test]
    fn test_parse_failure_is_fatal() {
        let target = target("SELECT count( FROM $table");
        let err = SqlQuery::new(&target, &options()).replace().unwrap_err();
        assert!(matches!(err, CompileError::Parse(ParseError::UnmatchedParentheses(_))));
    }

    #[test]
    fn test_without_date_column() {
        let mut target = target("SELECT 1 FROM $table WHERE $timeFilter");
        target.date_col.clear();
        target.date_time_type = DateTimeType::Timestamp;
        let sql = SqlQuery::new(&target, &options()).replace().unwrap();
        assert_eq!(
            sql,
            "SELECT 1 FROM default.requests WHERE EventTime >= 1700000000 AND EventTime <= 1700003600"
        );
    }

    #[test]
    fn test_annotation_defaults() {
        let target = Target::new("SELECT 1").for_annotation();
        assert_eq!(target.date_time_col, "time");
        assert_eq!(target.interval, "30s");
    }

    #[test]
    fn test_target_from_json() {
        let target: Target = serde_json::from_str(
            r#"{
                "query": "SELECT 1",
                "database": "web",
                "table": "hits",
                "dateColDataType": "d",
                "dateTimeColDataType": "ts",
                "dateTimeType": "DATETIME64",
                "round": "$step"
            }"#,
        )
        .unwrap();
        assert_eq!(target.date_time_type, DateTimeType::DateTime64);
        assert_eq!(target.date_time_col, "ts");
        assert_eq!(target.interval_factor, 1);
        assert_eq!(target.qualified_table(), "web.hits");
    }
}
