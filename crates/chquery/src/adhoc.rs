/// Ad-hoc filters
///
/// Dashboard-level `key operator value` filters are pushed into the `WHERE`
/// clause of the innermost query of every panel that reads the filtered table.
/// The catalog half of the module turns `system.columns` rows into the keys and
/// values offered to the user.
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::ast::{Clause, FromClause, Query};
use super::compiler::Target;

/// Row limit of the tag values query
pub const TAG_VALUES_LIMIT: usize = 300;

/// A dashboard filter as sent by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdHocFilter {
    /// `column`, `table.column` or `database.table.column`
    pub key: String,
    pub operator: String,
    pub value: String,
}

impl AdHocFilter {
    pub fn new(key: impl Into<String>, operator: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdHocError {
    #[error("FROM expression \"{0}\" can't be parsed")]
    UnparsableFrom(String),
}

/// Append matching filters to the innermost query's `WHERE`
///
/// Returns the rendered conditions (without connectives) so the caller can
/// expose them through `$adhoc`.
pub fn inject(
    query: &mut Query,
    target: &Target,
    filters: &[AdHocFilter],
) -> Result<Vec<String>, AdHocError> {
    if filters.is_empty() {
        return Ok(Vec::new());
    }

    let innermost = query.innermost_mut();
    let Some(from) = innermost
        .from
        .as_ref()
        .and_then(FromClause::table)
        .map(str::to_string)
    else {
        debug!("no table in the innermost query, skipping ad-hoc filters");
        return Ok(Vec::new());
    };
    let (database, table) = resolve_from(&from, target)?;

    let mut conditions = Vec::new();
    for filter in filters {
        let Some((key_database, key_table, column)) = resolve_key(&filter.key, &database, &table)
        else {
            warn!(key = %filter.key, "unsupported ad-hoc filter key");
            continue;
        };
        if key_database != database || key_table != table {
            continue;
        }

        let condition = format!(
            "{column} {} {}",
            clickhouse_operator(&filter.operator),
            quote_value(&filter.value)
        );
        let conjuncts = innermost.args_mut(Clause::Where);
        if conjuncts.is_empty() {
            conjuncts.push(condition.clone());
        } else {
            conjuncts.push(format!("AND {condition}"));
        }
        conditions.push(condition);
    }

    debug!(%database, %table, count = conditions.len(), "applied ad-hoc filters");
    Ok(conditions)
}

/// `(database, table)` named by a `FROM` table argument
fn resolve_from(from: &str, target: &Target) -> Result<(String, String), AdHocError> {
    let name = from.split_whitespace().next().unwrap_or_default();
    if name == "$table" {
        return Ok((target.database.clone(), target.table.clone()));
    }

    let parts: Vec<&str> = name.split('.').map(unquote).collect();
    match parts.as_slice() {
        [table] => Ok((target.database.clone(), table.to_string())),
        [database, table] => Ok((database.to_string(), table.to_string())),
        _ => Err(AdHocError::UnparsableFrom(from.to_string())),
    }
}

/// `(database, table, column)` named by a filter key
fn resolve_key(key: &str, database: &str, table: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.splitn(3, '.').collect();
    match parts.as_slice() {
        [column] if !column.is_empty() => {
            Some((database.to_string(), table.to_string(), column.to_string()))
        }
        [key_table, column] => Some((database.to_string(), key_table.to_string(), column.to_string())),
        [key_database, key_table, column] => Some((
            key_database.to_string(),
            key_table.to_string(),
            column.to_string(),
        )),
        _ => None,
    }
}

fn unquote(name: &str) -> &str {
    name.trim_matches(|c| c == '`' || c == '"')
}

/// Map a UI operator onto ClickHouse syntax
pub fn clickhouse_operator(operator: &str) -> &str {
    match operator {
        "=~" => "LIKE",
        "!~" => "NOT LIKE",
        "=" | "!=" | "<" | ">" | "<=" | ">=" => operator,
        _ => {
            warn!(%operator, "unknown ad-hoc operator, passing it through");
            operator
        }
    }
}

/// Digit-only values stay bare, everything else becomes an escaped literal
pub fn quote_value(value: &str) -> String {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Query listing the columns offered as filter keys
pub fn columns_query(default_database: &str) -> String {
    let database = if default_database.is_empty() {
        String::new()
    } else {
        format!("database = '{default_database}' AND ")
    };
    format!(
        "SELECT database, table, name, type FROM system.columns \
         WHERE {database}database != 'system' ORDER BY database, table"
    )
}

/// A row of [`columns_query`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub database: String,
    pub table: String,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// Filter key offered to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagKey {
    pub text: String,
    pub value: String,
}

static ENUM_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']+|'')+'").expect("enum pattern is valid"));

/// Keys and pre-known values derived from `system.columns`
#[derive(Debug, Clone, Default)]
pub struct AdHocCatalog {
    default_database: String,
    keys: Vec<TagKey>,
    enum_values: HashMap<String, Vec<String>>,
}

impl AdHocCatalog {
    /// With a default database, keys are `table.column`, otherwise fully qualified
    pub fn from_columns(columns: &[ColumnInfo], default_database: &str) -> Self {
        let mut catalog = Self {
            default_database: default_database.to_string(),
            ..Default::default()
        };

        for column in columns {
            let text = if default_database.is_empty() {
                format!("{}.{}.{}", column.database, column.table, column.name)
            } else {
                format!("{}.{}", column.table, column.name)
            };

            if column.data_type.starts_with("Enum") {
                let values = ENUM_VALUE_RE
                    .find_iter(&column.data_type)
                    .map(|m| {
                        let literal = m.as_str();
                        literal[1..literal.len() - 1].replace("''", "'")
                    })
                    .collect();
                catalog.enum_values.insert(text.clone(), values);
            }

            catalog.keys.push(TagKey {
                text,
                value: column.name.clone(),
            });
        }
        catalog
    }

    pub fn tag_keys(&self) -> &[TagKey] {
        &self.keys
    }

    /// Values known without querying, i.e. the members of an `Enum` column
    pub fn enum_values(&self, key: &str) -> Option<&[String]> {
        self.enum_values.get(key).map(Vec::as_slice)
    }

    /// Query fetching distinct values of a key, `None` for keys that can't be resolved
    pub fn tag_values_query(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        let (database, table, column) = match parts.as_slice() {
            [table, column] if !self.default_database.is_empty() => {
                (self.default_database.as_str(), *table, *column)
            }
            [database, table, column] => (*database, *table, *column),
            _ => return None,
        };
        Some(format!(
            "SELECT DISTINCT {column} AS value FROM {database}.{table} LIMIT {TAG_VALUES_LIMIT}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::printer::print;

    fn target() -> Target {
        Target {
            database: "default".to_string(),
            table: "events".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_inject_into_innermost_where() {
        let mut query = parse("SELECT c FROM (SELECT count() c FROM $table)").unwrap();
        let filters = [
            AdHocFilter::new("events.status", "=", "active"),
            AdHocFilter::new("events.code", "!=", "500"),
        ];
        let conditions = inject(&mut query, &target(), &filters).unwrap();

        assert_eq!(conditions, ["status = 'active'", "code != 500"]);
        assert!(query.args(Clause::Where).is_empty());
        assert_eq!(
            query.innermost().args(Clause::Where),
            ["status = 'active'", "AND code != 500"]
        );
    }

    #[test]
    fn test_existing_where_gets_and() {
        let mut query = parse("SELECT 1 FROM default.events WHERE x = 1").unwrap();
        inject(&mut query, &target(), &[AdHocFilter::new("status", "=~", "%ok%")]).unwrap();
        assert_eq!(query.args(Clause::Where), ["x = 1", "AND status LIKE '%ok%'"]);
        assert!(print(&query, "").contains("AND status LIKE '%ok%'"));
    }

    #[test]
    fn test_other_tables_are_skipped() {
        let mut query = parse("SELECT 1 FROM logs").unwrap();
        let filters = [
            AdHocFilter::new("events.status", "=", "a"),
            AdHocFilter::new("other.logs.level", "=", "b"),
            AdHocFilter::new("default.logs.level", "!~", "debug"),
        ];
        let conditions = inject(&mut query, &target(), &filters).unwrap();
        assert_eq!(conditions, ["level NOT LIKE 'debug'"]);
    }

    #[test]
    fn test_unknown_operator_passes_through() {
        assert_eq!(clickhouse_operator("~~"), "~~");
        assert_eq!(clickhouse_operator(">="), ">=");

        let mut query = parse("SELECT 1 FROM events WHERE x = 1").unwrap();
        let conditions =
            inject(&mut query, &target(), &[AdHocFilter::new("name", "~~", "v")]).unwrap();
        assert_eq!(conditions, ["name ~~ 'v'"]);
        assert_eq!(query.args(Clause::Where), ["x = 1", "AND name ~~ 'v'"]);
    }

    #[test]
    fn test_nested_column_keys() {
        assert_eq!(
            resolve_key("db.t.attrs.name", "x", "y"),
            Some(("db".to_string(), "t".to_string(), "attrs.name".to_string()))
        );
        assert_eq!(resolve_key("", "x", "y"), None);
    }

    #[test]
    fn test_unparsable_from() {
        let mut query = parse("SELECT 1 FROM a.b.c").unwrap();
        let err = inject(&mut query, &target(), &[AdHocFilter::new("k", "=", "v")]).unwrap_err();
        assert_eq!(err, AdHocError::UnparsableFrom("a.b.c".to_string()));
    }

    #[test]
    fn test_no_filters_leaves_query_alone() {
        let mut query = parse("SELECT 1 FROM a.b.c").unwrap();
        let before = query.clone();
        assert!(inject(&mut query, &target(), &[]).unwrap().is_empty());
        assert_eq!(query, before);
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value("42"), "42");
        assert_eq!(quote_value("-1"), "'-1'");
        assert_eq!(quote_value(""), "''");
        assert_eq!(quote_value(r"it's a\b"), r"'it\'s a\\b'");
    }

    #[test]
    fn test_columns_query() {
        assert_eq!(
            columns_query(""),
            "SELECT database, table, name, type FROM system.columns \
             WHERE database != 'system' ORDER BY database, table"
        );
        assert!(columns_query("metrics").contains("WHERE database = 'metrics' AND database != 'system'"));
    }

    #[test]
    fn test_catalog() {
        let columns: Vec<ColumnInfo> = serde_json::from_str(
            r#"[
                {"database": "web", "table": "requests", "name": "Type", "type": "Enum8('get' = 1, 'it''s' = 2)"},
                {"database": "web", "table": "requests", "name": "Host", "type": "String"}
            ]"#,
        )
        .unwrap();

        let catalog = AdHocCatalog::from_columns(&columns, "");
        let keys: Vec<_> = catalog.tag_keys().iter().map(|k| k.text.as_str()).collect();
        assert_eq!(keys, ["web.requests.Type", "web.requests.Host"]);
        assert_eq!(
            catalog.enum_values("web.requests.Type").unwrap(),
            ["get", "it's"]
        );
        assert_eq!(catalog.enum_values("web.requests.Host"), None);
        assert_eq!(
            catalog.tag_values_query("web.requests.Host").unwrap(),
            "SELECT DISTINCT Host AS value FROM web.requests LIMIT 300"
        );

        let catalog = AdHocCatalog::from_columns(&columns, "web");
        assert_eq!(catalog.tag_keys()[1].text, "requests.Host");
        assert_eq!(
            catalog.tag_values_query("requests.Host").unwrap(),
            "SELECT DISTINCT Host AS value FROM web.requests LIMIT 300"
        );
        assert_eq!(catalog.tag_values_query("Host"), None);
    }
}
