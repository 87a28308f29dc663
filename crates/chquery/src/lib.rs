/// Dashboard query compiler for ClickHouse
///
/// Turns panel query templates (SQL with macro calls, time placeholders and
/// dashboard variables) into plain ClickHouse SQL.
///
/// # Architecture
///
/// 1. **Lexer** (`lexer.rs`) - Tokenizes query templates
/// 2. **Parser** (`parser.rs`) - Builds a clause-level AST from tokens
/// 3. **AST** (`ast.rs`) - Defines the query structures
/// 4. **Printer** (`printer.rs`) - Renders an AST back into indented SQL
/// 5. **Macros** (`macros.rs`) - Expands `$rate`, `$columns` and friends
/// 6. **Ad-hoc filters** (`adhoc.rs`) - Injects dashboard filters into the innermost query
/// 7. **Interpolation** (`interpolate.rs`) - Context-aware variable rendering
/// 8. **Compiler** (`compiler.rs`) - Runs the whole pipeline for a target
///
/// # Usage
///
/// ```rust,ignore
/// use chquery::{compile, QueryOptions, Target, TimeRange};
///
/// let target = Target::new("$rate(count() c) FROM $table");
/// let options = QueryOptions::new(TimeRange::from_timestamps(from, to).unwrap());
/// let sql = compile(&target, &options)?;
/// ```
pub mod adhoc;
pub mod ast;
pub mod compiler;
pub mod interpolate;
pub mod lexer;
pub mod macros;
pub mod parser;
pub mod printer;
pub mod time;

use anyhow::{Context, Result};

pub use adhoc::{AdHocCatalog, AdHocFilter, ColumnInfo};
pub use ast::Query;
pub use compiler::{CompileError, QueryOptions, SqlQuery, Target};
pub use interpolate::{Variable, VariableValue};
pub use time::{DateTimeType, TimeRange};

/// Compile a panel target into executable SQL
///
/// # Errors
///
/// Returns an error if the template cannot be parsed, an interval or rounding
/// duration is invalid, or a `$conditionalTest`/`$unescape` call is malformed.
/// Macro and ad-hoc failures are not errors: the query is compiled as written.
pub fn compile(target: &Target, options: &QueryOptions) -> Result<String> {
    compile_with_max_depth(target, options, parser::DEFAULT_MAX_DEPTH)
}

/// [`compile`] with an explicit bound on sub-query nesting
pub fn compile_with_max_depth(
    target: &Target,
    options: &QueryOptions,
    max_depth: usize,
) -> Result<String> {
    SqlQuery::new(target, options)
        .with_max_depth(max_depth)
        .replace()
        .with_context(|| format!("Failed to compile query: {}", target.query))
}

/// Parse a query template and print it back in canonical layout
pub fn format_query(query: &str) -> Result<String> {
    let ast = parser::parse(query).with_context(|| format!("Failed to parse query: {}", query))?;
    Ok(printer::print(&ast, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_query() {
        let sql = format_query("select a, b from t where x = 1 and y = 2").unwrap();
        assert_eq!(sql, "SELECT\n    a,\n    b\nFROM t\nWHERE\n    x = 1\n    AND y = 2");
    }

    #[test]
    fn test_format_query_error_context() {
        let err = format_query("SELECT (").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse query: SELECT ("));
    }

    #[test]
    fn test_compile_depth_limit() {
        let target = Target::new("SELECT a FROM (SELECT a FROM (SELECT a FROM t))");
        let options = QueryOptions::new(TimeRange::from_timestamps(0, 60).unwrap());
        assert!(compile(&target, &options).is_ok());
        assert!(compile_with_max_depth(&target, &options, 1).is_err());
    }
}
