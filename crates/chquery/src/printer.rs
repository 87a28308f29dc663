/// Pretty-printer: AST back to SQL text
///
/// Output is deterministic and idempotent: printing a parsed printout yields the
/// same text again.
use std::fmt;

use super::ast::*;

/// One indentation level
pub const TAB: &str = "    ";

/// Render `query` with every line prefixed by `indent`
pub fn print(query: &Query, indent: &str) -> String {
    let nested = format!("{indent}{TAB}");
    let mut blocks = Vec::new();

    let root = query.args(Clause::Root);
    if !root.is_empty() {
        blocks.push(format!("{indent}{}", root.join(", ")));
    }

    for (func, args) in &query.macros {
        match args {
            MacroArgs::List(args) => {
                blocks.push(format!("{indent}{func}({})", call_args(args, indent)));
            }
            MacroArgs::Query(body) => {
                blocks.push(format!("{indent}{func}(\n{}\n{indent})", print(body, &nested)));
            }
        }
    }

    push_clause(&mut blocks, query, Clause::With, indent);
    push_clause(&mut blocks, query, Clause::Select, indent);

    if let Some(from) = &query.from {
        blocks.push(print_from(from, indent));
        for join in &from.joins {
            blocks.push(print_join(join, indent));
        }
    }

    for clause in [
        Clause::Prewhere,
        Clause::Where,
        Clause::GroupBy,
        Clause::Having,
        Clause::OrderBy,
        Clause::Limit,
    ] {
        push_clause(&mut blocks, query, clause, indent);
    }

    if let Some(branches) = &query.union_all {
        for branch in branches {
            blocks.push(format!("\n{indent}UNION ALL\n\n{}", print(branch, indent)));
        }
    }

    push_clause(&mut blocks, query, Clause::Format, indent);

    blocks.join("\n")
}

fn push_clause(blocks: &mut Vec<String>, query: &Query, clause: Clause, indent: &str) {
    let args = query.args(clause);
    if args.is_empty() {
        return;
    }
    let separator = if clause.is_condition() { "" } else { "," };
    blocks.push(format!(
        "{indent}{}{}",
        clause.keyword(),
        items(args, indent, separator)
    ));
}

/// Single item inline, several items one per line one level deeper
fn items(items: &[String], indent: &str, separator: &str) -> String {
    if let [item] = items {
        return format!(" {item}");
    }
    let lines: Vec<String> = items
        .iter()
        .map(|item| format!("{indent}{TAB}{item}"))
        .collect();
    format!("\n{}", lines.join(&format!("{separator}\n")))
}

fn call_args(args: &[String], indent: &str) -> String {
    if let [arg] = args {
        return arg.clone();
    }
    format!("{}\n{indent}", items(args, indent, ","))
}

fn print_source(source: &FromSource, indent: &str) -> String {
    match source {
        FromSource::Table(tables) => tables.join(", "),
        FromSource::SubQuery(query) => {
            format!("(\n{}\n{indent})", print(query, &format!("{indent}{TAB}")))
        }
    }
}

fn print_from(from: &FromClause, indent: &str) -> String {
    let mut out = match &from.source {
        FromSource::Table(tables) if tables.is_empty() => format!("{indent}FROM"),
        FromSource::Table(tables) => format!("{indent}FROM{}", items(tables, indent, ",")),
        source @ FromSource::SubQuery(_) => {
            format!("{indent}FROM {}", print_source(source, indent))
        }
    };
    if let Some(alias) = &from.alias {
        out.push(' ');
        out.push_str(alias);
    }
    out
}

fn print_join(join: &Join, indent: &str) -> String {
    let mut out = format!(
        "{indent}{} {}\n{indent}USING",
        join.kind,
        print_source(&join.source, indent)
    );
    if !join.using.is_empty() {
        out.push(' ');
        out.push_str(&join.using.join(", "));
    }
    out
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print(self, ""))
    }
}
