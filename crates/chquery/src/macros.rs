/// Macro expansion
///
/// Rewrites a query whose projection is a macro call (`$rate(...) FROM ...`)
/// into the nested aggregation the macro stands for. The arguments come from
/// the parsed AST; the query tail (`FROM ...` onwards) is taken verbatim from
/// the text and only gets the time filter spliced in.
///
/// Every expansion buckets rows with `$timeSeries AS t` and restricts them with
/// `$timeFilter`; both placeholders are substituted later by the compiler.
use thiserror::Error;

use super::ast::{MacroArgs, MacroFunction, Query};
use super::lexer::{top_level_tokens, LexError, Lexer, Token, TokenKind};
use super::parser::{between_braces, ParseError};

/// Errors raised while expanding a macro call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MacroError {
    #[error("amount of arguments must be {expected} for {func} func. Parsed arguments are: {}", .args.join(", "))]
    WrongArgumentCount {
        func: MacroFunction,
        expected: &'static str,
        args: Vec<String>,
    },

    #[error("argument \"{0}\" can't be used without alias")]
    MissingAlias(String),

    #[error("could not find FROM-statement at: {0}")]
    MissingFrom(String),

    #[error("{0} expects an argument list, got a query")]
    UnexpectedQuery(MacroFunction),

    #[error("{0} must open the query")]
    NotLeading(MacroFunction),

    #[error(transparent)]
    Lexer(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Keywords before which a missing `WHERE` is inserted
const AFTER_WHERE: &[&str] = &["group by", "having", "order by", "limit", "format", "union all"];

/// Expand the first macro present in `ast`, in priority order
///
/// `query` must be the text `ast` was parsed from (or its printout). Leading
/// comments are dropped; any other text before the macro call is an error.
pub fn expand(query: &str, ast: &Query) -> Result<String, MacroError> {
    for func in MacroFunction::ALL {
        if let Some(args) = ast.macro_args(func) {
            return expand_macro(func, args, query);
        }
    }
    Ok(query.to_string())
}

fn expand_macro(func: MacroFunction, args: &MacroArgs, query: &str) -> Result<String, MacroError> {
    let start = Lexer::new(query)
        .next_significant()?
        .map_or(query.len(), |token| token.offset);
    let text = &query[start..];
    let prefix = format!("{}(", func.name());
    if !text.starts_with(&prefix) {
        return Err(MacroError::NotLeading(func));
    }

    let args = match args {
        MacroArgs::List(args) => args,
        MacroArgs::Query(_) => return Err(MacroError::UnexpectedQuery(func)),
    };

    let body = between_braces(&text[prefix.len()..])?;
    let rest = &text[prefix.len() + body.len() + 1..];
    let tail = from_tail(rest)?;

    match func {
        MacroFunction::Columns => {
            let [key, value] = two_args(func, args)?;
            columns(key, value, tail)
        }
        MacroFunction::RateColumns => {
            let [key, value] = two_args(func, args)?;
            rate_columns(key, value, tail)
        }
        MacroFunction::Rate => rate(&some_args(func, args)?, tail),
        MacroFunction::PerSecond => per_second(&some_args(func, args)?, tail),
        MacroFunction::PerSecondColumns => {
            let [key, value] = two_args(func, args)?;
            per_second_columns(key, value, tail)
        }
    }
}

/// `$columns(key, value)`: one row per bucket with `(key, value)` pairs collected into an array
pub fn columns(key: &str, value: &str, tail: &str) -> Result<String, MacroError> {
    let key_alias = alias(key)?;
    let value_alias = alias(value)?;
    let (tail, having) = split_having(tail)?;
    let tail = apply_time_filter(tail)?;

    Ok(format!(
        "SELECT t, groupArray(({key_alias}, {value_alias})) AS groupArr FROM ( \
         SELECT $timeSeries AS t, {key}, {value} {tail} \
         GROUP BY t, {key_alias}{having} \
         ORDER BY t, {key_alias}) \
         GROUP BY t ORDER BY t"
    ))
}

/// `$rateColumns(key, value)`: `$columns` with every value divided by the bucket delta
pub fn rate_columns(key: &str, value: &str, tail: &str) -> Result<String, MacroError> {
    let columns = columns(key, value, tail)?;
    Ok(format!(
        "SELECT t, arrayMap(a -> (a.1, a.2/runningDifference( t/1000 )), groupArr) FROM ({columns})"
    ))
}

/// `$rate(a, b, ...)`: per-bucket values divided by the bucket delta
pub fn rate(args: &[&str], tail: &str) -> Result<String, MacroError> {
    let rates = args
        .iter()
        .map(|arg| alias(arg).map(|a| format!("{a}/runningDifference(t/1000) {a}Rate")))
        .collect::<Result<Vec<_>, _>>()?;
    let tail = apply_time_filter(tail)?;

    Ok(format!(
        "SELECT t, {} FROM ( \
         SELECT $timeSeries AS t, {} {tail} \
         GROUP BY t ORDER BY t)",
        rates.join(", "),
        args.join(", ")
    ))
}

/// `$perSecond(a, b, ...)`: per-second growth of counters, NaN on counter reset
pub fn per_second(args: &[&str], tail: &str) -> Result<String, MacroError> {
    let mut maxes = Vec::with_capacity(args.len());
    let mut rates = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        maxes.push(format!("max({arg}) AS max_{i}"));
        rates.push(format!(
            "if(runningDifference(max_{i}) < 0, nan, \
             runningDifference(max_{i}) / runningDifference(t/1000)) AS max_{i}_Rate"
        ));
    }
    let tail = apply_time_filter(tail)?;

    Ok(format!(
        "SELECT t, {} FROM ( \
         SELECT $timeSeries AS t, {} {tail} \
         GROUP BY t ORDER BY t)",
        rates.join(", "),
        maxes.join(", ")
    ))
}

/// `$perSecondColumns(key, value)`: per-key per-second growth collected into an array
pub fn per_second_columns(key: &str, value: &str, tail: &str) -> Result<String, MacroError> {
    let key_alias = alias(key)?;
    let (tail, having) = split_having(tail)?;
    let tail = apply_time_filter(tail)?;

    Ok(format!(
        "SELECT t, groupArray(({key_alias}, max_0_Rate)) AS groupArr FROM ( \
         SELECT t, {key_alias}, \
         if(runningDifference(max_0) < 0 OR neighbor({key_alias},-1,{key_alias}) != {key_alias}, nan, \
         runningDifference(max_0) / runningDifference(t/1000)) AS max_0_Rate FROM ( \
         SELECT $timeSeries AS t, {key}, max({value}) AS max_0 {tail} \
         GROUP BY t, {key_alias}{having} \
         ORDER BY {key_alias}, t)) \
         GROUP BY t ORDER BY t"
    ))
}

/// Splice `$timeFilter` into the query tail
///
/// An existing top-level `WHERE` gets the filter as its first conjunct.
/// Otherwise a `WHERE` is inserted ahead of the first clause that must follow
/// it, or appended.
pub fn apply_time_filter(tail: &str) -> Result<String, MacroError> {
    let tail = tail.trim();
    let tokens = top_level_tokens(tail)?;

    if let Some(token) = find_statement(&tokens, |k| k == "where") {
        return Ok(format!(
            "{}WHERE $timeFilter AND {}",
            &tail[..token.offset],
            tail[token.end()..].trim_start()
        ));
    }

    if let Some(token) = find_statement(&tokens, |k| AFTER_WHERE.contains(&k)) {
        return Ok(format!(
            "{} WHERE $timeFilter {}",
            tail[..token.offset].trim_end(),
            &tail[token.offset..]
        ));
    }

    Ok(format!("{tail} WHERE $timeFilter"))
}

/// Alias of an aliased argument: its last word, which must be a plain identifier
pub fn alias(arg: &str) -> Result<&str, MacroError> {
    let arg = arg.trim();
    let word = arg.rsplit(char::is_whitespace).next().unwrap_or(arg);
    if arg.ends_with([')', ']']) || !is_identifier(word) {
        return Err(MacroError::MissingAlias(arg.to_string()));
    }
    Ok(word)
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn find_statement<'t, 'a>(
    tokens: &'t [Token<'a>],
    matches: impl Fn(&str) -> bool,
) -> Option<&'t Token<'a>> {
    tokens
        .iter()
        .find(|t| t.kind == TokenKind::Statement && matches(&t.keyword()))
}

/// Text from the first top-level `FROM` on
fn from_tail(text: &str) -> Result<&str, MacroError> {
    let tokens = top_level_tokens(text)?;
    match find_statement(&tokens, |k| k == "from") {
        Some(token) => Ok(&text[token.offset..]),
        None => Err(MacroError::MissingFrom(text.trim().to_string())),
    }
}

/// Separate a trailing top-level `HAVING` clause so it can be re-applied inside
fn split_having(tail: &str) -> Result<(&str, String), MacroError> {
    let tokens = top_level_tokens(tail)?;
    match find_statement(&tokens, |k| k == "having") {
        Some(token) => Ok((&tail[..token.offset], format!(" {}", tail[token.offset..].trim()))),
        None => Ok((tail, String::new())),
    }
}

fn two_args(func: MacroFunction, args: &[String]) -> Result<[&str; 2], MacroError> {
    match args {
        [key, value] => Ok([key.trim(), value.trim()]),
        _ => Err(MacroError::WrongArgumentCount {
            func,
            expected: "2",
            args: args.to_vec(),
        }),
    }
}

fn some_args(func: MacroFunction, args: &[String]) -> Result<Vec<&str>, MacroError> {
    if args.is_empty() {
        return Err(MacroError::WrongArgumentCount {
            func,
            expected: "> 0",
            args: Vec::new(),
        });
    }
    Ok(args.iter().map(|arg| arg.trim()).collect())
}
