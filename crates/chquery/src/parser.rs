/// AST builder for the dashboard SQL dialect
///
/// The parser walks the significant tokens once, keeping two pieces of state:
/// the clause currently collecting arguments and the argument being built.
/// Parenthesised bodies that must become nested nodes (sub-queries, macro
/// arguments, IN lists, JOIN sources, UNION ALL branches) are cut out of the
/// raw text at their balanced closing parenthesis and fed back into a fresh
/// parser.
use thiserror::Error;

use super::ast::*;
use super::lexer::{top_level_tokens, LexError, Lexer, Token, TokenKind};
use super::printer;

/// Default bound on sub-query nesting
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Words after which an opening parenthesis is not a function call
const SPACED_KEYWORDS: &[&str] = &[
    "as", "not", "when", "then", "else", "like", "ilike", "between", "exists", "is", "on",
];

/// Parser errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Lexer(#[from] LexError),

    #[error("expecting [{expected}], but got [{got}] at [{remainder}]")]
    UnexpectedToken {
        expected: String,
        got: String,
        remainder: String,
    },

    #[error("expecting [{expected}], but reached the end of query")]
    UnexpectedEnd { expected: String },

    #[error("unmatched parentheses in [{0}]")]
    UnmatchedParentheses(String),

    #[error("query nesting exceeds the maximum depth of {0}")]
    TooDeep(usize),
}

/// Where flushed arguments go
#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Clause(Clause),
    From,
    UnionAll,
}

impl Target {
    fn for_keyword(keyword: &str) -> Option<Self> {
        let target = match keyword {
            "with" => Target::Clause(Clause::With),
            "select" => Target::Clause(Clause::Select),
            "from" => Target::From,
            "prewhere" => Target::Clause(Clause::Prewhere),
            "where" => Target::Clause(Clause::Where),
            "group by" => Target::Clause(Clause::GroupBy),
            "having" => Target::Clause(Clause::Having),
            "order by" => Target::Clause(Clause::OrderBy),
            "limit" => Target::Clause(Clause::Limit),
            "format" => Target::Clause(Clause::Format),
            "union all" => Target::UnionAll,
            _ => return None,
        };
        Some(target)
    }
}

/// Argument under construction
#[derive(Debug, Default)]
struct Argument {
    text: String,
    /// Open `(`/`[` count
    depth: i32,
    last_kind: Option<TokenKind>,
    last_word: String,
}

impl Argument {
    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn is_balanced(&self) -> bool {
        self.depth == 0
    }

    fn push_token(&mut self, token: &Token<'_>) {
        if self.needs_space(token) {
            self.text.push(' ');
        }
        self.text.push_str(token.text);

        if token.kind == TokenKind::Punctuation {
            match token.text {
                "(" | "[" => self.depth += 1,
                ")" | "]" => self.depth -= 1,
                _ => {}
            }
        }
        self.last_kind = Some(token.kind);
        self.last_word = token.text.to_ascii_lowercase();
    }

    /// Append pre-rendered, balanced text
    fn push_raw(&mut self, text: &str) {
        self.text.push_str(text);
        self.last_kind = Some(TokenKind::Punctuation);
        self.last_word.clear();
    }

    fn needs_space(&self, token: &Token<'_>) -> bool {
        let Some(last) = self.text.chars().last() else {
            return false;
        };
        if last.is_whitespace() || matches!(last, '(' | '[' | '.') {
            return false;
        }
        if token.text.starts_with([')', ']', ',', '.']) {
            return false;
        }
        if token.is_punct("(") || token.is_punct("[") {
            let call_like = matches!(
                self.last_kind,
                Some(TokenKind::Identifier | TokenKind::MacroVariable)
            ) && !SPACED_KEYWORDS.contains(&self.last_word.as_str());
            let indexed = matches!(last, ')' | ']');
            return !(call_like || indexed);
        }
        true
    }

    fn take(&mut self) -> String {
        let text = std::mem::take(&mut self.text);
        self.depth = 0;
        self.last_kind = None;
        self.last_word.clear();
        text.trim().to_string()
    }
}

/// Parser for the dashboard SQL dialect
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    depth: usize,
    max_depth: usize,
    query: Query,
    target: Target,
    argument: Argument,
}

impl<'a> Parser<'a> {
    /// Create a new parser over a query string
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Lexer::new(input),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            query: Query::new(),
            target: Target::Clause(Clause::Root),
            argument: Argument::default(),
        }
    }

    /// Bound the sub-query nesting depth
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parse the query
    pub fn parse(mut self) -> Result<Query, ParseError> {
        while let Some(token) = self.lexer.next_significant()? {
            match token.kind {
                TokenKind::Statement => self.parse_statement(token)?,
                TokenKind::MacroFunction => self.parse_macro(token)?,
                TokenKind::In => self.parse_in(token)?,
                TokenKind::Join => self.parse_join(token)?,
                TokenKind::Cond
                    if matches!(
                        self.target,
                        Target::Clause(Clause::Where | Clause::Prewhere)
                    ) =>
                {
                    if self.argument.is_balanced() {
                        self.flush();
                    }
                    self.argument.push_token(&token);
                }
                TokenKind::Punctuation if token.text == "," && self.argument.is_balanced() => {
                    self.flush();
                }
                TokenKind::Punctuation
                    if token.text == "("
                        && self.target == Target::From
                        && self.argument.is_empty()
                        && self.from_is_empty() =>
                {
                    let sub_query = self.parse_parenthesised()?;
                    self.from_mut().source = FromSource::SubQuery(Box::new(sub_query));
                }
                _ => self.argument.push_token(&token),
            }
        }

        if !self.argument.is_balanced() {
            return Err(ParseError::UnmatchedParentheses(self.argument.text.clone()));
        }
        self.flush();

        Ok(self.query)
    }

    /// Switch clauses on a keyword seen for the first time at a balanced position
    fn parse_statement(&mut self, token: Token<'a>) -> Result<(), ParseError> {
        let target = Target::for_keyword(&token.keyword());
        let target = match target {
            Some(target) if !self.is_present(target) && self.argument.is_balanced() => target,
            _ => {
                self.argument.push_token(&token);
                return Ok(());
            }
        };

        self.flush();
        self.target = target;

        match target {
            Target::Clause(clause) => {
                self.query.args_mut(clause);
            }
            Target::From => {
                self.from_mut();
            }
            Target::UnionAll => {
                let rest = self.lexer.remaining();
                let mut branches = Vec::new();
                for branch in split_union_all(rest)? {
                    branches.push(self.parse_nested(branch)?);
                }
                self.query.union_all = Some(branches);
                self.lexer.advance(rest.len());
            }
        }
        Ok(())
    }

    /// `$macro(args...)` replaces the projection
    fn parse_macro(&mut self, token: Token<'a>) -> Result<(), ParseError> {
        let func = MacroFunction::from_name(token.text).ok_or_else(|| {
            ParseError::UnexpectedToken {
                expected: "macro function".to_string(),
                got: token.text.to_string(),
                remainder: self.lexer.remaining().to_string(),
            }
        })?;

        if self.argument.is_balanced() {
            self.flush();
        }
        self.expect_punct("(")?;
        let body = self.parse_parenthesised()?;

        let args = if body.is_bare_list() {
            MacroArgs::List(body.args(Clause::Root).to_vec())
        } else {
            MacroArgs::Query(Box::new(body))
        };
        self.query.macros.insert(func, args);
        self.query.set(Clause::Select, Vec::new());
        Ok(())
    }

    /// `x [NOT|GLOBAL] IN (...)` keeps the list inline, re-rendered
    fn parse_in(&mut self, token: Token<'a>) -> Result<(), ParseError> {
        self.argument.push_token(&token);

        match self.lexer.peek_significant()? {
            None => Err(ParseError::UnexpectedEnd {
                expected: "IN list".to_string(),
            }),
            Some(next) if next.is_punct("(") => {
                self.lexer.next_significant()?;
                let list = self.parse_parenthesised()?;
                let rendered = if list.is_bare_list() {
                    format!(" ({})", list.args(Clause::Root).join(", "))
                } else {
                    format!(" (\n{}\n)", printer::print(&list, printer::TAB))
                };
                self.argument.push_raw(&rendered);
                Ok(())
            }
            // Bare operand (`IN $var`, `IN table`) is ordinary text
            Some(_) => Ok(()),
        }
    }

    /// `<kind> JOIN <source> USING <columns>`
    fn parse_join(&mut self, token: Token<'a>) -> Result<(), ParseError> {
        self.flush();
        if self.query.from.is_none() {
            return Err(ParseError::UnexpectedToken {
                expected: "FROM before JOIN".to_string(),
                got: token.text.to_string(),
                remainder: self.lexer.remaining().to_string(),
            });
        }

        let kind = token.keyword().to_ascii_uppercase();
        let source = match self.lexer.next_significant()? {
            None => {
                return Err(ParseError::UnexpectedEnd {
                    expected: "join source".to_string(),
                })
            }
            Some(next) if next.is_punct("(") => {
                FromSource::SubQuery(Box::new(self.parse_parenthesised()?))
            }
            Some(next)
                if matches!(next.kind, TokenKind::Identifier | TokenKind::MacroVariable) =>
            {
                FromSource::Table(vec![self.dotted_name(next)?])
            }
            Some(next) => return Err(self.unexpected("join source", &next)),
        };

        match self.lexer.next_significant()? {
            Some(next) if next.kind == TokenKind::Identifier && next.is("using") => {}
            Some(next) => return Err(self.unexpected("USING", &next)),
            None => {
                return Err(ParseError::UnexpectedEnd {
                    expected: "USING".to_string(),
                })
            }
        }

        let mut using = Vec::new();
        while let Some(next) = self.lexer.peek_significant()? {
            if matches!(next.kind, TokenKind::Statement | TokenKind::Join) {
                break;
            }
            self.lexer.next_significant()?;
            if next.kind == TokenKind::Identifier {
                using.push(next.text.to_string());
            }
        }

        self.from_mut().joins.push(Join {
            kind,
            source,
            using,
        });
        self.target = Target::From;
        Ok(())
    }

    /// `name` or `db.name`, starting from an already consumed first part
    fn dotted_name(&mut self, first: Token<'a>) -> Result<String, ParseError> {
        let mut name = first.text.to_string();
        while self
            .lexer
            .peek_significant()?
            .is_some_and(|next| next.is_punct("."))
        {
            self.lexer.next_significant()?;
            match self.lexer.next_significant()? {
                Some(part)
                    if matches!(part.kind, TokenKind::Identifier | TokenKind::MacroVariable) =>
                {
                    name.push('.');
                    name.push_str(part.text);
                }
                Some(part) => return Err(self.unexpected("identifier", &part)),
                None => {
                    return Err(ParseError::UnexpectedEnd {
                        expected: "identifier".to_string(),
                    })
                }
            }
        }
        Ok(name)
    }

    /// Parse the body of a parenthesis whose `(` was just consumed
    fn parse_parenthesised(&mut self) -> Result<Query, ParseError> {
        let body = between_braces(self.lexer.remaining())?;
        let query = self.parse_nested(body)?;
        self.lexer.advance(body.len() + 1);
        Ok(query)
    }

    fn parse_nested(&self, input: &str) -> Result<Query, ParseError> {
        if self.depth + 1 > self.max_depth {
            return Err(ParseError::TooDeep(self.max_depth));
        }
        let mut parser = Parser::new(input).with_max_depth(self.max_depth);
        parser.depth = self.depth + 1;
        parser.parse()
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ParseError> {
        match self.lexer.next_significant()? {
            Some(token) if token.is_punct(punct) => Ok(()),
            Some(token) => Err(self.unexpected(punct, &token)),
            None => Err(ParseError::UnexpectedEnd {
                expected: punct.to_string(),
            }),
        }
    }

    fn unexpected(&self, expected: &str, got: &Token<'_>) -> ParseError {
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            got: got.text.to_string(),
            remainder: self.lexer.remaining().to_string(),
        }
    }

    fn is_present(&self, target: Target) -> bool {
        match target {
            Target::Clause(clause) => self.query.has(clause),
            Target::From => self.query.from.is_some(),
            Target::UnionAll => self.query.union_all.is_some(),
        }
    }

    fn from_mut(&mut self) -> &mut FromClause {
        self.query.from.get_or_insert_with(FromClause::default)
    }

    fn from_is_empty(&self) -> bool {
        match &self.query.from {
            Some(from) => matches!(&from.source, FromSource::Table(tables) if tables.is_empty()),
            None => true,
        }
    }

    /// Move the current argument into the current clause
    fn flush(&mut self) {
        let argument = self.argument.take();
        if argument.is_empty() {
            return;
        }

        match self.target {
            Target::Clause(clause) => self.query.push(clause, argument),
            Target::From => {
                let from = self.from_mut();
                match &mut from.source {
                    FromSource::Table(tables) => tables.push(argument),
                    FromSource::SubQuery(_) => {
                        from.alias = Some(match from.alias.take() {
                            Some(alias) => format!("{alias} {argument}"),
                            None => argument,
                        });
                    }
                }
            }
            // Branches consume the rest of the input
            Target::UnionAll => {}
        }
    }
}

/// Text up to the parenthesis closing an already consumed `(`
///
/// Parentheses are counted on lexer tokens, so those inside string literals,
/// quoted identifiers and comments are ignored.
pub fn between_braces(input: &str) -> Result<&str, ParseError> {
    let mut depth = 1usize;
    let mut lexer = Lexer::new(input);

    while let Some(token) = lexer.next_significant()? {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth -= 1;
            if depth == 0 {
                return Ok(&input[..token.offset]);
            }
        }
    }

    Err(ParseError::UnmatchedParentheses(input.to_string()))
}

/// Split at top-level `UNION ALL` keywords
fn split_union_all(input: &str) -> Result<Vec<&str>, ParseError> {
    let mut branches = Vec::new();
    let mut start = 0;
    for token in top_level_tokens(input)? {
        if token.kind == TokenKind::Statement && token.keyword() == "union all" {
            branches.push(&input[start..token.offset]);
            start = token.end();
        }
    }
    branches.push(&input[start..]);
    Ok(branches)
}

/// Parse a query string into an AST
pub fn parse(input: &str) -> Result<Query, ParseError> {
    Parser::new(input).parse()
}

/// Parse with an explicit nesting bound
pub fn parse_with_max_depth(input: &str, max_depth: usize) -> Result<Query, ParseError> {
    Parser::new(input).with_max_depth(max_depth).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let query = parse(
            "SELECT a, count() AS c FROM db.events WHERE a = 1 GROUP BY a ORDER BY c DESC LIMIT 10",
        )
        .unwrap();
        assert_eq!(query.args(Clause::Select), ["a", "count() AS c"]);
        assert_eq!(query.from.as_ref().unwrap().table(), Some("db.events"));
        assert_eq!(query.args(Clause::Where), ["a = 1"]);
        assert_eq!(query.args(Clause::GroupBy), ["a"]);
        assert_eq!(query.args(Clause::OrderBy), ["c DESC"]);
        assert_eq!(query.args(Clause::Limit), ["10"]);
    }

    #[test]
    fn test_where_splits_on_balanced_connectives() {
        let query = parse("SELECT 1 FROM t WHERE a = 1 AND if(b AND c, 1, 0) = 1 OR d").unwrap();
        assert_eq!(
            query.args(Clause::Where),
            ["a = 1", "AND if(b AND c, 1, 0) = 1", "OR d"]
        );
    }

    #[test]
    fn test_connectives_outside_where_are_text() {
        let query = parse("SELECT a AND b FROM t").unwrap();
        assert_eq!(query.args(Clause::Select), ["a AND b"]);
    }

    #[test]
    fn test_from_sub_query_with_alias() {
        let query = parse("SELECT x FROM (SELECT x FROM $table WHERE y = 2) AS s").unwrap();
        let from = query.from.as_ref().unwrap();
        let sub = from.sub_query().unwrap();
        assert_eq!(sub.args(Clause::Select), ["x"]);
        assert_eq!(sub.from.as_ref().unwrap().table(), Some("$table"));
        assert_eq!(sub.args(Clause::Where), ["y = 2"]);
        assert_eq!(from.alias.as_deref(), Some("AS s"));
    }

    #[test]
    fn test_table_function_is_plain_text() {
        let query = parse("SELECT number FROM numbers(10)").unwrap();
        assert_eq!(query.from.unwrap().table(), Some("numbers(10)"));
    }

    #[test]
    fn test_macro_arguments() {
        let query = parse(
            "$rate(countIf(Type = 200) AS good, countIf(Type != 200) AS bad) FROM requests",
        )
        .unwrap();
        assert_eq!(
            query.macros.get(&MacroFunction::Rate),
            Some(&MacroArgs::List(vec![
                "countIf(Type = 200) AS good".to_string(),
                "countIf(Type != 200) AS bad".to_string(),
            ]))
        );
        assert!(query.has(Clause::Select));
        assert!(query.args(Clause::Select).is_empty());
        assert_eq!(query.from.unwrap().table(), Some("requests"));
    }

    #[test]
    fn test_macro_requires_parenthesis() {
        let err = parse("$rate x FROM t").unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken { ref expected, ref got, .. } if expected == "(" && got == "x"
        ));
    }

    #[test]
    fn test_in_lists() {
        let query = parse("SELECT 1 FROM t WHERE x IN (1, 2,3) AND y NOT IN ('a')").unwrap();
        assert_eq!(query.args(Clause::Where), ["x IN (1, 2, 3)", "AND y NOT IN ('a')"]);

        let query = parse("SELECT 1 FROM t WHERE id GLOBAL IN (SELECT id FROM u)").unwrap();
        let condition = &query.args(Clause::Where)[0];
        assert!(condition.starts_with("id GLOBAL IN (\n"));
        assert!(condition.contains("SELECT id"));
        assert!(condition.contains("FROM u"));
    }

    #[test]
    fn test_join() {
        let query = parse(
            "SELECT a FROM t ANY LEFT JOIN (SELECT a, b FROM u) USING a, b WHERE x = 1",
        )
        .unwrap();
        let from = query.from.as_ref().unwrap();
        assert_eq!(from.table(), Some("t"));
        assert_eq!(from.joins.len(), 1);
        let join = &from.joins[0];
        assert_eq!(join.kind, "ANY LEFT JOIN");
        assert_eq!(join.using, ["a", "b"]);
        assert!(matches!(join.source, FromSource::SubQuery(_)));
        assert_eq!(query.args(Clause::Where), ["x = 1"]);
    }

    #[test]
    fn test_join_table_source() {
        let query = parse("SELECT a FROM t ALL INNER JOIN db.u USING (id)").unwrap();
        let join = &query.from.as_ref().unwrap().joins[0];
        assert_eq!(join.source, FromSource::Table(vec!["db.u".to_string()]));
        assert_eq!(join.using, ["id"]);
    }

    #[test]
    fn test_join_requires_using() {
        let err = parse("SELECT a FROM t ANY LEFT JOIN u ON t.a = u.a").unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken { ref expected, .. } if expected == "USING"
        ));
    }

    #[test]
    fn test_union_all() {
        let query = parse("SELECT 1 UNION ALL SELECT 2 FROM (SELECT 3 UNION ALL SELECT 4) UNION ALL SELECT 5").unwrap();
        assert_eq!(query.args(Clause::Select), ["1"]);
        let branches = query.union_all.as_ref().unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].args(Clause::Select), ["2"]);
        let nested = branches[0].from.as_ref().unwrap().sub_query().unwrap();
        assert_eq!(nested.union_all.as_ref().unwrap().len(), 1);
        assert_eq!(branches[1].args(Clause::Select), ["5"]);
    }

    #[test]
    fn test_repeated_keyword_is_text() {
        let query = parse("SELECT a FROM t WHERE x = (SELECT max(x) FROM t)").unwrap();
        assert_eq!(query.args(Clause::Where), ["x = (SELECT max(x) FROM t)"]);
    }

    #[test]
    fn test_unmatched_parentheses() {
        assert!(matches!(
            parse("SELECT count(x FROM t"),
            Err(ParseError::UnmatchedParentheses(_))
        ));
        assert!(matches!(
            parse("SELECT x FROM (SELECT 1"),
            Err(ParseError::UnmatchedParentheses(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let query = "SELECT a FROM (SELECT a FROM (SELECT a FROM (SELECT a FROM t)))";
        assert!(parse(query).is_ok());
        assert_eq!(
            parse_with_max_depth(query, 2).unwrap_err(),
            ParseError::TooDeep(2)
        );
    }

    #[test]
    fn test_comments_are_dropped() {
        let query = parse("SELECT a -- the key\n, b /* value */ FROM t").unwrap();
        assert_eq!(query.args(Clause::Select), ["a", "b"]);
    }

    #[test]
    fn test_bare_list() {
        let query = parse("a, f(b, c), 'd, e'").unwrap();
        assert!(query.is_bare_list());
        assert_eq!(query.args(Clause::Root), ["a", "f(b, c)", "'d, e'"]);
    }

    #[test]
    fn test_between_braces() {
        assert_eq!(between_braces("a(b)c) rest").unwrap(), "a(b)c");
        assert_eq!(between_braces("')' , x) y").unwrap(), "')' , x");
        assert!(between_braces("a(b").is_err());
    }

    #[test]
    fn test_between_braces_skips_comments_and_quoted_identifiers() {
        assert_eq!(between_braces("x -- pick (x\n) y").unwrap(), "x -- pick (x\n");
        assert_eq!(between_braces("x /* ) */ + 1) y").unwrap(), "x /* ) */ + 1");
        assert_eq!(between_braces("\"x)\", `y(`) z").unwrap(), "\"x)\", `y(`");
    }

    #[test]
    fn test_sub_query_with_parenthesis_in_comment() {
        let query = parse("SELECT x FROM (SELECT x -- pick (x\n FROM t)").unwrap();
        assert_eq!(query, parse("SELECT x FROM (SELECT x FROM t)").unwrap());
    }

    #[test]
    fn test_in_list_with_quoted_identifier() {
        let query = parse("SELECT c FROM t WHERE c IN (\"x)\")").unwrap();
        assert_eq!(query.args(Clause::Where), ["c IN (\"x)\")"]);
    }
}
