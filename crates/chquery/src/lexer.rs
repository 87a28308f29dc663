/// Lexer for the dashboard SQL dialect
///
/// Splits a query template into classified tokens. Classification happens once,
/// here, through a single anchored alternation whose branch order decides ties:
/// statement keywords and macro names are tried before generic identifiers so
/// that `group by` or `$rateColumns` never fall apart into smaller tokens.
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Token classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Whitespace,
    Comment,
    Identifier,
    String,
    Number,
    Operator,
    Punctuation,
    /// `select`, `from`, `group by`, ...
    Statement,
    /// `any left join`, `global all inner join`, ...
    Join,
    /// `in`, `not in`, `global in`, `global not in`
    In,
    /// `and`, `or`
    Cond,
    /// `$columns`, `$rate`, ...
    MacroFunction,
    /// `$table`, `${var}`, ...
    MacroVariable,
}

impl TokenKind {
    /// Whitespace and comments never reach the parser
    pub fn is_significant(self) -> bool {
        !matches!(self, TokenKind::Whitespace | TokenKind::Comment)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Whitespace => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::Identifier => "identifier",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Operator => "operator",
            TokenKind::Punctuation => "punctuation",
            TokenKind::Statement => "statement keyword",
            TokenKind::Join => "join keyword",
            TokenKind::In => "in keyword",
            TokenKind::Cond => "condition keyword",
            TokenKind::MacroFunction => "macro function",
            TokenKind::MacroVariable => "macro variable",
        };
        f.write_str(name)
    }
}

/// Ordered token patterns. The first branch that matches wins.
const PATTERNS: &[(TokenKind, &str)] = &[
    (TokenKind::Whitespace, r"\s+"),
    (TokenKind::Comment, r"--[^\n]*|/\*(?s:.*?)\*/"),
    // Modifiers that reuse a statement keyword but never open a clause
    (
        TokenKind::Identifier,
        r"\bwith\s+(?:totals|fill|rollup|cube|ties)\b",
    ),
    (
        TokenKind::Statement,
        r"\b(?:with|select|from|prewhere|where|group\s+by|having|order\s+by|limit|format|union\s+all)\b",
    ),
    (
        TokenKind::MacroFunction,
        r"(?-i:\$(?:rateColumns|perSecondColumns|columns|rate|perSecond))\b",
    ),
    // ARRAY JOIN takes no USING list, keep it as plain text
    (TokenKind::Identifier, r"\b(?:left\s+)?array\s+join\b"),
    (
        TokenKind::Join,
        r"\b(?:global\s+)?(?:(?:any|all|asof|semi|anti)\s+)?(?:(?:inner|left(?:\s+outer)?|right(?:\s+outer)?|full(?:\s+outer)?|cross)\s+)?join\b",
    ),
    (
        TokenKind::In,
        r"\b(?:global\s+not\s+in|global\s+in|not\s+in|in)\b",
    ),
    (TokenKind::Cond, r"\b(?:and|or)\b"),
    (
        TokenKind::MacroVariable,
        r"\$\{[a-z0-9_.:]+\}|\$[a-z0-9_]+",
    ),
    (TokenKind::String, r"'(?:[^'\\]|(?s:\\.)|'')*'"),
    (TokenKind::Identifier, r#"`[^`]*`|"[^"]*""#),
    (
        TokenKind::Number,
        r"0x[0-9a-f]+|\d+\.\d*(?:e[-+]?\d+)?|\.\d+(?:e[-+]?\d+)?|\d+(?:e[-+]?\d+)?",
    ),
    (TokenKind::Identifier, r"[a-z_][a-z0-9_]*"),
    (
        TokenKind::Operator,
        r"=>|->|<=|>=|==|!=|<>|\|\||::|=~|!~|[-+*/%<>=!~^&|]",
    ),
    (TokenKind::Punctuation, r"[(),\[\]{}.;:?]"),
];

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = PATTERNS
        .iter()
        .map(|(_, pattern)| format!("({pattern})"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i)^(?:{alternation})")).expect("token patterns are valid")
});

/// A classified slice of the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token in the lexed input
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Case-insensitive comparison against the token text
    pub fn is(&self, text: &str) -> bool {
        self.text.eq_ignore_ascii_case(text)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punctuation && self.text == punct
    }

    /// Lower-cased keyword with internal whitespace collapsed (`GROUP   BY` -> `group by`)
    pub fn keyword(&self) -> String {
        self.text
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Byte offset just past the token
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Raised when no pattern matches the remaining input
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot find next token at position {position} in [{remainder}]")]
pub struct LexError {
    pub position: usize,
    pub remainder: String,
}

/// Cursor over a query string
///
/// The lexer is restartable: callers may inspect [`Lexer::remaining`] and skip
/// ahead with [`Lexer::advance`], which is how balanced-parenthesis bodies are
/// handed back to the parser as raw text.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Unconsumed input
    pub fn remaining(&self) -> &'a str {
        &self.input[self.position..]
    }

    /// Skip `bytes` of input without tokenizing them
    pub fn advance(&mut self, bytes: usize) {
        self.position = (self.position + bytes).min(self.input.len());
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.input.len()
    }

    /// Next token of any kind, `None` at end of input
    pub fn next_token(&mut self) -> Result<Option<Token<'a>>, LexError> {
        if self.is_eof() {
            return Ok(None);
        }

        let remaining = self.remaining();
        let captures = TOKEN_RE.captures(remaining).ok_or_else(|| LexError {
            position: self.position,
            remainder: remaining.to_string(),
        })?;

        let kind = PATTERNS
            .iter()
            .enumerate()
            .find_map(|(i, (kind, _))| captures.get(i + 1).map(|_| *kind))
            .unwrap_or(TokenKind::Identifier);
        let text = &remaining[..captures[0].len()];

        let token = Token {
            kind,
            text,
            offset: self.position,
        };
        self.position += text.len();
        Ok(Some(token))
    }

    /// Next token that is neither whitespace nor a comment
    pub fn next_significant(&mut self) -> Result<Option<Token<'a>>, LexError> {
        while let Some(token) = self.next_token()? {
            if token.kind.is_significant() {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    /// Look at the next significant token without consuming it
    pub fn peek_significant(&self) -> Result<Option<Token<'a>>, LexError> {
        self.clone().next_significant()
    }

    /// Tokenize the entire input, whitespace and comments included
    pub fn tokenize(&mut self) -> Result<Vec<Token<'a>>, LexError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

/// Tokenize `input` from the start
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, LexError> {
    Lexer::new(input).tokenize()
}

/// Significant tokens that sit outside any parenthesis or bracket
///
/// Used to locate clause keywords (`FROM`, `WHERE`, `HAVING`, ...) in raw text
/// without being fooled by sub-queries or function arguments.
pub fn top_level_tokens(input: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut depth = 0i32;
    let mut tokens = Vec::new();
    for token in tokenize(input)? {
        if !token.kind.is_significant() {
            continue;
        }
        if token.kind == TokenKind::Punctuation {
            match token.text {
                "(" | "[" => {
                    depth += 1;
                    continue;
                }
                ")" | "]" => {
                    depth -= 1;
                    continue;
                }
                _ => {}
            }
        }
        if depth == 0 {
            tokens.push(token);
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<(TokenKind, &str)> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind.is_significant())
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn test_statement_keywords_win_over_identifiers() {
        assert_eq!(
            kinds("SELECT a FROM t GROUP  BY a ORDER BY a"),
            vec![
                (TokenKind::Statement, "SELECT"),
                (TokenKind::Identifier, "a"),
                (TokenKind::Statement, "FROM"),
                (TokenKind::Identifier, "t"),
                (TokenKind::Statement, "GROUP  BY"),
                (TokenKind::Identifier, "a"),
                (TokenKind::Statement, "ORDER BY"),
                (TokenKind::Identifier, "a"),
            ]
        );
    }

    #[test]
    fn test_keyword_prefixes_stay_identifiers() {
        assert_eq!(
            kinds("selected index order_id formatDateTime"),
            vec![
                (TokenKind::Identifier, "selected"),
                (TokenKind::Identifier, "index"),
                (TokenKind::Identifier, "order_id"),
                (TokenKind::Identifier, "formatDateTime"),
            ]
        );
    }

    #[test]
    fn test_macro_functions_and_variables() {
        assert_eq!(
            kinds("$rateColumns $rate $perSecondColumns $perSecond $columns $table ${var}"),
            vec![
                (TokenKind::MacroFunction, "$rateColumns"),
                (TokenKind::MacroFunction, "$rate"),
                (TokenKind::MacroFunction, "$perSecondColumns"),
                (TokenKind::MacroFunction, "$perSecond"),
                (TokenKind::MacroFunction, "$columns"),
                (TokenKind::MacroVariable, "$table"),
                (TokenKind::MacroVariable, "${var}"),
            ]
        );
        // Only exact macro names are functions
        assert_eq!(
            kinds("$rates"),
            vec![(TokenKind::MacroVariable, "$rates")]
        );
    }

    #[test]
    fn test_join_and_in_phrases() {
        assert_eq!(
            kinds("GLOBAL ANY LEFT JOIN x NOT IN y GLOBAL IN z ARRAY JOIN arr"),
            vec![
                (TokenKind::Join, "GLOBAL ANY LEFT JOIN"),
                (TokenKind::Identifier, "x"),
                (TokenKind::In, "NOT IN"),
                (TokenKind::Identifier, "y"),
                (TokenKind::In, "GLOBAL IN"),
                (TokenKind::Identifier, "z"),
                (TokenKind::Identifier, "ARRAY JOIN"),
                (TokenKind::Identifier, "arr"),
            ]
        );
    }

    #[test]
    fn test_literals_and_operators() {
        assert_eq!(
            kinds("x != 'it''s (' AND y >= 3.5 OR z = 0x1F"),
            vec![
                (TokenKind::Identifier, "x"),
                (TokenKind::Operator, "!="),
                (TokenKind::String, "'it''s ('"),
                (TokenKind::Cond, "AND"),
                (TokenKind::Identifier, "y"),
                (TokenKind::Operator, ">="),
                (TokenKind::Number, "3.5"),
                (TokenKind::Cond, "OR"),
                (TokenKind::Identifier, "z"),
                (TokenKind::Operator, "="),
                (TokenKind::Number, "0x1F"),
            ]
        );
    }

    #[test]
    fn test_comments_are_tokens() {
        let tokens = tokenize("a -- trailing\n/* block */ b").unwrap();
        let comments: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Comment)
            .map(|t| t.text)
            .collect();
        assert_eq!(comments, vec!["-- trailing", "/* block */"]);
    }

    #[test]
    fn test_with_modifiers() {
        assert_eq!(
            kinds("WITH TOTALS"),
            vec![(TokenKind::Identifier, "WITH TOTALS")]
        );
    }

    #[test]
    fn test_offsets_and_cursor() {
        let mut lexer = Lexer::new("count(x) FROM t");
        let first = lexer.next_significant().unwrap().unwrap();
        assert_eq!((first.text, first.offset), ("count", 0));
        lexer.next_significant().unwrap();
        assert_eq!(lexer.remaining(), "x) FROM t");
        lexer.advance(2);
        let from = lexer.next_significant().unwrap().unwrap();
        assert_eq!(from.kind, TokenKind::Statement);
        assert_eq!(from.offset, 9);
    }

    #[test]
    fn test_unknown_character() {
        let err = tokenize("a # b").unwrap_err();
        assert_eq!(err.position, 2);
        assert_eq!(err.remainder, "# b");
    }

    #[test]
    fn test_top_level_tokens() {
        let tokens = top_level_tokens("$rate(x FROM y) FROM t WHERE (a)").unwrap();
        let texts: Vec<_> = tokens.iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["$rate", "FROM", "t", "WHERE"]);
    }
}
