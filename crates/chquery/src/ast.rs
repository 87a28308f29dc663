/// Abstract Syntax Tree for the dashboard SQL dialect
///
/// The tree is intentionally shallow: a query is a set of clauses, each holding
/// the original text of its comma separated arguments. Only the positions that
/// the macro engine and the ad-hoc injector need to navigate (`FROM`
/// sub-queries, JOIN sources, `UNION ALL` branches, macro argument lists) are
/// parsed into nested nodes.
use std::collections::BTreeMap;
use std::fmt;

/// Clauses that hold a list of argument strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Clause {
    /// Synthetic clause collecting comma separated expressions that precede any keyword
    Root,
    With,
    Select,
    Prewhere,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Format,
}

impl Clause {
    pub fn keyword(self) -> &'static str {
        match self {
            Clause::Root => "",
            Clause::With => "WITH",
            Clause::Select => "SELECT",
            Clause::Prewhere => "PREWHERE",
            Clause::Where => "WHERE",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::OrderBy => "ORDER BY",
            Clause::Limit => "LIMIT",
            Clause::Format => "FORMAT",
        }
    }

    /// Condition clauses hold `AND`/`OR` prefixed arguments instead of a comma list
    pub fn is_condition(self) -> bool {
        matches!(self, Clause::Where | Clause::Prewhere | Clause::Having)
    }
}

/// Macro functions that stand in for the projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MacroFunction {
    Columns,
    RateColumns,
    Rate,
    PerSecond,
    PerSecondColumns,
}

impl MacroFunction {
    /// Expansion priority, also the order in which macros are printed
    pub const ALL: [MacroFunction; 5] = [
        MacroFunction::Columns,
        MacroFunction::RateColumns,
        MacroFunction::Rate,
        MacroFunction::PerSecond,
        MacroFunction::PerSecondColumns,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MacroFunction::Columns => "$columns",
            MacroFunction::RateColumns => "$rateColumns",
            MacroFunction::Rate => "$rate",
            MacroFunction::PerSecond => "$perSecond",
            MacroFunction::PerSecondColumns => "$perSecondColumns",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for MacroFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments of a macro call
#[derive(Debug, Clone, PartialEq)]
pub enum MacroArgs {
    /// Comma separated argument list (the normal case)
    List(Vec<String>),
    /// The call body contained clause keywords and parsed as a query
    Query(Box<Query>),
}

impl MacroArgs {
    pub fn is_empty(&self) -> bool {
        match self {
            MacroArgs::List(args) => args.is_empty(),
            MacroArgs::Query(query) => query.is_empty(),
        }
    }
}

/// Source of rows in a `FROM` or JOIN position
#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    /// Plain table reference(s), kept as text (`db.table`, `$table`, `numbers(10)`)
    Table(Vec<String>),
    /// Parenthesised sub-query
    SubQuery(Box<Query>),
}

impl Default for FromSource {
    fn default() -> Self {
        FromSource::Table(Vec::new())
    }
}

/// `<kind> JOIN <source> USING <columns>`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Join phrase as written, upper-cased (`ANY LEFT JOIN`)
    pub kind: String,
    pub source: FromSource,
    pub using: Vec<String>,
}

/// The `FROM` clause
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FromClause {
    pub source: FromSource,
    /// Text trailing a sub-query source (`AS x`, `FINAL`)
    pub alias: Option<String>,
    pub joins: Vec<Join>,
}

impl FromClause {
    /// Nested query when the source is a sub-query
    pub fn sub_query(&self) -> Option<&Query> {
        match &self.source {
            FromSource::SubQuery(query) => Some(&**query),
            FromSource::Table(_) => None,
        }
    }

    pub fn sub_query_mut(&mut self) -> Option<&mut Query> {
        match &mut self.source {
            FromSource::SubQuery(query) => Some(&mut **query),
            FromSource::Table(_) => None,
        }
    }

    /// First table argument when the source is a plain table
    pub fn table(&self) -> Option<&str> {
        match &self.source {
            FromSource::Table(tables) => tables.first().map(String::as_str),
            FromSource::SubQuery(_) => None,
        }
    }
}

/// A parsed query
///
/// A clause is "present" once its keyword has been seen, even if no argument
/// followed it; the parser relies on this to treat a repeated keyword as plain
/// text (a nested `SELECT` inside an expression, for instance).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    clauses: BTreeMap<Clause, Vec<String>>,
    pub macros: BTreeMap<MacroFunction, MacroArgs>,
    pub from: Option<FromClause>,
    pub union_all: Option<Vec<Query>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments of a list clause, empty when absent
    pub fn args(&self, clause: Clause) -> &[String] {
        self.clauses.get(&clause).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutable arguments of a list clause, creating the clause if needed
    pub fn args_mut(&mut self, clause: Clause) -> &mut Vec<String> {
        self.clauses.entry(clause).or_default()
    }

    pub fn has(&self, clause: Clause) -> bool {
        self.clauses.contains_key(&clause)
    }

    /// Replace a clause's arguments, marking it present
    pub fn set(&mut self, clause: Clause, args: Vec<String>) {
        self.clauses.insert(clause, args);
    }

    pub fn push(&mut self, clause: Clause, arg: impl Into<String>) {
        self.args_mut(clause).push(arg.into());
    }

    /// Arguments of a macro call when it was given as a plain list
    pub fn macro_args(&self, func: MacroFunction) -> Option<&MacroArgs> {
        self.macros.get(&func).filter(|args| !args.is_empty())
    }

    /// True when only the synthetic root clause carries content, i.e. the
    /// input was a bare comma separated list rather than a query
    pub fn is_bare_list(&self) -> bool {
        self.macros.is_empty()
            && self.from.is_none()
            && self.union_all.is_none()
            && self.clauses.keys().all(|clause| *clause == Clause::Root)
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
            && self.from.is_none()
            && self.union_all.is_none()
            && self.clauses.values().all(Vec::is_empty)
    }

    /// Follow `FROM` sub-queries down to the deepest query
    pub fn innermost(&self) -> &Query {
        let mut query = self;
        while let Some(sub) = query.from.as_ref().and_then(FromClause::sub_query) {
            query = sub;
        }
        query
    }

    pub fn innermost_mut(&mut self) -> &mut Query {
        let mut query = self;
        while query
            .from
            .as_ref()
            .is_some_and(|from| from.sub_query().is_some())
        {
            query = match query.from.as_mut().and_then(FromClause::sub_query_mut) {
                Some(sub) => sub,
                None => unreachable!("checked above"),
            };
        }
        query
    }
}
