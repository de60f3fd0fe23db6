//! SQL preparsing.
//!
//! [`Statement`] is a SQL string preparsed into a list of [`Fragment`]:
//! plain text, comments, and parameter placeholders. Two placeholder styles
//! are recognized:
//!
//! - **positional** — `$N`, `N` decimal in `[1, 65535]`;
//! - **named** — `:name`, `name` made of `[A-Za-z0-9_$]` with a non-digit
//!   first byte. Named placeholders are an extension over the SQL accepted
//!   by the server: [`Statement::to_query_string`] renumbers them into
//!   positional form.
//!
//! ```
//! use prequel::sql::Statement;
//!
//! let stmt = Statement::new("SELECT :a, :b, :a").unwrap();
//! assert_eq!(stmt.named_parameter_count(), 2);
//! assert_eq!(stmt.to_query_string(), "SELECT $1, $2, $1");
//! ```
use std::{borrow::Cow, fmt, str::FromStr};

use crate::data::Data;

mod parse;
mod extra;

/// Parameters beyond this count cannot be addressed by the wire protocol.
pub const MAX_PARAMETER_COUNT: usize = 65_535;

/// A lexical piece of a preparsed SQL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Plain query text, quoted literals and identifiers included.
    Text(String),
    /// A `-- …` comment, markers and line terminator excluded.
    LineComment(String),
    /// A `/* … */` comment, outermost markers excluded.
    BlockComment(String),
    /// A `:name` placeholder, payload is the name.
    NamedParam(String),
    /// A `$N` placeholder, payload is the decimal position as written.
    PositionalParam(String),
}

impl Fragment {
    /// Returns `true` for comment fragments of either kind.
    pub fn is_comment(&self) -> bool {
        matches!(self, Fragment::LineComment(_) | Fragment::BlockComment(_))
    }

    /// Returns `true` for a text fragment.
    pub fn is_text(&self) -> bool {
        matches!(self, Fragment::Text(_))
    }

    fn is_blank_text(&self) -> bool {
        matches!(self, Fragment::Text(s) if is_blank(s))
    }
}

fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

/// A preparsed SQL statement.
///
/// Built by [`Statement::parse`] from a single `;`-terminated statement.
/// The fragment list is immutable except through [`append`][Statement::append]
/// and [`replace_parameter`][Statement::replace_parameter], which rebuild the
/// parameter caches and keep the statement valid or leave it untouched.
#[derive(Default, Clone)]
pub struct Statement {
    fragments: Vec<Fragment>,
    /// Presence flag per positional parameter, `positional[i]` ⇔ `$i+1` seen.
    positional: Vec<bool>,
    /// Distinct named parameters in first-appearance order.
    named: Vec<String>,

    extra: Option<Vec<(String, Data)>>,
    extra_stale: bool,
}

impl Statement {
    /// Preparse the first statement of `text`.
    ///
    /// The trailing input past the statement terminator is discarded,
    /// use [`parse`][Statement::parse] to keep it.
    pub fn new(text: &str) -> Result<Statement, ParseError> {
        Ok(Self::parse(text)?.0)
    }

    /// Preparse the first statement of `text`.
    ///
    /// Returns the statement in pair with the remaining input: past the
    /// consumed `;` terminator, or empty when the whole input was consumed.
    pub fn parse(text: &str) -> Result<(Statement, &str), ParseError> {
        parse::parse_sql_input(text)
    }

    /// Returns the fragment list.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Returns the number of positional parameters.
    ///
    /// This is the highest referenced position, gaps included.
    pub fn positional_parameter_count(&self) -> usize {
        self.positional.len()
    }

    /// Returns the number of distinct named parameters.
    pub fn named_parameter_count(&self) -> usize {
        self.named.len()
    }

    /// Returns the total parameter count.
    pub fn parameter_count(&self) -> usize {
        self.positional_parameter_count() + self.named_parameter_count()
    }

    /// Returns `true` if at least one positional parameter is referenced.
    pub fn has_positional_parameters(&self) -> bool {
        !self.positional.is_empty()
    }

    /// Returns `true` if at least one named parameter is referenced.
    pub fn has_named_parameters(&self) -> bool {
        !self.named.is_empty()
    }

    /// Returns `true` if any parameter is referenced.
    pub fn has_parameters(&self) -> bool {
        self.has_positional_parameters() || self.has_named_parameters()
    }

    /// Returns the name of the parameter at `index`.
    ///
    /// # Panics
    ///
    /// Panics unless `positional_parameter_count() <= index < parameter_count()`:
    /// only named parameters have names.
    pub fn parameter_name(&self, index: usize) -> &str {
        assert!(
            self.positional_parameter_count() <= index && index < self.parameter_count(),
            "parameter index out of range",
        );
        &self.named[index - self.positional_parameter_count()]
    }

    /// Returns the index of the named parameter `name`.
    ///
    /// The index of a named parameter is its first-appearance rank offset
    /// by [`positional_parameter_count`][Statement::positional_parameter_count].
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.named
            .iter()
            .position(|n| n == name)
            .map(|i| i + self.positional_parameter_count())
    }

    /// Returns `true` if the named parameter `name` is referenced.
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameter_index(name).is_some()
    }

    /// Returns `true` if the positional parameter at `index` is a gap:
    /// a higher position is referenced while `$index+1` itself is not.
    ///
    /// # Panics
    ///
    /// Panics unless `index < positional_parameter_count()`.
    pub fn is_parameter_missing(&self, index: usize) -> bool {
        assert!(index < self.positional_parameter_count(), "parameter index out of range");
        !self.positional[index]
    }

    /// Returns `true` if any positional parameter is a gap.
    pub fn has_missing_parameters(&self) -> bool {
        self.positional.iter().any(|present| !present)
    }

    /// Returns `true` if there are no fragments at all.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Returns `true` if every fragment is a comment or blank text.
    pub fn is_query_empty(&self) -> bool {
        self.fragments
            .iter()
            .all(|f| f.is_comment() || f.is_blank_text())
    }

    /// Concatenate the fragments of `appendix` to this statement.
    ///
    /// Parameter caches are rebuilt over the merged list; on failure the
    /// statement is left untouched.
    pub fn append(&mut self, appendix: &Statement) -> Result<(), ParseError> {
        let was_query_empty = self.is_query_empty();

        let mut fragments = Vec::with_capacity(self.fragments.len() + appendix.fragments.len());
        fragments.extend_from_slice(&self.fragments);
        fragments.extend_from_slice(&appendix.fragments);

        let (positional, named) = rebuild_caches(&fragments)?;
        self.fragments = fragments;
        self.positional = positional;
        self.named = named;

        if was_query_empty {
            self.extra_stale = true;
        }
        Ok(())
    }

    /// Splice `replacement` in place of every `:name` fragment.
    ///
    /// Parameter caches are rebuilt; on failure the statement is left
    /// untouched. The replacement may itself carry parameters, named ones
    /// are renumbered on the next [`to_query_string`][Statement::to_query_string].
    pub fn replace_parameter(
        &mut self,
        name: &str,
        replacement: &Statement,
    ) -> Result<(), ParseError> {
        if !self.has_parameter(name) {
            return Err(ParseError::new(format!("unknown parameter name \"{name}\"")));
        }

        let mut fragments =
            Vec::with_capacity(self.fragments.len() + replacement.fragments.len());
        for fragment in &self.fragments {
            match fragment {
                Fragment::NamedParam(n) if n == name => {
                    fragments.extend_from_slice(&replacement.fragments);
                }
                other => fragments.push(other.clone()),
            }
        }

        let (positional, named) = rebuild_caches(&fragments)?;
        self.fragments = fragments;
        self.positional = positional;
        self.named = named;
        Ok(())
    }

    /// Render the statement the way the server accepts it: comments elided,
    /// every `:name` renumbered as `$K` where `K` is the parameter index
    /// plus one, positional parameters kept as written.
    pub fn to_query_string(&self) -> String {
        let mut result = String::with_capacity(512);
        let mut itoa = itoa::Buffer::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(s) => result.push_str(s),
                Fragment::LineComment(_) | Fragment::BlockComment(_) => {},
                Fragment::NamedParam(name) => {
                    // has_parameter holds for every named fragment
                    let index = self.parameter_index(name).unwrap_or_default();
                    result.push('$');
                    result.push_str(itoa.format(index + 1));
                }
                Fragment::PositionalParam(position) => {
                    result.push('$');
                    result.push_str(position);
                }
            }
        }
        result
    }

    /// Extra data mined from the leading comment run.
    ///
    /// Each `$tag$ … $tag$` literal inside the comments that immediately
    /// precede the first significant fragment yields one `(tag, value)`
    /// association. The result is computed on first use and cached;
    /// [`append`][Statement::append] onto a comment-only statement
    /// schedules a re-extraction.
    pub fn extra(&mut self) -> Result<&[(String, Data)], ParseError> {
        if self.extra.is_none() {
            self.extra = Some(extra::extract(&self.fragments)?);
        } else if self.extra_stale {
            let more = extra::extract(&self.fragments)?;
            if let Some(cache) = &mut self.extra {
                cache.extend(more);
            }
        }
        self.extra_stale = false;
        match &self.extra {
            Some(cache) => Ok(cache),
            None => Ok(&[]),
        }
    }

    pub(crate) fn empty() -> Statement {
        Statement {
            fragments: Vec::new(),
            positional: Vec::new(),
            named: Vec::new(),
            extra: None,
            extra_stale: true,
        }
    }

    pub(crate) fn push_text(&mut self, s: String) {
        self.fragments.push(Fragment::Text(s));
    }

    pub(crate) fn push_one_line_comment(&mut self, s: String) {
        self.fragments.push(Fragment::LineComment(s));
    }

    pub(crate) fn push_multi_line_comment(&mut self, s: String) {
        self.fragments.push(Fragment::BlockComment(s));
    }

    pub(crate) fn push_positional_parameter(&mut self, s: String) -> Result<(), ParseError> {
        let position: usize = s.parse().map_err(|_| ParseError::bad_position(&s))?;
        if !(1..=MAX_PARAMETER_COUNT).contains(&position) {
            return Err(ParseError::bad_position(&s));
        }
        if position > self.positional.len() {
            if position + self.named.len() > MAX_PARAMETER_COUNT {
                return Err(ParseError::limit_exceeded());
            }
            self.positional.resize(position, false);
        }
        self.positional[position - 1] = true;
        self.fragments.push(Fragment::PositionalParam(s));
        Ok(())
    }

    pub(crate) fn push_named_parameter(&mut self, s: String) -> Result<(), ParseError> {
        if !self.named.iter().any(|n| *n == s) {
            if self.parameter_count() >= MAX_PARAMETER_COUNT {
                return Err(ParseError::limit_exceeded());
            }
            self.named.push(s.clone());
        }
        self.fragments.push(Fragment::NamedParam(s));
        Ok(())
    }
}

/// Recompute the parameter caches over a fragment list.
fn rebuild_caches(fragments: &[Fragment]) -> Result<(Vec<bool>, Vec<String>), ParseError> {
    let mut positional: Vec<bool> = Vec::new();
    let mut named: Vec<String> = Vec::new();
    for fragment in fragments {
        match fragment {
            Fragment::PositionalParam(s) => {
                let position: usize = s.parse().map_err(|_| ParseError::bad_position(s))?;
                if !(1..=MAX_PARAMETER_COUNT).contains(&position) {
                    return Err(ParseError::bad_position(s));
                }
                if position > positional.len() {
                    positional.resize(position, false);
                }
                positional[position - 1] = true;
            }
            Fragment::NamedParam(s) => {
                if !named.iter().any(|n| n == s) {
                    named.push(s.clone());
                }
            }
            _ => {}
        }
    }
    if positional.len() + named.len() > MAX_PARAMETER_COUNT {
        return Err(ParseError::limit_exceeded());
    }
    Ok((positional, named))
}

impl fmt::Display for Statement {
    /// Render the statement with comments and the original parameter syntax.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(s) => f.write_str(s)?,
                Fragment::LineComment(s) => {
                    f.write_str("--")?;
                    f.write_str(s)?;
                    f.write_str("\n")?;
                }
                Fragment::BlockComment(s) => {
                    f.write_str("/*")?;
                    f.write_str(s)?;
                    f.write_str("*/")?;
                }
                Fragment::NamedParam(s) => {
                    f.write_str(":")?;
                    f.write_str(s)?;
                }
                Fragment::PositionalParam(s) => {
                    f.write_str("$")?;
                    f.write_str(s)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &format_args!("{self}"))
            .field("positional", &self.positional.len())
            .field("named", &self.named)
            .finish()
    }
}

impl PartialEq for Statement {
    /// Statements are equal when their fragment lists are equal.
    fn eq(&self, other: &Self) -> bool {
        self.fragments == other.fragments
    }
}

impl FromStr for Statement {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Statement::new(s)
    }
}

/// An error from the SQL preparser.
pub struct ParseError {
    reason: Cow<'static, str>,
}

impl ParseError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    fn bad_position(s: &str) -> Self {
        Self::new(format!("invalid parameter position \"{s}\""))
    }

    fn limit_exceeded() -> Self {
        Self::new(format!("maximum parameter count ({MAX_PARAMETER_COUNT}) exceeded"))
    }
}

impl std::error::Error for ParseError { }

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to preparse sql: {}", self.reason)
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn positional() {
        let stmt = Statement::new("SELECT $1, $2").unwrap();
        assert_eq!(stmt.positional_parameter_count(), 2);
        assert_eq!(stmt.named_parameter_count(), 0);
        assert_eq!(stmt.parameter_count(), 2);
        assert_eq!(stmt.to_query_string(), "SELECT $1, $2");
        assert!(!stmt.has_missing_parameters());
    }

    #[test]
    fn named() {
        let stmt = Statement::new("SELECT :a, :b, :a").unwrap();
        assert_eq!(stmt.named_parameter_count(), 2);
        assert_eq!(stmt.positional_parameter_count(), 0);
        assert_eq!(stmt.parameter_index("a"), Some(0));
        assert_eq!(stmt.parameter_index("b"), Some(1));
        assert_eq!(stmt.parameter_name(0), "a");
        assert_eq!(stmt.parameter_name(1), "b");
        assert_eq!(stmt.to_query_string(), "SELECT $1, $2, $1");
    }

    #[test]
    fn named_after_positional() {
        let stmt = Statement::new("SELECT $2, :x").unwrap();
        assert_eq!(stmt.positional_parameter_count(), 2);
        assert_eq!(stmt.parameter_count(), 3);
        assert_eq!(stmt.parameter_index("x"), Some(2));
        assert_eq!(stmt.parameter_name(2), "x");
        assert!(stmt.is_parameter_missing(0));
        assert!(!stmt.is_parameter_missing(1));
        assert!(stmt.has_missing_parameters());
        assert_eq!(stmt.to_query_string(), "SELECT $2, $3");
    }

    #[test]
    fn parameter_name_round_trip() {
        let stmt = Statement::new("SELECT :alpha, $1, :beta, :alpha").unwrap();
        for name in ["alpha", "beta"] {
            let index = stmt.parameter_index(name).unwrap();
            assert_eq!(stmt.parameter_name(index), name);
        }
    }

    #[test]
    fn render_round_trip() {
        let sources = [
            "SELECT :a, $2 -- trailing\n",
            "/* lead */ SELECT 'it''s', \"i\"\"d\", arr[1:3], $$x;y$$ FROM t",
            "SELECT 1",
        ];
        for source in sources {
            let parsed = Statement::new(source).unwrap();
            let rendered = parsed.to_string();
            let reparsed = Statement::new(&rendered).unwrap();
            assert_eq!(parsed, reparsed, "round trip of {source:?}");
        }
    }

    #[test]
    fn append_merges_parameters() {
        let mut a = Statement::new("SELECT :x, $1").unwrap();
        let b = Statement::new(" WHERE :y > $2 AND :x = 1").unwrap();
        a.append(&b).unwrap();
        assert_eq!(a.positional_parameter_count(), 2);
        assert_eq!(a.named_parameter_count(), 2);
        assert_eq!(a.parameter_index("x"), Some(2));
        assert_eq!(a.parameter_index("y"), Some(3));
        assert_eq!(a.to_string(), "SELECT :x, $1 WHERE :y > $2 AND :x = 1");
    }

    #[test]
    fn replace_parameter_splices() {
        let mut stmt = Statement::new("SELECT :list FROM :t1 t1 WHERE :w").unwrap();
        stmt.replace_parameter("list", &Statement::new("id, age").unwrap()).unwrap();
        stmt.replace_parameter("t1", &Statement::new("users").unwrap()).unwrap();
        stmt.replace_parameter("w", &Statement::new(":nm = 1").unwrap()).unwrap();
        assert_eq!(stmt.named_parameter_count(), 1);
        assert_eq!(stmt.to_query_string(), "SELECT id, age FROM users t1 WHERE $1 = 1");
    }

    #[test]
    fn replace_parameter_is_idempotent_without_reintroduction() {
        let mut once = Statement::new("SELECT :a, :b").unwrap();
        let replacement = Statement::new("1 + $1").unwrap();
        once.replace_parameter("a", &replacement).unwrap();
        let mut twice = once.clone();
        // the name is gone, a second replace must fail and change nothing
        assert!(twice.replace_parameter("a", &replacement).is_err());
        assert_eq!(once, twice);
    }

    #[test]
    fn replace_unknown_name_fails() {
        let mut stmt = Statement::new("SELECT :a").unwrap();
        let err = stmt.replace_parameter("b", &Statement::new("1").unwrap());
        assert!(err.is_err());
        assert_eq!(stmt.to_string(), "SELECT :a");
    }

    #[test]
    fn query_empty() {
        assert!(Statement::new("").unwrap().is_query_empty());
        assert!(Statement::new(" \n ").unwrap().is_query_empty());
        assert!(Statement::new("-- note\n").unwrap().is_query_empty());
        assert!(!Statement::new("SELECT 1").unwrap().is_query_empty());
    }

    #[test]
    fn parameter_limit() {
        // positions are capped at the protocol maximum
        assert!(Statement::new("SELECT $65535").is_ok());
        assert!(Statement::new("SELECT $65536").is_err());
        assert!(Statement::new("SELECT $0").is_err());
    }

    #[test]
    fn append_overflow_rolls_back() {
        let mut stmt = Statement::new("SELECT $65535").unwrap();
        let before = stmt.clone();
        let err = stmt.append(&Statement::new(", :extra").unwrap());
        assert!(err.is_err());
        assert_eq!(stmt, before);
        assert_eq!(stmt.parameter_count(), 65_535);
    }
}
