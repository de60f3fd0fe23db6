//! The SQL input parser.
//!
//! A deterministic state machine over the PostgreSQL lexical layer:
//!
//! <https://www.postgresql.org/docs/current/sql-syntax-lexical.html>
//!
//! - an identifier or key word begins with a letter or `_`, subsequent
//!   characters can be letters, underscores, digits, or dollar signs;
//! - a quoted identifier is an arbitrary sequence of characters in
//!   double-quotes; to include a double quote, two double quotes are written;
//! - a string constant is an arbitrary sequence of characters bounded by
//!   single quotes, with `''` for an embedded quote;
//! - a dollar-quoted string constant is `$tag$ … $tag$`; a dollar quote that
//!   follows a keyword or identifier must be separated from it by whitespace,
//!   otherwise the delimiter is taken as part of the preceding identifier;
//! - `$` followed by digits is a positional parameter;
//! - brackets `[ … ]` select array elements and nest;
//! - `--` starts a line comment, `/* … */` is a nesting block comment;
//! - a statement ends at a top-level `;`.
//!
//! On top of the server's lexicon, `:name` (where the previous byte is not a
//! `:`, so casts stay untouched) is a named parameter.
use super::{ParseError, Statement};

#[derive(Clone, Copy, PartialEq)]
enum State {
    Top,

    Bracket,

    Colon,
    NamedParameter,

    Dollar,
    PositionalParameter,
    DollarQuoteLeadingTag,
    DollarQuote,
    DollarQuoteDollar,

    Quote,
    QuoteQuote,

    Dash,
    OneLineComment,

    Slash,
    MultiLineComment,
    MultiLineCommentStar,
}

/// A valid character of an unquoted SQL identifier.
fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// A valid character of a dollar quote tag.
fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Preparse the first statement of `text`, returning it in pair with the
/// remaining input.
pub(super) fn parse_sql_input(text: &str) -> Result<(Statement, &str), ParseError> {
    let mut state = State::Top;
    let mut result = Statement::empty();

    // shared by brackets and block comments, which cannot overlap
    let mut depth = 0usize;
    let mut quote_char = '\0';
    let mut prev = '\0';
    let mut fragment = String::new();
    let mut leading_tag = String::new();
    let mut trailing_tag = String::new();

    // byte offset of the unconsumed input
    let mut consumed = text.len();

    'scan: for (idx, ch) in text.char_indices() {
        match state {
            State::Top => match ch {
                '\'' | '"' => {
                    state = State::Quote;
                    quote_char = ch;
                    fragment.push(ch);
                }
                '[' => {
                    state = State::Bracket;
                    depth = 1;
                    fragment.push(ch);
                }
                '$' => {
                    if !is_ident_char(prev) {
                        state = State::Dollar;
                    } else {
                        fragment.push(ch);
                    }
                }
                ':' => {
                    if prev != ':' {
                        state = State::Colon;
                    } else {
                        fragment.push(ch);
                    }
                }
                '-' => state = State::Dash,
                '/' => state = State::Slash,
                ';' => {
                    consumed = idx + 1;
                    break 'scan;
                }
                _ => fragment.push(ch),
            },

            State::Bracket => {
                if ch == ']' {
                    depth -= 1;
                } else if ch == '[' {
                    depth += 1;
                }
                if depth == 0 {
                    state = State::Top;
                }
                fragment.push(ch);
            }

            State::Dollar => {
                // prev == '$', not part of an identifier
                if ch.is_ascii_digit() {
                    state = State::PositionalParameter;
                    result.push_text(std::mem::take(&mut fragment));
                    fragment.push(ch);
                } else if ch == '$' {
                    state = State::DollarQuote;
                    fragment.push('$');
                    fragment.push(ch);
                } else if is_tag_char(ch) {
                    state = State::DollarQuoteLeadingTag;
                    leading_tag.push(ch);
                    fragment.push('$');
                    fragment.push(ch);
                } else {
                    state = State::Top;
                    fragment.push('$');
                    fragment.push(ch);
                }
            }

            State::PositionalParameter => {
                if !ch.is_ascii_digit() {
                    state = State::Top;
                    result.push_positional_parameter(std::mem::take(&mut fragment))?;
                }
                if ch == ';' {
                    consumed = idx + 1;
                    break 'scan;
                }
                fragment.push(ch);
            }

            State::DollarQuoteLeadingTag => {
                if ch == '$' {
                    state = State::DollarQuote;
                    fragment.push(ch);
                } else if is_tag_char(ch) {
                    leading_tag.push(ch);
                    fragment.push(ch);
                } else {
                    return Err(ParseError::new("invalid dollar quote tag"));
                }
            }

            State::DollarQuote => {
                if ch == '$' {
                    state = State::DollarQuoteDollar;
                }
                fragment.push(ch);
            }

            State::DollarQuoteDollar => {
                if ch == '$' {
                    if leading_tag == trailing_tag {
                        state = State::Top;
                        leading_tag.clear();
                    }
                    // on a tag mismatch the current `$` may begin the
                    // actual closing delimiter, stay armed
                    trailing_tag.clear();
                } else {
                    trailing_tag.push(ch);
                }
                fragment.push(ch);
            }

            State::Colon => {
                // prev == ':'
                if is_ident_char(ch) {
                    if ch.is_ascii_digit() {
                        return Err(ParseError::new(
                            "named parameter name cannot begin with a digit",
                        ));
                    }
                    state = State::NamedParameter;
                    result.push_text(std::mem::take(&mut fragment));
                } else {
                    state = State::Top;
                    fragment.push(':');
                }
                if ch == ';' {
                    consumed = idx + 1;
                    break 'scan;
                }
                fragment.push(ch);
            }

            State::NamedParameter => {
                if !is_ident_char(ch) {
                    state = State::Top;
                    result.push_named_parameter(std::mem::take(&mut fragment))?;
                }
                if ch == ';' {
                    consumed = idx + 1;
                    break 'scan;
                }
                fragment.push(ch);
            }

            State::Quote => {
                if ch == quote_char {
                    state = State::QuoteQuote;
                } else {
                    fragment.push(ch);
                }
            }

            State::QuoteQuote => {
                if ch == quote_char {
                    // doubled quote, kept verbatim
                    state = State::Quote;
                    fragment.push(quote_char);
                    fragment.push(ch);
                } else {
                    state = State::Top;
                    fragment.push(quote_char); // the closing quote
                    if ch == ';' {
                        consumed = idx + 1;
                        break 'scan;
                    }
                    fragment.push(ch);
                }
            }

            State::Dash => {
                // prev == '-'
                if ch == '-' {
                    state = State::OneLineComment;
                    result.push_text(std::mem::take(&mut fragment));
                } else {
                    state = State::Top;
                    fragment.push('-');
                    if ch == ';' {
                        consumed = idx + 1;
                        break 'scan;
                    }
                    fragment.push(ch);
                }
            }

            State::OneLineComment => {
                if ch == '\n' {
                    state = State::Top;
                    if fragment.ends_with('\r') {
                        fragment.pop();
                    }
                    result.push_one_line_comment(std::mem::take(&mut fragment));
                } else {
                    fragment.push(ch);
                }
            }

            State::Slash => {
                // prev == '/'
                if ch == '*' {
                    state = State::MultiLineComment;
                    if depth > 0 {
                        // nested, markers belong to the outer comment body
                        fragment.push('/');
                        fragment.push(ch);
                    } else {
                        result.push_text(std::mem::take(&mut fragment));
                    }
                    depth += 1;
                } else {
                    state = if depth == 0 { State::Top } else { State::MultiLineComment };
                    fragment.push('/');
                    fragment.push(ch);
                }
            }

            State::MultiLineComment => {
                if ch == '/' {
                    state = State::Slash;
                } else if ch == '*' {
                    state = State::MultiLineCommentStar;
                } else {
                    fragment.push(ch);
                }
            }

            State::MultiLineCommentStar => {
                // prev == '*'
                if ch == '/' {
                    depth -= 1;
                    if depth == 0 {
                        state = State::Top;
                        result.push_multi_line_comment(std::mem::take(&mut fragment));
                    } else {
                        state = State::MultiLineComment;
                        fragment.push('*');
                        fragment.push(ch);
                    }
                } else if ch == '*' {
                    // a run of asterisks, any of them may close the comment
                    fragment.push('*');
                } else {
                    state = State::MultiLineComment;
                    fragment.push('*');
                    fragment.push(ch);
                }
            }
        }

        prev = ch;
    }

    match state {
        State::Top => {
            if !fragment.is_empty() {
                result.push_text(fragment);
            }
        }
        State::QuoteQuote => {
            fragment.push(quote_char);
            result.push_text(fragment);
        }
        State::OneLineComment => result.push_one_line_comment(fragment),
        State::PositionalParameter => result.push_positional_parameter(fragment)?,
        State::NamedParameter => result.push_named_parameter(fragment)?,
        _ => return Err(ParseError::new("invalid SQL input")),
    }

    Ok((result, &text[consumed..]))
}

#[cfg(test)]
mod test {
    use crate::sql::{Fragment, Statement};

    fn fragments(sql: &str) -> Vec<Fragment> {
        Statement::new(sql).unwrap().fragments().to_vec()
    }

    #[test]
    fn plain_text() {
        assert_eq!(fragments("SELECT 1"), [Fragment::Text("SELECT 1".into())]);
    }

    #[test]
    fn tail_past_terminator() {
        let (stmt, tail) = Statement::parse("SELECT 1; SELECT 2").unwrap();
        assert_eq!(stmt.to_string(), "SELECT 1");
        assert_eq!(tail, " SELECT 2");

        let (_, tail) = Statement::parse("SELECT 1").unwrap();
        assert_eq!(tail, "");
    }

    #[test]
    fn quoted_literal_hides_parameters() {
        assert_eq!(
            fragments("SELECT ':a', \"$1\""),
            [Fragment::Text("SELECT ':a', \"$1\"".into())],
        );
    }

    #[test]
    fn doubled_quotes_kept_verbatim() {
        assert_eq!(
            fragments("SELECT 'it''s', \"i\"\"d\""),
            [Fragment::Text("SELECT 'it''s', \"i\"\"d\"".into())],
        );
    }

    #[test]
    fn semicolon_inside_quotes_is_data() {
        let (stmt, tail) = Statement::parse("SELECT 'a;b'; rest").unwrap();
        assert_eq!(stmt.to_string(), "SELECT 'a;b'");
        assert_eq!(tail, " rest");
    }

    #[test]
    fn cast_is_not_a_named_parameter() {
        let stmt = Statement::new("SELECT a::int, :a").unwrap();
        assert_eq!(stmt.named_parameter_count(), 1);
        assert_eq!(stmt.to_string(), "SELECT a::int, :a");
    }

    #[test]
    fn bracket_subscript_protects_colons() {
        let stmt = Statement::new("SELECT arr[1:2], arr[a[1]:b[2]]").unwrap();
        assert_eq!(stmt.parameter_count(), 0);
        assert_eq!(stmt.to_string(), "SELECT arr[1:2], arr[a[1]:b[2]]");
    }

    #[test]
    fn dollar_quote_empty_tag() {
        let (stmt, tail) = Statement::parse("SELECT $$a;b$$").unwrap();
        assert_eq!(stmt.fragments(), [Fragment::Text("SELECT $$a;b$$".into())]);
        assert_eq!(stmt.parameter_count(), 0);
        assert_eq!(tail, "");
    }

    #[test]
    fn dollar_quote_tagged() {
        let stmt = Statement::new("SELECT $fn$ body $1 :x $fn$").unwrap();
        assert_eq!(stmt.parameter_count(), 0);
        assert_eq!(stmt.to_string(), "SELECT $fn$ body $1 :x $fn$");
    }

    #[test]
    fn dollar_quote_mismatched_close_stays_in_body() {
        let stmt = Statement::new("SELECT $tag$ a$b $tag$").unwrap();
        assert_eq!(stmt.parameter_count(), 0);
        assert_eq!(stmt.to_string(), "SELECT $tag$ a$b $tag$");

        let stmt = Statement::new("SELECT $a$x$$a$").unwrap();
        assert_eq!(stmt.to_string(), "SELECT $a$x$$a$");
    }

    #[test]
    fn dollar_after_identifier_is_plain() {
        let stmt = Statement::new("SELECT id$1 FROM t").unwrap();
        assert_eq!(stmt.parameter_count(), 0);
        assert_eq!(stmt.to_string(), "SELECT id$1 FROM t");
    }

    #[test]
    fn line_comment() {
        assert_eq!(
            fragments("SELECT 1 -- one\r\n+ 2"),
            [
                Fragment::Text("SELECT 1 ".into()),
                Fragment::LineComment(" one".into()),
                Fragment::Text("+ 2".into()),
            ],
        );
    }

    #[test]
    fn line_comment_at_end_of_input() {
        assert_eq!(
            fragments("SELECT 1 -- note"),
            [
                Fragment::Text("SELECT 1 ".into()),
                Fragment::LineComment(" note".into()),
            ],
        );
    }

    #[test]
    fn block_comment_nests() {
        assert_eq!(
            fragments("SELECT /* a /* b */ c */ 1"),
            [
                Fragment::Text("SELECT ".into()),
                Fragment::BlockComment(" a /* b */ c ".into()),
                Fragment::Text(" 1".into()),
            ],
        );
    }

    #[test]
    fn block_comment_closes_after_asterisk_run() {
        assert_eq!(
            fragments("/* a **/x"),
            [
                Fragment::Text("".into()),
                Fragment::BlockComment(" a *".into()),
                Fragment::Text("x".into()),
            ],
        );
    }

    #[test]
    fn named_parameter_flushes_text() {
        assert_eq!(
            fragments("SELECT :a"),
            [
                Fragment::Text("SELECT ".into()),
                Fragment::NamedParam("a".into()),
            ],
        );
    }

    #[test]
    fn named_parameter_terminates_statement() {
        let (stmt, tail) = Statement::parse("SELECT :a;next").unwrap();
        assert_eq!(
            stmt.fragments(),
            [
                Fragment::Text("SELECT ".into()),
                Fragment::NamedParam("a".into()),
            ],
        );
        assert_eq!(tail, "next");
    }

    #[test]
    fn named_parameter_with_digits_inside() {
        let stmt = Statement::new("SELECT :a1_b$2").unwrap();
        assert_eq!(stmt.named_parameter_count(), 1);
        assert_eq!(stmt.parameter_name(0), "a1_b$2");
    }

    #[test]
    fn digit_leading_named_parameter_is_rejected() {
        assert!(Statement::new("SELECT :1").is_err());
        assert!(Statement::new("SELECT :2fa").is_err());
    }

    #[test]
    fn unterminated_constructs_fail() {
        assert!(Statement::new("SELECT 'abc").is_err());
        assert!(Statement::new("SELECT \"abc").is_err());
        assert!(Statement::new("SELECT /* abc").is_err());
        assert!(Statement::new("SELECT arr[1").is_err());
        assert!(Statement::new("SELECT $tag$ abc").is_err());
        assert!(Statement::new("SELECT a:").is_err());
    }

    #[test]
    fn invalid_dollar_tag_fails() {
        assert!(Statement::new("SELECT $ta g$x$ta g$").is_err());
    }

    #[test]
    fn empty_text_fragments_are_emitted() {
        let stmt = Statement::new(":a :b").unwrap();
        assert_eq!(
            stmt.fragments(),
            [
                Fragment::Text("".into()),
                Fragment::NamedParam("a".into()),
                Fragment::Text(" ".into()),
                Fragment::NamedParam("b".into()),
            ],
        );
    }
}
