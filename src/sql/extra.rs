//! Extra data mined from leading comments.
//!
//! A statement may carry key/value associations embedded as dollar-quoted
//! literals inside the comments that precede the query text:
//!
//! ```text
//! -- $id$user-by-name$id$
//! SELECT * FROM users WHERE name = :name
//! ```
//!
//! Only the run of comments adjacent to the first significant fragment is
//! considered: a comment (or blank text between comments) belongs to the run
//! iff it is separated from what follows by at most one newline.
use super::{Fragment, ParseError, is_blank};
use crate::data::Data;

#[derive(Clone, Copy, PartialEq)]
enum CommentKind {
    OneLine,
    MultiLine,
}

/// Extract the ordered `(tag, value)` associations of the fragment list.
pub(super) fn extract(fragments: &[Fragment]) -> Result<Vec<(String, Data)>, ParseError> {
    let mut result = Vec::new();
    if let Some(related) = first_related_comments(fragments) {
        for (comment, kind) in joined_comments(related) {
            result.extend(scan(&comment, kind)?);
        }
    }
    Ok(result)
}

/// At most one newline among the leading whitespace.
fn is_nearby(s: &str) -> bool {
    let mut newlines = 0;
    for c in s.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 1 {
                return false;
            }
        } else if !c.is_whitespace() {
            break;
        }
    }
    true
}

/// The run of comments that immediately precedes the first significant
/// fragment.
///
/// Only text fragments can have related comments: lookup stops empty-handed
/// when a parameter comes first.
fn first_related_comments(fragments: &[Fragment]) -> Option<&[Fragment]> {
    let found = fragments.iter().position(|f| match f {
        Fragment::Text(s) => is_nearby(s) && !is_blank(s),
        Fragment::NamedParam(_) | Fragment::PositionalParam(_) => true,
        _ => false,
    })?;
    if found == 0 || !fragments[found].is_text() {
        return None;
    }

    let mut first = found;
    for i in (0..found).rev() {
        if let Fragment::Text(s) = &fragments[i] {
            if !is_nearby(s) {
                break;
            }
        }
        first = i;
    }
    Some(&fragments[first..found])
}

/// Join adjacent comments of the same kind, in order.
///
/// Line comment runs restore the `\n` after each item that lexing stripped.
fn joined_comments(fragments: &[Fragment]) -> Vec<(String, CommentKind)> {
    let mut result = Vec::new();
    let mut iter = fragments.iter().peekable();
    while let Some(fragment) = iter.next() {
        let (payload, kind) = match fragment {
            Fragment::LineComment(s) => (s, CommentKind::OneLine),
            Fragment::BlockComment(s) => (s, CommentKind::MultiLine),
            _ => continue,
        };
        let mut joined = String::from(payload);
        if kind == CommentKind::OneLine {
            joined.push('\n');
        }
        while let Some(next) = iter.peek() {
            let same = match (next, kind) {
                (Fragment::LineComment(s), CommentKind::OneLine) => Some(s),
                (Fragment::BlockComment(s), CommentKind::MultiLine) => Some(s),
                _ => None,
            };
            let Some(s) = same else { break };
            joined.push_str(s);
            if kind == CommentKind::OneLine {
                joined.push('\n');
            }
            iter.next();
        }
        result.push((joined, kind));
    }
    result
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Scan one joined comment block for dollar-quoted literals.
fn scan(input: &str, kind: CommentKind) -> Result<Vec<(String, Data)>, ParseError> {
    enum State {
        Top,
        Dollar,
        LeadingTag,
        Body,
        BodyDollar,
    }

    let mut state = State::Top;
    let mut result = Vec::new();
    let mut content = String::new();
    let mut leading_tag = String::new();
    let mut trailing_tag = String::new();
    let mut prev = '\0';

    for c in input.chars() {
        match state {
            State::Top => {
                if c == '$' && !is_ident_char(prev) {
                    state = State::Dollar;
                }
            }
            State::Dollar => {
                if c == '$' {
                    state = State::Body;
                } else if is_tag_char(c) {
                    state = State::LeadingTag;
                    leading_tag.push(c);
                } else {
                    state = State::Top;
                }
            }
            State::LeadingTag => {
                if c == '$' {
                    state = State::Body;
                } else if is_tag_char(c) {
                    leading_tag.push(c);
                } else {
                    return Err(ParseError::new("invalid dollar quote tag"));
                }
            }
            State::Body => {
                if c == '$' {
                    state = State::BodyDollar;
                } else {
                    content.push(c);
                }
            }
            State::BodyDollar => {
                if c == '$' {
                    if leading_tag == trailing_tag {
                        state = State::Top;
                        result.push((
                            std::mem::take(&mut leading_tag),
                            Data::text(cleaned_content(std::mem::take(&mut content), kind)),
                        ));
                    } else {
                        // the first delimiter candidate was body text,
                        // the current `$` may begin the real one
                        content.push('$');
                        content.push_str(&trailing_tag);
                    }
                    trailing_tag.clear();
                } else {
                    trailing_tag.push(c);
                }
            }
        }
        prev = c;
    }

    if !matches!(state, State::Top) {
        return Err(ParseError::new("unterminated dollar quote in comment"));
    }

    Ok(result)
}

/// How many characters to remove after each `\n` of the content.
///
/// For block comments the decision weighs two minima: the indent up to a
/// `*` border column and the indent up to the first real content.
fn indent_size(content: &str, kind: CommentKind) -> usize {
    enum State {
        Counting,
        AfterAsterisk,
        AfterNonAsterisk,
        Skipping,
    }

    fn set_if_less(var: &mut Option<usize>, count: usize) {
        match var {
            None => *var = Some(count),
            Some(v) if count < *v => *var = Some(count),
            _ => {}
        }
    }

    let mut state = State::Counting;
    let mut min_indent_to_border: Option<usize> = None;
    let mut min_indent_to_content: Option<usize> = None;
    let mut count = 0usize;

    for c in content.chars() {
        match state {
            State::Counting => {
                if c == '\n' {
                    count = 0;
                } else if c == '*' {
                    state = State::AfterAsterisk;
                } else if c.is_whitespace() {
                    count += 1;
                } else {
                    state = State::AfterNonAsterisk;
                }
            }
            State::AfterAsterisk => {
                if c == ' ' {
                    match min_indent_to_border {
                        Some(border) => {
                            if count < border {
                                set_if_less(&mut min_indent_to_content, border);
                                min_indent_to_border = Some(count);
                            } else if count == border + 1 {
                                set_if_less(&mut min_indent_to_content, count);
                            }
                        }
                        None => min_indent_to_border = Some(count),
                    }
                } else {
                    set_if_less(&mut min_indent_to_content, count);
                }
                state = State::Skipping;
            }
            State::AfterNonAsterisk => {
                set_if_less(&mut min_indent_to_content, count);
                state = State::Skipping;
            }
            State::Skipping => {
                if c == '\n' {
                    count = 0;
                    state = State::Counting;
                }
            }
        }
    }

    match kind {
        CommentKind::MultiLine => match min_indent_to_border {
            Some(border) => {
                if let Some(content_min) = min_indent_to_content {
                    if content_min <= border {
                        return 0;
                    } else if content_min == border + 1 {
                        return content_min;
                    }
                }
                border + 1 + 1
            }
            None => 0,
        },
        CommentKind::OneLine => match min_indent_to_content {
            Some(0) => 0,
            Some(_) => 1,
            None => 1,
        },
    }
}

/// Clean up an extracted value: remove the uniform indent, trim at most one
/// leading and one trailing `CR?LF`, and strip surrounding blanks from
/// single-line values.
fn cleaned_content(content: String, kind: CommentKind) -> String {
    let indent = indent_size(&content, kind);

    let result = if indent > 0 {
        let mut out = String::with_capacity(content.len());
        let mut skipping = false;
        let mut count = 0usize;
        for c in content.chars() {
            if skipping {
                if count > 1 {
                    count -= 1;
                } else {
                    skipping = false;
                }
                // indent characters are dropped, line breaks included
            } else {
                if c == '\n' {
                    count = indent;
                    skipping = true;
                }
                out.push(c);
            }
        }
        out
    } else {
        content
    };

    let bytes = result.as_bytes();
    let mut start = 0;
    let mut end = bytes.len();
    if start < end && bytes[start] == b'\r' {
        start += 1;
    }
    if start < end && bytes[start] == b'\n' {
        start += 1;
    }
    if start < end && bytes[end - 1] == b'\n' {
        end -= 1;
    }
    if start < end && bytes[end - 1] == b'\r' {
        end -= 1;
    }

    let mut value = &result[start..end];
    if !value.contains('\n') {
        value = value.trim_matches([' ', '\t']);
    }
    value.to_string()
}

#[cfg(test)]
mod test {
    use crate::sql::Statement;

    fn extra(sql: &str) -> Vec<(String, String)> {
        let mut stmt = Statement::new(sql).unwrap();
        stmt.extra()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap().to_string()))
            .collect()
    }

    #[test]
    fn block_comment_association() {
        assert_eq!(
            extra("/* $title$ Users $title$ */\nSELECT 1"),
            [("title".into(), "Users".into())],
        );
    }

    #[test]
    fn line_comment_association() {
        assert_eq!(
            extra("-- $id$user-list$id$\nSELECT 1"),
            [("id".into(), "user-list".into())],
        );
    }

    #[test]
    fn several_associations_keep_order() {
        assert_eq!(
            extra("-- $a$1$a$ then $b$2$b$\nSELECT 1"),
            [("a".into(), "1".into()), ("b".into(), "2".into())],
        );
    }

    #[test]
    fn far_comment_is_unrelated() {
        assert!(extra("-- $k$v$k$\n\n\nSELECT 1").is_empty());
    }

    #[test]
    fn adjacent_comment_run_is_joined() {
        // content starts mid-line, so the indent-to-content minimum is zero
        // and the second line keeps its blank
        assert_eq!(
            extra("-- $k$first\n-- line$k$\nSELECT 1"),
            [("k".into(), "first\n line".into())],
        );
    }

    #[test]
    fn line_comment_uniform_indent_is_removed() {
        let sql = "-- $where$\n--  active AND age > 1\n-- $where$\nSELECT 1";
        assert_eq!(extra(sql), [("where".into(), "active AND age > 1".into())]);
    }

    #[test]
    fn no_association_for_parameter_head() {
        assert!(extra("-- $k$v$k$\n:param").is_empty());
    }

    #[test]
    fn star_bordered_block_comment() {
        let sql = "/*\n * $plan$\n * step one\n * step two\n * $plan$\n */\nSELECT 1";
        assert_eq!(extra(sql), [("plan".into(), "step one\nstep two".into())]);
    }

    #[test]
    fn multi_line_value_keeps_relative_layout() {
        let sql = "/* $cfg$\nkey = value\n$cfg$ */\nSELECT 1";
        assert_eq!(extra(sql), [("cfg".into(), "key = value".into())]);
    }

    #[test]
    fn unterminated_literal_fails() {
        let mut stmt = Statement::new("-- $k$oops\nSELECT 1").unwrap();
        assert!(stmt.extra().is_err());
    }

    #[test]
    fn append_refreshes_extra_of_comment_only_statement() {
        let mut stmt = Statement::new("-- $k$v$k$\n").unwrap();
        assert!(stmt.extra().unwrap().is_empty());
        stmt.append(&Statement::new("SELECT 1").unwrap()).unwrap();
        let extra = stmt.extra().unwrap();
        assert_eq!(extra.len(), 1);
        assert_eq!(extra[0].0, "k");
    }
}
