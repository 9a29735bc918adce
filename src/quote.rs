//! Identifier quoting for emitted query text.
//!
//! [`format_path`] re-serializes a raw path or a comma-separated column list
//! so that every segment is safe to embed in a statement. A segment is
//! wrapped in backticks when it contains characters outside the safe set,
//! collides with a reserved word, or is purely numeric. Segments that are
//! already quoted are left alone, so the function is idempotent.

use regex::Regex;
use std::sync::LazyLock;

/// Characters that may appear in an unquoted segment.
static SAFE_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[A-Za-z0-9_.:@#{}$\x{2E80}-\x{9FFF}"'`*\\ ]+$"#).expect("valid regex")
});

static NUMERIC_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("valid regex"));

/// Characters that open and close a quoted span.
const QUOTE_CHARS: [char; 4] = ['"', '\'', '`', '\\'];

/// Reserved words of the target query language.
const KEYWORDS: &[&str] = &[
    "ADD", "AFTER", "ALIAS", "ALIGN", "ALIGNED", "ALL", "ALTER", "AND", "ANY", "AS", "ASC",
    "ATTRIBUTES", "BEFORE", "BEGIN", "BETWEEN", "BY", "CACHE", "CASE", "CAST", "CHILD", "CLEAR",
    "COMPRESSION", "COMPRESSOR", "CONTAIN", "CONTINUOUS", "COUNT", "CREATE", "DATA", "DATABASE",
    "DATABASES", "DATATYPE", "DEBUG", "DELETE", "DESC", "DESCRIBE", "DEVICE", "DEVICES",
    "DISABLE", "DROP", "ELSE", "ENCODING", "END", "EVERY", "EXPLAIN", "FALSE", "FILL", "FLUSH",
    "FOR", "FROM", "FULL", "FUNCTION", "FUNCTIONS", "GRANT", "GROUP", "HAVING", "IN", "INDEX",
    "INFO", "INSERT", "INTO", "IS", "KILL", "LABEL", "LAST", "LIKE", "LIMIT", "LINEAR", "LIST",
    "LOAD", "LOCK", "MERGE", "METADATA", "NODES", "NONE", "NOT", "NOW", "NULL", "OF", "OFF",
    "OFFSET", "ON", "OR", "ORDER", "PATHS", "PREVIOUS", "PRIVILEGES", "QUERY", "REGEXP",
    "REMOVE", "RENAME", "RESAMPLE", "REVOKE", "ROLE", "ROOT", "SCHEMA", "SELECT", "SET",
    "SETTLE", "SHOW", "SLIMIT", "SOFFSET", "STORAGE", "TAGS", "TASK", "TEMPLATE", "THEN",
    "TIME", "TIMESERIES", "TIMESTAMP", "TO", "TOLERANCE", "TOP", "TRACING", "TRIGGER", "TRUE",
    "TTL", "UNLINK", "UNLOAD", "UNSET", "UPDATE", "UPSERT", "USER", "USING", "VALUES",
    "VERIFY", "VERSION", "WATERMARK", "WHEN", "WHERE", "WITH", "WITHOUT", "WRITABLE",
];

/// Whether `word` is a reserved word, ignoring ASCII case.
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// Quote every comma-delimited segment of `input` that is not already safe.
///
/// Commas inside a quoted span do not split segments.
pub fn format_path(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    let mut segment = String::new();
    let mut active: Option<char> = None;

    for c in input.chars() {
        if c == ',' && active.is_none() {
            out.push_str(&format_segment(&segment, false));
            out.push(',');
            segment.clear();
            continue;
        }
        if QUOTE_CHARS.contains(&c) {
            match active {
                None => active = Some(c),
                Some(open) if open == c => active = None,
                Some(_) => {}
            }
        }
        segment.push(c);
    }
    out.push_str(&format_segment(&segment, active.is_some()));
    out
}

/// Split a series path into its device and measurement at the last `.`
/// outside backticks.
pub fn split_last_node(path: &str) -> Option<(&str, &str)> {
    let mut quoted = false;
    let mut split = None;
    for (i, c) in path.char_indices() {
        match c {
            '`' => quoted = !quoted,
            '.' if !quoted => split = Some(i),
            _ => {}
        }
    }
    let i = split?;
    Some((&path[..i], &path[i + 1..]))
}

fn format_segment(segment: &str, unterminated: bool) -> String {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return segment.to_string();
    }
    if !unterminated && is_fully_quoted(trimmed) {
        return segment.to_string();
    }
    let needs_quotes = unterminated
        || !SAFE_SEGMENT.is_match(trimmed)
        || is_keyword(trimmed)
        || NUMERIC_SEGMENT.is_match(trimmed);
    if !needs_quotes {
        return segment.to_string();
    }

    let start = segment.len() - segment.trim_start().len();
    let end = start + trimmed.len();
    format!(
        "{}`{}`{}",
        &segment[..start],
        trimmed.replace('`', "``"),
        &segment[end..]
    )
}

fn is_fully_quoted(segment: &str) -> bool {
    let mut chars = segment.chars();
    match (chars.next(), chars.next_back()) {
        (Some(first), Some(last)) => first == last && matches!(first, '"' | '\'' | '`'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segment_is_quoted() {
        assert_eq!(format_path("123"), "`123`");
        assert_eq!(format_path("s1,42"), "s1,`42`");
    }

    #[test]
    fn test_safe_path_is_unchanged() {
        assert_eq!(format_path("root.sg.d1"), "root.sg.d1");
        assert_eq!(format_path("root.sg.d1.s1,s2"), "root.sg.d1.s1,s2");
        assert_eq!(format_path("root.sg.温度"), "root.sg.温度");
    }

    #[test]
    fn test_keyword_is_quoted_case_insensitively() {
        assert_eq!(format_path("select"), "`select`");
        assert_eq!(format_path("s1,Time"), "s1,`Time`");
        assert!(is_keyword("devices"));
        assert!(!is_keyword("device1"));
    }

    #[test]
    fn test_unsafe_characters_are_quoted() {
        assert_eq!(format_path("a-b"), "`a-b`");
        assert_eq!(format_path("s(1)"), "`s(1)`");
    }

    #[test]
    fn test_quoted_segments_pass_through() {
        assert_eq!(format_path("`123`"), "`123`");
        assert_eq!(format_path("\"a-b\""), "\"a-b\"");
        assert_eq!(format_path("root.sg.`1`"), "root.sg.`1`");
    }

    #[test]
    fn test_commas_inside_quotes_do_not_split() {
        assert_eq!(format_path("`a,b`,c"), "`a,b`,c");
        assert_eq!(format_path("'x,1',2"), "'x,1',`2`");
    }

    #[test]
    fn test_unterminated_quote_is_wrapped() {
        assert_eq!(format_path("a`b"), "`a``b`");
    }

    #[test]
    fn test_whitespace_around_segment_is_kept() {
        assert_eq!(format_path("s1, 7"), "s1, `7`");
    }

    #[test]
    fn test_split_last_node() {
        assert_eq!(split_last_node("root.sg.d1.s1"), Some(("root.sg.d1", "s1")));
        assert_eq!(
            split_last_node("root.sg.d1.`s.1`"),
            Some(("root.sg.d1", "`s.1`"))
        );
        assert_eq!(split_last_node("s1"), None);
    }

    #[test]
    fn test_format_path_is_idempotent() {
        let inputs = [
            "123",
            "root.sg.d1",
            "select,from",
            "a-b,c d",
            "a`b",
            "`a``b`",
            "a\\,b",
            "root.sg.`1`,s2",
            "'x,1',2",
            "s1, 7",
            "",
            ",,",
        ];
        for input in inputs {
            let once = format_path(input);
            assert_eq!(format_path(&once), once, "input {input:?}");
        }
    }
}
