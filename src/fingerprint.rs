//! Query canonicalisation (§4.1): a pure, total function mapping SQL text to
//! a stable fingerprint. Equality of fingerprints is the system's sole notion
//! of "the same query shape".
//!
//! Grounded on the normalisation pass this codebase already runs over captured
//! query text before diffing against historical baselines: strip noise,
//! collapse literals to placeholders, collapse whitespace. Here it is pulled
//! out into a standalone, dialect-agnostic function instead of being a step
//! inside a larger regression-detection pipeline.

use once_cell::sync::Lazy;
use regex::Regex;

static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").unwrap());
static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

// Backtick- and double-quoted spans are identifiers (table/column names,
// quoted to survive reserved words or mixed case) and must be preserved
// verbatim, not folded into placeholders or lowercased.
static QUOTED_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(`(?:[^`\\]|\\.)*`|"(?:[^"\\]|\\.)*")"#).unwrap());

static HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b0x[0-9a-f]+\b").unwrap());
static BIT_OR_HEX_STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[xb]'[0-9a-f]*'").unwrap());

static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^'\\]|\\.|'')*'").unwrap());

static NUMERIC_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+\.\d+(?:[eE][+-]?\d+)?\b|\b\d+[eE][+-]?\d+\b|\b\d+\b").unwrap());

static POSITIONAL_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\d+").unwrap());

static IN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bin\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// Delimits a protected span; `IDENTIFIER_PLACEHOLDER_UNIT` encodes the index
// in unary between two of these. Neither is a digit or letter, so none of
// the literal/numeric passes below (which all match on `\d`/`\w`/`\b`) can
// reach inside a placeholder and corrupt it.
const IDENTIFIER_PLACEHOLDER_DELIM: char = '\u{0}';
const IDENTIFIER_PLACEHOLDER_UNIT: char = '\u{1}';

/// Canonicalise `sql` into a fingerprint. Never fails: unparseable or
/// dialect-specific constructs simply pass through the best-effort
/// substitutions below.
pub fn fingerprint(sql: &str) -> String {
    let mut s = LINE_COMMENT.replace_all(sql, "").into_owned();
    s = BLOCK_COMMENT.replace_all(&s, "").into_owned();

    // Protect quoted identifiers from the literal/lowercase passes below by
    // swapping them out for indexed placeholders, restored verbatim at the end.
    let mut protected = Vec::new();
    let s = QUOTED_IDENTIFIER
        .replace_all(&s, |caps: &regex::Captures| {
            protected.push(caps[0].to_string());
            let unit = IDENTIFIER_PLACEHOLDER_UNIT.to_string().repeat(protected.len());
            format!("{IDENTIFIER_PLACEHOLDER_DELIM}{unit}{IDENTIFIER_PLACEHOLDER_DELIM}")
        })
        .into_owned();

    let s = BIT_OR_HEX_STRING_LITERAL.replace_all(&s, "?").into_owned();
    let s = HEX_LITERAL.replace_all(&s, "?").into_owned();
    let s = STRING_LITERAL.replace_all(&s, "?").into_owned();
    let s = NUMERIC_LITERAL.replace_all(&s, "?").into_owned();
    let s = POSITIONAL_PLACEHOLDER.replace_all(&s, "?").into_owned();
    let s = IN_LIST.replace_all(&s, "in (?)").into_owned();

    let s = WHITESPACE.replace_all(s.trim(), " ").into_owned();
    let mut s = s.to_lowercase();

    for (idx, original) in protected.iter().enumerate() {
        let unit = IDENTIFIER_PLACEHOLDER_UNIT.to_string().repeat(idx + 1);
        let token = format!("{IDENTIFIER_PLACEHOLDER_DELIM}{unit}{IDENTIFIER_PLACEHOLDER_DELIM}");
        s = s.replace(&token, original);
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent() {
        let sql = "SELECT * FROM orders WHERE id = 42 AND name = 'bob' -- trailing\n";
        let once = fingerprint(sql);
        let twice = fingerprint(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn collapses_whitespace_and_case() {
        let a = fingerprint("SELECT  *\nFROM   Orders\tWHERE id=1");
        let b = fingerprint("select * from Orders where id=2");
        assert_eq!(a, b);
    }

    #[test]
    fn strips_comments() {
        let a = fingerprint("SELECT id /* pk */ FROM t -- note\nWHERE id = 1");
        assert!(!a.contains("pk"));
        assert!(!a.contains("note"));
    }

    #[test]
    fn replaces_string_and_numeric_literals() {
        let a = fingerprint("SELECT * FROM t WHERE name = 'alice' AND age = 30");
        let b = fingerprint("SELECT * FROM t WHERE name = 'bob' AND age = 99");
        assert_eq!(a, b);
        assert!(a.contains("name = ?"));
        assert!(a.contains("age = ?"));
    }

    #[test]
    fn preserves_quoted_identifiers() {
        let a = fingerprint("SELECT `User Name` FROM `Orders` WHERE id = 1");
        assert!(a.contains("`User Name`"));
        assert!(a.contains("`Orders`"));

        let b = fingerprint(r#"SELECT "UserName" FROM "Orders" WHERE id = 1"#);
        assert!(b.contains(r#""UserName""#));
    }

    #[test]
    fn preserves_null_true_false() {
        let a = fingerprint("SELECT * FROM t WHERE deleted_at IS NULL AND active = TRUE OR flag = FALSE");
        assert!(a.contains("null"));
        assert!(a.contains("true"));
        assert!(a.contains("false"));
    }

    #[test]
    fn normalises_existing_placeholders() {
        let a = fingerprint("SELECT * FROM t WHERE id = ?");
        let b = fingerprint("SELECT * FROM t WHERE id = $1");
        assert_eq!(a, b);
    }

    #[test]
    fn collapses_hex_and_binary_literals() {
        let a = fingerprint("SELECT * FROM t WHERE flags = 0xFF01");
        assert!(a.contains("flags = ?"));
        let b = fingerprint("SELECT * FROM t WHERE flags = x'FF01'");
        assert!(b.contains("flags = ?"));
    }

    #[test]
    fn collapses_in_lists_of_any_cardinality() {
        let a = fingerprint("SELECT * FROM t WHERE id IN (1, 2, 3)");
        let b = fingerprint("SELECT * FROM t WHERE id IN (1, 2, 3, 4, 5, 6, 7)");
        assert_eq!(a, b);
        assert!(a.contains("in (?)"));
    }
}
