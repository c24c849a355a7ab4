//! Quote- and paren-aware scanner for LogMiner `SQL_REDO` text
//!
//! LogMiner emits one canonical spelling of each statement, so the scanner
//! only knows the handful of tokens that spelling uses: keywords,
//! double-quoted identifiers and values. A value ends at the first
//! delimiter seen in [`ScanState::Normal`]; delimiters inside a quoted
//! literal or inside parentheses do not count. A top-level `;` ends any
//! value.
//!
//! Delimiters and quotes are ASCII, so every index the scanner stops at is
//! a char boundary.

use crate::common::{CdcError, RawValue, Result};

/// Marker LogMiner writes for values it cannot render as text
pub const UNSUPPORTED_TYPE: &str = "Unsupported Type";

/// Where the value scanner is within a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// At top level; delimiters end the value
    Normal,
    /// Between single quotes; `''` is an escaped quote
    InQuotedLiteral,
    /// Inside `depth` levels of parentheses
    InParenExpr { depth: usize },
}

/// One value as written in a redo statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueToken {
    /// Bare `NULL`
    Null,
    /// Single-quoted literal, quotes stripped, `''` kept as written
    Literal(String),
    /// Anything else (function calls, numbers), verbatim
    Expression(String),
    /// [`UNSUPPORTED_TYPE`]
    Unsupported,
}

impl ValueToken {
    fn classify(token: &str) -> Self {
        if token == "NULL" {
            return Self::Null;
        }
        if token == UNSUPPORTED_TYPE {
            return Self::Unsupported;
        }
        match literal_body(token) {
            Some(body) => Self::Literal(body.to_string()),
            None => Self::Expression(token.to_string()),
        }
    }

    /// Captured value; `NULL` and unsupported values are unknown
    pub fn into_raw(self) -> Option<RawValue> {
        match self {
            Self::Null | Self::Unsupported => None,
            Self::Literal(s) => Some(RawValue::Literal(s)),
            Self::Expression(s) => Some(RawValue::Expression(s)),
        }
    }
}

/// Body of `token` if it is exactly one quoted literal
fn literal_body(token: &str) -> Option<&str> {
    let bytes = token.as_bytes();
    if bytes.first() != Some(&b'\'') {
        return None;
    }
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return (i == bytes.len() - 1).then(|| &token[1..i]);
        }
        i += 1;
    }
    None
}

/// What ends a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueContext {
    /// `values (a,b)`: `,` or `)`
    Tuple,
    /// `set "a" = x, "b" = y where`: `,` or ` where `
    SetClause,
    /// `where "a" = x and "b" = y`: ` and `
    WhereClause,
}

pub(crate) struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    /// End of the statement body, before the optional trailing `;`
    end: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        let trimmed = text.trim_end();
        let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
        Self {
            text,
            pos: text.len() - text.trim_start().len(),
            end: body.len(),
        }
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        (self.pos < self.end).then(|| self.text.as_bytes()[self.pos])
    }

    pub(crate) fn error(&self, reason: impl std::fmt::Display) -> CdcError {
        CdcError::unparsable(format!("{} at offset {}", reason, self.pos), self.text)
    }

    pub(crate) fn skip_whitespace(&mut self) {
        let bytes = self.text.as_bytes();
        while self.pos < self.end && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    pub(crate) fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, byte: u8) -> Result<()> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    /// Consume `keyword` (ASCII, case-insensitive) if it is next as a whole word
    pub(crate) fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.keyword_at(self.pos, keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", keyword)))
        }
    }

    fn keyword_at(&self, at: usize, keyword: &str) -> bool {
        let bytes = self.text.as_bytes();
        let stop = at + keyword.len();
        stop <= self.end
            && bytes[at..stop].eq_ignore_ascii_case(keyword.as_bytes())
            && bytes
                .get(stop)
                .map_or(true, |b| !(b.is_ascii_alphanumeric() || *b == b'_'))
    }

    /// Whitespace, then `keyword`, then whitespace or the end of the body
    fn spaced_keyword_at(&self, at: usize, keyword: &str) -> bool {
        let bytes = self.text.as_bytes();
        if !bytes[at].is_ascii_whitespace() {
            return false;
        }
        let mut i = at;
        while i < self.end && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let stop = i + keyword.len();
        self.keyword_at(i, keyword) && (stop == self.end || bytes[stop].is_ascii_whitespace())
    }

    /// `"name"`; the name may hold anything but `"`
    pub(crate) fn quoted_identifier(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let start = self.pos;
        let Some(len) = self.text[start..self.end].find('"') else {
            return Err(self.error("unterminated identifier"));
        };
        if len == 0 {
            return Err(self.error("empty identifier"));
        }
        self.pos = start + len + 1;
        Ok(self.text[start..start + len].to_string())
    }

    /// Scan one value up to the delimiter of `context`
    pub(crate) fn value(&mut self, context: ValueContext) -> Result<ValueToken> {
        let bytes = self.text.as_bytes();
        let start = self.pos;
        let mut state = ScanState::Normal;
        let mut resume = ScanState::Normal;
        let mut i = start;

        while i < self.end {
            let b = bytes[i];
            match state {
                ScanState::InQuotedLiteral => {
                    if b == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 1;
                        } else {
                            state = resume;
                        }
                    }
                }
                ScanState::InParenExpr { depth } => match b {
                    b'\'' => {
                        resume = state;
                        state = ScanState::InQuotedLiteral;
                    }
                    b'(' => state = ScanState::InParenExpr { depth: depth + 1 },
                    b')' if depth == 1 => state = ScanState::Normal,
                    b')' => state = ScanState::InParenExpr { depth: depth - 1 },
                    _ => {}
                },
                ScanState::Normal => {
                    if self.ends_value(i, context) {
                        break;
                    }
                    match b {
                        b'\'' => {
                            resume = ScanState::Normal;
                            state = ScanState::InQuotedLiteral;
                        }
                        b'(' => state = ScanState::InParenExpr { depth: 1 },
                        _ => {}
                    }
                }
            }
            i += 1;
        }

        self.pos = i;
        match state {
            ScanState::Normal => {}
            ScanState::InQuotedLiteral => return Err(self.error("unterminated literal")),
            ScanState::InParenExpr { depth } => {
                return Err(self.error(format!("{} unclosed parentheses", depth)))
            }
        }

        let token = self.text[start..i].trim();
        if token.is_empty() {
            return Err(self.error("missing value"));
        }
        Ok(ValueToken::classify(token))
    }

    fn ends_value(&self, at: usize, context: ValueContext) -> bool {
        let b = self.text.as_bytes()[at];
        if b == b';' {
            return true;
        }
        match context {
            ValueContext::Tuple => b == b',' || b == b')',
            ValueContext::SetClause => b == b',' || self.spaced_keyword_at(at, "where"),
            ValueContext::WhereClause => self.spaced_keyword_at(at, "and"),
        }
    }

    /// Only whitespace and the optional `;` may remain
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.skip_whitespace();
        if self.pos < self.end {
            return Err(self.error("unexpected trailing text"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str, context: ValueContext) -> (ValueToken, usize) {
        let mut scanner = Scanner::new(text);
        let token = scanner.value(context).unwrap();
        (token, scanner.pos)
    }

    #[test]
    fn test_classify() {
        assert_eq!(ValueToken::classify("NULL"), ValueToken::Null);
        assert_eq!(ValueToken::classify("null"), ValueToken::Expression("null".into()));
        assert_eq!(ValueToken::classify("Unsupported Type"), ValueToken::Unsupported);
        assert_eq!(ValueToken::classify("'a'"), ValueToken::Literal("a".into()));
        assert_eq!(ValueToken::classify("''"), ValueToken::Literal("".into()));
        assert_eq!(
            ValueToken::classify("'a' || 'b'"),
            ValueToken::Expression("'a' || 'b'".into())
        );
        assert_eq!(ValueToken::classify("42"), ValueToken::Expression("42".into()));
    }

    #[test]
    fn test_escaped_quote_preserved() {
        let (token, _) = scan("'Bob''s dog','0')", ValueContext::Tuple);
        assert_eq!(token, ValueToken::Literal("Bob''s dog".into()));
    }

    #[test]
    fn test_delimiters_inside_literal() {
        let (token, pos) = scan("'a, b) c',NULL)", ValueContext::Tuple);
        assert_eq!(token, ValueToken::Literal("a, b) c".into()));
        assert_eq!(pos, 9);
    }

    #[test]
    fn test_function_call_with_comma() {
        let (token, _) = scan("FN('a,b'),'x')", ValueContext::Tuple);
        assert_eq!(token, ValueToken::Expression("FN('a,b')".into()));

        let (token, _) = scan(
            "TO_DATE('2020-02-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS'),NULL)",
            ValueContext::Tuple,
        );
        assert_eq!(
            token,
            ValueToken::Expression("TO_DATE('2020-02-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS')".into())
        );
    }

    #[test]
    fn test_paren_inside_quoted_argument() {
        let text = r"UNISTR('\7968(\60CA\FF09'),NULL)";
        let (token, _) = scan(text, ValueContext::Tuple);
        assert_eq!(token, ValueToken::Expression(r"UNISTR('\7968(\60CA\FF09')".into()));
    }

    #[test]
    fn test_nested_parens() {
        let (token, _) = scan("F(G(1, 2), (3)) where", ValueContext::SetClause);
        assert_eq!(token, ValueToken::Expression("F(G(1, 2), (3))".into()));
    }

    #[test]
    fn test_set_and_where_delimiters() {
        let (token, pos) = scan("'1' where \"ID\" = 2", ValueContext::SetClause);
        assert_eq!(token, ValueToken::Literal("1".into()));
        assert_eq!(pos, 3);

        let (token, _) = scan("Unsupported Type and \"X\" = 1", ValueContext::WhereClause);
        assert_eq!(token, ValueToken::Unsupported);

        let (token, _) = scan("'sand and' and \"X\" = 1", ValueContext::WhereClause);
        assert_eq!(token, ValueToken::Literal("sand and".into()));

        let (token, _) = scan("'last';", ValueContext::WhereClause);
        assert_eq!(token, ValueToken::Literal("last".into()));
    }

    #[test]
    fn test_scan_errors() {
        let err = Scanner::new("'open, 1)").value(ValueContext::Tuple).unwrap_err();
        assert!(matches!(err, CdcError::UnparsableStatement { .. }));
        assert!(err.to_string().contains("unterminated literal"));

        let err = Scanner::new("F(1, 2").value(ValueContext::Tuple).unwrap_err();
        assert!(err.to_string().contains("unclosed parentheses"));

        let err = Scanner::new(",").value(ValueContext::Tuple).unwrap_err();
        assert!(err.to_string().contains("missing value"));
    }

    #[test]
    fn test_identifiers() {
        let mut scanner = Scanner::new("\"OBJ# 74858\".\"COL 1\"");
        assert_eq!(scanner.quoted_identifier().unwrap(), "OBJ# 74858");
        scanner.expect(b'.').unwrap();
        assert_eq!(scanner.quoted_identifier().unwrap(), "COL 1");
        scanner.finish().unwrap();

        assert!(Scanner::new("\"\"").quoted_identifier().is_err());
        assert!(Scanner::new("\"open").quoted_identifier().is_err());
    }

    #[test]
    fn test_keywords() {
        let mut scanner = Scanner::new("INSERT into\"A\"");
        assert!(scanner.eat_keyword("insert"));
        scanner.skip_whitespace();
        assert!(scanner.eat_keyword("into"));
        assert_eq!(scanner.peek(), Some(b'"'));

        let mut scanner = Scanner::new("updated");
        assert!(!scanner.eat_keyword("update"));
    }

    #[test]
    fn test_finish() {
        let mut scanner = Scanner::new("  ;  ");
        scanner.finish().unwrap();

        let mut scanner = Scanner::new("x y");
        scanner.eat(b'x');
        assert!(scanner.finish().is_err());
    }
}
