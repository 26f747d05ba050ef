//! Line protocol between reaper clients and the reaper sidecar.
//!
//! ```text
//! client -> server   label=<key>=<value>[&label=<key>=<value>...]\n
//! server -> client   ACK\n      (one per accepted line)
//! ```
//!
//! Each line is one [`Selector`]. Clauses joined with `&` on a line must all
//! match, so `label=a=1&label=b=2` only covers resources carrying both
//! labels. Separate lines are independent: a resource matching any line a
//! client registered is swept. Label values therefore cannot contain `&`.
//!
//! The client keeps the connection open for its whole lifetime. The server
//! treats the connection closing as the end of the owning process.

use std::collections::HashMap;
use std::fmt;

use crate::labels::LabelFilter;

/// Acknowledgement line sent by the server for each accepted filter.
pub const ACK: &str = "ACK";

/// Prefix of a filter line.
pub const FILTER_PREFIX: &str = "label=";

/// Separates the clauses of a compound line.
pub const CLAUSE_SEPARATOR: char = '&';

/// Port the sidecar listens on inside its container.
pub const REAPER_PORT: u16 = 8080;

/// Longest filter line either side accepts.
pub const MAX_LINE_LEN: usize = 4096;

/// Errors parsing a protocol line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The line does not start with `label=`.
    #[error("unsupported filter clause: {0:?}")]
    UnsupportedClause(String),

    /// The label clause is not `key=value`.
    #[error("malformed label filter: {0}")]
    MalformedFilter(String),

    /// The line exceeds [`MAX_LINE_LEN`].
    #[error("line too long ({0} bytes)")]
    TooLong(usize),
}

/// Label filters that must all match, carried on one protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector(Vec<LabelFilter>);

impl Selector {
    /// Selector requiring every filter in `filters`, or `None` if there are
    /// none. Order and duplicates do not matter.
    #[must_use]
    pub fn all_of(filters: impl IntoIterator<Item = LabelFilter>) -> Option<Self> {
        let mut filters: Vec<_> = filters.into_iter().collect();
        filters.sort();
        filters.dedup();
        (!filters.is_empty()).then_some(Self(filters))
    }

    /// The filters, sorted.
    #[must_use]
    pub fn filters(&self) -> &[LabelFilter] {
        &self.0
    }

    /// Whether `labels` satisfy every clause.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.0.iter().all(|f| f.matches(labels))
    }
}

impl From<LabelFilter> for Selector {
    fn from(filter: LabelFilter) -> Self {
        Self(vec![filter])
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, filter) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{CLAUSE_SEPARATOR}")?;
            }
            write!(f, "{filter}")?;
        }
        Ok(())
    }
}

/// Encode one filter as a newline-terminated line.
#[must_use]
pub fn encode_filter(filter: &LabelFilter) -> String {
    format!("{FILTER_PREFIX}{filter}\n")
}

/// Encode a selector as a newline-terminated line.
#[must_use]
pub fn encode_selector(selector: &Selector) -> String {
    let clauses: Vec<_> = selector
        .filters()
        .iter()
        .map(|f| format!("{FILTER_PREFIX}{f}"))
        .collect();
    format!("{}\n", clauses.join(&CLAUSE_SEPARATOR.to_string()))
}

/// Parse a line holding a single `label=<key>=<value>` clause.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for anything else, including compound lines.
pub fn parse_filter_line(line: &str) -> Result<LabelFilter, ProtocolError> {
    let selector = parse_selector_line(line)?;
    match selector.0.as_slice() {
        [filter] => Ok(filter.clone()),
        clauses => Err(ProtocolError::MalformedFilter(format!(
            "expected one clause, got {}",
            clauses.len()
        ))),
    }
}

/// Parse a filter line, with or without its trailing newline.
///
/// # Errors
///
/// Returns a [`ProtocolError`] unless every `&`-separated clause is
/// `label=<key>=<value>`.
pub fn parse_selector_line(line: &str) -> Result<Selector, ProtocolError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ProtocolError::TooLong(line.len()));
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let filters = line
        .split(CLAUSE_SEPARATOR)
        .map(parse_clause)
        .collect::<Result<Vec<_>, _>>()?;
    Selector::all_of(filters).ok_or_else(|| ProtocolError::UnsupportedClause(line.to_string()))
}

fn parse_clause(clause: &str) -> Result<LabelFilter, ProtocolError> {
    let filter = clause
        .strip_prefix(FILTER_PREFIX)
        .ok_or_else(|| ProtocolError::UnsupportedClause(clause.to_string()))?;
    filter.parse().map_err(ProtocolError::MalformedFilter)
}

/// Whether a server line is an acknowledgement.
#[must_use]
pub fn is_ack(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == ACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_encode_filter() {
        let filter = LabelFilter::new("testcontainers.session-id", "abc");
        assert_eq!(
            encode_filter(&filter),
            "label=testcontainers.session-id=abc\n"
        );
    }

    #[test]
    fn test_parse_encoded_filter() {
        let filter = LabelFilter::new("k", "v=with=equals");
        assert_eq!(
            parse_filter_line(&encode_filter(&filter)).expect("parse"),
            filter
        );
    }

    #[test_case("label=a=b\r\n", "a", "b" ; "crlf")]
    #[test_case("label=a=", "a", "" ; "empty value")]
    #[test_case("label=session=x\n", "session", "x" ; "plain")]
    fn test_parse_filter_line(line: &str, key: &str, value: &str) {
        assert_eq!(
            parse_filter_line(line).expect("parse"),
            LabelFilter::new(key, value)
        );
    }

    #[test_case("name=foo" ; "other clause")]
    #[test_case("" ; "empty")]
    fn test_parse_rejects_unsupported(line: &str) {
        assert!(matches!(
            parse_filter_line(line),
            Err(ProtocolError::UnsupportedClause(_))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_and_oversized() {
        assert!(matches!(
            parse_filter_line("label=novalue"),
            Err(ProtocolError::MalformedFilter(_))
        ));
        let long = format!("label=k={}", "x".repeat(MAX_LINE_LEN));
        assert!(matches!(
            parse_filter_line(&long),
            Err(ProtocolError::TooLong(_))
        ));
    }

    // ===== Compound Line Tests =====

    #[test]
    fn test_compound_line_requires_every_clause() {
        let selector =
            parse_selector_line("label=testcontainers.session-id=a&label=app=web\n").expect("parse");
        assert_eq!(
            selector.filters(),
            [
                LabelFilter::new("app", "web"),
                LabelFilter::new("testcontainers.session-id", "a"),
            ]
        );

        let both: HashMap<String, String> = [
            ("testcontainers.session-id".to_string(), "a".to_string()),
            ("app".to_string(), "web".to_string()),
        ]
        .into_iter()
        .collect();
        let session_only: HashMap<String, String> =
            [("testcontainers.session-id".to_string(), "a".to_string())]
                .into_iter()
                .collect();
        assert!(selector.matches(&both));
        assert!(!selector.matches(&session_only));
    }

    #[test]
    fn test_encode_selector() {
        let selector = Selector::all_of([LabelFilter::new("b", "2"), LabelFilter::new("a", "1")])
            .expect("non-empty");
        let line = encode_selector(&selector);
        assert_eq!(line, "label=a=1&label=b=2\n");
        assert_eq!(parse_selector_line(&line).expect("parse"), selector);
        assert_eq!(selector.to_string(), "a=1&b=2");
    }

    #[test_case("label=a=1&" ; "trailing separator")]
    #[test_case("label=a=1&name=x" ; "foreign clause")]
    fn test_compound_line_rejects_bad_clause(line: &str) {
        assert!(matches!(
            parse_selector_line(line),
            Err(ProtocolError::UnsupportedClause(_))
        ));
    }

    #[test]
    fn test_single_filter_parse_rejects_compound_line() {
        assert!(matches!(
            parse_filter_line("label=a=1&label=b=2"),
            Err(ProtocolError::MalformedFilter(_))
        ));
        assert!(Selector::all_of(Vec::new()).is_none());
    }

    #[test]
    fn test_is_ack() {
        assert!(is_ack("ACK\n"));
        assert!(is_ack("ACK"));
        assert!(!is_ack("NACK\n"));
    }
}
