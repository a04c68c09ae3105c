//! Query source resolution.
//!
//! A [`QueryParser`] turns the source carried by a [`crate::models::Query`]
//! into the SQL the adapter runs. Parsing is synchronous and side-effect free.

use crate::error::DbError;
use crate::models::Variables;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Query source not found: {0}")]
    SourceNotFound(String),

    #[error("Query syntax error: {0}")]
    Syntax(String),

    #[error("Query parsing failed: {0}")]
    Unknown(String),
}

impl From<ParseError> for DbError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::SourceNotFound(source) => DbError::source_not_found(source),
            ParseError::Syntax(message) => DbError::syntax(message),
            ParseError::Unknown(message) => DbError::internal(message),
        }
    }
}

pub trait QueryParser: Send + Sync {
    /// Resolve `source` into executable SQL.
    fn parse(&self, source: &str, variables: &Variables) -> Result<String, ParseError>;
}

/// Uses the source as the SQL itself. Variables are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawParser;

impl QueryParser for RawParser {
    fn parse(&self, source: &str, _variables: &Variables) -> Result<String, ParseError> {
        let sql = source.trim();
        if sql.is_empty() {
            return Err(ParseError::Syntax("empty query".to_string()));
        }
        Ok(sql.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_raw_parser_trims() {
        let sql = RawParser.parse("  SELECT 1\n", &Variables::new()).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn test_raw_parser_rejects_empty() {
        let err = RawParser.parse("   ", &Variables::new()).unwrap_err();
        assert_eq!(err, ParseError::Syntax("empty query".to_string()));
    }

    #[test]
    fn test_parse_error_classification() {
        let not_found: DbError = ParseError::SourceNotFound("users.sql".into()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotExists);
        assert_eq!(not_found.to_string(), "Query source 'users.sql' does not exist");
        let syntax: DbError = ParseError::Syntax("bad token".into()).into();
        assert_eq!(syntax.kind(), ErrorKind::Syntax);
        let unknown: DbError = ParseError::Unknown("boom".into()).into();
        assert_eq!(unknown.kind(), ErrorKind::Internal);
    }
}
