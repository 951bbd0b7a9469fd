use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());
static COLUMN_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+(\(\d+(,\d+)?\))?$").unwrap());

/// Table and column names end up in DDL and `PRAGMA` statements, which cannot
/// take bound parameters.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// A column type or constraint such as `TEXT`, `PRIMARY KEY` or
/// `VARCHAR(64)`: every whitespace-separated word is a bare keyword with an
/// optional numeric size.
pub fn is_valid_column_spec(spec: &str) -> bool {
    let mut words = spec.split_whitespace().peekable();
    words.peek().is_some() && words.all(|word| COLUMN_KEYWORD.is_match(word))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid SQL identifier `{0}`: must start with a letter or underscore and contain only letters, digits and underscores")]
pub struct InvalidIdentifier(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlIdent(String);

impl SqlIdent {
    pub fn parse(name: &str) -> Result<Self, InvalidIdentifier> {
        if is_valid_identifier(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(InvalidIdentifier(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{is_valid_column_spec, is_valid_identifier, SqlIdent};

    #[test]
    fn accepts_daily_table_names() {
        assert!(is_valid_identifier("msf_console_2024_01_01"));
        assert!(is_valid_identifier("_scratch"));
        assert!(is_valid_identifier("Results2"));
    }

    #[test]
    fn rejects_names_that_would_need_quoting() {
        assert!(!is_valid_identifier("1table"));
        assert!(!is_valid_identifier("my-table"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("results; DROP TABLE x"));
        assert!(!is_valid_identifier("tâble"));
        assert!(!is_valid_identifier("results\n"));
    }

    #[test]
    fn column_specs_are_keywords_with_optional_size() {
        assert!(is_valid_column_spec("INTEGER"));
        assert!(is_valid_column_spec("PRIMARY KEY"));
        assert!(is_valid_column_spec("VARCHAR(64)"));
        assert!(is_valid_column_spec("DECIMAL(10,2)"));
        assert!(!is_valid_column_spec(""));
        assert!(!is_valid_column_spec("NOT A TYPE ("));
        assert!(!is_valid_column_spec("TEXT DEFAULT 'x'"));
        assert!(!is_valid_column_spec("TEXT); DROP TABLE results; --"));
    }

    #[test]
    fn parse_keeps_the_original_spelling() {
        let ident = SqlIdent::parse("Msf_Console").expect("valid identifier");
        assert_eq!(ident.as_str(), "Msf_Console");
        assert!(SqlIdent::parse("bad name").is_err());
    }
}
