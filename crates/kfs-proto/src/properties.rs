//! Header/value table for request parsing.
//!
//! Headers arrive as `Name: value` lines in arbitrary order; each command's
//! parser pulls out the fields it needs with typed accessors and defaults.

use std::collections::HashMap;
use std::str::FromStr;

/// A parsed set of `Header: value` pairs.
#[derive(Debug, Default, Clone)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load properties from the header lines of a request (everything after
    /// the command line). Lines without a separator are ignored; keys and
    /// values are trimmed.
    pub fn load(lines: &str) -> Self {
        let mut values = HashMap::new();
        for line in lines.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Raw string value for a header, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Numeric value for a header, or `default` when absent or malformed.
    pub fn get_num<T: FromStr + Copy>(&self, key: &str, default: T) -> T {
        self.values
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_basic() {
        let props = Properties::load("Cseq: 12\r\nFilename: a.dat\r\n");
        assert_eq!(props.get_num("Cseq", -1i64), 12);
        assert_eq!(props.get_str("Filename"), Some("a.dat"));
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_missing_returns_default() {
        let props = Properties::load("Cseq: 1\r\n");
        assert_eq!(props.get_num("Parent File-handle", -1i64), -1);
        assert!(props.get_str("Filename").is_none());
    }

    #[test]
    fn test_value_with_spaces() {
        let props = Properties::load("Chunk-server-name:  host.example \r\n");
        assert_eq!(props.get_str("Chunk-server-name"), Some("host.example"));
    }

    #[test]
    fn test_malformed_line_ignored() {
        let props = Properties::load("noseparator\r\nCseq: 3\r\n");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get_num("Cseq", -1i64), 3);
    }

    #[test]
    fn test_bad_number_falls_back() {
        let props = Properties::load("Chunk-offset: abc\r\n");
        assert_eq!(props.get_num("Chunk-offset", -1i64), -1);
    }
}
