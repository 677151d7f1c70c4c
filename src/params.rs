//! `key=value;key=value` parameter strings
//!
//! Used by `set_parameters`/`get_parameters` on the server, on threads and
//! on hardware streams.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

pub const KEY_SAMPLING_RATE: &str = "sampling_rate";
pub const KEY_FORMAT: &str = "format";
pub const KEY_CHANNELS: &str = "channels";
pub const KEY_FRAME_COUNT: &str = "frame_count";

/// Parsed parameter list, keys kept in sorted order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioParameters {
    entries: BTreeMap<String, String>,
}

impl AudioParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `k1=v1;k2=v2`. Empty segments are skipped; a key without
    /// `=` is kept with an empty value (used by `get_parameters` queries).
    pub fn parse(input: &str) -> Self {
        let mut entries = BTreeMap::new();
        for segment in input.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((k, v)) => entries.insert(k.trim().to_string(), v.trim().to_string()),
                None => entries.insert(segment.to_string(), String::new()),
            };
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Integer value for `key`; `None` when absent
    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::InvalidArgument(format!("{key}={v} is not an integer"))),
        }
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for AudioParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.entries {
            if !first {
                f.write_str(";")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let p = AudioParameters::parse("sampling_rate=48000; channels=2;;");
        assert_eq!(p.len(), 2);
        assert_eq!(p.get_int(KEY_SAMPLING_RATE).unwrap(), Some(48000));
        assert_eq!(p.get_int(KEY_FORMAT).unwrap(), None);
        assert_eq!(p.to_string(), "channels=2;sampling_rate=48000");
    }

    #[test]
    fn test_non_integer_value() {
        let p = AudioParameters::parse("frame_count=lots");
        assert!(p.get_int(KEY_FRAME_COUNT).is_err());
    }

    #[test]
    fn test_query_keys() {
        let p = AudioParameters::parse("routing;sampling_rate");
        assert_eq!(p.get("routing"), Some(""));
        assert_eq!(p.keys().count(), 2);
    }
}
