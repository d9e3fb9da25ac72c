//! Codec for the ASCII "KEY value" header page that precedes each
//! sub-observation in the ring buffer. One key per line, whitespace
//! separated, NUL padded to the header page size; unknown keys are ignored
//! by consumers.

use std::{collections::HashMap, str::FromStr};

use snafu::Snafu;

#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[snafu(display("required header key {key} is missing"))]
    MissingKey { key: String },
    #[snafu(display("header key {key} has unparsable value {value:?}"))]
    InvalidValue { key: String, value: String },
    #[snafu(display("header page is not valid UTF-8"))]
    NotText,
}

pub struct AsciiHeader<'a> {
    map: HashMap<&'a str, &'a str>,
}

impl<'a> AsciiHeader<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        // the page is NUL padded to its full size
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let text = std::str::from_utf8(&bytes[..end]).map_err(|_| HeaderError::NotText)?;

        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let Some(key) = parts.next() else { continue };
            let value = parts.next().unwrap_or("").trim();
            map.insert(key, value);
        }
        Ok(Self { map })
    }

    pub fn get_str(&self, key: &str) -> Result<&'a str, HeaderError> {
        self.map
            .get(key)
            .copied()
            .ok_or_else(|| HeaderError::MissingKey { key: key.into() })
    }

    pub fn get_opt_str(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).copied()
    }

    pub fn get<T: FromStr>(&self, key: &str) -> Result<T, HeaderError> {
        let raw = self.get_str(key)?;
        raw.parse().map_err(|_| HeaderError::InvalidValue {
            key: key.into(),
            value: raw.into(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

/// Render a header page from key/value pairs. Used by data producers and
/// the integration tests; the writer process only ever parses.
#[must_use]
pub fn render(pairs: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (k, v) in pairs {
        out.push_str(k);
        out.push(' ');
        out.push_str(v);
        out.push('\n');
    }
    out
}
