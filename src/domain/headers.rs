//! Case-insensitive header multimap with a deterministic byte form.
//!
//! The serialized form is one `Name: value\r\n` line per value, with names in MIME canonical
//! case and lines sorted by name. Values of a repeated header keep their arrival order. Two
//! header sets that differ only in wire order therefore serialize to the same bytes.
//!
//! Values are kept as raw bytes. Header values may carry obs-text (`0x80..=0xFF`), and those
//! bytes take part in request identity and must be replayed unchanged.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use super::error::DomainError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMultimap {
    entries: BTreeMap<String, Vec<Vec<u8>>>,
}

impl HeaderMultimap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every header except the ones listed in `skip`.
    pub fn from_header_map(headers: &HeaderMap, skip: &[HeaderName]) -> Self {
        let mut multimap = Self::new();
        for (name, value) in headers {
            if skip.contains(name) {
                continue;
            }
            multimap.append(name.as_str(), value.as_bytes());
        }
        multimap
    }

    pub fn append(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.entries
            .entry(canonical_name(name))
            .or_default()
            .push(sanitize_value(value.as_ref()));
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_slice()))
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in self.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Parse the bytes produced by [`HeaderMultimap::serialize`].
    ///
    /// Bare `\n` line endings are tolerated; blank lines are skipped.
    pub fn parse(blob: &[u8]) -> Result<Self, DomainError> {
        let mut multimap = Self::new();
        for (index, raw_line) in blob.split(|byte| *byte == b'\n').enumerate() {
            let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
            if line.trim_ascii().is_empty() {
                continue;
            }
            let colon = line
                .iter()
                .position(|byte| *byte == b':')
                .ok_or_else(|| DomainError::malformed_headers(index + 1, "missing `:`"))?;
            let name = line[..colon].trim_ascii();
            if name.is_empty() || !name.iter().copied().all(is_token_byte) {
                return Err(DomainError::malformed_headers(
                    index + 1,
                    format!("invalid header name `{}`", String::from_utf8_lossy(name)),
                ));
            }
            // token bytes are ASCII
            let name = std::str::from_utf8(name)
                .map_err(|err| DomainError::malformed_headers(index + 1, err.to_string()))?;
            multimap.append(name, line[colon + 1..].trim_ascii());
        }
        Ok(multimap)
    }

    pub fn to_header_map(&self) -> Result<HeaderMap, DomainError> {
        let mut headers = HeaderMap::with_capacity(self.len());
        for (index, (name, value)) in self.iter().enumerate() {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                DomainError::malformed_headers(index + 1, format!("`{name}`: {err}"))
            })?;
            let header_value = HeaderValue::from_bytes(value).map_err(|err| {
                DomainError::malformed_headers(index + 1, format!("value of `{name}`: {err}"))
            })?;
            headers.append(header_name, header_value);
        }
        Ok(headers)
    }
}

/// MIME canonical form: first letter and every letter after `-` upper-cased, the rest
/// lower-cased. Names containing non-token bytes are returned unchanged.
pub fn canonical_name(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    out
}

// Line breaks inside a value would split it into two lines on the next parse.
fn sanitize_value(value: &[u8]) -> Vec<u8> {
    value
        .trim_ascii()
        .iter()
        .map(|byte| match byte {
            b'\r' | b'\n' => b' ',
            other => *other,
        })
        .collect()
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_title_cases_segments() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("X-FORWARDED-FOR"), "X-Forwarded-For");
        assert_eq!(canonical_name("etag"), "Etag");
        assert_eq!(canonical_name("bad name"), "bad name");
    }

    #[test]
    fn serialization_ignores_insertion_order() {
        let mut first = HeaderMultimap::new();
        first.append("a", "1");
        first.append("B", "2");

        let mut second = HeaderMultimap::new();
        second.append("b", "2");
        second.append("A", "1");

        assert_eq!(first.serialize(), second.serialize());
        assert_eq!(first.serialize(), b"A: 1\r\nB: 2\r\n");
    }

    #[test]
    fn repeated_values_keep_arrival_order() {
        let mut headers = HeaderMultimap::new();
        headers.append("Accept", "text/html");
        headers.append("accept", "application/json");

        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.serialize(),
            b"Accept: text/html\r\nAccept: application/json\r\n"
        );
    }

    #[test]
    fn parse_reads_back_serialized_bytes() {
        let mut headers = HeaderMultimap::new();
        headers.append("content-type", "text/plain; charset=utf-8");
        headers.append("set-cookie", "a=1");
        headers.append("set-cookie", "b=2");

        let parsed = HeaderMultimap::parse(&headers.serialize()).expect("parse");
        assert_eq!(parsed, headers);
    }

    #[test]
    fn parse_tolerates_bare_newlines_and_blank_lines() {
        let parsed = HeaderMultimap::parse(b"X-One: 1\n\nX-Two:   2  \n").expect("parse");
        assert_eq!(parsed.serialize(), b"X-One: 1\r\nX-Two: 2\r\n");
    }

    #[test]
    fn parse_rejects_line_without_colon() {
        let err = HeaderMultimap::parse(b"Content-Type: text/plain\r\ngarbage\r\n")
            .expect_err("malformed");
        assert!(matches!(err, DomainError::MalformedHeaders { line: 2, .. }));
    }

    #[test]
    fn parse_rejects_invalid_name() {
        let err = HeaderMultimap::parse(b"Bad Name: x\r\n").expect_err("malformed");
        assert!(matches!(err, DomainError::MalformedHeaders { line: 1, .. }));
    }

    #[test]
    fn value_line_breaks_are_flattened() {
        let mut headers = HeaderMultimap::new();
        headers.append("X-Note", "one\r\ntwo");
        assert_eq!(headers.serialize(), b"X-Note: one  two\r\n");
    }

    #[test]
    fn opaque_value_bytes_survive_a_round_trip() {
        let mut map = HeaderMap::new();
        map.insert(
            "x-name",
            HeaderValue::from_bytes(b"caf\xe9").expect("obs-text value"),
        );

        let headers = HeaderMultimap::from_header_map(&map, &[]);
        let blob = headers.serialize();
        assert_eq!(blob, b"X-Name: caf\xe9\r\n");

        let back = HeaderMultimap::parse(&blob)
            .expect("parse")
            .to_header_map()
            .expect("valid headers");
        assert_eq!(back["x-name"].as_bytes(), b"caf\xe9");
    }

    #[test]
    fn distinct_opaque_values_serialize_differently() {
        let mut first = HeaderMultimap::new();
        first.append("X-Tag", b"\xff");
        let mut second = HeaderMultimap::new();
        second.append("X-Tag", b"\xfe");

        assert_ne!(first.serialize(), second.serialize());
    }

    #[test]
    fn header_map_conversion_skips_listed_names() {
        let mut map = HeaderMap::new();
        map.insert("host", HeaderValue::from_static("example.com"));
        map.insert("accept", HeaderValue::from_static("*/*"));

        let headers = HeaderMultimap::from_header_map(&map, &[axum::http::header::HOST]);
        assert_eq!(headers.serialize(), b"Accept: */*\r\n");

        let back = headers.to_header_map().expect("valid headers");
        assert_eq!(back.get("accept").expect("accept"), "*/*");
        assert!(back.get("host").is_none());
    }
}
