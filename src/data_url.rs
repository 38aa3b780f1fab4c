//! Parsing `data:` URLs.

use std::sync::LazyLock;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use regex::Regex;

use crate::prelude::*;

/// Regex for parsing a `data:` URL.
static DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:(?P<mime_type>[^;,]+)?;base64,(?P<data>.+)$")
        .expect("failed to compile regex")
});

/// Parse a `data:` URL into a MIME type and Base64-encoded data.
pub fn parse_data_url(data_url: &str) -> Option<(Option<String>, &str)> {
    let caps = DATA_URL_RE.captures(data_url)?;
    let mime_type = caps.name("mime_type").map(|m| m.as_str().to_owned());
    let data = caps.name("data")?.as_str();
    Some((mime_type, data))
}

/// Decode a `data:` URL into a MIME type and bytes.
pub fn decode_data_url(data_url: &str) -> Result<(Option<String>, Vec<u8>)> {
    let (mime_type, data) = parse_data_url(data_url)
        .ok_or_else(|| anyhow!("only base64 `data:` URLs are supported"))?;
    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .context("invalid base64 in `data:` URL")?;
    Ok((mime_type, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_data_urls() {
        let (mime_type, bytes) =
            decode_data_url("data:text/plain;base64,SEVMTE8=").unwrap();
        assert_eq!(mime_type.as_deref(), Some("text/plain"));
        assert_eq!(bytes, b"HELLO");

        let (mime_type, _) = decode_data_url("data:;base64,SEVMTE8=").unwrap();
        assert_eq!(mime_type, None);
    }

    #[test]
    fn rejects_non_base64_data_urls() {
        assert!(decode_data_url("data:text/plain,HELLO").is_err());
        assert!(decode_data_url("data:text/plain;base64,***").is_err());
    }
}
