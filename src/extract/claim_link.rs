//! Claim link recovery
//!
//! Links were pasted through markdown, HTML attributes and URL encoders, so the
//! base64 value often arrives with junk attached, e.g. `...fQ%3D%3D&network=100"`.

use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine;

use crate::error::SanitizeError;

/// Padding-tolerant standard alphabet
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

const TRAILING_JUNK: &[char] = &['"', '\'', '<', '>', '\\', ')', ']', '*', '`', '.', ','];

/// Extract the raw value of the `claim` query parameter
pub fn claim_parameter(link: &str) -> Result<&str, SanitizeError> {
    link.split_once("claim=")
        .map(|(_, value)| value)
        .ok_or(SanitizeError::MissingParameter)
}

/// Strip transport artifacts and check what is left is base64
pub fn sanitize_payload(raw: &str) -> Result<String, SanitizeError> {
    let value = raw.split('&').next().unwrap_or_default();
    // an HTML attribute ends the value
    let value = value
        .split(|c| matches!(c, '"' | '\'' | '<' | '>'))
        .next()
        .unwrap_or_default();

    let mut cleaned = replace_ignore_case(value, "%3D", "=");
    cleaned = replace_ignore_case(&cleaned, "%2B", "+");
    cleaned = replace_ignore_case(&cleaned, "%2F", "/");

    let trimmed = cleaned.trim().trim_end_matches(TRAILING_JUNK);
    let mapped: String = trimmed
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    if let Some(bad) = mapped
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')))
    {
        return Err(SanitizeError::InvalidCharacter(bad));
    }
    if mapped.trim_end_matches('=').is_empty() {
        return Err(SanitizeError::Empty);
    }
    Ok(mapped)
}

/// Decode a sanitized payload, with or without padding
pub fn decode_payload(sanitized: &str) -> Result<Vec<u8>, base64::DecodeError> {
    LENIENT.decode(sanitized.trim_end_matches('='))
}

fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower = needle.to_ascii_lowercase();
    haystack.replace(needle, replacement).replace(&lower, replacement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn test_strips_encoded_padding_and_network_suffix() {
        let encoded = STANDARD.encode(br#"{"a":1}"#);
        assert!(encoded.ends_with('='));
        let mangled = format!("{}%3D&network=100\"", encoded.trim_end_matches('='));

        let sanitized = sanitize_payload(&mangled).unwrap();
        assert_eq!(sanitized, format!("{}=", encoded.trim_end_matches('=')));
        assert_eq!(decode_payload(&sanitized).unwrap(), br#"{"a":1}"#);
    }

    #[test]
    fn test_strips_html_artifacts() {
        let encoded = STANDARD.encode(b"[1,2]");
        let sanitized = sanitize_payload(&format!("{}\\\"><", encoded)).unwrap();
        assert_eq!(decode_payload(&sanitized).unwrap(), b"[1,2]");
    }

    #[test]
    fn test_cuts_at_html_attribute_end() {
        let encoded = STANDARD.encode(br#"{"b":2}"#);
        let link = format!(r#"https://pay.ubq.fi?claim={}">[ 5 WXDAI ]</a>"#, encoded);
        let sanitized = sanitize_payload(claim_parameter(&link).unwrap()).unwrap();
        assert_eq!(decode_payload(&sanitized).unwrap(), br#"{"b":2}"#);
    }

    #[test]
    fn test_residual_characters_rejected() {
        assert_eq!(
            sanitize_payload("eyJh!IjoxfQ"),
            Err(SanitizeError::InvalidCharacter('!'))
        );
        assert_eq!(sanitize_payload("%3D%3D"), Err(SanitizeError::Empty));
    }

    #[test]
    fn test_url_safe_alphabet_is_mapped() {
        let sanitized = sanitize_payload("ab-_").unwrap();
        assert_eq!(sanitized, "ab+/");
    }

    #[test]
    fn test_claim_parameter() {
        assert_eq!(
            claim_parameter("https://pay.ubq.fi/?claim=abc&network=1").unwrap(),
            "abc&network=1"
        );
        assert_eq!(
            claim_parameter("https://pay.ubq.fi/"),
            Err(SanitizeError::MissingParameter)
        );
    }
}
