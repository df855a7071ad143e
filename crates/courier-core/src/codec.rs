//! Content encoding: typed payloads inside encrypted messages
//!
//! Message plaintexts are not raw strings but [`EncodedContent`] values
//! tagged with a [`ContentTypeId`], so clients can negotiate richer content
//! types over time. Only the text codec ships here; applications register
//! their own codecs for anything else and rely on `fallback` for readers
//! that lack them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};

/// Versioned, namespaced identifier for a content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTypeId {
    pub authority_id: String,
    pub type_id: String,
    pub version_major: u32,
    pub version_minor: u32,
}

impl std::fmt::Display for ContentTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}.{}",
            self.authority_id, self.type_id, self.version_major, self.version_minor
        )
    }
}

/// A typed payload plus codec parameters and a plain-text fallback for
/// clients that do not understand the type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedContent {
    pub content_type: ContentTypeId,
    pub parameters: BTreeMap<String, String>,
    pub fallback: Option<String>,
    pub content: Vec<u8>,
}

/// Encoder/decoder pair for one content type.
pub trait ContentCodec<T> {
    fn content_type(&self) -> ContentTypeId;

    fn encode(&self, value: T) -> Result<EncodedContent>;

    fn decode(&self, encoded: &EncodedContent) -> Result<T>;
}

/// UTF-8 text, the baseline type every client must support.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl TextCodec {
    pub const AUTHORITY: &'static str = "xmtp.org";
    pub const TYPE_ID: &'static str = "text";
}

impl ContentCodec<String> for TextCodec {
    fn content_type(&self) -> ContentTypeId {
        ContentTypeId {
            authority_id: Self::AUTHORITY.to_string(),
            type_id: Self::TYPE_ID.to_string(),
            version_major: 1,
            version_minor: 0,
        }
    }

    fn encode(&self, value: String) -> Result<EncodedContent> {
        let mut parameters = BTreeMap::new();
        parameters.insert("encoding".to_string(), "UTF-8".to_string());
        Ok(EncodedContent {
            content_type: self.content_type(),
            parameters,
            fallback: None,
            content: value.into_bytes(),
        })
    }

    fn decode(&self, encoded: &EncodedContent) -> Result<String> {
        if encoded.content_type.authority_id != Self::AUTHORITY
            || encoded.content_type.type_id != Self::TYPE_ID
        {
            return Err(CourierError::Codec(format!(
                "expected text content, got {}",
                encoded.content_type
            )));
        }
        String::from_utf8(encoded.content.clone())
            .map_err(|e| CourierError::Codec(format!("invalid UTF-8 text content: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let codec = TextCodec;
        let encoded = codec.encode("gm ☀️".to_string()).unwrap();
        assert_eq!(encoded.parameters.get("encoding").unwrap(), "UTF-8");
        assert_eq!(codec.decode(&encoded).unwrap(), "gm ☀️");
    }

    #[test]
    fn test_foreign_type_rejected() {
        let codec = TextCodec;
        let mut encoded = codec.encode("hello".to_string()).unwrap();
        encoded.content_type.type_id = "reaction".to_string();
        assert!(matches!(
            codec.decode(&encoded),
            Err(CourierError::Codec(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let codec = TextCodec;
        let mut encoded = codec.encode("hello".to_string()).unwrap();
        encoded.content = vec![0xff, 0xfe];
        assert!(matches!(
            codec.decode(&encoded),
            Err(CourierError::Codec(_))
        ));
    }

    #[test]
    fn test_content_type_display() {
        let codec = TextCodec;
        assert_eq!(codec.content_type().to_string(), "xmtp.org/text:1.0");
    }
}
