use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::KimiError;

pub const DEFAULT_IMAGE_MIME_TYPE: &str = "image/png";

/// `data:{mime};base64,{data}` image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub data: String,
}

impl DataUrl {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self { mime_type: mime_type.into(), data: data.into() }
    }

    pub fn encode(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn parse(raw: &str) -> Result<Self, KimiError> {
        let rest = raw
            .strip_prefix("data:")
            .ok_or_else(|| KimiError::MalformedInput("data URL must start with `data:`".into()))?;
        let (mime_type, data) = rest.split_once(";base64,").ok_or_else(|| {
            KimiError::MalformedInput("data URL must carry a `;base64,` payload".into())
        })?;
        if mime_type.trim().is_empty() {
            return Err(KimiError::MalformedInput("data URL has no MIME type".into()));
        }
        validate_base64(data)?;
        Ok(Self::new(mime_type, data))
    }

    pub fn decode_bytes(&self) -> Result<Vec<u8>, KimiError> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|err| KimiError::MalformedInput(format!("invalid base64 payload: {err}")))
    }
}

pub fn validate_base64(data: &str) -> Result<(), KimiError> {
    STANDARD
        .decode(data.as_bytes())
        .map(|_| ())
        .map_err(|err| KimiError::MalformedInput(format!("invalid base64 payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_1X1: &str = concat!(
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk",
        "+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg=="
    );

    #[test]
    fn data_url_round_trips_payload_and_mime_type() {
        let url = DataUrl::new("image/png", PNG_1X1);
        let encoded = url.encode();
        assert!(encoded.starts_with("data:image/png;base64,iVBOR"));

        let decoded = DataUrl::parse(&encoded).expect("data url must parse");
        assert_eq!(decoded.mime_type, "image/png");
        assert_eq!(decoded.data, PNG_1X1);
        assert_eq!(&decoded.decode_bytes().expect("payload must decode")[1..4], b"PNG");
    }

    #[test]
    fn data_url_rejects_malformed_inputs() {
        for raw in [
            "https://example.com/cat.png",
            "data:image/png,plain",
            "data:;base64,AAAA",
            "data:image/png;base64,not base64!",
        ] {
            assert!(
                matches!(DataUrl::parse(raw), Err(KimiError::MalformedInput(_))),
                "{raw} must be rejected"
            );
        }
    }
}
