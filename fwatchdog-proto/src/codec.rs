//! JSON encoding of envelopes.
//!
//! The codec is pure: it never touches I/O and never inspects the body
//! bytes beyond base64-encoding them.

use serde::{Deserialize, Serialize};

/// Alias for `Result<T, fwatchdog_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Envelope encoding and decoding errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The document is not valid JSON for the requested envelope type.
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// A field flagged as encoded does not hold valid base64.
    #[error("invalid base64 field: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Serializes `msg` as a single JSON document.
pub fn encode(msg: &impl Serialize) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Parses a JSON document produced by [`encode`].
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Serde adapter storing `Vec<u8>` as a standard (padded) base64 string.
pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes `bytes` as one base64 string.
    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    /// Reads a base64 string or `null`.
    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        // Some senders encode an empty body as `null`.
        let s = Option::<String>::deserialize(d)?;
        match s {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{Envelope, FormEnvelope, FormField, Headers};

    fn headers() -> Headers {
        let mut h = Headers::new();
        h.insert("Content-Type".into(), vec!["text/plain".into()]);
        h.insert("X-Multi".into(), vec!["a".into(), "b".into()]);
        h
    }

    #[test]
    fn roundtrip_envelope() {
        let env = Envelope::new(b"hello\x00\xff".to_vec(), headers());
        let bytes = encode(&env).unwrap();

        let decoded: Envelope = decode(&bytes).unwrap();
        let (body, header) = decoded.into_parts();
        assert_eq!(body, b"hello\x00\xff");
        assert_eq!(header, headers());
    }

    #[test]
    fn wire_shape_matches_go_json() {
        let env = Envelope::new(b"hello".to_vec(), Headers::new());
        let text = String::from_utf8(encode(&env).unwrap()).unwrap();
        assert_eq!(text, r#"{"header":{},"body":{"raw":"aGVsbG8="}}"#);
    }

    #[test]
    fn null_raw_decodes_as_empty() {
        let env: Envelope = decode(br#"{"header":{},"body":{"raw":null}}"#).unwrap();
        assert!(env.body.raw.is_empty());
    }

    #[test]
    fn form_envelope_fields() {
        let mut form = FormEnvelope {
            header: headers(),
            ..FormEnvelope::default()
        };
        form.form.insert("name".into(), FormField::text("alice"));
        form.form.insert(
            "upload".into(),
            FormField::file(Some("a.bin".into()), &[0, 1, 2]),
        );

        let decoded: FormEnvelope = decode(&encode(&form).unwrap()).unwrap();
        assert_eq!(decoded, form);
        assert_eq!(decoded.form["name"].bytes().unwrap(), b"alice");
        assert_eq!(decoded.form["upload"].bytes().unwrap(), vec![0, 1, 2]);
        assert_eq!(decoded.form["upload"].filename.as_deref(), Some("a.bin"));
    }

    #[test]
    fn rejects_malformed_document() {
        let result: Result<Envelope> = decode(b"{\"header\":");
        assert!(matches!(result, Err(Error::Json(_))));

        let result: Result<Envelope> = decode(br#"{"header":{},"body":{"raw":"!!"}}"#);
        assert!(result.is_err());
    }
}
