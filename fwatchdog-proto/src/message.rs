//! Envelope message types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// HTTP header set: canonical header name to every value, in arrival order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Raw request body wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    /// Body bytes, base64-encoded on the wire.
    #[serde(with = "crate::codec::base64_bytes")]
    pub raw: Vec<u8>,
}

/// Raw request envelope: headers plus the unmodified body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request headers.
    pub header: Headers,
    /// Request body.
    pub body: Body,
}

impl Envelope {
    /// Wraps `body` and `header` into an envelope.
    pub fn new(body: impl Into<Vec<u8>>, header: Headers) -> Self {
        Self {
            header,
            body: Body { raw: body.into() },
        }
    }

    /// Splits the envelope back into `(body, headers)`.
    pub fn into_parts(self) -> (Vec<u8>, Headers) {
        (self.body.raw, self.header)
    }
}

/// A single decoded `multipart/form-data` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    /// Field value. Base64 when [`encoded`](Self::encoded) is set.
    pub value: String,
    /// Original file name for file uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Whether `value` holds base64-encoded binary content.
    #[serde(default)]
    pub encoded: bool,
}

impl FormField {
    /// A plain text field.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            filename: None,
            encoded: false,
        }
    }

    /// A file upload; `data` is stored base64-encoded.
    pub fn file(filename: Option<String>, data: &[u8]) -> Self {
        use base64::Engine as _;

        Self {
            value: base64::engine::general_purpose::STANDARD.encode(data),
            filename,
            encoded: true,
        }
    }

    /// Returns the field content as bytes, decoding base64 when needed.
    pub fn bytes(&self) -> crate::Result<Vec<u8>> {
        use base64::Engine as _;

        if self.encoded {
            Ok(base64::engine::general_purpose::STANDARD.decode(&self.value)?)
        } else {
            Ok(self.value.clone().into_bytes())
        }
    }
}

/// Form envelope: headers plus decoded multipart fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormEnvelope {
    /// Request headers.
    pub header: Headers,
    /// Form fields keyed by field name.
    pub form: BTreeMap<String, FormField>,
}
