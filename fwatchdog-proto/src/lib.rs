//! Request envelope exchanged between the function watchdog and its child.
//!
//! When `marshal_request` is enabled the watchdog does not pipe the raw HTTP
//! body to the function. It writes a single JSON document instead, carrying
//! the full header set next to the body bytes:
//!
//! ```json
//! {"header":{"Content-Type":["text/plain"]},"body":{"raw":"aGVsbG8="}}
//! ```
//!
//! Multipart uploads use the [`FormEnvelope`] variant, which replaces `body`
//! with a map of decoded form fields.

mod codec;
mod message;

pub use codec::{Error, Result, decode, encode};
pub use message::{Body, Envelope, FormEnvelope, FormField, Headers};
