use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;

use appmgr_core::{AppMgrError, Result};

use crate::markup::Markup;

pub const TEXT_HTML: &str = "text/html; charset=utf-8";
pub const APPLICATION_JSON: &str = "application/json; charset=utf-8";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A response body as produced by a handler.
///
/// The variant decides how the body is emitted: strings and markup as
/// HTML text, structured values as JSON, bytes untouched. `Absent` is a
/// handler bug and is refused at emission time.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Markup(Markup),
    Bytes(Bytes),
    Absent,
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> std::result::Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Payload::Json)
    }
}

/// A payload ready for the transport: content type plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub content_type: &'static str,
    pub body: Bytes,
}

/// Converts a payload to its wire form.
///
/// Markup is flattened to its string form here, before any serializer
/// sees it, so it is never JSON-quoted.
pub fn normalize(payload: Payload) -> Result<Normalized> {
    let (content_type, body) = match payload {
        Payload::Markup(markup) => (TEXT_HTML, Bytes::from(markup.into_string())),
        Payload::Text(text) => (TEXT_HTML, Bytes::from(text)),
        Payload::Json(value) => (APPLICATION_JSON, Bytes::from(value.to_string())),
        Payload::Bytes(bytes) => (OCTET_STREAM, bytes),
        Payload::Absent => return Err(AppMgrError::InvalidResponse),
    };
    Ok(Normalized { content_type, body })
}

impl IntoResponse for Payload {
    fn into_response(self) -> Response {
        match normalize(self) {
            Ok(Normalized { content_type, body }) => (
                [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
                body,
            )
                .into_response(),
            Err(err) => {
                tracing::error!("Refusing to emit response: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl IntoResponse for Markup {
    fn into_response(self) -> Response {
        Payload::Markup(self).into_response()
    }
}

impl From<Markup> for Payload {
    fn from(markup: Markup) -> Self {
        Payload::Markup(markup)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map_or(Payload::Absent, Into::into)
    }
}
