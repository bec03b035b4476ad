//! Canonical request/response model shared by every network-facing
//! component.
//!
//! Three wire formats converge here: header-delimited (HTTP-style) text,
//! and the single-envelope JSON used by the raw TCP and UDP gateways. Both
//! decode to the same [`Request`] value so the forwarding policy and the
//! stores never care where a message came from.

use std::fmt;

use serde::Deserialize;

use crate::record::NoteFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Reads are answered from the local cache; everything else mutates and
    /// therefore forwards and replicates.
    pub fn is_read(self) -> bool {
        matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized request, independent of the wire format it arrived on.
///
/// `body` is canonical JSON text when the raw body parsed as a JSON object
/// or array, the raw text otherwise, and `None` when the body was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<String>,
}

/// Why a complete message could not be turned into a [`Request`].
///
/// An unknown method still produces a local error payload; anything else is
/// connection-fatal because the remaining bytes cannot be trusted.
#[derive(Debug)]
pub enum DecodeError {
    UnknownMethod(String),
    Malformed(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownMethod(token) => write!(f, "unknown method '{token}'"),
            DecodeError::Malformed(reason) => write!(f, "malformed request: {reason}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Request {
    pub fn new(method: Method, path: impl Into<String>, body: Option<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
        }
    }

    /// Decodes a header-delimited message: method and path from the first
    /// line, body after the blank-line separator.
    pub fn from_http(text: &str) -> Result<Self, DecodeError> {
        let first_line = text
            .split("\r\n")
            .next()
            .ok_or_else(|| DecodeError::Malformed("empty message".into()))?;
        let mut parts = first_line.split_whitespace();
        let method_token = parts
            .next()
            .ok_or_else(|| DecodeError::Malformed("missing request line".into()))?;
        let path = parts
            .next()
            .ok_or_else(|| DecodeError::Malformed("request line has no path".into()))?;
        let method = Method::parse(method_token)
            .ok_or_else(|| DecodeError::UnknownMethod(method_token.to_string()))?;

        let body = match text.find("\r\n\r\n") {
            Some(idx) => canonical_body(&text[idx + 4..]),
            None => None,
        };
        Ok(Request::new(method, path, body))
    }

    /// Decodes a single-envelope message: a JSON object with `method`,
    /// `path`, and an optional object-valued `body`.
    pub fn from_envelope(text: &str) -> Result<Self, DecodeError> {
        #[derive(Deserialize)]
        struct Envelope {
            method: String,
            path: String,
            #[serde(default)]
            body: Option<serde_json::Value>,
        }

        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let method = Method::parse(&envelope.method)
            .ok_or(DecodeError::UnknownMethod(envelope.method))?;
        let body = match envelope.body {
            None | Some(serde_json::Value::Null) => None,
            Some(value @ serde_json::Value::Object(_)) => Some(value.to_string()),
            Some(_) => {
                return Err(DecodeError::Malformed("envelope body must be an object".into()))
            }
        };
        Ok(Request::new(method, envelope.path, body))
    }
}

/// Re-serializes a JSON object or array body in canonical form; any other
/// text passes through untouched. An empty body becomes `None`.
fn canonical_body(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            Some(value.to_string())
        }
        _ => Some(trimmed.to_string()),
    }
}

/// Distinguishes the two framings a replica can receive on one TCP port:
/// header-delimited messages start with a method token or carry an HTTP
/// version marker; everything else is a single envelope.
pub fn looks_like_http(text: &str) -> bool {
    ["GET", "POST", "PUT", "PATCH", "DELETE"]
        .iter()
        .any(|method| text.starts_with(method))
        || text.contains("HTTP/")
}

/// A parsed `/notes` path: the collection or one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotesPath {
    List,
    Item(i64),
}

pub fn parse_notes_path(path: &str) -> Option<NotesPath> {
    match path.strip_prefix("/notes") {
        Some("") => Some(NotesPath::List),
        Some(rest) => parse_id(rest.strip_prefix('/')?).map(NotesPath::Item),
        None => None,
    }
}

/// Accepts plain decimal ids only, matching the `\d+` route patterns.
pub fn parse_id(text: &str) -> Option<i64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Structural validation applied before a request is served or forwarded.
///
/// POST needs both `title` and `body`; PUT and PATCH need at least one of
/// them; GET and DELETE must carry no body at all. Anything that fails here
/// is answered locally and never reaches the primary.
pub fn validate(request: &Request) -> bool {
    let Some(path) = parse_notes_path(&request.path) else {
        return false;
    };
    match (request.method, path) {
        (Method::Get, _) | (Method::Delete, NotesPath::Item(_)) => request.body.is_none(),
        (Method::Post, NotesPath::List) => {
            body_satisfies(request, |fields| fields.title.is_some() && fields.body.is_some())
        }
        (Method::Put, NotesPath::Item(_)) | (Method::Patch, NotesPath::Item(_)) => {
            body_satisfies(request, |fields| fields.title.is_some() || fields.body.is_some())
        }
        _ => false,
    }
}

fn body_satisfies(request: &Request, check: impl Fn(&NoteFields) -> bool) -> bool {
    request
        .body
        .as_deref()
        .and_then(NoteFields::parse)
        .map(|fields| check(&fields))
        .unwrap_or(false)
}

/// The canonical response: a success flag plus a JSON payload already
/// serialized to text. Error payloads carry a `msg` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub ok: bool,
    pub payload: String,
}

impl Response {
    pub fn ok(payload: String) -> Self {
        Self { ok: true, payload }
    }

    pub fn error(payload: String) -> Self {
        Self { ok: false, payload }
    }
}
