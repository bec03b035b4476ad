use serde::{Deserialize, Serialize};

/// A single note. Identity is the `id`; ids are assigned only by the
/// primary store, start at 1, and are never reused after deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub id: i64,
    pub title: String,
    pub body: String,
}

/// Fields a client may supply when creating or updating a record.
///
/// POST requires both fields; PUT and PATCH accept either. Presence is the
/// only check made; the values themselves are opaque strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl NoteFields {
    /// Parses a request body as a note-field object. Returns `None` when the
    /// text is not a JSON object or the fields are not strings.
    pub fn parse(body: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// Serializes a status or error message as the `{"msg": ...}` payload.
pub fn msg_payload(message: &str) -> String {
    serde_json::json!({ "msg": message }).to_string()
}
