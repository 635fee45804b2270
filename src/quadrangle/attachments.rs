//! Attachment payload normalization.
//!
//! Message rows carry their attachment payload in whatever shape the writer
//! produced: a native JSON array, a JSON-encoded string, a bare object, or
//! nothing at all. This codec is the single point that turns a raw payload
//! into a canonical descriptor list. It never fails: anything unparseable
//! degrades to an empty list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single attachment on a message.
///
/// Wire shape: `{ url, name?, size?, type? }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "type")]
    pub mime_type: Option<String>,
}

/// Decode a raw attachment payload into descriptors.
///
/// Rules: null → empty; a string is JSON-parsed (a parse failure is logged
/// and yields empty); a single object wraps into a one-element list; an
/// array passes through filtered to well-formed descriptors.
pub fn decode_attachments(raw: &Value) -> Vec<Attachment> {
    match raw {
        Value::Null => Vec::new(),
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            Ok(parsed) => coerce_list(&parsed),
            Err(e) => {
                tracing::warn!(
                    target: "quadrangle::attachments::decode_attachments",
                    "Dropping unparseable attachment payload: {}",
                    e
                );
                Vec::new()
            }
        },
        other => coerce_list(other),
    }
}

fn coerce_list(value: &Value) -> Vec<Attachment> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Value::Object(_) => serde_json::from_value(value.clone())
            .map(|attachment| vec![attachment])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_decodes_to_empty() {
        assert!(decode_attachments(&Value::Null).is_empty());
    }

    #[test]
    fn encoded_array_decodes_to_descriptors() {
        let raw = Value::String(
            r#"[{"url":"x","name":"f.png","size":100,"type":"image/png"}]"#.to_string(),
        );

        let decoded = decode_attachments(&raw);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].url, "x");
        assert_eq!(decoded[0].name.as_deref(), Some("f.png"));
        assert_eq!(decoded[0].size, Some(100));
        assert_eq!(decoded[0].mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn bad_json_string_decodes_to_empty() {
        let raw = Value::String("{bad json".to_string());
        assert!(decode_attachments(&raw).is_empty());
    }

    #[test]
    fn encoded_single_object_wraps_into_list() {
        let raw = Value::String(r#"{"url":"x","name":"doc.pdf"}"#.to_string());

        let decoded = decode_attachments(&raw);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name.as_deref(), Some("doc.pdf"));
    }

    #[test]
    fn native_array_passes_through_filtered() {
        let raw = json!([
            {"url": "a", "size": 10},
            {"name": "missing url"},
            {"url": "b", "type": "application/pdf"},
            42
        ]);

        let decoded = decode_attachments(&raw);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].url, "a");
        assert_eq!(decoded[1].url, "b");
    }

    #[test]
    fn descriptors_with_only_url_are_well_formed() {
        let decoded = decode_attachments(&json!([{"url": "a"}]));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, None);
        assert_eq!(decoded[0].size, None);
        assert_eq!(decoded[0].mime_type, None);
    }

    #[test]
    fn scalar_payloads_decode_to_empty() {
        assert!(decode_attachments(&json!(7)).is_empty());
        assert!(decode_attachments(&json!(true)).is_empty());
    }
}
