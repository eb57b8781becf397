//! Wire protocol envelopes.
//!
//! Every request is one JSON text frame carrying a `method`, the addressed
//! scope (`database`/`collection`/`identifier`), an optional `key`/`value`
//! pair, the `unique` correlation id and the `authorization` token. Replies
//! echo the id back as `replyTo` together with a `kode` status; aggregate
//! replies additionally carry the dump under a top-level key named after the
//! requested database or collection, which is why [`ResponseEnvelope`]
//! retains unknown members.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status code signalling success.
pub const SUCCESS_KODE: i32 = 1;

/// Message the server sends on an authorization rejection; also the message
/// reported when a request could not be correlated to a response in time.
pub const VALIDATE_MESSAGE: &str =
    "Please validate: correct authorization code or unique value on request.";

/// Closure code for a requested shutdown. Never triggers a reconnect.
pub const NORMAL_CLOSE: u16 = 1000;

/// Application-level closure code for an authorization failure. Terminal:
/// recorded as the connection's last error, never retried.
pub const AUTH_FAILURE_CLOSE: u16 = 4001;

/// Wire method names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Method {
    Get,
    Add,
    Update,
    Delete,
    Drop,
    Revert,
    Aggregate,
}

impl Method {
    /// Delete and drop failures are classified separately from the other
    /// methods.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Method::Delete | Method::Drop)
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// A single key or an array of keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub unique: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

impl RequestEnvelope {
    pub fn builder(method: Method) -> RequestBuilder {
        RequestBuilder::new(method)
    }
}

/// Builder assembling a [`RequestEnvelope`] field by field; the correlation
/// id and token are attached last, by the request manager.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    database: Option<String>,
    collection: Option<String>,
    identifier: Option<String>,
    key: Option<Value>,
    value: Option<Value>,
}

impl RequestBuilder {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            database: None,
            collection: None,
            identifier: None,
            key: None,
            value: None,
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    pub fn identifier(mut self, identifier: &str) -> Self {
        self.identifier = Some(identifier.to_string());
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(Value::String(key.to_string()));
        self
    }

    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = Some(Value::Array(
            keys.into_iter().map(|k| Value::String(k.into())).collect(),
        ));
        self
    }

    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn build(self, unique: String, authorization: &str) -> RequestEnvelope {
        RequestEnvelope {
            method: self.method,
            database: self.database,
            collection: self.collection,
            identifier: self.identifier,
            key: self.key,
            value: self.value,
            unique,
            authorization: Some(authorization.to_string()),
        }
    }
}

/// Inbound reply envelope.
///
/// Consumed exactly once by the request awaiting `replyTo`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub kode: i32,
    /// Success payload (a JSON-encoded document string for document
    /// operations) or a human-readable failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(rename = "replyTo")]
    pub reply_to: String,
    /// Members outside the fixed envelope; aggregate dumps arrive here,
    /// keyed by the database or collection name.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.kode == SUCCESS_KODE
    }

    /// The failure (or informational) message carried by `response`.
    pub fn message(&self) -> Option<&str> {
        self.response.as_ref().and_then(Value::as_str)
    }

    /// Decodes the `response` payload into a document. Document operations
    /// return it as a JSON-encoded string; an already-structured payload is
    /// passed through.
    pub fn document(&self) -> Result<Value, serde_json::Error> {
        match &self.response {
            Some(Value::String(raw)) => serde_json::from_str(raw),
            Some(other) => Ok(other.clone()),
            None => Ok(Value::Null),
        }
    }

    /// The bulk dump an aggregate reply carries under `name`.
    pub fn dump(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// Whether a decoded inbound frame is a reply envelope at all: it must
    /// carry both the status field and the correlation id.
    pub fn looks_like_reply(value: &Value) -> bool {
        value.get("kode").is_some() && value.get("replyTo").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_envelope_skips_absent_fields() {
        let envelope = RequestEnvelope::builder(Method::Get)
            .database("library")
            .collection("books")
            .identifier("dune")
            .build("id-1".to_string(), "token");
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({
                "method": "get",
                "database": "library",
                "collection": "books",
                "identifier": "dune",
                "unique": "id-1",
                "authorization": "token",
            })
        );
    }

    #[test]
    fn test_request_envelope_key_forms() {
        let single = RequestEnvelope::builder(Method::Delete)
            .key("stock")
            .build("id-2".to_string(), "token");
        assert_eq!(single.key, Some(json!("stock")));

        let many = RequestEnvelope::builder(Method::Update)
            .keys(["stock", "price"])
            .build("id-3".to_string(), "token");
        assert_eq!(many.key, Some(json!(["stock", "price"])));
    }

    #[test]
    fn test_response_envelope_retains_extra_members() {
        let raw = r#"{"kode":1,"replyTo":"id-4","library":{"books":{"dune":"{\"x\":1}"}}}"#;
        let envelope: ResponseEnvelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.is_success());
        assert!(envelope.dump("library").is_some());
        assert!(envelope.dump("archive").is_none());
    }

    #[test]
    fn test_response_document_decodes_nested_string() {
        let envelope: ResponseEnvelope =
            serde_json::from_str(r#"{"kode":1,"replyTo":"id-5","response":"{\"pages\":412}"}"#)
                .unwrap();
        assert_eq!(envelope.document().unwrap(), json!({"pages": 412}));
    }

    #[test]
    fn test_looks_like_reply() {
        let reply = json!({"kode": 1, "replyTo": "id-6"});
        let chatter = json!({"notice": "server restarting"});
        assert!(ResponseEnvelope::looks_like_reply(&reply));
        assert!(!ResponseEnvelope::looks_like_reply(&chatter));
    }

    #[test]
    fn test_method_wire_names() {
        assert_eq!(serde_json::to_string(&Method::Aggregate).unwrap(), "\"aggregate\"");
        assert_eq!(Method::Drop.to_string(), "drop");
        assert!(Method::Drop.is_destructive());
        assert!(Method::Delete.is_destructive());
        assert!(!Method::Update.is_destructive());
    }
}
