//! # Aggregation & Filter Engine
//!
//! Materializes bulk dumps into structured entities. A database dump is an
//! object of collections, each collection an object mapping item
//! identifiers to JSON-encoded payload strings; payloads stay raw until a
//! caller decodes them. Filtered construction applies a predicate per item
//! at build time: items missing the filter key are excluded outright, and a
//! numeric predicate only ever compares within its wire-declared domain.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("the reply does not carry a dump named {name}")]
    MissingDump { name: String },

    #[error("the dump for {name} is not a JSON object")]
    MalformedDump { name: String },

    #[error("item {identifier} in {name} does not carry a JSON text payload")]
    MalformedItem { name: String, identifier: String },

    #[error("item {identifier} could not be decoded: {source}")]
    Decode {
        identifier: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "field {key} of item {identifier} is {found} but the filter compares {expected}; \
         numeric filters never cross domains"
    )]
    DomainMismatch {
        key: String,
        identifier: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Casing mode for string filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FilterCasing {
    Equals,
    EqualsIgnoreCase,
    NotEquals,
    NotEqualsIgnoreCase,
}

/// Comparator for numeric filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum NumberComparator {
    Equals,
    GreaterThan,
    LessThan,
    GreaterOrEquals,
    LessOrEquals,
}

impl NumberComparator {
    fn compare<T: PartialOrd>(&self, field: T, value: T) -> bool {
        match self {
            NumberComparator::Equals => field == value,
            NumberComparator::GreaterThan => field > value,
            NumberComparator::LessThan => field < value,
            NumberComparator::GreaterOrEquals => field >= value,
            NumberComparator::LessOrEquals => field <= value,
        }
    }
}

/// Per-item predicate applied at aggregation time.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Text {
        value: String,
        casing: FilterCasing,
    },
    Int {
        value: i64,
        comparator: NumberComparator,
    },
    Float {
        value: f64,
        comparator: NumberComparator,
    },
    /// Opaque equality against an arbitrary JSON value.
    Value { value: Value },
}

struct WrongDomain {
    expected: &'static str,
    found: &'static str,
}

impl Filter {
    pub fn text(value: impl Into<String>, casing: FilterCasing) -> Self {
        Filter::Text {
            value: value.into(),
            casing,
        }
    }

    pub fn int(value: i64, comparator: NumberComparator) -> Self {
        Filter::Int { value, comparator }
    }

    pub fn float(value: f64, comparator: NumberComparator) -> Self {
        Filter::Float { value, comparator }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Filter::Value {
            value: value.into(),
        }
    }

    fn matches(&self, field: &Value) -> Result<bool, WrongDomain> {
        match self {
            Filter::Text { value, casing } => {
                let field = field.as_str().ok_or(WrongDomain {
                    expected: "a string",
                    found: json_type(field),
                })?;
                Ok(match casing {
                    FilterCasing::Equals => field == value,
                    FilterCasing::EqualsIgnoreCase => field.eq_ignore_ascii_case(value),
                    FilterCasing::NotEquals => field != value,
                    FilterCasing::NotEqualsIgnoreCase => !field.eq_ignore_ascii_case(value),
                })
            }
            Filter::Int { value, comparator } => {
                let field = field.as_i64().ok_or(WrongDomain {
                    expected: "an integer",
                    found: json_type(field),
                })?;
                Ok(comparator.compare(field, *value))
            }
            Filter::Float { value, comparator } => {
                // as_f64 would happily widen integers; the domain rule
                // forbids that, so require an actual floating field.
                let field = field
                    .as_number()
                    .filter(|n| n.is_f64())
                    .and_then(|n| n.as_f64())
                    .ok_or(WrongDomain {
                        expected: "a floating-point number",
                        found: json_type(field),
                    })?;
                Ok(comparator.compare(field, *value))
            }
            Filter::Value { value } => Ok(field == value),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a floating-point number",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One item of a collection dump: raw JSON text, decoded lazily.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    raw: String,
}

impl Document {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The payload exactly as the server sent it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.raw)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.raw)
    }
}

/// A materialized collection: item identifier to payload. Read-only after
/// construction; iteration order is not the dump's order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedCollection {
    name: String,
    data: HashMap<String, Document>,
}

impl AggregatedCollection {
    /// Builds a collection from its dump, optionally keeping only the items
    /// whose `key` field satisfies `filter`.
    pub fn from_dump(
        name: &str,
        dump: &Value,
        filter: Option<(&str, &Filter)>,
    ) -> Result<Self, AggregateError> {
        let object = dump.as_object().ok_or_else(|| AggregateError::MalformedDump {
            name: name.to_string(),
        })?;

        let mut data = HashMap::new();
        for (identifier, payload) in object {
            let raw = payload
                .as_str()
                .ok_or_else(|| AggregateError::MalformedItem {
                    name: name.to_string(),
                    identifier: identifier.clone(),
                })?;

            if let Some((key, filter)) = filter {
                let decoded: Value =
                    serde_json::from_str(raw).map_err(|source| AggregateError::Decode {
                        identifier: identifier.clone(),
                        source,
                    })?;
                let Some(field) = decoded.get(key) else {
                    // Items without the filter key are excluded outright.
                    continue;
                };
                let keep =
                    filter
                        .matches(field)
                        .map_err(|domain| AggregateError::DomainMismatch {
                            key: key.to_string(),
                            identifier: identifier.clone(),
                            expected: domain.expected,
                            found: domain.found,
                        })?;
                if !keep {
                    continue;
                }
            }

            data.insert(identifier.clone(), Document::new(raw));
        }

        Ok(Self {
            name: name.to_string(),
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The retained items, identifier to payload.
    pub fn data(&self) -> &HashMap<String, Document> {
        &self.data
    }

    pub fn get(&self, identifier: &str) -> Option<&Document> {
        self.data.get(identifier)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A materialized database: the collections of a full dump, in dump order.
/// Read-only after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedDatabase {
    name: String,
    collections: Vec<AggregatedCollection>,
}

impl AggregatedDatabase {
    /// Builds a database from its dump; `filter` applies to the items of
    /// every contained collection.
    pub fn from_dump(
        name: &str,
        dump: &Value,
        filter: Option<(&str, &Filter)>,
    ) -> Result<Self, AggregateError> {
        let object = dump.as_object().ok_or_else(|| AggregateError::MalformedDump {
            name: name.to_string(),
        })?;

        let mut collections = Vec::with_capacity(object.len());
        for (collection_name, collection_dump) in object {
            collections.push(AggregatedCollection::from_dump(
                collection_name,
                collection_dump,
                filter,
            )?);
        }

        Ok(Self {
            name: name.to_string(),
            collections,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collections(&self) -> &[AggregatedCollection] {
        &self.collections
    }

    pub fn collection(&self, name: &str) -> Option<&AggregatedCollection> {
        self.collections.iter().find(|c| c.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn books_dump() -> Value {
        json!({
            "dune": "{\"author\":\"Herbert\",\"pages\":412,\"rating\":4.5}",
            "hyperion": "{\"author\":\"Simmons\",\"pages\":482,\"rating\":4.2}",
            "signed": "{\"author\":\"herbert\",\"pages\":90}",
        })
    }

    #[test]
    fn test_collection_without_filter_keeps_everything() {
        let collection = AggregatedCollection::from_dump("books", &books_dump(), None).unwrap();
        assert_eq!(collection.len(), 3);
        let dune = collection.get("dune").unwrap();
        assert_eq!(
            dune.to_value().unwrap(),
            json!({"author": "Herbert", "pages": 412, "rating": 4.5})
        );
    }

    #[test]
    fn test_numeric_greater_than() {
        // {"a": {"x":1}, "b": {"x":2}} filtered by x > 1 keeps exactly b.
        let dump = json!({"a": "{\"x\":1}", "b": "{\"x\":2}"});
        let filter = Filter::int(1, NumberComparator::GreaterThan);
        let collection =
            AggregatedCollection::from_dump("items", &dump, Some(("x", &filter))).unwrap();
        assert_eq!(collection.len(), 1);
        assert!(collection.get("b").is_some());
        assert!(collection.get("a").is_none());
    }

    #[test]
    fn test_text_casing_modes() {
        let filter = Filter::text("herbert", FilterCasing::EqualsIgnoreCase);
        let collection =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("author", &filter)))
                .unwrap();
        let mut kept = collection.data().keys().cloned().collect::<Vec<_>>();
        kept.sort();
        assert_eq!(kept, vec!["dune", "signed"]);

        let strict = Filter::text("herbert", FilterCasing::Equals);
        let collection =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("author", &strict)))
                .unwrap();
        assert_eq!(collection.len(), 1);
        assert!(collection.get("signed").is_some());

        let negated = Filter::text("Herbert", FilterCasing::NotEquals);
        let collection =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("author", &negated)))
                .unwrap();
        assert!(collection.get("dune").is_none());
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_missing_filter_key_excludes_item() {
        let filter = Filter::float(4.0, NumberComparator::GreaterThan);
        let collection =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("rating", &filter)))
                .unwrap();
        // "signed" has no rating field at all.
        let mut kept = collection.data().keys().cloned().collect::<Vec<_>>();
        kept.sort();
        assert_eq!(kept, vec!["dune", "hyperion"]);
    }

    #[test]
    fn test_numeric_domains_never_cross() {
        // pages is an integer field; a float filter over it is a caller
        // error, not a coerced comparison.
        let filter = Filter::float(100.0, NumberComparator::GreaterThan);
        let outcome =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("pages", &filter)));
        assert!(matches!(
            outcome,
            Err(AggregateError::DomainMismatch { expected: "a floating-point number", .. })
        ));

        // And the reverse: an int filter over a float field.
        let filter = Filter::int(4, NumberComparator::GreaterOrEquals);
        let outcome =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("rating", &filter)));
        assert!(matches!(
            outcome,
            Err(AggregateError::DomainMismatch { expected: "an integer", .. })
        ));
    }

    #[test]
    fn test_value_equality_filter() {
        let filter = Filter::value(412);
        let collection =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("pages", &filter)))
                .unwrap();
        assert_eq!(collection.len(), 1);
        assert!(collection.get("dune").is_some());

        let filter = Filter::value(json!("Simmons"));
        let collection =
            AggregatedCollection::from_dump("books", &books_dump(), Some(("author", &filter)))
                .unwrap();
        assert_eq!(collection.len(), 1);
        assert!(collection.get("hyperion").is_some());
    }

    #[test]
    fn test_database_dump_builds_all_collections() {
        let dump = json!({
            "books": books_dump(),
            "authors": {
                "herbert": "{\"born\":1920}",
            },
        });
        let database = AggregatedDatabase::from_dump("library", &dump, None).unwrap();
        assert_eq!(database.name(), "library");
        assert_eq!(database.collections().len(), 2);
        assert_eq!(database.collection("books").unwrap().len(), 3);
        assert_eq!(database.collection("authors").unwrap().len(), 1);
        assert!(database.collection("missing").is_none());
    }

    #[test]
    fn test_database_filter_spans_collections() {
        let dump = json!({
            "first": {"a": "{\"x\":5}", "b": "{\"x\":1}"},
            "second": {"c": "{\"x\":9}", "d": "{\"y\":9}"},
        });
        let filter = Filter::int(5, NumberComparator::GreaterOrEquals);
        let database = AggregatedDatabase::from_dump("db", &dump, Some(("x", &filter))).unwrap();
        assert_eq!(database.collection("first").unwrap().len(), 1);
        assert_eq!(database.collection("second").unwrap().len(), 1);
        assert!(database.collection("second").unwrap().get("c").is_some());
    }

    #[test]
    fn test_malformed_dumps_are_rejected() {
        let not_an_object = json!("just a string");
        assert!(matches!(
            AggregatedCollection::from_dump("items", &not_an_object, None),
            Err(AggregateError::MalformedDump { .. })
        ));

        let payload_not_text = json!({"a": {"x": 1}});
        assert!(matches!(
            AggregatedCollection::from_dump("items", &payload_not_text, None),
            Err(AggregateError::MalformedItem { .. })
        ));
    }

    #[test]
    fn test_document_typed_decode() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Book {
            author: String,
            pages: u32,
        }

        let document = Document::new("{\"author\":\"Simmons\",\"pages\":482}");
        let book: Book = document.decode().unwrap();
        assert_eq!(
            book,
            Book {
                author: "Simmons".to_string(),
                pages: 482
            }
        );
        assert!(Document::new("not json").to_value().is_err());
    }
}
