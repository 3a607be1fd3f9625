use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::model::{DependencyField, ModelType};
use crate::types::Payload;

/// Separates the base name from the list of fields.
const BASE_DELIMITER: char = '~';
/// Separates individual `name=value` pairs.
const FIELD_DELIMITER: char = '_';

/// A deterministic fingerprint identifying one cacheable model instance.
///
/// Cloning a key is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(Arc<str>);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl CacheKey {
    /// Builds the fingerprint of `payload` under the given model type.
    ///
    /// Each declared dependency field is resolved in declaration order. Named fields are looked
    /// up through [`Payload::resolve`], derived fields are called with [`Payload::merged`] and
    /// all of their returned pairs contribute. A name resolved earlier is never overridden by a
    /// later field, and `null` values are treated as absent.
    pub fn for_model(model_type: &ModelType, payload: &Payload) -> Self {
        let mut builder = CacheKeyBuilder::new(model_type.key());
        let mut merged = None;

        for field in model_type.dependencies() {
            match field {
                DependencyField::Name(name) => {
                    if let Some(value) = payload.resolve(name) {
                        builder.field(name, value);
                    }
                }
                DependencyField::Derived(derive) => {
                    let merged = merged.get_or_insert_with(|| payload.merged());
                    for (name, value) in derive(merged) {
                        builder.field(&name, &value);
                    }
                }
            }
        }

        builder.build()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creates a key from a raw string, bypassing field resolution.
    pub fn from_raw(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }
}

/// A builder for [`CacheKey`]s.
///
/// Fields are kept sorted by name, so the order in which they are added does not matter.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    base: String,
    fields: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field unless it is `null` or was already added.
    pub fn field(&mut self, name: &str, value: &Value) -> &mut Self {
        if !value.is_null() && !self.fields.contains_key(name) {
            self.fields.insert(name.to_owned(), render_value(value));
        }
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let mut key = self.base;
        for (index, (name, value)) in self.fields.iter().enumerate() {
            let delimiter = if index == 0 {
                BASE_DELIMITER
            } else {
                FIELD_DELIMITER
            };
            // writing into a `String` never fails
            let _ = write!(key, "{delimiter}{name}={value}");
        }
        CacheKey(key.into())
    }
}

/// Renders a field value. Strings are written bare unless they contain a delimiter, an `=` or a
/// leading quote, in which case they are JSON-quoted like every other value's strings.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) if !needs_quoting(s) => s.clone(),
        other => other.to_string(),
    }
}

fn needs_quoting(s: &str) -> bool {
    s.starts_with('"') || s.contains([BASE_DELIMITER, FIELD_DELIMITER, '='])
}
