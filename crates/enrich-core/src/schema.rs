//! Output schemas
//!
//! The generation service accepts only a subset of JSON Schema as a
//! response-shape constraint, so the schema it receives is a conditioned
//! copy. Local validation always runs against the original.

use crate::error::{ConfigError, GenerationError};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fmt;

/// Schema members the service rejects
///
/// `additionalProperties` in particular fails the whole request with a 400.
const STRIPPED_KEYS: [&str; 8] = [
    "$schema",
    "$id",
    "$comment",
    "title",
    "additionalProperties",
    "patternProperties",
    "default",
    "examples",
];

/// Keywords whose values map property names to sub-schemas
const SCHEMA_MAPS: [&str; 4] = ["properties", "patternProperties", "definitions", "$defs"];

/// Validation messages reported per failure
const MAX_REPORTED_ERRORS: usize = 5;

/// Copy of `schema` restricted to what the service accepts
///
/// Unsupported keywords are removed from every sub-schema and `const` is
/// rewritten as a one-value `enum`. Property names are left alone: a
/// property called `title` survives.
#[must_use]
pub fn condition_schema(schema: &Value) -> Value {
    let mut conditioned = schema.clone();
    strip(&mut conditioned);
    conditioned
}

fn strip(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for key in STRIPPED_KEYS {
                map.shift_remove(key);
            }
            if let Some(value) = map.shift_remove("const") {
                map.entry("enum").or_insert_with(|| Value::Array(vec![value]));
            }
            for (key, member) in map.iter_mut() {
                if SCHEMA_MAPS.contains(&key.as_str()) {
                    if let Value::Object(named) = member {
                        named.values_mut().for_each(strip);
                    }
                } else {
                    strip(member);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip),
        _ => {}
    }
}

/// Parse model text into JSON
///
/// Accepts bare JSON, fenced blocks and objects surrounded by chatter (the
/// span from the first `{` to the last `}` is tried).
///
/// # Errors
/// [`GenerationError::MalformedOutput`] if no JSON object can be recovered
pub fn parse_model_json(text: &str) -> Result<Value, GenerationError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| GenerationError::MalformedOutput(format!("invalid JSON: {e}"))),
        _ => Err(GenerationError::MalformedOutput(
            "no JSON object in model output".to_string(),
        )),
    }
}

/// An expected output shape
pub struct OutputSchema {
    original: Value,
    conditioned: Value,
    compiled: JSONSchema,
}

impl OutputSchema {
    /// Compile `schema`
    ///
    /// # Errors
    /// [`ConfigError::InvalidSchema`] if the schema does not compile
    pub fn new(schema: Value) -> Result<Self, ConfigError> {
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| ConfigError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            conditioned: condition_schema(&schema),
            original: schema,
            compiled,
        })
    }

    /// Schema as written
    #[inline]
    #[must_use]
    pub fn original(&self) -> &Value {
        &self.original
    }

    /// Schema as sent to the service
    #[inline]
    #[must_use]
    pub fn conditioned(&self) -> &Value {
        &self.conditioned
    }

    /// Validate an instance against the original schema
    ///
    /// # Errors
    /// [`GenerationError::MalformedOutput`] listing the first violations
    pub fn validate(&self, instance: &Value) -> Result<(), GenerationError> {
        self.compiled.validate(instance).map_err(|errors| {
            let messages: Vec<String> = errors
                .take(MAX_REPORTED_ERRORS)
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            GenerationError::MalformedOutput(format!(
                "schema validation failed: {}",
                messages.join("; ")
            ))
        })
    }
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("original", &self.original)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn practice_schema() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "$id": "https://example.org/practice.json",
            "title": "Practice",
            "type": "object",
            "required": ["name", "title"],
            "properties": {
                "name": {"type": "string", "const": "practice", "title": "Name"},
                "title": {"type": "string"},
                "props": {
                    "type": "array",
                    "items": {"title": "Prop", "type": "object"}
                }
            },
            "definitions": {
                "title": {"title": "Nested", "type": "string"}
            }
        })
    }

    #[test]
    fn conditioning_strips_metadata_keys_only() {
        let conditioned = condition_schema(&practice_schema());
        assert!(conditioned.get("$schema").is_none());
        assert!(conditioned.get("$id").is_none());
        assert!(conditioned.get("title").is_none());

        let properties = &conditioned["properties"];
        assert!(properties.get("title").is_some(), "property named title survives");
        assert!(properties["name"].get("title").is_none());
        assert!(properties["props"]["items"].get("title").is_none());
        assert!(conditioned["definitions"].get("title").is_some());
        assert!(conditioned["definitions"]["title"].get("title").is_none());
        assert_eq!(conditioned["required"], json!(["name", "title"]));
    }

    #[test]
    fn conditioning_drops_unsupported_keywords() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["parts"],
            "properties": {
                "parts": {
                    "type": "array",
                    "default": [],
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "name": {"type": "string", "const": "overview", "examples": ["overview"]},
                            "additionalProperties": {"type": "string"}
                        }
                    }
                }
            }
        });
        let conditioned = condition_schema(&schema);
        assert!(conditioned.get("additionalProperties").is_none());
        let parts = &conditioned["properties"]["parts"];
        assert!(parts.get("default").is_none());
        assert!(parts["items"].get("additionalProperties").is_none());
        let properties = &parts["items"]["properties"];
        assert!(properties.get("additionalProperties").is_some(), "property names survive");
        assert_eq!(properties["name"], json!({"type": "string", "enum": ["overview"]}));

        let strict = OutputSchema::new(schema).unwrap();
        assert!(strict.validate(&json!({"parts": [{"name": "overview"}]})).is_ok());
        assert!(strict
            .validate(&json!({"parts": [{"name": "overview"}], "extra": 1}))
            .is_err());
        assert!(strict.validate(&json!({"parts": [{"name": "other"}]})).is_err());
    }

    #[test]
    fn conditioning_keeps_member_order() {
        let conditioned = condition_schema(&practice_schema());
        let keys: Vec<_> = conditioned.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["type", "required", "properties", "definitions"]);
    }

    #[test]
    fn validation_uses_original_schema() {
        let schema = OutputSchema::new(practice_schema()).unwrap();
        assert!(schema
            .validate(&json!({"name": "practice", "title": "Umsetzung"}))
            .is_ok());

        let err = schema.validate(&json!({"name": "other"})).unwrap_err();
        assert!(matches!(err, GenerationError::MalformedOutput(msg) if msg.contains("schema validation failed")));
    }

    #[test]
    fn invalid_schema_is_config_error() {
        let err = OutputSchema::new(json!({"type": 12})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchema(_)));
    }

    #[test]
    fn parse_model_json_variants() {
        assert_eq!(parse_model_json(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_model_json("```json\n{\"a\": [1, 2]}\n```").unwrap(),
            json!({"a": [1, 2]})
        );
        assert_eq!(
            parse_model_json("Here you go: {\"a\": {\"b\": 2}} Hope this helps").unwrap(),
            json!({"a": {"b": 2}})
        );
        assert!(matches!(
            parse_model_json("no json here"),
            Err(GenerationError::MalformedOutput(_))
        ));
        assert!(matches!(
            parse_model_json("{\"a\": 1"),
            Err(GenerationError::MalformedOutput(_))
        ));
    }
}
