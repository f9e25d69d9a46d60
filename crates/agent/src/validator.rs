//! Structured-output validation.
//!
//! Checks a model reply against the caller's JSON Schema and, on failure,
//! produces field-level errors phrased for the model to act on. Nothing here
//! touches the loop or the thread; retry bookkeeping lives in the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The output schema itself could not be compiled.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SchemaError(pub String);

/// One violation, located by JSON pointer into the candidate payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON pointer to the offending value; empty for the document root
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// A compiled schema, reused for every attempt of a run.
pub struct StructuredOutputValidator {
    validator: jsonschema::Validator,
}

impl StructuredOutputValidator {
    /// Compile a schema. Fails if the schema itself is malformed.
    pub fn new(schema: &Value) -> Result<Self, SchemaError> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| SchemaError(e.to_string()))?;
        Ok(Self { validator })
    }

    /// Validate an already-parsed payload.
    pub fn validate(&self, payload: &Value) -> Result<(), Vec<FieldError>> {
        let errors: Vec<FieldError> = self
            .validator
            .iter_errors(payload)
            .map(|e| FieldError::new(e.instance_path.to_string(), e.to_string()))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse raw model output as JSON and validate it.
    ///
    /// A single surrounding markdown code fence is tolerated.
    pub fn validate_text(&self, raw: &str) -> Result<Value, Vec<FieldError>> {
        let body = strip_code_fence(raw);
        let value: Value = serde_json::from_str(body).map_err(|e| {
            vec![FieldError::new(
                "",
                format!("response is not valid JSON ({e})"),
            )]
        })?;
        self.validate(&value)?;
        Ok(value)
    }
}

/// One-shot validation of a payload against a schema.
pub fn validate(payload: &Value, schema: &Value) -> Result<Value, Vec<FieldError>> {
    let validator = StructuredOutputValidator::new(schema)
        .map_err(|e| vec![FieldError::new("", format!("schema is invalid: {e}"))])?;
    validator.validate(payload)?;
    Ok(payload.clone())
}

/// Render validation errors as the repair prompt sent back to the model.
pub fn corrective_message(errors: &[FieldError]) -> String {
    let mut msg = String::from(
        "Your previous response did not match the required JSON schema.\nErrors:\n",
    );
    for err in errors {
        msg.push_str("- ");
        msg.push_str(&err.to_string());
        msg.push('\n');
    }
    msg.push_str("Reply again with only a JSON value that satisfies the schema.");
    msg
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line
    match inner.find('\n') {
        Some(idx) => inner[idx + 1..].trim(),
        None => inner.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "age": { "type": "integer" }
            },
            "required": ["name", "age"]
        })
    }

    #[test]
    fn valid_payload_passes() {
        let payload = json!({"name": "Al", "age": 30});
        assert_eq!(validate(&payload, &person_schema()).unwrap(), payload);
    }

    #[test]
    fn wrong_type_reports_field_path() {
        let v = StructuredOutputValidator::new(&person_schema()).unwrap();
        let errors = v.validate(&json!({"name": "Al", "age": "thirty"})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/age");
        assert!(errors[0].message.contains("integer"));
    }

    #[test]
    fn missing_required_field_reported_at_parent() {
        let v = StructuredOutputValidator::new(&person_schema()).unwrap();
        let errors = v.validate(&json!({"name": "Al"})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "");
        assert!(errors[0].message.contains("age"));
    }

    #[test]
    fn nested_errors_point_into_structure() {
        let schema = json!({
            "type": "object",
            "properties": {
                "people": {
                    "type": "array",
                    "items": person_schema()
                }
            },
            "required": ["people"]
        });
        let v = StructuredOutputValidator::new(&schema).unwrap();
        let errors = v
            .validate(&json!({"people": [{"name": "Al", "age": 30}, {"name": 7, "age": 1}]}))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/people/1/name");
    }

    #[test]
    fn all_errors_collected() {
        let v = StructuredOutputValidator::new(&person_schema()).unwrap();
        let errors = v.validate(&json!({"name": 1, "age": "x"})).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn text_must_be_json() {
        let v = StructuredOutputValidator::new(&person_schema()).unwrap();
        let errors = v.validate_text("Sure! Al is 30.").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("not valid JSON"));
    }

    #[test]
    fn code_fence_is_stripped() {
        let v = StructuredOutputValidator::new(&person_schema()).unwrap();
        let value = v
            .validate_text("```json\n{\"name\":\"Al\",\"age\":30}\n```")
            .unwrap();
        assert_eq!(value["age"], 30);
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn malformed_schema_rejected() {
        assert!(StructuredOutputValidator::new(&json!({"type": "no-such-type"})).is_err());
        let errors = validate(&json!(1), &json!({"type": "no-such-type"})).unwrap_err();
        assert!(errors[0].message.starts_with("schema is invalid"));
    }

    #[test]
    fn corrective_message_lists_every_error() {
        let msg = corrective_message(&[
            FieldError::new("/age", "\"thirty\" is not of type \"integer\""),
            FieldError::new("", "\"name\" is a required property"),
        ]);
        assert!(msg.contains("- /age: \"thirty\" is not of type \"integer\""));
        assert!(msg.contains("- <root>: \"name\" is a required property"));
        assert!(msg.ends_with("satisfies the schema."));
    }
}
