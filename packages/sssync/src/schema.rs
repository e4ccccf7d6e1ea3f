//! Declarative JSON object schemas.
//!
//! The engine only needs "parse or fail with field-level errors" semantics;
//! any schema engine with that contract could sit behind this module. Fields
//! are type-checked, required by default, and unknown fields pass through so
//! shallow-merge semantics stay intact.

use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;

/// Accepted value kind for a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Any => !value.is_null(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Any => "any",
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: SmolStr,
    kind: FieldKind,
    required: bool,
}

/// One failed check inside a validated value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

/// Field-level validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("validation failed: {}", self.describe())]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![FieldIssue {
                path: path.into(),
                message: message.into(),
            }],
        }
    }

    fn describe(&self) -> String {
        self.issues
            .iter()
            .map(|issue| {
                if issue.path.is_empty() {
                    issue.message.clone()
                } else {
                    format!("{}: {}", issue.path, issue.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Object schema with typed fields.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn object() -> Self {
        Self::default()
    }

    /// Object schema with the mandatory `id: string` field every table row
    /// carries.
    pub fn row() -> Self {
        Self::object().field("id", FieldKind::String)
    }

    pub fn field(mut self, name: impl Into<SmolStr>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<SmolStr>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Parse-or-fail against the full schema. Returns the validated value.
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        let Some(object) = value.as_object() else {
            return Err(ValidationError::single(
                "",
                format!("expected an object, got {}", type_name(value)),
            ));
        };

        let mut issues = Vec::new();
        for field in &self.fields {
            match object.get(field.name.as_str()) {
                None => {
                    if field.required {
                        issues.push(FieldIssue {
                            path: field.name.to_string(),
                            message: "missing required field".to_string(),
                        });
                    }
                }
                Some(found) => {
                    if !field.kind.matches(found) {
                        issues.push(FieldIssue {
                            path: field.name.to_string(),
                            message: format!(
                                "expected {}, got {}",
                                field.kind.label(),
                                type_name(found)
                            ),
                        });
                    }
                }
            }
        }

        if issues.is_empty() {
            Ok(value.clone())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Validation for partial updates: `id` must be a string, every other
    /// declared field is type-checked only when present.
    pub fn validate_partial(&self, value: &Value) -> Result<Value, ValidationError> {
        let Some(object) = value.as_object() else {
            return Err(ValidationError::single(
                "",
                format!("expected an object, got {}", type_name(value)),
            ));
        };

        let mut issues = Vec::new();
        match object.get("id") {
            Some(Value::String(_)) => {}
            Some(found) => issues.push(FieldIssue {
                path: "id".to_string(),
                message: format!("expected string, got {}", type_name(found)),
            }),
            None => issues.push(FieldIssue {
                path: "id".to_string(),
                message: "missing required field".to_string(),
            }),
        }

        for field in &self.fields {
            if field.name == "id" {
                continue;
            }
            if let Some(found) = object.get(field.name.as_str()) {
                if !field.kind.matches(found) {
                    issues.push(FieldIssue {
                        path: field.name.to_string(),
                        message: format!(
                            "expected {}, got {}",
                            field.kind.label(),
                            type_name(found)
                        ),
                    });
                }
            }
        }

        if issues.is_empty() {
            Ok(value.clone())
        } else {
            Err(ValidationError { issues })
        }
    }
}
