//! Declarative field schemas for entity types and frontmatter.
//!
//! A schema is a flat map of field specs validated against JSON values.
//! The registry owns the entity-level schema; adapters own the finer
//! frontmatter schema. Both use the same spec shape so frontmatter
//! extensions can merge additively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrainError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// No type constraint; presence checks only.
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// Ordered field-spec map. Insertion order is preserved so generated
/// frontmatter stays stable across round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<(String, FieldSpec)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.push(name, FieldSpec { kind, required: false });
        self
    }

    pub fn required_field(mut self, name: &str, kind: FieldKind) -> Self {
        self.push(name, FieldSpec { kind, required: true });
        self
    }

    fn push(&mut self, name: &str, spec: FieldSpec) {
        if let Some(existing) = self.fields.iter_mut().find(|(n, _)| n == name) {
            existing.1 = spec;
        } else {
            self.fields.push((name.to_string(), spec));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Additive merge: fields from `other` are appended, replacing specs
    /// for names already present. `self` is consumed; the source schemas
    /// are untouched.
    pub fn merged_with(mut self, other: &Schema) -> Schema {
        for (name, spec) in &other.fields {
            self.push(name, *spec);
        }
        self
    }

    /// Validate a JSON object against this schema.
    ///
    /// Required fields must be present and typed; optional fields are
    /// type-checked when present; unknown fields pass through untouched
    /// (metadata is opaque beyond the declared shape). Returns the
    /// validated value.
    pub fn validate(&self, value: &Value) -> Result<Value> {
        let map = value.as_object().ok_or_else(|| {
            BrainError::Validation("expected a JSON object".to_string())
        })?;

        for (name, spec) in &self.fields {
            match map.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(BrainError::Validation(format!(
                            "missing required field `{}`",
                            name
                        )));
                    }
                }
                Some(field) => {
                    if !spec.kind.matches(field) {
                        return Err(BrainError::Validation(format!(
                            "field `{}` must be a {}",
                            name,
                            spec.kind.name()
                        )));
                    }
                }
            }
        }

        Ok(value.clone())
    }
}
