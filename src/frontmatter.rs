//! YAML frontmatter helpers.
//!
//! Entity content is markdown with optional frontmatter delimited by
//! `---` lines. Content without a leading delimiter is treated as pure
//! body. Values are surfaced as `serde_json::Value` so the rest of the
//! store stays YAML-agnostic.

use serde_json::Value;
use serde_yaml::Value as YamlValue;

use crate::error::{BrainError, Result};
use crate::types::Metadata;

/// Split content into `(frontmatter_yaml, body)`.
///
/// Returns `None` for the frontmatter when the content does not start
/// with a `---` line or the closing delimiter is missing.
pub fn split(content: &str) -> (Option<&str>, &str) {
    let rest = match content.strip_prefix("---") {
        Some(rest) => rest,
        None => return (None, content),
    };
    // The opening delimiter must be a full line.
    let rest = match rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) {
        Some(rest) => rest,
        None => return (None, content),
    };

    // Find the closing `---` on its own line; the body is everything after it.
    let mut offset = 0usize;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }

    (None, content)
}

/// Parse frontmatter YAML into a JSON object. Empty or absent
/// frontmatter parses to an empty map.
pub fn parse(yaml: &str) -> Result<Metadata> {
    if yaml.trim().is_empty() {
        return Ok(Metadata::new());
    }
    let value: YamlValue = serde_yaml::from_str(yaml)?;
    match yaml_to_json(value) {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Metadata::new()),
        other => Err(BrainError::Serialization(format!(
            "frontmatter must be a mapping, got {}",
            type_name(&other)
        ))),
    }
}

/// Render a JSON object as a `---`-delimited frontmatter block. Returns
/// an empty string for an empty map so bodies without frontmatter stay
/// delimiter-free.
pub fn generate(fields: &Metadata) -> Result<String> {
    if fields.is_empty() {
        return Ok(String::new());
    }
    let yaml_value = json_to_yaml(Value::Object(fields.clone()));
    let yaml = serde_yaml::to_string(&yaml_value)?;
    Ok(format!("---\n{}---\n", yaml))
}

fn yaml_to_json(value: YamlValue) -> Value {
    match value {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }
        YamlValue::String(s) => Value::String(s),
        YamlValue::Sequence(seq) => Value::Array(seq.into_iter().map(yaml_to_json).collect()),
        YamlValue::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                let key = match key {
                    YamlValue::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                out.insert(key, yaml_to_json(val));
            }
            Value::Object(out)
        }
        // Tagged values (rare in frontmatter) collapse to their inner value.
        YamlValue::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn json_to_yaml(value: Value) -> YamlValue {
    match value {
        Value::Null => YamlValue::Null,
        Value::Bool(b) => YamlValue::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                YamlValue::Number(i.into())
            } else if let Some(f) = n.as_f64() {
                YamlValue::Number(f.into())
            } else {
                YamlValue::Null
            }
        }
        Value::String(s) => YamlValue::String(s),
        Value::Array(arr) => YamlValue::Sequence(arr.into_iter().map(json_to_yaml).collect()),
        Value::Object(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (key, val) in map {
                out.insert(YamlValue::String(key), json_to_yaml(val));
            }
            YamlValue::Mapping(out)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
