//! Per-type conversion between structured entities and markdown.
//!
//! An adapter decides which fields live inside `content` (as YAML
//! frontmatter above the body) and which live in the `metadata` column.
//! `MarkdownAdapter` is the shared default: a declared frontmatter schema
//! names the promoted keys, everything else stays in metadata.

use serde_json::Value;

use crate::error::Result;
use crate::frontmatter;
use crate::schema::Schema;
use crate::types::{Entity, Metadata};

/// What `from_markdown` can recover without the store's core fields.
#[derive(Debug, Clone, Default)]
pub struct PartialEntity {
    /// The canonical markdown document, unchanged.
    pub content: String,
    /// Fields recovered from frontmatter.
    pub metadata: Metadata,
}

pub trait EntityAdapter: Send + Sync {
    /// The frontmatter fields this adapter owns inside `content`.
    fn frontmatter_schema(&self) -> Schema;

    /// Render the entity as a markdown document whose frontmatter
    /// reflects the current metadata for the adapter-owned keys.
    fn to_markdown(&self, entity: &Entity) -> Result<String>;

    /// Parse a markdown document into the recoverable parts of an entity.
    fn from_markdown(&self, text: &str) -> Result<PartialEntity>;

    /// Compute the `metadata` column value for a write: the entity's
    /// metadata merged with the adapter-owned frontmatter fields parsed
    /// out of its content (frontmatter wins).
    fn extract_metadata(&self, entity: &Entity) -> Result<Metadata>;

    /// Parse a frontmatter block against an explicit schema (used with
    /// the registry's effective schema, which may carry extensions).
    fn parse_front_matter(&self, text: &str, schema: &Schema) -> Result<Value>;

    /// Render the frontmatter block for an entity (empty string when no
    /// owned keys are set).
    fn generate_front_matter(&self, entity: &Entity) -> Result<String>;
}

/// Default adapter: promotes the keys named by its frontmatter schema,
/// leaves the body alone.
#[derive(Debug, Clone, Default)]
pub struct MarkdownAdapter {
    frontmatter: Schema,
}

impl MarkdownAdapter {
    pub fn new(frontmatter: Schema) -> Self {
        Self { frontmatter }
    }

    /// The metadata entries this adapter would promote into frontmatter.
    fn owned_fields(&self, metadata: &Metadata) -> Metadata {
        let mut out = Metadata::new();
        for name in self.frontmatter.field_names() {
            if let Some(value) = metadata.get(name) {
                if !value.is_null() {
                    out.insert(name.to_string(), value.clone());
                }
            }
        }
        out
    }
}

impl EntityAdapter for MarkdownAdapter {
    fn frontmatter_schema(&self) -> Schema {
        self.frontmatter.clone()
    }

    fn to_markdown(&self, entity: &Entity) -> Result<String> {
        let block = self.generate_front_matter(entity)?;
        let (_, body) = frontmatter::split(&entity.content);
        if block.is_empty() {
            return Ok(body.to_string());
        }
        Ok(format!("{}{}", block, body))
    }

    fn from_markdown(&self, text: &str) -> Result<PartialEntity> {
        let (yaml, _) = frontmatter::split(text);
        let metadata = match yaml {
            Some(yaml) => {
                let fields = frontmatter::parse(yaml)?;
                let value = self.frontmatter.validate(&Value::Object(fields))?;
                match value {
                    Value::Object(map) => map,
                    _ => Metadata::new(),
                }
            }
            None => Metadata::new(),
        };

        Ok(PartialEntity {
            content: text.to_string(),
            metadata,
        })
    }

    fn extract_metadata(&self, entity: &Entity) -> Result<Metadata> {
        let mut out = entity.metadata.clone();
        let (yaml, _) = frontmatter::split(&entity.content);
        if let Some(yaml) = yaml {
            for (key, value) in frontmatter::parse(yaml)? {
                if self.frontmatter.contains(&key) {
                    out.insert(key, value);
                }
            }
        }
        Ok(out)
    }

    fn parse_front_matter(&self, text: &str, schema: &Schema) -> Result<Value> {
        let (yaml, _) = frontmatter::split(text);
        let fields = match yaml {
            Some(yaml) => frontmatter::parse(yaml)?,
            None => Metadata::new(),
        };
        schema.validate(&Value::Object(fields))
    }

    fn generate_front_matter(&self, entity: &Entity) -> Result<String> {
        let owned = self.owned_fields(&entity.metadata);
        frontmatter::generate(&owned)
    }
}
