use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{check_id, Decode, Id, NOTE_CONTENT_LIMIT, TAG_NAME_LIMIT};
use crate::crypto::{digest_id, is_content_id};
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DocumentType {
    Note,
    Tag,
}

impl DocumentType {
    fn check_content(&self, content: &str) -> Result<()> {
        // notes are bounded in bytes, tag names in characters
        let (len, limit) = match self {
            DocumentType::Note => (content.len(), NOTE_CONTENT_LIMIT),
            DocumentType::Tag => (content.chars().count(), TAG_NAME_LIMIT),
        };
        if len > limit {
            return Err(Error::ContentTooLarge {
                field: "content",
                len,
                limit,
            });
        }
        Ok(())
    }
}

/// An immutable, content addressed document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Id>,
    /// type-specific fields, covered by the digest like everything else
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Everything but the id: the form the id is derived from.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentBody<'a> {
    #[serde(rename = "type")]
    kind: DocumentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributed_to: Option<&'a Id>,
    #[serde(flatten)]
    fields: &'a BTreeMap<String, Value>,
}

const RESERVED_FIELDS: [&str; 4] = ["id", "type", "content", "attributedTo"];

impl Document {
    pub fn new(
        kind: DocumentType,
        content: Option<String>,
        attributed_to: Option<Id>,
        fields: BTreeMap<String, Value>,
    ) -> Result<Document> {
        let mut document = Document {
            id: Id::new(),
            kind,
            content,
            attributed_to,
            fields,
        };
        document.check_fields()?;
        document.id = document.compute_id()?;
        Ok(document)
    }

    pub fn note(content: &str, attributed_to: Option<Id>) -> Result<Document> {
        Document::new(
            DocumentType::Note,
            Some(content.to_string()),
            attributed_to,
            BTreeMap::new(),
        )
    }

    pub fn tag(name: &str) -> Result<Document> {
        Document::new(
            DocumentType::Tag,
            Some(name.to_string()),
            None,
            BTreeMap::new(),
        )
    }

    pub fn compute_id(&self) -> Result<Id> {
        digest_id(&DocumentBody {
            kind: self.kind,
            content: self.content.as_ref(),
            attributed_to: self.attributed_to.as_ref(),
            fields: &self.fields,
        })
    }

    fn check_fields(&self) -> Result<()> {
        if let Some(content) = &self.content {
            self.kind.check_content(content)?;
        }
        if let Some(attributed_to) = &self.attributed_to {
            check_id("document", attributed_to)?;
        }
        if let Some(key) = self
            .fields
            .keys()
            .find(|key| RESERVED_FIELDS.contains(&key.as_str()))
        {
            return Err(Error::malformed("document", format!("reserved field {}", key)));
        }
        Ok(())
    }

    pub fn check_structure(&self) -> Result<()> {
        if !is_content_id(&self.id) {
            return Err(Error::InvalidIdentifier(self.id.clone()));
        }
        self.check_fields()
    }

    /// Structural checks first, then the digest comparison.
    pub fn verify(&self) -> bool {
        if self.check_structure().is_err() {
            return false;
        }
        match self.compute_id() {
            Ok(id) => id == self.id,
            Err(_) => false,
        }
    }
}

impl Decode for Document {
    fn decode(value: Value) -> Result<Self> {
        let document: Document = serde_json::from_value(value)?;
        document.check_structure()?;
        Ok(document)
    }
}
