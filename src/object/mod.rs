/*!
# Object Model

Three kinds of objects travel between the client and its servers:

* [`Document`]s (notes, tags) are immutable and content addressed: the id is
  `urn:cid:` followed by the digest of the document without its `id`.
* [`Actor`]s are signed but not content addressed. Their id is
  `<identity>/actor` and the four collection urls hang off that id.
* [`Message`]s are signed first and then content addressed, so the digest
  covers the proof too. Swapping the proof changes the id.

Network payloads are decoded through [`Decode`], which dispatches on the
`type` field and runs the cheap structural checks as part of decoding.
Signature checks are left to the `verify` functions.
*/

pub mod actor;
pub mod document;
pub mod message;
pub mod proof;

pub use actor::{Actor, ActorType};
pub use document::{Document, DocumentType};
pub use message::{Message, MessageOptions, MessageType};
pub use proof::Proof;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::is_valid_identity;
use crate::error::{Error, Result};

/// Identifiers are opaque uri strings.
pub type Id = String;

pub const ACTOR_SUFFIX: &str = "/actor";
pub const MAX_OBJECTS: usize = 256;
pub const NOTE_CONTENT_LIMIT: usize = 1024;
pub const TAG_NAME_LIMIT: usize = 30;

pub fn actor_id_for(identity: &str) -> Id {
    format!("{}{}", identity, ACTOR_SUFFIX)
}

/// Recovers the signer identity from an actor id.
pub fn identity_for_actor(actor_id: &str) -> Result<String> {
    let identity = actor_id
        .strip_suffix(ACTOR_SUFFIX)
        .ok_or_else(|| Error::InvalidIdentifier(actor_id.to_string()))?;
    if !is_valid_identity(identity) {
        return Err(Error::InvalidIdentity(identity.to_string()));
    }
    Ok(identity.to_string())
}

pub fn followers_of(actor_id: &str) -> Id {
    format!("{}/followers", actor_id)
}

/// Decoding of untyped network payloads, with structural validation folded in.
pub trait Decode: Sized {
    fn decode(value: Value) -> Result<Self>;
}

impl Decode for Value {
    fn decode(value: Value) -> Result<Self> {
        Ok(value)
    }
}

/// Bare identifiers, as served by id-only collections.
impl Decode for Id {
    fn decode(value: Value) -> Result<Self> {
        match value {
            Value::String(id) if !id.is_empty() => Ok(id),
            _ => Err(Error::malformed("identifier", "expected a non-empty string")),
        }
    }
}

/// Any object, dispatched on its `type` field.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Object {
    Actor(Actor),
    Message(Message),
    Document(Document),
}

impl Object {
    pub fn id(&self) -> &str {
        match self {
            Object::Actor(actor) => &actor.id,
            Object::Message(message) => &message.id,
            Object::Document(document) => &document.id,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Object::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Object::Message(message) => Some(message),
            _ => None,
        }
    }
}

impl Decode for Object {
    fn decode(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed("object", "missing type"))?
            .to_string();
        let kind = Value::String(kind);

        if serde_json::from_value::<ActorType>(kind.clone()).is_ok() {
            Ok(Object::Actor(Actor::decode(value)?))
        } else if serde_json::from_value::<MessageType>(kind.clone()).is_ok() {
            Ok(Object::Message(Message::decode(value)?))
        } else if serde_json::from_value::<DocumentType>(kind.clone()).is_ok() {
            Ok(Object::Document(Document::decode(value)?))
        } else {
            Err(Error::malformed("object", format!("unknown type {}", kind)))
        }
    }
}

impl<'de> Deserialize<'de> for Object {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Object::decode(value).map_err(de::Error::custom)
    }
}

impl From<Message> for Object {
    fn from(message: Message) -> Self {
        Object::Message(message)
    }
}

impl From<Document> for Object {
    fn from(document: Document) -> Self {
        Object::Document(document)
    }
}

impl From<Actor> for Object {
    fn from(actor: Actor) -> Self {
        Object::Actor(actor)
    }
}

pub(crate) fn check_id(what: &'static str, id: &str) -> Result<()> {
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(Error::malformed(what, format!("bad identifier {:?}", id)));
    }
    Ok(())
}
