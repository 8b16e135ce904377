use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{check_id, identity_for_actor, Decode, Id, Proof, MAX_OBJECTS};
use crate::crypto::{canonical_bytes, digest_id, is_content_id, Signer, Verifier};
use crate::error::{Error, Result};
use crate::time::{now, truncate_millis};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Create,
    Delete,
    Follow,
    Unfollow,
    Listen,
    View,
    Update,
}

/// Optional addressing of a new message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOptions {
    pub to: Option<Vec<Id>>,
    pub origin: Option<Id>,
    pub target: Option<Id>,
}

/// A signed, content addressed activity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub actor: Id,
    pub object: Vec<Id>,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Id>,
    pub proof: Proof,
}

/// What the signature covers: the message without id and proof.
#[derive(Serialize)]
struct MessageBody<'a> {
    #[serde(rename = "type")]
    kind: MessageType,
    actor: &'a Id,
    object: &'a [Id],
    published: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a Vec<Id>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a Id>,
}

/// What the id covers: the signed message without its id.
#[derive(Serialize)]
struct SignedMessageBody<'a> {
    #[serde(flatten)]
    body: MessageBody<'a>,
    proof: &'a Proof,
}

impl Message {
    ///
    /// Signs a new message for the signer's actor. `published` defaults to now.
    /// The id can only be computed after signing since it covers the proof.
    ///
    pub fn new(
        signer: &dyn Signer,
        kind: MessageType,
        object: Vec<Id>,
        published: Option<DateTime<Utc>>,
        options: MessageOptions,
    ) -> Result<Message> {
        let mut message = Message {
            id: Id::new(),
            kind,
            actor: super::actor_id_for(&signer.identity()),
            object,
            published: published.map(truncate_millis).unwrap_or_else(now),
            to: options.to,
            origin: options.origin,
            target: options.target,
            proof: Proof::new(String::new(), String::new()),
        };
        message.check_fields()?;

        let bytes = canonical_bytes(&message.body())?;
        message.proof = signer.sign(&bytes)?;
        message.id = message.compute_id()?;
        Ok(message)
    }

    fn body(&self) -> MessageBody<'_> {
        MessageBody {
            kind: self.kind,
            actor: &self.actor,
            object: &self.object,
            published: &self.published,
            to: self.to.as_ref(),
            origin: self.origin.as_ref(),
            target: self.target.as_ref(),
        }
    }

    pub fn compute_id(&self) -> Result<Id> {
        digest_id(&SignedMessageBody {
            body: self.body(),
            proof: &self.proof,
        })
    }

    /// The followers collections this message is addressed to.
    pub fn audience(&self) -> &[Id] {
        self.to.as_deref().unwrap_or(&[])
    }

    pub fn first_object(&self) -> Option<&Id> {
        self.object.first()
    }

    fn check_fields(&self) -> Result<()> {
        identity_for_actor(&self.actor)?;
        if self.object.is_empty() {
            return Err(Error::malformed("message", "empty object list"));
        }
        if self.object.len() > MAX_OBJECTS {
            return Err(Error::TooManyObjects(self.object.len()));
        }
        for id in &self.object {
            check_id("message", id)?;
        }
        for id in self.audience() {
            check_id("message", id)?;
        }
        if let Some(origin) = &self.origin {
            check_id("message", origin)?;
        }
        if let Some(target) = &self.target {
            check_id("message", target)?;
        }
        Ok(())
    }

    pub fn check_structure(&self) -> Result<()> {
        if !is_content_id(&self.id) {
            return Err(Error::InvalidIdentifier(self.id.clone()));
        }
        self.check_fields()
    }

    ///
    /// Structure, then the id digest, then the signature against the identity
    /// recovered from `actor`.
    ///
    pub fn verify(&self, verifier: &dyn Verifier) -> bool {
        if self.check_structure().is_err() {
            return false;
        }
        match self.compute_id() {
            Ok(id) if id == self.id => {}
            _ => return false,
        }
        let identity = match identity_for_actor(&self.actor) {
            Ok(identity) => identity,
            Err(_) => return false,
        };
        match canonical_bytes(&self.body()) {
            Ok(bytes) => verifier.verify(&bytes, &self.proof, &identity),
            Err(_) => false,
        }
    }
}

impl Decode for Message {
    fn decode(value: Value) -> Result<Self> {
        let message: Message = serde_json::from_value(value)?;
        message.check_structure()?;
        Ok(message)
    }
}
