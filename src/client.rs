/*!
# Client

The local actor's view of the network. A [`Client`] owns the actor's key,
builds signed messages for the standard operations and routes them: writes
fan out through the [`Registry`], the actor's own state lands in the
[`LocalIndex`].

Two decisions need more than plumbing:

* [`Client::build_message_affinity`] answers "is this from someone I follow"
  and "is this addressed to an audience I belong to" separately.
* [`Client::get_or_new_view`] keeps at most one View per object.
*/

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{event, Level};

use crate::crypto::{is_content_id, Verifier};
use crate::error::{Error, Result};
use crate::iterator::{collect_ids, InboxIterator};
use crate::keypair::Keypair;
use crate::local_index::LocalIndex;
use crate::object::{
    actor_id_for, followers_of, identity_for_actor, Actor, ActorType, Document, Id, Message,
    MessageOptions, MessageType, Object, MAX_OBJECTS,
};
use crate::registry::{normalize_url, Registry};
use crate::time::create_timestamp;

/// How an inbound message relates to the local actor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Affinity {
    /// authored by the local actor or by someone it follows
    pub from_contact: bool,
    /// addressed to the local actor's followers or to the followers of a contact
    pub in_audience: bool,
}

impl Affinity {
    pub fn is_relevant(&self) -> bool {
        self.from_contact || self.in_audience
    }
}

/// Actors and content ids (tags, for instance) can be followed.
fn check_followable(id: &str) -> Result<()> {
    if is_content_id(id) {
        return Ok(());
    }
    identity_for_actor(id).map(|_| ())
}

/// What [`Client::ingest`] did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Stored,
    /// a contact posting to a foreign audience; stored and viewed
    StoredWithView(Message),
    /// already in the index, or tombstoned
    Ignored,
    Dropped,
}

pub struct Client {
    keypair: Keypair,
    verifier: Arc<dyn Verifier>,
    registry: Arc<Registry>,
    index: Arc<LocalIndex>,
    actor: RwLock<Actor>,
    page_size: usize,
}

impl Client {
    ///
    /// Opens the client for `keypair`. The actor stored by an earlier session
    /// is reused; otherwise a fresh Person actor is created.
    ///
    pub async fn open(
        keypair: Keypair,
        verifier: Arc<dyn Verifier>,
        registry: Arc<Registry>,
        index: Arc<LocalIndex>,
        page_size: usize,
    ) -> Result<Client> {
        let actor_id = actor_id_for(&keypair.identity());
        let stored = match index.get_object(&actor_id).await? {
            Some(Object::Actor(actor)) if actor.verify(verifier.as_ref()) => Some(actor),
            _ => None,
        };
        let actor = match stored {
            Some(actor) => actor,
            None => {
                let actor = Actor::new(&keypair, ActorType::Person, None)?;
                index.store_object(&Object::Actor(actor.clone()), true).await?;
                actor
            }
        };
        event!(Level::INFO, "client open for {}", actor.id);
        Ok(Client {
            keypair,
            verifier,
            registry,
            index,
            actor: RwLock::new(actor),
            page_size,
        })
    }

    pub async fn actor(&self) -> Actor {
        self.actor.read().await.clone()
    }

    pub fn actor_id(&self) -> Id {
        actor_id_for(&self.keypair.identity())
    }

    pub fn identity(&self) -> String {
        self.keypair.identity()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn index(&self) -> Arc<LocalIndex> {
        self.index.clone()
    }

    fn new_message(&self, kind: MessageType, object: Vec<Id>, options: MessageOptions) -> Result<Message> {
        Message::new(&self.keypair, kind, object, None, options)
    }

    fn to_followers(&self) -> MessageOptions {
        MessageOptions {
            to: Some(vec![followers_of(&self.actor_id())]),
            ..MessageOptions::default()
        }
    }

    async fn post(&self, message: &Message) -> Result<usize> {
        self.registry.post_message(message, &self.identity()).await
    }

    ///
    /// Signs a new profile for the local actor, pins it locally and publishes
    /// it to every server.
    ///
    pub async fn create_actor(&self, kind: ActorType, name: Option<String>) -> Result<Actor> {
        let actor = Actor::new(&self.keypair, kind, name)?;
        let object = Object::Actor(actor.clone());
        self.index.store_object(&object, true).await?;
        self.registry.post_object(&object).await?;
        *self.actor.write().await = actor.clone();
        event!(Level::INFO, "published actor {}", actor.id);
        Ok(actor)
    }

    pub async fn follow(&self, actor_id: &str) -> Result<Message> {
        check_followable(actor_id)?;
        let message = self.new_message(
            MessageType::Follow,
            vec![actor_id.to_string()],
            MessageOptions::default(),
        )?;
        self.post(&message).await?;
        self.index.add_follow(actor_id).await?;
        event!(Level::INFO, "following {}", actor_id);
        Ok(message)
    }

    pub async fn unfollow(&self, actor_id: &str) -> Result<Message> {
        check_followable(actor_id)?;
        let message = self.new_message(
            MessageType::Unfollow,
            vec![actor_id.to_string()],
            MessageOptions::default(),
        )?;
        self.post(&message).await?;
        self.index.remove_follow(actor_id).await?;
        event!(Level::INFO, "unfollowed {}", actor_id);
        Ok(message)
    }

    ///
    /// Asks one server to deliver the local actor's inbox. The Listen goes to
    /// that server only.
    ///
    pub async fn listen(&self, server_url: &str) -> Result<Message> {
        let server_url = normalize_url(server_url)?;
        let message = self.new_message(
            MessageType::Listen,
            vec![self.actor_id()],
            MessageOptions {
                target: Some(server_url.clone()),
                ..MessageOptions::default()
            },
        )?;
        self.registry
            .post_message_to(&message, &self.identity(), &server_url)
            .await?;
        self.registry
            .record_listen(&server_url, create_timestamp())
            .await?;
        Ok(message)
    }

    ///
    /// Deletes `id` locally and, when it is one of the local actor's own
    /// messages or documents, tells the servers too. Deleting someone else's
    /// message only affects the local index. An id that is already deleted
    /// is left alone; one that is not held here is announced only when the
    /// servers' copy belongs to the local actor.
    ///
    pub async fn delete(&self, id: &str) -> Result<Option<Message>> {
        if self.index.is_tombstoned(id).await? {
            return Ok(None);
        }
        let own = match self.index.get_object(id).await? {
            Some(object) => self.owns(&object, true)?,
            None => match self.registry.get_document(id).await {
                Ok(object) => self.owns(&object, false)?,
                Err(err) => {
                    event!(Level::DEBUG, "not announcing delete of {}: {}", id, err);
                    false
                }
            },
        };

        let announced = if own {
            let message = self.new_message(MessageType::Delete, vec![id.to_string()], self.to_followers())?;
            self.post(&message).await?;
            Some(message)
        } else {
            None
        };
        self.index.delete(id).await?;
        Ok(announced)
    }

    // unattributed documents count as our own only when we hold them
    fn owns(&self, object: &Object, held: bool) -> Result<bool> {
        let actor_id = self.actor_id();
        match object {
            Object::Actor(_) => Err(Error::malformed("delete", "actors cannot be deleted")),
            Object::Message(message) => {
                Ok(message.actor == actor_id && message.verify(self.verifier.as_ref()))
            }
            Object::Document(document) => Ok(match document.attributed_to.as_deref() {
                Some(author) => author == actor_id,
                None => held,
            }),
        }
    }

    ///
    /// Publishes a note. `to` defaults to the local actor's followers. The
    /// note and its Create message are kept in the local index.
    ///
    pub async fn note(&self, content: &str, to: Option<Vec<Id>>) -> Result<Message> {
        let document = Document::note(content, Some(self.actor_id()))?;
        let options = match to {
            Some(to) => MessageOptions {
                to: Some(to),
                ..MessageOptions::default()
            },
            None => self.to_followers(),
        };
        let message = self.new_message(MessageType::Create, vec![document.id.clone()], options)?;

        self.registry.post_document(&document).await?;
        self.post(&message).await?;
        self.index
            .store_message(&message, &[Object::Document(document)])
            .await?;
        Ok(message)
    }

    ///
    /// Marks `message` as viewed. The View is posted until one server has
    /// accepted it, and never again after that.
    ///
    pub async fn view(&self, message: &Message) -> Result<Option<Message>> {
        let view = match self.get_or_new_view(message).await? {
            Some(view) => view,
            None => return Ok(None),
        };
        if !self.index.is_view_announced(&view.id).await? {
            self.post(&view).await?;
            self.index.mark_view_announced(&view.id).await?;
        }
        Ok(Some(view))
    }

    ///
    /// The View of `message`, created and cached if there is none yet. None
    /// for the local actor's own messages and for Views. Nothing is posted.
    ///
    pub async fn get_or_new_view(&self, message: &Message) -> Result<Option<Message>> {
        if message.actor == self.actor_id() || message.kind == MessageType::View {
            return Ok(None);
        }
        let object_id = match message.first_object() {
            Some(object_id) => object_id.clone(),
            None => return Ok(None),
        };
        if let Some(view) = self.index.get_view(&object_id).await? {
            return Ok(Some(view));
        }
        // addressed to the local followers so they can discover the original
        let view = self.new_message(
            MessageType::View,
            vec![object_id.clone()],
            MessageOptions {
                origin: Some(message.id.clone()),
                ..self.to_followers()
            },
        )?;
        self.index.put_view(&object_id, &view).await?;
        Ok(Some(view))
    }

    ///
    /// Replaces the follow set with `actor_ids`, sending Follow and Unfollow
    /// messages for the difference. Each message carries at most 256 ids.
    ///
    pub async fn set_follow_list(&self, actor_ids: &[Id]) -> Result<Vec<Message>> {
        for actor_id in actor_ids {
            check_followable(actor_id)?;
        }
        let wanted: BTreeSet<Id> = actor_ids.iter().cloned().collect();
        let current: BTreeSet<Id> = self.index.follows().await?.into_iter().collect();
        let added: Vec<Id> = wanted.difference(&current).cloned().collect();
        let removed: Vec<Id> = current.difference(&wanted).cloned().collect();

        let mut messages = vec![];
        for chunk in added.chunks(MAX_OBJECTS) {
            let message = self.new_message(MessageType::Follow, chunk.to_vec(), MessageOptions::default())?;
            self.post(&message).await?;
            for actor_id in chunk {
                self.index.add_follow(actor_id).await?;
            }
            messages.push(message);
        }
        for chunk in removed.chunks(MAX_OBJECTS) {
            let message = self.new_message(MessageType::Unfollow, chunk.to_vec(), MessageOptions::default())?;
            self.post(&message).await?;
            for actor_id in chunk {
                self.index.remove_follow(actor_id).await?;
            }
            messages.push(message);
        }
        event!(
            Level::INFO,
            "follow list updated: {} added, {} removed",
            added.len(),
            removed.len()
        );
        Ok(messages)
    }

    pub async fn clear_follow_list(&self) -> Result<Vec<Message>> {
        self.set_follow_list(&[]).await
    }

    pub async fn follows(&self) -> Result<Vec<Id>> {
        self.index.follows().await
    }

    ///
    /// `from_contact`: authored by the local actor or someone it follows.
    /// `in_audience`: `to` names the local actor's followers collection or
    /// the followers collection of someone it follows. Only `to` counts.
    ///
    pub async fn build_message_affinity(&self, message: &Message) -> Result<Affinity> {
        let actor_id = self.actor_id();
        let from_contact =
            message.actor == actor_id || self.index.is_following(&message.actor).await?;

        let mut audiences = vec![followers_of(&actor_id)];
        audiences.extend(self.index.follows().await?.iter().map(|id| followers_of(id)));
        let in_audience = message
            .audience()
            .iter()
            .any(|target| audiences.contains(target));

        Ok(Affinity {
            from_contact,
            in_audience,
        })
    }

    ///
    /// Files an inbound message. Unrelated messages are dropped; anything from
    /// a contact or to a known audience is stored with the documents it
    /// references. A contact's message to a foreign audience is also viewed.
    ///
    pub async fn ingest(&self, message: &Message, documents: &[Document]) -> Result<Ingested> {
        if !message.verify(self.verifier.as_ref()) {
            return Err(Error::Unverified(message.id.clone()));
        }
        let affinity = self.build_message_affinity(message).await?;
        if !affinity.is_relevant() {
            event!(Level::DEBUG, "dropping unrelated message {}", message.id);
            return Ok(Ingested::Dropped);
        }

        let referenced: Vec<Object> = documents
            .iter()
            .filter(|document| message.object.contains(&document.id) && document.verify())
            .cloned()
            .map(Object::Document)
            .collect();
        if !self.index.store_message(message, &referenced).await? {
            return Ok(Ingested::Ignored);
        }

        if affinity.from_contact && !affinity.in_audience {
            // an unannounced view is retried by the next call to view()
            let view = match self.view(message).await {
                Ok(view) => view,
                Err(err) => {
                    event!(Level::WARN, "could not announce view of {}: {}", message.id, err);
                    self.get_or_new_view(message).await?
                }
            };
            if let Some(view) = view {
                return Ok(Ingested::StoredWithView(view));
            }
        }
        Ok(Ingested::Stored)
    }

    /// The local actor's inbox, local messages first.
    pub async fn inbox(&self) -> InboxIterator {
        InboxIterator::new(
            &self.actor_id(),
            self.index.clone(),
            self.registry.clone(),
            self.verifier.clone(),
            self.page_size,
        )
        .await
    }

    /// From the local index if held there, otherwise from the servers.
    pub async fn get_object(&self, id: &str) -> Result<Object> {
        if self.index.is_tombstoned(id).await? {
            return Err(Error::NotFound(id.to_string()));
        }
        if let Some(object) = self.index.get_object(id).await? {
            return Ok(object);
        }
        self.registry.get_document(id).await
    }

    /// Everyone `actor_id` follows, according to the servers.
    pub async fn fetch_following(&self, actor_id: &str) -> Vec<Id> {
        collect_ids(&format!("{}/following", actor_id), self.registry.clone(), self.page_size).await
    }

    pub async fn fetch_followers(&self, actor_id: &str) -> Vec<Id> {
        collect_ids(&followers_of(actor_id), self.registry.clone(), self.page_size).await
    }
}
