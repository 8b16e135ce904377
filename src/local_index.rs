use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, event, Level};

use crate::error::{Error, Result};
use crate::iterator::Page;
use crate::object::{Decode, Id, Message, Object};
use crate::storage::{Store, Table};

const SEQ_KEY: &str = "seq";

fn log_key(seq: u64) -> String {
    format!("{:020}", seq)
}

fn join_key(left: &str, right: &str) -> String {
    format!("{}\n{}", left, right)
}

fn join_prefix(left: &str) -> String {
    format!("{}\n", left)
}

fn join_right(key: &str) -> &str {
    key.rsplit('\n').next().unwrap_or(key)
}

///
/// The client's own copy of its inbox.
///
/// * an append-only log of message ids, addressed by an increasing sequence
///   number which doubles as the page cursor;
/// * an object table holding message and document bodies;
/// * a message/document join table, scanned in both directions, which is what
///   garbage collection counts references with;
/// * a one-per-object view cache, the follow set and the tombstones.
///
/// A tombstoned id reads as absent everywhere and can never be stored again.
///
pub struct LocalIndex {
    store: Arc<dyn Store>,
    // last sequence number handed out; also serializes writers
    seq: Mutex<u64>,
}

impl LocalIndex {
    pub async fn open(store: Arc<dyn Store>) -> Result<LocalIndex> {
        let seq = match store.get(Table::Meta, SEQ_KEY).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .parse::<u64>()
                .map_err(|err| Error::Storage(format!("bad sequence number: {}", err)))?,
            None => 0,
        };
        Ok(LocalIndex {
            store,
            seq: Mutex::new(seq),
        })
    }

    pub fn store_handle(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub async fn is_tombstoned(&self, id: &str) -> Result<bool> {
        Ok(self.store.get(Table::Tombstones, id).await?.is_some())
    }

    ///
    /// Appends `message` to the log and stores `documents` joined to it.
    /// Returns false when the message was already present or is tombstoned.
    ///
    pub async fn store_message(&self, message: &Message, documents: &[Object]) -> Result<bool> {
        let mut seq = self.seq.lock().await;
        if self.is_tombstoned(&message.id).await? {
            debug!("refusing to store tombstoned message {}", message.id);
            return Ok(false);
        }

        let appended = self
            .store
            .get(Table::LogPosition, &message.id)
            .await?
            .is_none();
        if appended {
            *seq += 1;
            self.store
                .put(Table::Meta, SEQ_KEY, seq.to_string().into_bytes())
                .await?;
            self.store
                .put(Table::Log, &log_key(*seq), message.id.clone().into_bytes())
                .await?;
            self.store
                .put(Table::LogPosition, &message.id, seq.to_string().into_bytes())
                .await?;
            self.put_object(&Object::Message(message.clone())).await?;
        }

        for document in documents {
            if self.is_tombstoned(document.id()).await? {
                continue;
            }
            self.put_object(document).await?;
            self.store
                .put(
                    Table::MessageDocuments,
                    &join_key(&message.id, document.id()),
                    vec![],
                )
                .await?;
            self.store
                .put(
                    Table::DocumentMessages,
                    &join_key(document.id(), &message.id),
                    vec![],
                )
                .await?;
        }
        Ok(appended)
    }

    /// Stores an object outside the log. Pinned objects survive garbage collection.
    pub async fn store_object(&self, object: &Object, pin: bool) -> Result<bool> {
        let _seq = self.seq.lock().await;
        if self.is_tombstoned(object.id()).await? {
            return Ok(false);
        }
        self.put_object(object).await?;
        if pin {
            self.store.put(Table::Pinned, object.id(), vec![]).await?;
        }
        Ok(true)
    }

    async fn put_object(&self, object: &Object) -> Result<()> {
        self.store
            .put(Table::Objects, object.id(), serde_json::to_vec(object)?)
            .await
    }

    pub async fn get_object(&self, id: &str) -> Result<Option<Object>> {
        if self.is_tombstoned(id).await? {
            return Ok(None);
        }
        match self.store.get(Table::Objects, id).await? {
            Some(bytes) => Ok(Some(Object::decode(serde_json::from_slice(&bytes)?)?)),
            None => Ok(None),
        }
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.get_object(id).await?.and_then(Object::into_message))
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(!self.is_tombstoned(id).await? && self.store.get(Table::Objects, id).await?.is_some())
    }

    ///
    /// Up to `page_size` message ids, newest first, starting at sequence
    /// number `cursor` inclusive (or at the newest entry). `next` is one less
    /// than the oldest sequence number returned, absent once the start of the
    /// log is reached. Same shape as a server page.
    ///
    pub async fn get_page(&self, cursor: Option<u64>, page_size: usize) -> Result<Page<Id>> {
        let before = cursor.map(|cursor| log_key(cursor.saturating_add(1)));
        let entries = self
            .store
            .scan_before(Table::Log, before.as_deref(), page_size)
            .await?;

        let mut oldest: Option<u64> = None;
        let mut items = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let seq = key
                .parse::<u64>()
                .map_err(|err| Error::Storage(format!("bad log key {}: {}", key, err)))?;
            oldest = Some(seq);
            items.push(String::from_utf8_lossy(&value).to_string());
        }
        let next = match oldest {
            Some(seq) if seq > 1 => Some(seq - 1),
            _ => None,
        };
        Ok(Page { items, next })
    }

    ///
    /// Tombstones `id` and removes its log entry and body. Documents joined
    /// only to this message go with it unless pinned; documents still joined
    /// to another live message stay.
    ///
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _seq = self.seq.lock().await;
        self.store.put(Table::Tombstones, id, vec![]).await?;

        if let Some(bytes) = self.store.get(Table::LogPosition, id).await? {
            let seq = String::from_utf8_lossy(&bytes)
                .parse::<u64>()
                .map_err(|err| Error::Storage(format!("bad sequence number: {}", err)))?;
            self.store.delete(Table::Log, &log_key(seq)).await?;
            self.store.delete(Table::LogPosition, id).await?;
        }

        // a deleted view must not keep answering for its object
        if let Some(bytes) = self.store.get(Table::Objects, id).await? {
            if let Ok(Object::Message(message)) =
                serde_json::from_slice::<serde_json::Value>(&bytes)
                    .map_err(Error::from)
                    .and_then(Object::decode)
            {
                if let Some(object_id) = message.first_object() {
                    if let Some(view) = self.get_view(object_id).await? {
                        if view.id == message.id {
                            self.store.delete(Table::Views, object_id).await?;
                        }
                    }
                }
            }
        }
        self.store.delete(Table::Objects, id).await?;
        self.store.delete(Table::Pinned, id).await?;

        // the deleted id as a document: drop the joins pointing at it
        for (key, _) in self
            .store
            .scan_prefix(Table::DocumentMessages, &join_prefix(id))
            .await?
        {
            let message_id = join_right(&key).to_string();
            self.store.delete(Table::DocumentMessages, &key).await?;
            self.store
                .delete(Table::MessageDocuments, &join_key(&message_id, id))
                .await?;
        }

        // the deleted id as a message: release its documents
        for (key, _) in self
            .store
            .scan_prefix(Table::MessageDocuments, &join_prefix(id))
            .await?
        {
            let document_id = join_right(&key).to_string();
            self.store.delete(Table::MessageDocuments, &key).await?;
            self.store
                .delete(Table::DocumentMessages, &join_key(&document_id, id))
                .await?;
            self.collect(&document_id).await?;
        }

        event!(Level::DEBUG, "deleted {}", id);
        Ok(())
    }

    async fn collect(&self, document_id: &str) -> Result<()> {
        if self.store.get(Table::Pinned, document_id).await?.is_some() {
            return Ok(());
        }
        let referenced = !self
            .store
            .scan_prefix(Table::DocumentMessages, &join_prefix(document_id))
            .await?
            .is_empty();
        if !referenced {
            debug!("collecting unreferenced document {}", document_id);
            self.store.delete(Table::Objects, document_id).await?;
        }
        Ok(())
    }

    pub async fn get_view(&self, object_id: &str) -> Result<Option<Message>> {
        match self.store.get(Table::Views, object_id).await? {
            Some(bytes) => {
                let view = Message::decode(serde_json::from_slice(&bytes)?)?;
                if self.is_tombstoned(&view.id).await? {
                    return Ok(None);
                }
                Ok(Some(view))
            }
            None => Ok(None),
        }
    }

    pub async fn put_view(&self, object_id: &str, view: &Message) -> Result<()> {
        self.store
            .put(Table::Views, object_id, serde_json::to_vec(view)?)
            .await
    }

    pub async fn mark_view_announced(&self, view_id: &str) -> Result<()> {
        self.store.put(Table::AnnouncedViews, view_id, vec![]).await
    }

    pub async fn is_view_announced(&self, view_id: &str) -> Result<bool> {
        Ok(self.store.get(Table::AnnouncedViews, view_id).await?.is_some())
    }

    pub async fn add_follow(&self, id: &str) -> Result<()> {
        self.store.put(Table::Follows, id, vec![]).await
    }

    pub async fn remove_follow(&self, id: &str) -> Result<()> {
        self.store.delete(Table::Follows, id).await
    }

    pub async fn is_following(&self, id: &str) -> Result<bool> {
        Ok(self.store.get(Table::Follows, id).await?.is_some())
    }

    pub async fn follows(&self) -> Result<Vec<Id>> {
        Ok(self
            .store
            .scan_prefix(Table::Follows, "")
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}
