/*!
# Merge Iterators

Pull an ordered, deduplicated sequence of items out of several paginated
sources.

[`PageIterator`] yields one *round* per [`PageIterator::next_page`] call: one
page from every source that still has pages, in registration order. Callers
page interactively and stop whenever they like.

[`InboxIterator`] adds the local index as a privileged first source and
drains everything: [`InboxIterator::next`] keeps running cycles until the
local index and every server are exhausted.

Ordering is per source, not global. Within a page items keep the order the
source returned them in; across sources items come in source registration
order. Nothing is re-sorted by timestamp, so a caller merging two busy servers
sees server A's page before server B's even when B's items are newer.

A source that fails is treated as exhausted for the rest of the iterator's
life. Failures are logged, never returned.
*/

use ahash::AHashSet;
use futures::future::join_all;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crypto::Verifier;
use crate::local_index::LocalIndex;
use crate::object::{Decode, Id, Message};
use crate::registry::Registry;

/// One page of a paginated collection plus the cursor of the following page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<u64>,
}

pub type IdExtractor = fn(&Value) -> Option<String>;

pub type ItemFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Strings are their own identity, objects carry an `id` field.
pub fn default_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct SourceCursor {
    url: String,
    start_idx: Option<u64>,
    exhausted: bool,
}

///
/// Round-based merge over every server known to the registry when the
/// iterator is built.
///
pub struct PageIterator<T> {
    resource: String,
    registry: Arc<Registry>,
    page_size: usize,
    sources: Vec<SourceCursor>,
    seen: AHashSet<String>,
    id_of: IdExtractor,
    filter: Option<ItemFilter<T>>,
}

impl<T: Decode> PageIterator<T> {
    pub async fn new(resource: &str, registry: Arc<Registry>, page_size: usize) -> Self {
        let sources = registry
            .server_urls()
            .await
            .into_iter()
            .map(|url| SourceCursor {
                url,
                start_idx: None,
                exhausted: false,
            })
            .collect();
        PageIterator {
            resource: resource.to_string(),
            registry,
            page_size,
            sources,
            seen: AHashSet::new(),
            id_of: default_id_of,
            filter: None,
        }
    }

    pub fn with_id_extractor(mut self, id_of: IdExtractor) -> Self {
        self.id_of = id_of;
        self
    }

    /// Extra acceptance test run after decoding, e.g. signature verification.
    pub fn with_filter(mut self, filter: ItemFilter<T>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.sources.iter().all(|source| source.exhausted)
    }

    ///
    /// Exactly one round: one page from each live source. Pages are fetched
    /// concurrently but replayed in registration order before dedup, so the
    /// result does not depend on which server answered first.
    ///
    pub async fn next_page(&mut self) -> Vec<T> {
        let fetches = self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, source)| !source.exhausted)
            .map(|(idx, source)| {
                let registry = self.registry.clone();
                let resource = self.resource.clone();
                let url = source.url.clone();
                let start_idx = source.start_idx;
                let page_size = self.page_size;
                async move {
                    let result = registry
                        .get_paginated(&resource, &url, start_idx, Some(page_size))
                        .await;
                    (idx, result)
                }
            })
            .collect::<Vec<_>>();
        let results = join_all(fetches).await;

        let mut items = vec![];
        for (idx, result) in results {
            match result {
                Ok(page) => {
                    let source = &mut self.sources[idx];
                    // a cursor that does not move would replay the same page forever
                    let stalled = page.next.is_some() && page.next == source.start_idx;
                    if page.items.is_empty() || page.next.is_none() || stalled {
                        debug!("{} exhausted for {}", source.url, self.resource);
                        source.exhausted = true;
                    }
                    source.start_idx = page.next;
                    for raw in page.items {
                        if let Some(item) = self.accept(raw) {
                            items.push(item);
                        }
                    }
                }
                Err(err) => {
                    let source = &mut self.sources[idx];
                    warn!(
                        "giving up on {} for {}: {}",
                        source.url, self.resource, err
                    );
                    source.exhausted = true;
                }
            }
        }
        items
    }

    /// Returns true the first time an id is offered.
    pub(crate) fn first_sighting(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    fn accept(&mut self, raw: Value) -> Option<T> {
        if let Some(id) = (self.id_of)(&raw) {
            if !self.seen.insert(id) {
                return None;
            }
        }
        let item = T::decode(raw).ok()?;
        match &self.filter {
            Some(filter) if !filter(&item) => None,
            _ => Some(item),
        }
    }
}

///
/// Drains the local index and every server's copy of an actor's inbox.
///
/// Each cycle takes one page from the local index, then one round from the
/// servers. Items of cycle N are always handed out before those of cycle N+1,
/// and the local page comes first within a cycle, so a message held both
/// locally and remotely is yielded once, from the local copy.
///
pub struct InboxIterator {
    local: Arc<LocalIndex>,
    local_cursor: Option<u64>,
    local_exhausted: bool,
    page_size: usize,
    remote: PageIterator<Message>,
    buffer: VecDeque<Message>,
    cycle: u64,
}

impl InboxIterator {
    pub async fn new(
        actor_id: &str,
        local: Arc<LocalIndex>,
        registry: Arc<Registry>,
        verifier: Arc<dyn Verifier>,
        page_size: usize,
    ) -> Self {
        let inbox = format!("{}/inbox", actor_id);
        let remote = PageIterator::new(&inbox, registry, page_size)
            .await
            .with_filter(Box::new(move |message: &Message| {
                message.verify(verifier.as_ref())
            }));
        InboxIterator {
            local,
            local_cursor: None,
            local_exhausted: false,
            page_size,
            remote,
            buffer: VecDeque::new(),
            cycle: 0,
        }
    }

    /// Number of completed cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_exhausted(&self) -> bool {
        self.buffer.is_empty() && self.local_exhausted && self.remote.is_exhausted()
    }

    pub async fn next(&mut self) -> Option<Message> {
        while self.buffer.is_empty() {
            if self.local_exhausted && self.remote.is_exhausted() {
                return None;
            }
            self.run_cycle().await;
        }
        self.buffer.pop_front()
    }

    /// Everything that is left, until exhaustion.
    pub async fn collect_all(&mut self) -> Vec<Message> {
        let mut messages = vec![];
        while let Some(message) = self.next().await {
            messages.push(message);
        }
        messages
    }

    pub fn into_stream(self) -> impl Stream<Item = Message> {
        stream::unfold(self, |mut inbox| async move {
            inbox.next().await.map(|message| (message, inbox))
        })
    }

    async fn run_cycle(&mut self) {
        if !self.local_exhausted {
            self.pull_local().await;
        }
        if !self.remote.is_exhausted() {
            for message in self.remote.next_page().await {
                match self.local.is_tombstoned(&message.id).await {
                    Ok(false) => self.buffer.push_back(message),
                    Ok(true) => debug!("skipping tombstoned {}", message.id),
                    Err(err) => warn!("tombstone lookup failed for {}: {}", message.id, err),
                }
            }
        }
        self.cycle += 1;
    }

    async fn pull_local(&mut self) {
        let page = match self.local.get_page(self.local_cursor, self.page_size).await {
            Ok(page) => page,
            Err(err) => {
                warn!("local index unavailable: {}", err);
                self.local_exhausted = true;
                return;
            }
        };
        if page.items.is_empty() || page.next.is_none() {
            self.local_exhausted = true;
        }
        self.local_cursor = page.next;

        for id in page.items {
            if !self.remote.first_sighting(&id) {
                continue;
            }
            match self.local.get_message(&id).await {
                Ok(Some(message)) => self.buffer.push_back(message),
                Ok(None) => {}
                Err(err) => warn!("could not read {} from the local index: {}", id, err),
            }
        }
    }
}

/// Collects ids rather than bodies; used for follower and following lists.
pub async fn collect_ids(resource: &str, registry: Arc<Registry>, page_size: usize) -> Vec<Id> {
    let mut iterator: PageIterator<Id> = PageIterator::new(resource, registry, page_size).await;
    let mut ids = vec![];
    while !iterator.is_exhausted() {
        ids.extend(iterator.next_page().await);
    }
    ids
}
