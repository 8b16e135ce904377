use ahash::AHashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{event, Level};
use url::Url;

use crate::crypto::{is_content_id, Secp256k1Verifier, Verifier};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::iterator::{default_id_of, Page};
use crate::object::{Decode, Document, Id, Message, MessageType, Object};
use crate::storage::{Store, Table};

const SERVERS_KEY: &str = "servers";

/// A server the client reads from and writes to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub url: String,
    pub identity: String,
    /// Ids this server is known to hold. Only ever grows.
    #[serde(default)]
    pub known_ids: BTreeSet<Id>,
    #[serde(default)]
    pub last_listen_timestamp: Option<u64>,
}

impl ServerRecord {
    pub fn new(url: &str, identity: &str) -> Self {
        ServerRecord {
            url: url.to_string(),
            identity: identity.to_string(),
            known_ids: BTreeSet::new(),
            last_listen_timestamp: None,
        }
    }

    pub fn knows(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }
}

/// Strips trailing slashes so `{url}/ap/...` joins cleanly.
pub fn normalize_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    if parsed.cannot_be_a_base() {
        return Err(Error::InvalidIdentifier(url.to_string()));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn endpoint(server_url: &str, path: &str) -> String {
    format!("{}/ap/{}", server_url, path)
}

/// The `startIdx` query parameter of a `next` link, relative or absolute.
fn parse_next_cursor(base: &str, next: &str) -> Option<u64> {
    let url = match Url::parse(next) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base).ok()?.join(next).ok()?,
        Err(_) => return None,
    };
    url.query_pairs()
        .find(|(key, _)| key == "startIdx")
        .and_then(|(_, value)| value.parse().ok())
}

///
/// Known servers in registration order, their affinity sets, and a cache of
/// the immutable objects that went through the registry.
///
/// Writes fan out to every server and succeed if any one server accepted
/// them. Reads try servers already known to hold the id first.
///
pub struct Registry {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn Store>,
    verifier: Arc<dyn Verifier>,
    servers: RwLock<Vec<ServerRecord>>,
    cache: RwLock<AHashMap<Id, Object>>,
}

impl Registry {
    pub fn new(http: Arc<dyn HttpClient>, store: Arc<dyn Store>) -> Registry {
        Registry {
            http,
            store,
            verifier: Arc::new(Secp256k1Verifier),
            servers: RwLock::new(vec![]),
            cache: RwLock::new(AHashMap::new()),
        }
    }

    /// A registry holding the servers persisted by an earlier session.
    pub async fn load(http: Arc<dyn HttpClient>, store: Arc<dyn Store>) -> Result<Registry> {
        let registry = Registry::new(http, store);
        if let Some(bytes) = registry.store.get(Table::Servers, SERVERS_KEY).await? {
            let servers: Vec<ServerRecord> = serde_json::from_slice(&bytes)?;
            event!(Level::INFO, "loaded {} servers", servers.len());
            *registry.servers.write().await = servers;
        }
        Ok(registry)
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    async fn persist(&self, servers: &[ServerRecord]) -> Result<()> {
        self.store
            .put(Table::Servers, SERVERS_KEY, serde_json::to_vec(servers)?)
            .await
    }

    /// Registers a server, or updates the identity of one already known.
    pub async fn add_server(&self, url: &str, identity: &str) -> Result<()> {
        let url = normalize_url(url)?;
        let mut servers = self.servers.write().await;
        match servers.iter_mut().find(|server| server.url == url) {
            Some(server) => server.identity = identity.to_string(),
            None => {
                event!(Level::INFO, "adding server {}", url);
                servers.push(ServerRecord::new(&url, identity));
            }
        }
        self.persist(&servers).await
    }

    pub async fn remove_server(&self, url: &str) -> Result<bool> {
        let url = normalize_url(url)?;
        let mut servers = self.servers.write().await;
        let before = servers.len();
        servers.retain(|server| server.url != url);
        if servers.len() == before {
            return Ok(false);
        }
        event!(Level::INFO, "removed server {}", url);
        self.persist(&servers).await?;
        Ok(true)
    }

    pub async fn servers(&self) -> Vec<ServerRecord> {
        self.servers.read().await.clone()
    }

    pub async fn server_urls(&self) -> Vec<String> {
        self.servers
            .read()
            .await
            .iter()
            .map(|server| server.url.clone())
            .collect()
    }

    pub async fn get_server(&self, url: &str) -> Option<ServerRecord> {
        let url = normalize_url(url).ok()?;
        self.servers
            .read()
            .await
            .iter()
            .find(|server| server.url == url)
            .cloned()
    }

    pub async fn record_listen(&self, url: &str, timestamp: u64) -> Result<()> {
        let url = normalize_url(url)?;
        let mut servers = self.servers.write().await;
        let server = servers
            .iter_mut()
            .find(|server| server.url == url)
            .ok_or_else(|| Error::UnknownServer(url.clone()))?;
        server.last_listen_timestamp = Some(timestamp);
        self.persist(&servers).await
    }

    async fn record_affinity(&self, url: &str, ids: &[&str]) -> Result<()> {
        let mut servers = self.servers.write().await;
        let mut changed = false;
        if let Some(server) = servers.iter_mut().find(|server| server.url == url) {
            for id in ids {
                changed |= server.known_ids.insert(id.to_string());
            }
        }
        if changed {
            self.persist(&servers).await?;
        }
        Ok(())
    }

    ///
    /// Servers holding `id` first, the rest after, each group in registration
    /// order.
    ///
    pub async fn affinity_order(&self, id: &str) -> Vec<String> {
        let mut servers = self.servers.read().await.clone();
        servers.sort_by_key(|server| !server.knows(id));
        servers.into_iter().map(|server| server.url).collect()
    }

    pub async fn cached(&self, id: &str) -> Option<Object> {
        self.cache.read().await.get(id).cloned()
    }

    async fn cache_object(&self, object: Object) {
        self.cache
            .write()
            .await
            .insert(object.id().to_string(), object);
    }

    ///
    /// POSTs `body` to `path` on every target concurrently. Returns the number
    /// of servers that accepted it; each of them learns `id`.
    ///
    async fn fan_out(&self, id: &str, path: &str, body: &Value, targets: Vec<String>) -> Result<usize> {
        let posts = targets.into_iter().map(|url| {
            let http = self.http.clone();
            let target = endpoint(&url, path);
            async move {
                let result = http.post_json(&target, body).await;
                (url, result)
            }
        });

        let mut accepted = 0;
        for (url, result) in join_all(posts).await {
            match result {
                Ok(response) if response.is_success() => {
                    accepted += 1;
                    if let Err(err) = self.record_affinity(&url, &[id]).await {
                        event!(Level::WARN, "could not record {} on {}: {}", id, url, err);
                    }
                }
                Ok(response) => {
                    event!(
                        Level::WARN,
                        "{} rejected {} with status {}",
                        url,
                        id,
                        response.status
                    );
                }
                Err(err) => {
                    event!(Level::WARN, "could not post {} to {}: {}", id, url, err);
                }
            }
        }

        if accepted == 0 {
            return Err(Error::AllServersFailed(id.to_string()));
        }
        event!(Level::DEBUG, "{} accepted by {} servers", id, accepted);
        Ok(accepted)
    }

    /// Sends a message to the outbox of `identity` on every server.
    pub async fn post_message(&self, message: &Message, identity: &str) -> Result<usize> {
        self.cache_object(Object::Message(message.clone())).await;
        let body = serde_json::to_value(message)?;
        let path = format!("{}/actor/outbox", identity);
        let targets = self.server_urls().await;
        self.fan_out(&message.id, &path, &body, targets).await
    }

    /// Sends a message to one server only.
    pub async fn post_message_to(&self, message: &Message, identity: &str, server_url: &str) -> Result<()> {
        let server = self
            .get_server(server_url)
            .await
            .ok_or_else(|| Error::UnknownServer(server_url.to_string()))?;
        self.cache_object(Object::Message(message.clone())).await;
        let body = serde_json::to_value(message)?;
        let path = format!("{}/actor/outbox", identity);
        self.fan_out(&message.id, &path, &body, vec![server.url])
            .await
            .map(|_| ())
    }

    pub async fn post_document(&self, document: &Document) -> Result<usize> {
        if is_content_id(&document.id) {
            self.cache_object(Object::Document(document.clone())).await;
        }
        let body = serde_json::to_value(document)?;
        let targets = self.server_urls().await;
        self.fan_out(&document.id, &document.id, &body, targets).await
    }

    /// Actors are served at their id like any other object.
    pub async fn post_object(&self, object: &Object) -> Result<usize> {
        if is_content_id(object.id()) {
            self.cache_object(object.clone()).await;
        }
        let body = serde_json::to_value(object)?;
        let targets = self.server_urls().await;
        self.fan_out(object.id(), object.id(), &body, targets).await
    }

    ///
    /// The object with `id`, from the cache or the first server in affinity
    /// order that returns a well-formed copy of it.
    ///
    pub async fn get_document(&self, id: &str) -> Result<Object> {
        if let Some(object) = self.cached(id).await {
            return Ok(object);
        }

        for url in self.affinity_order(id).await {
            let target = endpoint(&url, id);
            let body = match self.http.get_json(&target).await {
                Ok(response) if response.is_success() => response.body,
                Ok(response) => {
                    event!(Level::DEBUG, "{} answered {} for {}", url, response.status, id);
                    continue;
                }
                Err(err) => {
                    event!(Level::WARN, "{}", err);
                    continue;
                }
            };
            let object = match body.map(Object::decode) {
                Some(Ok(object)) if object.id() == id && self_consistent(&object) => object,
                _ => {
                    event!(Level::WARN, "{} served a malformed copy of {}", url, id);
                    continue;
                }
            };
            self.record_affinity(&url, &[id]).await?;
            if is_content_id(id) {
                self.cache_object(object.clone()).await;
            }
            return Ok(object);
        }
        Err(Error::NotFound(id.to_string()))
    }

    ///
    /// The signed Create message by `actor_id` for the document `id`. Only a
    /// message that verifies and actually creates `id` is accepted.
    ///
    pub async fn get_create_message_for_document(&self, id: &str, actor_id: &str) -> Result<Message> {
        let path = format!("{}/createdBy/{}", id, actor_id);
        for url in self.affinity_order(id).await {
            let target = endpoint(&url, &path);
            let body = match self.http.get_json(&target).await {
                Ok(response) if response.is_success() => response.body,
                Ok(_) => continue,
                Err(err) => {
                    event!(Level::WARN, "{}", err);
                    continue;
                }
            };
            let message = match body.map(Message::decode) {
                Some(Ok(message)) => message,
                _ => continue,
            };
            let creates = message.kind == MessageType::Create
                && message.actor == actor_id
                && message.object.iter().any(|object| object == id);
            if !creates || !message.verify(self.verifier.as_ref()) {
                event!(Level::WARN, "{} served an invalid create message for {}", url, id);
                continue;
            }
            self.record_affinity(&url, &[id, message.id.as_str()]).await?;
            self.cache_object(Object::Message(message.clone())).await;
            return Ok(message);
        }
        Err(Error::NotFound(path))
    }

    /// One page of `uri` from one server.
    pub async fn get_paginated(
        &self,
        uri: &str,
        server_url: &str,
        start_idx: Option<u64>,
        page_size: Option<usize>,
    ) -> Result<Page<Value>> {
        let server = self
            .get_server(server_url)
            .await
            .ok_or_else(|| Error::UnknownServer(server_url.to_string()))?;

        let mut target = Url::parse(&endpoint(&server.url, uri))?;
        {
            let mut query = target.query_pairs_mut();
            if let Some(start_idx) = start_idx {
                query.append_pair("startIdx", &start_idx.to_string());
            }
            if let Some(page_size) = page_size {
                query.append_pair("pageSize", &page_size.to_string());
            }
        }

        let response = self.http.get_json(target.as_str()).await?;
        if !response.is_success() {
            return Err(Error::Transport {
                url: target.to_string(),
                reason: format!("status {}", response.status),
            });
        }
        let mut body = response
            .body
            .ok_or_else(|| Error::malformed("page", "empty body"))?;
        let next = body
            .get("next")
            .and_then(Value::as_str)
            .and_then(|next| parse_next_cursor(target.as_str(), next));
        let items = match body.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => return Err(Error::malformed("page", "missing items array")),
        };

        let ids: Vec<String> = items.iter().filter_map(default_id_of).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.record_affinity(&server.url, &ids).await?;

        Ok(Page { items, next })
    }
}

/// Content addressed documents must hash to their id.
fn self_consistent(object: &Object) -> bool {
    match object {
        Object::Document(document) if is_content_id(&document.id) => document.verify(),
        Object::Message(message) => matches!(message.compute_id(), Ok(id) if id == message.id),
        Object::Actor(actor) => actor.check_structure().is_ok(),
        Object::Document(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use crate::object::{actor_id_for, MessageOptions};
    use crate::storage::{Entry, MemoryStore};
    use crate::test_utilities::mocks::MockNetwork;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SERVER_A: &str = "http://a.example";
    const SERVER_B: &str = "http://b.example";

    async fn registry_for(network: &MockNetwork) -> Registry {
        let registry = Registry::new(network.client(), Arc::new(MemoryStore::new()));
        registry.add_server(SERVER_A, "did:key:za").await.unwrap();
        registry.add_server(SERVER_B, "did:key:zb").await.unwrap();
        registry
    }

    /// A store whose writes start failing on demand.
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(table, key).await
        }

        async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(Error::Storage(String::from("disk full")));
            }
            self.inner.put(table, key, value).await
        }

        async fn delete(&self, table: Table, key: &str) -> Result<()> {
            self.inner.delete(table, key).await
        }

        async fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>> {
            self.inner.scan_prefix(table, prefix).await
        }

        async fn scan_before(
            &self,
            table: Table,
            before: Option<&str>,
            limit: usize,
        ) -> Result<Vec<Entry>> {
            self.inner.scan_before(table, before, limit).await
        }
    }

    fn make_message(keypair: &Keypair) -> Message {
        let note = Document::note("fan out", None).unwrap();
        Message::new(
            keypair,
            MessageType::Create,
            vec![note.id],
            None,
            MessageOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn next_cursor_test() {
        assert_eq!(
            parse_next_cursor("http://a.example/ap/x", "http://a.example/ap/x?startIdx=17&pageSize=2"),
            Some(17)
        );
        assert_eq!(
            parse_next_cursor("http://a.example/ap/x?pageSize=2", "/ap/x?startIdx=3"),
            Some(3)
        );
        assert_eq!(parse_next_cursor("http://a.example/ap/x", "http://a.example/ap/x"), None);
    }

    #[test]
    fn normalize_url_test() {
        assert_eq!(normalize_url("http://a.example/").unwrap(), "http://a.example");
        assert_eq!(normalize_url("https://a.example/base/").unwrap(), "https://a.example/base");
        assert!(normalize_url("not a url").is_err());
    }

    #[tokio::test]
    async fn post_message_tolerates_one_failure_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        network.set_failing(SERVER_B, true);

        let keypair = Keypair::new();
        let message = make_message(&keypair);
        let accepted = registry
            .post_message(&message, &keypair.identity())
            .await
            .unwrap();
        assert_eq!(accepted, 1);

        let servers = registry.servers().await;
        assert!(servers[0].knows(&message.id));
        assert!(!servers[1].knows(&message.id));
        assert_eq!(
            network.posts(SERVER_A),
            vec![format!("{}/ap/{}/actor/outbox", SERVER_A, keypair.identity())]
        );
        assert!(registry.cached(&message.id).await.is_some());
    }

    #[tokio::test]
    async fn post_survives_affinity_write_failure_test() {
        let network = MockNetwork::new();
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken: AtomicBool::new(false),
        });
        let registry = Registry::new(network.client(), store.clone());
        registry.add_server(SERVER_A, "did:key:za").await.unwrap();
        registry.add_server(SERVER_B, "did:key:zb").await.unwrap();
        store.broken.store(true, Ordering::SeqCst);

        let message = make_message(&Keypair::new());
        assert_eq!(registry.post_message(&message, "did:key:zme").await.unwrap(), 2);
        for server in registry.servers().await {
            assert!(server.knows(&message.id));
        }
    }

    #[tokio::test]
    async fn post_message_all_failed_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        network.set_failing(SERVER_A, true);
        network.set_failing(SERVER_B, true);

        let keypair = Keypair::new();
        let message = make_message(&keypair);
        let result = registry.post_message(&message, &keypair.identity()).await;
        assert!(matches!(result, Err(Error::AllServersFailed(_))));
        assert!(result.unwrap_err().is_exhaustion());
    }

    #[tokio::test]
    async fn post_message_to_unknown_server_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        let keypair = Keypair::new();
        let message = make_message(&keypair);
        let result = registry
            .post_message_to(&message, &keypair.identity(), "http://c.example")
            .await;
        assert!(matches!(result, Err(Error::UnknownServer(_))));
        registry
            .post_message_to(&message, &keypair.identity(), SERVER_B)
            .await
            .unwrap();
        assert!(network.posts(SERVER_A).is_empty());
        assert_eq!(network.posts(SERVER_B).len(), 1);
    }

    #[tokio::test]
    async fn get_document_prefers_affinity_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        let note = Document::note("where am i", None).unwrap();
        network.put_object(SERVER_B, serde_json::to_value(&note).unwrap());

        assert_eq!(
            registry.affinity_order(&note.id).await,
            vec![SERVER_A.to_string(), SERVER_B.to_string()]
        );
        let found = registry.get_document(&note.id).await.unwrap();
        assert_eq!(found, Object::Document(note.clone()));
        assert_eq!(network.gets(SERVER_A).len(), 1);
        assert_eq!(
            registry.affinity_order(&note.id).await,
            vec![SERVER_B.to_string(), SERVER_A.to_string()]
        );

        // served from the cache from now on
        registry.get_document(&note.id).await.unwrap();
        assert_eq!(network.gets(SERVER_B).len(), 1);
    }

    #[tokio::test]
    async fn get_document_skips_tampered_copies_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        let note = Document::note("original", None).unwrap();
        let mut tampered = serde_json::to_value(&note).unwrap();
        tampered["content"] = json!("altered");
        network.put_object(SERVER_A, tampered);
        network.put_object(SERVER_B, serde_json::to_value(&note).unwrap());

        let found = registry.get_document(&note.id).await.unwrap();
        assert_eq!(found, Object::Document(note.clone()));
        let servers = registry.servers().await;
        assert!(!servers[0].knows(&note.id));
        assert!(servers[1].knows(&note.id));

        let missing = registry.get_document("urn:cid:missing").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn get_create_message_requires_valid_signature_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        let keypair = Keypair::new();
        let actor_id = actor_id_for(&keypair.identity());
        let note = Document::note("created", None).unwrap();
        let create = Message::new(
            &keypair,
            MessageType::Create,
            vec![note.id.clone()],
            None,
            MessageOptions::default(),
        )
        .unwrap();

        let mut forged = serde_json::to_value(&create).unwrap();
        forged["published"] = json!("2000-01-01T00:00:00Z");
        network.put_object_at(SERVER_A, &format!("{}/createdBy/{}", note.id, actor_id), forged);
        network.put_object_at(
            SERVER_B,
            &format!("{}/createdBy/{}", note.id, actor_id),
            serde_json::to_value(&create).unwrap(),
        );

        let found = registry
            .get_create_message_for_document(&note.id, &actor_id)
            .await
            .unwrap();
        assert_eq!(found, create);

        let other = actor_id_for(&Keypair::new().identity());
        assert!(matches!(
            registry.get_create_message_for_document(&note.id, &other).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_paginated_test() {
        let network = MockNetwork::new();
        let registry = registry_for(&network).await;
        network.set_collection(SERVER_A, "things", vec![json!("x"), json!("y"), json!("z")]);

        let page = registry
            .get_paginated("things", SERVER_A, None, Some(2))
            .await
            .unwrap();
        assert_eq!(page.items, vec![json!("x"), json!("y")]);
        assert_eq!(page.next, Some(2));
        let page = registry
            .get_paginated("things", SERVER_A, page.next, Some(2))
            .await
            .unwrap();
        assert_eq!(page.items, vec![json!("z")]);
        assert_eq!(page.next, None);
        assert!(registry.servers().await[0].knows("z"));

        assert!(matches!(
            registry.get_paginated("things", "http://c.example", None, None).await,
            Err(Error::UnknownServer(_))
        ));

        network.put_object_at(SERVER_B, "broken", json!({"id": "broken"}));
        assert!(matches!(
            registry.get_paginated("broken", SERVER_B, None, None).await,
            Err(Error::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn servers_persist_test() {
        let network = MockNetwork::new();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        {
            let registry = Registry::new(network.client(), store.clone());
            registry.add_server("http://a.example/", "did:key:za").await.unwrap();
            registry.add_server(SERVER_B, "did:key:zb").await.unwrap();
            registry.record_listen(SERVER_B, 42).await.unwrap();
            registry.add_server(SERVER_A, "did:key:zaa").await.unwrap();
        }
        let registry = Registry::load(network.client(), store.clone()).await.unwrap();
        let servers = registry.servers().await;
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].identity, "did:key:zaa");
        assert_eq!(servers[1].last_listen_timestamp, Some(42));

        assert!(registry.remove_server(SERVER_A).await.unwrap());
        assert!(!registry.remove_server(SERVER_A).await.unwrap());
        let registry = Registry::load(network.client(), store).await.unwrap();
        assert_eq!(registry.server_urls().await, vec![SERVER_B.to_string()]);
    }
}
