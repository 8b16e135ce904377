use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpResponse};

const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Default)]
struct MockServer {
    objects: HashMap<String, Value>,
    collections: HashMap<String, Vec<Value>>,
    failing: bool,
    gets: Vec<String>,
    posts: Vec<(String, Value)>,
}

///
/// In-process stand-in for a set of `/ap/` servers. Collections are paged
/// with `startIdx` as an offset, objects are served at their path, and a
/// failing server answers everything with a 500.
///
#[derive(Clone, Default)]
pub struct MockNetwork {
    servers: Arc<Mutex<HashMap<String, MockServer>>>,
}

fn split(url: &str) -> Result<(Url, String, String)> {
    let parsed = Url::parse(url)?;
    let origin = parsed.origin().ascii_serialization();
    let path = parsed
        .path()
        .strip_prefix("/ap/")
        .ok_or_else(|| Error::InvalidIdentifier(url.to_string()))?
        .to_string();
    Ok((parsed, origin, path))
}

fn response(status: u16, body: Option<Value>) -> Result<HttpResponse> {
    Ok(HttpResponse { status, body })
}

impl MockNetwork {
    pub fn new() -> Self {
        MockNetwork::default()
    }

    pub fn client(&self) -> Arc<dyn HttpClient> {
        Arc::new(self.clone())
    }

    fn with_server<T>(&self, url: &str, f: impl FnOnce(&mut MockServer) -> T) -> T {
        let mut servers = self.servers.lock().unwrap();
        f(servers.entry(url.to_string()).or_default())
    }

    pub fn set_failing(&self, url: &str, failing: bool) {
        self.with_server(url, |server| server.failing = failing);
    }

    pub fn set_collection(&self, url: &str, path: &str, items: Vec<Value>) {
        self.with_server(url, |server| {
            server.collections.insert(path.to_string(), items);
        });
    }

    /// Serves `object` at its own id.
    pub fn put_object(&self, url: &str, object: Value) {
        let id = object["id"].as_str().unwrap().to_string();
        self.put_object_at(url, &id, object);
    }

    pub fn put_object_at(&self, url: &str, path: &str, object: Value) {
        self.with_server(url, |server| {
            server.objects.insert(path.to_string(), object);
        });
    }

    pub fn gets(&self, url: &str) -> Vec<String> {
        self.with_server(url, |server| server.gets.clone())
    }

    pub fn posts(&self, url: &str) -> Vec<String> {
        self.with_server(url, |server| {
            server.posts.iter().map(|(url, _)| url.clone()).collect()
        })
    }

    pub fn posted_bodies(&self, url: &str) -> Vec<Value> {
        self.with_server(url, |server| {
            server.posts.iter().map(|(_, body)| body.clone()).collect()
        })
    }
}

#[async_trait]
impl HttpClient for MockNetwork {
    async fn get_json(&self, url: &str) -> Result<HttpResponse> {
        let (parsed, origin, path) = split(url)?;
        self.with_server(&origin, |server| {
            server.gets.push(url.to_string());
            if server.failing {
                return response(500, None);
            }
            if let Some(object) = server.objects.get(&path) {
                return response(200, Some(object.clone()));
            }
            let items = match server.collections.get(&path) {
                Some(items) => items,
                None => return response(404, None),
            };

            let param = |name: &str| {
                parsed
                    .query_pairs()
                    .find(|(key, _)| key == name)
                    .and_then(|(_, value)| value.parse::<usize>().ok())
            };
            let start = param("startIdx").unwrap_or(0).min(items.len());
            let size = param("pageSize").unwrap_or(DEFAULT_PAGE_SIZE);
            let end = (start + size).min(items.len());
            let mut body = json!({ "items": items[start..end].to_vec() });
            if end < items.len() {
                body["next"] = json!(format!(
                    "{}{}?startIdx={}&pageSize={}",
                    origin,
                    parsed.path(),
                    end,
                    size
                ));
            }
            response(200, Some(body))
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse> {
        let (_, origin, path) = split(url)?;
        self.with_server(&origin, |server| {
            server.posts.push((url.to_string(), body.clone()));
            if server.failing {
                return response(500, None);
            }
            if path.ends_with("/outbox") {
                server
                    .collections
                    .entry(path)
                    .or_default()
                    .insert(0, body.clone());
            } else {
                server.objects.insert(path, body.clone());
            }
            response(201, None)
        })
    }
}
