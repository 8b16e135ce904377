use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{event, Level};

use crate::error::{Error, Result};

/// What the registry needs from a response: the status and a JSON body if any.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

///
/// The JSON-over-HTTP transport the registry talks to servers through.
/// Errors are reserved for transport failures; a non-2xx status is a
/// regular response.
///
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<HttpResponse>;
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<ReqwestClient> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ReqwestClient { client })
    }

    async fn into_response(url: &str, response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|err| Error::Transport {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        // servers answer writes with an empty body
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_json(&self, url: &str) -> Result<HttpResponse> {
        event!(Level::TRACE, "GET {}", url);
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| Error::Transport {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        ReqwestClient::into_response(url, response).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse> {
        event!(Level::TRACE, "POST {}", url);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| Error::Transport {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        ReqwestClient::into_response(url, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range_test() {
        let ok = HttpResponse {
            status: 204,
            body: None,
        };
        assert!(ok.is_success());
        let missing = HttpResponse {
            status: 404,
            body: None,
        };
        assert!(!missing.is_success());
        let redirect = HttpResponse {
            status: 302,
            body: None,
        };
        assert!(!redirect.is_success());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error_test() {
        let client = ReqwestClient::new(Duration::from_millis(500)).unwrap();
        // port 9 (discard) on localhost is closed in test environments
        let result = client.get_json("http://127.0.0.1:9/ap/x").await;
        assert!(matches!(result, Err(Error::Transport { .. })));
    }
}
