//! Feed fetch client + article persistence for Almanac.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod store;

pub use memory::MemoryArticleStore;
pub use store::{connect_pool, ArticleStore, PgArticleStore, StoreError};

pub const CRATE_NAME: &str = "almanac-storage";

pub const DEFAULT_FEED_ENDPOINT: &str = "https://i.news.qq.com/web_feed/getHotModuleList";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Origin tag nested under `base_req` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRequest {
    #[serde(rename = "from")]
    pub origin: String,
}

/// JSON body posted to the feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequestBody {
    pub base_req: BaseRequest,
    #[serde(rename = "forward")]
    pub forward_cursor: String,
    #[serde(rename = "flush_num")]
    pub flush_count: u32,
    pub channel_id: String,
    pub item_count: u32,
}

/// Fixed outbound request descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub endpoint: String,
    pub body: FeedRequestBody,
}

impl Default for FeedRequest {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_FEED_ENDPOINT.to_string(),
            body: FeedRequestBody {
                base_req: BaseRequest {
                    origin: "pc".to_string(),
                },
                forward_cursor: "2".to_string(),
                flush_count: 1,
                channel_id: "news_news_top".to_string(),
                item_count: 20,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
    #[error("encoding feed request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Source of raw feed bytes. One call, one network round trip, no retries.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_feed(&self, run_id: Uuid) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug)]
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    request: FeedRequest,
}

impl HttpFeedFetcher {
    pub fn new(config: HttpClientConfig, request: FeedRequest) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=UTF-8"),
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self { client, request })
    }

    pub fn request(&self) -> &FeedRequest {
        &self.request
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch_feed(&self, run_id: Uuid) -> Result<Vec<u8>, FetchError> {
        let url = self.request.endpoint.as_str();
        let span = tracing::info_span!("feed_fetch", %run_id, url);

        async move {
            let body = serde_json::to_vec(&self.request.body)?;
            let resp = self.client.post(url).body(body).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let bytes = resp.bytes().await?;
            if bytes.is_empty() {
                return Err(FetchError::EmptyBody { url: final_url });
            }

            debug!(bytes = bytes.len(), "feed fetched");
            Ok(bytes.to_vec())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn spawn_feed_server(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fetcher_for(addr: SocketAddr, path: &str, timeout: Duration) -> HttpFeedFetcher {
        let mut request = FeedRequest::default();
        request.endpoint = format!("http://{addr}{path}");
        HttpFeedFetcher::new(
            HttpClientConfig {
                timeout,
                ..Default::default()
            },
            request,
        )
        .unwrap()
    }

    #[test]
    fn request_body_uses_wire_field_names() {
        let value = serde_json::to_value(&FeedRequest::default().body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "base_req": {"from": "pc"},
                "forward": "2",
                "flush_num": 1,
                "channel_id": "news_news_top",
                "item_count": 20
            })
        );
    }

    #[tokio::test]
    async fn posts_descriptor_and_returns_raw_bytes() {
        let app = Router::new().route(
            "/feed",
            post(|Json(body): Json<serde_json::Value>| async move {
                let channel = body["channel_id"].as_str().unwrap_or_default().to_string();
                format!(r#"{{"trace_id":"{channel}","data":[]}}"#)
            }),
        );
        let addr = spawn_feed_server(app).await;
        let fetcher = fetcher_for(addr, "/feed", Duration::from_secs(5));

        let bytes = fetcher.fetch_feed(Uuid::new_v4()).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("news_news_top"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let app = Router::new().route(
            "/feed",
            post(|| async { (AxumStatus::BAD_GATEWAY, "upstream down") }),
        );
        let addr = spawn_feed_server(app).await;
        let fetcher = fetcher_for(addr, "/feed", Duration::from_secs(5));

        let err = fetcher.fetch_feed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn empty_success_body_is_a_fetch_error() {
        let app = Router::new().route("/feed", post(|| async { "" }));
        let addr = spawn_feed_server(app).await;
        let fetcher = fetcher_for(addr, "/feed", Duration::from_secs(5));

        let err = fetcher.fetch_feed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody { .. }));
    }

    #[tokio::test]
    async fn slow_upstream_hits_the_configured_timeout() {
        let app = Router::new().route(
            "/feed",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "{}"
            }),
        );
        let addr = spawn_feed_server(app).await;
        let fetcher = fetcher_for(addr, "/feed", Duration::from_millis(200));

        let err = fetcher.fetch_feed(Uuid::new_v4()).await.unwrap_err();
        match err {
            FetchError::Request(inner) => assert!(inner.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_fetch_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = fetcher_for(addr, "/feed", Duration::from_secs(2));

        let err = fetcher.fetch_feed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }
}
