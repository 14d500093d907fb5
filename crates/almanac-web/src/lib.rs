//! HTTP surface for Almanac: manual ingest trigger and query-by-date.

use std::future::Future;
use std::sync::Arc;

use almanac_adapters::{FeedTimeZone, PUBLISH_TIME_FORMAT};
use almanac_core::Article;
use almanac_storage::ArticleStore;
use almanac_sync::IngestPipeline;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "almanac-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub store: Arc<dyn ArticleStore>,
    pub tz: FeedTimeZone,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self {
            store: pipeline.store(),
            tz: pipeline.time_zone(),
            pipeline,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsQuery {
    /// `YYYY-MM-DD HH:MM:SS` (or bare `YYYY-MM-DD`); only the date part is used.
    pub date: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewsQueryResponse {
    pub date: NaiveDate,
    pub count: usize,
    pub articles: Vec<Article>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/news/start", get(start_handler))
        .route("/news/query", post(query_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    state.pipeline.spawn_run();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started" })),
    )
        .into_response()
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewsQuery>, JsonRejection>,
) -> Response {
    let Json(query) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(date) = parse_query_date(&query.date) else {
        return bad_request(format!(
            "date {:?} is not in YYYY-MM-DD HH:MM:SS form",
            query.date
        ));
    };
    let Some((start, end)) = state.tz.day_bounds(date) else {
        return bad_request(format!("{date} has no local midnight in the configured zone"));
    };

    match state.store.list_published_between(start, end).await {
        Ok(articles) => Json(NewsQueryResponse {
            date,
            count: articles.len(),
            articles,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn parse_query_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, PUBLISH_TIME_FORMAT)
        .map(|dt| dt.date())
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_storage::MemoryArticleStore;
    use almanac_sync::ReplayFeedFetcher;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::path::Path;
    use std::time::Duration;
    use tower::ServiceExt;

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("../../fixtures/feed")
                .join(name),
        )
        .unwrap()
    }

    fn state_with(feed: &str) -> (AppState, Arc<MemoryArticleStore>) {
        let store = Arc::new(MemoryArticleStore::new());
        let pipeline = IngestPipeline::new(
            Arc::new(ReplayFeedFetcher::new(feed, fixture(feed))),
            store.clone(),
            "Asia/Shanghai".parse().unwrap(),
        );
        (AppState::new(Arc::new(pipeline)), store)
    }

    fn query_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/news/query")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_says_ok() {
        let (state, _) = state_with("single_item.json");
        let resp = app(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn start_returns_immediately_and_runs_in_background() {
        let (state, store) = state_with("hot_module_list.json");
        let resp = app(state)
            .oneshot(Request::builder().uri("/news/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["status"], "started");

        let persisted = tokio::time::timeout(Duration::from_secs(5), async {
            while store.count().await.unwrap() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(persisted.is_ok());
    }

    #[tokio::test]
    async fn query_returns_that_local_day_newest_first() {
        let (state, _) = state_with("hot_module_list.json");
        state.pipeline.run_once().await.unwrap();

        let resp = app(state)
            .oneshot(query_request(r#"{"date": "2024-01-01 08:00:00"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["date"], "2024-01-01");
        assert_eq!(body["count"], 3);
        let ids = body["articles"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["external_id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["20240101A04XYZ00", "20240101A02XYZ00", "20240101A01XYZ00"]);
    }

    #[tokio::test]
    async fn query_for_a_day_without_articles_is_empty() {
        let (state, _) = state_with("hot_module_list.json");
        state.pipeline.run_once().await.unwrap();

        let resp = app(state)
            .oneshot(query_request(r#"{"date": "2024-01-02"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["count"], 0);
    }

    #[tokio::test]
    async fn invalid_query_input_is_a_bad_request() {
        let (state, _) = state_with("single_item.json");
        let app = app(state);

        for body in [
            r#"{"date": "01/01/2024"}"#,
            r#"{"day": "2024-01-01 00:00:00"}"#,
            r#"{"date": "#,
        ] {
            let resp = app.clone().oneshot(query_request(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
            assert!(json_body(resp).await["error"].is_string());
        }
    }
}
