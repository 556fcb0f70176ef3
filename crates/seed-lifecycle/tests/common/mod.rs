//! Minimal in-process Kubernetes API server.
//!
//! Answers every list with an empty list and holds every watch open, which
//! is all a reflector needs to report its cache as synced. Flipping it
//! unavailable makes every request fail with 503.

use axum::Router;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use kube::Config;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct FakeApiServer {
    url: String,
    unavailable: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FakeApiServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let unavailable = Arc::new(AtomicBool::new(false));
        let state = Arc::clone(&unavailable);
        let app = Router::new().fallback(move |uri: Uri| {
            let unavailable = Arc::clone(&state);
            async move { respond(&uri, unavailable.load(Ordering::SeqCst)).await }
        });
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { url, unavailable, task }
    }

    pub fn config(&self) -> Config {
        Config::new(self.url.parse().unwrap())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Drop for FakeApiServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(uri: &Uri, unavailable: bool) -> Response {
    if unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let watch = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .any(|param| param == "watch=true" || param == "watch=1");
    if watch {
        // Nothing ever changes; keep the watch open until the client goes away
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return StatusCode::OK.into_response();
    }
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "metadata": { "resourceVersion": "1" },
        "items": [],
    });
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        list.to_string(),
    )
        .into_response()
}
