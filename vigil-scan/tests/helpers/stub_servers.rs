//! In-process HTTP stubs for the recognition service

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral localhost port; returns the base URL
pub async fn spawn_router(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    serve(listener, router);
    base
}

fn serve(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
}

/// Server answering every request with 307 to the same path on `target`
///
/// Passing `None` makes it redirect to itself (redirect loop).
pub async fn spawn_redirector(target: Option<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let target = target.unwrap_or_else(|| base.clone());

    let router = Router::new().fallback(move |uri: Uri| {
        let target = target.clone();
        async move {
            (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, format!("{}{}", target, uri.path()))],
            )
        }
    });
    serve(listener, router);
    base
}

pub fn completed_job(job_id: &str, score: f64, subject_id: &str) -> Value {
    json!({
        "job_id": job_id,
        "status": "completed",
        "matches": [
            {
                "subject_id": subject_id,
                "score": score,
                "features": [
                    { "name": "brow", "value": 0.41 },
                    { "name": "jaw", "value": 0.17 }
                ]
            }
        ],
        "view_url": format!("https://resolver.test/view/{}", job_id)
    })
}

pub fn pending_job(job_id: &str) -> Value {
    json!({ "job_id": job_id, "status": "pending" })
}

#[derive(Default)]
struct StubState {
    submit_script: VecDeque<(u16, Value)>,
    poll_script: VecDeque<(u16, Value)>,
    /// Returned once the poll script is exhausted
    poll_default: Option<(u16, Value)>,
    submit_hits: usize,
    poll_hits: usize,
    last_authorization: Option<String>,
    last_submit_body: Option<Value>,
    /// Processing time of every submit, and whether the stub answers
    /// `pending` once the request's `wait_ms` runs out
    submit_latency: Option<(Duration, bool)>,
}

/// Scripted recognition service
#[derive(Clone, Default)]
pub struct StubResolver {
    state: Arc<Mutex<StubState>>,
}

impl StubResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_submit(&self, status: u16, body: Value) -> &Self {
        self.state.lock().unwrap().submit_script.push_back((status, body));
        self
    }

    pub fn on_poll(&self, status: u16, body: Value) -> &Self {
        self.state.lock().unwrap().poll_script.push_back((status, body));
        self
    }

    pub fn poll_default(&self, status: u16, body: Value) -> &Self {
        self.state.lock().unwrap().poll_default = Some((status, body));
        self
    }

    /// Make every submit take `latency` before answering
    ///
    /// With `honours_wait` the stub gives up after the request's `wait_ms` and
    /// answers with a pending job, as the real service does.
    pub fn slow_submit(&self, latency: Duration, honours_wait: bool) -> &Self {
        self.state.lock().unwrap().submit_latency = Some((latency, honours_wait));
        self
    }

    pub fn submit_hits(&self) -> usize {
        self.state.lock().unwrap().submit_hits
    }

    pub fn poll_hits(&self) -> usize {
        self.state.lock().unwrap().poll_hits
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.lock().unwrap().last_authorization.clone()
    }

    pub fn last_submit_body(&self) -> Option<Value> {
        self.state.lock().unwrap().last_submit_body.clone()
    }

    pub async fn spawn(&self) -> String {
        let router = Router::new()
            .route("/v1/jobs", post(submit))
            .route("/v1/jobs/:job_id", get(poll))
            .with_state(self.clone());
        spawn_router(router).await
    }
}

fn reply((status, body): (u16, Value)) -> Response {
    let status = StatusCode::from_u16(status).unwrap();
    (status, Json(body)).into_response()
}

async fn submit(State(stub): State<StubResolver>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let wait = body["wait_ms"].as_u64().map(Duration::from_millis);
    let (scripted, latency) = {
        let mut state = stub.state.lock().unwrap();
        state.submit_hits += 1;
        state.last_authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        state.last_submit_body = Some(body);
        let scripted = state
            .submit_script
            .pop_front()
            .unwrap_or((500, json!({ "error": "unscripted submit" })));
        (scripted, state.submit_latency)
    };

    if let Some((latency, honours_wait)) = latency {
        match wait {
            Some(wait) if honours_wait && wait < latency => {
                tokio::time::sleep(wait).await;
                return reply((200, pending_job("job-slow")));
            }
            _ => tokio::time::sleep(latency).await,
        }
    }
    reply(scripted)
}

async fn poll(State(stub): State<StubResolver>, Path(job_id): Path<String>) -> Response {
    let mut state = stub.state.lock().unwrap();
    state.poll_hits += 1;
    let scripted = state
        .poll_script
        .pop_front()
        .or_else(|| state.poll_default.clone())
        .unwrap_or((404, json!({ "error": format!("unknown job {}", job_id) })));
    reply(scripted)
}
