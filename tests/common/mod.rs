//! Common test utilities - PortraitTest harness for end-to-end testing
//!
//! Spawns a fake upstream provider and a real portraitd server, each on a
//! random port, wired together through the server config.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use portraitd::access::Plan;
use portraitd::auth::accounts::AccountService;
use portraitd::catalog::ProviderKind;
use portraitd::config::Config;
use portraitd::credentials::CredentialResolver;
use portraitd::credits::CreditLedger;
use portraitd::Server;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// Bytes served as the generated image
pub const GENERATED_PNG: &[u8] = b"\x89PNG generated portrait";

/// Bytes returned by a successful face swap
pub const SWAPPED_JPEG: &[u8] = b"\xff\xd8 swapped portrait";

/// Call counters and switches for the fake provider
#[derive(Default)]
pub struct FakeProvider {
    pub submits: AtomicUsize,
    pub polls: AtomicUsize,
    pub face_swaps: AtomicUsize,
    pub chats: AtomicUsize,
    pub sync_images: AtomicUsize,
    /// Make every Novita task end in TASK_STATUS_FAILED
    pub fail_tasks: AtomicBool,
    /// Make merge-face answer 503
    pub fail_face_swap: AtomicBool,
    /// Make the OpenAI-compatible image endpoint answer 500
    pub fail_sync_images: AtomicBool,
}

impl FakeProvider {
    /// Total image-generation submissions across both provider APIs
    pub fn generation_calls(&self) -> usize {
        self.submits.load(Ordering::SeqCst) + self.sync_images.load(Ordering::SeqCst)
    }
}

type Fake = Arc<FakeProvider>;

async fn txt2img(State(fake): State<Fake>) -> impl IntoResponse {
    let n = fake.submits.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "task_id": format!("task-{}", n) }))
}

#[derive(serde::Deserialize)]
struct TaskQuery {
    task_id: String,
}

async fn task_result(
    State(fake): State<Fake>,
    Query(query): Query<TaskQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let n = fake.polls.fetch_add(1, Ordering::SeqCst);
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();

    if fake.fail_tasks.load(Ordering::SeqCst) {
        return Json(json!({
            "task": { "task_id": query.task_id, "status": "TASK_STATUS_FAILED", "reason": "upstream error" }
        }));
    }

    // First poll is still running
    if n % 2 == 0 {
        return Json(json!({
            "task": { "task_id": query.task_id, "status": "TASK_STATUS_PROCESSING" }
        }));
    }

    Json(json!({
        "task": { "task_id": query.task_id, "status": "TASK_STATUS_SUCCEED" },
        "images": [{ "image_url": format!("http://{}/files/generated.png", host), "image_type": "png" }]
    }))
}

async fn merge_face(State(fake): State<Fake>) -> impl IntoResponse {
    fake.face_swaps.fetch_add(1, Ordering::SeqCst);
    if fake.fail_face_swap.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "busy" })),
        )
            .into_response();
    }
    Json(json!({ "image_file": BASE64.encode(SWAPPED_JPEG), "image_type": "jpeg" })).into_response()
}

async fn images_generations(State(fake): State<Fake>) -> impl IntoResponse {
    fake.sync_images.fetch_add(1, Ordering::SeqCst);
    if fake.fail_sync_images.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    Json(json!({ "data": [{ "b64_json": BASE64.encode(GENERATED_PNG) }] })).into_response()
}

async fn chat_completions(State(fake): State<Fake>) -> impl IntoResponse {
    fake.chats.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "<think>the user wants a park scene</think>A woman walking through a sunlit park, autumn leaves"
            }
        }]
    }))
}

async fn file(axum::extract::Path(name): axum::extract::Path<String>) -> impl IntoResponse {
    let body: &'static [u8] = if name.starts_with("face") {
        b"face reference"
    } else {
        GENERATED_PNG
    };
    ([(header::CONTENT_TYPE, "image/png")], body)
}

async fn spawn_fake(fake: Fake) -> Result<(SocketAddr, JoinHandle<()>)> {
    let router = Router::new()
        .route("/v3/async/txt2img", post(txt2img))
        .route("/v3/async/img2img", post(txt2img))
        .route("/v3/async/task-result", get(task_result))
        .route("/v3/merge-face", post(merge_face))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/files/{name}", get(file))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            eprintln!("Fake provider error: {}", e);
        }
    });
    Ok((addr, handle))
}

/// Test harness that spawns a real portraitd server on a random port
pub struct PortraitTest {
    pub addr: SocketAddr,
    pub provider_addr: SocketAddr,
    pub client: Client,
    pub fake: Fake,
    server: Arc<Server>,
    _handle: JoinHandle<()>,
    _provider: JoinHandle<()>,
}

impl PortraitTest {
    /// Start a new test server instance
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Start with config tweaks applied on top of the test defaults
    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Result<Self> {
        let fake: Fake = Arc::new(FakeProvider::default());
        let (provider_addr, provider_handle) = spawn_fake(fake.clone()).await?;

        // Find a random available port
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let mut config = Config::for_tests(addr, &format!("http://{}", provider_addr));
        configure(&mut config);

        let server = Arc::new(Server::new(config).await?);

        // Keys live in the database so tests never depend on the process env
        let credentials = CredentialResolver::new(server.db().pool().clone());
        credentials.store(ProviderKind::Novita, "test-novita-key").await?;
        credentials
            .store(ProviderKind::OpenAiCompat, "test-openai-key")
            .await?;

        let server_clone = server.clone();

        // Spawn the server in a background task
        let handle = tokio::spawn(async move {
            if let Err(e) = server_clone.run().await {
                eprintln!("Server error: {}", e);
            }
        });

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        // Poll until server is ready (max 2 seconds)
        let mut ready = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if client
                .get(format!("http://{}/health", addr))
                .send()
                .await
                .is_ok()
            {
                ready = true;
                break;
            }
        }

        if !ready {
            panic!("Server failed to start within 2 seconds");
        }

        Ok(Self {
            addr,
            provider_addr,
            client,
            fake,
            server,
            _handle: handle,
            _provider: provider_handle,
        })
    }

    /// Get the base URL for the server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL of a file served by the fake provider
    pub fn provider_file(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.provider_addr, name)
    }

    /// Make a GET request
    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.get(format!("{}{}", self.base_url(), path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// Make a POST request with JSON body
    pub async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url(), path))
            .json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str, token: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .delete(format!("{}{}", self.base_url(), path))
            .bearer_auth(token)
            .send()
            .await?)
    }

    /// Get direct access to the database for test setup/assertions
    pub fn db(&self) -> Arc<portraitd::db::Database> {
        self.server.db()
    }

    /// Wait for queued task/asset records to land
    pub async fn flush_records(&self) {
        self.server.records().flush().await;
    }

    /// Shutdown the server gracefully
    pub fn shutdown(&self) {
        self.server.shutdown();
    }

    /// Register an account over HTTP, set its plan and grant credits
    ///
    /// Returns (account_id, token).
    pub async fn create_user(&self, username: &str, plan: Plan, credits: i64) -> Result<(String, String)> {
        let resp = self
            .post(
                "/auth/register",
                &json!({ "username": username, "password": "password123" }),
                None,
            )
            .await?;
        anyhow::ensure!(resp.status() == 201, "register failed: {}", resp.status());
        let body: Value = resp.json().await?;

        let account_id = body["account_id"].as_str().unwrap_or_default().to_string();
        let token = body["token"].as_str().unwrap_or_default().to_string();

        AccountService::new(self.db().pool().clone())
            .set_plan(&account_id, plan)
            .await?;
        if credits > 0 {
            CreditLedger::new(self.db().pool().clone())
                .grant(&account_id, credits, "test grant")
                .await?;
        }

        Ok((account_id, token))
    }

    /// Current credit balance of an account
    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        Ok(CreditLedger::new(self.db().pool().clone())
            .get_balance(account_id)
            .await?)
    }
}

impl Drop for PortraitTest {
    fn drop(&mut self) {
        self.shutdown();
        self._provider.abort();
    }
}
