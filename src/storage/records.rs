//! Task and asset records
//!
//! Records are written off the request path by a single background task.
//! Every record carries its id from creation, so a retried insert after a
//! partial failure is a no-op rather than a duplicate. Records that still
//! fail after all retries land in `persistence_failures`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Terminal state of a generation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

/// One generation request, successful or not
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub owner_id: Option<String>,
    pub character_id: Option<String>,
    pub flavor: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub status: TaskState,
    pub image_urls: Vec<String>,
    pub cost: i64,
    pub error: Option<String>,
    pub created_at: String,
}

/// One image delivered to an account
#[derive(Debug, Clone, Serialize)]
pub struct AssetRecord {
    pub id: String,
    pub task_id: String,
    pub owner_id: String,
    pub character_id: Option<String>,
    pub url: String,
    pub prompt: String,
    pub model: String,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

enum Command {
    Task(TaskRecord),
    Asset(AssetRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background record writer
#[derive(Clone)]
pub struct RecordWriter {
    tx: mpsc::UnboundedSender<Command>,
}

impl RecordWriter {
    /// Start the writer task; it ends once every handle is dropped
    pub fn spawn(pool: SqlitePool, attempts: u32) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(pool, attempts.max(1), rx));
        (Self { tx }, handle)
    }

    pub fn record_task(&self, record: TaskRecord) {
        if self.tx.send(Command::Task(record)).is_err() {
            error!("Record writer stopped; task record dropped");
        }
    }

    pub fn record_asset(&self, record: AssetRecord) {
        if self.tx.send(Command::Asset(record)).is_err() {
            error!("Record writer stopped; asset record dropped");
        }
    }

    /// Wait until every record queued before this call has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run(pool: SqlitePool, attempts: u32, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Task(record) => write_with_retry(&pool, attempts, &record).await,
            Command::Asset(record) => write_with_retry(&pool, attempts, &record).await,
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Record writer stopped");
}

/// A row the writer knows how to insert idempotently
#[async_trait]
trait Record: Serialize + Send + Sync {
    const KIND: &'static str;

    fn id(&self) -> &str;

    async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl Record for TaskRecord {
    const KIND: &'static str = "task";

    fn id(&self) -> &str {
        &self.id
    }

    async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        insert_task(pool, self).await
    }
}

#[async_trait]
impl Record for AssetRecord {
    const KIND: &'static str = "asset";

    fn id(&self) -> &str {
        &self.id
    }

    async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        insert_asset(pool, self).await
    }
}

/// Insert with backoff; a record that never lands goes to `persistence_failures`
async fn write_with_retry<R: Record>(pool: &SqlitePool, attempts: u32, record: &R) {
    let mut last_error = None;
    for attempt in 1..=attempts {
        match record.insert(pool).await {
            Ok(()) => {
                debug!("{} record {} written", R::KIND, record.id());
                return;
            }
            Err(e) => {
                warn!(
                    "{} record {} write failed (attempt {}/{}): {}",
                    R::KIND,
                    record.id(),
                    attempt,
                    attempts,
                    e
                );
                last_error = Some(e);
                backoff(attempt, attempts).await;
            }
        }
    }
    if let Some(e) = last_error {
        record_failure(pool, R::KIND, record, &e).await;
    }
}

async fn backoff(attempt: u32, attempts: u32) {
    if attempt < attempts {
        tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
    }
}

async fn insert_task(pool: &SqlitePool, record: &TaskRecord) -> Result<(), sqlx::Error> {
    let image_urls = serde_json::to_string(&record.image_urls).unwrap_or_else(|_| "[]".to_string());

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO generation_tasks
            (id, owner_id, character_id, flavor, prompt, negative_prompt, model, status, image_urls, cost, error, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(&record.character_id)
    .bind(&record.flavor)
    .bind(&record.prompt)
    .bind(&record.negative_prompt)
    .bind(&record.model)
    .bind(record.status.as_str())
    .bind(image_urls)
    .bind(record.cost)
    .bind(&record.error)
    .bind(&record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_asset(pool: &SqlitePool, record: &AssetRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO generated_assets
            (id, task_id, owner_id, character_id, url, prompt, model, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.task_id)
    .bind(&record.owner_id)
    .bind(&record.character_id)
    .bind(&record.url)
    .bind(&record.prompt)
    .bind(&record.model)
    .bind(record.metadata.to_string())
    .bind(&record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn record_failure<T: Serialize>(pool: &SqlitePool, kind: &str, record: &T, e: &sqlx::Error) {
    let payload = serde_json::to_string(record).unwrap_or_default();
    let result = sqlx::query(
        "INSERT INTO persistence_failures (id, kind, payload, error, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(kind)
    .bind(&payload)
    .bind(e.to_string())
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await;

    match result {
        Ok(_) => error!("Gave up writing {} record; saved to persistence_failures", kind),
        Err(e2) => error!("Gave up writing {} record and could not save it: {} ({})", kind, e2, payload),
    }
}

/// A stored asset as listed to its owner
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Asset {
    pub id: String,
    pub task_id: String,
    pub character_id: Option<String>,
    pub url: String,
    pub prompt: String,
    pub model: String,
    pub created_at: String,
}

/// Owner-scoped access to generated assets
#[derive(Clone)]
pub struct AssetStore {
    pool: SqlitePool,
}

impl AssetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent assets first
    pub async fn list(&self, owner_id: &str, limit: i64) -> Result<Vec<Asset>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, task_id, character_id, url, prompt, model, created_at
            FROM generated_assets
            WHERE owner_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Delete an asset owned by `owner_id`, returning its URL
    pub async fn delete(&self, id: &str, owner_id: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("DELETE FROM generated_assets WHERE id = ? AND owner_id = ? RETURNING url")
                .bind(id)
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(url,)| url))
    }
}
