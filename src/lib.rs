//! portraitd - companion portrait generation daemon
//!
//! An HTTP service that turns prompts and character profiles into images
//! through third-party generation APIs, with plan gating, credit billing,
//! fallback routing, optional post-processing and durable storage.

pub mod access;
pub mod api;
pub mod auth;
pub mod catalog;
pub mod characters;
pub mod config;
pub mod credentials;
pub mod credits;
pub mod db;
pub mod generation;
pub mod init;
pub mod pipeline;
pub mod postprocess;
pub mod prompt;
pub mod providers;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use access::AccessGate;
use api::AppState;
use catalog::{ModelCatalog, PresetRegistry, ProviderKind};
use characters::CharacterStore;
use config::Config;
use credentials::CredentialResolver;
use credits::CreditLedger;
use db::Database;
use generation::GenerationClient;
use pipeline::{Pipeline, PipelineDeps};
use prompt::{PromptCompositor, PromptEnhancer};
use providers::{CallThrottle, NovitaClient, OpenAiCompatClient};
use storage::{AssetStore, ImageStore, PersistenceSink, RecordWriter};

/// The portraitd server instance
pub struct Server {
    config: Config,
    db: Arc<Database>,
    state: AppState,
    records: RecordWriter,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Create a new server instance
    pub async fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::new(config.db_path.as_deref()).await?);
        let pool = db.pool().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = providers::shared_client(config.providers.http_timeout()).await?;
        let novita = Arc::new(NovitaClient::new(client.clone(), &config.providers.novita_url));
        let openai = Arc::new(OpenAiCompatClient::new(
            client.clone(),
            &config.providers.openai_url,
            &config.providers.chat_model,
            CallThrottle::new(
                config.providers.chat_calls_per_minute,
                config.providers.chat_burst,
            ),
        ));

        let settings = &config.pipeline;
        let generation = GenerationClient::new(
            settings.poll_interval(),
            settings.max_poll_attempts,
            settings.request_budget(),
        )
        .with_provider(ProviderKind::Novita, novita.clone())
        .with_provider(ProviderKind::OpenAiCompat, openai.clone());

        let (records, _writer) = RecordWriter::spawn(pool.clone(), settings.record_attempts);
        let image_store = ImageStore::new(pool.clone(), &config.public_url);

        let pipeline = Pipeline::new(PipelineDeps {
            catalog: ModelCatalog::new(),
            presets: PresetRegistry::new(),
            gate: AccessGate::with_keywords(settings.allow_anonymous),
            credentials: CredentialResolver::new(pool.clone()),
            credits: CreditLedger::new(pool.clone()),
            characters: CharacterStore::new(pool.clone()),
            compositor: PromptCompositor::new(settings.prompt_max_chars),
            enhancer: Some(PromptEnhancer::new(openai, settings.enhance_timeout())),
            enhance_by_default: settings.enhance_prompts,
            generation,
            face_swap: Some(novita),
            sink: PersistenceSink::new(Arc::new(image_store.clone()), client),
            records: records.clone(),
            costs: config.costs.clone(),
        });

        let state = AppState {
            db: db.clone(),
            pipeline: Arc::new(pipeline),
            credits: CreditLedger::new(pool.clone()),
            characters: CharacterStore::new(pool.clone()),
            assets: AssetStore::new(pool),
            image_store,
        };

        Ok(Self {
            config,
            db,
            state,
            records,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the database handle
    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Handle to the background record writer
    pub fn records(&self) -> RecordWriter {
        self.records.clone()
    }

    /// Build the router
    fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    /// Run the server until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("portraitd listening on {}", local_addr);

        let router = self.router();
        let mut shutdown_rx = self.shutdown_rx.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await?;

        // Drain queued task/asset records before exiting
        self.records.flush().await;

        info!("portraitd shutdown complete");
        Ok(())
    }

    /// Signal the server to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
