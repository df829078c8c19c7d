//! Layered server configuration
//!
//! Sources, later ones win:
//! 1. Compiled defaults
//! 2. Optional TOML file
//! 3. `PORTRAITD_*` environment variables (nested keys split on `__`)
//!
//! Provider API keys are deliberately absent here; they are only read by
//! [`crate::credentials::CredentialResolver`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// SQLite file path; None = in-memory
    pub db_path: Option<String>,
    /// Externally visible base URL, used to build durable image URLs
    pub public_url: String,
    pub providers: ProviderSettings,
    pub pipeline: PipelineSettings,
    pub costs: CostSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: None, // None = in-memory
            public_url: "http://127.0.0.1:8080".to_string(),
            providers: ProviderSettings::default(),
            pipeline: PipelineSettings::default(),
            costs: CostSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("PORTRAITD_").split("__"))
            .extract()?;
        config.costs.validate()?;
        Ok(config)
    }

    /// Config suitable for tests: in-memory DB and fast polling
    pub fn for_tests(bind_addr: SocketAddr, provider_url: &str) -> Self {
        let mut config = Self {
            bind_addr,
            public_url: format!("http://{}", bind_addr),
            ..Self::default()
        };
        config.providers.novita_url = provider_url.to_string();
        config.providers.openai_url = format!("{}/v1", provider_url);
        config.pipeline.poll_interval_ms = 5;
        config.pipeline.max_poll_attempts = 20;
        config.pipeline.request_budget_secs = 10;
        config
    }
}

/// Upstream provider endpoints and models
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Novita async task API root
    pub novita_url: String,
    /// OpenAI-compatible API root (images + chat)
    pub openai_url: String,
    /// Chat model used for prompt enhancement
    pub chat_model: String,
    /// Sustained chat calls allowed per account
    pub chat_calls_per_minute: u32,
    /// Chat calls an idle account may make back to back
    pub chat_burst: u32,
    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            novita_url: "https://api.novita.ai".to_string(),
            openai_url: "https://api.venice.ai/api/v1".to_string(),
            chat_model: "llama-3.3-70b".to_string(),
            chat_calls_per_minute: 60,
            chat_burst: 10,
            http_timeout_secs: 60,
        }
    }
}

impl ProviderSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Delay between task-status polls
    pub poll_interval_ms: u64,
    /// Maximum polls before a task is considered timed out
    pub max_poll_attempts: u32,
    /// Wall-clock ceiling for the whole generation step
    pub request_budget_secs: u64,
    /// Ceiling for the optional LLM prompt enhancement
    pub enhance_timeout_ms: u64,
    /// Whether enhancement runs when the request does not say otherwise
    pub enhance_prompts: bool,
    /// Character budget for composed prompts
    pub prompt_max_chars: usize,
    /// Accept generation requests without a session (free models only)
    pub allow_anonymous: bool,
    /// Attempts per background metadata write
    pub record_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_poll_attempts: 60,
            request_budget_secs: 300,
            enhance_timeout_ms: 15_000,
            enhance_prompts: true,
            prompt_max_chars: 1000,
            allow_anonymous: false,
            record_attempts: 3,
        }
    }
}

impl PipelineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_budget(&self) -> Duration {
        Duration::from_secs(self.request_budget_secs)
    }

    pub fn enhance_timeout(&self) -> Duration {
        Duration::from_millis(self.enhance_timeout_ms)
    }
}

/// Credit cost per generation flavor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostSettings {
    pub text_to_image: i64,
    pub image_to_image: i64,
    pub character: i64,
    pub style_preset: i64,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            text_to_image: 5,
            image_to_image: 5,
            character: 10,
            style_preset: 5,
        }
    }
}

impl CostSettings {
    /// Costs may be zero (a free flavor) but never negative
    pub fn validate(&self) -> Result<(), figment::Error> {
        let costs = [
            ("text_to_image", self.text_to_image),
            ("image_to_image", self.image_to_image),
            ("character", self.character),
            ("style_preset", self.style_preset),
        ];
        match costs.into_iter().find(|(_, cost)| *cost < 0) {
            Some((name, cost)) => Err(format!("costs.{} must not be negative, got {}", name, cost).into()),
            None => Ok(()),
        }
    }
}
