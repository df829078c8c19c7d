//! Generation client
//!
//! Per request:
//! - `submitted`: the provider answers synchronously or hands back a task id
//! - `polling`: the task is re-checked every `poll_interval`, up to
//!   `max_attempts` times, ending `succeeded`, `failed` or `timed_out`
//! - on `failed`/`timed_out` the fallback route (if any) is tried once
//!
//! The whole step, fallback included, runs under a wall-clock budget that
//! is independent of the per-poll interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::{ModelSpec, ProviderKind};
use crate::credentials::ApiKey;
use crate::providers::{ImageJob, ImageProvider, ImageRef, ProviderError, Submission, TaskStatus};

/// Smallest accepted edge
pub const MIN_EDGE: u32 = 64;
/// Largest accepted edge
pub const MAX_EDGE: u32 = 2048;

/// Generation errors
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("no provider registered for {0:?}")]
    NoProvider(ProviderKind),

    #[error("provider {provider} failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("provider {provider} did not finish after {attempts} polls")]
    TimedOut {
        provider: &'static str,
        attempts: u32,
    },

    #[error("generation exceeded its {0:?} budget")]
    DeadlineExceeded(Duration),
}

impl GenerationError {
    /// Whether a fallback attempt may follow this error
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Provider { .. } | GenerationError::TimedOut { .. }
        )
    }

    /// Whether this error is any kind of timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GenerationError::TimedOut { .. } | GenerationError::DeadlineExceeded(_)
        )
    }
}

/// Check output dimensions against global limits and the model minimum
pub fn validate_dimensions(model: &ModelSpec, width: u32, height: u32) -> Result<(), GenerationError> {
    for (label, edge) in [("width", width), ("height", height)] {
        if !(MIN_EDGE..=MAX_EDGE).contains(&edge) {
            return Err(GenerationError::InvalidDimensions(format!(
                "{} must be between {} and {}",
                label, MIN_EDGE, MAX_EDGE
            )));
        }
        if edge % 8 != 0 {
            return Err(GenerationError::InvalidDimensions(format!(
                "{} must be a multiple of 8",
                label
            )));
        }
    }

    let pixels = u64::from(width) * u64::from(height);
    if pixels < model.min_pixels {
        return Err(GenerationError::InvalidDimensions(format!(
            "{} needs at least {} pixels, got {}x{}",
            model.name, model.min_pixels, width, height
        )));
    }
    Ok(())
}

/// Parameters shared by the primary and fallback attempt
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    /// Random when None
    pub seed: Option<u32>,
    pub init_image: Option<ImageRef>,
    pub strength: f32,
}

/// One model plus the key to call its provider with
#[derive(Debug, Clone)]
pub struct Route {
    pub model: ModelSpec,
    pub key: ApiKey,
}

/// A finished generation
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: ImageRef,
    /// Public name of the model that produced the image
    pub model: String,
    pub seed: u32,
    /// Provider task handle, for async providers
    pub provider_task_id: Option<String>,
    pub used_fallback: bool,
}

/// Generation client over registered providers
pub struct GenerationClient {
    providers: HashMap<ProviderKind, Arc<dyn ImageProvider>>,
    poll_interval: Duration,
    max_attempts: u32,
    budget: Duration,
}

impl GenerationClient {
    pub fn new(poll_interval: Duration, max_attempts: u32, budget: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            poll_interval,
            max_attempts,
            budget,
        }
    }

    /// Register the provider serving `kind`
    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn ImageProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Generate one image, falling back once if the primary route fails
    pub async fn generate(
        &self,
        primary: &Route,
        fallback: Option<&Route>,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        validate_dimensions(&primary.model, params.width, params.height)?;

        let seed = params.seed.unwrap_or_else(rand::random::<u32>);

        let attempt = async {
            match self.run_route(primary, params, seed).await {
                Ok(result) => Ok(result),
                Err(e) if e.is_retryable() => {
                    let Some(fallback) = fallback else {
                        return Err(e);
                    };
                    if let Err(invalid) =
                        validate_dimensions(&fallback.model, params.width, params.height)
                    {
                        warn!("Fallback {} unusable: {}", fallback.model.name, invalid);
                        return Err(e);
                    }
                    warn!(
                        "Primary model {} failed ({}), trying fallback {}",
                        primary.model.name, e, fallback.model.name
                    );
                    let mut result = self.run_route(fallback, params, seed).await?;
                    result.used_fallback = true;
                    Ok(result)
                }
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(self.budget, attempt).await {
            Ok(result) => result,
            Err(_) => {
                error!("Generation exceeded wall-clock budget {:?}", self.budget);
                Err(GenerationError::DeadlineExceeded(self.budget))
            }
        }
    }

    async fn run_route(
        &self,
        route: &Route,
        params: &GenerationParams,
        seed: u32,
    ) -> Result<GenerationResult, GenerationError> {
        let provider = self
            .providers
            .get(&route.model.provider)
            .ok_or(GenerationError::NoProvider(route.model.provider))?;

        let job = ImageJob {
            model: route.model.provider_model.clone(),
            prompt: params.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            width: params.width,
            height: params.height,
            seed,
            steps: 25,
            guidance_scale: 7.0,
            init_image: params.init_image.clone(),
            strength: params.strength,
        };

        info!("Submitting {} to {}", route.model.name, provider.name());

        let submission = provider
            .submit(&route.key, &job)
            .await
            .map_err(|e| provider_error(provider.name(), e))?;

        let (image, provider_task_id) = match submission {
            Submission::Ready(image) => (image, None),
            Submission::Pending(task_id) => {
                let image = self.poll_until_done(provider.as_ref(), &route.key, &task_id).await?;
                (image, Some(task_id))
            }
        };

        Ok(GenerationResult {
            image,
            model: route.model.name.clone(),
            seed,
            provider_task_id,
            used_fallback: false,
        })
    }

    async fn poll_until_done(
        &self,
        provider: &dyn ImageProvider,
        key: &ApiKey,
        task_id: &str,
    ) -> Result<ImageRef, GenerationError> {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.poll_interval).await;

            match provider.poll(key, task_id).await {
                Ok(TaskStatus::Succeeded(image)) => {
                    debug!("Task {} succeeded after {} polls", task_id, attempt);
                    return Ok(image);
                }
                Ok(TaskStatus::Failed(reason)) => {
                    return Err(GenerationError::Provider {
                        provider: provider.name(),
                        message: reason,
                    });
                }
                Ok(TaskStatus::Queued) | Ok(TaskStatus::Running) => {
                    debug!("Task {} pending (poll {}/{})", task_id, attempt, self.max_attempts);
                }
                // A flaky status check costs an attempt, not the task
                Err(e) if e.is_transient() => {
                    warn!("Polling task {} failed: {}", task_id, e);
                }
                Err(e) => {
                    error!("Polling task {} failed for good: {}", task_id, e);
                    return Err(provider_error(provider.name(), e));
                }
            }
        }

        Err(GenerationError::TimedOut {
            provider: provider.name(),
            attempts: self.max_attempts,
        })
    }
}

fn provider_error(provider: &'static str, e: ProviderError) -> GenerationError {
    GenerationError::Provider {
        provider,
        message: e.to_string(),
    }
}
