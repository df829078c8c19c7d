//! Generation pipeline
//!
//! Runs one request through, strictly in order:
//! 1. input validation and model/dimension checks
//! 2. access gate
//! 3. primary provider credentials
//! 4. fresh character snapshot
//! 5. credit deduction (before any billed call)
//! 6. optional prompt enhancement, then composition
//! 7. generation with a single fallback
//! 8. post-processing chain
//! 9. durable persistence, then queued task/asset records
//!
//! Steps 1-5 fail without touching a provider. A terminal provider or
//! timeout error refunds the deduction and records a failed task.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::access::{AccessGate, Caller, DenialKind, GateDecision};
use crate::catalog::{ModelCatalog, ModelSpec, PresetRegistry, ProviderKind, StylePreset};
use crate::characters::{CharacterStore, EntityProfile};
use crate::config::CostSettings;
use crate::credentials::{CredentialError, CredentialResolver};
use crate::credits::{CreditError, CreditLedger, Deduction};
use crate::generation::{validate_dimensions, GenerationClient, GenerationError, GenerationParams, Route};
use crate::postprocess::{FaceSwapStage, PostProcessChain, SkippedStage};
use crate::prompt::{ComposeInput, PromptCompositor, PromptEnhancer, Style};
use crate::providers::{FaceSwapProvider, ImageRef};
use crate::storage::{AssetRecord, PersistenceSink, RecordWriter, TaskRecord, TaskState};

/// Default output size (portrait orientation)
pub const DEFAULT_WIDTH: u32 = 768;
pub const DEFAULT_HEIGHT: u32 = 1024;

/// Default image-to-image strength
pub const DEFAULT_STRENGTH: f32 = 0.6;

/// Endpoint flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    TextToImage,
    ImageToImage,
    Character,
    StylePreset,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::TextToImage => "text_to_image",
            Flavor::ImageToImage => "image_to_image",
            Flavor::Character => "character",
            Flavor::StylePreset => "style_preset",
        }
    }

    /// Credit cost of one request
    pub fn cost(&self, costs: &CostSettings) -> i64 {
        match self {
            Flavor::TextToImage => costs.text_to_image,
            Flavor::ImageToImage => costs.image_to_image,
            Flavor::Character => costs.character,
            Flavor::StylePreset => costs.style_preset,
        }
    }

    /// Storage folder for results
    fn folder(&self) -> &'static str {
        match self {
            Flavor::Character => "characters",
            _ => "generated",
        }
    }
}

/// One inbound generation request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub flavor: Flavor,
    pub prompt: String,
    pub character_id: Option<String>,
    /// URL or `data:` URL of the source image
    pub reference_image: Option<String>,
    pub model: Option<String>,
    pub style: Option<String>,
    pub preset: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u32>,
    pub strength: Option<f32>,
    /// Overrides the configured enhancement default
    pub enhance: Option<bool>,
}

impl GenerationRequest {
    pub fn new(flavor: Flavor, prompt: &str) -> Self {
        Self {
            flavor,
            prompt: prompt.to_string(),
            character_id: None,
            reference_image: None,
            model: None,
            style: None,
            preset: None,
            width: None,
            height: None,
            seed: None,
            strength: None,
            enhance: None,
        }
    }
}

/// A successful (possibly degraded) generation
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub task_id: String,
    pub image_url: String,
    pub model: String,
    pub seed: u32,
    pub used_fallback: bool,
    /// Whether the URL points at durable storage
    pub durable: bool,
    pub skipped_stages: Vec<SkippedStage>,
}

impl GenerationOutcome {
    /// An optional stage failed but the image is usable
    pub fn is_degraded(&self) -> bool {
        !self.skipped_stages.is_empty()
    }
}

/// Terminal pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{reason}")]
    Entitlement {
        reason: String,
        upgrade_required: bool,
    },

    #[error("insufficient credits: need {required}, have {balance}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("generation failed: {0}")]
    Provider(String),

    #[error("generation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the client should route the user to billing
    pub fn upgrade_required(&self) -> bool {
        match self {
            PipelineError::Entitlement {
                upgrade_required, ..
            } => *upgrade_required,
            PipelineError::InsufficientCredits { .. } => true,
            _ => false,
        }
    }
}

impl From<GenerationError> for PipelineError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::InvalidDimensions(msg) => PipelineError::Validation(msg),
            GenerationError::NoProvider(_) => PipelineError::Internal(e.to_string()),
            GenerationError::Provider { .. } => PipelineError::Provider(e.to_string()),
            GenerationError::TimedOut { .. } | GenerationError::DeadlineExceeded(_) => {
                PipelineError::Timeout(e.to_string())
            }
        }
    }
}

/// Everything the pipeline calls into
pub struct PipelineDeps {
    pub catalog: ModelCatalog,
    pub presets: PresetRegistry,
    pub gate: AccessGate,
    pub credentials: CredentialResolver,
    pub credits: CreditLedger,
    pub characters: CharacterStore,
    pub compositor: PromptCompositor,
    pub enhancer: Option<PromptEnhancer>,
    pub enhance_by_default: bool,
    pub generation: GenerationClient,
    pub face_swap: Option<Arc<dyn FaceSwapProvider>>,
    pub sink: PersistenceSink,
    pub records: RecordWriter,
    pub costs: CostSettings,
}

/// Validated request, ready for the billed part of the pipeline
struct Prepared<'a> {
    model: &'a ModelSpec,
    style: Style,
    preset: Option<&'a StylePreset>,
    width: u32,
    height: u32,
    init_image: Option<ImageRef>,
}

/// The generation pipeline
pub struct Pipeline {
    deps: PipelineDeps,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.deps.catalog
    }

    pub fn presets(&self) -> &PresetRegistry {
        &self.deps.presets
    }

    /// Run one request end to end
    pub async fn run(
        &self,
        caller: Option<&Caller>,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, PipelineError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let account_id = caller.map(|c| c.account_id.as_str());

        let prepared = self.validate(&request)?;

        match self.deps.gate.check(caller, prepared.model, &request.prompt) {
            GateDecision::Allow => {}
            GateDecision::Deny(denial) => {
                info!(
                    "Denied {} on {}: {}",
                    account_id.unwrap_or("anonymous"),
                    prepared.model.name,
                    denial.reason
                );
                return Err(match denial.kind {
                    DenialKind::Unauthenticated => PipelineError::Auth(denial.reason),
                    DenialKind::Plan | DenialKind::Content => PipelineError::Entitlement {
                        reason: denial.reason,
                        upgrade_required: denial.upgrade_required,
                    },
                });
            }
        }

        let primary = Route {
            model: prepared.model.clone(),
            key: self
                .deps
                .credentials
                .resolve(prepared.model.provider)
                .await
                .map_err(credential_error)?,
        };
        let fallback = self
            .fallback_route(caller, prepared.model, &request.prompt, &prepared)
            .await;

        let profile = match &request.character_id {
            Some(id) => Some(self.snapshot(id, account_id).await?),
            None => None,
        };

        let deduction = match caller {
            Some(caller) => self.charge(caller, request.flavor).await?,
            None => None,
        };

        let user_text = self.user_text(&request, caller).await;
        let composed = self.deps.compositor.compose(ComposeInput {
            user_text: &user_text,
            profile: profile.as_ref(),
            style: prepared.style,
            preset: prepared.preset,
        });
        debug!("Composed prompt: {}", composed.prompt);

        let params = GenerationParams {
            prompt: composed.prompt.clone(),
            negative_prompt: composed.negative_prompt.clone(),
            width: prepared.width,
            height: prepared.height,
            seed: request.seed,
            init_image: prepared.init_image.clone(),
            strength: request.strength.unwrap_or(DEFAULT_STRENGTH),
        };

        let generated = match self
            .deps
            .generation
            .generate(&primary, fallback.as_ref(), &params)
            .await
        {
            Ok(generated) => generated,
            Err(e) => {
                error!("Generation {} failed: {}", task_id, e);
                if let Some(deduction) = &deduction {
                    self.refund(deduction).await;
                }
                self.deps.records.record_task(TaskRecord {
                    id: task_id,
                    owner_id: account_id.map(str::to_string),
                    character_id: request.character_id.clone(),
                    flavor: request.flavor.as_str().to_string(),
                    prompt: composed.prompt,
                    negative_prompt: composed.negative_prompt,
                    model: prepared.model.name.clone(),
                    status: TaskState::Failed,
                    image_urls: Vec::new(),
                    cost: 0,
                    error: Some(e.to_string()),
                    created_at: chrono::Utc::now().to_rfc3339(),
                });
                return Err(e.into());
            }
        };

        let chain = self.post_process_chain(request.flavor, profile.as_ref()).await;
        let processed = chain.run(generated.image).await;

        let persisted = self
            .deps
            .sink
            .persist_image(&processed.image, request.flavor.folder())
            .await;

        let now = chrono::Utc::now().to_rfc3339();
        let cost = deduction.as_ref().map(|d| d.amount).unwrap_or(0);

        self.deps.records.record_task(TaskRecord {
            id: task_id.clone(),
            owner_id: account_id.map(str::to_string),
            character_id: request.character_id.clone(),
            flavor: request.flavor.as_str().to_string(),
            prompt: composed.prompt.clone(),
            negative_prompt: composed.negative_prompt,
            model: generated.model.clone(),
            status: TaskState::Completed,
            image_urls: vec![persisted.url.clone()],
            cost,
            error: None,
            created_at: now.clone(),
        });

        if let Some(owner) = account_id {
            self.deps.records.record_asset(AssetRecord {
                id: uuid::Uuid::new_v4().to_string(),
                task_id: task_id.clone(),
                owner_id: owner.to_string(),
                character_id: request.character_id.clone(),
                url: persisted.url.clone(),
                prompt: composed.prompt,
                model: generated.model.clone(),
                metadata: serde_json::json!({
                    "seed": generated.seed,
                    "width": prepared.width,
                    "height": prepared.height,
                    "flavor": request.flavor.as_str(),
                    "fallback": generated.used_fallback,
                    "durable": persisted.durable,
                    "post_processing": processed.applied,
                }),
                created_at: now,
            });
        }

        info!(
            "Generation {} completed with {} ({} stage(s) skipped)",
            task_id,
            generated.model,
            processed.skipped.len()
        );

        Ok(GenerationOutcome {
            task_id,
            image_url: persisted.url,
            model: generated.model,
            seed: generated.seed,
            used_fallback: generated.used_fallback,
            durable: persisted.durable,
            skipped_stages: processed.skipped,
        })
    }

    fn validate<'a>(&'a self, request: &GenerationRequest) -> Result<Prepared<'a>, PipelineError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() && request.flavor != Flavor::Character {
            return Err(PipelineError::Validation("prompt is required".to_string()));
        }

        let preset = match (request.flavor, &request.preset) {
            (Flavor::StylePreset, Some(id)) => Some(
                self.deps
                    .presets
                    .get(id)
                    .ok_or_else(|| PipelineError::Validation(format!("unknown preset: {}", id)))?,
            ),
            (Flavor::StylePreset, None) => {
                return Err(PipelineError::Validation("preset is required".to_string()))
            }
            _ => None,
        };

        if request.flavor == Flavor::Character && request.character_id.is_none() {
            return Err(PipelineError::Validation("character_id is required".to_string()));
        }

        let init_image = match (request.flavor, request.reference_image.as_deref()) {
            (Flavor::ImageToImage, Some(input)) => Some(ImageRef::from_input(input).ok_or_else(|| {
                PipelineError::Validation("reference_image must be an http(s) or data URL".to_string())
            })?),
            (Flavor::ImageToImage, None) => {
                return Err(PipelineError::Validation("reference_image is required".to_string()))
            }
            _ => None,
        };

        if let Some(strength) = request.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(PipelineError::Validation(
                    "strength must be between 0 and 1".to_string(),
                ));
            }
        }

        let style = match (preset, request.style.as_deref()) {
            (Some(preset), _) => preset.style,
            (None, Some(s)) => Style::parse(s)
                .ok_or_else(|| PipelineError::Validation(format!("unknown style: {}", s)))?,
            (None, None) => Style::default(),
        };

        let model_name = request
            .model
            .as_deref()
            .unwrap_or_else(|| self.deps.catalog.default_for(style));
        let model = self
            .deps
            .catalog
            .get(model_name)
            .ok_or_else(|| PipelineError::Validation(format!("unknown model: {}", model_name)))?;

        let width = request.width.unwrap_or(DEFAULT_WIDTH);
        let height = request.height.unwrap_or(DEFAULT_HEIGHT);
        validate_dimensions(model, width, height)?;

        Ok(Prepared {
            model,
            style,
            preset,
            width,
            height,
            init_image,
        })
    }

    /// Fallback route, if the caller may use it and it has a key
    async fn fallback_route(
        &self,
        caller: Option<&Caller>,
        primary: &ModelSpec,
        prompt: &str,
        prepared: &Prepared<'_>,
    ) -> Option<Route> {
        let model = self.deps.catalog.fallback_for(primary)?;

        if !self.deps.gate.check(caller, model, prompt).is_allowed() {
            debug!("Fallback {} not permitted for this caller", model.name);
            return None;
        }
        if prepared.init_image.is_some() && model.provider == ProviderKind::OpenAiCompat {
            debug!("Fallback {} cannot do image-to-image", model.name);
            return None;
        }

        let key = self.deps.credentials.resolve_optional(model.provider).await?;
        Some(Route {
            model: model.clone(),
            key,
        })
    }

    async fn snapshot(
        &self,
        id: &str,
        account_id: Option<&str>,
    ) -> Result<EntityProfile, PipelineError> {
        match self.deps.characters.snapshot(id, account_id).await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => Err(PipelineError::Validation(format!("character not found: {}", id))),
            Err(e) => Err(PipelineError::Internal(e.to_string())),
        }
    }

    /// Deduct the flavor's cost; free flavors leave the ledger alone
    async fn charge(&self, caller: &Caller, flavor: Flavor) -> Result<Option<Deduction>, PipelineError> {
        let cost = flavor.cost(&self.deps.costs);
        if cost == 0 {
            debug!("{} is free; nothing to charge", flavor.as_str());
            return Ok(None);
        }
        self.deps
            .credits
            .deduct(&caller.account_id, cost, &format!("generation:{}", flavor.as_str()))
            .await
            .map_err(|e| match e {
                CreditError::Insufficient { balance, required } => {
                    PipelineError::InsufficientCredits { balance, required }
                }
                other => PipelineError::Internal(other.to_string()),
            })
            .map(Some)
    }

    async fn refund(&self, deduction: &Deduction) {
        match self
            .deps
            .credits
            .refund(deduction, "refund: generation failed")
            .await
        {
            Ok(balance) => info!(
                "Refunded {} credits to {} (balance {})",
                deduction.amount, deduction.account_id, balance
            ),
            Err(e) => error!("Refund for {} failed: {}", deduction.account_id, e),
        }
    }

    async fn user_text(&self, request: &GenerationRequest, caller: Option<&Caller>) -> String {
        let text = request.prompt.trim();
        let enhance = request.enhance.unwrap_or(self.deps.enhance_by_default);

        match (&self.deps.enhancer, enhance, text.is_empty()) {
            (Some(enhancer), true, false) => {
                let key = self
                    .deps
                    .credentials
                    .resolve_optional(ProviderKind::OpenAiCompat)
                    .await;
                let account = caller.map(|c| c.account_id.as_str()).unwrap_or("anonymous");
                enhancer.enhance(key.as_ref(), account, text).await
            }
            _ => text.to_string(),
        }
    }

    async fn post_process_chain(
        &self,
        flavor: Flavor,
        profile: Option<&EntityProfile>,
    ) -> PostProcessChain {
        let mut chain = PostProcessChain::new();

        if flavor != Flavor::Character {
            return chain;
        }
        let Some(face_url) = profile.and_then(|p| p.face_image_url.as_deref()) else {
            return chain;
        };
        let Some(provider) = &self.deps.face_swap else {
            warn!("Face reference present but no face-swap provider configured");
            return chain;
        };
        let Some(face) = ImageRef::from_input(face_url) else {
            warn!("Ignoring unusable face reference {}", face_url);
            return chain;
        };

        let key = self
            .deps
            .credentials
            .resolve_optional(ProviderKind::Novita)
            .await;
        chain.push(Box::new(FaceSwapStage::new(provider.clone(), key, face)));
        chain
    }
}

fn credential_error(e: CredentialError) -> PipelineError {
    error!("Generation credentials unavailable: {}", e);
    PipelineError::Internal("image generation is not configured".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Plan as AccountPlan;
    use crate::credentials::ApiKey;
    use crate::db::test_utils::{insert_account, test_pool};
    use crate::providers::{ImageJob, ImageProvider, ProviderError, Submission, TaskStatus};
    use crate::storage::{ImageStore, ObjectStorage, StorageError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sqlx::SqlitePool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Image provider that always answers the same way
    struct FakeImages {
        fail: bool,
        submits: AtomicUsize,
        jobs: Mutex<Vec<ImageJob>>,
    }

    impl FakeImages {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                submits: AtomicUsize::new(0),
                jobs: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageProvider for FakeImages {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn submit(&self, _key: &ApiKey, job: &ImageJob) -> Result<Submission, ProviderError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            self.jobs.lock().push(job.clone());
            if self.fail {
                return Err(ProviderError::Api("status 500".to_string()));
            }
            Ok(Submission::Ready(ImageRef::Bytes {
                data: format!("image-{}", job.seed).into_bytes(),
                mime_type: "image/jpeg".to_string(),
            }))
        }

        async fn poll(&self, _key: &ApiKey, _task_id: &str) -> Result<TaskStatus, ProviderError> {
            Err(ProviderError::Unsupported("fake polling"))
        }
    }

    struct FailingSwap {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FaceSwapProvider for FailingSwap {
        async fn swap_face(
            &self,
            _key: &ApiKey,
            _face: &ImageRef,
            _target: &ImageRef,
        ) -> Result<ImageRef, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Api("status 503".to_string()))
        }
    }

    struct BrokenStorage;

    #[async_trait]
    impl ObjectStorage for BrokenStorage {
        async fn put(&self, _folder: &str, _data: &[u8], _mime: &str) -> Result<String, StorageError> {
            Err(StorageError::Fetch("bucket unavailable".to_string()))
        }
    }

    struct Harness {
        pipeline: Pipeline,
        pool: SqlitePool,
        records: RecordWriter,
        novita: Arc<FakeImages>,
        openai: Arc<FakeImages>,
    }

    async fn harness_with(
        novita: Arc<FakeImages>,
        openai: Arc<FakeImages>,
        storage: Option<Arc<dyn ObjectStorage>>,
        face_swap: Option<Arc<dyn FaceSwapProvider>>,
    ) -> Harness {
        harness_priced(novita, openai, storage, face_swap, CostSettings::default()).await
    }

    async fn harness_priced(
        novita: Arc<FakeImages>,
        openai: Arc<FakeImages>,
        storage: Option<Arc<dyn ObjectStorage>>,
        face_swap: Option<Arc<dyn FaceSwapProvider>>,
        costs: CostSettings,
    ) -> Harness {
        let pool = test_pool().await;
        let (records, _handle) = RecordWriter::spawn(pool.clone(), 1);
        let storage: Arc<dyn ObjectStorage> = match storage {
            Some(storage) => storage,
            None => Arc::new(ImageStore::new(pool.clone(), "http://localhost:8080")),
        };

        let generation = GenerationClient::new(Duration::from_millis(1), 3, Duration::from_secs(5))
            .with_provider(ProviderKind::Novita, novita.clone())
            .with_provider(ProviderKind::OpenAiCompat, openai.clone());

        let deps = PipelineDeps {
            catalog: ModelCatalog::new(),
            presets: PresetRegistry::new(),
            gate: AccessGate::with_keywords(false),
            credentials: CredentialResolver::with_env_lookup(pool.clone(), |_| Some("test-key".to_string())),
            credits: CreditLedger::new(pool.clone()),
            characters: CharacterStore::new(pool.clone()),
            compositor: PromptCompositor::new(1000),
            enhancer: None,
            enhance_by_default: false,
            generation,
            face_swap,
            sink: PersistenceSink::new(storage, reqwest::Client::new()),
            records: records.clone(),
            costs,
        };

        Harness {
            pipeline: Pipeline::new(deps),
            pool,
            records,
            novita,
            openai,
        }
    }

    async fn harness() -> Harness {
        harness_with(FakeImages::new(false), FakeImages::new(false), None, None).await
    }

    async fn funded_caller(h: &Harness, plan: AccountPlan, credits: i64) -> Caller {
        let id = insert_account(&h.pool, &uuid::Uuid::new_v4().to_string(), plan.as_str()).await;
        CreditLedger::new(h.pool.clone())
            .grant(&id, credits, "test")
            .await
            .unwrap();
        Caller::new(&id, plan)
    }

    #[tokio::test]
    async fn test_premium_text_to_image() {
        let h = harness().await;
        let caller = funded_caller(&h, AccountPlan::Premium, 50).await;

        let mut request = GenerationRequest::new(Flavor::TextToImage, "a woman in a park");
        request.style = Some("realistic".to_string());
        let outcome = h.pipeline.run(Some(&caller), request).await.unwrap();

        assert!(!outcome.image_url.is_empty());
        assert!(outcome.durable);
        assert!(!outcome.is_degraded());
        assert_eq!(h.novita.calls() + h.openai.calls(), 1);

        let job = h.novita.jobs.lock()[0].clone();
        assert!(job.prompt.contains("a woman in a park"));
        assert!(job.negative_prompt.contains("bad anatomy"));
        assert!(job.negative_prompt.contains("lowres"));

        let balance = CreditLedger::new(h.pool.clone())
            .get_balance(&caller.account_id)
            .await
            .unwrap();
        assert_eq!(balance, 45);

        h.records.flush().await;
        let (status,): (String,) = sqlx::query_as("SELECT status FROM generation_tasks WHERE id = ?")
            .bind(&outcome.task_id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn test_free_plan_on_premium_model_never_generates() {
        let h = harness().await;
        let caller = funded_caller(&h, AccountPlan::Free, 50).await;

        let mut request = GenerationRequest::new(Flavor::TextToImage, "a woman in a park");
        request.model = Some("flux-pro".to_string());
        let err = h.pipeline.run(Some(&caller), request).await.unwrap_err();

        assert!(matches!(err, PipelineError::Entitlement { .. }));
        assert!(err.upgrade_required());
        assert_eq!(h.novita.calls() + h.openai.calls(), 0);

        // Nothing charged
        let balance = CreditLedger::new(h.pool.clone())
            .get_balance(&caller.account_id)
            .await
            .unwrap();
        assert_eq!(balance, 50);
    }

    #[tokio::test]
    async fn test_anonymous_is_unauthenticated() {
        let h = harness().await;
        let err = h
            .pipeline
            .run(None, GenerationRequest::new(Flavor::TextToImage, "a cat"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(h.novita.calls(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_credits_before_provider_call() {
        let h = harness().await;
        let caller = funded_caller(&h, AccountPlan::Premium, 2).await;

        let err = h
            .pipeline
            .run(Some(&caller), GenerationRequest::new(Flavor::TextToImage, "a cat"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientCredits {
                balance: 2,
                required: 5
            }
        ));
        assert!(err.upgrade_required());
        assert_eq!(h.novita.calls(), 0);
    }

    #[tokio::test]
    async fn test_free_flavor_skips_the_ledger() {
        let costs = CostSettings {
            text_to_image: 0,
            ..CostSettings::default()
        };
        let h = harness_priced(FakeImages::new(false), FakeImages::new(false), None, None, costs).await;
        let caller = funded_caller(&h, AccountPlan::Free, 10).await;

        let outcome = h
            .pipeline
            .run(Some(&caller), GenerationRequest::new(Flavor::TextToImage, "a cat"))
            .await
            .unwrap();
        assert_eq!(h.novita.calls() + h.openai.calls(), 1);

        let ledger = CreditLedger::new(h.pool.clone());
        assert_eq!(ledger.get_balance(&caller.account_id).await.unwrap(), 10);
        // Only the opening grant
        assert_eq!(ledger.history(&caller.account_id, 10).await.unwrap().len(), 1);

        h.records.flush().await;
        let (cost,): (i64,) = sqlx::query_as("SELECT cost FROM generation_tasks WHERE id = ?")
            .bind(&outcome.task_id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(cost, 0);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness().await;
        let caller = funded_caller(&h, AccountPlan::Ultimate, 50).await;

        let cases = [
            GenerationRequest::new(Flavor::TextToImage, "   "),
            {
                let mut r = GenerationRequest::new(Flavor::TextToImage, "cat");
                r.model = Some("nope".to_string());
                r
            },
            {
                let mut r = GenerationRequest::new(Flavor::TextToImage, "cat");
                r.width = Some(100);
                r
            },
            GenerationRequest::new(Flavor::ImageToImage, "cat"),
            GenerationRequest::new(Flavor::StylePreset, "cat"),
            GenerationRequest::new(Flavor::Character, "cat"),
        ];

        for request in cases {
            let err = h.pipeline.run(Some(&caller), request).await.unwrap_err();
            assert!(matches!(err, PipelineError::Validation(_)), "got {:?}", err);
        }
        assert_eq!(h.novita.calls() + h.openai.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_fallback_then_refund() {
        let h = harness_with(FakeImages::new(true), FakeImages::new(true), None, None).await;
        let caller = funded_caller(&h, AccountPlan::Premium, 50).await;

        let err = h
            .pipeline
            .run(Some(&caller), GenerationRequest::new(Flavor::TextToImage, "a cat"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Provider(_)));

        // realistic-xl once, flux-schnell once
        assert_eq!(h.novita.calls(), 1);
        assert_eq!(h.openai.calls(), 1);

        let balance = CreditLedger::new(h.pool.clone())
            .get_balance(&caller.account_id)
            .await
            .unwrap();
        assert_eq!(balance, 50);

        h.records.flush().await;
        let (status, error): (String, Option<String>) =
            sqlx::query_as("SELECT status, error FROM generation_tasks WHERE owner_id = ?")
                .bind(&caller.account_id)
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(status, "failed");
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn test_fallback_success() {
        let h = harness_with(FakeImages::new(true), FakeImages::new(false), None, None).await;
        let caller = funded_caller(&h, AccountPlan::Free, 50).await;

        let outcome = h
            .pipeline
            .run(Some(&caller), GenerationRequest::new(Flavor::TextToImage, "a cat"))
            .await
            .unwrap();
        assert!(outcome.used_fallback);
        assert_eq!(outcome.model, "flux-schnell");
    }

    #[tokio::test]
    async fn test_upload_failure_returns_provider_image() {
        let h = harness_with(
            FakeImages::new(false),
            FakeImages::new(false),
            Some(Arc::new(BrokenStorage)),
            None,
        )
        .await;
        let caller = funded_caller(&h, AccountPlan::Free, 50).await;

        let outcome = h
            .pipeline
            .run(Some(&caller), GenerationRequest::new(Flavor::TextToImage, "a cat"))
            .await
            .unwrap();
        assert!(!outcome.durable);
        assert!(outcome.image_url.starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn test_face_swap_failure_is_degraded_success() {
        let swap = Arc::new(FailingSwap {
            calls: AtomicUsize::new(0),
        });
        let h = harness_with(
            FakeImages::new(false),
            FakeImages::new(false),
            None,
            Some(swap.clone()),
        )
        .await;
        let caller = funded_caller(&h, AccountPlan::Premium, 50).await;

        let mut profile = EntityProfile::new("Mira", Some(&caller.account_id));
        profile.traits.hair = Some("silver".to_string());
        profile.face_image_url = Some("https://cdn.example.com/mira.png".to_string());
        CharacterStore::new(h.pool.clone()).create(&profile).await.unwrap();

        let mut request = GenerationRequest::new(Flavor::Character, "reading in a cafe");
        request.character_id = Some(profile.id.clone());
        let outcome = h.pipeline.run(Some(&caller), request).await.unwrap();

        assert!(outcome.is_degraded());
        assert_eq!(outcome.skipped_stages[0].stage, "face_swap");
        assert_eq!(swap.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.durable);

        let job = h.novita.jobs.lock()[0].clone();
        assert!(job.prompt.contains("Mira"));
        assert!(job.prompt.contains("silver hair"));
    }

    #[tokio::test]
    async fn test_character_snapshot_is_fresh() {
        let h = harness().await;
        let caller = funded_caller(&h, AccountPlan::Premium, 50).await;
        let store = CharacterStore::new(h.pool.clone());

        let mut profile = EntityProfile::new("Mira", Some(&caller.account_id));
        profile.traits.hair = Some("silver".to_string());
        store.create(&profile).await.unwrap();

        profile.traits.hair = Some("auburn".to_string());
        store.update(&profile).await.unwrap();

        let mut request = GenerationRequest::new(Flavor::Character, "");
        request.character_id = Some(profile.id.clone());
        h.pipeline.run(Some(&caller), request).await.unwrap();

        let job = h.novita.jobs.lock()[0].clone();
        assert!(job.prompt.contains("auburn hair"));
        assert!(!job.prompt.contains("silver"));
    }

    #[tokio::test]
    async fn test_private_character_of_someone_else() {
        let h = harness().await;
        let owner = funded_caller(&h, AccountPlan::Premium, 50).await;
        let other = funded_caller(&h, AccountPlan::Premium, 50).await;

        let profile = EntityProfile::new("Mira", Some(&owner.account_id));
        CharacterStore::new(h.pool.clone()).create(&profile).await.unwrap();

        let mut request = GenerationRequest::new(Flavor::Character, "smiling");
        request.character_id = Some(profile.id.clone());
        let err = h.pipeline.run(Some(&other), request).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(h.novita.calls(), 0);
    }

    #[tokio::test]
    async fn test_style_preset() {
        let h = harness().await;
        let caller = funded_caller(&h, AccountPlan::Free, 50).await;

        let mut request = GenerationRequest::new(Flavor::StylePreset, "a knight");
        request.preset = Some("anime-key-visual".to_string());
        let outcome = h.pipeline.run(Some(&caller), request).await.unwrap();
        assert_eq!(outcome.model, "anime-xl");

        let job = h.novita.jobs.lock()[0].clone();
        assert!(job.prompt.contains("anime key visual"));
        assert!(job.negative_prompt.contains("3d render"));
    }
}
