//! Post-processing chain
//!
//! Stages run in order over a generated image. A stage that fails ends the
//! chain: the image from the last good stage is kept and every stage that
//! did not run is reported as skipped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::credentials::ApiKey;
use crate::providers::{FaceSwapProvider, ImageRef, ProviderError};

/// Post-processing stage errors
#[derive(Debug, Error)]
pub enum StageError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// One step in the chain
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, image: ImageRef) -> Result<ImageRef, StageError>;
}

/// A stage that did not contribute to the final image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedStage {
    pub stage: String,
    pub reason: String,
}

/// Result of running the chain
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub image: ImageRef,
    pub applied: Vec<&'static str>,
    pub skipped: Vec<SkippedStage>,
}

impl ChainOutcome {
    /// Whether any stage was skipped
    pub fn is_degraded(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Ordered list of post-processors
#[derive(Default)]
pub struct PostProcessChain {
    stages: Vec<Box<dyn PostProcessor>>,
}

impl PostProcessChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Box<dyn PostProcessor>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage; never fails
    pub async fn run(&self, image: ImageRef) -> ChainOutcome {
        let mut current = image;
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        let mut stages = self.stages.iter();
        for stage in stages.by_ref() {
            match stage.apply(current.clone()).await {
                Ok(next) => {
                    info!("Post-process stage {} applied", stage.name());
                    current = next;
                    applied.push(stage.name());
                }
                Err(e) => {
                    warn!("Post-process stage {} failed: {}", stage.name(), e);
                    skipped.push(SkippedStage {
                        stage: stage.name().to_string(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        for stage in stages {
            skipped.push(SkippedStage {
                stage: stage.name().to_string(),
                reason: "earlier stage failed".to_string(),
            });
        }

        ChainOutcome {
            image: current,
            applied,
            skipped,
        }
    }
}

/// Swap a reference face onto the generated image
pub struct FaceSwapStage {
    provider: Arc<dyn FaceSwapProvider>,
    key: Option<ApiKey>,
    face: ImageRef,
}

impl FaceSwapStage {
    pub fn new(provider: Arc<dyn FaceSwapProvider>, key: Option<ApiKey>, face: ImageRef) -> Self {
        Self {
            provider,
            key,
            face,
        }
    }
}

#[async_trait]
impl PostProcessor for FaceSwapStage {
    fn name(&self) -> &'static str {
        "face_swap"
    }

    async fn apply(&self, image: ImageRef) -> Result<ImageRef, StageError> {
        let key = self.key.as_ref().ok_or(StageError::MissingCredentials)?;
        Ok(self.provider.swap_face(key, &self.face, &image).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Suffix {
        name: &'static str,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PostProcessor for Suffix {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, image: ImageRef) -> Result<ImageRef, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StageError::Provider(ProviderError::Api("status 500".to_string())));
            }
            Ok(ImageRef::Url(format!("{}+{}", image.to_url(), self.name)))
        }
    }

    struct FailingSwap;

    #[async_trait]
    impl FaceSwapProvider for FailingSwap {
        async fn swap_face(
            &self,
            _key: &ApiKey,
            _face: &ImageRef,
            _target: &ImageRef,
        ) -> Result<ImageRef, ProviderError> {
            Err(ProviderError::Api("status 503".to_string()))
        }
    }

    fn stage(name: &'static str, fail: bool, calls: &Arc<AtomicUsize>) -> Box<dyn PostProcessor> {
        Box::new(Suffix {
            name,
            fail,
            calls: calls.clone(),
        })
    }

    #[tokio::test]
    async fn test_all_stages_apply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PostProcessChain::new();
        chain.push(stage("a", false, &calls));
        chain.push(stage("b", false, &calls));

        let outcome = chain.run(ImageRef::Url("img".to_string())).await;
        assert_eq!(outcome.image, ImageRef::Url("img+a+b".to_string()));
        assert_eq!(outcome.applied, vec!["a", "b"]);
        assert!(!outcome.is_degraded());
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PostProcessChain::new();
        chain.push(stage("a", false, &calls));
        chain.push(stage("b", true, &calls));
        chain.push(stage("c", false, &calls));

        let outcome = chain.run(ImageRef::Url("img".to_string())).await;
        assert_eq!(outcome.image, ImageRef::Url("img+a".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(outcome.skipped[0].stage, "b");
        assert_eq!(outcome.skipped[1].reason, "earlier stage failed");
    }

    #[tokio::test]
    async fn test_face_swap_failure_keeps_base_image() {
        let mut chain = PostProcessChain::new();
        chain.push(Box::new(FaceSwapStage::new(
            Arc::new(FailingSwap),
            Some(ApiKey::new("k")),
            ImageRef::Url("face".to_string()),
        )));

        let base = ImageRef::Url("base".to_string());
        let outcome = chain.run(base.clone()).await;
        assert_eq!(outcome.image, base);
        assert_eq!(outcome.skipped[0].stage, "face_swap");
    }

    #[tokio::test]
    async fn test_face_swap_without_key() {
        let stage = FaceSwapStage::new(Arc::new(FailingSwap), None, ImageRef::Url("f".to_string()));
        let err = stage.apply(ImageRef::Url("x".to_string())).await.unwrap_err();
        assert!(matches!(err, StageError::MissingCredentials));
    }
}
