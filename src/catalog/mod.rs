//! Model and style-preset catalogue
//!
//! Controls:
//! - Which provider serves a model, and under which upstream model name
//! - The plan a caller needs for a model, and whether it accepts NSFW prompts
//! - Minimum output size and fallback routing
//! - Named style presets for the style-preset endpoint

use std::collections::HashMap;

use crate::access::Plan;
use crate::prompt::Style;

/// Upstream provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Novita async task API (txt2img, img2img, merge-face)
    Novita,
    /// OpenAI-compatible synchronous API (images, chat)
    OpenAiCompat,
}

impl ProviderKind {
    /// Environment variable holding this provider's API key
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderKind::Novita => "NOVITA_API_KEY",
            ProviderKind::OpenAiCompat => "OPENAI_COMPAT_API_KEY",
        }
    }

    /// Key of this provider in the `provider_credentials` table
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Novita => "novita",
            ProviderKind::OpenAiCompat => "openai_compat",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<ProviderKind> {
        match s.to_lowercase().as_str() {
            "novita" => Some(ProviderKind::Novita),
            "openai_compat" | "openai" | "venice" => Some(ProviderKind::OpenAiCompat),
            _ => None,
        }
    }
}

/// A generation model offered to callers
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Public model name
    pub name: String,
    /// Provider that serves it
    pub provider: ProviderKind,
    /// Upstream model identifier
    pub provider_model: String,
    /// Lowest plan allowed to use it
    pub min_plan: Plan,
    /// Whether explicit prompts may be sent to it at all
    pub allows_nsfw: bool,
    /// Minimum width * height accepted upstream
    pub min_pixels: u64,
    /// Model to retry once against when this one fails
    pub fallback: Option<String>,
}

impl ModelSpec {
    fn new(name: &str, provider: ProviderKind, provider_model: &str, min_plan: Plan) -> Self {
        Self {
            name: name.to_string(),
            provider,
            provider_model: provider_model.to_string(),
            min_plan,
            allows_nsfw: false,
            min_pixels: 256 * 256,
            fallback: None,
        }
    }

    fn nsfw(mut self) -> Self {
        self.allows_nsfw = true;
        self
    }

    fn min_pixels(mut self, pixels: u64) -> Self {
        self.min_pixels = pixels;
        self
    }

    fn fallback(mut self, name: &str) -> Self {
        self.fallback = Some(name.to_string());
        self
    }

    /// Whether this model is gated behind a paid plan
    pub fn is_premium(&self) -> bool {
        self.min_plan > Plan::Free
    }
}

/// Registry of available models
pub struct ModelCatalog {
    models: HashMap<String, ModelSpec>,
}

impl ModelCatalog {
    /// Create a new catalogue with the built-in models
    pub fn new() -> Self {
        let builtins = [
            ModelSpec::new(
                "realistic-xl",
                ProviderKind::Novita,
                "juggernautXL_v9Rdphoto2Lightning_285361.safetensors",
                Plan::Free,
            )
            .fallback("flux-schnell"),
            ModelSpec::new(
                "anime-xl",
                ProviderKind::Novita,
                "animagineXLV31_v31_325600.safetensors",
                Plan::Free,
            )
            .fallback("flux-schnell"),
            ModelSpec::new("flux-schnell", ProviderKind::OpenAiCompat, "flux-dev", Plan::Free),
            ModelSpec::new(
                "flux-pro",
                ProviderKind::Novita,
                "flux1-dev-fp8.safetensors",
                Plan::Premium,
            )
            .min_pixels(512 * 512)
            .fallback("realistic-xl"),
            ModelSpec::new(
                "uncensored-xl",
                ProviderKind::Novita,
                "lustifySDXLNSFW_v40_447906.safetensors",
                Plan::Premium,
            )
            .nsfw()
            .min_pixels(512 * 512),
            ModelSpec::new(
                "uncensored-pro",
                ProviderKind::Novita,
                "ponyRealism_v22MainVAE_526003.safetensors",
                Plan::Ultimate,
            )
            .nsfw()
            .min_pixels(768 * 768)
            .fallback("uncensored-xl"),
        ];

        let models = builtins
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        Self { models }
    }

    /// Look up a model by public name
    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    /// Default model for a style when the caller names none
    pub fn default_for(&self, style: Style) -> &str {
        match style {
            Style::Realistic => DEFAULT_REALISTIC_MODEL,
            Style::Anime => DEFAULT_ANIME_MODEL,
        }
    }

    /// Model to fall back to, if one is configured and known
    pub fn fallback_for(&self, model: &ModelSpec) -> Option<&ModelSpec> {
        model.fallback.as_deref().and_then(|name| self.get(name))
    }

    /// List all available models
    pub fn list(&self) -> Vec<&ModelSpec> {
        self.models.values().collect()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Default realistic model
pub const DEFAULT_REALISTIC_MODEL: &str = "realistic-xl";

/// Default anime model
pub const DEFAULT_ANIME_MODEL: &str = "anime-xl";

/// A named style preset for the style-preset endpoint
#[derive(Debug, Clone)]
pub struct StylePreset {
    /// Unique identifier
    pub id: String,
    /// Base style the preset renders in
    pub style: Style,
    /// Prompt fragment appended after the user text
    pub prompt_fragment: String,
    /// Extra negative terms for this preset
    pub negative_fragment: String,
}

impl StylePreset {
    /// Soft studio portrait
    pub fn studio_portrait() -> Self {
        Self {
            id: "studio-portrait".to_string(),
            style: Style::Realistic,
            prompt_fragment: "studio portrait, softbox lighting, shallow depth of field, 85mm lens"
                .to_string(),
            negative_fragment: "harsh shadows, overexposed".to_string(),
        }
    }

    /// Film photography look
    pub fn cinematic() -> Self {
        Self {
            id: "cinematic".to_string(),
            style: Style::Realistic,
            prompt_fragment: "cinematic still, anamorphic, film grain, teal and orange grading"
                .to_string(),
            negative_fragment: "flat lighting, oversaturated".to_string(),
        }
    }

    /// Cel-shaded anime key visual
    pub fn anime_key_visual() -> Self {
        Self {
            id: "anime-key-visual".to_string(),
            style: Style::Anime,
            prompt_fragment: "anime key visual, dynamic composition, detailed background".to_string(),
            negative_fragment: "3d render, photorealistic".to_string(),
        }
    }
}

/// Registry of available style presets
pub struct PresetRegistry {
    presets: HashMap<String, StylePreset>,
}

impl PresetRegistry {
    /// Create a new registry with built-in presets
    pub fn new() -> Self {
        let presets = [
            StylePreset::studio_portrait(),
            StylePreset::cinematic(),
            StylePreset::anime_key_visual(),
        ]
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

        Self { presets }
    }

    /// Get a preset by ID
    pub fn get(&self, id: &str) -> Option<&StylePreset> {
        self.presets.get(id)
    }

    /// List all available presets
    pub fn list(&self) -> Vec<&StylePreset> {
        self.presets.values().collect()
    }
}

impl Default for PresetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_exist() {
        let catalog = ModelCatalog::new();
        for style in [Style::Realistic, Style::Anime] {
            let name = catalog.default_for(style);
            let model = catalog.get(name).unwrap();
            assert_eq!(model.min_plan, Plan::Free);
        }
    }

    #[test]
    fn test_default_matches_new() {
        assert_eq!(ModelCatalog::default().list().len(), ModelCatalog::new().list().len());
        assert!(PresetRegistry::default().get("cinematic").is_some());
    }

    #[test]
    fn test_fallbacks_resolve() {
        let catalog = ModelCatalog::new();
        for model in catalog.list() {
            if model.fallback.is_some() {
                let fallback = catalog.fallback_for(model);
                assert!(fallback.is_some(), "dangling fallback on {}", model.name);
                assert_ne!(fallback.unwrap().name, model.name);
            }
        }
    }

    #[test]
    fn test_premium_flags() {
        let catalog = ModelCatalog::new();
        assert!(!catalog.get("realistic-xl").unwrap().is_premium());
        assert!(catalog.get("flux-pro").unwrap().is_premium());
        assert!(catalog.get("uncensored-xl").unwrap().allows_nsfw);
        assert!(!catalog.get("flux-pro").unwrap().allows_nsfw);
        assert!(catalog.get("does-not-exist").is_none());
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!(ProviderKind::parse("NOVITA"), Some(ProviderKind::Novita));
        assert_eq!(ProviderKind::parse("venice"), Some(ProviderKind::OpenAiCompat));
        assert_eq!(ProviderKind::parse("other"), None);
        assert_eq!(ProviderKind::Novita.env_var(), "NOVITA_API_KEY");
    }

    #[test]
    fn test_preset_registry() {
        let registry = PresetRegistry::new();
        assert_eq!(registry.list().len(), 3);
        let preset = registry.get("anime-key-visual").unwrap();
        assert_eq!(preset.style, Style::Anime);
        assert!(registry.get("unknown").is_none());
    }
}
