//! Prompt content classification
//!
//! The gate only depends on [`ContentClassifier`]; the keyword matcher here
//! is the default and can be replaced by a model-backed implementation.

use regex::Regex;
use std::sync::LazyLock;

/// Coarse content category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    /// Nothing notable
    Safe,
    /// Sexual or nude content
    Explicit,
    /// Text asking for a picture ("send me a pic")
    ImageRequest,
}

/// Classifier verdict
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: ContentCategory,
    /// 0.0 ..= 1.0
    pub confidence: f32,
}

impl Classification {
    pub fn safe() -> Self {
        Self {
            category: ContentCategory::Safe,
            confidence: 1.0,
        }
    }
}

/// Pluggable text classifier
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Classification;
}

static EXPLICIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(nude|nudes|naked|nsfw|topless|bottomless|lingerie|explicit|sex|sexy|erotic|porn|undress(ed|ing)?|nipples?|breasts?|genitals?)\b",
    )
    .unwrap()
});

static IMAGE_REQUEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(send|show|share|take)\b.{0,20}\b(pic|pics|picture|pictures|photo|photos|selfie|image)\b",
    )
    .unwrap()
});

/// Keyword-based classifier
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ContentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Classification {
        let mut terms: Vec<String> = EXPLICIT_REGEX
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        terms.sort();
        terms.dedup();

        if !terms.is_empty() {
            // One term is a signal, each extra distinct term adds confidence
            let confidence = (0.5 + 0.25 * (terms.len() - 1) as f32).min(1.0);
            return Classification {
                category: ContentCategory::Explicit,
                confidence,
            };
        }

        if IMAGE_REQUEST_REGEX.is_match(text) {
            return Classification {
                category: ContentCategory::ImageRequest,
                confidence: 0.8,
            };
        }

        Classification::safe()
    }
}
