//! Prompt composition
//!
//! Builds the positive and negative prompt sent to image providers:
//! - style directive and identity lock around the user's text
//! - restriction text, preset negatives and the fixed quality/anatomy/safety
//!   catalogue in the negative prompt
//! - both clamped to a character budget
//!
//! Composition is a pure function of its inputs.

mod enhance;

pub use enhance::{strip_thinking, PromptEnhancer};

use serde::{Deserialize, Serialize};

use crate::catalog::StylePreset;
use crate::characters::EntityProfile;

/// Quality and anatomy terms always present in the negative prompt
pub const BASE_NEGATIVE: &[&str] = &[
    "lowres",
    "worst quality",
    "low quality",
    "jpeg artifacts",
    "blurry",
    "watermark",
    "signature",
    "text",
    "bad anatomy",
    "bad hands",
    "extra fingers",
    "missing fingers",
    "fused fingers",
    "extra limbs",
    "deformed",
    "disfigured",
    "mutated",
];

/// Safety terms always present in the negative prompt
pub const SAFETY_NEGATIVE: &[&str] = &["child", "underage", "minor", "loli"];

/// Rendering style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Realistic,
    Anime,
}

impl Style {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Style> {
        match s.to_lowercase().as_str() {
            "realistic" | "photo" | "photorealistic" => Some(Style::Realistic),
            "anime" | "cartoon" | "manga" => Some(Style::Anime),
            _ => None,
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            Style::Realistic => {
                "photorealistic, RAW photo, natural lighting, detailed skin texture, sharp focus"
            }
            Style::Anime => "anime style, cel shading, clean line art, vibrant colors",
        }
    }

    fn negative(&self) -> &'static [&'static str] {
        match self {
            Style::Realistic => &["cartoon", "anime", "3d render", "illustration", "painting"],
            Style::Anime => &["photorealistic", "photo", "realistic skin texture"],
        }
    }
}

/// Inputs to one composition
#[derive(Debug, Clone, Copy)]
pub struct ComposeInput<'a> {
    pub user_text: &'a str,
    pub profile: Option<&'a EntityProfile>,
    pub style: Style,
    pub preset: Option<&'a StylePreset>,
}

/// Composed prompts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub negative_prompt: String,
}

/// Prompt compositor with a fixed character budget
#[derive(Debug, Clone)]
pub struct PromptCompositor {
    max_chars: usize,
}

impl PromptCompositor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Compose the final prompt and negative prompt
    pub fn compose(&self, input: ComposeInput<'_>) -> ComposedPrompt {
        let head = join_nonempty(&[
            input.style.directive().to_string(),
            input.profile.map(identity_prefix).unwrap_or_default(),
        ]);
        let tail = join_nonempty(&[
            input
                .preset
                .map(|p| p.prompt_fragment.clone())
                .unwrap_or_default(),
            input.profile.map(identity_suffix).unwrap_or_default(),
        ]);

        // The identity lock survives truncation; the user text absorbs the cut
        let reserved = char_len(&head) + char_len(&tail) + 2 * SEPARATOR.len();
        let user = normalize_whitespace(input.user_text);
        let user = clamp_prompt(&user, self.max_chars.saturating_sub(reserved));

        let prompt = clamp_prompt(&join_nonempty(&[head, user, tail]), self.max_chars);

        let mut negatives: Vec<String> = Vec::new();
        if let Some(profile) = input.profile {
            negatives.extend(profile.restrictions());
        }
        if let Some(preset) = input.preset {
            negatives.extend(
                preset
                    .negative_fragment
                    .split(',')
                    .map(|t| t.trim().to_string()),
            );
        }
        negatives.extend(input.style.negative().iter().map(|t| t.to_string()));
        negatives.extend(BASE_NEGATIVE.iter().map(|t| t.to_string()));
        negatives.extend(SAFETY_NEGATIVE.iter().map(|t| t.to_string()));

        let negative_prompt = clamp_prompt(&join_nonempty(&dedup_terms(negatives)), self.max_chars);

        ComposedPrompt {
            prompt,
            negative_prompt,
        }
    }
}

const SEPARATOR: &str = ", ";

fn identity_prefix(profile: &EntityProfile) -> String {
    let t = &profile.traits;
    let parts = [
        Some(profile.name.trim().to_string()),
        t.age.map(|a| format!("{} years old", a)),
        t.ethnicity.clone(),
        t.hair.as_ref().map(|h| format!("{} hair", h)),
        t.eyes.as_ref().map(|e| format!("{} eyes", e)),
        t.skin.as_ref().map(|s| format!("{} skin", s)),
        t.body.clone(),
    ];
    let parts: Vec<String> = parts.into_iter().flatten().collect();
    format!("portrait of {}", join_nonempty(&parts))
}

fn identity_suffix(profile: &EntityProfile) -> String {
    let t = &profile.traits;
    let parts = [
        Some(format!("same person {}", profile.name.trim())),
        t.hair.as_ref().map(|h| format!("{} hair", h)),
        t.eyes.as_ref().map(|e| format!("{} eyes", e)),
        t.skin.as_ref().map(|s| format!("{} skin", s)),
    ];
    let parts: Vec<String> = parts.into_iter().flatten().collect();
    format!("({})", join_nonempty(&parts))
}

fn join_nonempty(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

fn dedup_terms(terms: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Clamp `text` to at most `max_chars` characters
///
/// The cut lands on a char boundary, prefers the last `,` or whitespace in
/// the final fifth of the budget, never leaves a trailing `\` and never
/// leaves a `(` weighting group open.
pub fn clamp_prompt(text: &str, max_chars: usize) -> String {
    if char_len(text) <= max_chars {
        return text.to_string();
    }

    let end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let mut cut = &text[..end];

    let min_keep = max_chars * 4 / 5;
    if let Some((idx, _)) = cut
        .char_indices()
        .skip(min_keep)
        .filter(|(_, c)| *c == ',' || c.is_whitespace())
        .last()
    {
        cut = &cut[..idx];
    }

    let mut depth_starts: Vec<usize> = Vec::new();
    for (i, c) in cut.char_indices() {
        match c {
            '(' => depth_starts.push(i),
            ')' => {
                depth_starts.pop();
            }
            _ => {}
        }
    }
    if let Some(&open) = depth_starts.first() {
        cut = &cut[..open];
    }

    cut.trim_end_matches(|c: char| c == '\\' || c == ',' || c.is_whitespace())
        .to_string()
}
