//! Best-effort LLM prompt enhancement
//!
//! Any failure (no key, provider error, timeout, empty answer) yields the
//! original text unchanged.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::credentials::ApiKey;
use crate::providers::{ChatMessage, ChatProvider};

const SYSTEM_PROMPT: &str = r#"You rewrite short image requests into a single detailed visual description for a text-to-image model.
Describe subject, clothing, pose, setting, lighting and camera framing in at most 80 words.
Keep every detail the user gave. Do not invent names, text or watermarks.
Respond with ONLY the description, no explanations or preamble."#;

static THINK_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").unwrap());

static THINK_CLOSE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</think(?:ing)?>").unwrap());

static THINK_OPEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<think(?:ing)?>").unwrap());

/// Remove reasoning markup emitted by "thinking" models
pub fn strip_thinking(text: &str) -> String {
    let without_blocks = THINK_BLOCK_REGEX.replace_all(text, "");
    let mut rest: &str = &without_blocks;

    // Closing tag without opener: everything before it was reasoning
    if let Some(m) = THINK_CLOSE_REGEX.find_iter(rest).last() {
        rest = &rest[m.end()..];
    }
    // Opener without closing tag: everything after it is reasoning
    if let Some(m) = THINK_OPEN_REGEX.find(rest) {
        rest = &rest[..m.start()];
    }

    rest.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

/// Rewrites user prompts through a chat model
pub struct PromptEnhancer {
    chat: Arc<dyn ChatProvider>,
    timeout: Duration,
}

impl PromptEnhancer {
    pub fn new(chat: Arc<dyn ChatProvider>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    /// Enhance `text`, or return it unchanged
    pub async fn enhance(&self, key: Option<&ApiKey>, account_id: &str, text: &str) -> String {
        let Some(key) = key else {
            debug!("Skipping prompt enhancement: no credentials");
            return text.to_string();
        };

        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(text)];

        let result = tokio::time::timeout(self.timeout, self.chat.complete(key, account_id, messages)).await;

        match result {
            Ok(Ok(answer)) => {
                let cleaned = strip_thinking(&answer);
                if cleaned.is_empty() {
                    warn!("Prompt enhancement returned nothing usable");
                    text.to_string()
                } else {
                    debug!("Enhanced prompt: {}", cleaned);
                    cleaned
                }
            }
            Ok(Err(e)) => {
                warn!("Prompt enhancement failed: {}", e);
                text.to_string()
            }
            Err(_) => {
                warn!("Prompt enhancement timed out after {:?}", self.timeout);
                text.to_string()
            }
        }
    }
}
