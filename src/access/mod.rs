//! Entitlement checks for generation requests
//!
//! Check order (first denial wins):
//! 1. Anonymous callers: premium models always denied, free models only
//!    when anonymous generation is enabled
//! 2. Plan check: caller's plan must be at least the model's `min_plan`
//! 3. Content check: prompts classified as explicit need an NSFW-capable
//!    model, a plan that includes NSFW, and the caller's own opt-in
//!
//! The gate is read-only. Every denial carries a user-facing reason and an
//! `upgrade_required` flag so clients can route to billing without
//! string-matching.

mod classifier;

pub use classifier::{Classification, ContentCategory, ContentClassifier, KeywordClassifier};

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::ModelSpec;

/// Minimum classifier confidence treated as explicit
pub const EXPLICIT_THRESHOLD: f32 = 0.5;

/// Subscription plans, ordered by entitlement
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Plan {
    /// No subscription
    #[default]
    Free = 0,
    /// Paid tier: premium models, NSFW content
    Premium = 1,
    /// Top tier: every model
    Ultimate = 2,
}

/// A plan name no tier answers to
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "premium" | "pro" => Ok(Plan::Premium),
            "ultimate" => Ok(Plan::Ultimate),
            _ => Err(UnknownPlan(s.to_string())),
        }
    }
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Premium => "premium",
            Plan::Ultimate => "ultimate",
        }
    }

    /// Check if this plan includes explicit content
    pub fn allows_nsfw(&self) -> bool {
        *self >= Plan::Premium
    }
}

/// Authenticated caller as seen by the gate
#[derive(Debug, Clone)]
pub struct Caller {
    pub account_id: String,
    pub plan: Plan,
    /// Caller opted in to explicit content
    pub nsfw_enabled: bool,
}

impl Caller {
    pub fn new(account_id: &str, plan: Plan) -> Self {
        Self {
            account_id: account_id.to_string(),
            plan,
            nsfw_enabled: false,
        }
    }

    pub fn with_nsfw(mut self) -> Self {
        self.nsfw_enabled = true;
        self
    }
}

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    /// No session, and the request needs one
    Unauthenticated,
    /// Plan does not include the model
    Plan,
    /// Prompt content not permitted
    Content,
}

/// A denial with its user-facing reason
#[derive(Debug, Clone)]
pub struct Denial {
    pub kind: DenialKind,
    pub reason: String,
    pub upgrade_required: bool,
}

/// Result of a gate check
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Request may proceed
    Allow,
    /// Request denied
    Deny(Denial),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }

    fn deny(kind: DenialKind, reason: impl Into<String>, upgrade_required: bool) -> Self {
        GateDecision::Deny(Denial {
            kind,
            reason: reason.into(),
            upgrade_required,
        })
    }
}

/// Access gate for generation requests
pub struct AccessGate {
    classifier: Arc<dyn ContentClassifier>,
    allow_anonymous: bool,
}

impl AccessGate {
    /// Create a gate with the given classifier
    pub fn new(classifier: Arc<dyn ContentClassifier>, allow_anonymous: bool) -> Self {
        Self {
            classifier,
            allow_anonymous,
        }
    }

    /// Create a gate using the keyword classifier
    pub fn with_keywords(allow_anonymous: bool) -> Self {
        Self::new(Arc::new(KeywordClassifier::new()), allow_anonymous)
    }

    /// Check whether `caller` may run `prompt` against `model`
    pub fn check(&self, caller: Option<&Caller>, model: &ModelSpec, prompt: &str) -> GateDecision {
        let Some(caller) = caller else {
            if model.is_premium() {
                return GateDecision::deny(
                    DenialKind::Unauthenticated,
                    format!("Sign in to use {}", model.name),
                    false,
                );
            }
            if !self.allow_anonymous {
                return GateDecision::deny(
                    DenialKind::Unauthenticated,
                    "Sign in to generate images",
                    false,
                );
            }
            return self.check_content(None, model, prompt);
        };

        if caller.plan < model.min_plan {
            debug!(
                "Plan denial: {} on {} needs {}",
                caller.account_id,
                model.name,
                model.min_plan.as_str()
            );
            return GateDecision::deny(
                DenialKind::Plan,
                format!(
                    "{} requires the {} plan",
                    model.name,
                    model.min_plan.as_str()
                ),
                true,
            );
        }

        self.check_content(Some(caller), model, prompt)
    }

    fn check_content(
        &self,
        caller: Option<&Caller>,
        model: &ModelSpec,
        prompt: &str,
    ) -> GateDecision {
        let classification = self.classifier.classify(prompt);
        if classification.category != ContentCategory::Explicit
            || classification.confidence < EXPLICIT_THRESHOLD
        {
            return GateDecision::Allow;
        }

        match caller {
            None => GateDecision::deny(
                DenialKind::Content,
                "Explicit content requires a premium account",
                true,
            ),
            Some(c) if !c.plan.allows_nsfw() => GateDecision::deny(
                DenialKind::Content,
                "Explicit content requires a premium plan",
                true,
            ),
            Some(c) if !c.nsfw_enabled => GateDecision::deny(
                DenialKind::Content,
                "Enable explicit content in your settings first",
                false,
            ),
            Some(_) if !model.allows_nsfw => GateDecision::deny(
                DenialKind::Content,
                format!("{} does not accept explicit prompts", model.name),
                false,
            ),
            Some(_) => GateDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;

    fn gate() -> AccessGate {
        AccessGate::with_keywords(false)
    }

    fn deny_of(decision: GateDecision) -> Denial {
        match decision {
            GateDecision::Deny(d) => d,
            GateDecision::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn test_plan_parsing() {
        assert_eq!(Plan::from_str("premium"), Ok(Plan::Premium));
        assert_eq!(Plan::from_str("ULTIMATE"), Ok(Plan::Ultimate));
        assert_eq!(
            Plan::from_str("mystery"),
            Err(UnknownPlan("mystery".to_string()))
        );
        assert!(Plan::Ultimate > Plan::Premium);
        assert!(!Plan::Free.allows_nsfw());
    }

    #[test]
    fn test_free_plan_premium_model_denied() {
        let catalog = ModelCatalog::new();
        let caller = Caller::new("acct", Plan::Free);
        let denial = deny_of(gate().check(
            Some(&caller),
            catalog.get("flux-pro").unwrap(),
            "a woman in a park",
        ));
        assert_eq!(denial.kind, DenialKind::Plan);
        assert!(denial.upgrade_required);
        assert!(denial.reason.contains("premium"));
    }

    #[test]
    fn test_premium_plan_allowed() {
        let catalog = ModelCatalog::new();
        let caller = Caller::new("acct", Plan::Premium);
        assert!(gate()
            .check(
                Some(&caller),
                catalog.get("flux-pro").unwrap(),
                "a woman in a park"
            )
            .is_allowed());
    }

    #[test]
    fn test_anonymous_denials() {
        let catalog = ModelCatalog::new();
        let premium = deny_of(gate().check(None, catalog.get("flux-pro").unwrap(), "a park"));
        assert_eq!(premium.kind, DenialKind::Unauthenticated);

        let free = deny_of(gate().check(None, catalog.get("realistic-xl").unwrap(), "a park"));
        assert_eq!(free.kind, DenialKind::Unauthenticated);

        let open = AccessGate::with_keywords(true);
        assert!(open
            .check(None, catalog.get("realistic-xl").unwrap(), "a park")
            .is_allowed());
        assert!(!open
            .check(None, catalog.get("flux-pro").unwrap(), "a park")
            .is_allowed());
    }

    #[test]
    fn test_explicit_prompt_rules() {
        let catalog = ModelCatalog::new();
        let nsfw_model = catalog.get("uncensored-xl").unwrap();
        let prompt = "nude woman on a bed";

        let free = Caller::new("a", Plan::Free);
        let denial = deny_of(gate().check(Some(&free), catalog.get("realistic-xl").unwrap(), prompt));
        assert_eq!(denial.kind, DenialKind::Content);
        assert!(denial.upgrade_required);

        let not_opted_in = Caller::new("b", Plan::Premium);
        let denial = deny_of(gate().check(Some(&not_opted_in), nsfw_model, prompt));
        assert!(!denial.upgrade_required);

        let opted_in = Caller::new("c", Plan::Premium).with_nsfw();
        let denial = deny_of(gate().check(Some(&opted_in), catalog.get("flux-pro").unwrap(), prompt));
        assert_eq!(denial.kind, DenialKind::Content);

        assert!(gate().check(Some(&opted_in), nsfw_model, prompt).is_allowed());
    }

    struct AlwaysExplicit;

    impl ContentClassifier for AlwaysExplicit {
        fn classify(&self, _text: &str) -> Classification {
            Classification {
                category: ContentCategory::Explicit,
                confidence: 0.9,
            }
        }
    }

    #[test]
    fn test_classifier_is_pluggable() {
        let catalog = ModelCatalog::new();
        let gate = AccessGate::new(Arc::new(AlwaysExplicit), false);
        let caller = Caller::new("acct", Plan::Free);
        let denial = deny_of(gate.check(
            Some(&caller),
            catalog.get("realistic-xl").unwrap(),
            "a bowl of fruit",
        ));
        assert_eq!(denial.kind, DenialKind::Content);
    }
}
