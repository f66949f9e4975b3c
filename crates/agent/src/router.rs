use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use returndesk_core::domain::conversation::{Message, MessageRole};
use returndesk_core::domain::order::OrderId;

use crate::errors::{with_timeout, AgentError};
use crate::llm::{CompletionMode, LlmClient};
use crate::prompts::{self, PromptTemplates};

const CLASSIFIER_HISTORY: usize = 6;

/// Which context sources a turn needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    PolicyOnly,
    DataOnly,
    PolicyAndData,
    General,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyOnly => "policy_only",
            Self::DataOnly => "data_only",
            Self::PolicyAndData => "policy_and_data",
            Self::General => "general",
        }
    }

    pub fn needs_policy(&self) -> bool {
        matches!(self, Self::PolicyOnly | Self::PolicyAndData)
    }

    pub fn needs_data(&self) -> bool {
        matches!(self, Self::DataOnly | Self::PolicyAndData)
    }

    /// Reads a label out of a model reply. Replies naming zero or several labels yield `None`.
    pub fn parse_label(raw: &str) -> Option<Self> {
        let mut normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|ch| if ch == '-' || ch == ' ' { '_' } else { ch })
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .collect();

        let mut found = Vec::new();
        if normalized.contains("policy_and_data") {
            found.push(Self::PolicyAndData);
            normalized = normalized.replace("policy_and_data", "");
        }
        for (label, decision) in [
            ("policy_only", Self::PolicyOnly),
            ("data_only", Self::DataOnly),
            ("general", Self::General),
        ] {
            if normalized.contains(label) {
                found.push(decision);
            }
        }

        match found.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }
}

/// Intent judgments the conversation loop delegates.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, message: &str, history: &[Message]) -> Result<RouteDecision, AgentError>;

    /// The order the customer has just explicitly agreed to return, if any.
    async fn confirmed_return(
        &self,
        message: &str,
        history: &[Message],
    ) -> Result<Option<OrderId>, AgentError>;
}

pub struct Router {
    classifier: Arc<dyn Classifier>,
    call_timeout: Duration,
}

impl Router {
    pub fn new(classifier: Arc<dyn Classifier>, call_timeout: Duration) -> Self {
        Self { classifier, call_timeout }
    }

    /// Never fails: anything but a clean label routes to [`RouteDecision::General`].
    pub async fn route(&self, message: &str, history: &[Message]) -> RouteDecision {
        let classified = with_timeout(
            "router.classify",
            self.call_timeout,
            self.classifier.classify(message, history),
        )
        .await;

        match classified {
            Ok(decision) => {
                info!(event_name = "agent.router.decision", route = decision.as_str(), "routed message");
                decision
            }
            Err(error) => {
                warn!(
                    event_name = "agent.router.fallback",
                    kind = error.kind(),
                    error = %error,
                    "classification failed, using general route"
                );
                RouteDecision::General
            }
        }
    }

    /// Only orders that appear somewhere in the conversation are accepted.
    pub async fn detect_return_confirmation(
        &self,
        message: &str,
        history: &[Message],
    ) -> Option<OrderId> {
        let mentioned = mentioned_order_ids(message, history);
        if mentioned.is_empty() {
            return None;
        }

        let confirmed = with_timeout(
            "router.confirm_return",
            self.call_timeout,
            self.classifier.confirmed_return(message, history),
        )
        .await;

        match confirmed {
            Ok(Some(order_id)) if mentioned.contains(&order_id) => {
                info!(
                    event_name = "agent.router.return_confirmed",
                    order_id = %order_id,
                    "customer confirmed a return"
                );
                Some(order_id)
            }
            Ok(Some(order_id)) => {
                warn!(
                    event_name = "agent.router.return_unmentioned_order",
                    order_id = %order_id,
                    "confirmation named an order absent from the conversation"
                );
                None
            }
            Ok(None) => None,
            Err(error) => {
                warn!(
                    event_name = "agent.router.confirmation_failed",
                    kind = error.kind(),
                    error = %error,
                    "could not judge return confirmation"
                );
                None
            }
        }
    }
}

/// Order ids in `text`: tokens that parse as an id and carry at least one digit.
pub fn order_ids_in(text: &str) -> Vec<OrderId> {
    text.split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'))
        .filter(|token| token.len() >= 8 && token.chars().any(|ch| ch.is_ascii_digit()))
        .filter_map(OrderId::parse)
        .collect()
}

fn mentioned_order_ids(message: &str, history: &[Message]) -> Vec<OrderId> {
    let mut ids = order_ids_in(message);
    for earlier in history {
        ids.extend(order_ids_in(&earlier.content));
    }
    ids
}

fn latest_order_id(message: &str, history: &[Message]) -> Option<OrderId> {
    order_ids_in(message).into_iter().next().or_else(|| {
        history
            .iter()
            .rev()
            .filter(|earlier| earlier.role != MessageRole::Tool)
            .find_map(|earlier| order_ids_in(&earlier.content).into_iter().next())
    })
}

const POLICY_TERMS: &[&str] = &[
    "policy", "return", "refund", "exchange", "warrant", "window", "eligib", "deadline",
    "devolu", "reembols", "troca", "prazo",
];

const DATA_TERMS: &[&str] = &[
    "order", "status", "track", "shipped", "shipping status", "deliver", "package", "pedido",
    "entrega", "where is",
];

const AFFIRMATIONS: &[&str] = &[
    "yes", "yeah", "yep", "confirm", "confirmed", "proceed", "go ahead", "please do", "sim",
    "confirmo",
];

const HEDGES: &[&str] = &["but", "not", "mas", "não", "nao"];

const RETURN_TERMS: &[&str] = &["return", "devolu", "devolv"];

fn contains_any(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| text.contains(term))
}

/// A bare agreement. Questions and hedged replies ("yes, but ...") never count.
fn affirms(text: &str) -> bool {
    let words: Vec<&str> = text.split(|ch: char| !ch.is_alphanumeric()).collect();
    if text.contains('?') || HEDGES.iter().any(|hedge| words.contains(hedge)) {
        return false;
    }
    AFFIRMATIONS.iter().any(|term| {
        if term.contains(' ') {
            text.contains(term)
        } else {
            words.contains(term)
        }
    })
}

/// Deterministic keyword classifier, used offline and in tests.
#[derive(Clone, Debug, Default)]
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, message: &str, _history: &[Message]) -> Result<RouteDecision, AgentError> {
        let text = message.to_lowercase();
        let policy = contains_any(&text, POLICY_TERMS);
        let data = !order_ids_in(message).is_empty() || contains_any(&text, DATA_TERMS);

        Ok(match (policy, data) {
            (true, true) => RouteDecision::PolicyAndData,
            (true, false) => RouteDecision::PolicyOnly,
            (false, true) => RouteDecision::DataOnly,
            (false, false) => RouteDecision::General,
        })
    }

    async fn confirmed_return(
        &self,
        message: &str,
        history: &[Message],
    ) -> Result<Option<OrderId>, AgentError> {
        let text = message.to_lowercase();
        if !affirms(&text) {
            return Ok(None);
        }

        let offered = history
            .iter()
            .rev()
            .find(|earlier| earlier.role == MessageRole::Assistant)
            .map(|earlier| contains_any(&earlier.content.to_lowercase(), RETURN_TERMS))
            .unwrap_or(false);
        if !contains_any(&text, RETURN_TERMS) && !offered {
            return Ok(None);
        }

        Ok(latest_order_id(message, history))
    }
}

/// Model-backed classifier driven by the `route` and `confirm_return` prompts.
pub struct CompletionClassifier {
    llm: Arc<dyn LlmClient>,
    templates: Arc<PromptTemplates>,
    store_name: String,
}

impl CompletionClassifier {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        templates: Arc<PromptTemplates>,
        store_name: impl Into<String>,
    ) -> Self {
        Self { llm, templates, store_name: store_name.into() }
    }

    async fn ask(&self, template: &str, message: &str, history: &[Message]) -> Result<String, AgentError> {
        let prompt = self
            .templates
            .render(
                template,
                &json!({
                    "store_name": self.store_name,
                    "history": prompts::transcript(history, CLASSIFIER_HISTORY),
                    "message": message,
                }),
            )
            .map_err(AgentError::completion)?;

        self.llm.complete(&prompt, CompletionMode::Classify).await.map_err(AgentError::completion)
    }
}

#[async_trait]
impl Classifier for CompletionClassifier {
    async fn classify(&self, message: &str, history: &[Message]) -> Result<RouteDecision, AgentError> {
        let reply = self.ask(prompts::ROUTE, message, history).await?;
        RouteDecision::parse_label(&reply)
            .ok_or_else(|| AgentError::ClassificationAmbiguous(reply.trim().to_string()))
    }

    async fn confirmed_return(
        &self,
        message: &str,
        history: &[Message],
    ) -> Result<Option<OrderId>, AgentError> {
        let reply = self.ask(prompts::CONFIRM_RETURN, message, history).await?;
        parse_confirmation(&reply)
    }
}

fn parse_confirmation(reply: &str) -> Result<Option<OrderId>, AgentError> {
    let line = reply.trim().trim_matches('`').trim();
    let mut parts = line.split_whitespace();
    match parts.next().map(str::to_ascii_uppercase).as_deref() {
        Some("NONE") => Ok(None),
        Some("CONFIRM") => parts
            .next()
            .and_then(OrderId::parse)
            .map(Some)
            .ok_or_else(|| AgentError::ClassificationAmbiguous(line.to_string())),
        _ => Err(AgentError::ClassificationAmbiguous(line.to_string())),
    }
}
