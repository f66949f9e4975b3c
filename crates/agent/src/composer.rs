use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::warn;

use returndesk_core::domain::conversation::Message;

use crate::branches::TurnContext;
use crate::errors::{with_timeout, AgentError};
use crate::llm::{CompletionMode, LlmClient};
use crate::prompts::{self, PromptTemplates};

pub const FALLBACK_REPLY: &str = "I'm sorry, I couldn't put together an answer just now. \
     Please try again in a moment, and include your order number if your question is about a specific order.";

const ANSWER_HISTORY: usize = 10;

/// Turns the gathered context into the customer-facing reply.
pub struct AnswerComposer {
    llm: Arc<dyn LlmClient>,
    templates: Arc<PromptTemplates>,
    store_name: String,
    reply_language: String,
    call_timeout: Duration,
}

impl AnswerComposer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        templates: Arc<PromptTemplates>,
        store_name: impl Into<String>,
        reply_language: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            templates,
            store_name: store_name.into(),
            reply_language: reply_language.into(),
            call_timeout,
        }
    }

    /// Never returns an empty reply.
    pub async fn compose(&self, message: &str, history: &[Message], context: &TurnContext) -> String {
        match self.generate(message, history, context).await {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => {
                warn!(event_name = "agent.composer.empty_reply", "completion returned no text");
                fallback(context)
            }
            Err(error) => {
                warn!(
                    event_name = "agent.composer.fallback",
                    kind = error.kind(),
                    error = %error,
                    "answer generation failed"
                );
                fallback(context)
            }
        }
    }

    async fn generate(
        &self,
        message: &str,
        history: &[Message],
        context: &TurnContext,
    ) -> Result<String, AgentError> {
        let data = context.data.as_ref().map(|lookup| {
            json!({
                "query": lookup.query,
                "rows": lookup
                    .rows
                    .iter()
                    .map(|row| serde_json::to_string(row).unwrap_or_default())
                    .collect::<Vec<_>>(),
                "truncated": lookup.truncated,
            })
        });

        let prompt = self
            .templates
            .render(
                prompts::ANSWER,
                &json!({
                    "store_name": self.store_name,
                    "reply_language": self.reply_language,
                    "history": prompts::transcript(history, ANSWER_HISTORY),
                    "message": message,
                    "passages": context.passages,
                    "data": data,
                    "notes": context.notes,
                    "return_outcome": context.return_outcome,
                }),
            )
            .map_err(AgentError::completion)?;

        with_timeout("llm.answer", self.call_timeout, async {
            self.llm.complete(&prompt, CompletionMode::Generate).await.map_err(AgentError::completion)
        })
        .await
    }
}

fn fallback(context: &TurnContext) -> String {
    match &context.return_outcome {
        Some(outcome) if !outcome.trim().is_empty() => outcome.clone(),
        _ => FALLBACK_REPLY.to_string(),
    }
}
