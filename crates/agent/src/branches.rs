use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use returndesk_core::domain::conversation::Message;
use returndesk_db::{DataStoreGateway, QueryRow};

use crate::errors::{with_timeout, AgentError};
use crate::guardrails::validate_read_only;
use crate::llm::{CompletionMode, LlmClient};
use crate::prompts::{self, PromptTemplates};
use crate::retrieval::{DocumentRetriever, Passage};
use crate::router::{order_ids_in, RouteDecision};

const QUERY_HISTORY: usize = 6;

/// Everything gathered for one turn before the answer is composed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TurnContext {
    pub passages: Vec<Passage>,
    pub data: Option<DataLookup>,
    pub notes: Vec<String>,
    pub return_outcome: Option<String>,
}

impl TurnContext {
    fn merge(mut self, other: TurnContext) -> Self {
        self.passages.extend(other.passages);
        if other.data.is_some() {
            self.data = other.data;
        }
        self.notes.extend(other.notes);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
            && self.data.is_none()
            && self.notes.is_empty()
            && self.return_outcome.is_none()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DataLookup {
    pub query: String,
    pub rows: Vec<QueryRow>,
    pub truncated: bool,
}

#[derive(Clone, Debug)]
pub struct DataBranchSettings {
    pub call_timeout: Duration,
    pub query_row_limit: u32,
    pub max_context_rows: usize,
    pub review_queries: bool,
}

/// Runs the context-gathering side of a route. Failures become notes, never errors.
pub struct BranchExecutor {
    retriever: Arc<dyn DocumentRetriever>,
    data_store: Arc<dyn DataStoreGateway>,
    llm: Arc<dyn LlmClient>,
    templates: Arc<PromptTemplates>,
    settings: DataBranchSettings,
}

impl BranchExecutor {
    pub fn new(
        retriever: Arc<dyn DocumentRetriever>,
        data_store: Arc<dyn DataStoreGateway>,
        llm: Arc<dyn LlmClient>,
        templates: Arc<PromptTemplates>,
        settings: DataBranchSettings,
    ) -> Self {
        Self { retriever, data_store, llm, templates, settings }
    }

    pub async fn gather(&self, route: RouteDecision, message: &str, history: &[Message]) -> TurnContext {
        match route {
            RouteDecision::PolicyOnly => self.policy_branch(message).await,
            RouteDecision::DataOnly => self.data_branch(message, history).await,
            RouteDecision::PolicyAndData => {
                let (policy, data) =
                    tokio::join!(self.policy_branch(message), self.data_branch(message, history));
                policy.merge(data)
            }
            RouteDecision::General => TurnContext::default(),
        }
    }

    async fn policy_branch(&self, message: &str) -> TurnContext {
        let retrieved = with_timeout("policy.retrieve", self.settings.call_timeout, async {
            self.retriever
                .retrieve(message)
                .await
                .map_err(|error| AgentError::RetrievalUnavailable(format!("{error:#}")))
        })
        .await;

        match retrieved {
            Ok(passages) => {
                debug!(event_name = "agent.branch.policy", passages = passages.len(), "policy passages retrieved");
                let mut context = TurnContext { passages, ..TurnContext::default() };
                if context.passages.is_empty() {
                    context.notes.push("No return policy passage matched this question.".to_string());
                }
                context
            }
            Err(error) => {
                degraded("policy", &error);
                TurnContext {
                    notes: vec![
                        "The return policy lookup is unavailable right now; do not quote policy terms."
                            .to_string(),
                    ],
                    ..TurnContext::default()
                }
            }
        }
    }

    async fn data_branch(&self, message: &str, history: &[Message]) -> TurnContext {
        match self.lookup(message, history).await {
            Ok(lookup) => {
                debug!(
                    event_name = "agent.branch.data",
                    rows = lookup.rows.len(),
                    truncated = lookup.truncated,
                    "order data retrieved"
                );
                TurnContext { data: Some(lookup), ..TurnContext::default() }
            }
            Err(error) => {
                degraded("data", &error);
                let note = match error {
                    AgentError::QueryInvalid(_) => {
                        "The order lookup could not be completed from this question; ask the customer to confirm the order id or rephrase."
                    }
                    _ => "The order data lookup is unavailable right now; do not guess order details.",
                };
                TurnContext { notes: vec![note.to_string()], ..TurnContext::default() }
            }
        }
    }

    async fn lookup(&self, message: &str, history: &[Message]) -> Result<DataLookup, AgentError> {
        let timeout = self.settings.call_timeout;

        let tables = with_timeout("data.list_tables", timeout, async {
            self.data_store.list_tables().await.map_err(AgentError::from)
        })
        .await?;
        if tables.is_empty() {
            return Err(AgentError::RetrievalUnavailable("data store has no tables".to_string()));
        }

        let selected = self.select_tables(message, &tables).await;
        let schema = with_timeout("data.get_schema", timeout, async {
            self.data_store.get_schema(&selected).await.map_err(AgentError::from)
        })
        .await?;

        let prompt = self
            .templates
            .render(
                prompts::GENERATE_QUERY,
                &json!({
                    "schema": schema,
                    "history": prompts::transcript(history, QUERY_HISTORY),
                    "message": message,
                    "top_k": self.settings.query_row_limit,
                }),
            )
            .map_err(AgentError::completion)?;
        let draft = with_timeout("llm.generate_query", timeout, async {
            self.llm.complete(&prompt, CompletionMode::Generate).await.map_err(AgentError::completion)
        })
        .await?;

        let mut query =
            validate_read_only(&draft).map_err(|rejection| AgentError::QueryInvalid(rejection.to_string()))?;
        if self.settings.review_queries {
            if let Some(reviewed) = self.review(&schema, &query).await {
                query = reviewed;
            }
        }

        let mut rows = with_timeout("data.execute", timeout, async {
            self.data_store.execute(&query).await.map_err(AgentError::from)
        })
        .await?;

        let truncated = rows.len() > self.settings.max_context_rows;
        rows.truncate(self.settings.max_context_rows);
        Ok(DataLookup { query, rows, truncated })
    }

    /// Keyword match on table names first, then the model, then every table.
    async fn select_tables(&self, message: &str, tables: &[String]) -> Vec<String> {
        let matched = match_tables_by_name(message, tables);
        if !matched.is_empty() {
            return matched;
        }

        let chosen = async {
            let prompt = self
                .templates
                .render(prompts::SELECT_TABLES, &json!({"tables": tables, "message": message}))
                .map_err(AgentError::completion)?;
            with_timeout("llm.select_tables", self.settings.call_timeout, async {
                self.llm.complete(&prompt, CompletionMode::Classify).await.map_err(AgentError::completion)
            })
            .await
        }
        .await;

        match chosen {
            Ok(reply) => {
                let picked: Vec<String> = reply
                    .split(|ch: char| ch == ',' || ch == '\n')
                    .map(|name| name.trim().trim_matches('`').trim())
                    .filter_map(|name| tables.iter().find(|table| table.eq_ignore_ascii_case(name)))
                    .cloned()
                    .collect();
                if picked.is_empty() {
                    tables.to_vec()
                } else {
                    picked
                }
            }
            Err(error) => {
                debug!(event_name = "agent.branch.table_selection_fallback", error = %error, "using all tables");
                tables.to_vec()
            }
        }
    }

    /// Second look at a generated query. A rewrite is only kept when it is still a read.
    async fn review(&self, schema: &str, query: &str) -> Option<String> {
        let prompt = self
            .templates
            .render(prompts::REVIEW_QUERY, &json!({"schema": schema, "query": query}))
            .ok()?;

        let reviewed = with_timeout("llm.review_query", self.settings.call_timeout, async {
            self.llm.complete(&prompt, CompletionMode::Generate).await.map_err(AgentError::completion)
        })
        .await;

        match reviewed.map(|reply| validate_read_only(&reply)) {
            Ok(Ok(rewritten)) => Some(rewritten),
            Ok(Err(rejection)) => {
                warn!(
                    event_name = "agent.branch.review_rejected",
                    reason = rejection.reason_code(),
                    "reviewed query rejected, keeping original"
                );
                None
            }
            Err(error) => {
                debug!(event_name = "agent.branch.review_skipped", error = %error, "query review unavailable");
                None
            }
        }
    }
}

fn degraded(branch: &'static str, error: &AgentError) {
    warn!(
        event_name = "agent.branch.degraded",
        branch,
        kind = error.kind(),
        error = %error,
        "context lookup failed, continuing with degraded context"
    );
}

fn match_tables_by_name(message: &str, tables: &[String]) -> Vec<String> {
    let text = message.to_lowercase();
    let words: Vec<&str> = text.split(|ch: char| !ch.is_alphanumeric()).collect();
    let mentions_order_id = !order_ids_in(message).is_empty();

    tables
        .iter()
        .filter(|table| {
            let name = table.to_lowercase();
            let singular = name.trim_end_matches('s');
            let head = name.split('_').next().unwrap_or(&name).trim_end_matches('s');
            words.iter().any(|word| {
                let word = word.trim_end_matches('s');
                !word.is_empty() && (word == singular || word == head)
            }) || (mentions_order_id && name == "orders")
        })
        .cloned()
        .collect()
}
