//! Chat endpoints.
//!
//! - `GET  /`     - service description
//! - `POST /chat` - run one conversation turn

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use returndesk_agent::router::RouteDecision;
use returndesk_agent::{AgentRuntime, ChatTurnRequest};
use returndesk_core::domain::conversation::{Message, MessageRole, ThreadId};
use returndesk_core::errors::InterfaceError;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ChatState {
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<HistoryEntry>,
}

/// A prior message supplied by the client; the timestamp is optional on the wire.
#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub thread_id: String,
    pub route: RouteDecision,
    pub conversation_history: Vec<Message>,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: String,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub endpoints: Vec<&'static str>,
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/chat", post(chat))
        .with_state(state)
}

pub async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "returndesk",
        version: env!("CARGO_PKG_VERSION"),
        description: "Customer support assistant for order status and returns",
        endpoints: vec!["GET /", "GET /health", "POST /chat"],
    })
}

pub async fn chat(
    State(state): State<ChatState>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorResponse>)> {
    let correlation_id = Uuid::new_v4().to_string();

    if body.message.trim().is_empty() {
        warn!(
            event_name = "server.chat.rejected",
            correlation_id = %correlation_id,
            "empty chat message"
        );
        return Err(reject(InterfaceError::BadRequest {
            message: "message must not be empty".to_string(),
            correlation_id,
        }));
    }

    let thread_id = body
        .thread_id
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(ThreadId);
    let prior_history = body
        .conversation_history
        .into_iter()
        .map(|entry| Message {
            role: entry.role,
            content: entry.content,
            timestamp: entry.timestamp.unwrap_or_else(Utc::now),
        })
        .collect();

    let request = ChatTurnRequest { thread_id, message: body.message, prior_history };
    match state.runtime.handle_message(request).await {
        Ok(turn) => {
            info!(
                event_name = "server.chat.completed",
                correlation_id = %correlation_id,
                thread_id = %turn.thread_id,
                route = turn.route.as_str(),
                "chat turn served"
            );
            Ok(Json(ChatResponse {
                message: turn.reply,
                thread_id: turn.thread_id.0,
                route: turn.route,
                conversation_history: turn.history,
                status: "success",
            }))
        }
        Err(failure) => {
            error!(
                event_name = "server.chat.failed",
                correlation_id = %correlation_id,
                error = %failure,
                "chat turn failed"
            );
            Err(reject(failure.into_interface(correlation_id)))
        }
    }
}

fn reject(error: InterfaceError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(ErrorResponse {
            status: "error",
            error: error.user_message().to_string(),
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use returndesk_agent::llm::ScriptedLlm;
    use returndesk_agent::prompts::PromptTemplates;
    use returndesk_agent::retrieval::PolicyDocumentRetriever;
    use returndesk_agent::router::{KeywordClassifier, RouteDecision};
    use returndesk_agent::{AgentDependencies, AgentRuntime};
    use returndesk_core::config::AppConfig;
    use returndesk_core::domain::conversation::{Message, MessageRole, ThreadId};
    use returndesk_db::{DataStoreGateway, InMemorySessionStore, RepositoryError, SessionStore};

    use super::{chat, service_info, ChatRequest, ChatState, HistoryEntry};

    pub(crate) fn runtime(data_store: Arc<dyn DataStoreGateway>) -> Arc<AgentRuntime> {
        runtime_with_sessions(data_store, Arc::new(InMemorySessionStore::default()))
    }

    fn runtime_with_sessions(
        data_store: Arc<dyn DataStoreGateway>,
        sessions: Arc<dyn SessionStore>,
    ) -> Arc<AgentRuntime> {
        let mut config = AppConfig::default();
        config.agent.review_queries = false;
        let retriever = PolicyDocumentRetriever::from_text(
            "policy",
            "# Returns\n\nItems may be returned within 30 days of delivery.",
            2,
        )
        .expect("policy");

        Arc::new(AgentRuntime::from_config(
            &config,
            AgentDependencies {
                data_store,
                sessions,
                llm: Arc::new(
                    ScriptedLlm::new()
                        .on("### task: generate_query", "SELECT order_status FROM orders LIMIT 5")
                        .with_fallback("Happy to help with your order."),
                ),
                classifier: Arc::new(KeywordClassifier),
                retriever: Arc::new(retriever),
                templates: Arc::new(PromptTemplates::embedded().expect("templates")),
            },
        ))
    }

    pub(crate) struct EmptyStore;

    #[async_trait::async_trait]
    impl DataStoreGateway for EmptyStore {
        async fn list_tables(&self) -> Result<Vec<String>, returndesk_db::RepositoryError> {
            Ok(Vec::new())
        }

        async fn get_schema(&self, _: &[String]) -> Result<String, returndesk_db::RepositoryError> {
            Ok(String::new())
        }

        async fn execute(
            &self,
            _: &str,
        ) -> Result<Vec<returndesk_db::QueryRow>, returndesk_db::RepositoryError> {
            Ok(Vec::new())
        }

        async fn find_order(
            &self,
            _: &returndesk_core::domain::order::OrderId,
        ) -> Result<Option<returndesk_core::domain::order::OrderRecord>, returndesk_db::RepositoryError>
        {
            Ok(None)
        }

        async fn update_order_status(
            &self,
            _: &returndesk_core::domain::order::OrderId,
            _: &returndesk_core::domain::order::OrderStatus,
        ) -> Result<bool, returndesk_db::RepositoryError> {
            Ok(false)
        }
    }

    /// A session backend whose database has gone away.
    struct UnreachableSessions;

    #[async_trait::async_trait]
    impl SessionStore for UnreachableSessions {
        async fn append(&self, _: &ThreadId, _: Message) -> Result<(), RepositoryError> {
            Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn get_history(&self, _: &ThreadId) -> Result<Vec<Message>, RepositoryError> {
            Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn evict_idle(&self, _: std::time::Duration) -> Result<usize, RepositoryError> {
            Ok(0)
        }
    }

    fn request(message: &str, thread_id: Option<String>) -> ChatRequest {
        ChatRequest { message: message.to_string(), thread_id, conversation_history: Vec::new() }
    }

    #[tokio::test]
    async fn chat_returns_reply_thread_and_history() {
        let state = ChatState { runtime: runtime(Arc::new(EmptyStore)) };

        let Json(first) =
            chat(State(state.clone()), Json(request("hello", None))).await.expect("first turn");
        assert_eq!(first.status, "success");
        assert_eq!(first.message, "Happy to help with your order.");
        assert_eq!(first.route, RouteDecision::General);
        assert_eq!(first.conversation_history.len(), 2);

        let Json(second) = chat(State(state), Json(request("thanks", Some(first.thread_id.clone()))))
            .await
            .expect("second turn");
        assert_eq!(second.thread_id, first.thread_id);
        assert_eq!(second.conversation_history.len(), 4);
    }

    #[tokio::test]
    async fn blank_message_is_a_bad_request() {
        let state = ChatState { runtime: runtime(Arc::new(EmptyStore)) };

        let (status, Json(body)) =
            chat(State(state), Json(request("  ", None))).await.expect_err("rejected");

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.status, "error");
        assert!(!body.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn session_store_outage_is_service_unavailable() {
        let state = ChatState {
            runtime: runtime_with_sessions(Arc::new(EmptyStore), Arc::new(UnreachableSessions)),
        };

        let (status, Json(body)) =
            chat(State(state), Json(request("hello", None))).await.expect_err("rejected");

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error, "The service is temporarily unavailable. Please retry shortly.");
        assert!(!body.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn client_history_seeds_a_new_thread() {
        let state = ChatState { runtime: runtime(Arc::new(EmptyStore)) };
        let mut body = request("and the refund?", None);
        body.conversation_history = vec![
            HistoryEntry { role: MessageRole::User, content: "hi".to_string(), timestamp: None },
            HistoryEntry {
                role: MessageRole::Assistant,
                content: "Hello! How can I help?".to_string(),
                timestamp: None,
            },
        ];

        let Json(response) = chat(State(state), Json(body)).await.expect("turn");

        assert_eq!(response.conversation_history.len(), 4);
        assert_eq!(response.conversation_history[1].content, "Hello! How can I help?");
        assert_eq!(response.conversation_history[2].role, MessageRole::User);
    }

    #[tokio::test]
    async fn service_info_lists_endpoints() {
        let Json(info) = service_info().await;
        assert_eq!(info.service, "returndesk");
        assert!(info.endpoints.contains(&"POST /chat"));
    }
}
