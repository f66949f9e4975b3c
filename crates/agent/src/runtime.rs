use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info};

use returndesk_core::config::AppConfig;
use returndesk_core::domain::conversation::{Message, ThreadId};
use returndesk_core::errors::{ApplicationError, DomainError};
use returndesk_db::{DataStoreGateway, RepositoryError, SessionStore};

use crate::branches::{BranchExecutor, DataBranchSettings};
use crate::composer::AnswerComposer;
use crate::llm::{LlmClient, LlmError, OpenAiCompatibleClient};
use crate::locks::KeyedLocks;
use crate::prompts::PromptTemplates;
use crate::retrieval::DocumentRetriever;
use crate::returns::{ReturnExecutor, ReturnSettings};
use crate::router::{Classifier, CompletionClassifier, RouteDecision, Router};

#[derive(Clone, Debug, Default)]
pub struct ChatTurnRequest {
    pub thread_id: Option<ThreadId>,
    pub message: String,
    /// Seeds a thread that has no stored history yet; ignored otherwise.
    pub prior_history: Vec<Message>,
}

#[derive(Clone, Debug)]
pub struct ChatTurn {
    pub thread_id: ThreadId,
    pub reply: String,
    pub route: RouteDecision,
    pub history: Vec<Message>,
}

/// The external capabilities a runtime is wired to.
pub struct AgentDependencies {
    pub data_store: Arc<dyn DataStoreGateway>,
    pub sessions: Arc<dyn SessionStore>,
    pub llm: Arc<dyn LlmClient>,
    pub classifier: Arc<dyn Classifier>,
    pub retriever: Arc<dyn DocumentRetriever>,
    pub templates: Arc<PromptTemplates>,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("prompt templates are invalid: {0:#}")]
    Templates(anyhow::Error),
    #[error("completion client could not be built: {0}")]
    Completion(#[from] LlmError),
}

impl AgentDependencies {
    /// Production wiring: the configured completion endpoint drives both the
    /// answers and the route classifier.
    pub fn from_config(
        config: &AppConfig,
        data_store: Arc<dyn DataStoreGateway>,
        sessions: Arc<dyn SessionStore>,
        retriever: Arc<dyn DocumentRetriever>,
    ) -> Result<Self, AssemblyError> {
        let templates = Arc::new(
            PromptTemplates::load(config.agent.templates_dir.as_deref())
                .map_err(AssemblyError::Templates)?,
        );
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleClient::from_config(&config.llm)?);
        let classifier = Arc::new(CompletionClassifier::new(
            Arc::clone(&llm),
            Arc::clone(&templates),
            config.agent.store_name.clone(),
        ));

        Ok(Self { data_store, sessions, llm, classifier, retriever, templates })
    }
}

pub struct AgentRuntime {
    sessions: Arc<dyn SessionStore>,
    router: Router,
    branches: BranchExecutor,
    composer: AnswerComposer,
    returns: ReturnExecutor,
    thread_locks: KeyedLocks,
}

impl AgentRuntime {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        router: Router,
        branches: BranchExecutor,
        composer: AnswerComposer,
        returns: ReturnExecutor,
    ) -> Self {
        Self { sessions, router, branches, composer, returns, thread_locks: KeyedLocks::new() }
    }

    pub fn from_config(config: &AppConfig, deps: AgentDependencies) -> Self {
        let call_timeout = Duration::from_secs(config.agent.call_timeout_secs);

        let router = Router::new(deps.classifier, call_timeout);
        let branches = BranchExecutor::new(
            deps.retriever,
            Arc::clone(&deps.data_store),
            Arc::clone(&deps.llm),
            Arc::clone(&deps.templates),
            DataBranchSettings {
                call_timeout,
                query_row_limit: config.agent.query_row_limit,
                max_context_rows: config.agent.max_context_rows,
                review_queries: config.agent.review_queries,
            },
        );
        let composer = AnswerComposer::new(
            deps.llm,
            deps.templates,
            config.agent.store_name.clone(),
            config.agent.reply_language.clone(),
            call_timeout,
        );
        let returns = ReturnExecutor::new(
            deps.data_store,
            ReturnSettings {
                enforce_window: config.returns.enforce_window,
                window_days: config.returns.window_days,
                call_timeout,
            },
        );

        Self::new(deps.sessions, router, branches, composer, returns)
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Runs one chat turn. Turns on the same thread are serialized end to end.
    ///
    /// Only session-store failures surface as errors; every other external
    /// failure degrades the reply instead.
    pub async fn handle_message(&self, request: ChatTurnRequest) -> Result<ChatTurn, ApplicationError> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(DomainError::InvariantViolation("message must not be empty".to_string()).into());
        }

        let thread_id = request.thread_id.unwrap_or_else(ThreadId::generate);
        let _guard = self.thread_locks.lock(thread_id.as_str()).await;

        let mut history = self.sessions.get_history(&thread_id).await.map_err(persistence)?;
        if history.is_empty() && !request.prior_history.is_empty() {
            for earlier in request.prior_history {
                self.sessions.append(&thread_id, earlier.clone()).await.map_err(persistence)?;
                history.push(earlier);
            }
        }

        self.sessions.append(&thread_id, Message::user(message.clone())).await.map_err(persistence)?;

        let route = self.router.route(&message, &history).await;
        let mut context = self.branches.gather(route, &message, &history).await;

        if let Some(order_id) = self.router.detect_return_confirmation(&message, &history).await {
            let mut thread_context = history.clone();
            thread_context.push(Message::user(message.clone()));

            let outcome = match self.returns.process_return(&order_id, &thread_context).await {
                Ok(receipt) => receipt.summary(),
                Err(failure) => {
                    info!(
                        event_name = "agent.runtime.return_declined",
                        thread_id = %thread_id,
                        order_id = %order_id,
                        reason = %failure,
                        "return not processed"
                    );
                    failure.summary()
                }
            };
            self.sessions.append(&thread_id, Message::tool(outcome.clone())).await.map_err(persistence)?;
            context.return_outcome = Some(outcome);
        }

        let reply = self.composer.compose(&message, &history, &context).await;
        self.sessions.append(&thread_id, Message::assistant(reply.clone())).await.map_err(persistence)?;

        let history = self.sessions.get_history(&thread_id).await.map_err(persistence)?;
        info!(
            event_name = "agent.runtime.turn_completed",
            thread_id = %thread_id,
            route = route.as_str(),
            history_len = history.len(),
            "chat turn completed"
        );

        Ok(ChatTurn { thread_id, reply, route, history })
    }

    /// Drops idle threads; returns how many were evicted.
    pub async fn evict_idle_threads(&self, idle_for: Duration) -> Result<usize> {
        Ok(self.sessions.evict_idle(idle_for).await?)
    }
}

fn persistence(source: RepositoryError) -> ApplicationError {
    error!(event_name = "agent.runtime.session_store_failed", error = %source, "session store failure");
    ApplicationError::Persistence(source.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use returndesk_core::config::AppConfig;
    use returndesk_core::domain::conversation::{Message, MessageRole, ThreadId};
    use returndesk_core::domain::order::{OrderId, OrderRecord, OrderStatus};
    use returndesk_core::errors::ApplicationError;
    use returndesk_db::fixtures::DEMO_DELIVERED_RECENT;
    use returndesk_db::migrations::run_pending;
    use returndesk_db::{
        connect_with_settings, DataStoreGateway, DemoDataset, InMemorySessionStore, QueryRow,
        RepositoryError, SessionStore, SqliteDataStore,
    };

    use super::{AgentDependencies, AgentRuntime, ChatTurnRequest};
    use crate::llm::ScriptedLlm;
    use crate::prompts::PromptTemplates;
    use crate::retrieval::PolicyDocumentRetriever;
    use crate::router::{KeywordClassifier, RouteDecision};

    const POLICY: &str = "# Returns\n\nItems may be returned within 30 days of delivery.\n\n\
        # Refunds\n\nRefunds go back to the original payment method.";

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.agent.review_queries = false;
        config
    }

    fn llm() -> Arc<ScriptedLlm> {
        Arc::new(
            ScriptedLlm::new()
                .on(
                    "### task: generate_query",
                    format!(
                        "SELECT \"order_status\" FROM orders WHERE \"order_id\" = '{DEMO_DELIVERED_RECENT}'"
                    ),
                )
                .with_fallback("Thanks for reaching out."),
        )
    }

    fn runtime_with(
        data_store: Arc<dyn DataStoreGateway>,
        sessions: Arc<dyn SessionStore>,
        llm: Arc<ScriptedLlm>,
    ) -> AgentRuntime {
        AgentRuntime::from_config(
            &config(),
            AgentDependencies {
                data_store,
                sessions,
                llm,
                classifier: Arc::new(KeywordClassifier),
                retriever: Arc::new(
                    PolicyDocumentRetriever::from_text("policy", POLICY, 2).expect("policy"),
                ),
                templates: Arc::new(PromptTemplates::embedded().expect("templates")),
            },
        )
    }

    async fn seeded_store() -> Arc<SqliteDataStore> {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        DemoDataset::load(&pool).await.expect("seed");
        Arc::new(SqliteDataStore::new(pool))
    }

    fn request(thread_id: Option<&ThreadId>, message: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            thread_id: thread_id.cloned(),
            message: message.to_string(),
            prior_history: Vec::new(),
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DataStoreGateway for FailingStore {
        async fn list_tables(&self) -> Result<Vec<String>, RepositoryError> {
            Ok(vec!["orders".to_string()])
        }

        async fn get_schema(&self, _: &[String]) -> Result<String, RepositoryError> {
            Ok("CREATE TABLE orders (order_id TEXT)".to_string())
        }

        async fn execute(&self, _: &str) -> Result<Vec<QueryRow>, RepositoryError> {
            Err(RepositoryError::Decode("connection reset".to_string()))
        }

        async fn find_order(&self, _: &OrderId) -> Result<Option<OrderRecord>, RepositoryError> {
            Err(RepositoryError::Decode("connection reset".to_string()))
        }

        async fn update_order_status(&self, _: &OrderId, _: &OrderStatus) -> Result<bool, RepositoryError> {
            Err(RepositoryError::Decode("connection reset".to_string()))
        }
    }

    struct BrokenSessions;

    #[async_trait]
    impl SessionStore for BrokenSessions {
        async fn append(&self, _: &ThreadId, _: Message) -> Result<(), RepositoryError> {
            Err(RepositoryError::Decode("disk full".to_string()))
        }

        async fn get_history(&self, _: &ThreadId) -> Result<Vec<Message>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn evict_idle(&self, _: Duration) -> Result<usize, RepositoryError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn first_message_opens_a_thread_with_both_turns() {
        let runtime =
            runtime_with(seeded_store().await, Arc::new(InMemorySessionStore::default()), llm());

        let turn = runtime.handle_message(request(None, "hello there")).await.expect("turn");

        assert_eq!(turn.route, RouteDecision::General);
        assert_eq!(turn.reply, "Thanks for reaching out.");
        let roles: Vec<_> = turn.history.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    }

    #[tokio::test]
    async fn confirmed_return_marks_order_and_records_outcome() {
        let store = seeded_store().await;
        let runtime = runtime_with(
            Arc::clone(&store) as Arc<dyn DataStoreGateway>,
            Arc::new(InMemorySessionStore::default()),
            llm(),
        );

        let first = runtime
            .handle_message(request(
                None,
                &format!("Can I return order {DEMO_DELIVERED_RECENT}? What is the policy?"),
            ))
            .await
            .expect("first turn");
        assert_eq!(first.route, RouteDecision::PolicyAndData);
        assert!(first.history.iter().all(|message| message.role != MessageRole::Tool));

        let second = runtime
            .handle_message(request(Some(&first.thread_id), "Yes, please return it."))
            .await
            .expect("second turn");

        let tool = second
            .history
            .iter()
            .find(|message| message.role == MessageRole::Tool)
            .expect("return outcome recorded");
        assert!(tool.content.contains("registered as returned"));
        let order = store
            .find_order(&OrderId(DEMO_DELIVERED_RECENT.to_string()))
            .await
            .expect("find")
            .expect("order");
        assert!(order.status.is_returned());

        let third = runtime
            .handle_message(request(Some(&first.thread_id), "yes, return it again"))
            .await
            .expect("third turn");
        let last_tool = third
            .history
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Tool)
            .expect("second outcome");
        assert!(last_tool.content.contains("already registered as returned"));
    }

    #[tokio::test]
    async fn failing_data_store_still_produces_a_reply() {
        let runtime = runtime_with(
            Arc::new(FailingStore),
            Arc::new(InMemorySessionStore::default()),
            Arc::new(ScriptedLlm::new().on("### task: generate_query", "SELECT 1")),
        );

        let turn = runtime
            .handle_message(request(None, "what is the status of order 47770eb9100c2d0c?"))
            .await
            .expect("degraded turn");

        assert_eq!(turn.route, RouteDecision::DataOnly);
        assert!(!turn.reply.trim().is_empty());
        assert_eq!(turn.history.len(), 2);
    }

    #[tokio::test]
    async fn session_store_failure_fails_the_turn() {
        let runtime = runtime_with(seeded_store().await, Arc::new(BrokenSessions), llm());
        let result = runtime.handle_message(request(None, "hello")).await;
        assert!(matches!(result, Err(ApplicationError::Persistence(_))));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let runtime =
            runtime_with(seeded_store().await, Arc::new(InMemorySessionStore::default()), llm());
        assert!(matches!(
            runtime.handle_message(request(None, "   ")).await,
            Err(ApplicationError::Domain(_))
        ));
    }

    #[tokio::test]
    async fn prior_history_seeds_only_new_threads() {
        let runtime =
            runtime_with(seeded_store().await, Arc::new(InMemorySessionStore::default()), llm());
        let mut seeded = request(None, "hello again");
        seeded.prior_history = vec![Message::user("hi"), Message::assistant("hello!")];

        let turn = runtime.handle_message(seeded).await.expect("seeded turn");
        assert_eq!(turn.history.len(), 4);
        assert_eq!(turn.history[0].content, "hi");

        let mut ignored = request(Some(&turn.thread_id), "and now?");
        ignored.prior_history = vec![Message::user("should not appear")];
        let turn = runtime.handle_message(ignored).await.expect("second turn");
        assert_eq!(turn.history.len(), 6);
        assert!(turn.history.iter().all(|message| message.content != "should not appear"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_turns_on_one_thread_do_not_interleave() {
        let runtime = Arc::new(runtime_with(
            seeded_store().await,
            Arc::new(InMemorySessionStore::default()),
            llm(),
        ));
        let thread_id = ThreadId::generate();

        let handles: Vec<_> = (0..2)
            .map(|index| {
                let runtime = Arc::clone(&runtime);
                let thread_id = thread_id.clone();
                tokio::spawn(async move {
                    runtime
                        .handle_message(request(Some(&thread_id), &format!("hello number {index}")))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("turn");
        }

        let history = runtime.sessions().get_history(&thread_id).await.expect("history");
        let roles: Vec<_> = history.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::User, MessageRole::Assistant]
        );
    }

    #[tokio::test]
    async fn idle_threads_are_evicted() {
        let runtime =
            runtime_with(seeded_store().await, Arc::new(InMemorySessionStore::default()), llm());
        let turn = runtime.handle_message(request(None, "hello")).await.expect("turn");

        assert_eq!(runtime.evict_idle_threads(Duration::ZERO).await.expect("evict"), 1);
        assert!(runtime.sessions().get_history(&turn.thread_id).await.expect("history").is_empty());
    }
}
