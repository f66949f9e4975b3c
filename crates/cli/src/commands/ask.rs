use std::sync::Arc;

use returndesk_agent::retrieval::PolicyDocumentRetriever;
use returndesk_agent::{AgentDependencies, AgentRuntime, ChatTurnRequest};
use returndesk_core::domain::conversation::ThreadId;
use returndesk_db::{connect_with_settings, migrations, session_store_for, SqliteDataStore};
use serde_json::json;

use crate::commands::{prepare, CommandResult};

/// Runs one chat turn against the configured services and prints the reply.
///
/// With the `sqlite` session backend, `thread_id` continues an earlier conversation.
pub fn run(message: &str, thread_id: Option<String>) -> CommandResult {
    let (config, runtime) = match prepare("ask") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let retriever =
        match PolicyDocumentRetriever::load(&config.policy.document_path, config.policy.max_passages) {
            Ok(retriever) => retriever,
            Err(error) => {
                return CommandResult::failure("ask", "policy_document", format!("{error:#}"), 2);
            }
        };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let deps = AgentDependencies::from_config(
            &config,
            Arc::new(SqliteDataStore::new(pool.clone())),
            session_store_for(&config.sessions, &pool),
            Arc::new(retriever),
        )
        .map_err(|error| ("agent_assembly", error.to_string(), 2u8))?;
        let agent = AgentRuntime::from_config(&config, deps);

        let turn = agent
            .handle_message(ChatTurnRequest {
                thread_id: thread_id.map(ThreadId),
                message: message.to_string(),
                prior_history: Vec::new(),
            })
            .await
            .map_err(|error| ("chat_turn", error.to_string(), 7u8))?;

        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(turn)
    });

    match result {
        Ok(turn) => CommandResult::success_with_details(
            "ask",
            turn.reply,
            json!({
                "thread_id": turn.thread_id.as_str(),
                "route": turn.route.as_str(),
                "history_len": turn.history.len(),
            }),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ask", error_class, message, exit_code)
        }
    }
}
