use std::path::PathBuf;
use std::sync::Arc;

use returndesk_agent::retrieval::PolicyDocumentRetriever;
use returndesk_agent::{AgentDependencies, AgentRuntime, AssemblyError};
use returndesk_core::config::{AppConfig, ConfigError, LoadOptions};
use returndesk_db::{connect_with_settings, migrations, session_store_for, DbPool, SqliteDataStore};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub policy: PolicyStatus,
}

/// What was loaded from the policy document at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    pub source: String,
    pub passages: usize,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("policy document `{path}` could not be loaded: {reason}")]
    PolicyDocument { path: PathBuf, reason: String },
    #[error(transparent)]
    Agent(#[from] AssemblyError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let retriever = PolicyDocumentRetriever::load(&config.policy.document_path, config.policy.max_passages)
        .map_err(|error| BootstrapError::PolicyDocument {
            path: config.policy.document_path.clone(),
            reason: format!("{error:#}"),
        })?;
    let policy = PolicyStatus {
        source: retriever.source().to_string(),
        passages: retriever.passage_count(),
    };
    info!(
        event_name = "system.bootstrap.policy_loaded",
        correlation_id = "bootstrap",
        source = %policy.source,
        passages = policy.passages,
        "policy document loaded"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let deps = AgentDependencies::from_config(
        &config,
        Arc::new(SqliteDataStore::new(db_pool.clone())),
        session_store_for(&config.sessions, &db_pool),
        Arc::new(retriever),
    )?;
    let runtime = Arc::new(AgentRuntime::from_config(&config, deps));
    info!(
        event_name = "system.bootstrap.agent_ready",
        correlation_id = "bootstrap",
        llm_provider = ?config.llm.provider,
        model = %config.llm.model,
        session_backend = ?config.sessions.backend,
        "agent runtime assembled"
    );

    Ok(Application { config, db_pool, runtime, policy })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use returndesk_core::config::{ConfigOverrides, LlmProvider, LoadOptions, SessionBackend};
    use tempfile::TempDir;

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn options(policy_path: &Path) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                policy_document_path: Some(policy_path.to_path_buf()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn missing_policy_document_fails_fast() {
        let dir = TempDir::new().expect("temp dir");
        let result = bootstrap(options(&dir.path().join("missing.md"))).await;

        match result {
            Err(BootstrapError::PolicyDocument { path, .. }) => {
                assert!(path.ends_with("missing.md"));
            }
            Err(other) => panic!("unexpected bootstrap error: {other}"),
            Ok(_) => panic!("bootstrap should fail without a policy document"),
        }
    }

    #[tokio::test]
    async fn openai_provider_without_key_is_a_config_error() {
        let dir = TempDir::new().expect("temp dir");
        let policy = dir.path().join("policy.md");
        fs::write(&policy, "# Returns\n\nReturns within 30 days.").expect("write policy");

        let mut options = options(&policy);
        options.overrides.llm_provider = Some(LlmProvider::OpenAi);
        let result = bootstrap(options).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("llm.api_key"), "got: {message}");
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_loads_policy() {
        let dir = TempDir::new().expect("temp dir");
        let policy = dir.path().join("policy.md");
        fs::write(&policy, "# Returns\n\nReturns within 30 days.\n\n# Refunds\n\nTo the card.")
            .expect("write policy");

        let mut options = options(&policy);
        options.overrides.session_backend = Some(SessionBackend::Sqlite);
        let app = bootstrap(options).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('orders', 'order_items', 'conversation_message')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 3);
        assert_eq!(app.policy.passages, 2);
        assert!(app.policy.source.ends_with("policy.md"));

        app.db_pool.close().await;
    }
}
