use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use returndesk_db::RepositoryError;

/// Failures of the external capabilities a turn depends on.
///
/// None of these leave a turn: branch executors turn them into context notes
/// and the composer falls back to a fixed reply.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("route classification was ambiguous: {0}")]
    ClassificationAmbiguous(String),
    #[error("lookup unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("query rejected: {0}")]
    QueryInvalid(String),
    #[error("completion service unavailable: {0}")]
    CompletionUnavailable(String),
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: &'static str, timeout_secs: u64 },
}

impl AgentError {
    pub fn completion(error: anyhow::Error) -> Self {
        Self::CompletionUnavailable(format!("{error:#}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClassificationAmbiguous(_) => "classification_ambiguous",
            Self::RetrievalUnavailable(_) => "retrieval_unavailable",
            Self::QueryInvalid(_) => "query_invalid",
            Self::CompletionUnavailable(_) => "completion_unavailable",
            Self::Timeout { .. } => "timeout",
        }
    }
}

impl From<RepositoryError> for AgentError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(sqlx::Error::Database(db)) => {
                Self::QueryInvalid(db.to_string())
            }
            RepositoryError::UnknownTable(table) => {
                Self::QueryInvalid(format!("unknown table `{table}`"))
            }
            other => Self::RetrievalUnavailable(other.to_string()),
        }
    }
}

/// Bounds one external call; an elapsed deadline becomes [`AgentError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    future: F,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout { operation, timeout_secs: limit.as_secs() }),
    }
}
