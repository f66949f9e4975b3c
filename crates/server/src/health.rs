use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use returndesk_db::DbPool;
use serde::Serialize;

use crate::bootstrap::PolicyStatus;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub policy: PolicyStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub policy_document: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let policy_document = policy_check(&state.policy);
    let ready = database.status == "ready" && policy_document.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "returndesk-server runtime initialized".to_string(),
        },
        database,
        policy_document,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM orders").fetch_one(pool).await {
        Ok(orders) => HealthCheck { status: "ready", detail: format!("order store reachable ({orders} orders)") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("order store query failed: {error}") }
        }
    }
}

fn policy_check(policy: &PolicyStatus) -> HealthCheck {
    if policy.passages == 0 {
        return HealthCheck { status: "degraded", detail: format!("{} has no passages", policy.source) };
    }
    HealthCheck {
        status: "ready",
        detail: format!("{} passages loaded from {}", policy.passages, policy.source),
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use returndesk_db::{connect_with_settings, migrations};

    use crate::bootstrap::PolicyStatus;
    use crate::health::{health, HealthState};

    fn policy() -> PolicyStatus {
        PolicyStatus { source: "docs/return-policy.md".to_string(), passages: 6 }
    }

    #[tokio::test]
    async fn health_returns_ready_when_store_and_policy_are_available() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), policy: policy() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert!(payload.policy_document.detail.contains("6 passages"));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_is_degraded_before_migrations() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool, policy: policy() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_closed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool, policy: policy() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.database.status, "degraded");
    }
}
