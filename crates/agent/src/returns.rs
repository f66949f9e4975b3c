use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use returndesk_core::domain::conversation::Message;
use returndesk_core::domain::order::{OrderId, OrderStatus};
use returndesk_core::errors::DomainError;
use returndesk_db::DataStoreGateway;

use crate::errors::{with_timeout, AgentError};
use crate::locks::KeyedLocks;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnReceipt {
    pub order_id: OrderId,
    pub previous_status: OrderStatus,
    pub processed_at: DateTime<Utc>,
}

impl ReturnReceipt {
    pub fn summary(&self) -> String {
        format!(
            "Order {} was registered as returned (previous status: {}).",
            self.order_id,
            self.previous_status.as_str()
        )
    }
}

#[derive(Debug, Error)]
pub enum ReturnFailure {
    #[error(transparent)]
    Rejected(#[from] DomainError),
    #[error("order store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ReturnFailure {
    pub fn summary(&self) -> String {
        match self {
            Self::Rejected(error) => error.user_message(),
            Self::StoreUnavailable(_) => {
                "The return could not be confirmed right now. Please check the order status before trying again."
                    .to_string()
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReturnSettings {
    pub enforce_window: bool,
    pub window_days: u32,
    pub call_timeout: Duration,
}

/// Marks orders as returned once a customer has confirmed.
///
/// Calls for the same order are serialized, so a repeated confirmation sees
/// the first one's write and reports `OrderAlreadyReturned`.
pub struct ReturnExecutor {
    data_store: Arc<dyn DataStoreGateway>,
    locks: KeyedLocks,
    settings: ReturnSettings,
}

impl ReturnExecutor {
    pub fn new(data_store: Arc<dyn DataStoreGateway>, settings: ReturnSettings) -> Self {
        Self { data_store, locks: KeyedLocks::new(), settings }
    }

    pub async fn process_return(
        &self,
        order_id: &OrderId,
        thread_context: &[Message],
    ) -> Result<ReturnReceipt, ReturnFailure> {
        let _guard = self.locks.lock(order_id.as_str()).await;

        if !thread_context.iter().any(|message| message.content.contains(order_id.as_str())) {
            warn!(
                event_name = "agent.returns.unmentioned_order",
                order_id = %order_id,
                "return requested for an order the thread never mentioned"
            );
        }

        let order = self.store_call("returns.find_order", self.data_store.find_order(order_id)).await?;
        let Some(order) = order else {
            return Err(DomainError::OrderNotFound { order_id: order_id.clone() }.into());
        };

        if order.status.is_returned() {
            return Err(DomainError::OrderAlreadyReturned { order_id: order_id.clone() }.into());
        }

        let now = Utc::now();
        match order.delivered_at {
            Some(delivered_at) if self.settings.enforce_window => {
                let days_since_delivery = (now - delivered_at).num_days();
                if days_since_delivery > i64::from(self.settings.window_days) {
                    return Err(DomainError::OutsideReturnWindow {
                        order_id: order_id.clone(),
                        days_since_delivery,
                        window_days: self.settings.window_days,
                    }
                    .into());
                }
            }
            Some(_) => {}
            None => {
                info!(
                    event_name = "agent.returns.unverified_eligibility",
                    order_id = %order_id,
                    status = order.status.as_str(),
                    "order has no delivery date; return window not checked"
                );
            }
        }

        // Not raced against call_timeout: a write abandoned mid-flight may still commit.
        let changed = self
            .data_store
            .update_order_status(order_id, &OrderStatus::Returned)
            .await
            .map_err(|error| {
                warn!(
                    event_name = "agent.returns.store_failed",
                    operation = "returns.update_status",
                    error = %error,
                    "order store call failed"
                );
                ReturnFailure::StoreUnavailable(error.to_string())
            })?;
        if !changed {
            return Err(DomainError::OrderAlreadyReturned { order_id: order_id.clone() }.into());
        }

        info!(
            event_name = "agent.returns.processed",
            order_id = %order_id,
            previous_status = order.status.as_str(),
            "order registered as returned"
        );

        Ok(ReturnReceipt { order_id: order_id.clone(), previous_status: order.status, processed_at: now })
    }

    async fn store_call<T, F>(&self, operation: &'static str, future: F) -> Result<T, ReturnFailure>
    where
        F: std::future::Future<Output = Result<T, returndesk_db::RepositoryError>>,
    {
        with_timeout(operation, self.settings.call_timeout, async {
            future.await.map_err(AgentError::from)
        })
        .await
        .map_err(|error| {
            warn!(event_name = "agent.returns.store_failed", operation, error = %error, "order store call failed");
            ReturnFailure::StoreUnavailable(error.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use returndesk_core::domain::conversation::Message;
    use returndesk_core::domain::order::{OrderId, OrderRecord, OrderStatus};
    use returndesk_core::errors::DomainError;
    use returndesk_db::fixtures::{
        DEMO_CANCELED, DEMO_DELIVERED_RECENT, DEMO_DELIVERED_STALE, DEMO_RETURNED,
    };
    use returndesk_db::migrations::run_pending;
    use returndesk_db::{
        connect_with_settings, DataStoreGateway, DemoDataset, QueryRow, RepositoryError,
        SqliteDataStore,
    };

    use super::{ReturnExecutor, ReturnFailure, ReturnSettings};

    async fn seeded() -> Arc<SqliteDataStore> {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        DemoDataset::load(&pool).await.expect("seed");
        Arc::new(SqliteDataStore::new(pool))
    }

    fn executor(store: Arc<SqliteDataStore>, enforce_window: bool) -> ReturnExecutor {
        ReturnExecutor::new(
            store,
            ReturnSettings { enforce_window, window_days: 30, call_timeout: Duration::from_secs(5) },
        )
    }

    /// Delegates to a real store but commits status writes slowly.
    struct SlowWriteStore {
        inner: Arc<SqliteDataStore>,
        write_delay: Duration,
    }

    #[async_trait]
    impl DataStoreGateway for SlowWriteStore {
        async fn list_tables(&self) -> Result<Vec<String>, RepositoryError> {
            self.inner.list_tables().await
        }

        async fn get_schema(&self, table_names: &[String]) -> Result<String, RepositoryError> {
            self.inner.get_schema(table_names).await
        }

        async fn execute(&self, query: &str) -> Result<Vec<QueryRow>, RepositoryError> {
            self.inner.execute(query).await
        }

        async fn find_order(&self, order_id: &OrderId) -> Result<Option<OrderRecord>, RepositoryError> {
            self.inner.find_order(order_id).await
        }

        async fn update_order_status(
            &self,
            order_id: &OrderId,
            status: &OrderStatus,
        ) -> Result<bool, RepositoryError> {
            tokio::time::sleep(self.write_delay).await;
            self.inner.update_order_status(order_id, status).await
        }
    }

    fn order(raw: &str) -> OrderId {
        OrderId(raw.to_string())
    }

    #[tokio::test]
    async fn confirmed_return_updates_status_once() {
        let store = seeded().await;
        let returns = executor(Arc::clone(&store), true);
        let id = order(DEMO_DELIVERED_RECENT);
        let context = [Message::user(format!("please return {DEMO_DELIVERED_RECENT}"))];

        let receipt = returns.process_return(&id, &context).await.expect("processed");
        assert_eq!(receipt.previous_status, OrderStatus::Delivered);
        assert!(receipt.summary().contains(DEMO_DELIVERED_RECENT));

        let stored = store.find_order(&id).await.expect("find").expect("order");
        assert!(stored.status.is_returned());

        let second = returns.process_return(&id, &context).await;
        assert!(matches!(
            second,
            Err(ReturnFailure::Rejected(DomainError::OrderAlreadyReturned { .. }))
        ));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found_and_writes_nothing() {
        let store = seeded().await;
        let before = store.execute("SELECT order_id, order_status FROM orders").await.expect("rows");

        let result = executor(Arc::clone(&store), true).process_return(&order("nosuchorder1"), &[]).await;

        assert!(matches!(result, Err(ReturnFailure::Rejected(DomainError::OrderNotFound { .. }))));
        let after = store.execute("SELECT order_id, order_status FROM orders").await.expect("rows");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn already_returned_order_is_rejected() {
        let store = seeded().await;
        let result = executor(store, true).process_return(&order(DEMO_RETURNED), &[]).await;
        assert!(matches!(
            result,
            Err(ReturnFailure::Rejected(DomainError::OrderAlreadyReturned { .. }))
        ));
    }

    #[tokio::test]
    async fn return_window_is_enforced_when_configured() {
        let store = seeded().await;
        let id = order(DEMO_DELIVERED_STALE);

        let result = executor(Arc::clone(&store), true).process_return(&id, &[]).await;
        match result {
            Err(ReturnFailure::Rejected(DomainError::OutsideReturnWindow {
                days_since_delivery,
                window_days,
                ..
            })) => {
                assert!(days_since_delivery > 30);
                assert_eq!(window_days, 30);
            }
            other => panic!("expected window rejection, got {other:?}"),
        }
        assert!(!store.find_order(&id).await.expect("find").expect("order").status.is_returned());

        executor(Arc::clone(&store), false).process_return(&id, &[]).await.expect("window off");
    }

    #[tokio::test]
    async fn undelivered_order_is_returned_without_window_check() {
        let store = seeded().await;
        let receipt =
            executor(store, true).process_return(&order(DEMO_CANCELED), &[]).await.expect("processed");
        assert_eq!(receipt.previous_status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn slow_status_write_is_reported_as_committed() {
        let store = seeded().await;
        let returns = ReturnExecutor::new(
            Arc::new(SlowWriteStore {
                inner: Arc::clone(&store),
                write_delay: Duration::from_millis(200),
            }),
            ReturnSettings {
                enforce_window: true,
                window_days: 30,
                call_timeout: Duration::from_millis(50),
            },
        );
        let id = order(DEMO_DELIVERED_RECENT);

        let receipt = returns.process_return(&id, &[]).await.expect("slow write still succeeds");
        assert_eq!(receipt.previous_status, OrderStatus::Delivered);
        assert!(store.find_order(&id).await.expect("find").expect("order").status.is_returned());
    }

    #[test]
    fn store_failure_summary_does_not_promise_nothing_changed() {
        let summary = ReturnFailure::StoreUnavailable("disk I/O error".to_string()).summary();
        assert!(!summary.contains("nothing was changed"));
        assert!(summary.contains("check the order status"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_confirmations_write_once() {
        let store = seeded().await;
        let returns = Arc::new(executor(store, true));
        let id = order(DEMO_DELIVERED_RECENT);

        let first = tokio::spawn({
            let returns = Arc::clone(&returns);
            let id = id.clone();
            async move { returns.process_return(&id, &[]).await.is_ok() }
        });
        let second = tokio::spawn({
            let returns = Arc::clone(&returns);
            let id = id.clone();
            async move { returns.process_return(&id, &[]).await.is_ok() }
        });

        let outcomes = [first.await.expect("join"), second.await.expect("join")];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    }
}
