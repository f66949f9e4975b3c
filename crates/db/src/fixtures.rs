use chrono::{DateTime, Duration, Utc};
use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

pub const DEMO_DELIVERED_RECENT: &str = "e481f51cbdc54678b7cc49136f2d6af7";
pub const DEMO_DELIVERED_STALE: &str = "53cdb2fc8bc7dce0b6741e2150273451";
pub const DEMO_SHIPPED: &str = "47770eb9100c2d0c44946d9cf07ec65d";
pub const DEMO_RETURNED: &str = "949d5b44dbf5de918fe9c16f97b45f8a";
pub const DEMO_CANCELED: &str = "ad21c59c0840e6cb83a9ceb5573f8159";

/// Deterministic demo orders. Dates are offsets from "now" so the return window
/// checks keep meaning the same thing whenever the dataset is loaded.
const DEMO_ORDERS: &[DemoOrderContract] = &[
    DemoOrderContract {
        order_id: DEMO_DELIVERED_RECENT,
        customer_id: "9ef432eb6251297304e76186b10a928d",
        status: "delivered",
        purchased_days_ago: 16,
        delivered_days_ago: Some(10),
        product_id: "87285b34884572647811a353c7ac498a",
        price: 29.99,
        description: "delivered ten days ago, inside the return window",
    },
    DemoOrderContract {
        order_id: DEMO_DELIVERED_STALE,
        customer_id: "b0830fb4747a6c6d20dea0b8c802d7ef",
        status: "delivered",
        purchased_days_ago: 52,
        delivered_days_ago: Some(45),
        product_id: "595fac2a385ac33a80bd5114aec74eb8",
        price: 118.70,
        description: "delivered 45 days ago, outside the return window",
    },
    DemoOrderContract {
        order_id: DEMO_SHIPPED,
        customer_id: "41ce2a54c0b03bf3443c3d931a367089",
        status: "shipped",
        purchased_days_ago: 4,
        delivered_days_ago: None,
        product_id: "aa4383b373c6aca5d8797843e5594415",
        price: 159.90,
        description: "in transit",
    },
    DemoOrderContract {
        order_id: DEMO_RETURNED,
        customer_id: "f88197465ea7920adcdbec7375364d82",
        status: "returned",
        purchased_days_ago: 30,
        delivered_days_ago: Some(22),
        product_id: "d0b61bfb1de832b15ba9d266ca96e5b0",
        price: 45.00,
        description: "already returned",
    },
    DemoOrderContract {
        order_id: DEMO_CANCELED,
        customer_id: "8ab97904e6daea8866dbdbc4fb7aad2c",
        status: "canceled",
        purchased_days_ago: 8,
        delivered_days_ago: None,
        product_id: "65266b2da20d04dbe00c5c2d3bb7859e",
        price: 19.90,
        description: "canceled before shipping",
    },
];

const DEMO_SELLER_ID: &str = "3504c0cb71d7fa48d967e0e4c94d59d9";

struct DemoOrderContract {
    order_id: &'static str,
    customer_id: &'static str,
    status: &'static str,
    purchased_days_ago: i64,
    delivered_days_ago: Option<i64>,
    product_id: &'static str,
    price: f64,
    description: &'static str,
}

pub struct DemoDataset;

impl DemoDataset {
    /// Loads (or reloads) the demo orders. Existing demo rows are replaced.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        Self::load_at(pool, Utc::now()).await
    }

    pub async fn load_at(pool: &DbPool, now: DateTime<Utc>) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(
            sqlx::query(
                "INSERT OR IGNORE INTO sellers (seller_id, seller_zip_code_prefix, seller_city, seller_state)
                 VALUES (?, '13023', 'campinas', 'SP')",
            )
            .bind(DEMO_SELLER_ID),
        )
        .await?;

        for order in DEMO_ORDERS {
            let purchased = now - Duration::days(order.purchased_days_ago);
            let delivered = order.delivered_days_ago.map(|days| now - Duration::days(days));

            tx.execute(
                sqlx::query(
                    "INSERT OR IGNORE INTO customers
                        (customer_id, customer_unique_id, customer_zip_code_prefix, customer_city, customer_state)
                     VALUES (?, ?, '01310', 'sao paulo', 'SP')",
                )
                .bind(order.customer_id)
                .bind(format!("u-{}", order.customer_id)),
            )
            .await?;

            tx.execute(
                sqlx::query(
                    "INSERT OR IGNORE INTO products (product_id, product_category_name, product_weight_g)
                     VALUES (?, 'utilidades_domesticas', 500)",
                )
                .bind(order.product_id),
            )
            .await?;

            tx.execute(sqlx::query("DELETE FROM order_items WHERE order_id = ?").bind(order.order_id))
                .await?;
            tx.execute(
                sqlx::query("DELETE FROM order_payments WHERE order_id = ?").bind(order.order_id),
            )
            .await?;

            tx.execute(
                sqlx::query(
                    "INSERT INTO orders
                        (order_id, customer_id, order_status, order_purchase_timestamp,
                         order_approved_at, order_delivered_carrier_date,
                         order_delivered_customer_date, order_estimated_delivery_date)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(order_id) DO UPDATE SET
                        order_status = excluded.order_status,
                        order_purchase_timestamp = excluded.order_purchase_timestamp,
                        order_approved_at = excluded.order_approved_at,
                        order_delivered_carrier_date = excluded.order_delivered_carrier_date,
                        order_delivered_customer_date = excluded.order_delivered_customer_date,
                        order_estimated_delivery_date = excluded.order_estimated_delivery_date",
                )
                .bind(order.order_id)
                .bind(order.customer_id)
                .bind(order.status)
                .bind(store_timestamp(purchased))
                .bind(store_timestamp(purchased + Duration::hours(2)))
                .bind(delivered.map(|at| store_timestamp(at - Duration::days(3))))
                .bind(delivered.map(store_timestamp))
                .bind(store_timestamp(purchased + Duration::days(14))),
            )
            .await?;

            tx.execute(
                sqlx::query(
                    "INSERT INTO order_items
                        (order_id, order_item_id, product_id, seller_id, shipping_limit_date, price, freight_value)
                     VALUES (?, 1, ?, ?, ?, ?, 8.72)",
                )
                .bind(order.order_id)
                .bind(order.product_id)
                .bind(DEMO_SELLER_ID)
                .bind(store_timestamp(purchased + Duration::days(2)))
                .bind(order.price),
            )
            .await?;

            tx.execute(
                sqlx::query(
                    "INSERT INTO order_payments
                        (order_id, payment_sequential, payment_type, payment_installments, payment_value)
                     VALUES (?, 1, 'credit_card', 1, ?)",
                )
                .bind(order.order_id)
                .bind(order.price + 8.72),
            )
            .await?;
        }

        tx.commit().await?;

        let orders_seeded = DEMO_ORDERS
            .iter()
            .map(|order| DemoOrderInfo {
                order_id: order.order_id,
                status: order.status,
                description: order.description,
            })
            .collect();

        Ok(SeedResult { orders_seeded })
    }

    /// Checks that every demo order is present with its seeded status and one line item.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for order in DEMO_ORDERS {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM orders WHERE order_id = ?1 AND order_status = ?2)",
            )
            .bind(order.order_id)
            .bind(order.status)
            .fetch_one(pool)
            .await?;
            checks.push((order.order_id, present == 1));

            let items: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM order_items WHERE order_id = ?1")
                    .bind(order.order_id)
                    .fetch_one(pool)
                    .await?;
            checks.push(("order-items", items == 1));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

fn store_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Clone, Debug)]
pub struct SeedResult {
    pub orders_seeded: Vec<DemoOrderInfo>,
}

#[derive(Clone, Debug)]
pub struct DemoOrderInfo {
    pub order_id: &'static str,
    pub status: &'static str,
    pub description: &'static str,
}

#[derive(Clone, Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
