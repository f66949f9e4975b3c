use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    /// Accepts identifiers made of ASCII alphanumerics, `-` and `_`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '.' | ','));
        let valid_length = (4..=64).contains(&trimmed.len());
        let valid_chars =
            trimmed.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        (valid_length && valid_chars).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Approved,
    Invoiced,
    Processing,
    Shipped,
    Delivered,
    Canceled,
    Unavailable,
    Returned,
    Other(String),
}

impl OrderStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "approved" => Self::Approved,
            "invoiced" => Self::Invoiced,
            "processing" => Self::Processing,
            "shipped" => Self::Shipped,
            "delivered" => Self::Delivered,
            "canceled" | "cancelled" => Self::Canceled,
            "unavailable" => Self::Unavailable,
            "returned" => Self::Returned,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Invoiced => "invoiced",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Canceled => "canceled",
            Self::Unavailable => "unavailable",
            Self::Returned => "returned",
            Self::Other(value) => value,
        }
    }

    /// `returned` is the only terminal state this service writes.
    pub fn is_returned(&self) -> bool {
        matches!(self, Self::Returned)
    }
}

/// Read-side view of an order owned by the external data store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Parses the timestamp shapes found in order exports (`2017-10-10 21:25:13`,
/// RFC 3339, or a bare date).
pub fn parse_store_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc());
    }
    chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}
