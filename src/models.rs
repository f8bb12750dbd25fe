use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::store::orders::OrderSyncRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    pub source_id: i64,
    /// Re-run every stage even when the product looks up to date.
    #[serde(default)]
    pub force_sync: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImportResponse {
    pub local_id: i64,
    pub sku: String,
    pub created: bool,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// An order as the storefront webhook delivers it. `order_id` is the
/// storefront's own id and stays the primary key locally.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderIngest {
    pub order_id: i64,
    #[serde(default = "default_order_status")]
    pub status: String,
    pub billing: AddressIngest,
    #[serde(default)]
    pub shipping: Option<AddressIngest>,
    #[serde(default)]
    pub customer_note: Option<String>,
    #[serde(default)]
    pub lines: Vec<OrderLineIngest>,
}

fn default_order_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressIngest {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub address1: String,
    #[serde(default)]
    pub address2: String,
    #[serde(default)]
    pub suburb: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub postcode: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderLineIngest {
    pub sku: String,
    pub quantity: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub order_id: i64,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatusPush {
    pub status: String,
}

/// Per-order sync ledger entry as the API reports it. Reference and error
/// are absent rather than null while an order has neither.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct OrderSyncStatus {
    pub order_id: i64,
    pub status: String,
    pub partner_reference: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub synced_at: DateTime<Utc>,
}

impl From<OrderSyncRecord> for OrderSyncStatus {
    fn from(record: OrderSyncRecord) -> Self {
        Self {
            order_id: record.order_id,
            status: record.status,
            partner_reference: record.partner_reference,
            last_error: record.last_error,
            retry_count: record.retry_count,
            synced_at: record.synced_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ingest_fills_webhook_gaps_with_defaults() {
        let raw = serde_json::json!({
            "order_id": 1001,
            "billing": {"first_name": "May", "postcode": "2000"},
            "lines": [{"sku": "DSZ-100", "quantity": 2}]
        });
        let order: OrderIngest = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(order.status, "pending");
        assert!(order.shipping.is_none());
        assert_eq!(order.billing.last_name, "");
        assert_eq!(order.lines[0].name, "");
    }

    #[test]
    fn import_request_defaults_to_a_plain_sync() {
        let request: ImportRequest =
            serde_json::from_value(serde_json::json!({"source_id": 4411})).expect("deserialize");
        assert!(!request.force_sync);
    }
}
