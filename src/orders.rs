use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::RetryReport;
use crate::partner::{PartnerOrderClient, PartnerOrderError, PartnerOrderItem, PartnerOrderPayload};
use crate::store::commerce::{OrderLineRow, OrderRow};
use crate::store::orders::OrderSyncRecord;
use crate::store::{CommerceStore, OrderSyncStore, StoreError, TrackingStore};

#[derive(Debug, Error)]
pub enum OrderSyncError {
    #[error("partner credentials are not configured")]
    NotConfigured,
    #[error("order {0} not found")]
    OrderNotFound(i64),
    #[error("order {0} has no lines fulfilled by the partner")]
    NoPartnerLines(i64),
    #[error("order {0} has not been forwarded yet")]
    NotForwarded(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Partner(#[from] PartnerOrderError),
}

/// Narrows a storefront status onto the vocabulary the partner accepts.
/// Anything unrecognized is pushed as `pending` rather than refused.
pub fn partner_status(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "processing" => "processing",
        "on-hold" => "on-hold",
        "completed" => "completed",
        "cancelled" => "cancelled",
        "refunded" => "refunded",
        "failed" => "failed",
        _ => "pending",
    }
}

/// Forwards local orders to the fulfillment partner and keeps the
/// per-order sync ledger honest about what happened.
pub struct OrderSyncHandler {
    commerce: CommerceStore,
    tracking: TrackingStore,
    sync_store: OrderSyncStore,
    partner: Option<Arc<PartnerOrderClient>>,
}

impl OrderSyncHandler {
    pub fn new(
        commerce: CommerceStore,
        tracking: TrackingStore,
        sync_store: OrderSyncStore,
        partner: Option<Arc<PartnerOrderClient>>,
    ) -> Self {
        Self {
            commerce,
            tracking,
            sync_store,
            partner,
        }
    }

    /// Submits the partner-fulfilled share of an order and returns the
    /// partner's reference. Lines whose SKU is unknown locally or was
    /// never imported from the source are left out; an order with none of
    /// ours is refused outright. Safe to call again after a failure: the
    /// ledger row is overwritten, not duplicated.
    pub async fn forward(&self, order_id: i64) -> Result<String, OrderSyncError> {
        let partner = self.partner.as_ref().ok_or(OrderSyncError::NotConfigured)?;
        let (order, lines) = self
            .commerce
            .order_with_lines(order_id)
            .await?
            .ok_or(OrderSyncError::OrderNotFound(order_id))?;

        let mut items = Vec::new();
        for line in &lines {
            if self.is_partner_line(line).await? {
                items.push(PartnerOrderItem {
                    sku: line.sku.clone(),
                    qty: line.quantity,
                });
            }
        }
        if items.is_empty() {
            return Err(OrderSyncError::NoPartnerLines(order_id));
        }

        let previous_retries = self
            .sync_store
            .record_for_order(order_id)
            .await?
            .map(|record| record.retry_count)
            .unwrap_or(0);
        self.sync_store
            .upsert(order_id, "pending", None, None, previous_retries)
            .await?;

        let payload = build_payload(&order, items);
        match partner.submit_order(&payload).await {
            Ok(reference) => {
                self.sync_store
                    .upsert(order_id, "success", Some(&reference), None, previous_retries)
                    .await?;
                crate::metrics::order_forwarded("success");
                info!(
                    target = "caravel.orders",
                    order_id,
                    reference = reference.as_str(),
                    "order forwarded"
                );
                Ok(reference)
            }
            Err(err) => {
                self.sync_store
                    .upsert(
                        order_id,
                        "failed",
                        None,
                        Some(&err.to_string()),
                        previous_retries + 1,
                    )
                    .await?;
                crate::metrics::order_forwarded("failed");
                warn!(
                    target = "caravel.orders",
                    order_id, error = %err, "order forward failed"
                );
                Err(OrderSyncError::Partner(err))
            }
        }
    }

    /// Re-runs [`OrderSyncHandler::forward`] for one order that was
    /// attempted before. An order the ledger has never seen is refused so a
    /// typo'd id cannot trigger a first submission, and an order already
    /// through hands back its existing reference instead of submitting a
    /// duplicate.
    pub async fn retry(&self, order_id: i64) -> Result<String, OrderSyncError> {
        let record = self
            .sync_store
            .record_for_order(order_id)
            .await?
            .ok_or(OrderSyncError::NotForwarded(order_id))?;
        if record.status == "success"
            && let Some(reference) = record.partner_reference
        {
            return Ok(reference);
        }
        self.forward(order_id).await
    }

    /// Re-runs [`OrderSyncHandler::forward`] for every order whose ledger
    /// row is not `success`. Individual failures are tallied, never fatal.
    pub async fn retry_failed(&self) -> Result<RetryReport, OrderSyncError> {
        let pending = self.sync_store.non_success().await?;
        let mut report = RetryReport {
            attempted: pending.len(),
            ..RetryReport::default()
        };
        for record in pending {
            match self.forward(record.order_id).await {
                Ok(_) => report.succeeded += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = "caravel.orders",
                        order_id = record.order_id,
                        error = %err,
                        "retry failed"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Pushes a status change to the partner for an order that was already
    /// forwarded, then mirrors the narrowed status locally. Returns the
    /// status actually pushed.
    pub async fn push_status(
        &self,
        order_id: i64,
        raw_status: &str,
    ) -> Result<&'static str, OrderSyncError> {
        let partner = self.partner.as_ref().ok_or(OrderSyncError::NotConfigured)?;
        let record = self
            .sync_store
            .record_for_order(order_id)
            .await?
            .ok_or(OrderSyncError::NotForwarded(order_id))?;
        let Some(reference) = record.partner_reference.as_deref() else {
            return Err(OrderSyncError::NotForwarded(order_id));
        };

        let status = partner_status(raw_status);
        partner.update_order_status(reference, status).await?;
        self.commerce.set_order_status(order_id, status).await?;
        Ok(status)
    }

    pub async fn sync_record(
        &self,
        order_id: i64,
    ) -> Result<Option<OrderSyncRecord>, StoreError> {
        self.sync_store.record_for_order(order_id).await
    }

    /// The partner's live view of a forwarded order, raw JSON as they
    /// report it (status, tracking numbers, whatever they add).
    pub async fn partner_details(
        &self,
        order_id: i64,
    ) -> Result<serde_json::Value, OrderSyncError> {
        let partner = self.partner.as_ref().ok_or(OrderSyncError::NotConfigured)?;
        let record = self
            .sync_store
            .record_for_order(order_id)
            .await?
            .ok_or(OrderSyncError::NotForwarded(order_id))?;
        let Some(reference) = record.partner_reference.as_deref() else {
            return Err(OrderSyncError::NotForwarded(order_id));
        };
        Ok(partner.order_details(reference).await?)
    }

    /// A line is the partner's to fulfill when its SKU maps to a local
    /// product that was imported from the source catalog.
    async fn is_partner_line(&self, line: &OrderLineRow) -> Result<bool, StoreError> {
        let Some(product) = self.commerce.find_by_sku(&line.sku).await? else {
            return Ok(false);
        };
        Ok(self.tracking.source_id_for(product.id).await?.is_some())
    }
}

fn field_or<'a>(primary: Option<&'a str>, fallback: &'a str) -> &'a str {
    match primary.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => fallback,
    }
}

/// Shipping fields win per-field, falling back to billing wherever the
/// shipping side is blank. The telephone is always the billing one; the
/// partner has no shipping-phone slot.
fn build_payload(order: &OrderRow, items: Vec<PartnerOrderItem>) -> PartnerOrderPayload {
    PartnerOrderPayload {
        your_order_no: order.id.to_string(),
        first_name: field_or(order.shipping_first_name.as_deref(), &order.billing_first_name)
            .to_string(),
        last_name: field_or(order.shipping_last_name.as_deref(), &order.billing_last_name)
            .to_string(),
        address1: field_or(order.shipping_address1.as_deref(), &order.billing_address1)
            .to_string(),
        address2: field_or(order.shipping_address2.as_deref(), &order.billing_address2)
            .to_string(),
        suburb: field_or(order.shipping_suburb.as_deref(), &order.billing_suburb).to_string(),
        state: field_or(order.shipping_state.as_deref(), &order.billing_state).to_string(),
        postcode: field_or(order.shipping_postcode.as_deref(), &order.billing_postcode)
            .to_string(),
        telephone: order.billing_phone.clone(),
        comment: order.customer_note.clone().unwrap_or_default(),
        order_items: items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AddressIngest, OrderIngest, OrderLineIngest};
    use crate::partner::AuthTokenProvider;
    use crate::store::test_pool;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        handler: OrderSyncHandler,
        commerce: CommerceStore,
        tracking: TrackingStore,
        sync_store: OrderSyncStore,
    }

    async fn fixture(server: &MockServer) -> Fixture {
        let pool = test_pool().await;
        let commerce = CommerceStore::new(pool.clone());
        let tracking = TrackingStore::new(pool.clone());
        let sync_store = OrderSyncStore::new(pool);
        let auth =
            AuthTokenProvider::with_base_url("ops@example.com", "secret", &server.uri(), None);
        let partner = Arc::new(PartnerOrderClient::new(Arc::new(auth)));
        Fixture {
            handler: OrderSyncHandler::new(
                commerce.clone(),
                tracking.clone(),
                sync_store.clone(),
                Some(partner),
            ),
            commerce,
            tracking,
            sync_store,
        }
    }

    async fn mount_auth(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token": "tok-1",
                "exp": Utc::now().timestamp() + 7200,
            })))
            .mount(server)
            .await;
    }

    async fn seed_tracked_product(fixture: &Fixture, sku: &str, source_id: i64) -> i64 {
        let product_id = fixture.commerce.create_shell(sku).await.expect("shell");
        fixture
            .tracking
            .upsert(source_id, product_id)
            .await
            .expect("track");
        product_id
    }

    fn order(order_id: i64, lines: Vec<(&str, i64)>) -> OrderIngest {
        OrderIngest {
            order_id,
            status: "pending".to_string(),
            billing: AddressIngest {
                first_name: "May".to_string(),
                last_name: "Chen".to_string(),
                address1: "12 Harbour St".to_string(),
                suburb: "Sydney".to_string(),
                state: "NSW".to_string(),
                postcode: "2000".to_string(),
                phone: "0400000000".to_string(),
                ..AddressIngest::default()
            },
            shipping: Some(AddressIngest {
                postcode: "3000".to_string(),
                suburb: "Melbourne".to_string(),
                state: "VIC".to_string(),
                ..AddressIngest::default()
            }),
            customer_note: None,
            lines: lines
                .into_iter()
                .map(|(sku, quantity)| OrderLineIngest {
                    sku: sku.to_string(),
                    quantity,
                    name: String::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn forward_submits_only_partner_lines_with_shipping_fallback() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        // Shipping gave suburb/state/postcode but no name, so the name
        // comes from billing while the address keeps the shipping side.
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .and(body_partial_json(json!({
                "your_order_no": "1001",
                "first_name": "May",
                "suburb": "Melbourne",
                "state": "VIC",
                "postcode": "3000",
                "telephone": "0400000000",
                "order_items": [{"sku": "DSZ-100", "qty": 2}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"status": 1, "serial_number": "S-9"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(&server).await;
        seed_tracked_product(&fixture, "DSZ-100", 4411).await;
        fixture
            .commerce
            .upsert_order(&order(1001, vec![("DSZ-100", 2), ("OTHER-1", 1)]))
            .await
            .expect("ingest");

        let reference = fixture.handler.forward(1001).await.expect("forward");
        assert_eq!(reference, "S-9");

        let record = fixture
            .sync_store
            .record_for_order(1001)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(record.status, "success");
        assert_eq!(record.partner_reference.as_deref(), Some("S-9"));
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn rejected_order_is_recorded_then_retried_clean() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"errmsg": "warehouse offline"}
            ])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"status": 1, "serial_number": "S-2"}
            ])))
            .mount(&server)
            .await;

        let fixture = fixture(&server).await;
        seed_tracked_product(&fixture, "DSZ-100", 4411).await;
        fixture
            .commerce
            .upsert_order(&order(1002, vec![("DSZ-100", 1)]))
            .await
            .expect("ingest");

        let err = fixture.handler.forward(1002).await.expect_err("rejected");
        assert!(matches!(
            err,
            OrderSyncError::Partner(PartnerOrderError::Rejected(_))
        ));
        let record = fixture
            .sync_store
            .record_for_order(1002)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(record.status, "failed");
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.as_deref().unwrap().contains("warehouse"));

        let reference = fixture.handler.forward(1002).await.expect("retry");
        assert_eq!(reference, "S-2");
        let record = fixture
            .sync_store
            .record_for_order(1002)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(record.status, "success");
        assert!(record.last_error.is_none());
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn order_without_partner_lines_is_refused_before_any_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fixture = fixture(&server).await;
        fixture
            .commerce
            .upsert_order(&order(1003, vec![("UNKNOWN-1", 1)]))
            .await
            .expect("ingest");

        let err = fixture.handler.forward(1003).await.expect_err("refused");
        assert!(matches!(err, OrderSyncError::NoPartnerLines(1003)));
        assert!(
            fixture
                .sync_store
                .record_for_order(1003)
                .await
                .expect("read")
                .is_none()
        );
    }

    #[tokio::test]
    async fn status_push_requires_a_forwarded_order() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"status": 1, "serial_number": "S-5"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orderStatus"))
            .and(body_partial_json(json!({
                "serial_number": "S-5",
                "status": "completed",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(&server).await;
        seed_tracked_product(&fixture, "DSZ-100", 4411).await;
        fixture
            .commerce
            .upsert_order(&order(1004, vec![("DSZ-100", 1)]))
            .await
            .expect("ingest");

        let err = fixture
            .handler
            .push_status(1004, "completed")
            .await
            .expect_err("not forwarded yet");
        assert!(matches!(err, OrderSyncError::NotForwarded(1004)));

        fixture.handler.forward(1004).await.expect("forward");
        let pushed = fixture
            .handler
            .push_status(1004, " Completed ")
            .await
            .expect("push");
        assert_eq!(pushed, "completed");

        let (order, _) = fixture
            .commerce
            .order_with_lines(1004)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(order.status, "completed");
    }

    #[tokio::test]
    async fn retry_reforwards_failures_but_never_duplicates_success() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"errmsg": "carrier cutoff"}
            ])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"status": 1, "serial_number": "S-31"}
            ])))
            // One failed attempt plus one successful retry; the retry of an
            // already-successful order must not reach the wire.
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(&server).await;
        seed_tracked_product(&fixture, "DSZ-100", 4411).await;
        fixture
            .commerce
            .upsert_order(&order(3001, vec![("DSZ-100", 1)]))
            .await
            .expect("ingest");

        let err = fixture.handler.retry(3002).await.expect_err("unknown");
        assert!(matches!(err, OrderSyncError::NotForwarded(3002)));

        fixture.handler.forward(3001).await.expect_err("rejected");
        let reference = fixture.handler.retry(3001).await.expect("retry");
        assert_eq!(reference, "S-31");
        assert_eq!(fixture.handler.retry(3001).await.expect("replay"), "S-31");
    }

    #[tokio::test]
    async fn retry_failed_tallies_per_order_outcomes() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .and(body_partial_json(json!({"your_order_no": "2001"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"status": 1, "serial_number": "S-20"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/placingOrder"))
            .and(body_partial_json(json!({"your_order_no": "2002"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"errmsg": "still offline"}
            ])))
            .mount(&server)
            .await;

        let fixture = fixture(&server).await;
        seed_tracked_product(&fixture, "DSZ-100", 4411).await;
        for order_id in [2001, 2002] {
            fixture
                .commerce
                .upsert_order(&order(order_id, vec![("DSZ-100", 1)]))
                .await
                .expect("ingest");
            fixture
                .sync_store
                .upsert(order_id, "failed", None, Some("boot"), 1)
                .await
                .expect("seed ledger");
        }

        let report = fixture.handler.retry_failed().await.expect("retry");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn unknown_statuses_narrow_to_pending() {
        assert_eq!(partner_status("Processing"), "processing");
        assert_eq!(partner_status("REFUNDED"), "refunded");
        assert_eq!(partner_status("shipped"), "pending");
        assert_eq!(partner_status(""), "pending");
    }
}
