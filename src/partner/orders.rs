use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::http::build_client;
use crate::partner::auth::{AuthTokenProvider, PartnerAuthError};

#[derive(Debug, Error)]
pub enum PartnerOrderError {
    #[error(transparent)]
    Auth(#[from] PartnerAuthError),
    #[error("order request failed: {0}")]
    Request(String),
    #[error("partner returned HTTP {0}")]
    Status(u16),
    #[error("partner rejected the order: {0}")]
    Rejected(String),
    #[error("partner response carried no usable acknowledgement")]
    MalformedAck,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartnerOrderItem {
    pub sku: String,
    pub qty: i64,
}

/// The order document the partner expects: flattened shipping address
/// plus SKU/quantity lines. `your_order_no` is our order id and is the
/// partner's dedup key.
#[derive(Debug, Clone, Serialize)]
pub struct PartnerOrderPayload {
    pub your_order_no: String,
    pub first_name: String,
    pub last_name: String,
    pub address1: String,
    pub address2: String,
    pub suburb: String,
    pub state: String,
    pub postcode: String,
    pub telephone: String,
    pub comment: String,
    pub order_items: Vec<PartnerOrderItem>,
}

/// The partner wraps both success and failure in a one-element array.
#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    serial_number: Option<Value>,
    #[serde(default)]
    errmsg: Option<String>,
}

/// Client for the fulfillment partner's order endpoints. Every call
/// carries a JWT from [`AuthTokenProvider`]; a 401 is retried exactly
/// once with a force-refreshed token.
pub struct PartnerOrderClient {
    client: Client,
    auth: Arc<AuthTokenProvider>,
}

impl PartnerOrderClient {
    pub fn new(auth: Arc<AuthTokenProvider>) -> Self {
        Self {
            client: build_client(),
            auth,
        }
    }

    /// Places the order and returns the partner's serial number.
    ///
    /// # Errors
    ///
    /// [`PartnerOrderError::Rejected`] carries the partner's own message
    /// when the order is refused; transport and decode trouble surface as
    /// [`PartnerOrderError::Request`] / [`PartnerOrderError::Status`].
    pub async fn submit_order(
        &self,
        payload: &PartnerOrderPayload,
    ) -> Result<String, PartnerOrderError> {
        let url = format!("{}/placingOrder", self.auth.base_url());
        let token = self.auth.get_token().await?;
        let mut response = self.post_with_token(&url, payload, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(
                target = "caravel.partner",
                order = payload.your_order_no.as_str(),
                "partner 401, refreshing token once"
            );
            let token = self.auth.force_refresh().await?;
            response = self.post_with_token(&url, payload, &token).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(PartnerOrderError::Status(status.as_u16()));
        }
        let acks: Vec<OrderAck> = response
            .json()
            .await
            .map_err(|err| PartnerOrderError::Request(err.to_string()))?;
        let ack = acks.into_iter().next().ok_or(PartnerOrderError::MalformedAck)?;

        if ack.status == Some(1) {
            let serial = ack
                .serial_number
                .as_ref()
                .and_then(serial_to_string)
                .ok_or(PartnerOrderError::MalformedAck)?;
            info!(
                target = "caravel.partner",
                order = payload.your_order_no.as_str(),
                serial = serial.as_str(),
                "order placed"
            );
            Ok(serial)
        } else {
            Err(PartnerOrderError::Rejected(
                ack.errmsg
                    .filter(|msg| !msg.trim().is_empty())
                    .unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }

    /// Pushes a status change for a previously placed order, addressed by
    /// the partner's serial number.
    pub async fn update_order_status(
        &self,
        serial_number: &str,
        status: &str,
    ) -> Result<(), PartnerOrderError> {
        let url = format!("{}/orderStatus", self.auth.base_url());
        let body = serde_json::json!({
            "serial_number": serial_number,
            "status": status,
        });
        let token = self.auth.get_token().await?;
        let mut response = self.post_with_token(&url, &body, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let token = self.auth.force_refresh().await?;
            response = self.post_with_token(&url, &body, &token).await?;
        }
        let http_status = response.status();
        if !http_status.is_success() {
            return Err(PartnerOrderError::Status(http_status.as_u16()));
        }
        info!(
            target = "caravel.partner",
            serial = serial_number,
            status,
            "order status pushed"
        );
        Ok(())
    }

    /// Fetches the partner's view of a placed order, addressed by its
    /// serial number. Returned as raw JSON for the admin surface to render.
    pub async fn order_details(&self, reference: &str) -> Result<Value, PartnerOrderError> {
        let url = format!("{}/orderDetails/{}", self.auth.base_url(), reference);
        let token = self.auth.get_token().await?;
        let mut response = self.get_with_token(&url, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let token = self.auth.force_refresh().await?;
            response = self.get_with_token(&url, &token).await?;
        }
        let status = response.status();
        if !status.is_success() {
            return Err(PartnerOrderError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| PartnerOrderError::Request(err.to_string()))
    }

    async fn post_with_token<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        token: &str,
    ) -> Result<reqwest::Response, PartnerOrderError> {
        self.client
            .post(url)
            .header("Authorization", format!("jwt {token}"))
            .json(body)
            .send()
            .await
            .map_err(|err| PartnerOrderError::Request(err.to_string()))
    }

    async fn get_with_token(
        &self,
        url: &str,
        token: &str,
    ) -> Result<reqwest::Response, PartnerOrderError> {
        self.client
            .get(url)
            .header("Authorization", format!("jwt {token}"))
            .send()
            .await
            .map_err(|err| PartnerOrderError::Request(err.to_string()))
    }
}

fn serial_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(serial) if !serial.is_empty() => Some(serial.clone()),
        Value::Number(serial) => Some(serial.to_string()),
        _ => None,
    }
}
