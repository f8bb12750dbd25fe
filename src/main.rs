mod catalog;
mod categories;
mod http;
mod idempotency;
mod images;
mod jobs;
mod metrics;
mod models;
mod orders;
mod partner;
mod pipeline;
mod security;
mod shipping;
mod source;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use categories::CategoryCache;
use images::{ImagePipeline, ImageSettings};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, ForwardResponse, ImportRequest, ImportResponse, OrderIngest, OrderSyncStatus,
    RetryReport, StatusPush,
};
use orders::{OrderSyncError, OrderSyncHandler};
use partner::{AuthTokenProvider, PartnerOrderClient};
use pipeline::{ImportPipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shipping::ZoneTable;
use source::SourceClient;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::{CommerceStore, OrderSyncStore, StoreError, TrackingStore};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "caravel.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());

    let pool = store::connect_from_env().await?;
    let commerce = CommerceStore::new(pool.clone());
    let tracking = TrackingStore::new(pool.clone());
    let sync_store = OrderSyncStore::new(pool);

    let categories = Arc::new(CategoryCache::from_env());
    if let Err(err) = categories.refresh() {
        warn!(
            target = "caravel.api",
            error = %err,
            "category snapshot not loaded; every import will flag its path as unknown",
        );
    }
    let zones = Arc::new(ZoneTable::new());

    let source = SourceClient::from_env();
    if source.is_none() {
        warn!(
            target = "caravel.api",
            "SOURCE_API_URL / SOURCE_API_TOKEN unset; imports and catalog search are disabled",
        );
    }
    let images = ImagePipeline::new(commerce.clone(), ImageSettings::from_env());
    let pipeline = ImportPipeline::new(
        source.clone(),
        commerce.clone(),
        tracking.clone(),
        images,
        categories.clone(),
        zones.clone(),
    );

    let partner = AuthTokenProvider::from_env(redis.clone())
        .map(|auth| Arc::new(PartnerOrderClient::new(Arc::new(auth))));
    if partner.is_none() {
        warn!(
            target = "caravel.api",
            "PARTNER_API_URL / PARTNER_EMAIL / PARTNER_PASSWORD unset; order forwarding is disabled",
        );
    }
    let orders = Arc::new(OrderSyncHandler::new(
        commerce.clone(),
        tracking.clone(),
        sync_store,
        partner,
    ));

    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let _resync = jobs::spawn_stale_resync(pipeline.clone(), tracking.clone());

    let auth_state = AuthState::from_env();
    let state = AppState {
        pipeline,
        queue,
        commerce,
        tracking,
        orders,
        source: source.map(Arc::new),
        categories,
        zones,
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/imports", post(run_import))
        .nest(
            "/jobs",
            Router::new()
                .route("/imports", post(enqueue_import_job))
                .route("/{id}", get(get_job_status)),
        )
        .nest(
            "/catalog",
            Router::new()
                .route("/records", get(search_catalog))
                .route("/categories", get(list_categories))
                .route("/categories/refresh", post(refresh_categories)),
        )
        .nest(
            "/tracking",
            Router::new()
                .route("/stats", get(tracking_stats))
                .route("/{source_id}", get(tracking_record).delete(untrack_record)),
        )
        .nest(
            "/shipping",
            Router::new()
                .route("/zone/{postcode}", get(resolve_zone))
                .route("/quote/{sku}/{postcode}", get(shipping_quote))
                .route("/distance/{from}/{to}", get(postcode_distance)),
        )
        .route("/orders", post(ingest_order))
        .route("/orders/retry-failed", post(retry_failed_orders))
        .route("/orders/{id}/forward", post(forward_order))
        .route("/orders/{id}/retry", post(retry_order))
        .route("/orders/{id}/sync", get(order_sync_status))
        .route("/orders/{id}/partner", get(order_partner_details))
        .route("/orders/{id}/status", post(push_order_status))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "caravel.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: ImportPipeline,
    queue: jobs::JobQueue,
    commerce: CommerceStore,
    tracking: TrackingStore,
    orders: Arc<OrderSyncHandler>,
    source: Option<Arc<SourceClient>>,
    categories: Arc<CategoryCache>,
    zones: Arc<ZoneTable>,
    idempotency: Arc<Mutex<HashMap<String, ImportResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "caravel-sync-rs",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run the full source → storefront import for one catalog row.
///
/// - Method: `POST`
/// - Path: `/imports`
/// - Auth: `Authorization: Bearer <key>` or `X-Caravel-Key: <key>`
/// - Body: `ImportRequest`
/// - Response: `ImportResponse` (local id + per-stage transcript)
///
/// An `Idempotency-Key` header replays the stored response instead of
/// running the pipeline again, through Redis when configured and an
/// in-process map otherwise.
async fn run_import(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, AppError> {
    crate::metrics::inc_requests("/imports");
    info!(
        target = "caravel.api",
        caller = %context.name,
        api_key = %context.key_id,
        source_id = payload.source_id,
        "import invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.pipeline.run(payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.pipeline.run(payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.pipeline.run(payload).await?;

    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_import_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ImportRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/imports");
    info!(
        target = "caravel.api",
        caller = %context.name,
        source_id = payload.source_id,
        "import queued",
    );
    let id = state
        .queue
        .enqueue_import(payload)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::NotFound("job")),
    }
}

#[derive(Debug, Deserialize)]
struct CatalogQuery {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    page: Option<u32>,
}

/// Paged proxy search over the source catalog, for picking rows to import.
async fn search_catalog(
    State(state): State<AppState>,
    Query(params): Query<CatalogQuery>,
) -> Result<Json<source::SearchPage>, AppError> {
    crate::metrics::inc_requests("/catalog/records");
    let Some(source) = &state.source else {
        return Err(AppError::Pipeline(PipelineError::internal(
            "catalog_search",
            "source catalog is not configured",
        )));
    };
    let page = source
        .search_records(
            params.search.as_deref(),
            params.category.as_deref(),
            params.page.unwrap_or(1),
        )
        .await
        .map_err(|err| {
            AppError::Pipeline(PipelineError::internal("catalog_search", err.to_string()))
        })?;
    Ok(Json(page))
}

async fn list_categories(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/catalog/categories");
    Json(json!({
        "count": state.categories.len(),
        "top_level": state.categories.top_level(),
        "paths": state.categories.paths(),
    }))
}

async fn refresh_categories(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/catalog/categories/refresh");
    let loaded = state.categories.refresh().map_err(|err| {
        AppError::Pipeline(PipelineError::internal(
            "categories_refresh",
            err.to_string(),
        ))
    })?;
    Ok(Json(json!({ "loaded": loaded })))
}

async fn tracking_stats(
    State(state): State<AppState>,
) -> Result<Json<store::tracking::TrackingStats>, AppError> {
    crate::metrics::inc_requests("/tracking/stats");
    let stats = state
        .tracking
        .stats(jobs::stale_after_hours_from_env())
        .await?;
    Ok(Json(stats))
}

/// Three-way by contract: 200 with the record, 404 when the source row was
/// never imported, 500 when the store itself fails.
async fn tracking_record(
    State(state): State<AppState>,
    Path(source_id): Path<i64>,
) -> Result<Json<store::tracking::TrackingRecord>, AppError> {
    crate::metrics::inc_requests("/tracking/{source_id}");
    match state.tracking.record_for(source_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound("tracking record")),
    }
}

/// Removes the import mapping; the local product stays. When the source is
/// configured the row is patched back to not-imported, best effort.
async fn untrack_record(
    State(state): State<AppState>,
    Path(source_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/tracking/{source_id}");
    let removed = state.tracking.untrack(Some(source_id), None).await?;
    if removed == 0 {
        return Err(AppError::NotFound("tracking record"));
    }
    let mut notified = false;
    if let Some(source) = &state.source {
        let fields = json!({ "imported": false, "local_product_id": null });
        match source.update_record(source_id, &fields).await {
            Ok(()) => notified = true,
            Err(err) => warn!(
                target = "caravel.api",
                source_id, error = %err, "source push-back after untrack failed",
            ),
        }
    }
    Ok(Json(json!({ "removed": removed, "notified": notified })))
}

async fn resolve_zone(
    State(state): State<AppState>,
    Path(postcode): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/shipping/zone");
    if !shipping::validate_postcode(&postcode) {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "shipping",
            "invalid_postcode",
        )));
    }
    let formatted = shipping::format_postcode(&postcode);
    Ok(Json(json!({
        "postcode": formatted,
        "zone": state.zones.zone_for(&formatted),
        "state": shipping::postcodes::state_for_postcode(&formatted),
    })))
}

/// Delivered-cost quote for one SKU to one postcode: resolves the zone,
/// reads the product's stored per-zone costs, applies free shipping and
/// the bulky surcharge.
async fn shipping_quote(
    State(state): State<AppState>,
    Path((sku, postcode)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/shipping/quote");
    if !shipping::validate_postcode(&postcode) {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "shipping",
            "invalid_postcode",
        )));
    }
    let Some(product) = state.commerce.find_by_sku(&sku).await? else {
        return Err(AppError::NotFound("product"));
    };
    let zone_costs = product.zone_cost_table()?;
    let cost = state
        .zones
        .cost_for(&zone_costs, product.is_bulky, product.free_shipping, &postcode)
        .map_err(|err| {
            AppError::Pipeline(PipelineError::invalid_input("shipping", err.to_string()))
        })?;
    Ok(Json(json!({
        "sku": product.sku,
        "postcode": shipping::format_postcode(&postcode),
        "zone": state.zones.zone_for(&postcode),
        "cost": cost,
        "is_bulky": product.is_bulky,
        "free_shipping": product.free_shipping,
    })))
}

async fn postcode_distance(
    Path((from, to)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/shipping/distance");
    let km = shipping::distance_between_postcodes(&from, &to).map_err(|err| {
        AppError::Pipeline(PipelineError::invalid_input("shipping", err.to_string()))
    })?;
    Ok(Json(json!({
        "from": shipping::format_postcode(&from),
        "to": shipping::format_postcode(&to),
        "km": km,
    })))
}

/// Ingest (or replace) a storefront order locally so it can be forwarded.
///
/// - Method: `POST`
/// - Path: `/orders`
/// - Body: `OrderIngest` (storefront webhook shape)
async fn ingest_order(
    State(state): State<AppState>,
    Json(payload): Json<OrderIngest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/orders");
    let order_id = payload.order_id;
    let lines = payload.lines.len();
    state.commerce.upsert_order(&payload).await?;
    Ok(Json(json!({ "order_id": order_id, "lines": lines })))
}

async fn forward_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<ForwardResponse>, AppError> {
    crate::metrics::inc_requests("/orders/{id}/forward");
    info!(
        target = "caravel.api",
        caller = %context.name,
        order_id = id,
        "forward invoked",
    );
    let reference = state.orders.forward(id).await?;
    Ok(Json(ForwardResponse {
        order_id: id,
        reference,
    }))
}

async fn retry_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ForwardResponse>, AppError> {
    crate::metrics::inc_requests("/orders/{id}/retry");
    let reference = state.orders.retry(id).await?;
    Ok(Json(ForwardResponse {
        order_id: id,
        reference,
    }))
}

async fn retry_failed_orders(State(state): State<AppState>) -> Result<Json<RetryReport>, AppError> {
    crate::metrics::inc_requests("/orders/retry-failed");
    let report = state.orders.retry_failed().await?;
    Ok(Json(report))
}

async fn order_sync_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OrderSyncStatus>, AppError> {
    crate::metrics::inc_requests("/orders/{id}/sync");
    match state.orders.sync_record(id).await? {
        Some(record) => Ok(Json(record.into())),
        None => Err(AppError::NotFound("order sync record")),
    }
}

/// The partner's live view of a forwarded order, proxied as-is.
async fn order_partner_details(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/orders/{id}/partner");
    let details = state.orders.partner_details(id).await?;
    Ok(Json(details))
}

async fn push_order_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<StatusPush>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/orders/{id}/status");
    let pushed = state.orders.push_status(id, &payload.status).await?;
    Ok(Json(json!({ "order_id": id, "status": pushed })))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound(&'static str),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Pipeline(PipelineError::internal("store", value.to_string()))
    }
}

impl From<OrderSyncError> for AppError {
    fn from(value: OrderSyncError) -> Self {
        match value {
            OrderSyncError::OrderNotFound(_) => Self::NotFound("order"),
            OrderSyncError::NotForwarded(_) => Self::NotFound("order sync record"),
            OrderSyncError::NoPartnerLines(_) => {
                Self::Pipeline(PipelineError::invalid_input("orders", value.to_string()))
            }
            OrderSyncError::NotConfigured => {
                Self::Pipeline(PipelineError::internal("orders", value.to_string()))
            }
            OrderSyncError::Store(_) => {
                Self::Pipeline(PipelineError::internal("store", value.to_string()))
            }
            OrderSyncError::Partner(_) => {
                Self::Pipeline(PipelineError::internal("partner", value.to_string()))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::NotFound(what) => {
                let payload = ApiError {
                    error: "not_found".to_string(),
                    detail: Some(what.to_string()),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
