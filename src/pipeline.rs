use crate::catalog::EanPolicy;
use crate::categories::CategoryCache;
use crate::images::ImagePipeline;
use crate::models::{ImportRequest, ImportResponse, StageReport};
use crate::shipping::ZoneTable;
use crate::source::SourceClient;
use crate::store::{CommerceStore, TrackingStore};
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::info;

#[derive(Clone)]
pub struct ImportPipeline {
    source: Option<Arc<SourceClient>>,
    commerce: CommerceStore,
    tracking: TrackingStore,
    images: Arc<ImagePipeline>,
    categories: Arc<CategoryCache>,
    zones: Arc<ZoneTable>,
    ean_policy: EanPolicy,
}

impl ImportPipeline {
    pub fn new(
        source: Option<SourceClient>,
        commerce: CommerceStore,
        tracking: TrackingStore,
        images: ImagePipeline,
        categories: Arc<CategoryCache>,
        zones: Arc<ZoneTable>,
    ) -> Self {
        Self {
            source: source.map(Arc::new),
            commerce,
            tracking,
            images: Arc::new(images),
            categories,
            zones,
            ean_policy: EanPolicy::from_env(),
        }
    }

    /// Runs every stage for one source row. `force_sync` never skips work;
    /// the full path runs either way and the flag is carried into the
    /// stage transcript for the caller to see.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportResponse, PipelineError> {
        let mut stages = Vec::new();
        let source = self.source.clone().ok_or_else(|| {
            PipelineError::internal("fetch_record", "source catalog is not configured")
        })?;

        let record = self
            .capture_stage("fetch_record", &mut stages, {
                let source = source.clone();
                async move {
                    stages::fetch_record(&source, request.source_id, request.force_sync).await
                }
            })
            .await?;

        self.capture_stage("validate", &mut stages, {
            let record = record.clone();
            let policy = self.ean_policy;
            async move { stages::validate(&record, policy).await }
        })
        .await?;

        let product = self
            .capture_stage("map_product", &mut stages, {
                let record = record.clone();
                async move { stages::map_product(&record).await }
            })
            .await?;

        let (local_id, created) = self
            .capture_stage("resolve_entity", &mut stages, {
                let commerce = self.commerce.clone();
                let sku = product.sku.clone();
                async move { stages::resolve_entity(&commerce, &sku).await }
            })
            .await?;

        self.capture_stage("apply_fields", &mut stages, {
            let commerce = self.commerce.clone();
            let product = product.clone();
            async move { stages::apply_fields(&commerce, local_id, &product).await }
        })
        .await?;

        self.capture_stage("attach_categories", &mut stages, {
            let commerce = self.commerce.clone();
            let cache = self.categories.clone();
            let product = product.clone();
            async move { stages::attach_categories(&commerce, &cache, local_id, &product).await }
        })
        .await?;

        self.capture_stage("process_images", &mut stages, {
            let images = self.images.clone();
            let commerce = self.commerce.clone();
            let product = product.clone();
            async move { stages::process_images(&images, &commerce, local_id, &product).await }
        })
        .await?;

        self.capture_stage("track", &mut stages, {
            let tracking = self.tracking.clone();
            async move { stages::track(&tracking, request.source_id, local_id).await }
        })
        .await?;

        self.capture_stage("push_back", &mut stages, {
            let source = source.clone();
            let zones = self.zones.clone();
            async move { stages::push_back(&source, &zones, request.source_id, local_id).await }
        })
        .await?;

        crate::metrics::import_finished("success");
        info!(
            target = "caravel.import",
            source_id = request.source_id,
            local_id,
            sku = product.sku.as_str(),
            created,
            force_sync = request.force_sync,
            "import complete"
        );
        Ok(ImportResponse {
            local_id,
            sku: product.sku,
            created,
            stages,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}


/// Stage bodies, kept free of the orchestration so each can be exercised
/// on its own.
pub mod stages {
    use super::{PipelineError, StageOutcome};
    use crate::catalog::{self, EanPolicy, NormalizedProduct, SourceProduct};
    use crate::categories::CategoryCache;
    use crate::images::ImagePipeline;
    use crate::shipping::ZoneTable;
    use crate::source::SourceClient;
    use crate::store::{CommerceStore, TrackingStore};
    use chrono::Utc;
    use serde_json::json;
    use tracing::warn;

    pub async fn fetch_record(
        source: &SourceClient,
        source_id: i64,
        force_sync: bool,
    ) -> Result<StageOutcome<SourceProduct>, PipelineError> {
        let record = source
            .get_record(source_id)
            .await
            .map_err(|err| PipelineError::internal("fetch_record", err.to_string()))?
            .ok_or_else(|| {
                PipelineError::invalid_input(
                    "fetch_record",
                    format!("source record {source_id} does not exist"),
                )
            })?;
        let output = json!({
            "source_id": source_id,
            "sku": record.sku,
            "force_sync": force_sync,
        });
        Ok(StageOutcome::new(record, output))
    }

    pub async fn validate(
        record: &SourceProduct,
        policy: EanPolicy,
    ) -> Result<StageOutcome<()>, PipelineError> {
        let warnings = catalog::validate_product(record, policy)
            .map_err(|err| PipelineError::invalid_input("validate", err.to_string()))?;
        for warning in &warnings {
            warn!(
                target = "caravel.import",
                source_id = record.id,
                field = warning.field.as_str(),
                note = warning.note,
                "validation warning"
            );
        }
        let output = json!({
            "warning_count": warnings.len(),
            "warnings": warnings,
        });
        Ok(StageOutcome::new((), output))
    }

    pub async fn map_product(
        record: &SourceProduct,
    ) -> Result<StageOutcome<NormalizedProduct>, PipelineError> {
        let product = catalog::map_product(record)
            .map_err(|err| PipelineError::invalid_input("map_product", err.to_string()))?;
        let output = json!({
            "sku": product.sku,
            "name": product.name,
            "regular_price": product.regular_price,
            "images": product.images.len(),
            "category_path": product.category_path,
        });
        Ok(StageOutcome::new(product, output))
    }

    pub async fn resolve_entity(
        commerce: &CommerceStore,
        sku: &str,
    ) -> Result<StageOutcome<(i64, bool)>, PipelineError> {
        let existing = commerce
            .find_by_sku(sku)
            .await
            .map_err(|err| PipelineError::internal("resolve_entity", err.to_string()))?;
        let (local_id, created) = match existing {
            Some(row) => (row.id, false),
            None => {
                let id = commerce
                    .create_shell(sku)
                    .await
                    .map_err(|err| PipelineError::internal("resolve_entity", err.to_string()))?;
                (id, true)
            }
        };
        let output = json!({"local_id": local_id, "created": created});
        Ok(StageOutcome::new((local_id, created), output))
    }

    pub async fn apply_fields(
        commerce: &CommerceStore,
        local_id: i64,
        product: &NormalizedProduct,
    ) -> Result<StageOutcome<()>, PipelineError> {
        commerce
            .apply_product(local_id, product)
            .await
            .map_err(|err| PipelineError::internal("apply_fields", err.to_string()))?;
        let output = json!({
            "local_id": local_id,
            "stock_status": product.stock.status.as_str(),
            "stock_quantity": product.stock.quantity,
        });
        Ok(StageOutcome::new((), output))
    }

    pub async fn attach_categories(
        commerce: &CommerceStore,
        cache: &CategoryCache,
        local_id: i64,
        product: &NormalizedProduct,
    ) -> Result<StageOutcome<Vec<i64>>, PipelineError> {
        let mut brand_id = None;
        if let Some(brand) = product.brand.as_deref() {
            let id = commerce
                .brand_for_name(brand)
                .await
                .map_err(|err| PipelineError::internal("attach_categories", err.to_string()))?;
            commerce
                .set_brand(local_id, id)
                .await
                .map_err(|err| PipelineError::internal("attach_categories", err.to_string()))?;
            brand_id = Some(id);
        }

        let Some(path) = product.category_path.as_deref() else {
            return Ok(StageOutcome::new(
                Vec::new(),
                json!({"path": null, "category_ids": [], "brand_id": brand_id}),
            ));
        };
        // An empty cache means no snapshot has been loaded; only a loaded
        // snapshot can call a path unknown.
        let known = cache.is_empty() || cache.contains(path);
        if !known {
            warn!(
                target = "caravel.import",
                local_id, path, "category path missing from the snapshot"
            );
        }
        let category_ids = commerce
            .categories_for_path(path)
            .await
            .map_err(|err| PipelineError::internal("attach_categories", err.to_string()))?;
        commerce
            .set_categories(local_id, &category_ids)
            .await
            .map_err(|err| PipelineError::internal("attach_categories", err.to_string()))?;
        let output = json!({
            "path": path,
            "category_ids": &category_ids,
            "known": known,
            "brand_id": brand_id,
        });
        Ok(StageOutcome::new(category_ids, output))
    }

    pub async fn process_images(
        images: &ImagePipeline,
        commerce: &CommerceStore,
        local_id: i64,
        product: &NormalizedProduct,
    ) -> Result<StageOutcome<Vec<i64>>, PipelineError> {
        let asset_ids = images.process(&product.images, &product.sku).await;
        commerce
            .set_product_assets(local_id, &asset_ids)
            .await
            .map_err(|err| PipelineError::internal("process_images", err.to_string()))?;
        let output = json!({
            "requested": product.images.len(),
            "stored": asset_ids.len(),
            "asset_ids": &asset_ids,
        });
        Ok(StageOutcome::new(asset_ids, output))
    }

    pub async fn track(
        tracking: &TrackingStore,
        source_id: i64,
        local_id: i64,
    ) -> Result<StageOutcome<()>, PipelineError> {
        tracking
            .upsert(source_id, local_id)
            .await
            .map_err(|err| PipelineError::internal("track", err.to_string()))?;
        Ok(StageOutcome::new(
            (),
            json!({"source_id": source_id, "local_id": local_id}),
        ))
    }

    /// Best-effort: the local entity is already consistent by this point,
    /// so a failed write-back is logged and reported, never fatal.
    pub async fn push_back(
        source: &SourceClient,
        zones: &ZoneTable,
        source_id: i64,
        local_id: i64,
    ) -> Result<StageOutcome<()>, PipelineError> {
        let fields = json!({
            "imported": true,
            "local_product_id": local_id,
            "last_import_date": Utc::now().to_rfc3339(),
        });
        let pushed = match source.update_record(source_id, &fields).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "caravel.import",
                    source_id, error = %err, "source write-back failed"
                );
                false
            }
        };
        zones.refresh();
        Ok(StageOutcome::new((), json!({"pushed": pushed})))
    }
}
