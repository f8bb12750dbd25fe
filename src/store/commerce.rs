use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::debug;

use crate::catalog::NormalizedProduct;
use crate::models::OrderIngest;
use crate::shipping::ZoneCode;
use crate::store::StoreError;

/// One local product as persisted. Prices and dimensions stay the strings
/// the mapper produced; `zone_costs` is the JSON-encoded per-zone table.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ProductRow {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub description: String,
    pub regular_price: String,
    pub sale_price: String,
    pub cost_price: String,
    pub stock_quantity: i64,
    pub stock_status: String,
    pub backorders: String,
    pub weight: String,
    pub length: String,
    pub width: String,
    pub height: String,
    pub zone_costs: String,
    pub is_bulky: bool,
    pub free_shipping: bool,
    pub direct_import: bool,
    pub ean: Option<String>,
    pub brand_id: Option<i64>,
    pub featured_asset_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductRow {
    /// Decodes the stored per-zone cost table.
    pub fn zone_cost_table(&self) -> Result<BTreeMap<ZoneCode, String>, StoreError> {
        Ok(serde_json::from_str(&self.zone_costs)?)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AssetRow {
    pub id: i64,
    pub source_url: String,
    pub file_name: String,
    pub mime: String,
    pub width: i64,
    pub height: i64,
    pub byte_len: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAsset<'a> {
    pub source_url: &'a str,
    pub file_name: &'a str,
    pub mime: &'a str,
    pub width: i64,
    pub height: i64,
    pub byte_len: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OrderRow {
    pub id: i64,
    pub status: String,
    pub billing_first_name: String,
    pub billing_last_name: String,
    pub billing_address1: String,
    pub billing_address2: String,
    pub billing_suburb: String,
    pub billing_state: String,
    pub billing_postcode: String,
    pub billing_phone: String,
    pub shipping_first_name: Option<String>,
    pub shipping_last_name: Option<String>,
    pub shipping_address1: Option<String>,
    pub shipping_address2: Option<String>,
    pub shipping_suburb: Option<String>,
    pub shipping_state: Option<String>,
    pub shipping_postcode: Option<String>,
    pub customer_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OrderLineRow {
    pub id: i64,
    pub order_id: i64,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
}

const PRODUCT_COLUMNS: &str = "id, sku, name, description, regular_price, sale_price, \
    cost_price, stock_quantity, stock_status, backorders, weight, length, width, height, \
    zone_costs, is_bulky, free_shipping, direct_import, ean, brand_id, featured_asset_id, \
    created_at, updated_at";

/// The local catalog persistence boundary. The one contract callers rely
/// on: create-or-update by SKU is safe to call repeatedly.
#[derive(Clone)]
pub struct CommerceStore {
    pool: SqlitePool,
}

impl CommerceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Three-way lookup: `Ok(Some)` known SKU, `Ok(None)` never created,
    /// `Err` storage failure.
    pub async fn find_by_sku(&self, sku: &str) -> Result<Option<ProductRow>, StoreError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = ?1"
        ))
        .bind(sku)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn product_by_id(&self, id: i64) -> Result<Option<ProductRow>, StoreError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Creates the bare entity with only its SKU so an id exists before any
    /// other mutation. Fails on a duplicate SKU.
    pub async fn create_shell(&self, sku: &str) -> Result<i64, StoreError> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO products (sku, created_at, updated_at) VALUES (?1, ?2, ?2) RETURNING id",
        )
        .bind(sku)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        debug!(target = "caravel.store", sku, id, "product shell created");
        Ok(id)
    }

    /// Writes every normalized field onto an existing entity. Repeatable:
    /// a second call with the same data is a no-op apart from `updated_at`.
    pub async fn apply_product(
        &self,
        id: i64,
        product: &NormalizedProduct,
    ) -> Result<(), StoreError> {
        let zone_costs = serde_json::to_string(&product.shipping.zone_costs)?;
        sqlx::query(
            "UPDATE products SET \
                 name = ?1, description = ?2, regular_price = ?3, sale_price = ?4, \
                 cost_price = ?5, stock_quantity = ?6, stock_status = ?7, backorders = ?8, \
                 weight = ?9, length = ?10, width = ?11, height = ?12, zone_costs = ?13, \
                 is_bulky = ?14, free_shipping = ?15, direct_import = ?16, ean = ?17, \
                 updated_at = ?18 \
             WHERE id = ?19",
        )
        .bind(&product.name)
        .bind(&product.description)
        .bind(&product.regular_price)
        .bind(&product.sale_price)
        .bind(&product.cost_price)
        .bind(product.stock.quantity)
        .bind(product.stock.status.as_str())
        .bind(product.stock.backorders)
        .bind(&product.dimensions.weight)
        .bind(&product.dimensions.length)
        .bind(&product.dimensions.width)
        .bind(&product.dimensions.height)
        .bind(zone_costs)
        .bind(product.shipping.is_bulky)
        .bind(product.free_shipping)
        .bind(product.direct_import)
        .bind(product.ean.as_deref())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Case-sensitive lookup-or-create of a brand term.
    pub async fn brand_for_name(&self, name: &str) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO brands (name) VALUES (?1) \
             ON CONFLICT (name) DO UPDATE SET name = excluded.name \
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn set_brand(&self, product_id: i64, brand_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE products SET brand_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(brand_id)
            .bind(Utc::now())
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Splits a `>`-separated path and resolves each segment inside its
    /// parent, creating terms that do not exist yet. Returns the ids in
    /// path order, root first. Segment names are case-sensitive.
    pub async fn categories_for_path(&self, path: &str) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::new();
        let mut parent_id: i64 = 0;
        for segment in path.split('>').map(str::trim).filter(|s| !s.is_empty()) {
            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO categories (name, parent_id) VALUES (?1, ?2) \
                 ON CONFLICT (name, parent_id) DO UPDATE SET name = excluded.name \
                 RETURNING id",
            )
            .bind(segment)
            .bind(parent_id)
            .fetch_one(&self.pool)
            .await?;
            ids.push(id);
            parent_id = id;
        }
        Ok(ids)
    }

    pub async fn set_categories(
        &self,
        product_id: i64,
        category_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM product_categories WHERE product_id = ?1")
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
        for category_id in category_ids {
            sqlx::query(
                "INSERT INTO product_categories (product_id, category_id) VALUES (?1, ?2) \
                 ON CONFLICT (product_id, category_id) DO NOTHING",
            )
            .bind(product_id)
            .bind(category_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn asset_for_url(&self, source_url: &str) -> Result<Option<AssetRow>, StoreError> {
        let row = sqlx::query_as::<_, AssetRow>(
            "SELECT id, source_url, file_name, mime, width, height, byte_len, created_at \
             FROM assets WHERE source_url = ?1",
        )
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert keyed by source URL; a second insert for the same URL lands on
    /// the existing row and returns its id.
    pub async fn insert_asset(&self, asset: &NewAsset<'_>) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO assets (source_url, file_name, mime, width, height, byte_len, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (source_url) DO UPDATE SET source_url = excluded.source_url \
             RETURNING id",
        )
        .bind(asset.source_url)
        .bind(asset.file_name)
        .bind(asset.mime)
        .bind(asset.width)
        .bind(asset.height)
        .bind(asset.byte_len)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Replaces the gallery wholesale. Position follows slice order and the
    /// first entry becomes the featured asset. Duplicate ids collapse to
    /// their first position.
    pub async fn set_product_assets(
        &self,
        product_id: i64,
        asset_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM product_assets WHERE product_id = ?1")
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
        for (position, asset_id) in asset_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO product_assets (product_id, asset_id, position) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (product_id, asset_id) DO NOTHING",
            )
            .bind(product_id)
            .bind(asset_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE products SET featured_asset_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(asset_ids.first().copied())
            .bind(Utc::now())
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn assets_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<AssetRow>, StoreError> {
        let rows = sqlx::query_as::<_, AssetRow>(
            "SELECT a.id, a.source_url, a.file_name, a.mime, a.width, a.height, a.byte_len, \
                    a.created_at \
             FROM assets a \
             JOIN product_assets pa ON pa.asset_id = a.id \
             WHERE pa.product_id = ?1 \
             ORDER BY pa.position ASC",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Upsert keyed by the storefront's own order id; lines are replaced
    /// wholesale so a re-delivered webhook cannot duplicate them.
    pub async fn upsert_order(&self, order: &OrderIngest) -> Result<(), StoreError> {
        let now = Utc::now();
        let shipping = order.shipping.as_ref();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO orders \
                 (id, status, billing_first_name, billing_last_name, billing_address1, \
                  billing_address2, billing_suburb, billing_state, billing_postcode, \
                  billing_phone, shipping_first_name, shipping_last_name, shipping_address1, \
                  shipping_address2, shipping_suburb, shipping_state, shipping_postcode, \
                  customer_note, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?19) \
             ON CONFLICT (id) DO UPDATE SET \
                 status = excluded.status, \
                 billing_first_name = excluded.billing_first_name, \
                 billing_last_name = excluded.billing_last_name, \
                 billing_address1 = excluded.billing_address1, \
                 billing_address2 = excluded.billing_address2, \
                 billing_suburb = excluded.billing_suburb, \
                 billing_state = excluded.billing_state, \
                 billing_postcode = excluded.billing_postcode, \
                 billing_phone = excluded.billing_phone, \
                 shipping_first_name = excluded.shipping_first_name, \
                 shipping_last_name = excluded.shipping_last_name, \
                 shipping_address1 = excluded.shipping_address1, \
                 shipping_address2 = excluded.shipping_address2, \
                 shipping_suburb = excluded.shipping_suburb, \
                 shipping_state = excluded.shipping_state, \
                 shipping_postcode = excluded.shipping_postcode, \
                 customer_note = excluded.customer_note, \
                 updated_at = excluded.updated_at",
        )
        .bind(order.order_id)
        .bind(&order.status)
        .bind(&order.billing.first_name)
        .bind(&order.billing.last_name)
        .bind(&order.billing.address1)
        .bind(&order.billing.address2)
        .bind(&order.billing.suburb)
        .bind(&order.billing.state)
        .bind(&order.billing.postcode)
        .bind(&order.billing.phone)
        .bind(shipping.map(|s| s.first_name.clone()))
        .bind(shipping.map(|s| s.last_name.clone()))
        .bind(shipping.map(|s| s.address1.clone()))
        .bind(shipping.map(|s| s.address2.clone()))
        .bind(shipping.map(|s| s.suburb.clone()))
        .bind(shipping.map(|s| s.state.clone()))
        .bind(shipping.map(|s| s.postcode.clone()))
        .bind(order.customer_note.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM order_lines WHERE order_id = ?1")
            .bind(order.order_id)
            .execute(&mut *tx)
            .await?;
        for line in &order.lines {
            sqlx::query("INSERT INTO order_lines (order_id, sku, name, quantity) VALUES (?1, ?2, ?3, ?4)")
                .bind(order.order_id)
                .bind(&line.sku)
                .bind(&line.name)
                .bind(line.quantity)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(
            target = "caravel.store",
            order_id = order.order_id,
            lines = order.lines.len(),
            "order upserted"
        );
        Ok(())
    }

    pub async fn order_with_lines(
        &self,
        order_id: i64,
    ) -> Result<Option<(OrderRow, Vec<OrderLineRow>)>, StoreError> {
        let order = sqlx::query_as::<_, OrderRow>(
            "SELECT id, status, billing_first_name, billing_last_name, billing_address1, \
                    billing_address2, billing_suburb, billing_state, billing_postcode, \
                    billing_phone, shipping_first_name, shipping_last_name, shipping_address1, \
                    shipping_address2, shipping_suburb, shipping_state, shipping_postcode, \
                    customer_note, created_at, updated_at \
             FROM orders WHERE id = ?1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(order) = order else {
            return Ok(None);
        };
        let lines = sqlx::query_as::<_, OrderLineRow>(
            "SELECT id, order_id, sku, name, quantity FROM order_lines \
             WHERE order_id = ?1 ORDER BY id ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some((order, lines)))
    }

    pub async fn set_order_status(&self, order_id: i64, status: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(Utc::now())
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
