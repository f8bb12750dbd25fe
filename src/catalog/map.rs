use crate::catalog::fields::{money_string, parse_flag, parse_quantity};
use crate::catalog::record::SourceProduct;
use crate::shipping::ZoneCode;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("source record has no usable sku")]
    MissingSku,
    #[error("source record has no usable title")]
    MissingTitle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StockStatus {
    #[serde(rename = "instock")]
    InStock,
    #[serde(rename = "outofstock")]
    OutOfStock,
}

impl StockStatus {
    pub fn from_quantity(quantity: i64) -> Self {
        if quantity > 0 {
            Self::InStock
        } else {
            Self::OutOfStock
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InStock => "instock",
            Self::OutOfStock => "outofstock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockData {
    pub manage_stock: bool,
    pub quantity: i64,
    pub status: StockStatus,
    pub backorders: &'static str,
}

/// Dimension strings are carried verbatim (trimmed); an absent measurement
/// stays an empty string rather than a zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimensions {
    pub length: String,
    pub width: String,
    pub height: String,
    pub weight: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippingData {
    pub zone_costs: BTreeMap<ZoneCode, String>,
    pub is_bulky: bool,
}

/// Canonical product shape consumed by the commerce store. All prices are
/// two decimal strings; `cost_price` may be empty, meaning unknown, which
/// callers must never read as free.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedProduct {
    pub source_id: i64,
    pub sku: String,
    pub name: String,
    pub description: String,
    pub regular_price: String,
    pub sale_price: String,
    pub cost_price: String,
    pub stock: StockData,
    pub dimensions: Dimensions,
    pub shipping: ShippingData,
    pub free_shipping: bool,
    pub direct_import: bool,
    pub category_path: Option<String>,
    pub brand: Option<String>,
    pub ean: Option<String>,
    pub images: Vec<String>,
}

/// Field-by-field transform of a validated source row. Stock status is
/// always derived from the quantity, never trusted from the source.
pub fn map_product(record: &SourceProduct) -> Result<NormalizedProduct, MappingError> {
    let sku = trimmed(record.sku.as_deref()).ok_or(MappingError::MissingSku)?;
    let name = trimmed(record.title.as_deref()).ok_or(MappingError::MissingTitle)?;

    let quantity = parse_quantity(record.stock_qty.as_deref().unwrap_or(""));
    let stock = StockData {
        manage_stock: true,
        quantity,
        status: StockStatus::from_quantity(quantity),
        backorders: "no",
    };

    let dimensions = Dimensions {
        length: cell(record.carton_length_cm.as_deref()),
        width: cell(record.carton_width_cm.as_deref()),
        height: cell(record.carton_height_cm.as_deref()),
        weight: cell(record.weight_kg.as_deref()),
    };

    let mut zone_costs = BTreeMap::new();
    for zone in ZoneCode::ALL {
        zone_costs.insert(zone, cell(record.zone_cost(zone)));
    }
    let shipping = ShippingData {
        zone_costs,
        is_bulky: flag(record.bulky_item.as_deref()),
    };

    let cost_price = record
        .price
        .as_deref()
        .and_then(money_string)
        .unwrap_or_default();

    Ok(NormalizedProduct {
        source_id: record.id,
        sku,
        name,
        description: cell(record.description.as_deref()),
        regular_price: record
            .rrp_price
            .as_deref()
            .and_then(money_string)
            .unwrap_or_default(),
        sale_price: cost_price.clone(),
        cost_price,
        stock,
        dimensions,
        shipping,
        free_shipping: flag(record.free_shipping.as_deref()),
        direct_import: flag(record.direct_import.as_deref()),
        category_path: trimmed(record.category.as_deref()),
        brand: trimmed(record.brand.as_deref()),
        ean: trimmed(record.ean_code.as_deref()),
        images: record.image_urls(),
    })
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn cell(raw: Option<&str>) -> String {
    raw.map(str::trim).unwrap_or("").to_string()
}

fn flag(raw: Option<&str>) -> bool {
    parse_flag(raw.unwrap_or("")).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SourceProduct {
        SourceProduct {
            id: 4411,
            sku: Some("DSZ-100".to_string()),
            title: Some(" Oak Side Table ".to_string()),
            price: Some("49.9".to_string()),
            rrp_price: Some("99.95".to_string()),
            stock_qty: Some("12".to_string()),
            weight_kg: Some("8.4".to_string()),
            carton_length_cm: Some("60".to_string()),
            free_shipping: Some("No".to_string()),
            bulky_item: Some("Yes".to_string()),
            direct_import: Some("Yes".to_string()),
            category: Some("Furniture > Living Room > Tables".to_string()),
            nsw_m: Some("10.00".to_string()),
            nsw_r: Some("15.50".to_string()),
            image_1: Some("https://cdn.example.com/oak-1.jpg".to_string()),
            image_2: Some("".to_string()),
            image_3: Some("https://cdn.example.com/oak-3.jpg".to_string()),
            ..SourceProduct::default()
        }
    }

    #[test]
    fn maps_prices_to_two_decimal_strings() {
        let product = map_product(&sample_record()).expect("map");
        assert_eq!(product.regular_price, "99.95");
        assert_eq!(product.sale_price, "49.90");
        assert_eq!(product.cost_price, "49.90");
    }

    #[test]
    fn empty_cost_price_stays_empty() {
        let mut record = sample_record();
        record.price = Some("".to_string());
        let product = map_product(&record).expect("map");
        assert_eq!(product.cost_price, "");
        assert_eq!(product.sale_price, "");
        assert_ne!(product.cost_price, "0.00");
    }

    #[test]
    fn stock_status_is_derived_from_quantity() {
        let mut record = sample_record();
        let product = map_product(&record).expect("map");
        assert_eq!(product.stock.quantity, 12);
        assert_eq!(product.stock.status, StockStatus::InStock);
        assert!(product.stock.manage_stock);

        record.stock_qty = Some("0".to_string());
        let product = map_product(&record).expect("map");
        assert_eq!(product.stock.status, StockStatus::OutOfStock);

        record.stock_qty = None;
        let product = map_product(&record).expect("map");
        assert_eq!(product.stock.quantity, 0);
        assert_eq!(product.stock.status, StockStatus::OutOfStock);
    }

    #[test]
    fn zone_table_carries_all_zones_with_empty_defaults() {
        let product = map_product(&sample_record()).expect("map");
        assert_eq!(product.shipping.zone_costs.len(), 17);
        assert_eq!(product.shipping.zone_costs[&ZoneCode::NswM], "10.00");
        assert_eq!(product.shipping.zone_costs[&ZoneCode::NswR], "15.50");
        assert_eq!(product.shipping.zone_costs[&ZoneCode::Act], "");
        assert!(product.shipping.is_bulky);
    }

    #[test]
    fn image_order_is_preserved_and_empties_skipped() {
        let product = map_product(&sample_record()).expect("map");
        assert_eq!(
            product.images,
            vec![
                "https://cdn.example.com/oak-1.jpg".to_string(),
                "https://cdn.example.com/oak-3.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn blank_sku_is_a_mapping_error() {
        let mut record = sample_record();
        record.sku = Some("   ".to_string());
        assert!(matches!(
            map_product(&record),
            Err(MappingError::MissingSku)
        ));
    }

    #[test]
    fn name_is_trimmed_and_flags_decoded() {
        let product = map_product(&sample_record()).expect("map");
        assert_eq!(product.name, "Oak Side Table");
        assert!(!product.free_shipping);
        assert!(product.direct_import);
        assert_eq!(
            product.category_path.as_deref(),
            Some("Furniture > Living Room > Tables")
        );
    }
}
