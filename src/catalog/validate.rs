use crate::catalog::fields::{
    ean13_checksum_ok, has_allowed_image_extension, parse_flag, parse_number,
};
use crate::catalog::record::SourceProduct;
use crate::shipping::ZoneCode;
use serde::Serialize;
use thiserror::Error;

/// How EAN failures are treated. The catalog carries a fair number of
/// malformed barcodes, so the default only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EanPolicy {
    #[default]
    Lenient,
    Strict,
}

impl EanPolicy {
    pub fn from_env() -> Self {
        match std::env::var("EAN_POLICY") {
            Ok(value) if value.trim().eq_ignore_ascii_case("strict") => Self::Strict,
            _ => Self::Lenient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("field `{field}` failed validation: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: &'static str,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: &'static str) -> Self {
        Self {
            field: field.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    pub field: String,
    pub note: &'static str,
}

const REQUIRED_FIELDS: &[(&str, fn(&SourceProduct) -> Option<&String>)] = &[
    ("SKU", |record| record.sku.as_ref()),
    ("Title", |record| record.title.as_ref()),
    ("price", |record| record.price.as_ref()),
    ("RrpPrice", |record| record.rrp_price.as_ref()),
];

const MIN_TITLE_LEN: usize = 3;

/// Structural and semantic checks on a raw source row, in a fixed order,
/// failing on the first violation. Warnings never block an import.
pub fn validate_product(
    record: &SourceProduct,
    policy: EanPolicy,
) -> Result<Vec<ValidationWarning>, ValidationError> {
    let mut warnings = Vec::new();

    for (field, getter) in REQUIRED_FIELDS {
        let present = getter(record).map(|value| !value.trim().is_empty());
        if present != Some(true) {
            return Err(ValidationError::new(*field, "missing_field"));
        }
    }

    if let Some(title) = record.title.as_deref()
        && title.trim().chars().count() < MIN_TITLE_LEN
    {
        return Err(ValidationError::new("Title", "invalid_length"));
    }

    let sale = require_price(record.price.as_deref(), "price")?;
    let list = require_price(record.rrp_price.as_deref(), "RrpPrice")?;
    if sale > list {
        warnings.push(ValidationWarning {
            field: "price".to_string(),
            note: "sale_exceeds_list",
        });
    }

    if let Some(raw) = non_empty(record.stock_qty.as_deref())
        && parse_number(raw).is_none()
    {
        return Err(ValidationError::new("Stock Qty", "invalid_stock_format"));
    }

    let measurements = [
        ("Weight (kg)", record.weight_kg.as_deref()),
        ("Carton Length (cm)", record.carton_length_cm.as_deref()),
        ("Carton Width (cm)", record.carton_width_cm.as_deref()),
        ("Carton Height (cm)", record.carton_height_cm.as_deref()),
    ];
    for (field, raw) in measurements {
        if let Some(raw) = non_empty(raw) {
            match parse_number(raw) {
                Some(value) if value >= 0.0 => {}
                _ => return Err(ValidationError::new(field, "invalid_numeric")),
            }
        }
    }

    for zone in ZoneCode::ALL {
        if let Some(raw) = non_empty(record.zone_cost(zone)) {
            match parse_number(raw) {
                Some(value) if value >= 0.0 => {}
                _ => return Err(ValidationError::new(zone.as_str(), "invalid_shipping_zone")),
            }
        }
    }

    let flags = [
        ("DI", record.direct_import.as_deref()),
        ("Free Shipping", record.free_shipping.as_deref()),
        ("bulky item", record.bulky_item.as_deref()),
    ];
    for (field, raw) in flags {
        if parse_flag(raw.unwrap_or("")).is_none() {
            return Err(ValidationError::new(field, "invalid_boolean"));
        }
    }

    let image_slots = [
        ("Image 1", record.image_1.as_deref()),
        ("Image 2", record.image_2.as_deref()),
        ("Image 3", record.image_3.as_deref()),
        ("Image 4", record.image_4.as_deref()),
        ("Image 5", record.image_5.as_deref()),
    ];
    for (field, slot) in image_slots {
        let Some(url) = non_empty(slot) else { continue };
        if reqwest::Url::parse(url).is_err() {
            return Err(ValidationError::new(field, "invalid_image_url"));
        }
        if !has_allowed_image_extension(url) {
            return Err(ValidationError::new(field, "invalid_image_type"));
        }
    }

    if let Some(ean) = non_empty(record.ean_code.as_deref()) {
        let ean = ean.trim();
        let problem = if ean.len() != 13 || !ean.chars().all(|ch| ch.is_ascii_digit()) {
            Some("ean_length")
        } else if !ean13_checksum_ok(ean) {
            Some("ean_checksum_failed")
        } else {
            None
        };
        if let Some(note) = problem {
            match policy {
                EanPolicy::Strict => {
                    return Err(ValidationError::new("EAN Code", "invalid_ean"));
                }
                EanPolicy::Lenient => warnings.push(ValidationWarning {
                    field: "EAN Code".to_string(),
                    note,
                }),
            }
        }
    }

    Ok(warnings)
}

fn require_price(raw: Option<&str>, field: &'static str) -> Result<f64, ValidationError> {
    let raw = raw.unwrap_or("");
    let value =
        parse_number(raw).ok_or_else(|| ValidationError::new(field, "invalid_numeric"))?;
    if value < 0.0 {
        return Err(ValidationError::new(field, "negative_price"));
    }
    Ok(value)
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SourceProduct {
        SourceProduct {
            id: 101,
            sku: Some("DSZ-101".to_string()),
            title: Some("Walnut Bookshelf".to_string()),
            price: Some("120.00".to_string()),
            rrp_price: Some("249.95".to_string()),
            stock_qty: Some("6".to_string()),
            weight_kg: Some("22.5".to_string()),
            free_shipping: Some("No".to_string()),
            bulky_item: Some("Yes".to_string()),
            nsw_m: Some("18.50".to_string()),
            image_1: Some("https://cdn.example.com/shelf.jpg".to_string()),
            ..SourceProduct::default()
        }
    }

    #[test]
    fn clean_record_passes_without_warnings() {
        let warnings =
            validate_product(&sample_record(), EanPolicy::Lenient).expect("should validate");
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_sku_fails_first() {
        let mut record = sample_record();
        record.sku = Some("  ".to_string());
        record.title = None;
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.field, "SKU");
        assert_eq!(err.reason, "missing_field");
    }

    #[test]
    fn short_title_is_invalid_length() {
        let mut record = sample_record();
        record.title = Some("ab".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.reason, "invalid_length");
    }

    #[test]
    fn negative_price_is_rejected() {
        let mut record = sample_record();
        record.price = Some("-5".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.field, "price");
        assert_eq!(err.reason, "negative_price");
    }

    #[test]
    fn non_numeric_stock_is_invalid_stock_format() {
        let mut record = sample_record();
        record.stock_qty = Some("abc".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.field, "Stock Qty");
        assert_eq!(err.reason, "invalid_stock_format");
    }

    #[test]
    fn empty_stock_is_fine() {
        let mut record = sample_record();
        record.stock_qty = Some("".to_string());
        assert!(validate_product(&record, EanPolicy::Lenient).is_ok());
        record.stock_qty = None;
        assert!(validate_product(&record, EanPolicy::Lenient).is_ok());
    }

    #[test]
    fn negative_zone_cost_is_invalid_shipping_zone() {
        let mut record = sample_record();
        record.qld_r = Some("-1".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.field, "QLD_R");
        assert_eq!(err.reason, "invalid_shipping_zone");
    }

    #[test]
    fn lowercase_flag_is_invalid_boolean() {
        let mut record = sample_record();
        record.free_shipping = Some("yes".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.field, "Free Shipping");
        assert_eq!(err.reason, "invalid_boolean");
    }

    #[test]
    fn disallowed_image_extension_is_invalid_image_type() {
        let mut record = sample_record();
        record.image_2 = Some("https://cdn.example.com/shelf.tiff".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.field, "Image 2");
        assert_eq!(err.reason, "invalid_image_type");
    }

    #[test]
    fn malformed_image_url_is_invalid_image_url() {
        let mut record = sample_record();
        record.image_1 = Some("not a url.jpg".to_string());
        let err = validate_product(&record, EanPolicy::Lenient).expect_err("should fail");
        assert_eq!(err.reason, "invalid_image_url");
    }

    #[test]
    fn sale_above_list_only_warns() {
        let mut record = sample_record();
        record.price = Some("300.00".to_string());
        let warnings = validate_product(&record, EanPolicy::Lenient).expect("should validate");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].note, "sale_exceeds_list");
    }

    #[test]
    fn bad_ean_warns_when_lenient_and_fails_when_strict() {
        let mut record = sample_record();
        record.ean_code = Some("4006381333932".to_string());
        let warnings = validate_product(&record, EanPolicy::Lenient).expect("lenient passes");
        assert_eq!(warnings[0].note, "ean_checksum_failed");

        let err = validate_product(&record, EanPolicy::Strict).expect_err("strict fails");
        assert_eq!(err.field, "EAN Code");
        assert_eq!(err.reason, "invalid_ean");
    }

    #[test]
    fn valid_ean_is_silent() {
        let mut record = sample_record();
        record.ean_code = Some("9310779300005".to_string());
        let warnings = validate_product(&record, EanPolicy::Strict).expect("should validate");
        assert!(warnings.is_empty());
    }
}
