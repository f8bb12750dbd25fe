use crate::shipping::ZoneCode;
use serde::{Deserialize, Serialize};

/// One product row as served by the source catalog API, column names
/// preserved. Numeric columns arrive as strings; typing happens in the
/// validator and the mapper.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceProduct {
    #[serde(default)]
    pub id: i64,
    #[serde(default, rename = "SKU")]
    pub sku: Option<String>,
    #[serde(default, rename = "Title")]
    pub title: Option<String>,
    #[serde(default, rename = "price")]
    pub price: Option<String>,
    #[serde(default, rename = "RrpPrice")]
    pub rrp_price: Option<String>,
    #[serde(default, rename = "Stock Qty")]
    pub stock_qty: Option<String>,
    #[serde(default, rename = "Weight (kg)")]
    pub weight_kg: Option<String>,
    #[serde(default, rename = "Carton Length (cm)")]
    pub carton_length_cm: Option<String>,
    #[serde(default, rename = "Carton Width (cm)")]
    pub carton_width_cm: Option<String>,
    #[serde(default, rename = "Carton Height (cm)")]
    pub carton_height_cm: Option<String>,
    #[serde(default, rename = "DI")]
    pub direct_import: Option<String>,
    #[serde(default, rename = "Free Shipping")]
    pub free_shipping: Option<String>,
    #[serde(default, rename = "bulky item")]
    pub bulky_item: Option<String>,
    #[serde(default, rename = "Description")]
    pub description: Option<String>,
    #[serde(default, rename = "Category")]
    pub category: Option<String>,
    #[serde(default, rename = "Brand")]
    pub brand: Option<String>,
    #[serde(default, rename = "EAN Code")]
    pub ean_code: Option<String>,
    #[serde(default, rename = "Image 1", alias = "Image URL")]
    pub image_1: Option<String>,
    #[serde(default, rename = "Image 2", alias = "Image URL 2")]
    pub image_2: Option<String>,
    #[serde(default, rename = "Image 3", alias = "Image URL 3")]
    pub image_3: Option<String>,
    #[serde(default, rename = "Image 4", alias = "Image URL 4")]
    pub image_4: Option<String>,
    #[serde(default, rename = "Image 5", alias = "Image URL 5")]
    pub image_5: Option<String>,
    #[serde(default, rename = "ACT")]
    pub act: Option<String>,
    #[serde(default, rename = "NSW_M")]
    pub nsw_m: Option<String>,
    #[serde(default, rename = "NSW_R")]
    pub nsw_r: Option<String>,
    #[serde(default, rename = "NT_M")]
    pub nt_m: Option<String>,
    #[serde(default, rename = "NT_R")]
    pub nt_r: Option<String>,
    #[serde(default, rename = "QLD_M")]
    pub qld_m: Option<String>,
    #[serde(default, rename = "QLD_R")]
    pub qld_r: Option<String>,
    #[serde(default, rename = "REMOTE")]
    pub remote: Option<String>,
    #[serde(default, rename = "SA_M")]
    pub sa_m: Option<String>,
    #[serde(default, rename = "SA_R")]
    pub sa_r: Option<String>,
    #[serde(default, rename = "TAS_M")]
    pub tas_m: Option<String>,
    #[serde(default, rename = "TAS_R")]
    pub tas_r: Option<String>,
    #[serde(default, rename = "VIC_M")]
    pub vic_m: Option<String>,
    #[serde(default, rename = "VIC_R")]
    pub vic_r: Option<String>,
    #[serde(default, rename = "WA_M")]
    pub wa_m: Option<String>,
    #[serde(default, rename = "WA_R")]
    pub wa_r: Option<String>,
    #[serde(default, rename = "NZ")]
    pub nz: Option<String>,
}

impl SourceProduct {
    /// Image URLs in field order, empties skipped. Position 0 is the
    /// featured image.
    pub fn image_urls(&self) -> Vec<String> {
        [
            &self.image_1,
            &self.image_2,
            &self.image_3,
            &self.image_4,
            &self.image_5,
        ]
        .into_iter()
        .filter_map(|slot| slot.as_deref())
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
    }

    /// Raw cost cell for one shipping zone. `None` when the column is null
    /// or absent; an empty string is a present-but-blank cell.
    pub fn zone_cost(&self, zone: ZoneCode) -> Option<&str> {
        let slot = match zone {
            ZoneCode::Act => &self.act,
            ZoneCode::NswM => &self.nsw_m,
            ZoneCode::NswR => &self.nsw_r,
            ZoneCode::NtM => &self.nt_m,
            ZoneCode::NtR => &self.nt_r,
            ZoneCode::QldM => &self.qld_m,
            ZoneCode::QldR => &self.qld_r,
            ZoneCode::Remote => &self.remote,
            ZoneCode::SaM => &self.sa_m,
            ZoneCode::SaR => &self.sa_r,
            ZoneCode::TasM => &self.tas_m,
            ZoneCode::TasR => &self.tas_r,
            ZoneCode::VicM => &self.vic_m,
            ZoneCode::VicR => &self.vic_r,
            ZoneCode::WaM => &self.wa_m,
            ZoneCode::WaR => &self.wa_r,
            ZoneCode::Nz => &self.nz,
        };
        slot.as_deref()
    }
}
