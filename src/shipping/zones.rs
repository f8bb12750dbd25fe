use crate::shipping::postcodes::format_postcode;
use crate::shipping::{ShippingError, ZoneCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// Rate applied on top of the zone price for bulky items.
pub const BULKY_SURCHARGE: f64 = 1.5;

/// Regional postcode ranges, inclusive on both ends. Postcodes outside
/// these ranges fall back to their state's metro zone.
const REGIONAL_RANGES: &[(ZoneCode, &[(u32, u32)])] = &[
    (
        ZoneCode::NswR,
        &[(2311, 2312), (2328, 2411), (2420, 2490), (2500, 2999)],
    ),
    (
        ZoneCode::VicR,
        &[
            (3211, 3334),
            (3340, 3424),
            (3430, 3649),
            (3658, 3749),
            (3751, 3999),
        ],
    ),
    (
        ZoneCode::QldR,
        &[
            (4124, 4164),
            (4183, 4299),
            (4400, 4699),
            (4700, 4805),
            (4807, 4999),
        ],
    ),
    (ZoneCode::SaR, &[(5211, 5749)]),
    (ZoneCode::WaR, &[(6208, 6770)]),
    (ZoneCode::TasR, &[(7112, 7150), (7155, 7999)]),
    (ZoneCode::NtR, &[(822, 847), (850, 899), (900, 999)]),
];

/// Postcode to zone resolution over an expanded regional-range map.
///
/// The map is built once per table and replaced wholesale on `refresh`;
/// readers may briefly see the previous map during a refresh, which is fine
/// because zone boundaries are static reference data.
pub struct ZoneTable {
    regional: RwLock<HashMap<u32, ZoneCode>>,
}

impl ZoneTable {
    pub fn new() -> Self {
        Self {
            regional: RwLock::new(expand_ranges()),
        }
    }

    /// Rebuild the expanded map. Consumes the post-import notification.
    pub fn refresh(&self) {
        let rebuilt = expand_ranges();
        let entries = rebuilt.len();
        if let Ok(mut guard) = self.regional.write() {
            *guard = rebuilt;
        }
        debug!(target = "caravel.shipping", entries, "zone table refreshed");
    }

    /// Resolve a postcode to a shipping zone. Total: regional ranges first,
    /// then the leading digit picks the state's metro zone, and anything
    /// unrecognised lands in REMOTE.
    pub fn zone_for(&self, postcode: &str) -> ZoneCode {
        let formatted = format_postcode(postcode);
        if formatted.len() == 4
            && let Ok(number) = formatted.parse::<u32>()
            && let Ok(guard) = self.regional.read()
            && let Some(zone) = guard.get(&number)
        {
            return *zone;
        }
        metro_zone(state_for_leading_digit(&formatted))
    }

    /// Delivered price for one product to one postcode. Free shipping wins
    /// before any zone lookup; a lane with no price is an error, never a
    /// zero-cost default.
    pub fn cost_for(
        &self,
        zone_costs: &BTreeMap<ZoneCode, String>,
        is_bulky: bool,
        free_shipping: bool,
        postcode: &str,
    ) -> Result<f64, ShippingError> {
        if free_shipping {
            return Ok(0.0);
        }
        let zone = self.zone_for(postcode);
        let cost = zone_costs
            .get(&zone)
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| raw.parse::<f64>().ok())
            .ok_or(ShippingError::ZoneNotPriced { zone })?;
        if is_bulky {
            Ok(cost * BULKY_SURCHARGE)
        } else {
            Ok(cost)
        }
    }
}

impl Default for ZoneTable {
    fn default() -> Self {
        Self::new()
    }
}

fn expand_ranges() -> HashMap<u32, ZoneCode> {
    let mut map = HashMap::new();
    for (zone, ranges) in REGIONAL_RANGES {
        for (start, end) in *ranges {
            for code in *start..=*end {
                map.insert(code, *zone);
            }
        }
    }
    map
}

fn state_for_leading_digit(postcode: &str) -> Option<&'static str> {
    match postcode.chars().next() {
        Some('2') => Some("NSW"),
        Some('3') => Some("VIC"),
        Some('4') => Some("QLD"),
        Some('5') => Some("SA"),
        Some('6') => Some("WA"),
        Some('7') => Some("TAS"),
        Some('0') => Some("NT"),
        _ => None,
    }
}

// The ACT arm is only reachable when a caller names the state outright;
// postcode resolution never produces it because 26xx starts with a 2.
fn metro_zone(state: Option<&str>) -> ZoneCode {
    match state {
        Some("NSW") => ZoneCode::NswM,
        Some("VIC") => ZoneCode::VicM,
        Some("QLD") => ZoneCode::QldM,
        Some("SA") => ZoneCode::SaM,
        Some("WA") => ZoneCode::WaM,
        Some("TAS") => ZoneCode::TasM,
        Some("NT") => ZoneCode::NtM,
        Some("ACT") => ZoneCode::Act,
        _ => ZoneCode::Remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced(zones: &[(ZoneCode, &str)]) -> BTreeMap<ZoneCode, String> {
        zones
            .iter()
            .map(|(zone, cost)| (*zone, cost.to_string()))
            .collect()
    }

    #[test]
    fn regional_ranges_win_over_metro() {
        let table = ZoneTable::new();
        assert_eq!(table.zone_for("2500"), ZoneCode::NswR);
        assert_eq!(table.zone_for("3300"), ZoneCode::VicR);
        assert_eq!(table.zone_for("4450"), ZoneCode::QldR);
        assert_eq!(table.zone_for("7113"), ZoneCode::TasR);
        assert_eq!(table.zone_for("0830"), ZoneCode::NtR);
    }

    #[test]
    fn metro_fallback_uses_the_leading_digit() {
        let table = ZoneTable::new();
        assert_eq!(table.zone_for("2000"), ZoneCode::NswM);
        assert_eq!(table.zone_for("3000"), ZoneCode::VicM);
        assert_eq!(table.zone_for("4000"), ZoneCode::QldM);
        assert_eq!(table.zone_for("5000"), ZoneCode::SaM);
        assert_eq!(table.zone_for("6000"), ZoneCode::WaM);
        assert_eq!(table.zone_for("7000"), ZoneCode::TasM);
        assert_eq!(table.zone_for("0800"), ZoneCode::NtM);
    }

    #[test]
    fn unrecognised_codes_land_in_remote() {
        let table = ZoneTable::new();
        assert_eq!(table.zone_for("9999"), ZoneCode::Remote);
        assert_eq!(table.zone_for("1000"), ZoneCode::Remote);
        assert_eq!(table.zone_for(""), ZoneCode::Remote);
    }

    #[test]
    fn short_codes_are_zero_padded_before_lookup() {
        let table = ZoneTable::new();
        // "830" pads to "0830" which sits in the NT regional band
        assert_eq!(table.zone_for("830"), ZoneCode::NtR);
        assert_eq!(table.zone_for("08 30"), ZoneCode::NtR);
    }

    #[test]
    fn canberra_codes_resolve_via_the_nsw_digit() {
        let table = ZoneTable::new();
        assert_eq!(table.zone_for("2601"), ZoneCode::NswR);
        assert_eq!(table.zone_for("0200"), ZoneCode::NtM);
    }

    #[test]
    fn cost_uses_the_resolved_zone() {
        let table = ZoneTable::new();
        let costs = priced(&[(ZoneCode::NswR, "12.00"), (ZoneCode::NswM, "8.00")]);
        let cost = table.cost_for(&costs, false, false, "2500").expect("cost");
        assert_eq!(cost, 12.0);
        let cost = table.cost_for(&costs, false, false, "2000").expect("cost");
        assert_eq!(cost, 8.0);
    }

    #[test]
    fn bulky_items_pay_the_surcharge() {
        let table = ZoneTable::new();
        let costs = priced(&[(ZoneCode::NswM, "10.00")]);
        let cost = table.cost_for(&costs, true, false, "2000").expect("cost");
        assert_eq!(cost, 15.0);
    }

    #[test]
    fn free_shipping_wins_before_zone_lookup() {
        let table = ZoneTable::new();
        let costs = BTreeMap::new();
        let cost = table.cost_for(&costs, true, true, "2000").expect("cost");
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn unpriced_zone_is_an_error_not_zero() {
        let table = ZoneTable::new();
        let mut costs = priced(&[(ZoneCode::NswM, "10.00")]);
        costs.insert(ZoneCode::VicM, "".to_string());
        let err = table
            .cost_for(&costs, false, false, "3000")
            .expect_err("should fail");
        assert_eq!(
            err,
            ShippingError::ZoneNotPriced {
                zone: ZoneCode::VicM
            }
        );
    }

    #[test]
    fn refresh_keeps_the_table_usable() {
        let table = ZoneTable::new();
        table.refresh();
        assert_eq!(table.zone_for("2500"), ZoneCode::NswR);
    }
}
