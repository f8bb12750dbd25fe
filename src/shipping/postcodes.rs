use crate::shipping::ShippingError;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// State centroids used for the diagnostic distance estimate.
const STATE_CENTROIDS: &[(&str, f64, f64)] = &[
    ("NSW", -33.8688, 151.2093),
    ("VIC", -37.8136, 144.9631),
    ("QLD", -27.4698, 153.0251),
    ("SA", -34.9285, 138.6007),
    ("WA", -31.9505, 115.8605),
    ("TAS", -42.8821, 147.3272),
    ("NT", -12.4634, 130.8456),
    ("ACT", -35.2809, 149.1300),
];

// Scanned in order; NSW claims the 26xx overlap ahead of the ACT entry.
const STATE_RANGES: &[(&str, &[(u32, u32)])] = &[
    ("NSW", &[(2000, 2999)]),
    ("VIC", &[(3000, 3999)]),
    ("QLD", &[(4000, 4999)]),
    ("SA", &[(5000, 5999)]),
    ("WA", &[(6000, 6999)]),
    ("TAS", &[(7000, 7999)]),
    ("NT", &[(800, 999)]),
    ("ACT", &[(200, 299), (2600, 2618), (2900, 2920)]),
];

/// Strip everything non-numeric and left-pad to four digits. Longer inputs
/// are kept as-is so malformed codes stay visibly malformed.
pub fn format_postcode(raw: &str) -> String {
    let digits: String = raw.chars().filter(|ch| ch.is_ascii_digit()).collect();
    format!("{digits:0>4}")
}

/// A postcode is valid when it is exactly four digits and falls inside a
/// known state range.
pub fn validate_postcode(raw: &str) -> bool {
    let formatted = format_postcode(raw);
    if formatted.len() != 4 {
        return false;
    }
    match formatted.parse::<u32>() {
        Ok(number) => state_for_number(number).is_some(),
        Err(_) => false,
    }
}

pub fn state_for_postcode(raw: &str) -> Option<&'static str> {
    let formatted = format_postcode(raw);
    if formatted.len() != 4 {
        return None;
    }
    formatted.parse::<u32>().ok().and_then(state_for_number)
}

fn state_for_number(number: u32) -> Option<&'static str> {
    for (state, ranges) in STATE_RANGES {
        for (start, end) in *ranges {
            if (*start..=*end).contains(&number) {
                return Some(state);
            }
        }
    }
    None
}

/// Approximate distance in whole kilometres between the state centroids of
/// two postcodes. Diagnostic only; never feeds cost calculation. Two codes
/// in the same state are zero kilometres apart.
pub fn distance_between_postcodes(from: &str, to: &str) -> Result<u32, ShippingError> {
    let from_state = state_for_postcode(from)
        .ok_or_else(|| ShippingError::InvalidPostcode(from.to_string()))?;
    let to_state =
        state_for_postcode(to).ok_or_else(|| ShippingError::InvalidPostcode(to.to_string()))?;
    if from_state == to_state {
        return Ok(0);
    }
    let (from_lat, from_lon) = centroid(from_state)
        .ok_or_else(|| ShippingError::InvalidPostcode(from.to_string()))?;
    let (to_lat, to_lon) =
        centroid(to_state).ok_or_else(|| ShippingError::InvalidPostcode(to.to_string()))?;
    Ok(haversine_km(from_lat, from_lon, to_lat, to_lon).round() as u32)
}

fn centroid(state: &str) -> Option<(f64, f64)> {
    STATE_CENTROIDS
        .iter()
        .find(|(name, _, _)| *name == state)
        .map(|(_, lat, lon)| (*lat, *lon))
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
