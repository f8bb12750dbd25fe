//! Field-level parsing for raw source cells.
//!
//! The source catalog serves every value-bearing column as a string (or
//! null), numeric columns included. These helpers centralize the trimming,
//! numeric parsing, and flag conventions shared by the validator and the
//! mapper.

pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Parse a raw cell into a finite float. Returns `None` for empty,
/// non-numeric, NaN, or infinite input.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Strip everything that cannot be part of a decimal number. Source rows
/// occasionally carry currency symbols or thousands separators.
pub fn sanitize_numeric(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-'))
        .collect()
}

pub fn format_money(amount: f64) -> String {
    format!("{amount:.2}")
}

/// Sanitize and format a raw price cell to a two decimal string. Unparseable
/// input yields `None` so callers can keep an empty string for "unknown".
pub fn money_string(raw: &str) -> Option<String> {
    parse_number(&sanitize_numeric(raw)).map(format_money)
}

/// Integer quantity with loose source semantics: leading float is truncated,
/// anything unparseable counts as zero.
pub fn parse_quantity(raw: &str) -> i64 {
    parse_number(raw).map(|value| value.trunc() as i64).unwrap_or(0)
}

/// Tri-state source flag. The catalog encodes booleans as exactly `Yes`,
/// `No`, or an empty cell; anything else is a data error.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "Yes" => Some(true),
        "No" | "" => Some(false),
        _ => None,
    }
}

/// Lowercased file extension of a URL path, query string ignored.
pub fn image_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn has_allowed_image_extension(url: &str) -> bool {
    image_extension(url)
        .map(|ext| ALLOWED_IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// EAN-13 check digit verification. Expects exactly 13 ASCII digits.
pub fn ean13_checksum_ok(code: &str) -> bool {
    let digits: Vec<u32> = code.chars().filter_map(|ch| ch.to_digit(10)).collect();
    if digits.len() != 13 || code.len() != 13 {
        return false;
    }
    let sum: u32 = digits[..12]
        .iter()
        .enumerate()
        .map(|(idx, digit)| if idx % 2 == 0 { *digit } else { digit * 3 })
        .sum();
    (10 - sum % 10) % 10 == digits[12]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_accepts_plain_decimals() {
        assert_eq!(parse_number("49.95"), Some(49.95));
        assert_eq!(parse_number(" 12 "), Some(12.0));
        assert_eq!(parse_number("-5"), Some(-5.0));
    }

    #[test]
    fn parse_number_rejects_junk() {
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("12,50"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn money_string_formats_two_decimals() {
        assert_eq!(money_string("49.9"), Some("49.90".to_string()));
        assert_eq!(money_string("$1,299.50"), Some("1299.50".to_string()));
        assert_eq!(money_string("7"), Some("7.00".to_string()));
        assert_eq!(money_string(""), None);
        assert_eq!(money_string("n/a"), None);
    }

    #[test]
    fn parse_quantity_truncates_and_defaults() {
        assert_eq!(parse_quantity("14"), 14);
        assert_eq!(parse_quantity("3.9"), 3);
        assert_eq!(parse_quantity(""), 0);
        assert_eq!(parse_quantity("abc"), 0);
    }

    #[test]
    fn parse_flag_is_strict() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("No"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("  "), Some(false));
        assert_eq!(parse_flag("yes"), None);
        assert_eq!(parse_flag("TRUE"), None);
    }

    #[test]
    fn image_extension_ignores_query_strings() {
        assert_eq!(
            image_extension("https://cdn.example.com/a/photo.JPG?w=800"),
            Some("jpg".to_string())
        );
        assert_eq!(image_extension("https://cdn.example.com/photo"), None);
        assert!(has_allowed_image_extension("https://x.test/p.webp"));
        assert!(!has_allowed_image_extension("https://x.test/p.bmp"));
    }

    #[test]
    fn ean13_checksum_matches_known_codes() {
        assert!(ean13_checksum_ok("9310779300005"));
        assert!(ean13_checksum_ok("4006381333931"));
        assert!(!ean13_checksum_ok("4006381333932"));
        assert!(!ean13_checksum_ok("12345"));
        assert!(!ean13_checksum_ok("400638133393a"));
    }
}
