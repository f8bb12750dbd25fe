use once_cell::sync::Lazy;
use std::env;

pub static PARTNER_API_URL: Lazy<String> =
    Lazy::new(|| env::var("PARTNER_API_URL").unwrap_or_default());

pub static PARTNER_EMAIL: Lazy<String> =
    Lazy::new(|| env::var("PARTNER_EMAIL").unwrap_or_default());

pub static PARTNER_PASSWORD: Lazy<String> =
    Lazy::new(|| env::var("PARTNER_PASSWORD").unwrap_or_default());
