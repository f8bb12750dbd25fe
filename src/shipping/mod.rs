pub mod postcodes;
pub mod zones;

pub use postcodes::{distance_between_postcodes, format_postcode, validate_postcode};
pub use zones::ZoneTable;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The 17 shipping lanes priced on every source record: a metro and a
/// regional code per mainland state plus Tasmania, the ACT, a remote
/// catch-all, and New Zealand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneCode {
    Act,
    NswM,
    NswR,
    NtM,
    NtR,
    QldM,
    QldR,
    Remote,
    SaM,
    SaR,
    TasM,
    TasR,
    VicM,
    VicR,
    WaM,
    WaR,
    Nz,
}

impl ZoneCode {
    pub const ALL: [ZoneCode; 17] = [
        ZoneCode::Act,
        ZoneCode::NswM,
        ZoneCode::NswR,
        ZoneCode::NtM,
        ZoneCode::NtR,
        ZoneCode::QldM,
        ZoneCode::QldR,
        ZoneCode::Remote,
        ZoneCode::SaM,
        ZoneCode::SaR,
        ZoneCode::TasM,
        ZoneCode::TasR,
        ZoneCode::VicM,
        ZoneCode::VicR,
        ZoneCode::WaM,
        ZoneCode::WaR,
        ZoneCode::Nz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneCode::Act => "ACT",
            ZoneCode::NswM => "NSW_M",
            ZoneCode::NswR => "NSW_R",
            ZoneCode::NtM => "NT_M",
            ZoneCode::NtR => "NT_R",
            ZoneCode::QldM => "QLD_M",
            ZoneCode::QldR => "QLD_R",
            ZoneCode::Remote => "REMOTE",
            ZoneCode::SaM => "SA_M",
            ZoneCode::SaR => "SA_R",
            ZoneCode::TasM => "TAS_M",
            ZoneCode::TasR => "TAS_R",
            ZoneCode::VicM => "VIC_M",
            ZoneCode::VicR => "VIC_R",
            ZoneCode::WaM => "WA_M",
            ZoneCode::WaR => "WA_R",
            ZoneCode::Nz => "NZ",
        }
    }

    pub fn from_code(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|zone| zone.as_str() == raw.trim().to_uppercase())
    }
}

impl std::fmt::Display for ZoneCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShippingError {
    #[error("postcode `{0}` is not a recognised four digit code")]
    InvalidPostcode(String),
    #[error("no shipping price for zone {zone}")]
    ZoneNotPriced { zone: ZoneCode },
}
