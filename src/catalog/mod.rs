pub mod fields;
pub mod map;
pub mod record;
pub mod validate;

pub use map::{MappingError, NormalizedProduct, map_product};
pub use record::SourceProduct;
pub use validate::{EanPolicy, ValidationError, ValidationWarning, validate_product};
