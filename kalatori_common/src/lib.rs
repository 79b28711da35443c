mod base_units;
mod helpers;

pub mod op;
mod secret;

pub use base_units::{raw_to_human, BaseUnits, BaseUnitsConversionError, MAX_DECIMALS};
pub use helpers::{parse_boolean_flag, random_instance_name};
pub use secret::Secret;
