//! Public types for the Skirnir API.

mod data_type;
mod geo;
mod options;

pub use data_type::DataType;
pub use geo::{EARTH_RADIUS_KM, GeoPoint};
pub use options::{CallOptions, Outcome, ResponseSource};
