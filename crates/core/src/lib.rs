pub mod clock;
pub mod effects;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod row;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use field_value::{FieldValue, Fields};
pub use ids::*;
pub use row::Row;
