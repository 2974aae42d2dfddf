pub mod consumption;
pub mod point;
pub mod reading;

pub use consumption::{ConsumptionNode, ConsumptionPage, Cursor};
pub use point::{FieldValue, Point};
pub use reading::{Reading, Value, TIMESTAMP_KEY};
