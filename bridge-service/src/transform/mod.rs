use bridge_client::domain::{FieldValue, Point, Reading, Value, TIMESTAMP_KEY};
use time::format_description::well_known::Rfc3339;

pub mod phases;

pub use phases::normalize_phases;

/// Strings at or above this length are stored as fields, never as tags.
///
/// Free text (currency descriptions, long identifiers) must not reach the tag
/// index or its cardinality explodes.
pub const MAX_TAG_LEN: usize = 64;

/// Map a reading onto the measurement's tag/field/timestamp schema.
///
/// Rules:
/// - strings shorter than [`MAX_TAG_LEN`] characters become tags, longer ones string fields;
/// - numbers become float fields, booleans boolean fields;
/// - temporal values become RFC 3339 string fields;
/// - nulls are omitted.
///
/// The timestamp is left empty when the reading has none that parses; callers
/// reject such readings before writing.
pub fn encode(measurement: &str, reading: &Reading) -> Point {
    let mut point = Point::new(measurement);
    point.timestamp = reading.timestamp();

    for (key, value) in reading.iter() {
        if key == TIMESTAMP_KEY {
            continue;
        }

        match value {
            Value::Null => {}
            Value::Text(s) if s.chars().count() < MAX_TAG_LEN => {
                point.tags.insert(key.to_string(), s.clone());
            }
            Value::Text(s) => {
                point.fields.insert(key.to_string(), FieldValue::Str(s.clone()));
            }
            Value::Number(n) => {
                point.fields.insert(key.to_string(), FieldValue::Float(*n));
            }
            Value::Bool(b) => {
                point.fields.insert(key.to_string(), FieldValue::Bool(*b));
            }
            Value::Time(ts) => match ts.format(&Rfc3339) {
                Ok(s) => {
                    point.fields.insert(key.to_string(), FieldValue::Str(s));
                }
                Err(e) => {
                    tracing::debug!(error = %e, key, "dropping unformattable temporal value");
                }
            },
        }
    }

    point
}
