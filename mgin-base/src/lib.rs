mod error;
mod path;
mod value;

pub use error::{err, Error, Result};
pub use path::{
    contains_wildcard, entity_id, is_wildcard_segment, join, join_owned, last, parent, split,
    top_level,
};
pub use value::{OrderKey, Value};
