pub mod normalize;
pub mod shape;

pub use normalize::{normalize, normalize_at, LOAD_TIMESTAMP_COLUMN};
pub use shape::shape;
