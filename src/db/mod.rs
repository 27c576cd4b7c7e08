pub mod writer;

pub use writer::{SqliteWarehouse, Warehouse};
