pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sheet;
pub mod sql;
pub mod wal;
pub mod wire;
