//! Collections and the point write/read path

pub mod aggregator;
pub mod collections;
pub mod router;
pub mod types;

pub use collections::Collections;
