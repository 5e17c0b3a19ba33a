pub mod calendar;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod wal;
pub mod wire;

pub use engine::{Engine, EngineError};
