//! Async adapters for plot consumers

mod drain;

pub use drain::{DEFAULT_MAX_BATCH, DEFAULT_PERIOD, DrainExt, DrainStream};
