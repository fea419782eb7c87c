#![forbid(unsafe_code)]

pub mod lifecycle;
pub mod model;
pub mod sync_policy;
pub mod time;

pub use time::Clock;
