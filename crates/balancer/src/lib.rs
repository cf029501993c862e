mod health;
mod select;

pub use health::{monitor, HealthTracker, MONITOR_INTERVAL};
pub use select::Selector;
