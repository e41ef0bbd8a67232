// Tick to kline aggregation
pub mod aggregator;
pub mod validator;

pub use aggregator::{aggregate_ticks, floor_timestamp, KlineAggregator};
pub use validator::BarValidator;
