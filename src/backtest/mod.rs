// Historical simulation over the execution loop
pub mod metrics;
pub mod runner;
pub mod synthetic;

pub use metrics::{BacktestMetrics, EquityPoint};
pub use runner::{BacktestOptions, BacktestRunner};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
