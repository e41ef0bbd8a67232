// Technical indicators used by the reference signal source
pub mod moving_average;

pub use moving_average::calculate_sma;
