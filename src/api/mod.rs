// Exchange REST adapters
pub mod okx;

pub use okx::{bar_label, OkxClient, OkxTrade, OKX_API_BASE};
