// Position accounting, the live bar buffer and the execution loops
pub mod executor;
pub mod kline_buffer;
pub mod ledger;
pub mod live;

pub use executor::{CycleReport, ExecutionLoop};
pub use kline_buffer::{BarSnapshot, KlineBuffer};
pub use ledger::{
    AccountSummary, CloseRecord, ClosingReport, FeeModel, LedgerConfig, LiquidationEvent,
    OpenOutcome, PositionLedger, PositionSizer, SizingPolicy, ValuationMode,
};
pub use live::{
    merge_live_bar, LiveCycleOutcome, LiveExecutor, OrderAck, OrderEndpoint, OrderRequest,
    OrderSide, PaperExchange, PositionInfo,
};
