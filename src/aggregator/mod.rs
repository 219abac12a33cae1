pub mod candle;
pub mod window;

pub use window::{AggregatorStats, WindowAggregator};
