pub mod signal;
pub mod trading;

pub use signal::{Signal, SignalIntent};
pub use trading::{InstanceConfig, MarginSpec, TradingEngine};
