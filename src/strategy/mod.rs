pub mod macd;
pub mod special_k;

pub use special_k::{run_special_k, SpecialKParams};
