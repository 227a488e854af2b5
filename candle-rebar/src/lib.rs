pub mod cli;
pub mod rebar;

pub use candle_core;
pub use candle_nn;
