pub mod demo;

use clap::Parser;

pub use demo::DemoArgs;

#[derive(Parser)]
#[command(name = "candle-rebar")]
#[command(about = "Jointly train Bernoulli logits and a REBAR control variate")]
pub struct Cli {
    #[command(flatten)]
    pub args: DemoArgs,
}
