use anyhow::Result;
use candle_rebar::cli::{demo, Cli};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    demo::run(&cli.args)?;

    Ok(())
}
