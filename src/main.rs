use std::fs;

use anyhow::Context;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use memhier::ui::{load_config, MemhierArgs};

fn init_logging(level: u64) {
    let mut builder = Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(match level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        });
    }
    builder.init();
}

pub fn main() -> anyhow::Result<()> {
    let argv = MemhierArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;

    let run = load_config(&config, Some(argv))?;
    init_logging(run.sim.log_level);
    let mut sim = run.build()?;
    sim.simulate()
}
