use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use toml::Table;

use crate::sim::config::{
    CacheKnobs, Config, HierarchyConfig, PatternKind, SimConfig, SyntheticConfig, TlbKnobs,
};
use crate::sim::simulator::CacheSimulator;
use crate::sim::top::Sim;

#[derive(Parser)]
#[command(version, about)]
pub struct MemhierArgs {
    #[arg(help = "Path to config.toml")]
    pub config_path: PathBuf,
    #[arg(long, help = "Override memory reference trace path")]
    pub trace: Option<PathBuf>,
    #[arg(long, help = "Override page table dump path")]
    pub page_table: Option<PathBuf>,
    #[arg(long, help = "Override number of cores")]
    pub num_cores: Option<usize>,
    #[arg(long, help = "Override number of references simulated after warm-up")]
    pub sim_refs: Option<u64>,
    #[arg(long, help = "Override number of warm-up references")]
    pub warmup_refs: Option<u64>,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug)")]
    pub log: Option<u64>,
    #[arg(long, help = "Write a JSON results summary to this path")]
    pub results_json: Option<PathBuf>,
    #[arg(long, help = "Replace the trace with a synthetic pattern (strided, random, hot)")]
    pub synthetic: Option<PatternKind>,
}

/// Every configuration section, after CLI overrides.
pub struct RunConfig {
    pub sim: SimConfig,
    pub cache: CacheKnobs,
    pub tlb: TlbKnobs,
    pub hierarchy: Option<HierarchyConfig>,
    pub synthetic: Option<SyntheticConfig>,
}

impl RunConfig {
    pub fn build(self) -> anyhow::Result<Sim> {
        let simulator = match &self.hierarchy {
            Some(hierarchy) => CacheSimulator::from_hierarchy(hierarchy, &self.sim)?,
            None => CacheSimulator::from_knobs(&self.cache, &self.tlb, &self.sim)?,
        };
        Ok(Sim::new(simulator, self.sim, self.synthetic))
    }
}

/// Parse the TOML configuration.
/// If `cli_args` is given, override TOML options with CLI arguments.
pub fn load_config(toml_string: &str, cli_args: Option<MemhierArgs>) -> anyhow::Result<RunConfig> {
    let config_table: Table = toml::from_str(toml_string).context("cannot parse config toml")?;
    let mut sim = SimConfig::from_section(config_table.get("sim"))?;
    let mut cache = CacheKnobs::from_section(config_table.get("cache"))?;
    let tlb = TlbKnobs::from_section(config_table.get("tlb"))?;
    // an explicit hierarchy replaces the fixed knob topology
    let hierarchy = match config_table.get("hierarchy") {
        Some(section) => Some(HierarchyConfig::from_section(Some(section))?),
        None => None,
    }
    .filter(|h| !h.devices.is_empty());
    let mut synthetic = match config_table.get("synthetic") {
        Some(section) => Some(SyntheticConfig::from_section(Some(section))?),
        None => None,
    };

    let mut requested = None;
    if let Some(args) = cli_args {
        sim.log_level = args.log.unwrap_or(sim.log_level);
        sim.trace = args.trace.or(sim.trace);
        sim.page_table = args.page_table.or(sim.page_table);
        sim.sim_refs = args.sim_refs.unwrap_or(sim.sim_refs);
        sim.warmup_refs = args.warmup_refs.unwrap_or(sim.warmup_refs);
        sim.results_json = args.results_json.or(sim.results_json);
        cache.num_cores = args.num_cores.unwrap_or(cache.num_cores);
        if let Some(pattern) = args.synthetic {
            let synthetic = synthetic.get_or_insert_with(SyntheticConfig::default);
            synthetic.pattern = pattern;
            synthetic.num_cores = args.num_cores.unwrap_or(synthetic.num_cores);
            requested = Some(pattern);
        }
    }
    // a [synthetic] section only drives the run when no trace is configured
    if requested.is_none() && sim.trace.is_some() {
        synthetic = None;
    }

    Ok(RunConfig {
        sim,
        cache,
        tlb,
        hierarchy,
        synthetic,
    })
}

/// Make a Sim object from the TOML configuration.
pub fn make_sim(toml_string: &str, cli_args: Option<MemhierArgs>) -> anyhow::Result<Sim> {
    load_config(toml_string, cli_args)?.build()
}
