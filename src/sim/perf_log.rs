use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use log::info;
use serde::Serialize;

use crate::cache::{Stats, WalkPatternCount};
use crate::sim::simulator::LevelCounts;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub kind: &'static str,
    pub parent: Option<String>,
    pub sets: usize,
    pub ways: usize,
    pub block_size: u64,
    pub policy: &'static str,
    pub loaded_fraction: f64,
    pub miss_rate: f64,
    pub stats: Stats,
}

/// Sums over the first-level devices of every core.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregateSummary {
    pub l1i: Stats,
    pub l1d: Stats,
    pub l1_tlb: Stats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimSummary {
    pub refs_processed: u64,
    pub refs_simulated: u64,
    pub failed_refs: u64,
    pub warmed_up: bool,
    pub devices: Vec<DeviceSummary>,
    pub totals: AggregateSummary,
    pub tlb_walks: Vec<WalkPatternCount>,
    pub pte_walks: Vec<WalkPatternCount>,
    pub pte_levels: Vec<LevelCounts>,
    pub unmapped_walks: u64,
}

pub fn write_summary(path: &Path, summary: &SimSummary) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writeln!(writer)?;
    writer.flush()?;
    info!("wrote results summary to {}", path.display());
    Ok(())
}
