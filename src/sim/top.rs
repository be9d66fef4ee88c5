use anyhow::bail;
use log::info;

use crate::base::MemoryReference;
use crate::sim::config::{SimConfig, SyntheticConfig};
use crate::sim::perf_log;
use crate::sim::simulator::CacheSimulator;
use crate::sim::synthetic::SyntheticTrace;
use crate::sim::trace::TraceReader;

/// Top-level driver: feeds a reference source into the simulator until the
/// source runs dry or the post-warm-up budget is spent, then reports.
pub struct Sim {
    pub simulator: CacheSimulator,
    pub config: SimConfig,
    pub synthetic: Option<SyntheticConfig>,
}

impl Sim {
    pub fn new(simulator: CacheSimulator, config: SimConfig, synthetic: Option<SyntheticConfig>) -> Self {
        Self {
            simulator,
            config,
            synthetic,
        }
    }

    pub fn simulate(&mut self) -> anyhow::Result<()> {
        if let Some(synthetic) = self.synthetic.clone() {
            self.drive(SyntheticTrace::new(synthetic).map(Ok))?;
        } else if let Some(path) = self.config.trace.clone() {
            self.drive(TraceReader::open(&path)?)?;
        } else {
            bail!("no reference source: set [sim] trace or pass --synthetic");
        }

        self.simulator.print_results()?;
        if let Some(path) = &self.config.results_json {
            perf_log::write_summary(path, &self.simulator.summary())?;
        }
        Ok(())
    }

    /// Returns the number of references handed to the simulator.
    pub fn drive<I>(&mut self, refs: I) -> anyhow::Result<u64>
    where
        I: IntoIterator<Item = anyhow::Result<MemoryReference>>,
    {
        let mut fed = 0u64;
        for memref in refs {
            if self.simulator.remaining_sim_refs() == 0 {
                info!("simulation budget exhausted");
                break;
            }
            self.simulator.process_memref(&memref?);
            fed += 1;
        }
        info!(
            "fed {} references ({} unroutable), warmed up: {}",
            fed,
            self.simulator.failed_refs(),
            self.simulator.is_warmed_up()
        );
        Ok(fed)
    }
}
