use std::collections::HashMap;
use std::io::{self, Write};

use anyhow::{bail, ensure, Context};
use log::{info, warn};
use serde::Serialize;

use crate::base::{AccessKind, MemoryReference};
use crate::cache::{
    CachingDevice, DeviceArena, DeviceId, DeviceParams, Lookup, PageWalkClassifier,
    PageWalkHistogram, ReplacementPolicy,
};
use crate::sim::config::{CacheKnobs, DeviceKind, DeviceRole, DeviceSpec, HierarchyConfig, SimConfig, TlbKnobs};
use crate::sim::page_table::{PageTable, WALK_LEVELS};
use crate::sim::perf_log::{AggregateSummary, DeviceSummary, SimSummary};

const DEFAULT_PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub hits: u64,
    pub misses: u64,
}

/// Per-core entry points of the hierarchy.
struct EntryPoints {
    icaches: Vec<DeviceId>,
    dcaches: Vec<DeviceId>,
    tlbs: Vec<Option<DeviceId>>,
}

/// Builds the device topology, routes references to the first-level device of
/// their core and keeps run-level bookkeeping (warm-up, walk histograms).
pub struct CacheSimulator {
    devices: DeviceArena,
    entry: EntryPoints,
    walks: PageWalkClassifier,
    pte_walks: PageWalkClassifier,
    pte_levels: [LevelCounts; WALK_LEVELS],
    unmapped_walks: u64,
    page_table: Option<PageTable>,
    warmup_refs: u64,
    warmup_fraction: f64,
    sim_refs: u64,
    refs_processed: u64,
    refs_simulated: u64,
    failed_refs: u64,
    is_warmed_up: bool,
}

fn add_device(devices: &mut DeviceArena, params: DeviceParams, parent: Option<DeviceId>) -> anyhow::Result<DeviceId> {
    let device = CachingDevice::new(params)?;
    devices.add(device, parent)
}

impl CacheSimulator {
    /// Private L1 instruction/data caches per core, an optional private L2 per
    /// core and a shared last-level cache; per-core TLBs in front of an
    /// optional shared second-level TLB.
    pub fn from_knobs(cache: &CacheKnobs, tlb: &TlbKnobs, sim: &SimConfig) -> anyhow::Result<Self> {
        ensure!(cache.num_cores > 0, "num_cores must be > 0");
        let policy = ReplacementPolicy::from_name(cache.replace_policy.as_deref())
            .context("[cache] replace_policy")?;
        let line = cache.line_size;
        let mut devices = DeviceArena::default();

        let llc = add_device(
            &mut devices,
            DeviceParams::cache("LL", cache.llc_size, cache.llc_assoc, line)?.with_policy(policy),
            None,
        )?;
        let mut icaches = Vec::with_capacity(cache.num_cores);
        let mut dcaches = Vec::with_capacity(cache.num_cores);
        for core in 0..cache.num_cores {
            let upper = if cache.l2_size > 0 {
                let name = format!("L2_core{core}");
                add_device(
                    &mut devices,
                    DeviceParams::cache(&name, cache.l2_size, cache.l2_assoc, line)?.with_policy(policy),
                    Some(llc),
                )?
            } else {
                llc
            };
            let name = format!("L1_I_core{core}");
            icaches.push(add_device(
                &mut devices,
                DeviceParams::cache(&name, cache.l1i_size, cache.l1i_assoc, line)?.with_policy(policy),
                Some(upper),
            )?);
            let name = format!("L1_D_core{core}");
            dcaches.push(add_device(
                &mut devices,
                DeviceParams::cache(&name, cache.l1d_size, cache.l1d_assoc, line)?.with_policy(policy),
                Some(upper),
            )?);
        }

        let mut tlbs = vec![None; cache.num_cores];
        if tlb.enabled {
            let policy = ReplacementPolicy::from_name(tlb.replace_policy.as_deref())
                .context("[tlb] replace_policy")?;
            let partition = |params: DeviceParams, gpa_ways: usize| {
                if tlb.static_partition {
                    params.with_partition(gpa_ways)
                } else {
                    params
                }
            };
            let l2 = if tlb.l2_entries > 0 {
                let params = DeviceParams::tlb("TLB_L2", tlb.l2_entries, tlb.l2_assoc, tlb.page_size)?
                    .with_policy(policy);
                Some(add_device(&mut devices, partition(params, tlb.l2_gpa_ways), None)?)
            } else {
                None
            };
            for (core, slot) in tlbs.iter_mut().enumerate() {
                let name = format!("TLB_L1_core{core}");
                let params = DeviceParams::tlb(&name, tlb.l1_entries, tlb.l1_assoc, tlb.page_size)?
                    .with_policy(policy);
                *slot = Some(add_device(&mut devices, partition(params, tlb.l1_gpa_ways), l2)?);
            }
        }

        Self::assemble(devices, EntryPoints { icaches, dcaches, tlbs }, sim)
    }

    /// Arbitrary topology. Every core in `0..=max(core)` needs a first-level
    /// instruction and data cache; first-level TLBs are optional.
    pub fn from_hierarchy(hierarchy: &HierarchyConfig, sim: &SimConfig) -> anyhow::Result<Self> {
        ensure!(!hierarchy.devices.is_empty(), "hierarchy has no devices");
        let mut specs: HashMap<&str, &DeviceSpec> = HashMap::new();
        for spec in &hierarchy.devices {
            ensure!(!spec.name.is_empty(), "hierarchy device without a name");
            if specs.insert(spec.name.as_str(), spec).is_some() {
                bail!("duplicate device name '{}'", spec.name);
            }
        }

        let mut devices = DeviceArena::default();
        let mut chain = Vec::new();
        for spec in &hierarchy.devices {
            build_spec(spec, &specs, &mut devices, &mut chain)?;
        }

        let num_cores = hierarchy
            .devices
            .iter()
            .filter_map(|d| d.core)
            .max()
            .map(|core| core + 1)
            .context("hierarchy has no per-core first-level devices")?;
        let mut icaches = vec![None; num_cores];
        let mut dcaches = vec![None; num_cores];
        let mut tlbs = vec![None; num_cores];
        for spec in &hierarchy.devices {
            let Some(core) = spec.core else {
                continue;
            };
            let id = devices
                .find(&spec.name)
                .with_context(|| format!("{} was not built", spec.name))?;
            match (spec.kind, spec.role) {
                (DeviceKind::Tlb, _) => claim(&mut tlbs[core], id, core, "TLB")?,
                (DeviceKind::Cache, DeviceRole::Instruction) => claim(&mut icaches[core], id, core, "instruction cache")?,
                (DeviceKind::Cache, DeviceRole::Data) => claim(&mut dcaches[core], id, core, "data cache")?,
                (DeviceKind::Cache, DeviceRole::Unified) => {
                    claim(&mut icaches[core], id, core, "instruction cache")?;
                    claim(&mut dcaches[core], id, core, "data cache")?;
                }
            }
        }
        let required = |slots: Vec<Option<DeviceId>>, what: &str| {
            slots
                .into_iter()
                .enumerate()
                .map(|(core, id)| id.with_context(|| format!("core {core} has no first-level {what}")))
                .collect::<anyhow::Result<Vec<_>>>()
        };
        let entry = EntryPoints {
            icaches: required(icaches, "instruction cache")?,
            dcaches: required(dcaches, "data cache")?,
            tlbs,
        };
        Self::assemble(devices, entry, sim)
    }

    fn assemble(devices: DeviceArena, entry: EntryPoints, sim: &SimConfig) -> anyhow::Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&sim.warmup_fraction),
            "warmup_fraction {} is outside [0, 1]",
            sim.warmup_fraction
        );
        let mut simulator = Self {
            devices,
            entry,
            walks: PageWalkClassifier::default(),
            pte_walks: PageWalkClassifier::default(),
            pte_levels: [LevelCounts::default(); WALK_LEVELS],
            unmapped_walks: 0,
            page_table: None,
            warmup_refs: sim.warmup_refs,
            warmup_fraction: sim.warmup_fraction,
            sim_refs: sim.sim_refs,
            refs_processed: 0,
            refs_simulated: 0,
            failed_refs: 0,
            is_warmed_up: sim.warmup_refs == 0 && sim.warmup_fraction <= 0.0,
        };
        if let Some(path) = &sim.page_table {
            let table = PageTable::load(path, simulator.page_size())?;
            simulator.set_page_table(table);
        }
        Ok(simulator)
    }

    /// Page size of the first-level TLBs, used to key page-table lookups.
    pub fn page_size(&self) -> u64 {
        self.entry
            .tlbs
            .iter()
            .flatten()
            .next()
            .map_or(DEFAULT_PAGE_SIZE, |&id| self.devices.get(id).block_size())
    }

    pub fn set_page_table(&mut self, table: PageTable) {
        self.page_table = Some(table);
    }

    fn route(&self, memref: &MemoryReference) -> Option<DeviceId> {
        let core = memref.core_id;
        match memref.kind {
            AccessKind::Instruction => self.entry.icaches.get(core).copied(),
            AccessKind::Load | AccessKind::Store => self.entry.dcaches.get(core).copied(),
            AccessKind::TranslateGva | AccessKind::TranslateGpa => {
                self.entry.tlbs.get(core).copied().flatten()
            }
        }
    }

    /// Simulate one reference. Returns false when the reference names a core
    /// or device kind the topology does not have; the run may continue.
    pub fn process_memref(&mut self, memref: &MemoryReference) -> bool {
        let Some(target) = self.route(memref) else {
            self.failed_refs += 1;
            warn!(
                "cannot route {}: {} cores configured, no matching first-level device",
                memref,
                self.num_cores()
            );
            return false;
        };

        match memref.kind.domain() {
            None => {
                self.devices.request(target, memref, Lookup::Line);
            }
            Some(domain) => {
                let access = self.devices.request(target, memref, Lookup::Translate(domain));
                self.walks.classify(&access.levels);
                if access.resolved && access.hit_level().is_none() {
                    self.walk_page_table(memref);
                }
            }
        }

        self.refs_processed += 1;
        if self.is_warmed_up {
            self.refs_simulated += 1;
        } else if self.check_warmed_up() {
            self.finish_warmup();
        }
        true
    }

    /// Replay the page-table walk of a translation that missed every TLB level
    /// through the core's first-level data cache.
    fn walk_page_table(&mut self, memref: &MemoryReference) {
        let Some(table) = &self.page_table else {
            return;
        };
        let Some(entry) = table.lookup(memref.addr).copied() else {
            self.unmapped_walks += 1;
            return;
        };
        let dcache = self.entry.dcaches[memref.core_id];
        for (level, &entry_addr) in entry.entries.iter().enumerate() {
            let load = MemoryReference::new(AccessKind::Load, memref.core_id, memref.pid, entry_addr);
            let hit = self.devices.request(dcache, &load, Lookup::Line).hit;
            self.pte_walks.observe(hit);
            let counts = &mut self.pte_levels[level];
            if hit {
                counts.hits += 1;
            } else {
                counts.misses += 1;
            }
        }
        self.pte_walks.finish();
    }

    /// Warm once `warmup_refs` references were seen or every device has filled
    /// `warmup_fraction` of its blocks. With both disabled the run starts warm.
    pub fn check_warmed_up(&self) -> bool {
        if self.is_warmed_up {
            return true;
        }
        if self.warmup_refs > 0 && self.refs_processed >= self.warmup_refs {
            return true;
        }
        self.warmup_fraction > 0.0
            && self
                .devices
                .iter()
                .all(|(_, device)| device.loaded_fraction() >= self.warmup_fraction)
    }

    fn finish_warmup(&mut self) {
        info!("cache simulation warmed up after {} references", self.refs_processed);
        self.devices.reset_stats();
        self.walks.reset();
        self.pte_walks.reset();
        self.pte_levels = [LevelCounts::default(); WALK_LEVELS];
        self.unmapped_walks = 0;
        self.is_warmed_up = true;
    }

    pub fn remaining_sim_refs(&self) -> u64 {
        self.sim_refs.saturating_sub(self.refs_simulated)
    }

    pub fn is_warmed_up(&self) -> bool {
        self.is_warmed_up
    }

    pub fn num_cores(&self) -> usize {
        self.entry.dcaches.len()
    }

    pub fn refs_processed(&self) -> u64 {
        self.refs_processed
    }

    pub fn failed_refs(&self) -> u64 {
        self.failed_refs
    }

    pub fn devices(&self) -> &DeviceArena {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&CachingDevice> {
        self.devices.find(name).map(|id| self.devices.get(id))
    }

    pub fn walk_histogram(&self) -> &PageWalkHistogram {
        self.walks.histogram()
    }

    pub fn pte_walk_histogram(&self) -> &PageWalkHistogram {
        self.pte_walks.histogram()
    }

    pub fn pte_levels(&self) -> &[LevelCounts] {
        &self.pte_levels
    }

    pub fn unmapped_walks(&self) -> u64 {
        self.unmapped_walks
    }

    pub fn summary(&self) -> SimSummary {
        let devices: Vec<DeviceSummary> = self
            .devices
            .iter()
            .map(|(_, device)| DeviceSummary {
                name: device.name().to_string(),
                kind: device.strategy().kind_name(),
                parent: device.parent().map(|p| self.devices.get(p).name().to_string()),
                sets: device.num_sets(),
                ways: device.associativity(),
                block_size: device.block_size(),
                policy: device.policy().name(),
                loaded_fraction: device.loaded_fraction(),
                miss_rate: device.stats().miss_rate(),
                stats: *device.stats(),
            })
            .collect();

        let mut totals = AggregateSummary::default();
        for &id in &self.entry.icaches {
            totals.l1i += self.devices.get(id).stats();
        }
        for &id in &self.entry.dcaches {
            totals.l1d += self.devices.get(id).stats();
        }
        for &id in self.entry.tlbs.iter().flatten() {
            totals.l1_tlb += self.devices.get(id).stats();
        }

        SimSummary {
            refs_processed: self.refs_processed,
            refs_simulated: self.refs_simulated,
            failed_refs: self.failed_refs,
            warmed_up: self.is_warmed_up,
            devices,
            totals,
            tlb_walks: self.walks.histogram().entries(),
            pte_walks: self.pte_walks.histogram().entries(),
            pte_levels: self.pte_levels.to_vec(),
            unmapped_walks: self.unmapped_walks,
        }
    }

    pub fn write_results<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "References: {} processed, {} after warm-up, {} unroutable",
            self.refs_processed, self.refs_simulated, self.failed_refs
        )?;
        for (_, device) in self.devices.iter() {
            let stats = device.stats();
            writeln!(
                out,
                "{} ({}, {} sets x {} ways, {}B, {}):",
                device.name(),
                device.strategy().kind_name(),
                device.num_sets(),
                device.associativity(),
                device.block_size(),
                device.policy().name()
            )?;
            writeln!(out, "    Hits:         {:>12}", stats.hits())?;
            writeln!(out, "    Misses:       {:>12}", stats.misses())?;
            writeln!(out, "    Child hits:   {:>12}", stats.child_hits())?;
            writeln!(out, "    Child misses: {:>12}", stats.child_misses())?;
            writeln!(out, "    Installs:     {:>12}", stats.installs())?;
            writeln!(out, "    Evictions:    {:>12}", stats.evictions())?;
            writeln!(out, "    Miss rate:    {:>11.2}%", stats.miss_rate() * 100.0)?;
        }
        write_histogram(out, "TLB walk patterns", self.walks.histogram())?;
        if self.page_table.is_some() {
            write_histogram(out, "Page-table walk patterns", self.pte_walks.histogram())?;
            for (level, counts) in self.pte_levels.iter().enumerate() {
                writeln!(
                    out,
                    "    PE{}: {} hits, {} misses",
                    level + 1,
                    counts.hits,
                    counts.misses
                )?;
            }
            writeln!(out, "    Unmapped walks: {}", self.unmapped_walks)?;
        }
        Ok(())
    }

    pub fn print_results(&self) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_results(&mut out)
    }
}

fn write_histogram<W: Write>(out: &mut W, title: &str, histogram: &PageWalkHistogram) -> io::Result<()> {
    let total = histogram.total();
    writeln!(out, "{} ({} walks):", title, total)?;
    for entry in histogram.entries() {
        writeln!(
            out,
            "    {:<8} {:>12} ({:.2}%)",
            entry.pattern,
            entry.count,
            entry.count as f64 * 100.0 / total as f64
        )?;
    }
    Ok(())
}

fn claim(slot: &mut Option<DeviceId>, id: DeviceId, core: usize, what: &str) -> anyhow::Result<()> {
    ensure!(slot.is_none(), "core {} has more than one first-level {}", core, what);
    *slot = Some(id);
    Ok(())
}

/// Build `spec` after its ancestors so that parents always precede children in
/// the arena. `chain` holds the names currently being built, to catch cycles.
fn build_spec<'a>(
    spec: &'a DeviceSpec,
    specs: &HashMap<&'a str, &'a DeviceSpec>,
    devices: &mut DeviceArena,
    chain: &mut Vec<&'a str>,
) -> anyhow::Result<DeviceId> {
    if let Some(id) = devices.find(&spec.name) {
        return Ok(id);
    }
    if chain.contains(&spec.name.as_str()) {
        bail!("parent cycle: {} -> {}", chain.join(" -> "), spec.name);
    }

    chain.push(spec.name.as_str());
    let parent = match &spec.parent {
        Some(name) => {
            let parent_spec = specs
                .get(name.as_str())
                .copied()
                .with_context(|| format!("{}: unknown parent '{}'", spec.name, name))?;
            Some(build_spec(parent_spec, specs, devices, chain)?)
        }
        None => None,
    };
    chain.pop();

    let policy = ReplacementPolicy::from_name(spec.replace_policy.as_deref())
        .with_context(|| format!("device {}", spec.name))?;
    let params = match spec.kind {
        DeviceKind::Cache => {
            ensure!(
                spec.gpa_ways.is_none(),
                "{}: gpa_ways only applies to tlb devices",
                spec.name
            );
            DeviceParams::cache(&spec.name, spec.size, spec.assoc, spec.block_size)?
        }
        DeviceKind::Tlb => {
            let params = DeviceParams::tlb(&spec.name, spec.size, spec.assoc, spec.block_size)?;
            match spec.gpa_ways {
                Some(gpa_ways) => params.with_partition(gpa_ways),
                None => params,
            }
        }
    };
    add_device(devices, params.with_policy(policy), parent)
}
