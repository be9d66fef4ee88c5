use anyhow::{bail, ensure};
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::ops::Range;

use super::block::CachingDeviceBlock;
use super::policy::ReplacementPolicy;
use super::stats::Stats;
use super::walk::PageWalkOutcome;
use crate::base::{Domain, MemoryReference};

/// Translation tags carry their domain in the top bit: set for guest-physical,
/// clear for guest-virtual.
pub const DOMAIN_BIT: u64 = 1 << 63;

/// Smallest block (line or page) a device may be configured with. A tag is the
/// address shifted right by at least two bits, so bit 63 is always clear
/// before the domain bit is applied and no tag can equal `TAG_INVALID`.
pub const MIN_BLOCK_SIZE: u64 = 4;

/// Handle of a device inside its `DeviceArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(usize);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Static split of a translation device's ways: `0..gpa_ways` serve
/// guest-physical lookups, `gpa_ways..associativity` guest-virtual ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WayPartition {
    pub gpa_ways: usize,
}

/// How a device turns an address into a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagStrategy {
    /// Plain cache: the tag is the line number.
    Line,
    /// TLB: page number plus domain bit, entries owned by a pid.
    Translation { partition: Option<WayPartition> },
}

impl TagStrategy {
    pub fn is_translation(self) -> bool {
        matches!(self, Self::Translation { .. })
    }

    pub fn kind_name(self) -> &'static str {
        match self {
            Self::Line => "cache",
            Self::Translation { .. } => "tlb",
        }
    }
}

/// Shape of a request. Caches only accept `Line`, TLBs only `Translate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Line,
    Translate(Domain),
}

#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub name: String,
    pub num_sets: usize,
    pub associativity: usize,
    pub block_size: u64,
    pub policy: ReplacementPolicy,
    pub strategy: TagStrategy,
}

impl DeviceParams {
    /// Cache of `size_bytes` total capacity.
    pub fn cache(name: &str, size_bytes: u64, associativity: usize, line_size: u64) -> anyhow::Result<Self> {
        ensure!(line_size > 0, "{}: line size must be > 0", name);
        let num_sets = sets_for(name, size_bytes / line_size, associativity)?;
        ensure!(
            size_bytes % line_size == 0,
            "{}: size {} is not a multiple of the line size {}",
            name,
            size_bytes,
            line_size
        );
        Ok(Self {
            name: name.to_string(),
            num_sets,
            associativity,
            block_size: line_size,
            policy: ReplacementPolicy::default(),
            strategy: TagStrategy::Line,
        })
    }

    /// TLB with `entries` translations of `page_size` bytes each.
    pub fn tlb(name: &str, entries: u64, associativity: usize, page_size: u64) -> anyhow::Result<Self> {
        let num_sets = sets_for(name, entries, associativity)?;
        Ok(Self {
            name: name.to_string(),
            num_sets,
            associativity,
            block_size: page_size,
            policy: ReplacementPolicy::default(),
            strategy: TagStrategy::Translation { partition: None },
        })
    }

    pub fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Statically partition the ways of a translation device.
    pub fn with_partition(mut self, gpa_ways: usize) -> Self {
        if let TagStrategy::Translation { partition } = &mut self.strategy {
            *partition = Some(WayPartition { gpa_ways });
        }
        self
    }
}

fn sets_for(name: &str, blocks: u64, associativity: usize) -> anyhow::Result<usize> {
    ensure!(associativity > 0, "{}: associativity must be > 0", name);
    let assoc = associativity as u64;
    ensure!(
        blocks >= assoc && blocks % assoc == 0,
        "{}: {} blocks cannot be split into sets of {} ways",
        name,
        blocks,
        associativity
    );
    Ok((blocks / assoc) as usize)
}

/// Set-associative array of blocks shared by caches and TLBs. The tag strategy
/// and optional way partition are the only differences between the kinds.
#[derive(Debug, Clone)]
pub struct CachingDevice {
    name: String,
    blocks: Vec<CachingDeviceBlock>,
    num_sets: usize,
    associativity: usize,
    block_size: u64,
    block_bits: u32,
    policy: ReplacementPolicy,
    strategy: TagStrategy,
    stats: Stats,
    parent: Option<DeviceId>,
    loaded: u64,
}

impl CachingDevice {
    pub fn new(params: DeviceParams) -> anyhow::Result<Self> {
        let DeviceParams {
            name,
            num_sets,
            associativity,
            block_size,
            policy,
            strategy,
        } = params;
        ensure!(num_sets > 0, "{}: number of sets must be > 0", name);
        ensure!(associativity > 0, "{}: associativity must be > 0", name);
        ensure!(
            num_sets.is_power_of_two(),
            "{}: number of sets {} is not a power of two",
            name,
            num_sets
        );
        ensure!(
            block_size.is_power_of_two() && block_size >= MIN_BLOCK_SIZE,
            "{}: block size {} must be a power of two >= {}",
            name,
            block_size,
            MIN_BLOCK_SIZE
        );
        if let TagStrategy::Translation {
            partition: Some(WayPartition { gpa_ways }),
        } = strategy
        {
            if gpa_ways > associativity {
                bail!(
                    "{}: static partition boundary {} exceeds associativity {}",
                    name,
                    gpa_ways,
                    associativity
                );
            }
        }

        Ok(Self {
            name,
            blocks: vec![CachingDeviceBlock::default(); num_sets * associativity],
            num_sets,
            associativity,
            block_size,
            block_bits: block_size.trailing_zeros(),
            policy,
            strategy,
            stats: Stats::default(),
            parent: None,
            loaded: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.policy
    }

    pub fn strategy(&self) -> TagStrategy {
        self.strategy
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn capacity(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Share of ways that have been filled at least once.
    pub fn loaded_fraction(&self) -> f64 {
        self.loaded as f64 / self.capacity() as f64
    }

    pub fn block(&self, set: usize, way: usize) -> &CachingDeviceBlock {
        &self.blocks[set * self.associativity + way]
    }

    /// Valid tags of a set in way order.
    pub fn resident_tags(&self, set: usize) -> Vec<u64> {
        self.set(set)
            .iter()
            .filter(|b| b.is_valid())
            .map(|b| b.tag)
            .collect()
    }

    fn set(&self, set: usize) -> &[CachingDeviceBlock] {
        let base = set * self.associativity;
        &self.blocks[base..base + self.associativity]
    }

    fn set_mut(&mut self, set: usize) -> &mut [CachingDeviceBlock] {
        let base = set * self.associativity;
        &mut self.blocks[base..base + self.associativity]
    }

    /// Tag and set index for `addr`. Panics on a request shape the device kind
    /// does not service.
    pub fn locate(&self, addr: u64, lookup: Lookup) -> (u64, usize) {
        let line = addr >> self.block_bits;
        let set = (line as usize) & (self.num_sets - 1);
        let tag = match (self.strategy, lookup) {
            (TagStrategy::Line, Lookup::Line) => line,
            (TagStrategy::Translation { .. }, Lookup::Translate(domain)) => match domain {
                Domain::GuestVirtual => line,
                Domain::GuestPhysical => line | DOMAIN_BIT,
            },
            (strategy, lookup) => panic!(
                "{} ({}) cannot service a {:?} request",
                self.name,
                strategy.kind_name(),
                lookup
            ),
        };
        (tag, set)
    }

    /// Ways eligible for `lookup`. May be empty under a static partition.
    pub fn way_range(&self, lookup: Lookup) -> Range<usize> {
        match (self.strategy, lookup) {
            (TagStrategy::Translation { partition: Some(p) }, Lookup::Translate(domain)) => match domain {
                Domain::GuestPhysical => 0..p.gpa_ways,
                Domain::GuestVirtual => p.gpa_ways..self.associativity,
            },
            _ => 0..self.associativity,
        }
    }

    fn owner_for(&self, pid: u32) -> Option<u32> {
        self.strategy.is_translation().then_some(pid)
    }

    fn probe(&self, set: usize, ways: Range<usize>, tag: u64, owner: Option<u32>) -> Option<usize> {
        let blocks = self.set(set);
        let mut found = None;
        for way in ways {
            if blocks[way].matches(tag, owner) {
                assert!(
                    found.is_none(),
                    "{}: duplicate tag {:#x} in set {}",
                    self.name,
                    tag,
                    set
                );
                found = Some(way);
            }
        }
        found
    }

    #[cfg(test)]
    pub(super) fn block_mut(&mut self, set: usize, way: usize) -> &mut CachingDeviceBlock {
        &mut self.blocks[set * self.associativity + way]
    }

    fn install(&mut self, set: usize, ways: Range<usize>, tag: u64, owner: Option<u32>) -> usize {
        let policy = self.policy;
        let blocks = self.set_mut(set);
        let way = policy.replace_which_way(blocks, ways.start, ways.end);
        let evicted = blocks[way].is_valid();
        blocks[way].tag = tag;
        blocks[way].owner_pid = owner;
        if !evicted {
            self.loaded += 1;
        }
        self.stats.record_install(evicted);
        way
    }

    fn touch(&mut self, set: usize, way: usize) {
        let policy = self.policy;
        policy.access_update(self.set_mut(set), way);
    }
}

/// Result of a request entering the hierarchy at some device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Access {
    /// Hit at the device the request entered.
    pub hit: bool,
    /// Whether a translation was eventually produced (by some level or the
    /// backing store). Always true for caches.
    pub resolved: bool,
    /// Local outcome of every level visited, entry device first.
    pub levels: PageWalkOutcome,
}

impl Access {
    /// Index of the level that hit, `None` if every visited level missed.
    pub fn hit_level(&self) -> Option<usize> {
        self.levels.iter().position(|&hit| hit)
    }
}

/// Owns every device. Parent links are `DeviceId`s into the arena; a parent is
/// always added before its children, so the links form a forest.
#[derive(Debug, Clone, Default)]
pub struct DeviceArena {
    devices: Vec<CachingDevice>,
}

impl DeviceArena {
    pub fn add(&mut self, mut device: CachingDevice, parent: Option<DeviceId>) -> anyhow::Result<DeviceId> {
        if let Some(parent) = parent {
            let Some(parent_dev) = self.devices.get(parent.0) else {
                bail!("{}: parent {} does not exist", device.name, parent);
            };
            ensure!(
                parent_dev.strategy.is_translation() == device.strategy.is_translation(),
                "{} ({}) cannot forward misses to {} ({})",
                device.name,
                device.strategy.kind_name(),
                parent_dev.name,
                parent_dev.strategy.kind_name()
            );
        }
        ensure!(
            self.find(&device.name).is_none(),
            "duplicate device name '{}'",
            device.name
        );
        info!(
            "{}: {} with {} sets x {} ways, {}B blocks, {} replacement, parent {}",
            device.name,
            device.strategy.kind_name(),
            device.num_sets,
            device.associativity,
            device.block_size,
            device.policy.name(),
            parent.map_or("none".to_string(), |p| self.devices[p.0].name.clone()),
        );
        device.parent = parent;
        self.devices.push(device);
        Ok(DeviceId(self.devices.len() - 1))
    }

    pub fn get(&self, id: DeviceId) -> &CachingDevice {
        &self.devices[id.0]
    }

    #[cfg(test)]
    pub(super) fn get_mut(&mut self, id: DeviceId) -> &mut CachingDevice {
        &mut self.devices[id.0]
    }

    pub fn find(&self, name: &str) -> Option<DeviceId> {
        self.devices.iter().position(|d| d.name == name).map(DeviceId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &CachingDevice)> + '_ {
        self.devices.iter().enumerate().map(|(i, d)| (DeviceId(i), d))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn reset_stats(&mut self) {
        self.devices.iter_mut().for_each(|d| d.stats.reset());
    }

    /// Look `reference` up starting at device `id`, forwarding misses upward.
    pub fn request(&mut self, id: DeviceId, reference: &MemoryReference, lookup: Lookup) -> Access {
        let mut levels = PageWalkOutcome::new();
        let resolved = self.request_level(id, reference, lookup, &mut levels);
        Access {
            hit: levels.first().copied().unwrap_or(false),
            resolved,
            levels,
        }
    }

    fn request_level(
        &mut self,
        id: DeviceId,
        reference: &MemoryReference,
        lookup: Lookup,
        levels: &mut PageWalkOutcome,
    ) -> bool {
        let device = &mut self.devices[id.0];
        let (tag, set) = device.locate(reference.addr, lookup);
        let owner = device.owner_for(reference.pid);
        let ways = device.way_range(lookup);
        let parent = device.parent;

        // partition leaves no ways for this domain: miss without touching any block
        if ways.is_empty() {
            device.stats.record_access(false);
            levels.push(false);
            debug!("{}: {} has no eligible ways", device.name, reference);
            return false;
        }

        if let Some(way) = device.probe(set, ways.clone(), tag, owner) {
            device.stats.record_access(true);
            device.touch(set, way);
            levels.push(true);
            if let Some(parent) = parent {
                self.devices[parent.0].stats.child_access(true);
            }
            return true;
        }

        device.stats.record_access(false);
        levels.push(false);
        debug!("{}: miss {} tag {:#x} set {}", device.name, reference, tag, set);
        let resolved = match parent {
            Some(parent) => {
                self.devices[parent.0].stats.child_access(false);
                self.request_level(parent, reference, lookup, levels)
            }
            // backing store
            None => true,
        };

        let device = &mut self.devices[id.0];
        let way = device.install(set, ways, tag, owner);
        device.touch(set, way);
        resolved
    }
}
