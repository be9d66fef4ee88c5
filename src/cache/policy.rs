use anyhow::anyhow;
use phf::phf_map;
use serde::Serialize;

use super::block::CachingDeviceBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ReplacementPolicy {
    #[default]
    Lru,
    TrueLru,
    Lfu,
    Fifo,
}

static POLICY_NAMES: phf::Map<&'static str, ReplacementPolicy> = phf_map! {
    "lru" => ReplacementPolicy::Lru,
    "true_lru" => ReplacementPolicy::TrueLru,
    "lfu" => ReplacementPolicy::Lfu,
    "fifo" => ReplacementPolicy::Fifo,
};

impl ReplacementPolicy {
    /// Resolve a policy identifier. A missing identifier selects LRU; an
    /// unrecognized one is an error.
    pub fn from_name(name: Option<&str>) -> anyhow::Result<Self> {
        let Some(name) = name else {
            return Ok(Self::default());
        };
        POLICY_NAMES
            .get(name.trim().to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| {
                anyhow!(
                    "unknown replacement policy '{}', expected one of: LRU, TRUE_LRU, LFU, FIFO",
                    name
                )
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lru => "LRU",
            Self::TrueLru => "TRUE_LRU",
            Self::Lfu => "LFU",
            Self::Fifo => "FIFO",
        }
    }

    /// Update replacement metadata after `way` was hit or filled.
    ///
    /// LRU: counter 0 is the most recent block. Every other block (empty ways
    /// included) whose counter is not above the accessed one ages by one, then
    /// the accessed block drops to 0.
    ///
    /// TRUE_LRU ages only valid blocks, so valid counters within a set stay
    /// distinct and below the associativity.
    pub fn access_update(self, set: &mut [CachingDeviceBlock], way: usize) {
        match self {
            Self::Lru | Self::TrueLru => {
                let cnt = set[way].counter;
                // repeated access to the most recent block
                if cnt == 0 {
                    return;
                }
                let valid_only = self == Self::TrueLru;
                for (idx, block) in set.iter_mut().enumerate() {
                    if idx != way && (!valid_only || block.is_valid()) && block.counter <= cnt {
                        block.counter = block.counter.saturating_add(1);
                    }
                }
                set[way].counter = 0;
            }
            Self::Lfu => set[way].counter = set[way].counter.saturating_add(1),
            Self::Fifo => {}
        }
    }

    /// Pick the way to fill within `start..end`. Empty ways are taken first.
    ///
    /// The chosen way's counter is preset for the `access_update` that follows
    /// the install: LRU presets 1 so the update is never the most-recent fast
    /// path; TRUE_LRU presets the associativity so every valid sibling ages.
    pub fn replace_which_way(self, set: &mut [CachingDeviceBlock], start: usize, end: usize) -> usize {
        assert!(
            start < end && end <= set.len(),
            "eligible way range {}..{} is invalid for a {}-way set",
            start,
            end,
            set.len()
        );

        let victim = match set[start..end].iter().position(|block| !block.is_valid()) {
            Some(offset) => start + offset,
            // ties go to the lowest way
            None => (start..end).fold(start, |best, way| {
                let better = match self {
                    Self::Lru | Self::TrueLru | Self::Fifo => set[way].counter > set[best].counter,
                    Self::Lfu => set[way].counter < set[best].counter,
                };
                if better {
                    way
                } else {
                    best
                }
            }),
        };

        match self {
            Self::Lru => set[victim].counter = 1,
            Self::TrueLru => set[victim].counter = set.len() as u32,
            Self::Lfu => set[victim].counter = 0,
            Self::Fifo => {
                for way in start..end {
                    if way != victim && set[way].is_valid() {
                        set[way].counter = set[way].counter.saturating_add(1);
                    }
                }
                set[victim].counter = 0;
            }
        }
        victim
    }
}
