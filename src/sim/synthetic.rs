use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::base::{AccessKind, MemoryReference};
use crate::sim::config::{PatternKind, SyntheticConfig};

const ACCESS_ALIGN: u64 = 8;

/// Seeded reference generator used when no trace file is available.
///
/// Cores are visited round-robin. With `translate_every > 0`, every
/// `translate_every`th access of a core is preceded by a translation of the
/// same address, alternating guest-virtual and guest-physical domains.
pub struct SyntheticTrace {
    config: SyntheticConfig,
    rng: StdRng,
    emitted: u64,
    accesses: u64,
    translations: u64,
    pending: Option<MemoryReference>,
}

impl SyntheticTrace {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            emitted: 0,
            accesses: 0,
            translations: 0,
            pending: None,
        }
    }

    fn offset(&mut self, idx: u64) -> u64 {
        let footprint = self.config.footprint.max(ACCESS_ALIGN);
        let raw = match self.config.pattern {
            PatternKind::Strided => idx.wrapping_mul(self.config.stride.max(1)) % footprint,
            PatternKind::Random => self.rng.gen_range(0..footprint),
            PatternKind::Hot => {
                let hot_span = (footprint / 8).max(ACCESS_ALIGN);
                if self.rng.gen_bool(self.config.hot_ratio.clamp(0.0, 1.0)) {
                    self.rng.gen_range(0..hot_span)
                } else {
                    self.rng.gen_range(0..footprint)
                }
            }
        };
        raw & !(ACCESS_ALIGN - 1)
    }

    fn next_access(&mut self) -> MemoryReference {
        let idx = self.accesses;
        self.accesses += 1;
        let cores = self.config.num_cores.max(1) as u64;
        let core_id = (idx % cores) as usize;
        let pid = self.rng.gen_range(0..self.config.num_pids.max(1));
        let addr = self.config.base.wrapping_add(self.offset(idx / cores));
        let roll: f64 = self.rng.gen();
        let kind = if roll < 0.7 {
            AccessKind::Load
        } else if roll < 0.9 {
            AccessKind::Store
        } else {
            AccessKind::Instruction
        };
        MemoryReference::new(kind, core_id, pid, addr)
    }
}

impl Iterator for SyntheticTrace {
    type Item = MemoryReference;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted >= self.config.refs {
            return None;
        }
        self.emitted += 1;
        if let Some(access) = self.pending.take() {
            return Some(access);
        }

        let access = self.next_access();
        let every = self.config.translate_every as u64;
        if every == 0 || (self.accesses - 1) % every != 0 {
            return Some(access);
        }
        let kind = if self.translations % 2 == 0 {
            AccessKind::TranslateGva
        } else {
            AccessKind::TranslateGpa
        };
        self.translations += 1;
        self.pending = Some(access);
        Some(MemoryReference { kind, ..access })
    }
}
