use serde::Serialize;
use std::ops::AddAssign;

/// Hit/miss counters of a single device.
///
/// `hits`/`misses` are lookups serviced by the device itself; `child_hits`/
/// `child_misses` count outcomes at child devices that report to this one, so
/// local and forwarded traffic can be told apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    hits: u64,
    misses: u64,
    child_hits: u64,
    child_misses: u64,
    installs: u64,
    evictions: u64,
}

impl Stats {
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn child_hits(&self) -> u64 {
        self.child_hits
    }

    pub fn child_misses(&self) -> u64 {
        self.child_misses
    }

    pub fn installs(&self) -> u64 {
        self.installs
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn accesses(&self) -> u64 {
        self.hits.saturating_add(self.misses)
    }

    pub fn miss_rate(&self) -> f64 {
        match self.accesses() {
            0 => 0.0,
            total => self.misses as f64 / total as f64,
        }
    }

    pub fn record_access(&mut self, hit: bool) {
        if hit {
            self.hits = self.hits.saturating_add(1);
        } else {
            self.misses = self.misses.saturating_add(1);
        }
    }

    /// Outcome of a lookup at a child of this device.
    pub fn child_access(&mut self, hit: bool) {
        if hit {
            self.child_hits = self.child_hits.saturating_add(1);
        } else {
            self.child_misses = self.child_misses.saturating_add(1);
        }
    }

    pub fn record_install(&mut self, evicted: bool) {
        self.installs = self.installs.saturating_add(1);
        if evicted {
            self.evictions = self.evictions.saturating_add(1);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl AddAssign<&Stats> for Stats {
    fn add_assign(&mut self, other: &Stats) {
        self.hits = self.hits.saturating_add(other.hits);
        self.misses = self.misses.saturating_add(other.misses);
        self.child_hits = self.child_hits.saturating_add(other.child_hits);
        self.child_misses = self.child_misses.saturating_add(other.child_misses);
        self.installs = self.installs.saturating_add(other.installs);
        self.evictions = self.evictions.saturating_add(other.evictions);
    }
}
