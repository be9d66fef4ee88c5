use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .with_context(|| format!("cannot deserialize {}", std::any::type_name::<Self>())),
            None => {
                warn!("config section for {} not found", std::any::type_name::<Self>());
                Ok(Self::default())
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub trace: Option<PathBuf>,
    pub page_table: Option<PathBuf>,
    pub warmup_refs: u64,
    pub warmup_fraction: f64,
    pub sim_refs: u64,
    pub results_json: Option<PathBuf>,
    pub log_level: u64,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            trace: None,
            page_table: None,
            warmup_refs: 0,
            warmup_fraction: 0.0,
            sim_refs: u64::MAX,
            results_json: None,
            log_level: 0,
        }
    }
}

/// Fixed two-level topology: private L1 I/D per core, optional private L2,
/// shared last-level cache.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheKnobs {
    pub num_cores: usize,
    pub line_size: u64,
    pub l1i_size: u64,
    pub l1i_assoc: usize,
    pub l1d_size: u64,
    pub l1d_assoc: usize,
    pub l2_size: u64,
    pub l2_assoc: usize,
    pub llc_size: u64,
    pub llc_assoc: usize,
    pub replace_policy: Option<String>,
}

impl Config for CacheKnobs {}

impl Default for CacheKnobs {
    fn default() -> Self {
        Self {
            num_cores: 4,
            line_size: 64,
            l1i_size: 32 << 10,
            l1i_assoc: 8,
            l1d_size: 32 << 10,
            l1d_assoc: 8,
            l2_size: 0,
            l2_assoc: 8,
            llc_size: 8 << 20,
            llc_assoc: 16,
            replace_policy: None,
        }
    }
}

/// Per-core first-level TLB and an optional shared second level.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TlbKnobs {
    pub enabled: bool,
    pub page_size: u64,
    pub l1_entries: u64,
    pub l1_assoc: usize,
    pub l2_entries: u64,
    pub l2_assoc: usize,
    pub static_partition: bool,
    pub l1_gpa_ways: usize,
    pub l2_gpa_ways: usize,
    pub replace_policy: Option<String>,
}

impl Config for TlbKnobs {}

impl Default for TlbKnobs {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: 4096,
            l1_entries: 64,
            l1_assoc: 4,
            l2_entries: 1536,
            l2_assoc: 12,
            static_partition: false,
            l1_gpa_ways: 2,
            l2_gpa_ways: 6,
            replace_policy: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cache,
    Tlb,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Instruction,
    Data,
    #[default]
    Unified,
}

/// One device of an arbitrary hierarchy description.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub role: DeviceRole,
    /// Marks the device as the first level of this core.
    pub core: Option<usize>,
    /// Bytes for caches, entries for TLBs.
    pub size: u64,
    pub assoc: usize,
    /// Line size for caches, page size for TLBs.
    pub block_size: u64,
    pub parent: Option<String>,
    pub replace_policy: Option<String>,
    pub gpa_ways: Option<usize>,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: DeviceKind::Cache,
            role: DeviceRole::Unified,
            core: None,
            size: 0,
            assoc: 1,
            block_size: 64,
            parent: None,
            replace_policy: None,
            gpa_ways: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HierarchyConfig {
    pub devices: Vec<DeviceSpec>,
}

impl Config for HierarchyConfig {}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Strided,
    Random,
    Hot,
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "strided" => Ok(Self::Strided),
            "random" => Ok(Self::Random),
            "hot" => Ok(Self::Hot),
            _ => Err(format!(
                "unsupported synthetic pattern '{}', expected one of: strided, random, hot",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyntheticConfig {
    pub pattern: PatternKind,
    pub refs: u64,
    pub seed: u64,
    pub num_cores: usize,
    pub num_pids: u32,
    pub base: u64,
    pub footprint: u64,
    pub stride: u64,
    /// Share of accesses going to the hot eighth of the footprint (`hot` pattern).
    pub hot_ratio: f64,
    /// Emit a translation reference before every `translate_every`th access; 0 disables.
    pub translate_every: u32,
}

impl Config for SyntheticConfig {}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            pattern: PatternKind::Strided,
            refs: 100_000,
            seed: 0,
            num_cores: 1,
            num_pids: 1,
            base: 0x1000_0000,
            footprint: 1 << 20,
            stride: 64,
            hot_ratio: 0.9,
            translate_every: 4,
        }
    }
}
