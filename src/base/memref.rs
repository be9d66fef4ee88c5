use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Address space a translation request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    GuestVirtual,
    GuestPhysical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Load,
    Store,
    Instruction,
    TranslateGva,
    TranslateGpa,
}

impl AccessKind {
    pub fn is_data(self) -> bool {
        matches!(self, Self::Load | Self::Store)
    }

    pub fn is_instruction(self) -> bool {
        matches!(self, Self::Instruction)
    }

    pub fn is_translation(self) -> bool {
        matches!(self, Self::TranslateGva | Self::TranslateGpa)
    }

    /// Translation domain for `TranslateGva`/`TranslateGpa`, `None` for plain memory accesses.
    pub fn domain(self) -> Option<Domain> {
        match self {
            Self::TranslateGva => Some(Domain::GuestVirtual),
            Self::TranslateGpa => Some(Domain::GuestPhysical),
            _ => None,
        }
    }

    fn short(self) -> &'static str {
        match self {
            Self::Load => "r",
            Self::Store => "w",
            Self::Instruction => "i",
            Self::TranslateGva => "gva",
            Self::TranslateGpa => "gpa",
        }
    }
}

impl FromStr for AccessKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "r" | "load" => Ok(Self::Load),
            "w" | "store" => Ok(Self::Store),
            "i" | "ifetch" | "instr" => Ok(Self::Instruction),
            "gva" => Ok(Self::TranslateGva),
            "gpa" => Ok(Self::TranslateGpa),
            _ => Err(format!(
                "unsupported access kind '{}', expected one of: r, w, i, gva, gpa",
                value
            )),
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// One entry of the reference stream. Produced by a trace source, read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReference {
    pub addr: u64,
    pub size: u32,
    pub pid: u32,
    pub core_id: usize,
    pub kind: AccessKind,
}

impl MemoryReference {
    pub const DEFAULT_SIZE: u32 = 8;

    pub fn new(kind: AccessKind, core_id: usize, pid: u32, addr: u64) -> Self {
        Self {
            addr,
            size: Self::DEFAULT_SIZE,
            pid,
            core_id,
            kind,
        }
    }

    pub fn load(core_id: usize, addr: u64) -> Self {
        Self::new(AccessKind::Load, core_id, 0, addr)
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }
}

impl fmt::Display for MemoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "core{} pid{} {} {:#x}+{}",
            self.core_id, self.pid, self.kind, self.addr, self.size
        )
    }
}
