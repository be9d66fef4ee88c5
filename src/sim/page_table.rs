use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, ensure, Context};
use log::info;

use super::trace::parse_hex;

pub const WALK_LEVELS: usize = 4;

/// One translation from a page-table dump: the virtual address, the address of
/// the entry read at each of the four walk levels, and the final physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub va: u64,
    pub entries: [u64; WALK_LEVELS],
    pub pa: u64,
}

/// Page-table ground truth keyed by virtual page number.
#[derive(Debug, Clone)]
pub struct PageTable {
    page_bits: u32,
    pages: HashMap<u64, PageTableEntry>,
}

impl PageTable {
    pub fn new(page_size: u64) -> anyhow::Result<Self> {
        ensure!(
            page_size.is_power_of_two(),
            "page size {} is not a power of two",
            page_size
        );
        Ok(Self {
            page_bits: page_size.trailing_zeros(),
            pages: HashMap::new(),
        })
    }

    pub fn load(path: &Path, page_size: u64) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open page table dump {}", path.display()))?;
        let table = Self::parse(BufReader::new(file), page_size)
            .with_context(|| format!("in page table dump {}", path.display()))?;
        info!("loaded {} translations from {}", table.len(), path.display());
        Ok(table)
    }

    /// Parse `va pe1 pe2 pe3 pe4 pa` lines (hex). Blank lines and `#` comments are skipped.
    pub fn parse<R: BufRead>(reader: R, page_size: u64) -> anyhow::Result<Self> {
        let mut table = Self::new(page_size)?;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let content = line.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let fields = content
                .split_whitespace()
                .map(parse_hex)
                .collect::<anyhow::Result<Vec<u64>>>()
                .with_context(|| format!("line {}", idx + 1))?;
            if fields.len() != WALK_LEVELS + 2 {
                bail!(
                    "line {}: expected 'va pe1 pe2 pe3 pe4 pa', found {} fields",
                    idx + 1,
                    fields.len()
                );
            }
            table.insert(PageTableEntry {
                va: fields[0],
                entries: [fields[1], fields[2], fields[3], fields[4]],
                pa: fields[5],
            });
        }
        Ok(table)
    }

    pub fn insert(&mut self, entry: PageTableEntry) {
        self.pages.insert(entry.va >> self.page_bits, entry);
    }

    pub fn lookup(&self, va: u64) -> Option<&PageTableEntry> {
        self.pages.get(&(va >> self.page_bits))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
