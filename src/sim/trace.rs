use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use anyhow::{anyhow, bail, Context};

use crate::base::{AccessKind, MemoryReference};

/// Reads references from a text trace, one per line:
///
/// ```text
/// # core pid kind addr [size]
/// 0 1 r 0x7ffd1000 8
/// 0 1 gva 7ffd1000
/// ```
///
/// Blank lines and `#` comments are skipped.
pub struct TraceReader<R: BufRead> {
    lines: Lines<R>,
    line_no: usize,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open trace {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = anyhow::Result<MemoryReference>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(anyhow!(err).context(format!("trace line {}", self.line_no)))),
            };
            match parse_line(&line) {
                Ok(Some(reference)) => return Some(Ok(reference)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err.context(format!("trace line {}", self.line_no)))),
            }
        }
    }
}

pub(crate) fn parse_hex(token: &str) -> anyhow::Result<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex value '{}'", token))
}

fn parse_line(line: &str) -> anyhow::Result<Option<MemoryReference>> {
    let content = line.split('#').next().unwrap_or("").trim();
    if content.is_empty() {
        return Ok(None);
    }
    let fields: Vec<&str> = content.split_whitespace().collect();
    if !(4..=5).contains(&fields.len()) {
        bail!("expected 'core pid kind addr [size]', found {} fields", fields.len());
    }
    let core_id = fields[0]
        .parse::<usize>()
        .with_context(|| format!("invalid core id '{}'", fields[0]))?;
    let pid = fields[1]
        .parse::<u32>()
        .with_context(|| format!("invalid pid '{}'", fields[1]))?;
    let kind = fields[2].parse::<AccessKind>().map_err(|e| anyhow!(e))?;
    let addr = parse_hex(fields[3])?;
    let size = match fields.get(4) {
        Some(size) => size
            .parse::<u32>()
            .with_context(|| format!("invalid size '{}'", size))?,
        None => MemoryReference::DEFAULT_SIZE,
    };
    Ok(Some(MemoryReference::new(kind, core_id, pid, addr).with_size(size)))
}
