//! System-wide memory totals from /proc/meminfo.
//!
//! Only feeds the report header; the per-process numbers come from
//! `process`.

use std::fs;
use std::path::Path;

/// System memory totals in kilobytes, as /proc/meminfo reports them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

/// Reads memory totals from `<root>/meminfo`.
pub fn read_memory(root: &Path) -> Result<SystemMemory, String> {
    let path = root.join("meminfo");
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_meminfo(&content)
}

/// Parses meminfo content. Lines look like `MemTotal:       16384000 kB`;
/// fields we don't report are skipped. MemTotal is the only field a
/// usable meminfo cannot lack.
fn parse_meminfo(content: &str) -> Result<SystemMemory, String> {
    let mut mem = SystemMemory::default();
    let mut saw_total = false;

    for line in content.lines() {
        let (slot, rest) = if let Some(v) = line.strip_prefix("MemTotal:") {
            saw_total = true;
            (&mut mem.total_kb, v)
        } else if let Some(v) = line.strip_prefix("MemFree:") {
            (&mut mem.free_kb, v)
        } else if let Some(v) = line.strip_prefix("MemAvailable:") {
            (&mut mem.available_kb, v)
        } else if let Some(v) = line.strip_prefix("SwapTotal:") {
            (&mut mem.swap_total_kb, v)
        } else if let Some(v) = line.strip_prefix("SwapFree:") {
            (&mut mem.swap_free_kb, v)
        } else {
            continue;
        };

        *slot = rest
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| format!("Unparsable meminfo line: {line:?}"))?;
    }

    if !saw_total {
        return Err("No MemTotal line in meminfo".to_string());
    }
    Ok(mem)
}
