//! Entry points into the /proc filesystem and small parsing helpers
//! shared by the process reader.

use std::fs;
use std::io;
use std::path::Path;

/// Default procfs mount point.
pub const PROC_ROOT: &str = "/proc";

/// Live process ids: the strictly-numeric entries under `root`.
///
/// The listing is lazy and reflects the kernel's process table as each
/// entry is yielded. Nothing is cached; a fresh call re-walks the
/// directory, and the set can change between calls.
pub fn process_ids(root: &Path) -> io::Result<impl Iterator<Item = u32>> {
    let entries = fs::read_dir(root)?;
    Ok(entries.flatten().filter_map(|entry| {
        entry
            .file_name()
            .to_str()
            .and_then(parse_decimal)
    }))
}

/// Strict decimal parse for directory entry names. Rejects signs,
/// whitespace and trailing junk, all of which `str::parse` would accept
/// or mis-handle for names like `+12`.
pub fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Value of a `Key:   <n> kB` line remainder: the first token, as kB.
pub fn parse_kb_value(v: &str) -> Option<u64> {
    v.split_whitespace().next()?.parse().ok()
}

/// Read a file holding a single integer as decimal text.
pub fn read_int_file(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Cap `s` at `max` bytes without splitting a UTF-8 sequence.
pub fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
