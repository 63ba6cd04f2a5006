//! Process and thread state read from the /proc filesystem.
//!
//! The entry point is [`process::Process`]: build one per pid (ids come
//! from [`procfs::process_ids`]), then query identity, ancestry, threads,
//! executable path, OOM scores, ownership and the RSS/PSS/USS memory
//! summary through its accessors. Reads are lazy, happen at most once per
//! instance, and absorb the usual procfs races — a process that exits
//! mid-query yields sentinel values, never an error.

pub mod process;
pub mod procfs;
pub mod system;
