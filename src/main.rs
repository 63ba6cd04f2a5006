// procpeek - one-shot report of per-process memory use read from /proc
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Level};

use procpeek::process::Process;
use procpeek::{procfs, system};

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "procpeek",
    about = "Snapshot of per-process and per-thread memory use (RSS/PSS/USS) read from /proc",
    version = "0.1.0"
)]
struct Args {
    /// Report a single process instead of the full table
    #[arg(long)]
    pid: Option<u32>,

    /// Also list each process's secondary threads
    #[arg(short = 't', long)]
    threads: bool,

    /// Procfs mount point
    #[arg(long)]
    proc_root: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Config file (YAML/JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    show_config: bool,
}

/// On-disk configuration; every field optional so files can stay partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    proc_root: Option<PathBuf>,
    show_threads: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proc_root: Some(PathBuf::from(procfs::PROC_ROOT)),
            show_threads: Some(false),
        }
    }
}

/// Configuration loading with YAML and JSON support
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            // Try default locations
            let defaults = [
                "/etc/procpeek/procpeek.yaml",
                "/etc/procpeek/procpeek.yml",
                "/etc/procpeek/procpeek.json",
                "./procpeek.yaml",
                "./procpeek.yml",
                "./procpeek.json",
            ];
            match defaults.iter().find(|p| Path::new(p).exists()) {
                Some(p) => PathBuf::from(p),
                None => return Ok(Config::default()),
            }
        }
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;

    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON config {}", path.display()))?,
        // Default to YAML
        _ => serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML config {}", path.display()))?,
    };
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Merge CLI flags over the file config (CLI wins).
fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(root) = &args.proc_root {
        config.proc_root = Some(root.clone());
    }
    if args.threads {
        config.show_threads = Some(true);
    }

    Ok(config)
}

/// Initializes tracing logging on stderr with the configured level
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR, // Off not fully supported, use ERROR as minimal
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// One process line of the report, with its thread lines when requested.
struct Row {
    pid: u32,
    ppid: Option<u32>,
    user: String,
    nice: i64,
    nthreads: usize,
    vsize_kb: Option<u64>,
    rss_kb: Option<u64>,
    pss_kb: Option<u64>,
    uss_kb: Option<u64>,
    oom_score: Option<i32>,
    name: String,
    exe: String,
    threads: Vec<ThreadRow>,
}

struct ThreadRow {
    tid: u32,
    name: String,
    nice: i64,
}

/// Read everything the report needs from one process. `None` when the
/// process exited between the directory listing and our reads.
fn collect_row(root: &Path, pid: u32, with_threads: bool) -> Option<Row> {
    let mut p = Process::with_proc_root(root, pid);

    let name = p.name().to_string();
    let rss_kb = p.rss_kb();
    if name.is_empty() && rss_kb.is_none() {
        debug!("Skipping pid {}: gone before it could be read", pid);
        return None;
    }

    let threads = if with_threads {
        p.threads()
            .iter_mut()
            .map(|t| ThreadRow {
                tid: t.tid(),
                name: t.name().to_string(),
                nice: t.nice(),
            })
            .collect()
    } else {
        Vec::new()
    };

    Some(Row {
        pid,
        ppid: p.ppid(),
        user: p.user(),
        nice: p.nice(),
        nthreads: p.threads().len() + 1,
        vsize_kb: p.vsize_kb(),
        rss_kb,
        pss_kb: p.pss_kb(),
        uss_kb: p.uss_kb(),
        oom_score: p.oom_score(),
        exe: p.exe().to_string(),
        name,
        threads,
    })
}

fn fmt_u64(v: Option<u64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_u32(v: Option<u32>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_i32(v: Option<i32>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_system_header(root: &Path) {
    match system::read_memory(root) {
        Ok(mem) => {
            println!(
                "mem total {} kB, free {} kB, available {} kB; swap total {} kB, free {} kB",
                mem.total_kb, mem.free_kb, mem.available_kb, mem.swap_total_kb, mem.swap_free_kb
            );
            println!();
        }
        Err(e) => warn!("No system memory header: {}", e),
    }
}

fn print_report(rows: &[Row], with_threads: bool) {
    println!(
        "{:>7} {:>7} {:<12} {:>5} {:>5} {:>10} {:>9} {:>9} {:>9} {:>5}  {:<16} {}",
        "PID", "PPID", "USER", "NICE", "THR", "VSIZE", "RSS", "PSS", "USS", "OOM", "NAME", "EXE"
    );
    for row in rows {
        println!(
            "{:>7} {:>7} {:<12} {:>5} {:>5} {:>10} {:>9} {:>9} {:>9} {:>5}  {:<16} {}",
            row.pid,
            fmt_u32(row.ppid),
            row.user,
            row.nice,
            row.nthreads,
            fmt_u64(row.vsize_kb),
            fmt_u64(row.rss_kb),
            fmt_u64(row.pss_kb),
            fmt_u64(row.uss_kb),
            fmt_i32(row.oom_score),
            row.name,
            row.exe,
        );
        if with_threads {
            for t in &row.threads {
                println!(
                    "{:>7} {:>7} {:<12} {:>5} {:>5} {:>10} {:>9} {:>9} {:>9} {:>5}  - {}",
                    t.tid, "", "", t.nice, "", "", "", "", "", "", t.name
                );
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args);

    let config = resolve_config(&args)?;
    if args.show_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let root = config
        .proc_root
        .clone()
        .unwrap_or_else(|| PathBuf::from(procfs::PROC_ROOT));
    let with_threads = args.threads || config.show_threads.unwrap_or(false);

    print_system_header(&root);

    let pids: Vec<u32> = match args.pid {
        Some(pid) => vec![pid],
        None => procfs::process_ids(&root)
            .with_context(|| format!("Cannot list processes under {}", root.display()))?
            .collect(),
    };

    // One Process instance per rayon task; instances are never shared.
    let mut rows: Vec<Row> = pids
        .par_iter()
        .filter_map(|&pid| collect_row(&root, pid, with_threads))
        .collect();
    rows.sort_unstable_by_key(|r| r.pid);

    print_report(&rows, with_threads);
    info!("Reported {} processes", rows.len());
    Ok(())
}
