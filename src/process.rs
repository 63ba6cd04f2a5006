//! Per-process and per-thread state read from the /proc filesystem.
//!
//! `Task` covers what processes and threads have in common: an id and a
//! lazily-read `stat` record (parent pid, display name, niceness).
//! `Process` owns its secondary `Thread`s and adds the executable path,
//! OOM scores, ownership and the smaps memory summary.
//!
//! Every read is attempted at most once per instance and the outcome is
//! kept, so repeated accessor calls never hit the filesystem again —
//! except the OOM scores, which the kernel updates continuously and which
//! are therefore re-read on every call. Tasks vanish between readdir and
//! open all the time; that case is absorbed silently and the accessors
//! fall back to their documented defaults.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use tracing::{debug, warn};

use crate::procfs::{self, parse_kb_value};

/// Longest executable path we report; longer readlink results are cut off.
const EXE_MAX_BYTES: usize = 127;

/// Buffer size for scanning /proc/<pid>/smaps, which runs to hundreds of
/// kilobytes on large processes.
const SMAPS_BUF_CAP: usize = 512 * 1024;

/// Whitespace fields required after the comm field of a stat line; enough
/// to reach the niceness field.
const STAT_FIELDS_AFTER_COMM: usize = 17;

/// Load state of a record that is read at most once.
///
/// `Failed` is first-class: a read that was attempted and did not produce
/// data must never be retried, and is distinct from "not read yet".
#[derive(Debug)]
enum Lazy<T> {
    Pending,
    Ready(T),
    Failed,
}

/// The fields retained from a stat line.
#[derive(Debug)]
struct TaskStat {
    ppid: u32,
    name: String,
    nice: i64,
}

/// A schedulable kernel entity — process or thread — identified by an id
/// and a directory under /proc.
#[derive(Debug)]
pub struct Task {
    id: u32,
    proc_dir: PathBuf,
    stat: Lazy<TaskStat>,
}

impl Task {
    fn new(proc_dir: PathBuf, id: u32) -> Task {
        Task {
            id,
            proc_dir,
            stat: Lazy::Pending,
        }
    }

    pub fn task_id(&self) -> u32 {
        self.id
    }

    /// Parent pid, or `None` if the stat record could not be read.
    pub fn ppid(&mut self) -> Option<u32> {
        self.stat().map(|s| s.ppid)
    }

    /// Display name (the kernel comm field), empty if unavailable.
    pub fn name(&mut self) -> &str {
        match self.stat() {
            Some(s) => s.name.as_str(),
            None => "",
        }
    }

    /// Scheduling niceness; 0 if the stat record could not be read.
    pub fn nice(&mut self) -> i64 {
        self.stat().map(|s| s.nice).unwrap_or(0)
    }

    fn stat(&mut self) -> Option<&TaskStat> {
        if let Lazy::Pending = self.stat {
            self.stat = match self.read_stat() {
                Some(s) => Lazy::Ready(s),
                None => Lazy::Failed,
            };
        }
        match &self.stat {
            Lazy::Ready(s) => Some(s),
            _ => None,
        }
    }

    fn read_stat(&self) -> Option<TaskStat> {
        let path = self.proc_dir.join("stat");

        let line = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                // NotFound just means the task exited under us.
                if e.kind() != ErrorKind::NotFound {
                    warn!("Unable to read {}: {}", path.display(), e);
                }
                return None;
            }
        };

        match parse_stat_line(&line, self.id) {
            Ok(stat) => Some(stat),
            Err(e) => {
                warn!("Malformed {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Parse one stat line.
///
/// Format: `pid (comm) state ppid pgrp session tty_nr tpgid flags minflt
/// cminflt majflt cmajflt utime stime cutime cstime priority nice ...`
///
/// The comm field can contain spaces and parentheses, so the line cannot
/// be split on whitespace alone. It cannot contain a newline, which makes
/// the last `)` on the line its closing delimiter.
fn parse_stat_line(line: &str, expected_pid: u32) -> Result<TaskStat, String> {
    let open = line.find('(').ok_or("no '(' delimiting comm")?;
    let close = line.rfind(')').ok_or("no ')' delimiting comm")?;
    if close < open {
        return Err("')' precedes '('".to_string());
    }

    let pid: u32 = line[..open]
        .trim()
        .parse()
        .map_err(|_| format!("unparsable pid field {:?}", line[..open].trim()))?;
    if pid != expected_pid {
        return Err(format!("got pid {pid}, expected {expected_pid}"));
    }

    let name = line[open + 1..close].to_string();

    let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
    if fields.len() < STAT_FIELDS_AFTER_COMM {
        return Err(format!(
            "expected at least {} fields after comm, got {}",
            STAT_FIELDS_AFTER_COMM,
            fields.len()
        ));
    }

    // After comm: state(0) ppid(1) pgrp(2) session(3) tty_nr(4) tpgid(5)
    // flags(6) minflt(7) cminflt(8) majflt(9) cmajflt(10) utime(11)
    // stime(12) cutime(13) cstime(14) priority(15) nice(16)
    let ppid = fields[1]
        .parse()
        .map_err(|_| format!("unparsable ppid field {:?}", fields[1]))?;
    let nice = fields[16]
        .parse()
        .map_err(|_| format!("unparsable nice field {:?}", fields[16]))?;

    Ok(TaskStat { ppid, name, nice })
}

/// A secondary execution context of a process.
///
/// Constructed only by the owning [`Process`]; its stat record lives under
/// `<pid>/task/<tid>`.
#[derive(Debug)]
pub struct Thread {
    task: Task,
    tid: u32,
}

impl Thread {
    fn new(process_dir: &Path, tid: u32) -> Thread {
        let dir = process_dir.join("task").join(tid.to_string());
        Thread {
            task: Task::new(dir, tid),
            tid,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn task_id(&self) -> u32 {
        self.task.task_id()
    }

    pub fn ppid(&mut self) -> Option<u32> {
        self.task.ppid()
    }

    pub fn name(&mut self) -> &str {
        self.task.name()
    }

    pub fn nice(&mut self) -> i64 {
        self.task.nice()
    }
}

/// Summed region sizes from an smaps scan, in kilobytes.
#[derive(Debug, Clone, Copy, Default)]
struct MemSummary {
    vsize_kb: u64,
    rss_kb: u64,
    pss_kb: u64,
    uss_kb: u64,
}

/// One live process.
///
/// Not safe for shared use: the lazy accessors take `&mut self` and an
/// instance belongs to exactly one thread of control.
#[derive(Debug)]
pub struct Process {
    task: Task,
    pid: u32,
    threads: Option<Vec<Thread>>,
    exe: Option<String>,
    mem: Lazy<MemSummary>,
    user: Option<String>,
}

impl Process {
    pub fn new(pid: u32) -> Process {
        Process::with_proc_root(Path::new(procfs::PROC_ROOT), pid)
    }

    /// Build a process view rooted somewhere other than /proc. Used by
    /// tests and by hosts that mount procfs elsewhere.
    pub fn with_proc_root(root: &Path, pid: u32) -> Process {
        Process {
            task: Task::new(root.join(pid.to_string()), pid),
            pid,
            threads: None,
            exe: None,
            mem: Lazy::Pending,
            user: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn task_id(&self) -> u32 {
        self.task.task_id()
    }

    pub fn ppid(&mut self) -> Option<u32> {
        self.task.ppid()
    }

    pub fn name(&mut self) -> &str {
        self.task.name()
    }

    pub fn nice(&mut self) -> i64 {
        self.task.nice()
    }

    /// The process's secondary threads, listed once from `<pid>/task`.
    ///
    /// Directory order, not sorted. Empty — and permanently so — if the
    /// listing cannot be opened, which normally means the process exited.
    pub fn threads(&mut self) -> &mut [Thread] {
        if self.threads.is_none() {
            let found = self.list_threads();
            self.threads = Some(found);
        }
        self.threads.get_or_insert_with(Vec::new)
    }

    fn list_threads(&self) -> Vec<Thread> {
        let task_dir = self.task.proc_dir.join("task");
        let entries = match fs::read_dir(&task_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Unable to list {}: {}", task_dir.display(), e);
                return Vec::new();
            }
        };

        let mut threads = Vec::new();
        for entry in entries.flatten() {
            let tid = match entry
                .file_name()
                .to_str()
                .and_then(procfs::parse_decimal)
            {
                Some(tid) => tid,
                None => continue,
            };
            // On Linux the main thread is listed under task/ with the
            // process's own id; this Process already covers it.
            if tid != self.pid {
                threads.push(Thread::new(&self.task.proc_dir, tid));
            }
        }
        threads
    }

    /// Resolved executable path, capped at 127 bytes; empty if the link
    /// is gone or unreadable. Resolved once and kept.
    pub fn exe(&mut self) -> &str {
        if self.exe.is_none() {
            let resolved = match fs::read_link(self.task.proc_dir.join("exe")) {
                Ok(target) => {
                    procfs::truncate_utf8(target.to_string_lossy().into_owned(), EXE_MAX_BYTES)
                }
                // Gone, or a broken link; either way there is no path to report.
                Err(_) => String::new(),
            };
            self.exe = Some(resolved);
        }
        self.exe.as_deref().unwrap_or("")
    }

    /// Current OOM-killer badness score. Re-read on every call: the kernel
    /// updates it as memory use changes.
    pub fn oom_score(&self) -> Option<i32> {
        procfs::read_int_file(&self.task.proc_dir.join("oom_score"))
    }

    /// Userspace OOM score adjustment, re-read on every call.
    pub fn oom_score_adj(&self) -> Option<i32> {
        procfs::read_int_file(&self.task.proc_dir.join("oom_score_adj"))
    }

    /// Legacy OOM adjustment knob, re-read on every call.
    pub fn oom_adj(&self) -> Option<i32> {
        procfs::read_int_file(&self.task.proc_dir.join("oom_adj"))
    }

    /// Total mapped virtual size in kB, or `None` if smaps was unreadable.
    pub fn vsize_kb(&mut self) -> Option<u64> {
        self.mem().map(|m| m.vsize_kb)
    }

    /// Resident set size in kB, or `None` if smaps was unreadable.
    pub fn rss_kb(&mut self) -> Option<u64> {
        self.mem().map(|m| m.rss_kb)
    }

    /// Proportional set size in kB, or `None` if smaps was unreadable.
    pub fn pss_kb(&mut self) -> Option<u64> {
        self.mem().map(|m| m.pss_kb)
    }

    /// Unique set size in kB — private dirty plus private clean over all
    /// regions — or `None` if smaps was unreadable.
    pub fn uss_kb(&mut self) -> Option<u64> {
        self.mem().map(|m| m.uss_kb)
    }

    fn mem(&mut self) -> Option<&MemSummary> {
        if let Lazy::Pending = self.mem {
            self.mem = match self.scan_smaps() {
                Some(m) => Lazy::Ready(m),
                None => Lazy::Failed,
            };
        }
        match &self.mem {
            Lazy::Ready(m) => Some(m),
            _ => None,
        }
    }

    /// Walk smaps once, region by region, summing the counters we report.
    /// A process with zero regions legitimately sums to zero everywhere.
    fn scan_smaps(&self) -> Option<MemSummary> {
        let path = self.task.proc_dir.join("smaps");
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Unable to open {}: {}", path.display(), e);
                }
                return None;
            }
        };

        let mut sum = MemSummary::default();
        let reader = BufReader::with_capacity(SMAPS_BUF_CAP, file);
        for line in reader.lines() {
            let l = match line {
                Ok(l) => l,
                Err(e) => {
                    // Keep whatever was summed before the stream broke.
                    debug!("Read of {} cut short: {}", path.display(), e);
                    break;
                }
            };
            if let Some(v) = l.strip_prefix("Size:") {
                sum.vsize_kb += parse_kb_value(v).unwrap_or(0);
            } else if let Some(v) = l.strip_prefix("Rss:") {
                sum.rss_kb += parse_kb_value(v).unwrap_or(0);
            } else if let Some(v) = l.strip_prefix("Pss:") {
                sum.pss_kb += parse_kb_value(v).unwrap_or(0);
            } else if let Some(v) = l.strip_prefix("Private_Dirty:") {
                sum.uss_kb += parse_kb_value(v).unwrap_or(0);
            } else if let Some(v) = l.strip_prefix("Private_Clean:") {
                sum.uss_kb += parse_kb_value(v).unwrap_or(0);
            }
        }
        Some(sum)
    }

    /// Account name owning this process, from the ownership of its /proc
    /// directory. `"?"` when the directory cannot be inspected; that
    /// answer is not cached, so a later call gets another chance. A
    /// resolved name (or the bare uid, when no passwd entry exists) is
    /// cached.
    pub fn user(&mut self) -> String {
        if let Some(user) = &self.user {
            return user.clone();
        }

        let uid = match fs::metadata(&self.task.proc_dir) {
            Ok(meta) => meta.uid(),
            Err(_) => return "?".to_string(),
        };

        let name = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(entry)) => entry.name,
            _ => uid.to_string(),
        };
        self.user = Some(name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn proc_root() -> TempDir {
        TempDir::new().unwrap()
    }

    /// A stat line with a realistic field tail; `nice` lands at index 16
    /// after the comm field.
    fn stat_line(pid: u32, name: &str, ppid: u32, nice: i64) -> String {
        format!(
            "{pid} ({name}) S {ppid} 42 42 0 -1 4194304 1036 0 0 0 2 1 0 0 20 {nice} 1 0 12345 8192000 512\n"
        )
    }

    fn add_proc(root: &TempDir, pid: u32, stat: &str) -> PathBuf {
        let dir = root.path().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stat"), stat).unwrap();
        dir
    }

    #[test]
    fn stat_fields_come_back() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(42, "bash", 1, 5));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.pid(), 42);
        assert_eq!(p.task_id(), 42);
        assert_eq!(p.ppid(), Some(1));
        assert_eq!(p.name(), "bash");
        assert_eq!(p.nice(), 5);
    }

    #[test]
    fn stat_is_read_at_most_once() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(42, "bash", 1, 5));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.nice(), 5);

        // Rewrite the record; the first read must stick.
        fs::write(
            root.path().join("42").join("stat"),
            stat_line(42, "other", 9, 19),
        )
        .unwrap();
        assert_eq!(p.nice(), 5);
        assert_eq!(p.name(), "bash");
        assert_eq!(p.ppid(), Some(1));
    }

    #[test]
    fn stat_failure_is_not_retried() {
        let root = proc_root();
        let mut p = Process::with_proc_root(root.path(), 99);
        assert_eq!(p.ppid(), None);
        assert_eq!(p.name(), "");
        assert_eq!(p.nice(), 0);

        // The record showing up later must not revive the instance.
        add_proc(&root, 99, &stat_line(99, "late", 1, 3));
        assert_eq!(p.ppid(), None);
        assert_eq!(p.name(), "");
    }

    #[test]
    fn comm_with_embedded_parens() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(42, "weird)name)", 7, -4));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.name(), "weird)name)");
        assert_eq!(p.ppid(), Some(7));
        assert_eq!(p.nice(), -4);
    }

    #[test]
    fn comm_with_spaces() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(42, "Web Content", 1, 0));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.name(), "Web Content");
        assert_eq!(p.ppid(), Some(1));
    }

    #[test]
    fn malformed_stat_yields_defaults() {
        let root = proc_root();
        add_proc(&root, 42, "42 (bash) S 1\n");

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.ppid(), None);
        assert_eq!(p.name(), "");
        assert_eq!(p.nice(), 0);
    }

    #[test]
    fn stat_pid_mismatch_yields_defaults() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(43, "imposter", 1, 0));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.ppid(), None);
        assert_eq!(p.name(), "");
    }

    #[test]
    fn parse_stat_line_empty_comm() {
        let stat = parse_stat_line(&stat_line(7, "", 1, 0), 7).unwrap();
        assert_eq!(stat.name, "");
        assert_eq!(stat.ppid, 1);
    }

    #[test]
    fn parse_stat_line_rejects_junk() {
        assert!(parse_stat_line("", 1).is_err());
        assert!(parse_stat_line("1 no parens here", 1).is_err());
        assert!(parse_stat_line("x (a) S 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17", 1).is_err());
        // ppid not an integer
        assert!(parse_stat_line("1 (a) S x 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16", 1).is_err());
    }

    #[test]
    fn smaps_sums_across_regions() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));
        fs::write(
            dir.join("smaps"),
            "55e0a0000000-55e0a0019000 r-xp 00000000 08:01 131 /usr/bin/bash\n\
             Size:                100 kB\n\
             Rss:                  40 kB\n\
             Pss:                  10 kB\n\
             Shared_Clean:         30 kB\n\
             Shared_Dirty:          0 kB\n\
             Private_Dirty:         4 kB\n\
             Private_Clean:         2 kB\n\
             Swap:                  0 kB\n\
             VmFlags: rd ex mr mw me\n\
             7ffc90000000-7ffc90021000 rw-p 00000000 00:00 0 [stack]\n\
             Size:                 50 kB\n\
             Rss:                   0 kB\n",
        )
        .unwrap();

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.vsize_kb(), Some(150));
        assert_eq!(p.rss_kb(), Some(40));
        assert_eq!(p.pss_kb(), Some(10));
        assert_eq!(p.uss_kb(), Some(6));
    }

    #[test]
    fn absent_smaps_stays_unknown() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(42, "bash", 1, 0));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.vsize_kb(), None);
        assert_eq!(p.rss_kb(), None);
        assert_eq!(p.pss_kb(), None);
        assert_eq!(p.uss_kb(), None);
    }

    #[test]
    fn empty_smaps_sums_to_zero() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));
        fs::write(dir.join("smaps"), "").unwrap();

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.vsize_kb(), Some(0));
        assert_eq!(p.uss_kb(), Some(0));
    }

    #[test]
    fn threads_skip_main_thread_and_non_numeric_entries() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));
        for entry in ["42", "43", "44", "gc"] {
            fs::create_dir_all(dir.join("task").join(entry)).unwrap();
        }
        fs::write(
            dir.join("task").join("43").join("stat"),
            stat_line(43, "worker", 42, 2),
        )
        .unwrap();

        let mut p = Process::with_proc_root(root.path(), 42);
        let mut tids: Vec<u32> = p.threads().iter().map(Thread::tid).collect();
        tids.sort_unstable();
        assert_eq!(tids, vec![43, 44]);

        let t = p.threads().iter_mut().find(|t| t.tid() == 43).unwrap();
        assert_eq!(t.task_id(), 43);
        assert_eq!(t.name(), "worker");
        assert_eq!(t.ppid(), Some(42));
        assert_eq!(t.nice(), 2);
    }

    #[test]
    fn thread_listing_is_cached() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));
        fs::create_dir_all(dir.join("task").join("43")).unwrap();

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.threads().len(), 1);

        fs::create_dir_all(dir.join("task").join("44")).unwrap();
        assert_eq!(p.threads().len(), 1);
    }

    #[test]
    fn unreadable_thread_listing_is_empty_for_good() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert!(p.threads().is_empty());

        fs::create_dir_all(dir.join("task").join("43")).unwrap();
        assert!(p.threads().is_empty());
    }

    #[test]
    fn exe_resolves_and_caches() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));
        symlink("/usr/bin/bash", dir.join("exe")).unwrap();

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.exe(), "/usr/bin/bash");

        fs::remove_file(dir.join("exe")).unwrap();
        assert_eq!(p.exe(), "/usr/bin/bash");
    }

    #[test]
    fn missing_exe_is_empty() {
        let root = proc_root();
        add_proc(&root, 42, &stat_line(42, "bash", 1, 0));

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.exe(), "");
    }

    #[test]
    fn overlong_exe_is_truncated() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));
        let target = format!("/opt/{}", "x".repeat(200));
        symlink(&target, dir.join("exe")).unwrap();

        let mut p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.exe().len(), 127);
        assert!(target.starts_with(p.exe()));
    }

    #[test]
    fn oom_scores_are_read_fresh_every_call() {
        let root = proc_root();
        let dir = add_proc(&root, 42, &stat_line(42, "bash", 1, 0));

        let p = Process::with_proc_root(root.path(), 42);
        assert_eq!(p.oom_score(), None);

        fs::write(dir.join("oom_score"), "100\n").unwrap();
        assert_eq!(p.oom_score(), Some(100));

        fs::write(dir.join("oom_score"), "250\n").unwrap();
        assert_eq!(p.oom_score(), Some(250));

        fs::write(dir.join("oom_score_adj"), "-17\n").unwrap();
        assert_eq!(p.oom_score_adj(), Some(-17));

        fs::write(dir.join("oom_adj"), "junk").unwrap();
        assert_eq!(p.oom_adj(), None);
    }

    #[test]
    fn user_retries_after_unknown_then_caches() {
        let root = proc_root();
        let mut p = Process::with_proc_root(root.path(), 77);

        // Directory missing: sentinel, and another attempt next call.
        assert_eq!(p.user(), "?");

        let dir = add_proc(&root, 77, &stat_line(77, "bash", 1, 0));
        let uid = fs::metadata(&dir).unwrap().uid();
        let expected = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(entry)) => entry.name,
            _ => uid.to_string(),
        };
        assert_eq!(p.user(), expected);

        // Fixture gone; the cached answer must survive.
        drop(root);
        assert_eq!(p.user(), expected);
    }
}
