use std::collections::HashMap;
use std::io;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use super::ExitStatus;

/// What `wait4` told us about a finished root process
///
/// `ru_maxrss` is not kept: after `fork` and `exec` it still carries the
/// high-water mark of the forked server image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub status: ExitStatus,
    /// User plus system time, including every descendant the root reaped
    pub cpu_time: Duration,
}

/// Memory held below the root at one instant, in bytes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeUsage {
    pub rss: u64,
    /// Private writable mappings, as `RLIMIT_DATA` accounts them
    pub data: u64,
    /// Largest resident high-water mark of any single process since its exec
    pub hwm: u64,
}

impl TreeUsage {
    pub fn max(self, other: TreeUsage) -> TreeUsage {
        TreeUsage {
            rss: self.rss.max(other.rss),
            data: self.data.max(other.data),
            hwm: self.hwm.max(other.hwm),
        }
    }
}

/// Owns a spawned process tree.
///
/// The root was started as leader of its own process group. Descendants are
/// tracked through their parent links rather than the group, since a program
/// may leave the group with `setsid`. When the root is a child subreaper
/// (see [`super::proxy`]) orphans stay inside the tree until the root exits.
///
/// Dropping the guard kills every descendant, then the root, and reaps it.
#[derive(Debug)]
pub struct ProcessGuard {
    pid: libc::pid_t,
    reaped: Option<Reaped>,
}

impl ProcessGuard {
    pub fn new(child: &Child) -> Self {
        Self {
            pid: child.id() as libc::pid_t,
            reaped: None,
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Non-blocking reap of the root
    pub fn try_reap(&mut self) -> io::Result<Option<Reaped>> {
        if let Some(reaped) = self.reaped {
            return Ok(Some(reaped));
        }
        self.wait(libc::WNOHANG)
    }

    /// Kills the whole tree and blocks until the root is reaped
    pub fn kill_and_reap(&mut self, grace: Duration) -> io::Result<Reaped> {
        if let Some(reaped) = self.reaped {
            return Ok(reaped);
        }
        // Descendants go first so none of them is orphaned to init
        self.kill_descendants(grace);
        signal(self.pid, libc::SIGKILL);
        self.signal_group(libc::SIGKILL);
        loop {
            if let Some(reaped) = self.wait(0)? {
                return Ok(reaped);
            }
        }
    }

    /// SIGKILLs every live descendant of the root, repeating until none is
    /// left or `timeout` passes. The root itself is left alone.
    ///
    /// Returns whether the tree below the root is empty.
    pub fn kill_descendants(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            let procs = snapshot();
            let live = descendants(self.pid, &procs);
            if live.is_empty() {
                return true;
            }
            for stat in live {
                signal(stat.pid, libc::SIGKILL);
            }
            if started.elapsed() >= timeout {
                log::warn!("Descendants of {} survived SIGKILL for {timeout:?}", self.pid);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Kills whatever is left of the process group once the root is gone
    /// and waits, up to `timeout`, for those processes to actually die.
    pub fn kill_group_and_settle(&self, timeout: Duration) {
        if !self.signal_group(libc::SIGKILL) {
            return;
        }
        let started = Instant::now();
        while group_alive(self.pid) {
            if started.elapsed() >= timeout {
                log::warn!("Process group {} survived SIGKILL for {timeout:?}", self.pid);
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Memory of every live descendant. The root is left out: under the
    /// proxy it is a copy of the server, not part of the program.
    pub fn usage(&self) -> TreeUsage {
        let procs = snapshot();
        descendants(self.pid, &procs)
            .into_iter()
            .filter_map(|stat| read_memory(stat.pid))
            .fold(TreeUsage::default(), |acc, mem| TreeUsage {
                rss: acc.rss + mem.rss,
                data: acc.data + mem.data,
                hwm: acc.hwm.max(mem.hwm),
            })
    }

    /// Returns whether any process received the signal
    fn signal_group(&self, signal: libc::c_int) -> bool {
        // SAFETY: the group id was created for this child and is never reused
        // while members (or the unreaped root) exist.
        unsafe { libc::killpg(self.pid, signal) == 0 }
    }

    fn wait(&mut self, options: libc::c_int) -> io::Result<Option<Reaped>> {
        let mut status: libc::c_int = 0;
        // SAFETY: zeroed rusage is a valid out-parameter
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: pointers are valid for the duration of the call
            let rc = unsafe { libc::wait4(self.pid, &mut status, options, &mut usage) };
            if rc == self.pid {
                let reaped = Reaped {
                    status: decode_status(status),
                    cpu_time: timeval_to_duration(usage.ru_utime)
                        + timeval_to_duration(usage.ru_stime),
                };
                self.reaped = Some(reaped);
                return Ok(Some(reaped));
            }
            if rc == 0 {
                return Ok(None);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.reaped.is_none() {
            if let Err(e) = self.kill_and_reap(Duration::from_millis(500)) {
                log::error!("Failed to reap process {}: {e}", self.pid);
            }
        }
        self.signal_group(libc::SIGKILL);
    }
}

fn signal(pid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: plain syscall; a vanished pid only yields ESRCH
    unsafe {
        libc::kill(pid, signal);
    }
}

fn decode_status(status: libc::c_int) -> ExitStatus {
    if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    } else {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Fields of `/proc/<pid>/stat` we care about
#[derive(Debug, PartialEq, Eq)]
struct ProcStat {
    pid: libc::pid_t,
    state: char,
    ppid: libc::pid_t,
    pgrp: libc::pid_t,
}

impl ProcStat {
    fn is_live(&self) -> bool {
        self.state != 'Z' && self.state != 'X'
    }
}

fn parse_stat(pid: libc::pid_t, contents: &str) -> Option<ProcStat> {
    // The command name may contain spaces and parentheses
    let rest = contents.get(contents.rfind(')')? + 1..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        pid,
        state: fields.first()?.chars().next()?,
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
    })
}

fn read_stat(pid: libc::pid_t) -> Option<ProcStat> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(pid, &contents)
}

/// Every process on the host, zombies included
#[cfg(target_os = "linux")]
fn snapshot() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<libc::pid_t>().ok())
        .filter_map(read_stat)
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn snapshot() -> Vec<ProcStat> {
    Vec::new()
}

/// Live processes below `root`, following parent links
fn descendants(root: libc::pid_t, procs: &[ProcStat]) -> Vec<&ProcStat> {
    let mut children: HashMap<libc::pid_t, Vec<&ProcStat>> = HashMap::new();
    for stat in procs {
        children.entry(stat.ppid).or_default().push(stat);
    }

    let mut found = Vec::new();
    let mut pending = vec![root];
    while let Some(parent) = pending.pop() {
        for &child in children.get(&parent).into_iter().flatten() {
            // Zombies are walked too; their children are already reparented
            pending.push(child.pid);
            if child.is_live() {
                found.push(child);
            }
        }
    }
    found
}

/// `VmRSS`, `VmData` and `VmHWM` from `/proc/<pid>/status`. Kernel threads
/// and zombies have none of them.
fn parse_memory(contents: &str) -> Option<TreeUsage> {
    let mut usage = TreeUsage::default();
    let mut seen = 0;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let slot = match key {
            "VmRSS" => &mut usage.rss,
            "VmData" => &mut usage.data,
            "VmHWM" => &mut usage.hwm,
            _ => continue,
        };
        let kb: u64 = value.trim().trim_end_matches("kB").trim().parse().ok()?;
        *slot = kb * 1024;
        seen += 1;
    }
    (seen == 3).then_some(usage)
}

fn read_memory(pid: libc::pid_t) -> Option<TreeUsage> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_memory(&contents)
}

fn group_alive(pgid: libc::pid_t) -> bool {
    snapshot()
        .iter()
        .any(|stat| stat.pgrp == pgid && stat.is_live())
}

/// Whether `pid` names a process that has not exited yet
pub fn process_alive(pid: libc::pid_t) -> bool {
    read_stat(pid).is_some_and(|stat| stat.is_live())
}
