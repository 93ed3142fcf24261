//! Kernel-enforced limits installed in the child between `fork` and `exec`.
//!
//! | Limit | Source |
//! |-------|--------|
//! | `RLIMIT_CPU` | `cpu_time`, rounded up to whole seconds; hard limit one second later |
//! | `RLIMIT_DATA` | `memory` × [`MEMORY_RLIMIT_HEADROOM`] |
//! | `RLIMIT_NPROC` | `max_processes`, counted inside a private user namespace |
//! | `RLIMIT_NOFILE` | `max_open_files` |
//! | `RLIMIT_FSIZE` | `max_file_size` |
//! | `RLIMIT_CORE` | 0 |
//!
//! Resident memory itself is watched by the sandbox, which samples the whole
//! process tree. `RLIMIT_AS` is left alone since runtimes such as Go reserve
//! far more address space than they ever touch.
//!
//! A single writable private mapping larger than `memory` can never fit, so a
//! seccomp filter kills the program with `SIGSYS` on such an `mmap` or
//! `mremap` instead of letting the kernel refuse it and the runtime turn the
//! refusal into an ordinary crash. `RLIMIT_DATA` stops allocations that creep
//! past the limit faster than the sampling notices.
//!
//! `RLIMIT_NPROC` is accounted per user. The child first moves into a fresh
//! user namespace (Linux 5.14 and later count processes per namespace), so the
//! budget covers this execution only. Where unprivileged user namespaces are
//! unavailable the count falls back to every process of the server's user.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

/// `RLIMIT_DATA` is set this many times above the memory limit
pub const MEMORY_RLIMIT_HEADROOM: u64 = 2;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time: Duration,
    /// Wall-clock budget; enforced by the sandbox, not by the kernel
    pub wall_time: Duration,
    /// Resident memory in bytes
    pub memory: u64,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub max_file_size: u64,
    pub deny_network: bool,
}

impl ResourceLimits {
    /// Installs the limits on `cmd`. The child also becomes the leader of
    /// a new process group so the whole tree can be signalled at once.
    pub fn apply(&self, cmd: &mut Command) {
        let limits = *self;
        cmd.process_group(0);
        // SAFETY: the hook only calls async-signal-safe libc functions and
        // does not allocate.
        unsafe {
            cmd.pre_exec(move || limits.install());
        }
    }

    /// CPU seconds granted to the process
    pub fn cpu_seconds(&self) -> u64 {
        let secs = self.cpu_time.as_secs() + u64::from(self.cpu_time.subsec_nanos() > 0);
        secs.max(1)
    }

    pub fn data_limit(&self) -> u64 {
        self.memory.saturating_mul(MEMORY_RLIMIT_HEADROOM)
    }

    fn install(&self) -> io::Result<()> {
        // Before RLIMIT_NPROC, so the limit binds inside the new namespace
        isolate(self.deny_network);

        let cpu = self.cpu_seconds();
        set_rlimit(libc::RLIMIT_CPU, cpu, cpu + 1)?;
        set_rlimit(libc::RLIMIT_DATA, self.data_limit(), self.data_limit())?;
        set_rlimit(libc::RLIMIT_NOFILE, self.max_open_files, self.max_open_files)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.max_file_size, self.max_file_size)?;
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        set_rlimit(libc::RLIMIT_NPROC, self.max_processes, self.max_processes)?;

        deny_oversized_mappings(self.memory);
        Ok(())
    }
}

fn set_rlimit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: rlim is valid, resource is a valid constant.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Moves the child into a fresh user namespace, plus an empty network
/// namespace when `deny_network` is set. Without unprivileged user namespaces
/// a privileged server still gets the network namespace. Otherwise the child
/// silently stays where it is.
#[cfg(target_os = "linux")]
fn isolate(deny_network: bool) {
    let network = if deny_network { libc::CLONE_NEWNET } else { 0 };
    // SAFETY: unshare only affects the calling (single-threaded) child.
    unsafe {
        if libc::unshare(libc::CLONE_NEWUSER | network) == 0 {
            return;
        }
        if deny_network {
            let _ = libc::unshare(libc::CLONE_NEWNET);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn isolate(_deny_network: bool) {}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const AUDIT_ARCH: u32 = 0xc000_003e;
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
const AUDIT_ARCH: u32 = 0xc000_00b7;

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod filter {
    //! Classic BPF for the allocation filter. Offsets index `seccomp_data`:
    //! `nr` at 0, `arch` at 4, `args[i]` at 16 + 8i (low word first).

    const BPF_LD: u16 = 0x00;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_JGT: u16 = 0x20;
    const BPF_JSET: u16 = 0x40;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    const LD_W_ABS: u16 = BPF_LD | BPF_W | BPF_ABS;
    const JMP_JEQ_K: u16 = BPF_JMP | BPF_JEQ | BPF_K;
    const JMP_JGT_K: u16 = BPF_JMP | BPF_JGT | BPF_K;
    const JMP_JSET_K: u16 = BPF_JMP | BPF_JSET | BPF_K;
    const RET_K: u16 = BPF_RET | BPF_K;

    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

    pub const LEN: usize = 21;
    const ALLOW: usize = 19;
    const KILL: usize = 20;

    const fn arg_lo(i: u32) -> u32 {
        16 + 8 * i
    }

    const fn arg_hi(i: u32) -> u32 {
        16 + 8 * i + 4
    }

    const fn stmt(code: u16, k: u32) -> libc::sock_filter {
        libc::sock_filter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    const fn jump(code: u16, k: u32, at: usize, on_true: usize, on_false: usize) -> libc::sock_filter {
        libc::sock_filter {
            code,
            jt: (on_true - at - 1) as u8,
            jf: (on_false - at - 1) as u8,
            k,
        }
    }

    /// Kills the process on `mmap` of a writable private region longer than
    /// `limit`, or `mremap` to a size above `limit`. Everything else passes.
    pub fn program(limit: u64) -> [libc::sock_filter; LEN] {
        let hi = (limit >> 32) as u32;
        let lo = limit as u32;
        [
            /* 0 */ stmt(LD_W_ABS, 4),
            /* 1 */ jump(JMP_JEQ_K, super::AUDIT_ARCH, 1, 2, ALLOW),
            /* 2 */ stmt(LD_W_ABS, 0),
            /* 3 */ jump(JMP_JEQ_K, libc::SYS_mmap as u32, 3, 5, 4),
            /* 4 */ jump(JMP_JEQ_K, libc::SYS_mremap as u32, 4, 14, ALLOW),
            // mmap(addr, len, prot, flags, ..)
            /* 5 */ stmt(LD_W_ABS, arg_lo(2)),
            /* 6 */ jump(JMP_JSET_K, libc::PROT_WRITE as u32, 6, 7, ALLOW),
            /* 7 */ stmt(LD_W_ABS, arg_lo(3)),
            /* 8 */ jump(JMP_JSET_K, libc::MAP_PRIVATE as u32, 8, 9, ALLOW),
            /* 9 */ stmt(LD_W_ABS, arg_hi(1)),
            /* 10 */ jump(JMP_JGT_K, hi, 10, KILL, 11),
            /* 11 */ jump(JMP_JEQ_K, hi, 11, 12, ALLOW),
            /* 12 */ stmt(LD_W_ABS, arg_lo(1)),
            /* 13 */ jump(JMP_JGT_K, lo, 13, KILL, ALLOW),
            // mremap(old, old_len, new_len, ..)
            /* 14 */ stmt(LD_W_ABS, arg_hi(2)),
            /* 15 */ jump(JMP_JGT_K, hi, 15, KILL, 16),
            /* 16 */ jump(JMP_JEQ_K, hi, 16, 17, ALLOW),
            /* 17 */ stmt(LD_W_ABS, arg_lo(2)),
            /* 18 */ jump(JMP_JGT_K, lo, 18, KILL, ALLOW),
            /* 19 */ stmt(RET_K, SECCOMP_RET_ALLOW),
            /* 20 */ stmt(RET_K, SECCOMP_RET_KILL_PROCESS),
        ]
    }
}

/// Best effort: a kernel without seccomp just leaves `RLIMIT_DATA` in charge
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
fn deny_oversized_mappings(limit: u64) {
    let mut program = filter::program(limit);
    let prog = libc::sock_fprog {
        len: filter::LEN as u16,
        filter: program.as_mut_ptr(),
    };
    // SAFETY: prog points at a live filter array for the duration of the call
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            return;
        }
        let _ = libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog,
        );
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn deny_oversized_mappings(_limit: u64) {}
