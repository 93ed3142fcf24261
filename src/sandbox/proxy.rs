//! Supervisor, proxy and program.
//!
//! The process `Command` spawns forks once more inside its pre-exec hook. The
//! parent half never execs: it becomes a child subreaper and stays behind as
//! a proxy, while the child half goes on to install the resource limits and
//! exec the program. Any descendant that loses its parent, including one that
//! left the process group with `setsid`, is reparented to the proxy instead of
//! init, so the supervisor can always find it by walking the proxy's subtree.
//!
//! The proxy reaps everything below it. When the program itself is reaped its
//! raw wait status goes over the notice pipe. Once nothing is left the proxy
//! exits the same way the program did, so the supervisor reads the program's
//! status and rusage from a plain `wait4` on the proxy.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Read end of the pipe the proxy reports the program's exit on
#[derive(Debug)]
pub struct ExitNotice {
    read: OwnedFd,
    exited: bool,
}

impl ExitNotice {
    /// Whether the program (not the proxy) has been reaped. Once this turns
    /// true anything still running is a leftover descendant.
    pub fn program_exited(&mut self) -> io::Result<bool> {
        if self.exited {
            return Ok(true);
        }
        let mut buf = [0u8; 4];
        loop {
            // SAFETY: buf is valid for writes of its length
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n == buf.len() as isize {
                self.exited = true;
                return Ok(true);
            }
            if n >= 0 {
                // The proxy is gone without reporting; its own reap covers it
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(false),
                _ => return Err(err),
            }
        }
    }
}

/// Makes the process spawned by `cmd` split into proxy and program.
///
/// Must be called before any other pre-exec hook is registered, so that
/// those hooks run in the program only. The returned descriptor is the
/// parent's copy of the pipe's write end; drop it once `spawn` returns.
pub fn attach(cmd: &mut Command) -> io::Result<(ExitNotice, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is valid for two descriptors
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 just handed us ownership of both descriptors
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    // SAFETY: fcntl on a descriptor we own
    if unsafe { libc::fcntl(read.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let notify = write.as_raw_fd();
    // SAFETY: the hook only calls async-signal-safe libc functions and does
    // not allocate.
    unsafe {
        cmd.pre_exec(move || split(notify));
    }
    Ok((ExitNotice { read, exited: false }, write))
}

/// Returns in the program half; the proxy half never returns
fn split(notify: RawFd) -> io::Result<()> {
    // SAFETY: runs in the freshly forked single-threaded child
    unsafe {
        if libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                libc::close(notify);
                Ok(())
            }
            program => run_proxy(program, notify),
        }
    }
}

unsafe fn run_proxy(program: libc::pid_t, notify: RawFd) -> ! {
    unsafe {
        close_other_fds(notify);

        let mut program_status = None;
        loop {
            let mut status: libc::c_int = 0;
            let rc = libc::waitpid(-1, &mut status, 0);
            if rc == program {
                program_status = Some(status);
                let bytes = status.to_ne_bytes();
                libc::write(notify, bytes.as_ptr().cast(), bytes.len());
            } else if rc < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                // ECHILD: the whole subtree is gone
                break;
            }
        }

        match program_status {
            Some(status) => exit_like(status),
            None => libc::_exit(127),
        }
    }
}

/// Closes every descriptor except `keep`, so pipes the program holds see
/// EOF as soon as the program's side is gone.
unsafe fn close_other_fds(keep: RawFd) {
    let keep = keep as libc::c_uint;
    unsafe {
        let below = keep == 0 || libc::syscall(libc::SYS_close_range, 0, keep - 1, 0) == 0;
        let above = libc::syscall(libc::SYS_close_range, keep + 1, libc::c_uint::MAX, 0) == 0;
        if below && above {
            return;
        }

        // close_range needs Linux 5.9
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let max = if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
            rlim.rlim_cur.min(65536) as libc::c_uint
        } else {
            1024
        };
        for fd in 0..max {
            if fd != keep {
                libc::close(fd as RawFd);
            }
        }
    }
}

/// Terminates the proxy with the same wait status the program had
unsafe fn exit_like(status: libc::c_int) -> ! {
    unsafe {
        if libc::WIFEXITED(status) {
            libc::_exit(libc::WEXITSTATUS(status));
        }

        let signal = libc::WTERMSIG(status);
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &no_core);
        libc::signal(signal, libc::SIG_DFL);
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        libc::kill(libc::getpid(), signal);
        libc::_exit(128 + signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExitStatus;
    use crate::sandbox::process::{ProcessGuard, process_alive};
    use pretty_assertions::assert_eq;
    use std::io::{BufRead, BufReader};
    use std::process::{Child, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    fn spawn(script: &str) -> (Child, ProcessGuard, ExitNotice) {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .process_group(0);
        let (notice, write) = attach(&mut cmd).unwrap();
        let child = cmd.spawn().unwrap();
        drop(write);
        let guard = ProcessGuard::new(&child);
        (child, guard, notice)
    }

    fn wait_for_exit(guard: &mut ProcessGuard, notice: &mut ExitNotice) -> ExitStatus {
        let started = Instant::now();
        loop {
            if let Some(reaped) = guard.try_reap().unwrap() {
                return reaped.status;
            }
            if notice.program_exited().unwrap() {
                guard.kill_descendants(Duration::from_millis(500));
            }
            assert!(started.elapsed() < Duration::from_secs(5), "tree never exited");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_proxy_mirrors_exit_code() {
        let (_child, mut guard, mut notice) = spawn("exit 3");
        assert_eq!(wait_for_exit(&mut guard, &mut notice), ExitStatus::Exited(3));
        assert!(notice.program_exited().unwrap());
    }

    #[test]
    fn test_proxy_mirrors_signal() {
        let (_child, mut guard, mut notice) = spawn("kill -SEGV $$");
        assert_eq!(
            wait_for_exit(&mut guard, &mut notice),
            ExitStatus::Signaled(libc::SIGSEGV)
        );
    }

    #[test]
    fn test_new_session_stays_in_tree() {
        let (mut child, mut guard, mut notice) =
            spawn("setsid sh -c 'echo $$; exec sleep 30' & sleep 0.2; exit 4");
        let mut line = String::new();
        BufReader::new(child.stdout.as_mut().unwrap())
            .read_line(&mut line)
            .unwrap();
        let escaped: libc::pid_t = line.trim().parse().unwrap();

        assert_eq!(wait_for_exit(&mut guard, &mut notice), ExitStatus::Exited(4));
        assert!(!process_alive(escaped));
    }

    #[test]
    fn test_cpu_time_includes_program() {
        let (_child, mut guard, mut notice) =
            spawn("i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done");
        wait_for_exit(&mut guard, &mut notice);
        let reaped = guard.try_reap().unwrap().unwrap();
        assert!(reaped.cpu_time > Duration::ZERO);
    }
}
