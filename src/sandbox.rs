mod capture;
mod limits;
mod process;
mod proxy;
mod runner;

pub use limits::{MEMORY_RLIMIT_HEADROOM, ResourceLimits};
pub use process::process_alive;
pub use runner::{CommandRunner, EXECUTABLE_NAME, Runner, RunnerRegistry};

use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{ExecError, Result};
use crate::workspace::Workspace;
use capture::CaptureHandle;
use process::{ProcessGuard, Reaped, TreeUsage};

/// How long output pipes may stay open after the process tree is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceeded {
    None,
    Time,
    Memory,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compile,
    Run,
}

/// Result of running untrusted code once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub duration: Duration,
    pub cpu_time: Duration,
    /// Peak resident memory in bytes
    pub peak_memory: u64,
    /// Either stream hit the output cap
    pub truncated: bool,
    pub limit_exceeded: LimitExceeded,
    pub stage: Stage,
}

impl ExecutionOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExitStatus::Exited(code) => Some(code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self.status {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(signal),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExitStatus::Exited(0) && self.limit_exceeded == LimitExceeded::None
    }
}

/// Why supervision stopped before the program exited on its own
enum Forced {
    Limit(LimitExceeded),
    Cancelled,
}

/// Runs programs inside a workspace under resource limits
///
/// Every process spawned here, and every descendant it forks, is gone by the
/// time [`Sandbox::run`] returns.
#[derive(Debug, Clone)]
pub struct Sandbox {
    output_limit: usize,
    tick: Duration,
    search_path: String,
    compile_time_limit: Duration,
    wall_time_grace: Duration,
}

impl Sandbox {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            output_limit: usize::try_from(config.output_limit.0).unwrap_or(usize::MAX),
            tick: config.tick.into(),
            search_path: config.search_path.clone(),
            compile_time_limit: config.compile_time_limit.into(),
            wall_time_grace: config.wall_time_grace.into(),
        }
    }

    /// Main entry point: optional compile stage, then the program itself.
    ///
    /// A failed compile stage is returned as the outcome and the program is
    /// not started.
    pub fn run(
        &self,
        workspace: &Workspace,
        runner: &dyn Runner,
        limits: &ResourceLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let env = runner.env(workspace);

        if let Some(compile) = runner.compile_line() {
            let compile_limits = ResourceLimits {
                cpu_time: self.compile_time_limit,
                wall_time: self.compile_time_limit + self.wall_time_grace,
                ..*limits
            };
            let outcome = self.run_stage(
                Stage::Compile,
                &compile,
                workspace,
                &env,
                &compile_limits,
                None,
                cancel,
            )?;
            if !outcome.is_success() {
                return Ok(outcome);
            }
        }

        self.run_stage(
            Stage::Run,
            &runner.command_line(),
            workspace,
            &env,
            limits,
            stdin,
            cancel,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stage(
        &self,
        stage: Stage,
        argv: &[String],
        workspace: &Workspace,
        env: &[(String, String)],
        limits: &ResourceLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("Empty {stage:?} command line"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", workspace.path())
            .env("LANG", "C.UTF-8")
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let (mut notice, notify) = proxy::attach(&mut cmd).context("Failed to create exit pipe")?;
        limits.apply(&mut cmd);

        // Pending -> Spawned
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {program}"))?;
        drop(notify);
        let started = Instant::now();
        let mut guard = ProcessGuard::new(&child);
        log::debug!("{stage:?} stage spawned under proxy {}", guard.pid());

        let stdout = CaptureHandle::spawn(
            "stdout",
            child.stdout.take().context("Missing stdout pipe")?,
            self.output_limit,
        )?;
        let stderr = CaptureHandle::spawn(
            "stderr",
            child.stderr.take().context("Missing stderr pipe")?,
            self.output_limit,
        )?;
        let feeder = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_vec();
                Some(
                    thread::Builder::new()
                        .name("stdin-feed".to_string())
                        .spawn(move || {
                            // The program may exit without reading everything
                            let _ = pipe.write_all(&input);
                        })?,
                )
            }
            _ => None,
        };

        // Running -> {Completed, TimedOut, LimitExceeded}
        let deadline = started + limits.wall_time;
        let mut peak = TreeUsage::default();
        let (reaped, forced) = loop {
            if let Some(reaped) = guard.try_reap()? {
                break (reaped, None);
            }
            if notice.program_exited()? {
                // Leftovers keep the proxy waiting; it exits once they are gone
                guard.kill_descendants(DRAIN_GRACE);
            }
            if cancel.is_cancelled() {
                break (guard.kill_and_reap(DRAIN_GRACE)?, Some(Forced::Cancelled));
            }

            let usage = guard.usage();
            peak = peak.max(usage);
            if usage.rss > limits.memory {
                log::debug!("Process tree {} uses {} bytes, killing", guard.pid(), usage.rss);
                let reaped = guard.kill_and_reap(DRAIN_GRACE)?;
                break (reaped, Some(Forced::Limit(LimitExceeded::Memory)));
            }

            let now = Instant::now();
            if now >= deadline {
                log::debug!("Process tree {} hit the wall-clock limit", guard.pid());
                let reaped = guard.kill_and_reap(DRAIN_GRACE)?;
                break (reaped, Some(Forced::Limit(LimitExceeded::Time)));
            }
            thread::sleep(self.tick.min(deadline - now));
        };
        let duration = started.elapsed();

        // -> Cleaned
        guard.kill_group_and_settle(DRAIN_GRACE);
        let stdout = stdout.finish(DRAIN_GRACE);
        let stderr = stderr.finish(DRAIN_GRACE);
        if let Some(feeder) = feeder {
            // Every reader is dead, so the writer has hit EPIPE by now
            if feeder.join().is_err() {
                log::warn!("stdin feeder panicked");
            }
        }
        drop(guard);

        let limit_exceeded = match forced {
            Some(Forced::Cancelled) => {
                log::debug!("{stage:?} stage cancelled after {duration:?}");
                return Err(ExecError::Cancelled);
            }
            Some(Forced::Limit(limit)) => limit,
            None => classify(&reaped, limits, &peak),
        };

        Ok(ExecutionOutcome {
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            status: reaped.status,
            duration,
            cpu_time: reaped.cpu_time,
            peak_memory: peak.rss.max(peak.hwm),
            truncated: stdout.truncated || stderr.truncated,
            limit_exceeded,
            stage,
        })
    }
}

/// Attributes a self-terminated process to a limit, if any.
///
/// `SIGSYS` only comes from the oversized-mapping filter. A failure after
/// the tree had more memory committed than the limit is blamed on memory,
/// since a refused allocation surfaces as whatever error the runtime picks.
fn classify(reaped: &Reaped, limits: &ResourceLimits, peak: &TreeUsage) -> LimitExceeded {
    let cpu_budget = Duration::from_secs(limits.cpu_seconds());

    match reaped.status {
        ExitStatus::Signaled(libc::SIGXCPU) => LimitExceeded::Time,
        ExitStatus::Signaled(libc::SIGKILL) if reaped.cpu_time >= cpu_budget => {
            LimitExceeded::Time
        }
        ExitStatus::Signaled(libc::SIGSYS) => LimitExceeded::Memory,
        ExitStatus::Exited(0) => LimitExceeded::None,
        _ if peak.rss.max(peak.hwm) > limits.memory || peak.data > limits.memory => {
            LimitExceeded::Memory
        }
        _ => LimitExceeded::None,
    }
}
