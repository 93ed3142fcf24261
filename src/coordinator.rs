use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ByteSize, EngineConfig, LanguageConfig, MilliSecond};
use crate::error::{ExecError, Result};
use crate::gate::{Gate, GateStats};
use crate::sandbox::{ExecutionOutcome, ResourceLimits, Runner, RunnerRegistry, Sandbox};
use crate::workspace::{WorkspaceManager, WorkspaceStats};

/// A single submission. Limits left as `None` take the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    pub stdin: Option<String>,
    pub time_limit: Option<MilliSecond>,
    pub memory_limit: Option<ByteSize>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            stdin: None,
            time_limit: None,
            memory_limit: None,
        }
    }
}

/// Toolchain caches outlive workspaces, so they sit beside them
fn default_cache_root() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "codebox")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    Ok(proj_dirs.cache_dir().join("toolchains"))
}

/// Orchestrates one execution per call: admission, workspace, sandbox, cleanup
pub struct Coordinator {
    config: EngineConfig,
    runners: RunnerRegistry,
    gate: Gate,
    workspaces: Arc<WorkspaceManager>,
    sandbox: Arc<Sandbox>,
    next_id: AtomicU64,
}

impl Coordinator {
    pub fn build(config: EngineConfig, languages: &[LanguageConfig]) -> anyhow::Result<Self> {
        let root = match &config.workspace_root {
            Some(root) => root.clone(),
            None => WorkspaceManager::default_root()?,
        };
        let cache_root = match &config.cache_root {
            Some(cache_root) => cache_root.clone(),
            None => default_cache_root()?,
        };
        fs::create_dir_all(&cache_root)
            .with_context(|| format!("Failed to create cache root {}", cache_root.display()))?;
        log::info!("Toolchain caches in {}", cache_root.display());

        let runners = RunnerRegistry::from_config(languages, &cache_root);
        Self::with_runners(config, runners, root)
    }

    pub fn with_runners(
        config: EngineConfig,
        runners: RunnerRegistry,
        workspace_root: PathBuf,
    ) -> anyhow::Result<Self> {
        let workspaces = WorkspaceManager::new(workspace_root)?;
        log::info!(
            "Execution engine ready: {} slot(s), queue of {}, runners {:?}, workspaces in {}",
            config.max_concurrency,
            config.queue_capacity,
            runners.ids(),
            workspaces.root().display()
        );

        Ok(Self {
            gate: Gate::new(config.max_concurrency, config.queue_capacity),
            sandbox: Arc::new(Sandbox::new(&config)),
            workspaces: Arc::new(workspaces),
            runners,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    pub fn workspace_stats(&self) -> WorkspaceStats {
        self.workspaces.stats()
    }

    /// Removes leftovers of a previous process from the workspace root
    pub fn purge_stale_workspaces(&self) -> anyhow::Result<usize> {
        self.workspaces.purge_stale()
    }

    /// Stops admitting new executions; running ones finish normally
    pub fn shutdown(&self) {
        self.gate.close();
    }

    /// Runs `req`, waiting for a slot no later than `deadline`.
    ///
    /// Dropping the returned future cancels the execution: the process tree is
    /// killed within one tick and its workspace and slot are released.
    pub async fn execute(&self, req: ExecutionRequest, deadline: Instant) -> Result<ExecutionOutcome> {
        self.execute_with_cancel(req, deadline, CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        req: ExecutionRequest,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (runner, limits) = self.validate(&req).inspect_err(|e| {
            log::info!("Execution {id} rejected: {e}");
        })?;

        let slot = self.gate.acquire(deadline, &cancel).await.inspect_err(|e| {
            log::info!("Execution {id} not admitted: {e}");
        })?;
        log::info!("Execution {id} admitted ({})", runner.id());

        let token = cancel.child_token();
        let cancel_on_drop = token.clone().drop_guard();
        let workspaces = self.workspaces.clone();
        let sandbox = self.sandbox.clone();
        let ExecutionRequest { code, stdin, .. } = req;

        // The slot and the workspace live inside the blocking task, so both
        // are released only once the process tree is gone.
        let handle = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let workspace = workspaces.create()?;
            runner.prepare(&workspace, &code)?;
            sandbox.run(
                &workspace,
                runner.as_ref(),
                &limits,
                stdin.as_deref().map(str::as_bytes),
                &token,
            )
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ExecError::Infrastructure(anyhow!("Execution task failed: {e}"))),
        };
        cancel_on_drop.disarm();

        match &result {
            Ok(outcome) => log::info!(
                "Execution {id} finished: {:?} in {:?}, limit {:?}",
                outcome.status,
                outcome.duration,
                outcome.limit_exceeded
            ),
            Err(ExecError::Infrastructure(e)) => log::error!("Execution {id} failed: {e:#}"),
            Err(e) => log::info!("Execution {id} ended: {e}"),
        }
        result
    }

    /// Checks the request against the configuration and resolves its limits
    fn validate(&self, req: &ExecutionRequest) -> Result<(Arc<dyn Runner>, ResourceLimits)> {
        let config = &self.config;

        if req.code.trim().is_empty() {
            return Err(ExecError::invalid("code must not be empty"));
        }
        if req.code.len() as u64 > config.max_code_size.0 {
            return Err(ExecError::invalid(format!(
                "code exceeds {} bytes",
                config.max_code_size.0
            )));
        }
        if let Some(stdin) = &req.stdin {
            if stdin.len() as u64 > config.max_stdin_size.0 {
                return Err(ExecError::invalid(format!(
                    "stdin exceeds {} bytes",
                    config.max_stdin_size.0
                )));
            }
        }
        let runner = self
            .runners
            .get(&req.language)
            .ok_or_else(|| ExecError::invalid(format!("unknown language {}", req.language)))?;

        let time_limit = req.time_limit.unwrap_or(config.time_limit.default);
        if time_limit.0 == 0 || time_limit > config.time_limit.max {
            return Err(ExecError::invalid(format!(
                "time limit must be within 1..={} ms",
                config.time_limit.max.0
            )));
        }
        let memory_limit = req.memory_limit.unwrap_or(config.memory_limit.default);
        if memory_limit.0 == 0 || memory_limit > config.memory_limit.max {
            return Err(ExecError::invalid(format!(
                "memory limit must be within 1..={} bytes",
                config.memory_limit.max.0
            )));
        }

        let cpu_time = Duration::from(time_limit);
        let limits = ResourceLimits {
            cpu_time,
            wall_time: cpu_time + Duration::from(config.wall_time_grace),
            memory: memory_limit.0,
            max_processes: runner.max_processes().unwrap_or(config.max_processes),
            max_open_files: config.max_open_files,
            max_file_size: config.max_file_size.0,
            deny_network: config.deny_network,
        };
        Ok((runner, limits))
    }
}
