use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "codebox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Address to bind the HTTP server to
    #[arg(long = "bind")]
    pub bind_address: Option<String>,

    /// Port to bind the HTTP server to
    #[arg(long = "port", short = 'p')]
    pub bind_port: Option<u16>,

    /// Maximum number of programs running at the same time
    #[arg(long = "max-concurrency", short = 'j')]
    pub max_concurrency: Option<usize>,

    /// Directory under which per-request workspaces are created
    #[arg(long = "workspace-root")]
    pub workspace_root: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration file (or the defaults) and apply CLI overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Failed to open config file {path}"))?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)
                    .with_context(|| format!("Failed to parse config file {path}"))?
            }
            None => Config::default(),
        };

        if let Some(address) = &self.bind_address {
            config.server.bind_address = Some(address.clone());
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = Some(port);
        }
        if let Some(n) = self.max_concurrency {
            config.engine.max_concurrency = n;
        }
        if let Some(root) = &self.workspace_root {
            config.engine.workspace_root = Some(root.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_languages")]
    pub languages: Vec<LanguageConfig>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    /// How many requests may wait for a slot before new ones are rejected
    pub queue_capacity: usize,
    pub admission_timeout: MilliSecond,
    pub max_code_size: ByteSize,
    pub max_stdin_size: ByteSize,
    /// Cap applied to stdout and stderr separately
    pub output_limit: ByteSize,
    pub time_limit: LimitRange<MilliSecond>,
    pub memory_limit: LimitRange<ByteSize>,
    /// Extra wall-clock time granted on top of the CPU time limit
    pub wall_time_grace: MilliSecond,
    pub compile_time_limit: MilliSecond,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub max_file_size: ByteSize,
    pub deny_network: bool,
    /// `PATH` handed to untrusted programs
    pub search_path: String,
    pub workspace_root: Option<PathBuf>,
    /// Toolchain caches shared by every execution, `%CACHE%` in language env
    pub cache_root: Option<PathBuf>,
    /// Supervision interval for deadlines, memory sampling and cancellation
    pub tick: MilliSecond,
    pub default_language: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            queue_capacity: 16,
            admission_timeout: MilliSecond(10_000),
            max_code_size: ByteSize(64 * 1024),
            max_stdin_size: ByteSize(1024 * 1024),
            output_limit: ByteSize(1024 * 1024),
            time_limit: LimitRange {
                default: MilliSecond(5_000),
                max: MilliSecond(30_000),
            },
            memory_limit: LimitRange {
                default: ByteSize(256 * 1024 * 1024),
                max: ByteSize(1024 * 1024 * 1024),
            },
            wall_time_grace: MilliSecond(1_000),
            compile_time_limit: MilliSecond(30_000),
            max_processes: 64,
            max_open_files: 64,
            max_file_size: ByteSize(16 * 1024 * 1024),
            deny_network: true,
            search_path: "/usr/local/go/bin:/usr/local/bin:/usr/bin:/bin".to_string(),
            workspace_root: None,
            cache_root: None,
            tick: MilliSecond(10),
            default_language: "go".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRange<T> {
    pub default: T,
    pub max: T,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub name: String,
    pub file_name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides `engine.max_processes`, for runtimes that spawn many threads
    #[serde(default)]
    pub max_processes: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            languages: default_languages(),
        }
    }
}

fn default_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "go".to_string(),
            file_name: "main.go".to_string(),
            command: vec!["./%OUTPUT%".to_string()],
            compile: Some(vec![
                "go".to_string(),
                "build".to_string(),
                "-o".to_string(),
                "%OUTPUT%".to_string(),
                "%INPUT%".to_string(),
            ]),
            env: HashMap::from([
                ("GOCACHE".to_string(), "%CACHE%/go-build".to_string()),
                ("GOPATH".to_string(), "%CACHE%/go".to_string()),
                ("GOFLAGS".to_string(), "-p=1".to_string()),
            ]),
            max_processes: Some(256),
        },
        LanguageConfig {
            name: "python".to_string(),
            file_name: "main.py".to_string(),
            command: vec!["python3".to_string(), "%INPUT%".to_string()],
            compile: None,
            env: HashMap::new(),
            max_processes: None,
        },
    ]
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let engine = &self.engine;
        if engine.max_concurrency == 0 {
            bail!("engine.max_concurrency must not be 0");
        }
        if engine.tick.0 == 0 {
            bail!("engine.tick must not be 0");
        }
        if engine.output_limit.0 == 0 {
            bail!("engine.output_limit must not be 0");
        }
        if engine.time_limit.default.0 == 0 || engine.time_limit.default > engine.time_limit.max {
            bail!("engine.time_limit.default must be within 1..=max");
        }
        if engine.memory_limit.default.0 == 0
            || engine.memory_limit.default > engine.memory_limit.max
        {
            bail!("engine.memory_limit.default must be within 1..=max");
        }
        if self.languages.is_empty() {
            bail!("At least one language must be configured");
        }

        let mut seen = HashSet::new();
        for language in &self.languages {
            if !seen.insert(language.name.as_str()) {
                bail!("Duplicate language {}", language.name);
            }
            if language.command.is_empty() {
                bail!("Language {} has an empty command", language.name);
            }
            if language.compile.as_ref().is_some_and(|c| c.is_empty()) {
                bail!("Language {} has an empty compile command", language.name);
            }
            if language.file_name.is_empty() || language.file_name.contains('/') {
                bail!("Language {} has an invalid file name", language.name);
            }
        }
        if !seen.contains(engine.default_language.as_str()) {
            bail!(
                "Default language {} is not configured",
                engine.default_language
            );
        }

        Ok(())
    }
}
