use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::config::LanguageConfig;
use crate::workspace::Workspace;

/// Name of the artifact produced by a compile step, relative to the workspace
pub const EXECUTABLE_NAME: &str = "main";

/// Trait for the per-language launch strategy
///
/// A runner knows how to stage submitted code in a workspace and which
/// command lines build and run it there. Everything else (limits, capture,
/// cleanup) is the sandbox's business.
pub trait Runner: Send + Sync {
    /// Identifier clients use to pick this runner
    fn id(&self) -> &str;

    /// Writes the submitted code into the workspace
    fn prepare(&self, workspace: &Workspace, code: &str) -> Result<()>;

    /// Optional build step, run before [`Runner::command_line`]
    fn compile_line(&self) -> Option<Vec<String>> {
        None
    }

    /// Command that runs the program, relative to the workspace
    fn command_line(&self) -> Vec<String>;

    /// Extra environment on top of the sandbox's minimal set
    fn env(&self, _workspace: &Workspace) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Per-runner override of the process limit
    fn max_processes(&self) -> Option<u64> {
        None
    }
}

/// Runner driven by a `languages` entry of the configuration
///
/// Environment values may use `%WORKSPACE%` for the per-execution directory
/// and `%CACHE%` for the toolchain cache shared by every execution.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    language: LanguageConfig,
    cache_root: PathBuf,
}

impl CommandRunner {
    pub fn new(language: LanguageConfig, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            language,
            cache_root: cache_root.into(),
        }
    }

    /// Applies `%INPUT%` / `%OUTPUT%` substitutions to a command template
    fn render(&self, template: &[String]) -> Vec<String> {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &self.language.file_name);
        mapping.insert("%OUTPUT%", EXECUTABLE_NAME);

        template
            .iter()
            .map(|s| {
                let mut t = s.clone();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect()
    }
}

impl Runner for CommandRunner {
    fn id(&self) -> &str {
        &self.language.name
    }

    fn prepare(&self, workspace: &Workspace, code: &str) -> Result<()> {
        workspace.write_file(&self.language.file_name, format!("{code}\n").as_bytes())?;
        Ok(())
    }

    fn compile_line(&self) -> Option<Vec<String>> {
        self.language.compile.as_deref().map(|c| self.render(c))
    }

    fn command_line(&self) -> Vec<String> {
        self.render(&self.language.command)
    }

    fn env(&self, workspace: &Workspace) -> Vec<(String, String)> {
        let root = workspace.path().to_string_lossy();
        let cache = self.cache_root.to_string_lossy();
        self.language
            .env
            .iter()
            .map(|(k, v)| {
                let value = v.replace("%WORKSPACE%", &root).replace("%CACHE%", &cache);
                (k.clone(), value)
            })
            .collect()
    }

    fn max_processes(&self) -> Option<u64> {
        self.language.max_processes
    }
}

/// The set of allowed runners, keyed by id
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn from_config(languages: &[LanguageConfig], cache_root: &Path) -> Self {
        let mut registry = Self::default();
        for language in languages {
            registry.register(Arc::new(CommandRunner::new(language.clone(), cache_root)));
        }
        registry
    }

    /// Adds a runner, replacing any previous one with the same id
    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.id().to_string(), runner);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Runner>> {
        self.runners.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn c_language() -> LanguageConfig {
        LanguageConfig {
            name: "c".to_string(),
            file_name: "main.c".to_string(),
            command: vec!["./%OUTPUT%".to_string()],
            compile: Some(vec![
                "gcc".to_string(),
                "-o".to_string(),
                "%OUTPUT%".to_string(),
                "%INPUT%".to_string(),
            ]),
            env: HashMap::from([
                ("TMPDIR".to_string(), "%WORKSPACE%/tmp".to_string()),
                ("CCACHE_DIR".to_string(), "%CACHE%/ccache".to_string()),
            ]),
            max_processes: Some(8),
        }
    }

    #[test]
    fn test_templates_are_rendered() {
        let runner = CommandRunner::new(c_language(), "/var/cache/codebox");
        assert_eq!(runner.command_line(), vec!["./main"]);
        assert_eq!(
            runner.compile_line(),
            Some(vec![
                "gcc".to_string(),
                "-o".to_string(),
                "main".to_string(),
                "main.c".to_string()
            ])
        );
        assert_eq!(runner.max_processes(), Some(8));
    }

    #[test]
    fn test_prepare_writes_source_and_env_points_into_workspace() {
        let root = std::env::temp_dir().join(format!("codebox-runner-test-{}", std::process::id()));
        let manager = crate::workspace::WorkspaceManager::new(&root).unwrap();
        let workspace = manager.create().unwrap();
        let runner = CommandRunner::new(c_language(), "/var/cache/codebox");

        runner.prepare(&workspace, "int main(){return 0;}").unwrap();
        let source = std::fs::read_to_string(workspace.path().join("main.c")).unwrap();
        assert_eq!(source, "int main(){return 0;}\n");

        let mut env = runner.env(&workspace);
        env.sort();
        assert_eq!(
            env,
            vec![
                (
                    "CCACHE_DIR".to_string(),
                    "/var/cache/codebox/ccache".to_string()
                ),
                (
                    "TMPDIR".to_string(),
                    format!("{}/tmp", workspace.path().display())
                ),
            ]
        );

        drop(workspace);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RunnerRegistry::from_config(&[c_language()], Path::new("/tmp"));
        assert!(registry.get("c").is_some());
        assert!(registry.get("cobol").is_none());
        assert_eq!(registry.ids(), vec!["c"]);
    }
}
