//! Ambient runtime configuration (SPEC_FULL.md §12): file → environment
//! → CLI precedence, mirroring `forge_config.rs`'s `ForgeToml` (parsed
//! file layer) / `ForgeConfig` (resolved runtime view with overrides
//! folded in) split.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parsed `minipipe.toml`. Every field is optional: an absent section,
/// or an absent field within one, simply means "let environment/CLI/
/// default decide", matching `ForgeToml`'s `#[serde(default)]` pattern
/// throughout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfigFile {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub patterns: PatternsSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub deterministic: DeterministicSection,
    #[serde(default)]
    pub mock: MockSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSection {
    pub root: Option<PathBuf>,
    pub retention_cap: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternsSection {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub max_concurrency: Option<usize>,
    pub host_cap: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeterministicSection {
    pub enabled: Option<bool>,
}

/// Mock-tool switch. Deliberately file-only: no CLI flag, no env var, so
/// flipping real tool invocations off takes editing `minipipe.toml`, not
/// a flag a script could pass by accident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockSection {
    pub enabled: Option<bool>,
}

impl RuntimeConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse minipipe.toml")
    }

    /// Loads `minipipe.toml` from the current directory if present,
    /// otherwise an empty (all-`None`) file layer — an absent config
    /// file is legal, same as `ForgeToml::load_or_default`.
    pub fn load_or_default(cwd: &Path) -> Result<Self> {
        let path = cwd.join("minipipe.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// CLI-supplied overrides for `execute-plan` (`--max-concurrency`,
/// `--deterministic`), the top precedence tier (SPEC_FULL.md §12).
#[derive(Debug, Clone, Copy, Default)]
pub struct CliOverrides {
    pub max_concurrency: Option<usize>,
    pub deterministic: Option<bool>,
}

/// Fully resolved configuration a running `minipipe` process operates
/// under: one value per setting, file/env/CLI already folded in.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub store_path: PathBuf,
    pub workspace_root: PathBuf,
    pub workspace_retention_cap: usize,
    pub pattern_root: PathBuf,
    pub max_concurrency: usize,
    pub host_cap: usize,
    pub deterministic: bool,
    pub mock_mode: bool,
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("minipipe")
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retention_cap() -> usize {
    20
}

fn default_host_cap() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl RuntimeConfig {
    /// Resolves file → env → CLI into one concrete `RuntimeConfig`
    /// (SPEC_FULL.md §12). `file` is the parsed `minipipe.toml` layer
    /// (or `RuntimeConfigFile::default()` if none was found); `cli` is
    /// whatever `execute-plan`'s own flags supplied.
    pub fn resolve(file: &RuntimeConfigFile, cli: CliOverrides) -> Self {
        let root = default_root();

        let store_path = env_path("MINIPIPE_STATE_DIR")
            .or_else(|| file.store.path.clone())
            .unwrap_or_else(|| root.join("state.db"));

        let workspace_root = env_path("MINIPIPE_WORKSPACE_ROOT")
            .or_else(|| file.workspace.root.clone())
            .unwrap_or_else(|| root.join("workspaces"));

        let pattern_root = env_path("MINIPIPE_PATTERN_ROOT")
            .or_else(|| file.patterns.root.clone())
            .unwrap_or_else(|| root.join("patterns"));

        let max_concurrency = cli
            .max_concurrency
            .or_else(|| env_usize("MINIPIPE_MAX_CONCURRENCY"))
            .or(file.scheduler.max_concurrency)
            .unwrap_or_else(default_max_concurrency);

        let host_cap = file.scheduler.host_cap.unwrap_or_else(default_host_cap);

        let workspace_retention_cap = file
            .workspace
            .retention_cap
            .unwrap_or_else(default_retention_cap);

        let deterministic = cli
            .deterministic
            .or_else(|| env_bool("MINIPIPE_DETERMINISTIC"))
            .or(file.deterministic.enabled)
            .unwrap_or(false);

        // No CLI/env override by design (SPEC_FULL.md §15, Open Question 1).
        let mock_mode = file.mock.enabled.unwrap_or(false);

        Self {
            store_path,
            workspace_root,
            workspace_retention_cap,
            pattern_root,
            max_concurrency,
            host_cap,
            deterministic,
            mock_mode,
        }
    }

    /// `W = min(max_concurrency, host_cap)` (spec §5).
    pub fn worker_pool_size(&self) -> usize {
        self.max_concurrency.min(self.host_cap).max(1)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }
        std::fs::create_dir_all(&self.workspace_root)
            .with_context(|| format!("failed to create workspace root {}", self.workspace_root.display()))?;
        std::fs::create_dir_all(&self.pattern_root)
            .with_context(|| format!("failed to create pattern root {}", self.pattern_root.display()))?;
        Ok(())
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v != "false" && v != "0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var mutation is process-global; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_nothing_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        let file = RuntimeConfigFile::default();
        let resolved = RuntimeConfig::resolve(&file, CliOverrides::default());
        assert_eq!(resolved.max_concurrency, 4);
        assert!(!resolved.deterministic);
        assert!(resolved.store_path.ends_with("state.db"));
    }

    #[test]
    fn file_values_are_used_when_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut file = RuntimeConfigFile::default();
        file.scheduler.max_concurrency = Some(8);
        file.deterministic.enabled = Some(true);
        let resolved = RuntimeConfig::resolve(&file, CliOverrides::default());
        assert_eq!(resolved.max_concurrency, 8);
        assert!(resolved.deterministic);
    }

    #[test]
    fn env_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY: serialized by ENV_LOCK, no other thread in this test
        // binary reads/writes these keys concurrently.
        unsafe {
            std::env::set_var("MINIPIPE_MAX_CONCURRENCY", "16");
        }
        let mut file = RuntimeConfigFile::default();
        file.scheduler.max_concurrency = Some(8);
        let resolved = RuntimeConfig::resolve(&file, CliOverrides::default());
        unsafe {
            std::env::remove_var("MINIPIPE_MAX_CONCURRENCY");
        }
        assert_eq!(resolved.max_concurrency, 16);
    }

    #[test]
    fn cli_overrides_env_and_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("MINIPIPE_MAX_CONCURRENCY", "16");
        }
        let mut file = RuntimeConfigFile::default();
        file.scheduler.max_concurrency = Some(8);
        let cli = CliOverrides {
            max_concurrency: Some(2),
            deterministic: None,
        };
        let resolved = RuntimeConfig::resolve(&file, cli);
        unsafe {
            std::env::remove_var("MINIPIPE_MAX_CONCURRENCY");
        }
        assert_eq!(resolved.max_concurrency, 2);
    }

    #[test]
    fn worker_pool_size_is_the_minimum_of_both_caps() {
        let mut file = RuntimeConfigFile::default();
        file.scheduler.max_concurrency = Some(16);
        file.scheduler.host_cap = Some(4);
        let resolved = RuntimeConfig::resolve(&file, CliOverrides::default());
        assert_eq!(resolved.worker_pool_size(), 4);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [scheduler]
            max_concurrency = 6

            [deterministic]
            enabled = true
        "#;
        let file = RuntimeConfigFile::parse(toml).unwrap();
        assert_eq!(file.scheduler.max_concurrency, Some(6));
        assert_eq!(file.deterministic.enabled, Some(true));
    }
}
