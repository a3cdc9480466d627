//! Configuration for shadertriage.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHADERTRIAGE_HOME)
//! 2. Config file (.shadertriage/config.yaml)
//! 3. Defaults (~/.shadertriage)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shadertriage/config.yaml
//! - `paths.home` is relative to the `.shadertriage/` directory,
//!   `paths.store` to the project root (its parent)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{BackendConfig, GeneratorConfig};
use crate::core::limits::{ReductionLimits, RetryPolicy};

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "SHADERTRIAGE_HOME";

const CONFIG_DIR: &str = ".shadertriage";
const CONFIG_FILE: &str = "config.yaml";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ShadertriageConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    pub workers: Option<usize>,
    pub default_timeout_seconds: Option<u64>,
    pub max_duplicate_crashes: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub reduction: Option<ReductionConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .shadertriage/)
    pub home: Option<String>,
    /// Artifact store root (relative to the project root)
    pub store: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReductionConfig {
    #[serde(flatten)]
    pub limits: ReductionLimits,

    /// Phase names, run in order
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
}

fn default_phases() -> Vec<String> {
    vec![
        "part_1_preserve_semantics".to_string(),
        "part_2_change_semantics".to_string(),
    ]
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ShadertriageConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Artifact store root
    pub store: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub workers: usize,
    pub default_timeout_seconds: u64,
    /// Findings per signature that are still reported and reduced
    pub max_duplicate_crashes: usize,
    pub retry: RetryPolicy,
    pub reduction: ReductionLimits,
    pub phases: Vec<String>,
    pub backends: Vec<BackendConfig>,
    pub generator: Option<GeneratorConfig>,
}

impl ShadertriageConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            store: home.join("store"),
            home,
            config_file: None,
            workers: 4,
            default_timeout_seconds: 60,
            max_duplicate_crashes: 3,
            retry: RetryPolicy::default(),
            reduction: ReductionLimits::default(),
            phases: default_phases(),
            backends: Vec::new(),
            generator: None,
        }
    }

    /// Load a specific config file, ignoring discovery
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = load_config_file(path)?;
        resolve(Some(path), file, std::env::var(HOME_ENV).ok(), default_home()?)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

/// Merge a parsed config file with the environment
fn resolve(
    config_path: Option<&Path>,
    file: ConfigFile,
    env_home: Option<String>,
    default_home: PathBuf,
) -> Result<ShadertriageConfig> {
    // .shadertriage/ and the project root above it
    let config_dir = config_path.and_then(Path::parent).unwrap_or(Path::new("."));
    let project_root = config_dir.parent().unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let mut config = ShadertriageConfig::with_home(home);
    config.config_file = config_path.map(Path::to_path_buf);

    if let Some(ref store_path) = file.paths.store {
        config.store = resolve_path(project_root, store_path);
    }
    if let Some(workers) = file.workers {
        if workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        config.workers = workers;
    }
    if let Some(timeout) = file.default_timeout_seconds {
        config.default_timeout_seconds = timeout;
    }
    if let Some(max) = file.max_duplicate_crashes {
        config.max_duplicate_crashes = max;
    }
    if let Some(retry) = file.retry {
        config.retry = retry;
    }
    if let Some(reduction) = file.reduction {
        config.reduction = reduction.limits;
        config.phases = reduction.phases;
    }

    for (i, backend) in file.backends.iter().enumerate() {
        crate::domain::name::validate_segment(&backend.name)
            .map_err(|reason| anyhow::anyhow!("Backend {} has an invalid name '{}': {}", i, backend.name, reason))?;
        if file.backends[..i].iter().any(|b| b.name == backend.name) {
            anyhow::bail!("Backend '{}' is configured twice", backend.name);
        }
    }
    config.backends = file.backends;
    config.generator = file.generator;

    Ok(config)
}

/// Load configuration from all sources
fn load_config() -> Result<ShadertriageConfig> {
    let env_home = std::env::var(HOME_ENV).ok();

    match find_config_file() {
        Some(config_path) => {
            let file = load_config_file(&config_path)?;
            resolve(Some(&config_path), file, env_home, default_home()?)
        }
        None => resolve(None, ConfigFile::default(), env_home, default_home()?),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ShadertriageConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ShadertriageConfig> {
    load_config()
}

/// Get the shadertriage home directory
pub fn shadertriage_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the artifact store root
pub fn store_dir() -> Result<PathBuf> {
    Ok(config()?.store.clone())
}
