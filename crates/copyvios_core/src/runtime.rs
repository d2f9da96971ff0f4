use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".copyvios";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const EXCLUSIONS_DB_FILENAME: &str = "exclusions.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub exclusions_db_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})\nexclusions_db={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.exclusions_db_path),
        )
    }

    /// The exclusions database named by the config, or the default under the state dir.
    pub fn exclusions_db(&self, config: &crate::config::CopyvioConfig) -> PathBuf {
        config
            .exclusions_db(&self.project_root)
            .unwrap_or_else(|| self.exclusions_db_path.clone())
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = if let Some(path) = overrides.project_root.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_env("COPYVIOS_PROJECT_ROOT") {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };

    let state_dir = project_root.join(STATE_DIR_NAME);
    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("COPYVIOS_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        exclusions_db_path: state_dir.join(EXCLUSIONS_DB_FILENAME),
        project_root,
        state_dir,
        config_path,
        root_source,
        config_source,
    })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_state_dir: bool,
    pub wrote_config: bool,
}

/// Create the state directory and materialize a commented config file.
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let created_state_dir = !paths.state_dir.exists();
    if created_state_dir {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
    }
    let wrote_config = write_text_file(&paths.config_path, &render_materialized_config(), force)?;
    Ok(InitReport {
        created_state_dir,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    "# copyvios configuration (materialized by `copyvios init`)\n\n[wiki]\nsite_name = \"enwiki\"\n# api_url = \"https://en.wikipedia.org/w/api.php\"\n# user_agent = \"copyvios/0.2\"\n# all_sites_host = \"enwiki\"\n\n[wiki.sites]\n# enwiki = \"https://en.wikipedia.org/w/api.php\"\n\n[search]\n# engine = \"Google\"\n# nltk_dir = \"/path/to/tokenizers\"\n# exclusions_db = \".copyvios/exclusions.db\"\ninclude_min_confidence = 0.15\nsearch_delay_ms = 1000\n\n[search.credentials]\n# id = \"...\"\n# key = \"...\"\n\n# [[search.proxies]]\n# netloc = \"example.com\"\n# target = \"https://proxy.example.net/fetch\"\n# onerr = true\n\n[copyvios]\nmin_confidence = 0.75\nmax_queries = 15\nmax_time = -1\nurl_timeout = 5\nnum_workers = 8\ndegree = 5\n".to_string()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{PathOverrides, ResolutionContext, ValueSource, init_layout, resolve_paths_with_lookup};
    use crate::config::load_config;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd: cwd.clone() };
        let env = HashMap::from([(
            "COPYVIOS_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.config_source, ValueSource::Default);
        assert!(resolved.config_path.ends_with(".copyvios/config.toml"));
    }

    #[test]
    fn resolve_paths_reads_config_from_env() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([("COPYVIOS_CONFIG".to_string(), "bot.toml".to_string())]);
        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve paths");
        assert_eq!(resolved.root_source, ValueSource::Default);
        assert_eq!(resolved.config_source, ValueSource::Env);
        assert_eq!(resolved.config_path, temp.path().join("bot.toml"));
    }

    #[test]
    fn init_layout_writes_loadable_config_once() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let paths = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");

        let first = init_layout(&paths, false).expect("init");
        assert!(first.created_state_dir);
        assert!(first.wrote_config);
        let config = load_config(&paths.config_path).expect("load materialized config");
        assert_eq!(config.min_confidence(), 0.75);

        let second = init_layout(&paths, false).expect("second init");
        assert!(!second.created_state_dir);
        assert!(!second.wrote_config);
    }
}
