use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "copyvios/0.2";
pub const DEFAULT_SITE_NAME: &str = "enwiki";
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.75;
pub const DEFAULT_INCLUDE_MIN_CONFIDENCE: f64 = 0.15;
pub const DEFAULT_MAX_QUERIES: usize = 15;
pub const DEFAULT_URL_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_NUM_WORKERS: usize = 8;
pub const DEFAULT_SEARCH_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RESULT_COUNT: usize = 5;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CopyvioConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub copyvios: CheckSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub site_name: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    /// Site whose pages hold the exclusion lists shared by every site.
    pub all_sites_host: Option<String>,
    /// Site name -> API URL for sites reachable during exclusion syncing.
    #[serde(default)]
    pub sites: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct SearchConfig {
    pub engine: Option<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    pub nltk_dir: Option<PathBuf>,
    pub exclusions_db: Option<PathBuf>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    pub include_min_confidence: Option<f64>,
    pub search_delay_ms: Option<u64>,
    pub result_count: Option<usize>,
}

/// Remaps fetches for one host through another endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub netloc: String,
    pub path: Option<String>,
    pub target: String,
    /// `user:password` for Basic auth against the target.
    pub auth: Option<String>,
    /// Only use the proxy after a direct fetch has failed.
    #[serde(default)]
    pub onerr: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CheckSection {
    pub min_confidence: Option<f64>,
    pub max_queries: Option<usize>,
    pub max_time: Option<f64>,
    pub url_timeout: Option<u64>,
    pub num_workers: Option<usize>,
    pub degree: Option<usize>,
    pub global_workers: Option<usize>,
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

impl CopyvioConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        env_override("WIKI_API_URL").or_else(|| self.wiki.api_url.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn site_name(&self) -> &str {
        self.wiki.site_name.as_deref().unwrap_or(DEFAULT_SITE_NAME)
    }

    pub fn all_sites_host(&self) -> &str {
        self.wiki
            .all_sites_host
            .as_deref()
            .unwrap_or(DEFAULT_SITE_NAME)
    }

    /// API URL for a named site, falling back to the primary wiki for its own name.
    pub fn site_api_url(&self, site_name: &str) -> Option<String> {
        if let Some(url) = self.wiki.sites.get(site_name) {
            return Some(url.clone());
        }
        if site_name == self.site_name() {
            return self.api_url();
        }
        None
    }

    /// Resolve the search engine name: env COPYVIOS_SEARCH_ENGINE > config.
    pub fn engine(&self) -> Option<String> {
        env_override("COPYVIOS_SEARCH_ENGINE").or_else(|| self.search.engine.clone())
    }

    /// Resolve the exclusions database: env COPYVIOS_EXCLUSIONS_DB > config.
    /// Relative paths are taken from `project_root`.
    pub fn exclusions_db(&self, project_root: &Path) -> Option<PathBuf> {
        let path = env_override("COPYVIOS_EXCLUSIONS_DB")
            .map(PathBuf::from)
            .or_else(|| self.search.exclusions_db.clone())?;
        if path.is_absolute() {
            Some(path)
        } else {
            Some(project_root.join(path))
        }
    }

    pub fn min_confidence(&self) -> f64 {
        self.copyvios
            .min_confidence
            .unwrap_or(DEFAULT_MIN_CONFIDENCE)
    }

    pub fn include_min_confidence(&self) -> f64 {
        self.search
            .include_min_confidence
            .unwrap_or(DEFAULT_INCLUDE_MIN_CONFIDENCE)
    }

    pub fn max_queries(&self) -> usize {
        self.copyvios.max_queries.unwrap_or(DEFAULT_MAX_QUERIES)
    }

    pub fn max_time(&self) -> f64 {
        self.copyvios.max_time.unwrap_or(-1.0)
    }

    pub fn url_timeout(&self) -> Duration {
        Duration::from_secs(
            self.copyvios
                .url_timeout
                .unwrap_or(DEFAULT_URL_TIMEOUT_SECS),
        )
    }

    pub fn num_workers(&self) -> usize {
        self.copyvios
            .num_workers
            .unwrap_or(DEFAULT_NUM_WORKERS)
            .max(1)
    }

    pub fn degree(&self) -> usize {
        self.copyvios
            .degree
            .unwrap_or(crate::markov::DEFAULT_DEGREE)
            .max(1)
    }

    pub fn search_delay(&self) -> Duration {
        Duration::from_millis(
            self.search
                .search_delay_ms
                .unwrap_or(DEFAULT_SEARCH_DELAY_MS),
        )
    }

    pub fn result_count(&self) -> usize {
        self.search.result_count.unwrap_or(DEFAULT_RESULT_COUNT).max(1)
    }

    /// Request headers for source fetches and search calls. A User-Agent is
    /// always present.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = self
            .copyvios
            .headers
            .iter()
            .map(|header| (header.name.clone(), header.value.clone()))
            .collect::<Vec<_>>();
        if !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
        {
            headers.push(("User-Agent".to_string(), self.user_agent()));
        }
        headers
    }
}

/// Load and parse a CopyvioConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<CopyvioConfig> {
    if !config_path.exists() {
        return Ok(CopyvioConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: CopyvioConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
