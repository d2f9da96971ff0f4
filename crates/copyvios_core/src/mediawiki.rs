use std::collections::HashMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::CopyvioConfig;

/// The parts of a wiki's `meta=siteinfo` the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub name: String,
    pub lang: String,
    pub domain: String,
    pub script_path: String,
    /// Article path template, e.g. `/wiki/$1`.
    pub article_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    pub url: String,
    pub text: String,
    pub site: SiteInfo,
}

impl Page {
    pub fn new(title: &str, text: &str, site: SiteInfo) -> Self {
        let path = article_path_for(&site.article_path, title);
        Self {
            title: title.to_string(),
            url: format!("https://{}{}", site.domain, path),
            text: text.to_string(),
            site,
        }
    }

    /// Path of this page on its own site, e.g. `/wiki/Foo_bar`.
    pub fn path(&self) -> String {
        article_path_for(&self.site.article_path, &self.title)
    }
}

fn article_path_for(template: &str, title: &str) -> String {
    let encoded = title.trim().replace(' ', "_");
    if template.contains("$1") {
        template.replace("$1", &encoded)
    } else {
        format!("{}/{}", template.trim_end_matches('/'), encoded)
    }
}

/// Read access to wiki pages by site name, used to load exclusion lists.
pub trait WikiPageSource: Send + Sync {
    /// Latest wikitext of `title` on `site_name`, or `None` when the page is missing.
    fn page_text(&self, site_name: &str, title: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &CopyvioConfig) -> Self {
        Self::for_api_url(&config.api_url().unwrap_or_default(), config)
    }

    pub fn for_api_url(api_url: &str, config: &CopyvioConfig) -> Self {
        Self {
            api_url: api_url.to_string(),
            user_agent: config.user_agent(),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    site_info: Option<SiteInfo>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("wiki API URL is not configured (set WIKI_API_URL or [wiki].api_url)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            site_info: None,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn fetch_site_info(&mut self) -> Result<SiteInfo> {
        if let Some(info) = &self.site_info {
            return Ok(info.clone());
        }
        let payload = self.api_query(&[
            ("action", "query"),
            ("meta", "siteinfo"),
            ("siprop", "general"),
        ])?;
        let info = parse_site_info(&payload)?;
        self.site_info = Some(info.clone());
        Ok(info)
    }

    /// Load a page with its latest wikitext. Redirects are followed.
    pub fn fetch_page(&mut self, title: &str) -> Result<Option<Page>> {
        let site = self.fetch_site_info()?;
        let Some((resolved_title, text)) = self.query_content(title)? else {
            return Ok(None);
        };
        Ok(Some(Page::new(&resolved_title, &text, site)))
    }

    pub fn page_text(&mut self, title: &str) -> Result<Option<String>> {
        Ok(self.query_content(title)?.map(|(_, text)| text))
    }

    fn query_content(&mut self, title: &str) -> Result<Option<(String, String)>> {
        let payload = self.api_query(&[
            ("action", "query"),
            ("prop", "revisions"),
            ("rvprop", "content"),
            ("rvslots", "main"),
            ("redirects", "1"),
            ("titles", title),
        ])?;
        Ok(parse_page_content(&payload))
    }

    /// Run one read query, retrying on lag, throttling and transient transport errors.
    fn api_query(&mut self, params: &[(&str, &str)]) -> Result<Value> {
        let url = query_url(&self.config.api_url, params)?;
        let mut attempt = 0;
        loop {
            self.apply_rate_limit();
            debug!(api = %self.config.api_url, attempt, "MediaWiki API request");
            match self.send(&url) {
                ApiAttempt::Payload(payload) => return Ok(payload),
                ApiAttempt::Failed(error) => return Err(error),
                ApiAttempt::Retry { reason, after } => {
                    if attempt >= self.config.max_retries {
                        bail!(
                            "MediaWiki API request failed after {} attempts: {reason}",
                            attempt + 1
                        );
                    }
                    let wait = retry_delay(self.config.retry_delay_ms, attempt, after);
                    debug!(%reason, wait_ms = wait.as_millis(), "retrying MediaWiki API request");
                    sleep(wait);
                    attempt += 1;
                }
            }
        }
    }

    fn send(&self, url: &Url) -> ApiAttempt {
        let response = match self
            .client
            .get(url.clone())
            .header("User-Agent", self.config.user_agent.as_str())
            .send()
        {
            Ok(response) => response,
            Err(error) if is_retryable_error(&error) => {
                return ApiAttempt::Retry {
                    reason: error.to_string(),
                    after: None,
                };
            }
            Err(error) => {
                return ApiAttempt::Failed(
                    anyhow::Error::new(error).context("failed to call MediaWiki API"),
                );
            }
        };

        let status = response.status();
        if !status.is_success() {
            if is_retryable_status(status) {
                return ApiAttempt::Retry {
                    reason: format!("HTTP {status}"),
                    after: retry_after(response.headers()),
                };
            }
            return ApiAttempt::Failed(anyhow::anyhow!(
                "MediaWiki API request failed with HTTP {status}"
            ));
        }

        let after = retry_after(response.headers());
        let payload = match response.json::<Value>() {
            Ok(payload) => payload,
            Err(error) => {
                return ApiAttempt::Failed(
                    anyhow::Error::new(error).context("failed to decode MediaWiki API JSON response"),
                );
            }
        };
        match api_error(&payload) {
            None => ApiAttempt::Payload(payload),
            Some((code, info)) if RETRYABLE_API_ERRORS.contains(&code.as_str()) => ApiAttempt::Retry {
                reason: format!("[{code}] {info}"),
                after,
            },
            Some((code, info)) => {
                ApiAttempt::Failed(anyhow::anyhow!("MediaWiki API error [{code}]: {info}"))
            }
        }
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_read_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

/// API error codes that clear up on their own.
const RETRYABLE_API_ERRORS: &[&str] = &["maxlag", "ratelimited", "readonly"];

/// Lag threshold in seconds sent with every query.
const MAXLAG_SECONDS: &str = "5";

const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

enum ApiAttempt {
    Payload(Value),
    Retry {
        reason: String,
        after: Option<Duration>,
    },
    Failed(anyhow::Error),
}

fn query_url(api_url: &str, params: &[(&str, &str)]) -> Result<Url> {
    let mut url =
        Url::parse(api_url).with_context(|| format!("invalid wiki API URL: {api_url}"))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("format", "json")
            .append_pair("formatversion", "2")
            .append_pair("maxlag", MAXLAG_SECONDS);
        for (key, value) in params {
            if !value.is_empty() {
                pairs.append_pair(key, value);
            }
        }
    }
    Ok(url)
}

/// `(code, info)` of an API-level error in an otherwise successful response.
fn api_error(payload: &Value) -> Option<(String, String)> {
    let error = payload.get("error")?;
    let field = |name: &str, fallback: &str| {
        error
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string()
    };
    Some((field("code", "unknown_error"), field("info", "unknown info")))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Server-requested wait when given, otherwise exponential backoff. Never above a minute.
fn retry_delay(base_ms: u64, attempt: usize, requested: Option<Duration>) -> Duration {
    let wait = requested.unwrap_or_else(|| {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
        Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
    });
    wait.min(MAX_RETRY_WAIT)
}

/// MediaWiki clients keyed by site name, created on first use from `[wiki.sites]`.
pub struct SiteRegistry {
    config: CopyvioConfig,
    clients: Mutex<HashMap<String, MediaWikiClient>>,
}

impl SiteRegistry {
    pub fn new(config: &CopyvioConfig) -> Self {
        Self {
            config: config.clone(),
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl WikiPageSource for SiteRegistry {
    fn page_text(&self, site_name: &str, title: &str) -> Result<Option<String>> {
        let mut clients = self.clients.lock();
        if !clients.contains_key(site_name) {
            let Some(api_url) = self.config.site_api_url(site_name) else {
                bail!("no API URL configured for site {site_name} (add it to [wiki.sites])");
            };
            let client = MediaWikiClient::new(MediaWikiClientConfig::for_api_url(
                &api_url,
                &self.config,
            ))?;
            clients.insert(site_name.to_string(), client);
        }
        let Some(client) = clients.get_mut(site_name) else {
            bail!("MediaWiki client for {site_name} is unavailable");
        };
        client
            .page_text(title)
            .with_context(|| format!("failed to load [[{title}]] from {site_name}"))
    }
}

#[derive(Debug, Deserialize)]
struct SiteInfoResponse {
    query: SiteInfoQuery,
}

#[derive(Debug, Deserialize)]
struct SiteInfoQuery {
    general: GeneralInfo,
}

#[derive(Debug, Deserialize)]
struct GeneralInfo {
    wikiid: String,
    lang: String,
    server: String,
    scriptpath: String,
    articlepath: String,
}

fn parse_site_info(payload: &Value) -> Result<SiteInfo> {
    let parsed: SiteInfoResponse = serde_json::from_value(payload.clone())
        .context("failed to decode siteinfo response")?;
    let general = parsed.query.general;
    let server = if general.server.starts_with("//") {
        format!("https:{}", general.server)
    } else {
        general.server
    };
    let domain = Url::parse(&server)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| anyhow::anyhow!("siteinfo returned an unusable server: {server}"))?;
    Ok(SiteInfo {
        name: general.wikiid,
        lang: general.lang,
        domain,
        script_path: general.scriptpath,
        article_path: general.articlepath,
    })
}

fn parse_page_content(payload: &Value) -> Option<(String, String)> {
    let page = payload.get("query")?.get("pages")?.as_array()?.first()?;
    if page.get("missing").and_then(Value::as_bool).unwrap_or(false)
        || page.get("invalid").and_then(Value::as_bool).unwrap_or(false)
    {
        return None;
    }
    let title = page.get("title")?.as_str()?.to_string();
    let revision = page.get("revisions")?.as_array()?.first()?;
    let content = revision
        .get("slots")
        .and_then(|slots| slots.get("main"))
        .and_then(|main| main.get("content"))
        .or_else(|| revision.get("content"))?
        .as_str()?
        .to_string();
    Some((title, content))
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn site() -> SiteInfo {
        SiteInfo {
            name: "enwiki".to_string(),
            lang: "en".to_string(),
            domain: "en.example.org".to_string(),
            script_path: "/w".to_string(),
            article_path: "/wiki/$1".to_string(),
        }
    }

    #[test]
    fn page_url_uses_article_path() {
        let page = Page::new("Foo bar", "text", site());
        assert_eq!(page.path(), "/wiki/Foo_bar");
        assert_eq!(page.url, "https://en.example.org/wiki/Foo_bar");
    }

    #[test]
    fn site_info_is_parsed_from_general_block() {
        let payload = json!({
            "query": {
                "general": {
                    "wikiid": "enwiki",
                    "lang": "en",
                    "server": "//en.example.org",
                    "scriptpath": "/w",
                    "articlepath": "/wiki/$1"
                }
            }
        });
        let info = parse_site_info(&payload).expect("site info");
        assert_eq!(info, site());
    }

    #[test]
    fn page_content_reads_main_slot() {
        let payload = json!({
            "query": {
                "pages": [{
                    "title": "Foo",
                    "revisions": [{"slots": {"main": {"content": "'''Foo''' is a thing."}}}]
                }]
            }
        });
        let (title, text) = parse_page_content(&payload).expect("content");
        assert_eq!(title, "Foo");
        assert_eq!(text, "'''Foo''' is a thing.");
    }

    #[test]
    fn missing_page_has_no_content() {
        let payload = json!({"query": {"pages": [{"title": "Nope", "missing": true}]}});
        assert!(parse_page_content(&payload).is_none());
    }

    #[test]
    fn query_url_carries_format_and_lag_parameters() {
        let url = query_url(
            "https://en.example.org/w/api.php",
            &[("action", "query"), ("titles", "Foo & bar"), ("empty", "")],
        )
        .expect("url");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("format"), Some("json"));
        assert_eq!(get("formatversion"), Some("2"));
        assert_eq!(get("maxlag"), Some(MAXLAG_SECONDS));
        assert_eq!(get("titles"), Some("Foo & bar"));
        assert_eq!(get("empty"), None);
        assert!(query_url("not a url", &[]).is_err());
    }

    #[test]
    fn api_errors_are_classified() {
        let lagged = json!({"error": {"code": "maxlag", "info": "Waiting for db1: 7 seconds lagged"}});
        let (code, info) = api_error(&lagged).expect("error");
        assert!(RETRYABLE_API_ERRORS.contains(&code.as_str()));
        assert!(info.contains("lagged"));

        let denied = json!({"error": {"code": "readapidenied"}});
        let (code, info) = api_error(&denied).expect("error");
        assert!(!RETRYABLE_API_ERRORS.contains(&code.as_str()));
        assert_eq!(info, "unknown info");

        assert!(api_error(&json!({"query": {}})).is_none());
    }

    #[test]
    fn retry_waits_honor_server_hint_and_cap() {
        assert_eq!(retry_delay(500, 0, None), Duration::from_millis(500));
        assert_eq!(retry_delay(500, 2, None), Duration::from_millis(2_000));
        assert_eq!(retry_delay(500, 2, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(retry_delay(500, 40, None), MAX_RETRY_WAIT);
        assert_eq!(retry_delay(0, 0, Some(Duration::from_secs(3_600))), MAX_RETRY_WAIT);

        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().expect("header value"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn registry_rejects_unknown_site() {
        let registry = SiteRegistry::new(&CopyvioConfig::default());
        let error = registry
            .page_text("nowhere", "Some page")
            .expect_err("unknown site must fail");
        assert!(error.to_string().contains("nowhere"));
    }
}
