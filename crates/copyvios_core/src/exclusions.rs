use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::Url;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::mediawiki::{Page, WikiPageSource};
use crate::parsers::LazyRegex;

const EXCLUSIONS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    source_sitename TEXT NOT NULL,
    source_page TEXT NOT NULL,
    PRIMARY KEY (source_sitename, source_page)
);

CREATE TABLE IF NOT EXISTS updates (
    update_sitename TEXT PRIMARY KEY,
    update_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS exclusions (
    exclusion_sitename TEXT NOT NULL,
    exclusion_url TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exclusions_sitename ON exclusions(exclusion_sitename);
"#;

/// Pseudo-site whose exclusions apply to every wiki.
pub const ALL_SITES: &str = "all";

const EARWIGBOT_SOURCE: &str = "User:EarwigBot/Copyvios/Exclusions";
const ERANBOT_SOURCE: &str = "User:EranBot/Copyright/Blacklist";

const DEFAULT_SOURCES: &[(&str, &str)] = &[
    (ALL_SITES, EARWIGBOT_SOURCE),
    (ALL_SITES, ERANBOT_SOURCE),
    ("enwiki", "Wikipedia:Mirrors and forks/ABC"),
    ("enwiki", "Wikipedia:Mirrors and forks/DEF"),
    ("enwiki", "Wikipedia:Mirrors and forks/GHI"),
    ("enwiki", "Wikipedia:Mirrors and forks/JKL"),
    ("enwiki", "Wikipedia:Mirrors and forks/MNO"),
    ("enwiki", "Wikipedia:Mirrors and forks/PQRS"),
    ("enwiki", "Wikipedia:Mirrors and forks/TUV"),
    ("enwiki", "Wikipedia:Mirrors and forks/WXYZ"),
];

const SITE_MAX_AGE: Duration = Duration::from_secs(48 * 60 * 60);
const ALL_SITES_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteSyncReport {
    pub site: String,
    pub refreshed: bool,
    pub added: usize,
    pub removed: usize,
    /// Seconds since the previous update, if there was one.
    pub age_secs: Option<u64>,
}

/// Store of URL patterns for known wiki mirrors, refreshed from on-wiki lists.
pub struct ExclusionsDb {
    connection: Mutex<Connection>,
    source: Arc<dyn WikiPageSource>,
    all_sites_host: String,
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl ExclusionsDb {
    pub fn open(
        path: &Path,
        source: Arc<dyn WikiPageSource>,
        all_sites_host: &str,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory {}", parent.display())
            })?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Self::from_connection(connection, source, all_sites_host)
    }

    pub fn open_in_memory(source: Arc<dyn WikiPageSource>, all_sites_host: &str) -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory exclusions db")?;
        Self::from_connection(connection, source, all_sites_host)
    }

    fn from_connection(
        connection: Connection,
        source: Arc<dyn WikiPageSource>,
        all_sites_host: &str,
    ) -> Result<Self> {
        let fresh = !table_exists(&connection, "sources")?;
        connection
            .execute_batch(EXCLUSIONS_SCHEMA_SQL)
            .context("failed to initialize exclusions schema")?;
        if fresh {
            for (site, page) in DEFAULT_SOURCES {
                connection
                    .execute(
                        "INSERT OR IGNORE INTO sources (source_sitename, source_page) VALUES (?1, ?2)",
                        params![site, page],
                    )
                    .context("failed to seed exclusion sources")?;
            }
            info!("created exclusions database");
        }
        Ok(Self {
            connection: Mutex::new(connection),
            source,
            all_sites_host: all_sites_host.to_string(),
            compiled: Mutex::new(HashMap::new()),
        })
    }

    /// Register another on-wiki exclusion list. Returns false if it was already known.
    pub fn add_source(&self, site: &str, page: &str) -> Result<bool> {
        let connection = self.connection.lock();
        let inserted = connection
            .execute(
                "INSERT OR IGNORE INTO sources (source_sitename, source_page) VALUES (?1, ?2)",
                params![site, page],
            )
            .context("failed to add exclusion source")?;
        Ok(inserted > 0)
    }

    pub fn sources(&self, site: &str) -> Result<Vec<String>> {
        let connection = self.connection.lock();
        load_column(
            &connection,
            "SELECT source_page FROM sources WHERE source_sitename = ?1 ORDER BY source_page",
            site,
        )
    }

    pub fn list_exclusions(&self, site: &str) -> Result<Vec<String>> {
        let connection = self.connection.lock();
        load_column(
            &connection,
            "SELECT exclusion_url FROM exclusions WHERE exclusion_sitename = ?1 ORDER BY exclusion_url",
            site,
        )
    }

    /// Unix time of the last successful update for `site`.
    pub fn last_update(&self, site: &str) -> Result<Option<u64>> {
        let connection = self.connection.lock();
        let value: Option<i64> = connection
            .query_row(
                "SELECT update_time FROM updates WHERE update_sitename = ?1",
                [site],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read exclusions update time")?;
        Ok(value.and_then(|value| u64::try_from(value).ok()))
    }

    /// Refresh `site` if stale (or `force`), then do the same for the shared list.
    pub fn sync(&self, site: &str, force: bool) -> Result<Vec<SiteSyncReport>> {
        let mut reports = vec![self.sync_site(site, force)?];
        if site != ALL_SITES {
            reports.push(self.sync_site(ALL_SITES, force)?);
        }
        Ok(reports)
    }

    fn sync_site(&self, site: &str, force: bool) -> Result<SiteSyncReport> {
        let max_age = if site == ALL_SITES {
            ALL_SITES_MAX_AGE
        } else {
            SITE_MAX_AGE
        };
        let now = unix_timestamp()?;
        let age_secs = self
            .last_update(site)?
            .map(|updated| now.saturating_sub(updated));
        let stale = age_secs.is_none_or(|age| age > max_age.as_secs());
        if !force && !stale {
            debug!(site, age_secs, "exclusions database is still fresh");
            return Ok(SiteSyncReport {
                site: site.to_string(),
                refreshed: false,
                added: 0,
                removed: 0,
                age_secs,
            });
        }

        info!(site, age_secs, "updating stale exclusions database");
        let host = if site == ALL_SITES {
            self.all_sites_host.as_str()
        } else {
            site
        };
        let mut patterns = BTreeSet::new();
        for page in self.sources(site)? {
            let Some(text) = self.source.page_text(host, &page)? else {
                debug!(site, %page, "exclusion source page is missing");
                continue;
            };
            patterns.extend(extract_patterns(&page, &text));
        }

        let mut connection = self.connection.lock();
        let tx = connection
            .transaction()
            .context("failed to start exclusions transaction")?;
        let stored = load_column(
            &tx,
            "SELECT exclusion_url FROM exclusions WHERE exclusion_sitename = ?1",
            site,
        )?
        .into_iter()
        .collect::<BTreeSet<_>>();

        let mut removed = 0usize;
        for url in stored.difference(&patterns) {
            removed += tx
                .execute(
                    "DELETE FROM exclusions WHERE exclusion_sitename = ?1 AND exclusion_url = ?2",
                    params![site, url],
                )
                .context("failed to delete stale exclusion")?;
        }
        let mut added = 0usize;
        for url in patterns.difference(&stored) {
            tx.execute(
                "INSERT INTO exclusions (exclusion_sitename, exclusion_url) VALUES (?1, ?2)",
                params![site, url],
            )
            .context("failed to insert exclusion")?;
            added += 1;
        }
        tx.execute(
            "INSERT INTO updates (update_sitename, update_time) VALUES (?1, ?2)
             ON CONFLICT(update_sitename) DO UPDATE SET update_time = excluded.update_time",
            params![site, i64::try_from(now).unwrap_or(i64::MAX)],
        )
        .context("failed to record exclusions update time")?;
        tx.commit().context("failed to commit exclusions update")?;

        info!(site, added, removed, "exclusions database updated");
        Ok(SiteSyncReport {
            site: site.to_string(),
            refreshed: true,
            added,
            removed,
            age_secs,
        })
    }

    /// Whether `url` matches a stored exclusion for `site` or for every site.
    pub fn check(&self, site: &str, url: &str) -> Result<bool> {
        let lowered = url.trim().to_lowercase();
        let normalized = strip_scheme_and_www(&lowered);
        let parsed = Url::parse(&lowered).ok();

        let patterns = {
            let connection = self.connection.lock();
            let mut statement = connection
                .prepare(
                    "SELECT exclusion_url FROM exclusions
                     WHERE exclusion_sitename = ?1 OR exclusion_sitename = ?2",
                )
                .context("failed to prepare exclusions lookup")?;
            let rows = statement
                .query_map(params![site, ALL_SITES], |row| row.get::<_, String>(0))
                .context("failed to query exclusions")?;
            let mut patterns = Vec::new();
            for row in rows {
                patterns.push(row.context("failed to decode exclusion row")?);
            }
            patterns
        };

        for pattern in patterns {
            let matched = if let Some(domain_pattern) = pattern.strip_prefix("*.") {
                parsed
                    .as_ref()
                    .is_some_and(|parsed| matches_domain_pattern(parsed, domain_pattern))
            } else if let Some(expression) = pattern.strip_prefix("re:") {
                self.regex_matches(expression, normalized)
            } else {
                normalized.starts_with(pattern.as_str())
            };
            if matched {
                debug!(url, %pattern, "URL is excluded");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn regex_matches(&self, expression: &str, normalized: &str) -> bool {
        let mut compiled = self.compiled.lock();
        let regex = compiled
            .entry(expression.to_string())
            .or_insert_with(|| match Regex::new(&format!("(?i)^(?:{expression})")) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    debug!(expression, %error, "skipping invalid exclusion regex");
                    None
                }
            });
        regex.as_ref().is_some_and(|regex| regex.is_match(normalized))
    }

    pub fn get_mirror_hints(&self, page: &Page) -> Vec<String> {
        mirror_hints(page, true)
    }
}

/// URL fragments that identify copies of `page`'s wiki (scripts and the page itself).
pub fn mirror_hints(page: &Page, try_mobile: bool) -> Vec<String> {
    static DOMAIN_PARTS: LazyRegex = LazyRegex::new(r"^(\w+)\.(\w+)\.(\w+)$");
    let site = &page.site;
    let mut roots = vec![site.domain.clone()];
    if try_mobile {
        let mobile = DOMAIN_PARTS
            .get()
            .and_then(|pattern| pattern.captures(&site.domain))
            .map(|parts| format!("{}.m.{}.{}", &parts[1], &parts[2], &parts[3]));
        roots.extend(mobile);
    }

    let path = page.path();
    let mut hints = Vec::new();
    for root in &roots {
        for script in ["index.php", "load.php", "api.php"] {
            hints.push(format!("{root}{}/{script}", site.script_path));
        }
    }
    for root in &roots {
        hints.push(format!("{root}{path}"));
    }
    hints
}

/// Pull URL patterns out of one exclusion source page.
pub fn extract_patterns(page_title: &str, text: &str) -> Vec<String> {
    static STRUCTURED: LazyRegex = LazyRegex::new(
        r"^\s*url\s*=\s*(?:<nowiki>\s*)?(.+?)\s*(?:</nowiki>\s*)?(?:\s+\|.*)?$",
    );
    static BLACKLIST_COMMENT: LazyRegex = LazyRegex::new(r"(#|==).*$");
    static MIRROR_LINE: LazyRegex =
        LazyRegex::new(r"^(\s*\|?\s*url\s*=)|(\*?\{\{\s*mirror link)");
    static MIRROR_FIELD: LazyRegex = LazyRegex::new(
        r"(?i)\burl\s*=\s*(?:<nowiki>\s*)?(?:https?:)?(?://)?([^\s\[\]<>{}()|]+)",
    );
    static MIRROR_URL: LazyRegex = LazyRegex::new(r"(https?://.+?)(?:[ \[\]<>{}()]|$)");

    let mut patterns = Vec::new();
    match page_title {
        EARWIGBOT_SOURCE => {
            let Some(structured) = STRUCTURED.get() else {
                return patterns;
            };
            for line in text.lines() {
                if let Some(found) = structured.captures(line).and_then(|caps| caps.get(1)) {
                    patterns.push(strip_scheme_and_www(&found.as_str().to_lowercase()).to_string());
                }
            }
        }
        ERANBOT_SOURCE => {
            for line in text.lines().skip(1) {
                let cleaned = BLACKLIST_COMMENT.replace_all(line, "");
                let cleaned = cleaned.trim();
                if !cleaned.is_empty() {
                    patterns.push(format!("re:{cleaned}"));
                }
            }
        }
        _ => {
            let (Some(field_pattern), Some(url_pattern)) = (MIRROR_FIELD.get(), MIRROR_URL.get()) else {
                return patterns;
            };
            for line in text.lines() {
                if !MIRROR_LINE.is_match(&line.to_lowercase()) {
                    continue;
                }
                // `url =` values may omit the scheme; bare links on the line count only without one.
                let mut found = field_pattern
                    .captures_iter(line)
                    .filter_map(|captures| captures.get(1))
                    .map(|url| url.as_str())
                    .collect::<Vec<_>>();
                if found.is_empty() {
                    found = url_pattern
                        .captures_iter(line)
                        .filter_map(|captures| captures.get(1))
                        .map(|url| url.as_str())
                        .collect();
                }
                for url in found {
                    patterns.push(strip_scheme_and_www(&url.to_lowercase()).to_string());
                }
            }
        }
    }
    patterns.retain(|pattern| !pattern.is_empty());
    patterns
}

fn strip_scheme_and_www(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme)
}

/// `domain[/path]` matches the domain itself or any subdomain, then an optional path prefix.
fn matches_domain_pattern(url: &Url, pattern: &str) -> bool {
    let (domain, path) = match pattern.split_once('/') {
        Some((domain, path)) => (domain, Some(path)),
        None => (pattern, None),
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let domain_matches = host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'));
    if !domain_matches {
        return false;
    }
    match path {
        Some(path) => url
            .path()
            .trim_start_matches('/')
            .starts_with(path.trim_end_matches('*')),
        None => true,
    }
}

fn load_column(connection: &Connection, sql: &str, site: &str) -> Result<Vec<String>> {
    let mut statement = connection
        .prepare(sql)
        .with_context(|| format!("failed to prepare query: {sql}"))?;
    let rows = statement
        .query_map([site], |row| row.get::<_, String>(0))
        .with_context(|| format!("failed to run query: {sql}"))?;
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to decode row")?);
    }
    Ok(values)
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;
    use crate::mediawiki::SiteInfo;

    #[derive(Default)]
    struct MockPages {
        pages: HashMap<(String, String), String>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl MockPages {
        fn with(mut self, site: &str, title: &str, text: &str) -> Self {
            self.pages
                .insert((site.to_string(), title.to_string()), text.to_string());
            self
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl WikiPageSource for MockPages {
        fn page_text(&self, site_name: &str, title: &str) -> Result<Option<String>> {
            self.requests
                .lock()
                .push((site_name.to_string(), title.to_string()));
            Ok(self
                .pages
                .get(&(site_name.to_string(), title.to_string()))
                .cloned())
        }
    }

    fn mock_source() -> Arc<MockPages> {
        Arc::new(
            MockPages::default()
                .with(
                    "enwiki",
                    EARWIGBOT_SOURCE,
                    "url = <nowiki>https://www.Mirror-One.example/wiki/</nowiki>\n  url = *.mirror.example.com | reason\nnot a pattern",
                )
                .with(
                    "enwiki",
                    ERANBOT_SOURCE,
                    "header line\nforks?\\.example\\.net # comment\n== section ==\n[invalid(\n",
                )
                .with(
                    "enwiki",
                    "Wikipedia:Mirrors and forks/ABC",
                    "{{mirror link|url=http://abc-copies.example.org/wiki/}}\n|url=https://www.reused.example/articles/ plus text\n| url = plain-mirror.example/pages/\n{{mirror link|url=//relative.example/}}\nunrelated https://ignored.example/",
                ),
        )
    }

    fn page() -> Page {
        Page::new(
            "Foo",
            "",
            SiteInfo {
                name: "enwiki".to_string(),
                lang: "en".to_string(),
                domain: "en.example.org".to_string(),
                script_path: "/w".to_string(),
                article_path: "/wiki/$1".to_string(),
            },
        )
    }

    #[test]
    fn new_database_is_seeded_with_default_sources() {
        let db = ExclusionsDb::open_in_memory(mock_source(), "enwiki").expect("open");
        assert_eq!(
            db.sources(ALL_SITES).expect("sources"),
            vec![EARWIGBOT_SOURCE, ERANBOT_SOURCE]
        );
        assert_eq!(db.sources("enwiki").expect("sources").len(), 8);
        assert!(!db.add_source("enwiki", "Wikipedia:Mirrors and forks/ABC").expect("add"));
        assert!(db.add_source("dewiki", "Wikipedia:Mirrors").expect("add"));
    }

    #[test]
    fn extract_patterns_handles_each_source_format() {
        let source = mock_source();
        let earwig = extract_patterns(
            EARWIGBOT_SOURCE,
            &source.pages[&("enwiki".to_string(), EARWIGBOT_SOURCE.to_string())],
        );
        assert_eq!(earwig, vec!["mirror-one.example/wiki/", "*.mirror.example.com"]);

        let eran = extract_patterns(
            ERANBOT_SOURCE,
            &source.pages[&("enwiki".to_string(), ERANBOT_SOURCE.to_string())],
        );
        assert_eq!(eran, vec!["re:forks?\\.example\\.net", "re:[invalid("]);

        let generic = extract_patterns(
            "Wikipedia:Mirrors and forks/ABC",
            &source.pages[&(
                "enwiki".to_string(),
                "Wikipedia:Mirrors and forks/ABC".to_string(),
            )],
        );
        assert_eq!(
            generic,
            vec![
                "abc-copies.example.org/wiki/",
                "reused.example/articles/",
                "plain-mirror.example/pages/",
                "relative.example/",
            ]
        );
    }

    #[test]
    fn sync_cascades_and_respects_staleness() {
        let source = mock_source();
        let db = ExclusionsDb::open_in_memory(source.clone(), "enwiki").expect("open");
        let reports = db.sync("enwiki", false).expect("sync");
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|report| report.refreshed));
        assert_eq!(source.request_count(), 10);
        assert!(db.last_update("enwiki").expect("last update").is_some());
        assert!(db.last_update(ALL_SITES).expect("last update").is_some());

        let again = db.sync("enwiki", false).expect("second sync");
        assert!(again.iter().all(|report| !report.refreshed));
        assert_eq!(source.request_count(), 10);

        let forced = db.sync(ALL_SITES, true).expect("forced sync");
        assert_eq!(forced.len(), 1);
        assert!(forced[0].refreshed);
        assert_eq!(forced[0].added, 0);
        assert_eq!(source.request_count(), 12);
    }

    #[test]
    fn sync_removes_patterns_that_disappeared() {
        let db = ExclusionsDb::open_in_memory(mock_source(), "enwiki").expect("open");
        db.sync(ALL_SITES, false).expect("sync");
        assert_eq!(db.list_exclusions(ALL_SITES).expect("list").len(), 4);

        let emptied = Arc::new(MockPages::default());
        let db = ExclusionsDb {
            source: emptied,
            ..db
        };
        let reports = db.sync(ALL_SITES, true).expect("sync");
        assert_eq!(reports[0].removed, 4);
        assert!(db.list_exclusions(ALL_SITES).expect("list").is_empty());
    }

    #[test]
    fn check_supports_prefix_regex_and_domain_patterns() {
        let db = ExclusionsDb::open_in_memory(mock_source(), "enwiki").expect("open");
        db.sync("enwiki", false).expect("sync");

        assert!(db.check("enwiki", "http://www.mirror-one.example/wiki/Foo").expect("check"));
        assert!(db.check("enwiki", "https://deep.sub.mirror.example.com/page").expect("check"));
        assert!(db.check("enwiki", "https://mirror.example.com/").expect("check"));
        assert!(!db.check("enwiki", "https://notmirror.example.com/").expect("check"));
        assert!(db.check("enwiki", "https://fork.example.net/x").expect("check"));
        assert!(db.check("enwiki", "https://reused.example/articles/Foo").expect("check"));
        assert!(db.check("enwiki", "http://plain-mirror.example/pages/Foo").expect("check"));
        assert!(!db.check("enwiki", "https://unrelated.example.org/").expect("check"));
        assert!(!db.check("dewiki", "https://reused.example/articles/Foo").expect("check"));
    }

    #[test]
    fn domain_pattern_with_path() {
        let url = Url::parse("https://news.example.com/archive/2020/story").expect("url");
        assert!(matches_domain_pattern(&url, "example.com/archive/*"));
        assert!(!matches_domain_pattern(&url, "example.com/blog"));
    }

    #[test]
    fn mirror_hints_include_scripts_and_page_path() {
        let hints = mirror_hints(&page(), true);
        assert!(hints.contains(&"en.example.org/w/index.php".to_string()));
        assert!(hints.contains(&"en.example.org/wiki/Foo".to_string()));
        assert!(hints.contains(&"en.m.example.org/w/api.php".to_string()));
        assert!(hints.contains(&"en.m.example.org/wiki/Foo".to_string()));
        assert_eq!(hints.len(), 8);
        assert_eq!(mirror_hints(&page(), false).len(), 4);
    }

    #[test]
    fn database_persists_on_disk() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("exclusions.db");
        {
            let db = ExclusionsDb::open(&path, mock_source(), "enwiki").expect("open");
            db.sync(ALL_SITES, false).expect("sync");
        }
        let reopened = ExclusionsDb::open(&path, Arc::new(MockPages::default()), "enwiki")
            .expect("reopen");
        assert_eq!(reopened.list_exclusions(ALL_SITES).expect("list").len(), 4);
        assert_eq!(reopened.sources(ALL_SITES).expect("sources").len(), 2);
    }
}
