use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::CopyvioConfig;
use crate::exclusions::ExclusionsDb;
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::markov::MarkovChain;
use crate::mediawiki::Page;
use crate::parsers::{ArticleTextParser, ChunkOptions, ParserArgs, ParserRegistry, SentenceTokenizer};
use crate::result::CopyvioCheckResult;
use crate::search::{SearchEngine, get_search_engine};
use crate::workspace::{CopyvioWorkspace, ExclusionCheck, WorkspaceOptions};

/// Articles with fewer n-grams than this are never worth checking.
pub const AUTO_FAIL_SIZE: usize = 20;

const COMPARE_MAX_TIME: f64 = 30.0;
const COMPARE_MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOptions {
    pub max_queries: usize,
    /// Seconds; zero or negative means no deadline.
    pub max_time: f64,
    pub no_searches: bool,
    pub no_links: bool,
    pub short_circuit: bool,
}

impl CheckOptions {
    pub fn from_config(config: &CopyvioConfig) -> Self {
        Self {
            max_queries: config.max_queries(),
            max_time: config.max_time(),
            no_searches: false,
            no_links: false,
            short_circuit: true,
        }
    }
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self::from_config(&CopyvioConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareOptions {
    pub max_time: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            max_time: COMPARE_MAX_TIME,
        }
    }
}

/// Runs copyvio checks for one page.
pub struct CopyvioChecker {
    page: Page,
    config: CopyvioConfig,
    exclusions: Option<Arc<ExclusionsDb>>,
    engine: Option<Arc<dyn SearchEngine>>,
    fetcher: Arc<dyn SourceFetcher>,
    parsers: Arc<ParserRegistry>,
    tokenizer: Option<SentenceTokenizer>,
}

impl CopyvioChecker {
    pub fn new(page: Page, config: CopyvioConfig) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(&config)?;
        Ok(Self {
            page,
            config,
            exclusions: None,
            engine: None,
            fetcher: Arc::new(fetcher),
            parsers: Arc::new(ParserRegistry::with_defaults()),
            tokenizer: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Use this engine instead of the one named in the config.
    pub fn with_search_engine(mut self, engine: Arc<dyn SearchEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_exclusions(mut self, exclusions: Arc<ExclusionsDb>) -> Self {
        self.exclusions = Some(exclusions);
        self
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = Arc::new(parsers);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: SentenceTokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn article_parser(&self) -> Result<ArticleTextParser> {
        let tokenizer = match (&self.tokenizer, &self.config.search.nltk_dir) {
            (Some(tokenizer), _) => tokenizer.clone(),
            (None, Some(dir)) => SentenceTokenizer::load(dir, &self.page.site.lang)
                .context("failed to load sentence tokenizer data")?,
            (None, None) => SentenceTokenizer::english(),
        };
        Ok(ArticleTextParser::new(&self.page.text, tokenizer))
    }

    fn search_engine(&self) -> Result<Arc<dyn SearchEngine>> {
        if let Some(engine) = &self.engine {
            return Ok(Arc::clone(engine));
        }
        let engine = get_search_engine(&self.config, &self.config.headers())?;
        Ok(Arc::from(engine))
    }

    fn workspace_options(&self, max_time: f64, num_workers: usize, short_circuit: bool) -> WorkspaceOptions {
        WorkspaceOptions {
            min_confidence: self.config.min_confidence(),
            include_min_confidence: self.config.include_min_confidence(),
            max_time,
            num_workers,
            short_circuit,
            url_timeout: self.config.url_timeout(),
            headers: self.config.headers(),
            parser_args: ParserArgs::default(),
            exclusion_check: None,
        }
    }

    /// Look for copied text using the page's external links and web searches
    /// for chunks of its prose.
    pub fn run_check(&self, options: &CheckOptions) -> Result<CopyvioCheckResult> {
        let started = Instant::now();
        info!(title = %self.page.title, "starting copyvio check");

        let engine = if options.no_searches {
            None
        } else {
            Some(self.search_engine()?)
        };
        let parser = self.article_parser()?;
        let article = MarkovChain::new(parser.strip(), self.config.degree());
        if article.size() < AUTO_FAIL_SIZE {
            let result = CopyvioCheckResult::empty(Arc::new(article), 0, started.elapsed());
            info!("{}", result.log_message(&self.page.title));
            return Ok(result);
        }

        let mut workspace_options =
            self.workspace_options(options.max_time, self.config.num_workers(), options.short_circuit);
        if let Some(exclusions) = &self.exclusions {
            let site = self.page.site.name.clone();
            if let Err(error) = exclusions.sync(&site, false) {
                warn!(%site, error = %format!("{error:#}"), "exclusions sync failed; using stored patterns");
            }
            workspace_options.parser_args.mirror_hints = exclusions.get_mirror_hints(&self.page);
            let db = Arc::clone(exclusions);
            let check: ExclusionCheck = Arc::new(move |url: &str| match db.check(&site, url) {
                Ok(excluded) => excluded,
                Err(error) => {
                    warn!(url, error = %format!("{error:#}"), "exclusion lookup failed");
                    false
                }
            });
            workspace_options.exclusion_check = Some(check);
        }

        let workspace = CopyvioWorkspace::new(
            article,
            workspace_options,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.parsers),
        )?;

        if !options.no_links {
            workspace.enqueue(parser.get_links());
        }

        let mut queries = 0usize;
        if let Some(engine) = engine {
            let chunks = parser.chunk(options.max_queries, &ChunkOptions::default());
            let delay = self.config.search_delay();
            for chunk in chunks {
                // The pause between queries ends early if a source crosses the threshold.
                if queries > 0 && !delay.is_zero() {
                    workspace.wait_for_finish(delay);
                }
                if options.short_circuit && workspace.finished() {
                    workspace.set_possible_miss();
                    break;
                }
                debug!(title = %self.page.title, engine = engine.name(), %chunk, "querying search engine");
                queries += 1;
                match engine.search(&chunk) {
                    Ok(urls) => workspace.enqueue(urls),
                    Err(error) => warn!(engine = engine.name(), %error, "search query failed"),
                }
            }
        }

        workspace.wait();
        let result = workspace.get_result(queries);
        info!("{}", result.log_message(&self.page.title));
        Ok(result)
    }

    /// Compare the page against known URLs only. Never short-circuits.
    pub fn run_compare<S: AsRef<str>>(
        &self,
        urls: &[S],
        options: &CompareOptions,
    ) -> Result<CopyvioCheckResult> {
        info!(title = %self.page.title, urls = urls.len(), "starting copyvio compare");
        let parser = self.article_parser()?;
        let article = MarkovChain::new(parser.strip(), self.config.degree());
        let num_workers = urls.len().clamp(1, COMPARE_MAX_WORKERS);
        let workspace = CopyvioWorkspace::new(
            article,
            self.workspace_options(options.max_time, num_workers, false),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.parsers),
        )?;
        workspace.enqueue(urls.iter().map(|url| url.as_ref()));
        workspace.wait();
        let result = workspace.get_result(0);
        info!("{}", result.log_message(&self.page.title));
        Ok(result)
    }
}
