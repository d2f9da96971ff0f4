//! Concurrent fetch-and-compare core.
//!
//! Candidate sources are partitioned by registered domain. Each domain gets
//! a FIFO queue, and the first source seen for a domain announces that queue
//! on a channel that idle workers block on. A worker drains one domain queue
//! at a time, so a single host never sees more than one connection from a
//! check while other domains proceed in parallel.
//!
//! Workers are either spawned per workspace ("local") or shared by every
//! workspace in the process ("global", see [`globalize`]).

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use reqwest::Url;
use tracing::{debug, error, info, info_span, warn};

use crate::error::{FetchError, ParserError, SourceError};
use crate::fetch::{FetchRequest, SourceFetcher};
use crate::markov::{MarkovChain, intersection};
use crate::parsers::{ParseContext, ParserArgs, ParserRegistry};
use crate::result::{CopyvioCheckResult, ResultThresholds, SourceSummary};

/// Viewer-page redirects followed before a source is given up on.
pub const MAX_REDIRECTS: usize = 3;

/// Decides whether a URL is a known mirror and must not be fetched.
pub type ExclusionCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pending,
    InProgress,
    Done,
}

/// A one-shot signal that any number of threads can wait on.
struct Event {
    set: Mutex<bool>,
    signal: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.signal.notify_all();
    }

    /// True once set; false if `deadline` passed first.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut set = self.set.lock();
        while !*set {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut set, deadline).timed_out() {
                        return *set;
                    }
                }
                None => self.signal.wait(&mut set),
            }
        }
        true
    }
}

struct SourceInner {
    state: SourceState,
    skipped: bool,
    excluded: bool,
    confidence: f64,
    chains: Option<(Arc<MarkovChain>, Arc<MarkovChain>)>,
}

/// One candidate URL under evaluation.
pub struct CopyvioSource {
    url: String,
    domain: String,
    inner: Mutex<SourceInner>,
    claimed: Event,
    finished: Event,
}

impl CopyvioSource {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            domain: registered_domain(url),
            inner: Mutex::new(SourceInner {
                state: SourceState::Pending,
                skipped: false,
                excluded: false,
                confidence: 0.0,
                chains: None,
            }),
            claimed: Event::new(),
            finished: Event::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn state(&self) -> SourceState {
        self.inner.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state() == SourceState::Done
    }

    pub fn skipped(&self) -> bool {
        self.inner.lock().skipped
    }

    pub fn excluded(&self) -> bool {
        self.inner.lock().excluded
    }

    pub fn confidence(&self) -> f64 {
        self.inner.lock().confidence
    }

    /// Claim the source for a worker. Fails if it was skipped or already claimed.
    fn start_work(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SourceState::Pending {
            return false;
        }
        inner.state = SourceState::InProgress;
        self.claimed.set();
        true
    }

    /// Give up on the source. A source already being fetched keeps running
    /// but is reported as skipped; a finished one is left alone.
    pub fn skip(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            SourceState::Pending => {
                inner.state = SourceState::Done;
                inner.skipped = true;
                self.finished.set();
            }
            SourceState::InProgress => inner.skipped = true,
            SourceState::Done => {}
        }
    }

    fn exclude(&self) {
        let mut inner = self.inner.lock();
        inner.state = SourceState::Done;
        inner.excluded = true;
        inner.skipped = true;
        inner.confidence = 0.0;
        drop(inner);
        self.claimed.set();
        self.finished.set();
    }

    fn fail(&self) {
        let mut inner = self.inner.lock();
        inner.state = SourceState::Done;
        inner.skipped = true;
        inner.confidence = 0.0;
        drop(inner);
        self.finished.set();
    }

    fn complete(&self, confidence: f64, chains: Option<(Arc<MarkovChain>, Arc<MarkovChain>)>) {
        let mut inner = self.inner.lock();
        inner.state = SourceState::Done;
        inner.confidence = confidence;
        inner.chains = chains;
        drop(inner);
        self.finished.set();
    }

    /// Block until the source has been claimed by a worker or finished.
    pub fn wait_claimed(&self, deadline: Option<Instant>) -> bool {
        self.claimed.wait(deadline) || self.is_done()
    }

    /// Block until the source is finished or `deadline` passes.
    pub fn join(&self, deadline: Option<Instant>) -> bool {
        self.finished.wait(deadline)
    }

    pub fn summary(&self) -> SourceSummary {
        let inner = self.inner.lock();
        let (source_size, delta_size) = inner
            .chains
            .as_ref()
            .map_or((0, 0), |(source, delta)| (source.size(), delta.size()));
        SourceSummary {
            url: self.url.clone(),
            domain: self.domain.clone(),
            confidence: inner.confidence,
            skipped: inner.skipped,
            excluded: inner.excluded,
            source_size,
            delta_size,
            chains: inner.chains.clone(),
        }
    }
}

/// Tunables for one workspace.
#[derive(Clone)]
pub struct WorkspaceOptions {
    pub min_confidence: f64,
    pub include_min_confidence: f64,
    /// Seconds; zero or negative means no deadline.
    pub max_time: f64,
    pub num_workers: usize,
    pub short_circuit: bool,
    pub url_timeout: Duration,
    pub headers: Vec<(String, String)>,
    pub parser_args: ParserArgs,
    pub exclusion_check: Option<ExclusionCheck>,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            min_confidence: crate::config::DEFAULT_MIN_CONFIDENCE,
            include_min_confidence: crate::config::DEFAULT_INCLUDE_MIN_CONFIDENCE,
            max_time: -1.0,
            num_workers: crate::config::DEFAULT_NUM_WORKERS,
            short_circuit: true,
            url_timeout: Duration::from_secs(crate::config::DEFAULT_URL_TIMEOUT_SECS),
            headers: Vec::new(),
            parser_args: ParserArgs::default(),
            exclusion_check: None,
        }
    }
}

enum WorkerMessage {
    Assign(DomainAssignment),
    Stop,
}

struct DomainAssignment {
    core: Arc<WorkspaceCore>,
    domain: String,
}

#[derive(Default)]
struct QueueState {
    sites: HashMap<String, VecDeque<Arc<CopyvioSource>>>,
    handled: HashSet<String>,
    sources: Vec<Arc<CopyvioSource>>,
}

struct WorkspaceCore {
    article: Arc<MarkovChain>,
    min_confidence: f64,
    short_circuit: bool,
    deadline: Option<Instant>,
    timeout: Duration,
    headers: Vec<(String, String)>,
    parser_args: ParserArgs,
    exclusion_check: Option<ExclusionCheck>,
    fetcher: Arc<dyn SourceFetcher>,
    parsers: Arc<ParserRegistry>,
    queues: Mutex<QueueState>,
    finish_lock: Mutex<()>,
    finish_signal: Condvar,
    finished: AtomicBool,
    possible_miss: AtomicBool,
    announce: Sender<WorkerMessage>,
}

impl WorkspaceCore {
    fn is_excluded(&self, url: &str) -> bool {
        self.exclusion_check
            .as_ref()
            .is_some_and(|check| check(url))
    }

    /// Process one domain queue until it is empty, then release it.
    fn drain_domain(&self, domain: &str, worker: &str) {
        loop {
            let source = {
                let mut queues = self.queues.lock();
                let Some(queue) = queues.sites.get_mut(domain) else {
                    return;
                };
                match queue.pop_front() {
                    Some(source) => source,
                    None => {
                        queues.sites.remove(domain);
                        debug!(worker, domain, "domain queue drained");
                        return;
                    }
                }
            };
            if !source.start_work() {
                debug!(worker, url = source.url(), "discarding skipped source");
                continue;
            }
            self.process(&source, worker);
        }
    }

    fn process(&self, source: &CopyvioSource, worker: &str) {
        debug!(worker, url = source.url(), "fetching source");
        match catch_unwind(AssertUnwindSafe(|| self.fetch_and_parse(source.url()))) {
            Ok(Ok(text)) => {
                let chain = (!text.trim().is_empty())
                    .then(|| MarkovChain::new(&text, self.article.degree()));
                self.compare(source, chain);
            }
            Ok(Err(SourceError::Parse(ParserError::Exclusion))) => {
                debug!(worker, url = source.url(), "source is a mirror of the article's wiki");
                source.exclude();
            }
            Ok(Err(error)) => {
                warn!(worker, url = source.url(), %error, "failed to process source");
                source.fail();
            }
            Err(_) => {
                error!(worker, url = source.url(), "worker panicked while processing source");
                source.fail();
            }
        }
    }

    fn fetch_and_parse(&self, url: &str) -> Result<String, SourceError> {
        let size_limit = |content_type: &str| self.parsers.size_limit(content_type);
        let mut target = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let request = FetchRequest {
                url: &target,
                headers: &self.headers,
                timeout: self.timeout,
                size_limit: &size_limit,
            };
            let fetched = self.fetcher.fetch(&request)?;
            let final_url = Url::parse(&fetched.url).ok();
            let context = ParseContext {
                url: final_url.as_ref(),
                args: &self.parser_args,
                fetcher: Some(self.fetcher.as_ref()),
                headers: &self.headers,
                timeout: self.timeout,
                charset: fetched.charset.as_deref(),
            };
            match self
                .parsers
                .parse(&fetched.content_type, &fetched.body, &context)
            {
                Err(ParserError::Redirect(next)) => {
                    debug!(from = %target, to = %next, "following viewer redirect");
                    target = next;
                }
                other => return other.map_err(SourceError::from),
            }
        }
        Err(FetchError::TooManyRedirects.into())
    }

    fn compare(&self, source: &CopyvioSource, chain: Option<MarkovChain>) {
        let scored = chain.map(|chain| {
            let delta = intersection(&self.article, &chain);
            let confidence = calculate_confidence(self.article.size(), delta.size());
            (confidence, Arc::new(chain), Arc::new(delta))
        });

        let _guard = self.finish_lock.lock();
        let confidence = match scored {
            Some((confidence, chain, delta)) => {
                source.complete(confidence, Some((chain, delta)));
                confidence
            }
            None => {
                source.complete(0.0, None);
                0.0
            }
        };
        debug!(url = source.url(), confidence, "compared source");

        if self.finished.load(Ordering::SeqCst) || confidence < self.min_confidence {
            return;
        }
        self.finished.store(true, Ordering::SeqCst);
        self.finish_signal.notify_all();
        if self.short_circuit {
            debug!("confidence threshold met; skipping remaining sources");
            let sources = self.queues.lock().sources.clone();
            for other in sources {
                if !std::ptr::eq(other.as_ref(), source) {
                    other.skip();
                }
            }
        }
    }
}

struct LocalPool {
    sender: Sender<WorkerMessage>,
    size: usize,
}

/// Per-check (or globally backed) set of candidate sources.
pub struct CopyvioWorkspace {
    core: Arc<WorkspaceCore>,
    local: Option<LocalPool>,
    stopped: AtomicBool,
    started: Instant,
    thresholds: ResultThresholds,
}

impl CopyvioWorkspace {
    /// Create a workspace, spawning local workers unless the global pool is running.
    pub fn new(
        article: MarkovChain,
        options: WorkspaceOptions,
        fetcher: Arc<dyn SourceFetcher>,
        parsers: Arc<ParserRegistry>,
    ) -> Result<Self> {
        Self::with_pool(article, options, fetcher, parsers, scheduler().sender())
    }

    fn with_pool(
        article: MarkovChain,
        options: WorkspaceOptions,
        fetcher: Arc<dyn SourceFetcher>,
        parsers: Arc<ParserRegistry>,
        global: Option<Sender<WorkerMessage>>,
    ) -> Result<Self> {
        let started = Instant::now();
        let deadline = (options.max_time > 0.0)
            .then(|| started + Duration::from_secs_f64(options.max_time));

        let (announce, local) = match global {
            Some(sender) => (sender, None),
            None => {
                let (sender, receiver) = channel::unbounded();
                let size = options.num_workers.max(1);
                spawn_local_workers(size, &receiver, deadline)?;
                (sender.clone(), Some(LocalPool { sender, size }))
            }
        };

        let core = WorkspaceCore {
            article: Arc::new(article),
            min_confidence: options.min_confidence,
            short_circuit: options.short_circuit,
            deadline,
            timeout: options.url_timeout,
            headers: options.headers,
            parser_args: options.parser_args,
            exclusion_check: options.exclusion_check,
            fetcher,
            parsers,
            queues: Mutex::new(QueueState::default()),
            finish_lock: Mutex::new(()),
            finish_signal: Condvar::new(),
            finished: AtomicBool::new(false),
            possible_miss: AtomicBool::new(false),
            announce,
        };
        Ok(Self {
            core: Arc::new(core),
            local,
            stopped: AtomicBool::new(false),
            started,
            thresholds: ResultThresholds {
                min_confidence: options.min_confidence,
                include_min_confidence: options.include_min_confidence,
            },
        })
    }

    pub fn article(&self) -> &MarkovChain {
        &self.core.article
    }

    /// True once some source has met the confidence threshold.
    pub fn finished(&self) -> bool {
        self.core.finished.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout`, returning early once the workspace finishes.
    pub fn wait_for_finish(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.core.finish_lock.lock();
        while !self.core.finished.load(Ordering::SeqCst) {
            if self.core.finish_signal.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.core.finished.load(Ordering::SeqCst)
    }

    pub fn set_possible_miss(&self) {
        self.core.possible_miss.store(true, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.core.deadline
    }

    pub fn sources(&self) -> Vec<Arc<CopyvioSource>> {
        self.core.queues.lock().sources.clone()
    }

    /// Register candidate URLs. Duplicates are ignored; excluded URLs and
    /// URLs arriving after a short-circuit are recorded but never fetched.
    pub fn enqueue<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            let url = url.as_ref().trim();
            if url.is_empty() {
                continue;
            }
            let source = {
                let mut queues = self.core.queues.lock();
                if !queues.handled.insert(url.to_string()) {
                    continue;
                }
                let source = Arc::new(CopyvioSource::new(url));
                queues.sources.push(Arc::clone(&source));
                source
            };

            if self.core.is_excluded(url) {
                debug!(url, "enqueue(): excluded");
                source.exclude();
                continue;
            }

            let mut queues = self.core.queues.lock();
            if self.core.short_circuit && self.finished() {
                debug!(url, "enqueue(): auto-skip");
                source.skip();
                continue;
            }
            let domain = source.domain().to_string();
            match queues.sites.entry(domain.clone()) {
                Entry::Occupied(mut queue) => {
                    debug!(url, %domain, "enqueue(): appending to domain queue");
                    queue.get_mut().push_back(source);
                }
                Entry::Vacant(slot) => {
                    debug!(url, %domain, "enqueue(): new domain queue");
                    slot.insert(VecDeque::from([Arc::clone(&source)]));
                    let assignment = DomainAssignment {
                        core: Arc::clone(&self.core),
                        domain: domain.clone(),
                    };
                    if self.core.announce.send(WorkerMessage::Assign(assignment)).is_err() {
                        warn!(url, %domain, "no workers are running; dropping domain queue");
                        queues.sites.remove(&domain);
                        source.fail();
                    }
                }
            }
        }
    }

    /// Wait for every source to finish or for the deadline, then stop local workers.
    pub fn wait(&self) {
        let mut index = 0;
        loop {
            let next = self.core.queues.lock().sources.get(index).cloned();
            let Some(source) = next else {
                break;
            };
            if !source.join(self.core.deadline) {
                debug!(url = source.url(), "deadline passed while waiting for source");
                break;
            }
            index += 1;
        }
        self.stop_local_workers();
    }

    fn stop_local_workers(&self) {
        let Some(local) = &self.local else {
            return;
        };
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..local.size {
            if local.sender.send(WorkerMessage::Stop).is_err() {
                break;
            }
        }
    }

    pub fn get_result(&self, queries: usize) -> CopyvioCheckResult {
        let sources = self.sources();
        let unfinished = sources.iter().any(|source| !source.is_done());
        let possible_miss = self.core.possible_miss.load(Ordering::SeqCst) || unfinished;
        let summaries = sources.iter().map(|source| source.summary()).collect();
        CopyvioCheckResult::new(
            summaries,
            queries,
            self.started.elapsed(),
            Arc::clone(&self.core.article),
            possible_miss,
            self.thresholds,
        )
    }
}

impl Drop for CopyvioWorkspace {
    fn drop(&mut self) {
        self.stop_local_workers();
    }
}

fn spawn_local_workers(
    size: usize,
    receiver: &Receiver<WorkerMessage>,
    deadline: Option<Instant>,
) -> Result<()> {
    static NEXT_CHECK: AtomicUsize = AtomicUsize::new(0);
    let check_id = NEXT_CHECK.fetch_add(1, Ordering::Relaxed) % 10_000;
    for index in 0..size {
        let name = format!("local-{check_id:04}.{index}");
        let receiver = receiver.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&name, &receiver, deadline))
            .with_context(|| format!("failed to spawn worker thread local-{check_id:04}.{index}"))?;
    }
    Ok(())
}

fn worker_loop(name: &str, receiver: &Receiver<WorkerMessage>, deadline: Option<Instant>) {
    let span = info_span!("worker", name);
    let _entered = span.enter();
    loop {
        let message = match deadline {
            Some(deadline) => match receiver.recv_deadline(deadline) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("deadline reached; worker exiting");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => return,
            },
        };
        match message {
            WorkerMessage::Assign(assignment) => {
                assignment.core.drain_domain(&assignment.domain, name);
            }
            WorkerMessage::Stop => {
                debug!("worker stopping");
                return;
            }
        }
    }
}

struct GlobalPool {
    sender: Sender<WorkerMessage>,
    handles: Vec<JoinHandle<()>>,
}

/// Process-wide worker pool shared by every workspace while running.
struct GlobalScheduler {
    lifecycle: Mutex<Option<GlobalPool>>,
}

impl GlobalScheduler {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(None),
        }
    }

    fn start(&self, num_workers: usize) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return Ok(());
        }
        if num_workers == 0 {
            bail!("global worker pool needs at least one worker");
        }
        let (sender, receiver) = channel::unbounded();
        let mut handles = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let name = format!("global-{index}");
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, &receiver, None));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for _ in &handles {
                        let _ = sender.send(WorkerMessage::Stop);
                    }
                    return Err(error)
                        .with_context(|| format!("failed to spawn worker thread global-{index}"));
                }
            }
        }
        info!(num_workers, "started global worker pool");
        *lifecycle = Some(GlobalPool { sender, handles });
        Ok(())
    }

    fn stop(&self) {
        let Some(pool) = self.lifecycle.lock().take() else {
            return;
        };
        for _ in &pool.handles {
            let _ = pool.sender.send(WorkerMessage::Stop);
        }
        for handle in pool.handles {
            if handle.join().is_err() {
                error!("global worker panicked during shutdown");
            }
        }
        info!("stopped global worker pool");
    }

    fn sender(&self) -> Option<Sender<WorkerMessage>> {
        self.lifecycle
            .lock()
            .as_ref()
            .map(|pool| pool.sender.clone())
    }

    fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }
}

fn scheduler() -> &'static GlobalScheduler {
    static SCHEDULER: OnceLock<GlobalScheduler> = OnceLock::new();
    SCHEDULER.get_or_init(GlobalScheduler::new)
}

/// Share `num_workers` threads across every future check. Must not be called
/// while checks are running; a second call while global is a no-op.
pub fn globalize(num_workers: usize) -> Result<()> {
    scheduler().start(num_workers)
}

/// Stop the global pool and return to per-check workers.
pub fn localize() {
    scheduler().stop();
}

pub fn is_globalized() -> bool {
    scheduler().is_running()
}

/// Registrable domain of a URL's host, used to group sources per site.
pub fn registered_domain(url: &str) -> String {
    let Some(host) = Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
    else {
        return url.to_string();
    };
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return host;
    }
    match psl::domain_str(&host) {
        Some(domain) => domain.to_string(),
        None => last_two_labels(&host),
    }
}

fn last_two_labels(host: &str) -> String {
    let labels = host.rsplit('.').take(2).collect::<Vec<_>>();
    labels.into_iter().rev().collect::<Vec<_>>().join(".")
}

/// Confidence that a source with `delta_size` shared n-grams copied an
/// article of `article_size` n-grams.
pub fn calculate_confidence(article_size: usize, delta_size: usize) -> f64 {
    let by_ratio = if article_size == 0 {
        0.0
    } else {
        let ratio = (delta_size as f64 / article_size as f64).min(1.0);
        if ratio <= 0.52763 {
            -(1.0 - ratio).ln()
        } else {
            -0.8939 * ratio * ratio + 1.8948 * ratio - 0.0009
        }
    };

    let delta = delta_size as f64;
    let by_size = if delta_size <= 100 {
        delta / (delta + 100.0)
    } else if delta_size <= 250 {
        (delta - 25.0) / (delta + 50.0)
    } else if delta_size <= 500 {
        (10.5 * delta - 750.0) / (10.0 * delta)
    } else {
        (delta - 50.0) / delta
    };

    let confidence = by_ratio.max(by_size);
    // -(1 - 0).ln() is -0.0, which sorts below a skipped source's 0.0.
    if confidence > 0.0 { confidence } else { 0.0 }
}
