use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use copyvios_core::config::{CopyvioConfig, load_config};
use copyvios_core::exclusions::{ALL_SITES, ExclusionsDb};
use copyvios_core::mediawiki::{MediaWikiClient, MediaWikiClientConfig, Page, SiteRegistry};
use copyvios_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, normalize_for_display,
    resolve_paths,
};
use copyvios_core::{
    CheckOptions, CompareOptions, CopyvioCheckResult, CopyvioChecker, globalize, localize,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "copyvios",
    version,
    about = "Copyright violation detection for wiki articles"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(
        long,
        global = true,
        value_name = "N",
        help = "Share N worker threads across checks instead of spawning per check"
    )]
    global_workers: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Check(CheckArgs),
    Compare(CompareArgs),
    Exclusions(ExclusionsArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    title: String,
    #[arg(long, value_name = "N")]
    max_queries: Option<usize>,
    #[arg(long, value_name = "SECONDS")]
    max_time: Option<f64>,
    #[arg(long, help = "Skip search engine queries")]
    no_searches: bool,
    #[arg(long, help = "Skip external links found in the article")]
    no_links: bool,
    #[arg(long, help = "Keep checking after a violation is found")]
    no_short_circuit: bool,
    #[arg(long, help = "Print the result as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct CompareArgs {
    title: String,
    #[arg(required = true)]
    urls: Vec<String>,
    #[arg(long, value_name = "SECONDS")]
    max_time: Option<f64>,
    #[arg(long, help = "Print the result as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct ExclusionsArgs {
    #[command(subcommand)]
    command: ExclusionsSubcommand,
}

#[derive(Debug, Subcommand)]
enum ExclusionsSubcommand {
    Sync {
        #[arg(long, value_name = "NAME")]
        site: Option<String>,
        #[arg(long, help = "Refresh even if the lists are still fresh")]
        force: bool,
    },
    Check {
        url: String,
        #[arg(long, value_name = "NAME")]
        site: Option<String>,
    },
    Hints {
        title: String,
    },
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    let global_workers = cli
        .global_workers
        .or_else(|| configured_global_workers(&runtime))
        .filter(|count| *count > 0);
    if let Some(count) = global_workers {
        globalize(count)?;
        debug!(count, "using global worker pool");
    }
    let outcome = dispatch(&runtime, cli.command);
    if global_workers.is_some() {
        localize();
    }
    outcome
}

/// `[copyvios].global_workers` from the config, when it can be read.
fn configured_global_workers(runtime: &RuntimeOptions) -> Option<usize> {
    let (_, config) = load_runtime(runtime).ok()?;
    config.copyvios.global_workers
}

fn dispatch(runtime: &RuntimeOptions, command: Option<Commands>) -> Result<()> {
    match command {
        Some(Commands::Init(args)) => run_init(runtime, args),
        Some(Commands::Check(args)) => run_check(runtime, args),
        Some(Commands::Compare(args)) => run_compare(runtime, args),
        Some(Commands::Exclusions(ExclusionsArgs { command })) => match command {
            ExclusionsSubcommand::Sync { site, force } => {
                run_exclusions_sync(runtime, site.as_deref(), force)
            }
            ExclusionsSubcommand::Check { url, site } => {
                run_exclusions_check(runtime, &url, site.as_deref())
            }
            ExclusionsSubcommand::Hints { title } => run_exclusions_hints(runtime, &title),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("COPYVIOS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized copyvios runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_state_dir: {}", format_flag(report.created_state_dir));
    println!("wrote_config: {}", format_flag(report.wrote_config));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_check(runtime: &RuntimeOptions, args: CheckArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let page = fetch_page(&config, &args.title)?;
    let exclusions = open_exclusions(&paths, &config)?;

    let mut options = CheckOptions::from_config(&config);
    if let Some(max_queries) = args.max_queries {
        options.max_queries = max_queries;
    }
    if let Some(max_time) = args.max_time {
        options.max_time = max_time;
    }
    options.no_searches = args.no_searches;
    options.no_links = args.no_links;
    options.short_circuit = !args.no_short_circuit;

    let checker = CopyvioChecker::new(page, config)?.with_exclusions(Arc::new(exclusions));
    let result = checker.run_check(&options)?;
    print_result("copyvio check", &args.title, &result, args.json)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_compare(runtime: &RuntimeOptions, args: CompareArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let page = fetch_page(&config, &args.title)?;

    let mut options = CompareOptions::default();
    if let Some(max_time) = args.max_time {
        options.max_time = max_time;
    }
    let checker = CopyvioChecker::new(page, config)?;
    let result = checker.run_compare(args.urls.as_slice(), &options)?;
    print_result("copyvio compare", &args.title, &result, args.json)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_exclusions_sync(runtime: &RuntimeOptions, site: Option<&str>, force: bool) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let site = site.unwrap_or(config.site_name()).to_string();
    let db = open_exclusions(&paths, &config)?;
    let reports = db.sync(&site, force)?;

    println!("exclusions sync");
    println!("db_path: {}", normalize_for_display(&paths.exclusions_db(&config)));
    for report in &reports {
        let prefix = format!("site.{}", report.site);
        println!("{prefix}.refreshed: {}", format_flag(report.refreshed));
        println!("{prefix}.added: {}", report.added);
        println!("{prefix}.removed: {}", report.removed);
        println!(
            "{prefix}.age_secs: {}",
            report
                .age_secs
                .map(|age| age.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );
        println!("{prefix}.patterns: {}", db.list_exclusions(&report.site)?.len());
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_exclusions_check(runtime: &RuntimeOptions, url: &str, site: Option<&str>) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let site = site.unwrap_or(config.site_name()).to_string();
    let db = open_exclusions(&paths, &config)?;
    if db.last_update(&site)?.is_none() || db.last_update(ALL_SITES)?.is_none() {
        println!("warning: exclusions for {site} have never been synced (run `copyvios exclusions sync`)");
    }
    let excluded = db.check(&site, url)?;

    println!("exclusions check");
    println!("site: {site}");
    println!("url: {url}");
    println!("excluded: {}", format_flag(excluded));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_exclusions_hints(runtime: &RuntimeOptions, title: &str) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let page = fetch_page(&config, title)?;
    let db = open_exclusions(&paths, &config)?;
    let hints = db.get_mirror_hints(&page);

    println!("exclusions hints");
    println!("title: {}", page.title);
    println!("hints.count: {}", hints.len());
    for hint in hints {
        println!("hints.value: {hint}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_result(
    heading: &str,
    title: &str,
    result: &CopyvioCheckResult,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("{heading}");
    println!("title: {title}");
    println!("violation: {}", format_flag(result.violation));
    println!("confidence: {:.4}", result.confidence());
    println!("url: {}", result.url().unwrap_or("<none>"));
    println!("queries: {}", result.queries);
    println!("check_time: {:.3}", result.check_time);
    println!("possible_miss: {}", format_flag(result.possible_miss));
    println!(
        "unified_confidence: {}",
        result
            .unified_confidence
            .map(|confidence| format!("{confidence:.4}"))
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("sources.count: {}", result.sources.len());
    println!("sources.processed: {}", result.sources_processed());
    for source in &result.sources {
        let mut flags = Vec::new();
        if source.excluded {
            flags.push("excluded");
        }
        if source.skipped {
            flags.push("skipped");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!(
            "sources.source: {} ({:.4}){flags}",
            source.url, source.confidence
        );
    }
    println!("log: {}", result.log_message(title));
    Ok(())
}

fn fetch_page(config: &CopyvioConfig, title: &str) -> Result<Page> {
    let title = title.trim();
    if title.is_empty() {
        bail!("a non-empty page title is required");
    }
    let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_config(config))?;
    client
        .fetch_page(title)
        .with_context(|| format!("failed to load [[{title}]]"))?
        .with_context(|| format!("page [[{title}]] does not exist"))
}

fn open_exclusions(paths: &ResolvedPaths, config: &CopyvioConfig) -> Result<ExclusionsDb> {
    let path = paths.exclusions_db(config);
    ExclusionsDb::open(
        &path,
        Arc::new(SiteRegistry::new(config)),
        config.all_sites_host(),
    )
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, CopyvioConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
