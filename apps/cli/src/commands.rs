//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use epss_enrich_core::{ProgressReporter, RunSummary, UpdateOutcome};
use epss_enrich_shared::{
    AppConfig, DispatchConfig, FeedConfig, FeedSource, RunConfig, TrackerConfig, init_config,
    load_config, load_config_from, token_from_env,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// epss-enrich — write EPSS scores onto active DefectDojo findings.
#[derive(Parser)]
#[command(
    name = "epss-enrich",
    version,
    about = "Enrich active vulnerability findings with EPSS exploitability scores.",
    long_about = None,
    args_conflicts_with_subcommands = true,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.epss-enrich/epss-enrich.toml).
    #[arg(long = "config", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Flags of an enrichment run. Unset flags fall back to the config file.
#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Authorization header value sent to the tracker (e.g. "Token abc123").
    /// Defaults to the variable named by `tracker.token_env`.
    #[arg(short = 't', long)]
    pub token: Option<String>,

    /// Tracker host.
    #[arg(short = 'u', long)]
    pub host: Option<String>,

    /// Tracker port.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Tracker URL scheme (http or https).
    #[arg(long)]
    pub scheme: Option<String>,

    /// Download the feed from this URL instead of the configured one.
    #[arg(long, conflicts_with = "feed_file")]
    pub feed_url: Option<String>,

    /// Read the feed from a local .csv or .csv.gz file.
    #[arg(long)]
    pub feed_file: Option<PathBuf>,

    /// Always download the feed, ignoring today's cached copy.
    #[arg(long)]
    pub no_cache: bool,

    /// Maximum update calls in flight.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Only update findings that matched a feed entry.
    #[arg(long)]
    pub matched_only: bool,

    /// Join and report, but send no updates.
    #[arg(long)]
    pub dry_run: bool,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "epss_enrich=info",
        1 => "epss_enrich=debug",
        _ => "epss_enrich=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Command::Config { action }) => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(cli.config_file.as_deref()).await,
        },
        None => cmd_run(cli.run, cli.config_file.as_deref()).await,
    }
}

fn load(path: Option<&std::path::Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

/// Merge CLI flags over the loaded config into the runtime config.
pub(crate) fn resolve_run_config(mut config: AppConfig, args: RunArgs) -> Result<RunConfig> {
    if let Some(host) = args.host {
        config.tracker.host = host;
    }
    if let Some(port) = args.port {
        config.tracker.port = port;
    }
    if let Some(scheme) = args.scheme {
        config.tracker.scheme = scheme;
    }
    if let Some(url) = args.feed_url {
        config.feed.url = url;
    }
    if args.no_cache {
        config.feed.cache = false;
    }
    if let Some(concurrency) = args.concurrency {
        config.dispatch.concurrency = concurrency;
    }
    if args.matched_only {
        config.dispatch.skip_unmatched = true;
    }

    let token = args
        .token
        .unwrap_or_else(|| token_from_env(&config.tracker));

    let mut feed = FeedConfig::try_from(&config.feed)?;
    if let Some(path) = args.feed_file {
        feed.source = FeedSource::File(path);
    }

    Ok(RunConfig {
        tracker: TrackerConfig::new(&config.tracker, token)?,
        feed,
        dispatch: DispatchConfig::from(&config.dispatch),
        dry_run: args.dry_run,
    })
}

async fn cmd_run(args: RunArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let config = load(config_path)?;
    let run_config = resolve_run_config(config, args)?;

    info!(
        tracker = %run_config.tracker.base_url,
        feed = ?run_config.feed.source,
        concurrency = run_config.dispatch.concurrency,
        dry_run = run_config.dry_run,
        "starting EPSS enrichment"
    );

    let reporter = CliProgress::new();
    let summary = epss_enrich_core::run_enrichment(&run_config, &reporter).await?;

    print_summary(&summary, &run_config);

    match summary.failed() {
        0 => Ok(()),
        n => Err(eyre!("{n} finding update(s) failed")),
    }
}

fn print_summary(summary: &RunSummary, config: &RunConfig) {
    println!();
    if config.dry_run {
        println!("  Dry run complete, no findings were updated.");
    } else {
        println!("  EPSS enrichment complete!");
    }
    println!("  Findings:  {}", summary.findings);
    println!("  Scores:    {}", summary.scores);
    if let Some(model) = &summary.feed.model_version {
        println!("  Model:     {model}");
    }
    if let Some(date) = &summary.feed.score_date {
        println!("  Scored:    {}", date.format("%Y-%m-%d"));
    }
    println!("  Matched:   {}", summary.matched);
    println!("  Unmatched: {}", summary.unmatched);
    if let Some(report) = &summary.dispatch {
        println!("  Updated:   {}", report.succeeded());
        println!("  Failed:    {}", report.failed());
        if report.skipped > 0 {
            println!("  Skipped:   {}", report.skipped);
        }
        for (id, error) in report.failures() {
            println!("    finding {id}: {error}");
        }
    }
    println!("  Time:      {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn record_updated(&self, outcome: &UpdateOutcome, current: usize, total: usize) {
        let verdict = if outcome.is_success() { "updated" } else { "failed" };
        self.spinner.set_message(format!(
            "Updating [{current}/{total}] finding {} {verdict}",
            outcome.remote_id
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
