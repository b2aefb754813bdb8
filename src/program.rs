use std::env::current_dir;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Error};
use console::{style, Term};

use crate::ripper::io::sites::{collect_sites, USAGE};
use crate::ripper::io::{load_proxies, Config};
use crate::ripper::scheduler::CrawlerScheduler;
use crate::ripper::sender::RequestSender;
use crate::ripper::stats::{render_report, render_summary, StatsAggregator, StatsHistory};
use crate::Cli;
use crate::Command;

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shown when the proxy file cannot be used.
const PROXY_HELP: &str = "\
The proxy file must be a JSON object mapping a scheme to a proxy URL, e.g.
{\"http\": \"http://127.0.0.1:1080\", \"https\": \"http://127.0.0.1:1080\"}";

/// Handles the flow of the ripper from configuration to the final summary.
pub(crate) struct Program {
    cli: Cli,
}

impl Program {
    pub(crate) fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Runs the program.
    pub(crate) fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title("tumblr ripper");
        trace!("Starting tumblr ripper...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        let working_dir = current_dir().context("Failed to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());

        let config = Config::load(&self.cli.config)
            .with_context(|| format!("Failed to load {}", self.cli.config.display()))?;
        trace!("Configuration: {:?}", config);

        match self.cli.command {
            Some(Command::Stats) => self.print_stats(&config),
            None => self.crawl(&config),
        }
    }

    fn crawl(&self, config: &Config) -> Result<(), Error> {
        let proxies = match load_proxies(Path::new(&config.paths.proxies_file)) {
            Ok(proxies) => proxies,
            Err(e) => fatal_exit(&e.to_string(), PROXY_HELP),
        };
        if let Some(proxies) = &proxies {
            info!("You are using proxies: {:?}", proxies);
        }

        let sites = match collect_sites(self.cli.sites.as_deref(), Path::new(&config.paths.sites_file)) {
            Ok(sites) => sites,
            Err(e) => fatal_exit(&e.to_string(), USAGE),
        };
        info!("Sites to download: {}", sites.len());

        let sender = RequestSender::new(config.download.timeout(), proxies.as_ref())
            .context("Failed to build the HTTP client")?;
        let stats = Arc::new(StatsAggregator::open(&config.stats_file()));

        {
            let scheduler = CrawlerScheduler::new(config, Arc::new(sender), stats.clone())
                .context("Failed to start download workers")?;
            let sessions = scheduler.run(&sites);
            info!("Finished {} of {} sites", sessions.len(), sites.len());
        }

        println!("\n{}", style("=== DOWNLOAD STATISTICS SUMMARY ===").bold());
        print!("{}", render_summary(&stats.history()));
        Ok(())
    }

    fn print_stats(&self, config: &Config) -> Result<(), Error> {
        let path = config.stats_file();
        if !path.exists() {
            println!("No download statistics file found. Run the ripper first to create one.");
            return Ok(());
        }

        let history = StatsHistory::load(&path).with_context(|| format!("Error reading {}", path.display()))?;
        println!("{}\n", style("=== TUMBLR RIPPER DOWNLOAD STATISTICS ===").bold());
        print!("{}", render_report(&history));
        Ok(())
    }
}

/// Logs `error`, prints `help` and exits with a non-zero status.
fn fatal_exit(error: &str, help: &str) -> ! {
    error!("{}", error);
    println!("{}", help);
    log::logger().flush();
    exit(1);
}
