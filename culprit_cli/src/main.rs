use culprit_core::config::{BisectConfig, PassBisectSettings};
use culprit_core::engine::{Bisection, Runtime};
use culprit_core::report::BisectReport;
use culprit_core::state::StateStore;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG: &str = "culprit.toml";

const EXIT_CONCLUSIVE: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_INCONCLUSIVE: u8 = 2;

/// Binary search for the items, passes and transformations that cause a failure.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration; `culprit.toml` is used when present.
    #[arg(long, value_parser)]
    config_file: Option<PathBuf>,

    /// Prints the items to bisect, whitespace separated.
    #[arg(short = 'i', long)]
    get_initial_items: Option<String>,

    /// Switches the given items to their good version.
    #[arg(short = 'g', long)]
    switch_to_good: Option<String>,

    /// Switches the given items to their bad version.
    #[arg(short = 'b', long)]
    switch_to_bad: Option<String>,

    /// Runs before every test, e.g. to build or flash an image.
    #[arg(long)]
    test_setup_script: Option<String>,

    /// Exits 0 when the current configuration is good.
    #[arg(short = 't', long)]
    test_script: Option<String>,

    /// Maximum probes per bisection round.
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Keep searching after the first bad item to find all of them.
    #[arg(short = 'p', long)]
    prune: bool,

    #[arg(long)]
    prune_iterations: Option<u32>,

    /// Generator script for pass and transformation level bisection.
    #[arg(long, value_name = "GENERATOR")]
    pass_bisect: Option<String>,

    /// Log the IR difference around the bad pass or transformation.
    #[arg(long, requires = "pass_bisect")]
    ir_diff: bool,

    /// Resend every item on every switch instead of only the changed ones.
    #[arg(long)]
    noincremental: bool,

    /// Pass switch scripts a file listing the items instead of the items themselves.
    #[arg(long)]
    file_args: bool,

    /// Skip the initial all-good / all-bad sanity check.
    #[arg(long)]
    noverify: bool,

    /// Continue from the last checkpoint, with the configuration it was started with.
    #[arg(long)]
    resume: bool,

    #[arg(long, value_parser)]
    state_file: Option<PathBuf>,

    /// Also write the final report as JSON.
    #[arg(long, value_parser)]
    report_json: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn has_overrides(&self) -> bool {
        self.get_initial_items.is_some()
            || self.switch_to_good.is_some()
            || self.switch_to_bad.is_some()
            || self.test_setup_script.is_some()
            || self.test_script.is_some()
            || self.iterations.is_some()
            || self.prune
            || self.prune_iterations.is_some()
            || self.pass_bisect.is_some()
            || self.noincremental
            || self.file_args
            || self.noverify
    }

    fn apply_overrides(&self, config: &mut BisectConfig) {
        let scripts = &mut config.scripts;
        for (value, slot) in [
            (&self.get_initial_items, &mut scripts.get_initial_items),
            (&self.switch_to_good, &mut scripts.switch_to_good),
            (&self.switch_to_bad, &mut scripts.switch_to_bad),
            (&self.test_setup_script, &mut scripts.test_setup_script),
            (&self.test_script, &mut scripts.test_script),
        ] {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        if let Some(iterations) = self.iterations {
            config.search.iterations = iterations;
        }
        if let Some(prune_iterations) = self.prune_iterations {
            config.search.prune_iterations = prune_iterations;
        }
        config.search.prune |= self.prune;
        config.search.file_args |= self.file_args;
        if self.noincremental {
            config.search.incremental = false;
        }
        if self.noverify {
            config.search.verify = false;
        }

        if let Some(generator) = &self.pass_bisect {
            let settings = config.pass_bisect.get_or_insert_with(|| PassBisectSettings {
                generator: generator.clone(),
                build_script: None,
                ir_diff: false,
                build_timeout_ms: None,
            });
            settings.generator = generator.clone();
        }
        if self.ir_diff {
            if let Some(settings) = config.pass_bisect.as_mut() {
                settings.ir_diff = true;
            }
        }

        if let Some(path) = &self.state_file {
            config.state.path = path.clone();
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    debug!("Logging initialized at level: {}", level);
}

fn load_config(cli: &Cli) -> Result<BisectConfig, anyhow::Error> {
    match &cli.config_file {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            BisectConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG);
            if default_path.exists() {
                info!("No config file specified, loading default: {default_path:?}");
                BisectConfig::load_from_file(&default_path)
            } else {
                debug!("No config file specified and no '{DEFAULT_CONFIG}' found, using defaults");
                Ok(BisectConfig::default())
            }
        }
    }
}

fn run(cli: Cli) -> Result<BisectReport, anyhow::Error> {
    let mut config = load_config(&cli)?;
    let mut runtime = Runtime::shell();

    let bisection = if cli.resume {
        if cli.has_overrides() {
            warn!("Resuming uses the checkpoint's configuration; command line overrides are ignored");
        }
        let path = cli.state_file.clone().unwrap_or(config.state.path);
        Bisection::resume(StateStore::new(path), &mut runtime)?
    } else {
        cli.apply_overrides(&mut config);
        debug!("Effective configuration: {config:#?}");
        Bisection::start(config, &mut runtime)?
    };
    let report = bisection.run()?;

    if let Some(path) = &cli.report_json {
        report.write_json(path)?;
        info!("Report written to {path:?}");
    }
    Ok(report)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(report) => {
            println!("{report}");
            if report.inconclusive {
                ExitCode::from(EXIT_INCONCLUSIVE)
            } else {
                ExitCode::from(EXIT_CONCLUSIVE)
            }
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}
