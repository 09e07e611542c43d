use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, never};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use topod::config::DEFAULT_CONFIG_FILE;
use topod::processor::{supervise, Processor, ERROR_CHANNEL_CAPACITY};
use topod::{process_once, store, AgentConfig, IntervalProcessor, Watcher};

#[derive(Parser, Debug)]
#[command(name = "topod")]
#[command(version, about = "Render config files from templates and key/value store data")]
struct Cli {
    /// Agent configuration file
    #[arg(long, env = "TOPOD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Directory holding conf.d/ and templates/
    #[arg(long, env = "TOPOD_CONFDIR")]
    confdir: Option<PathBuf>,

    /// Store backend
    #[arg(long, env = "TOPOD_STORE")]
    store: Option<String>,

    /// Store node, host:port or URL (repeatable)
    #[arg(long = "node", env = "TOPOD_NODES", value_delimiter = ',')]
    nodes: Vec<String>,

    /// Scheme used for nodes given without one
    #[arg(long, env = "TOPOD_SCHEME")]
    scheme: Option<String>,

    /// Key prefix applied ahead of every resource prefix
    #[arg(long, env = "TOPOD_PREFIX")]
    prefix: Option<String>,

    /// Long-poll the store and re-render on change
    #[arg(long, env = "TOPOD_WATCH")]
    watch: bool,

    /// Seconds between rounds when not watching
    #[arg(long, env = "TOPOD_INTERVAL")]
    interval: Option<u64>,

    /// Process every resource once and exit
    #[arg(long, env = "TOPOD_ONETIME")]
    onetime: bool,

    /// Render and compare only, never touch destinations
    #[arg(long, env = "TOPOD_NOOP")]
    noop: bool,

    /// Leave staged files next to their destination
    #[arg(long, env = "TOPOD_KEEP_STAGE_FILE")]
    keep_stage_file: bool,

    #[arg(long, env = "TOPOD_DEBUG")]
    debug: bool,

    /// Include targets and thread names in log lines
    #[arg(long, env = "TOPOD_VERBOSE")]
    verbose: bool,

    #[arg(long, env = "TOPOD_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    #[arg(long, env = "TOPOD_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    #[arg(long, env = "TOPOD_CLIENT_CACERT")]
    client_cacert: Option<PathBuf>,
}

impl Cli {
    /// Applies flags on top of the file configuration.
    fn merge(&self, mut agent: AgentConfig) -> AgentConfig {
        if let Some(confdir) = &self.confdir {
            agent.confdir = confdir.clone();
        }
        if let Some(store) = &self.store {
            agent.store = store.clone();
        }
        if !self.nodes.is_empty() {
            agent.nodes = self.nodes.clone();
        }
        if let Some(scheme) = &self.scheme {
            agent.scheme = scheme.clone();
        }
        if let Some(prefix) = &self.prefix {
            agent.prefix = prefix.clone();
        }
        if let Some(interval) = self.interval {
            agent.interval = interval;
        }
        if self.client_cert.is_some() {
            agent.client_cert = self.client_cert.clone();
        }
        if self.client_key.is_some() {
            agent.client_key = self.client_key.clone();
        }
        if self.client_cacert.is_some() {
            agent.client_cacert = self.client_cacert.clone();
        }
        agent.watch |= self.watch;
        agent.onetime |= self.onetime;
        agent.noop |= self.noop;
        agent.keep_stage_file |= self.keep_stage_file;
        agent.debug |= self.debug;
        agent.verbose |= self.verbose;
        agent
    }
}

fn init_logging(debug: bool, verbose: bool) {
    let level = if debug { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_names(verbose)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to forward log records: {}", e);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = AgentConfig::load_or_default(&cli.config);
    let file_debug = loaded.as_ref().map(|c| c.debug).unwrap_or(false);
    let file_verbose = loaded.as_ref().map(|c| c.verbose).unwrap_or(false);
    init_logging(cli.debug || file_debug, cli.verbose || file_verbose);

    let agent = match loaded {
        Ok(agent) => cli.merge(agent),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting topod v{}", env!("CARGO_PKG_VERSION"));
    match run(agent) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(agent: AgentConfig) -> topod::Result<()> {
    agent.validate()?;
    let client = store::new_client(&agent.store_config())?;
    let config = agent.template_config(client);
    info!("Using config directory {}", config.parent_dir.display());
    if config.noop {
        warn!("Noop mode enabled, destinations will not be modified");
    }

    if agent.onetime {
        return process_once(&config);
    }

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (done_tx, done_rx) = bounded::<()>(0);
    let (err_tx, err_rx) = bounded(ERROR_CHANNEL_CAPACITY);

    let processor: Box<dyn Processor> = if agent.watch {
        Box::new(Watcher::new(&config, stop_rx, done_tx, err_tx)?)
    } else {
        Box::new(IntervalProcessor::new(
            &config,
            Duration::from_secs(agent.interval),
            stop_rx,
            done_tx,
            err_tx,
        )?)
    };

    let (signal_tx, signal_rx) = bounded::<()>(1);
    let signals = match ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    }) {
        Ok(()) => signal_rx,
        Err(e) => {
            warn!("Failed to install signal handler: {}", e);
            never()
        }
    };

    supervise(processor, stop_tx, done_rx, err_rx, signals)?;
    info!("topod stopped");
    Ok(())
}
