use clap::{Args, Parser};
use remote_config::config::Config as RemoteConfig;
use remote_config::sinks::{FilesystemListener, SinkError};
use remote_config::{
    ConfigKey, ConfigurationPoller, ExtraServices, FileListener, HttpTransport, Listener,
    ListenerError, PollingRateHinter, Product, ProductListener, ResponseDecoder, TransportError,
    ValidationError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod config;

use config::{Config, ConfigError, LoggingConfig, MetricsConfig};

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "rcsync.yaml")]
    config: PathBuf,
}

#[derive(Parser)]
#[command(name = "rcsync")]
#[command(about = "Remote configuration synchronization client")]
enum CliCommand {
    /// Poll the agent and dispatch configuration until interrupted
    Run(ConfigArgs),
    /// Load and validate the configuration, then exit
    Check(ConfigArgs),
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not create transport: {0}")]
    Transport(#[from] TransportError),
    #[error("could not create output directory: {0}")]
    Sink(#[from] SinkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
}

fn main() {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => run(&args.config),
        CliCommand::Check(args) => Config::from_file(&args.config)
            .map(|_| println!("{} is valid", args.config.display()))
            .map_err(CliError::from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;

    let _sentry = init_logging(config.common.logging.as_ref());
    if let Some(metrics_config) = &config.common.metrics {
        init_metrics(metrics_config)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_async(config.remote_config))
}

async fn run_async(config: RemoteConfig) -> Result<(), CliError> {
    let poller = build_poller(&config)?;
    tracing::info!(
        agent_url = %config.agent_url,
        products = ?config.products,
        "Starting remote configuration client"
    );

    let handle = poller.spawn();
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn init_logging(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = config.and_then(|c| c.sentry_dsn.as_deref()).map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = metrics_exporter_statsd::StatsdBuilder::from(
        config.statsd_host.as_str(),
        config.statsd_port,
    )
    .build(Some(config.prefix.as_str()))
    .map_err(|e| CliError::Metrics(e.to_string()))?;

    metrics::set_global_recorder(recorder)
        .map_err(|_| CliError::Metrics("a recorder is already installed".into()))?;
    shared::metrics_defs::describe(remote_config::metrics_defs::ALL_METRICS);

    Ok(())
}

/// Logs applied configuration when no output directory is configured.
struct LoggingListener {
    product: Product,
}

impl ProductListener for LoggingListener {
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: &[u8],
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        tracing::info!(product = %self.product, key = %key, bytes = content.len(), "Configuration applied");
        Ok(())
    }

    fn remove(
        &mut self,
        key: &ConfigKey,
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        tracing::info!(product = %self.product, key = %key, "Configuration removed");
        Ok(())
    }

    fn commit(&mut self, _hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Logs the size of local configuration files as they are re-read.
struct LocalFileLogger;

impl FileListener for LocalFileLogger {
    fn accept(
        &mut self,
        path: &Path,
        content: &[u8],
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        tracing::debug!(path = %path.display(), bytes = content.len(), "Local configuration loaded");
        Ok(())
    }
}

fn build_poller(config: &RemoteConfig) -> Result<ConfigurationPoller, CliError> {
    let transport = HttpTransport::new(
        &config.agent_url,
        config.request_timeout(),
        config.max_payload_size_bytes,
    )?;
    let decoder = ResponseDecoder::new(config.max_payload_size_bytes, config.targets_key()?);

    let mut poller = ConfigurationPoller::new(
        Arc::new(transport),
        decoder,
        config.client.identity(),
        config.poll_interval(),
        Arc::new(ExtraServices::new(config.max_extra_services)),
    );

    for product in config.products()? {
        let listener = match &config.output_dir {
            Some(dir) => Listener::single(FilesystemListener::new(dir, product)?),
            None => Listener::single(LoggingListener { product }),
        };
        poller.register(product, listener);
    }
    for path in &config.local_files {
        poller.add_file_listener(path, LocalFileLogger);
    }

    Ok(poller)
}
