use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use np_core::{Config, ReconcileMode};
use np_engine::NodeEngine;
use np_filter::{
    Backend, BaseRuleInstaller, Bootstrapper, FilterStatusCollector, IptablesBackend,
    MemoryBackend,
};
use np_metrics::{MetricsCollector, MetricsServer};
use np_watch::{Dispatcher, ResourceWatches};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "netpold")]
#[command(version, about = "Node-local Kubernetes NetworkPolicy enforcement", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset filter state, install base rules, and follow the cluster
    Run(RunArgs),
    /// Show owned chains and sets
    Status,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// YAML config file; flags override its values
    #[arg(short, long, env = "NETPOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Name of this node (defaults to $HOSTNAME)
    #[arg(long)]
    node_name: Option<String>,

    /// Watch extensions/v1beta1 network policies and skip egress rules
    #[arg(long = "use-legacy-netpol", alias = "legacy")]
    legacy: bool,

    /// Accept multicast traffic; a bare flag means true
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    allow_mcast: Option<bool>,

    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `np_filter=debug`
    #[arg(long, env = "NETPOLD_LOG")]
    log_level: Option<String>,

    /// Size of list:set ipsets
    #[arg(long)]
    max_list_size: Option<u32>,

    /// How a differing chain is converged (append|replace)
    #[arg(long)]
    reconcile_mode: Option<ReconcileMode>,

    /// Use an in-memory filter instead of iptables and ipset
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    /// Defaults, then the config file, then flags, then the hostname fallback.
    fn resolve(&self, hostname: Option<String>) -> Result<Config> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        let config = self.apply(config).with_hostname_fallback(hostname);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, mut config: Config) -> Config {
        if let Some(name) = &self.node_name {
            config.node_name = Some(name.clone());
        }
        if self.legacy {
            config.legacy = true;
        }
        if let Some(allow) = self.allow_mcast {
            config.allow_multicast = allow;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = addr;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(size) = self.max_list_size {
            config.max_list_size = size;
        }
        if let Some(mode) = self.reconcile_mode {
            config.reconcile_mode = mode;
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = args.resolve(std::env::var("HOSTNAME").ok())?;
            init_tracing(&config.log_level)?;
            tokio::runtime::Runtime::new()?.block_on(async { run(config, args.dry_run).await })?;
        }
        Commands::Status => {
            init_tracing("warn")?;
            tokio::runtime::Runtime::new()?.block_on(async { show_status().await })?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(log_filter(level)?).init();
    Ok(())
}

/// Parse a log filter, accepting `warning` as a level name.
///
/// `EnvFilter` would otherwise read a bare `warning` as a target and drop
/// every other event.
fn log_filter(level: &str) -> Result<EnvFilter> {
    let directives = level
        .split(',')
        .map(|directive| match directive.rsplit_once('=') {
            Some((target, value)) if value.eq_ignore_ascii_case("warning") => {
                format!("{}=warn", target)
            }
            None if directive.trim().eq_ignore_ascii_case("warning") => "warn".to_string(),
            _ => directive.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log level {:?}", level))
}

async fn run(config: Config, dry_run: bool) -> Result<()> {
    let node_name = config.node_name()?.to_string();
    info!(
        node = %node_name,
        legacy = config.legacy,
        allow_multicast = config.allow_multicast,
        reconcile_mode = %config.reconcile_mode,
        dry_run,
        "Starting netpold"
    );

    let metrics = Arc::new(MetricsCollector::new()?);
    let server = MetricsServer::new(metrics.clone(), config.metrics_addr)
        .start()
        .await
        .with_context(|| format!("starting metrics server on {}", config.metrics_addr))?;

    let client = kube::Client::try_default()
        .await
        .context("creating kubernetes client")?;

    let backend: Arc<dyn Backend> = if dry_run {
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(IptablesBackend::new(config.max_list_size))
    };

    Bootstrapper::new(backend.as_ref())
        .reset()
        .await
        .context("resetting filter state")?;
    BaseRuleInstaller::new(backend.as_ref(), config.allow_multicast)
        .with_mode(config.reconcile_mode)
        .install(config.legacy)
        .await
        .context("installing base rules")?;

    refresh_filter_metrics(backend.as_ref(), &metrics).await?;
    let refresher = tokio::spawn(refresh_loop(backend.clone(), metrics.clone()));

    let engine = NodeEngine::new(node_name, config.legacy, backend).with_metrics(metrics.clone());
    let dispatcher = Dispatcher::new(Arc::new(engine)).with_metrics(metrics);
    let watches = ResourceWatches::new(client, config.legacy).spawn(dispatcher);

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let result = tokio::select! {
        result = watches.wait() => {
            result.context("watch loop stopped")
        }
        result = server => {
            match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("metrics server stopped")),
                Ok(Err(e)) => Err(e.context("metrics server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("metrics server task failed")),
            }
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            Ok(())
        }
    };

    refresher.abort();
    if let Err(e) = &result {
        error!(error = ?e, "Fatal error");
    }
    result
}

async fn refresh_filter_metrics(backend: &dyn Backend, metrics: &MetricsCollector) -> Result<()> {
    let status = FilterStatusCollector::new(backend)
        .collect()
        .await
        .context("reading filter status")?;
    metrics.update_filter_metrics(&status);
    Ok(())
}

async fn refresh_loop(backend: Arc<dyn Backend>, metrics: Arc<MetricsCollector>) {
    let mut interval = tokio::time::interval(STATUS_REFRESH_INTERVAL);
    // The first tick completes immediately and startup has just refreshed.
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = refresh_filter_metrics(backend.as_ref(), &metrics).await {
            warn!(error = ?e, "Failed to refresh filter metrics");
        }
    }
}

async fn show_status() -> Result<()> {
    let backend = IptablesBackend::new(Config::default().max_list_size);
    let status = FilterStatusCollector::new(&backend)
        .collect()
        .await
        .context("reading filter status")?;
    status.display();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tracing_subscriber::filter::LevelFilter;

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["netpold", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            Commands::Status => panic!("expected run"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_file_values() {
        let file = Config::from_yaml(
            "node_name: from-file\nallow_multicast: true\nmax_list_size: 2048\n",
        )
        .unwrap();
        let args = run_args(&[
            "--node-name",
            "from-flag",
            "--allow-mcast",
            "false",
            "--reconcile-mode",
            "replace",
            "--use-legacy-netpol",
        ]);

        let config = args.apply(file);

        assert_eq!(config.node_name.as_deref(), Some("from-flag"));
        assert!(!config.allow_multicast);
        assert!(config.legacy);
        assert_eq!(config.max_list_size, 2048);
        assert_eq!(config.reconcile_mode, ReconcileMode::Replace);
    }

    #[test]
    fn hostname_fills_in_missing_node_name() {
        let config = run_args(&[]).resolve(Some("node-a".into())).unwrap();
        assert_eq!(config.node_name().unwrap(), "node-a");
        assert!(config.allow_multicast);
        assert_eq!(config.metrics_addr.port(), 6781);
    }

    #[test]
    fn missing_node_name_fails_resolution() {
        assert!(run_args(&[]).resolve(None).is_err());
    }

    #[test]
    fn bare_allow_mcast_means_true() {
        let config = Config {
            allow_multicast: false,
            ..Default::default()
        };

        let args = run_args(&["--allow-mcast", "--node-name", "node-a"]);

        assert_eq!(args.allow_mcast, Some(true));
        assert!(args.apply(config).allow_multicast);
        assert_eq!(run_args(&["--allow-mcast=false"]).allow_mcast, Some(false));
    }

    #[test]
    fn warning_is_a_log_level() {
        assert_eq!(
            log_filter("warning").unwrap().max_level_hint(),
            Some(LevelFilter::WARN)
        );
        assert_eq!(
            log_filter("WARNING").unwrap().max_level_hint(),
            Some(LevelFilter::WARN)
        );
        assert_eq!(
            log_filter("np_filter=warning").unwrap().max_level_hint(),
            Some(LevelFilter::WARN)
        );
        assert_eq!(
            log_filter("info").unwrap().max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }

    #[test]
    fn legacy_alias_and_bad_mode() {
        assert!(run_args(&["--legacy"]).legacy);
        assert!(Cli::try_parse_from(["netpold", "run", "--reconcile-mode", "flush"]).is_err());
    }
}
