//! Prometheus exporter for OpenLDAP monitor statistics.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ldap_monitor::LdapMonitorSource;
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use openldap_exporter::config::{LogFormat, Overrides, parse_duration};
use openldap_exporter::{
    ExporterConfig, ExpositionServer, MetricMapper, MetricsRegistry, ScrapeScheduler,
};

/// Prometheus exporter for OpenLDAP monitor statistics.
#[derive(Parser, Debug)]
#[command(name = "openldap-exporter")]
#[command(about = "Export OpenLDAP cn=Monitor statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address for the metrics server (default ":9330").
    #[arg(long)]
    prom_addr: Option<String>,

    /// Address of the OpenLDAP server (default "localhost:389").
    #[arg(long)]
    ldap_addr: Option<String>,

    /// Path to the CA certificate for LDAPS / StartTLS.
    #[arg(long)]
    ldap_ca_crt: Option<String>,

    /// Bind DN used to read cn=Monitor.
    #[arg(long)]
    ldap_user: Option<String>,

    /// Bind password.
    #[arg(long)]
    ldap_pass: Option<String>,

    /// Upgrade the connection with StartTLS.
    #[arg(long)]
    ldap_use_start_tls: bool,

    /// Connect with implicit TLS (ldaps).
    #[arg(long)]
    ldap_use_tls: bool,

    /// Skip TLS certificate verification.
    #[arg(long)]
    skip_verify_tls: bool,

    /// Scrape interval, e.g. "30s", "1m", "500ms" (default 30s).
    #[arg(long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            prom_addr: self.prom_addr.clone(),
            ldap_addr: self.ldap_addr.clone(),
            ldap_ca_crt: self.ldap_ca_crt.clone(),
            ldap_user: self.ldap_user.clone(),
            ldap_pass: self.ldap_pass.clone(),
            start_tls: self.ldap_use_start_tls,
            tls: self.ldap_use_tls,
            skip_verify: self.skip_verify_tls,
            interval: self.interval,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };
    config.apply_overrides(args.overrides())?;

    // Initialize logging
    let log_level: Level = config.logging.level.parse()?;
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("openldap_exporter={}", log_level).parse()?)
        .add_directive(format!("ldap_monitor={}", log_level).parse()?)
        .add_directive(format!("ldap3={}", Level::WARN).parse()?);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting OpenLDAP exporter");

    // Fatal configuration errors stop here, before any scrape
    let server_config = config.server_config()?;
    let listen_addr = config.listen_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(MetricsRegistry::new(config.prometheus.prefix.clone()));
    let mapper = MetricMapper::new(&config.prometheus.prefix, &config.prometheus.default_labels);
    let scheduler = ScrapeScheduler::new(
        LdapMonitorSource::new(server_config),
        mapper,
        registry.clone(),
        config.scrape.interval,
    );

    // Bind before spawning so an unavailable port fails startup
    let http_server = ExpositionServer::new(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    )
    .bind()
    .await?;

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.serve(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = scheduler_task.await;
        let _ = http_task.await;
    })
    .await;

    let stats = registry.stats();
    info!(
        scrapes_ok = stats.scrape_ok,
        scrapes_failed = stats.scrape_fail,
        mapping_warnings = stats.mapping_warnings,
        series_count = registry.series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
