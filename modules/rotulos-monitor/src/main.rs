use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inews_client::{FtpSettings, FtpStoryServer};
use rotulos_common::config::LogFormat;
use rotulos_common::Config;
use rotulos_monitor::traits::HttpMediaFetcher;
use rotulos_monitor::{Monitor, MonitorSettings};
use x_client::XClient;

#[derive(Parser)]
#[command(
    name = "rotulos-monitor",
    about = "Watches iNews rundowns for social post labels and keeps their media on disk"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Run a single cycle over every rundown and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Cannot load config from {}", cli.config.display()))?;

    let level = config.logging.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,rotulos_monitor={level},rotulos_common={level},inews_client={level},x_client={level}"
        ))
    });
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    info!("Rótulos monitor starting...");
    config.log_redacted();

    let ftp = Arc::new(FtpStoryServer::new(FtpSettings {
        host: config.inews.host.clone(),
        port: config.inews.port,
        user: config.inews.user.clone(),
        password: config.inews.password.clone(),
        timeout: Duration::from_secs(config.inews.timeout_secs),
    }));
    let x = Arc::new(
        XClient::with_base_url(config.api.bearer_token.clone(), config.api.base_url.clone())
            .context("Cannot build X API client")?,
    );
    let fetcher = Arc::new(
        HttpMediaFetcher::new(Duration::from_secs(config.download.timeout_secs))
            .context("Cannot build HTTP client")?,
    );

    let mut monitor = Monitor::new(MonitorSettings::from_config(&config), ftp.clone(), x, fetcher)
        .context("Cannot open content state")?;

    if cli.once {
        let stats = monitor.run_cycle(true).await?;
        info!(%stats, "Single cycle complete");
    } else {
        monitor
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    }

    ftp.disconnect().await;
    info!("Rótulos monitor stopped");
    Ok(())
}
