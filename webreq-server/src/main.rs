use anyhow::Result;
use clap::Parser;
use webreq_common::observability::{init_logging, LogConfig, LogFormat};
use webreq_config::{ConfigLoader, WebReqConfig};

mod api;
mod tether;

use tether::Tether;

/// Persistent, policy-driven web-request orchestrator.
#[derive(Parser, Debug)]
#[command(name = "webreq-server", version, about)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, env = "WEBREQ_CONFIG", default_value = "webreq.yaml")]
    config: String,

    /// Override the HTTP API bind address (host:port).
    #[arg(long, env = "WEBREQ_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Override the log level (`trace`, `debug`, `info`, `warn`, `error`).
    #[arg(long, env = "WEBREQ_LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<WebReqConfig> {
    let mut cfg: WebReqConfig = ConfigLoader::new().with_file(&cli.config).load()?;
    if let Some(bind_addr) = &cli.bind_addr {
        cfg.api.bind_addr = bind_addr.clone();
    }
    if let Some(level) = &cli.log_level {
        cfg.logging.level = level.clone();
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().ok();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    if std::env::var_os("RUST_LOG").is_none() {
        // Safety: single-threaded at this point, before any logging or
        // async work has started.
        unsafe { std::env::set_var("RUST_LOG", &cfg.logging.level) };
    }
    let format = if cfg.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging(LogConfig {
        app_name: "webreq-server",
        log_dir: cfg.logging.dir.clone().map(Into::into),
        emit_stderr: true,
        format,
        ..LogConfig::default()
    })?;

    let tether = Tether::build(cfg).await?;
    tether.run().await
}
