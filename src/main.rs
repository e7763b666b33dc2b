use anyhow::Context;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use trapline::config::Config;
use trapline::ws::server::{self, RegistryOptions, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "trapline", version, about = "Remote source-level debugger server")]
struct Args {
    /// Path to the configuration file; missing file means defaults.
    #[clap(long, default_value = "trapline.toml")]
    config: PathBuf,
    /// Override the configured bind address.
    #[clap(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.logging.level.clone()),
    )
    .init();

    let addr = args.listen.unwrap_or_else(|| cfg.server.bind_addr());
    let registry = SessionRegistry::new(RegistryOptions::from(&cfg.websocket));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(target: "ws", "trapline listening on {addr}");

    server::serve(listener, registry).await?;
    Ok(())
}
