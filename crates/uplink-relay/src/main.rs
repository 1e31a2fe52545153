use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};
use tokio::net::TcpListener;

use uplink_relay::hub::Hub;
use uplink_relay::ingest;
use uplink_relay::server::{self, AppState};
use uplink_relay::settings::Settings;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Relays location-telemetry uplinks from an AMQP broker to filtered WebSocket subscribers."
)]
struct Cli {
    /// Path to the config file (optional; env vars override it)
    #[arg(long, value_name = "PATH", default_value = "conf.toml")]
    config: String,
    /// Override the HTTP listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
    /// Reduce output to only errors
    #[arg(short, long)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut settings = Settings::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        settings.http_listen_address = listen;
    }
    debug!("resolved settings: {settings:#?}");

    run(settings)
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();
}

#[tokio::main]
async fn run(settings: Settings) -> Result<()> {
    let (hub, handle) = Hub::new();
    tokio::spawn(hub.run());
    tokio::spawn(ingest::run(settings.clone(), handle.clone()));

    let listener = TcpListener::bind(&settings.http_listen_address)
        .await
        .with_context(|| format!("binding {}", settings.http_listen_address))?;
    info!(
        "listening on {}",
        listener.local_addr().context("reading listen address")?
    );

    let app = server::router(AppState { hub: handle });
    axum::serve(listener, app).await.context("running server")?;
    Ok(())
}
