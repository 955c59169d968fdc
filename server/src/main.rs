use clap::Parser;
use tracing::trace;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use enclii_server::args::{Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,enclii_server=debug")),
        )
        .init();

    trace!(?args, "parsed arguments");

    match args.command {
        Commands::Start(start_args) => enclii_server::start(start_args).await,
    }
}
