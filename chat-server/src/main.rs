use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_server::{
    cli::{Cli, Command, ServeArgs},
    client,
    config::ServerConfig,
    console::stdin_lines,
    operator,
    server::Server,
    store::{JsonAccountStore, SharedStore},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::from(&args);
    let store = JsonAccountStore::open(&config.accounts)
        .with_context(|| format!("failed to open account store {}", config.accounts.display()))?;
    let store: SharedStore = Arc::new(store);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let server = Server::new(listener, store, config.limits);
    info!("server listening on {}", server.local_addr()?);

    if !args.no_console {
        let operator = server.operator();
        tokio::spawn(async move {
            if let Err(err) = operator::run_console(&operator, stdin_lines()).await {
                warn!("operator console stopped: {err}");
            }
        });
    }

    server.run_until_ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            if let Err(err) = serve(args).await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Connect(args) => client::run(args).await?,
    }

    Ok(())
}
