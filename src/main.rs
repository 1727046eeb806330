//! gotify-matrix-relay binary.
//!
//! Loads the configuration, logs in to Matrix, then relays the Gotify
//! stream until it fails or the process is signalled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gotify_matrix_relay::config::DEFAULT_CONFIG_PATH;
use gotify_matrix_relay::crypto::{CryptoEngine, CryptoStore};
use gotify_matrix_relay::gotify::GotifySource;
use gotify_matrix_relay::transport::{MatrixClient, MatrixTransport, RoomId};
use gotify_matrix_relay::{
    constants, logging, ChatTransport, Config, Formatter, ImageRehoster, MessageTemplate, Relay,
    RelayTarget,
};
use mimalloc::MiMalloc;
use tokio::sync::mpsc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Relay Gotify notifications into a Matrix room.
#[derive(Parser, Debug)]
#[command(name = "gotify-matrix-relay", version, about)]
struct Cli {
    /// Config file (default: $RELAY_CONFIG or ./config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Validate the configuration, print it with secrets redacted, and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("RELAY_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = Config::load(&config_path)?;
    logging::init(&config.logging)?;
    config.validate()?;

    if cli.check_config {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    log::info!(
        "gotify-matrix-relay {} has started",
        env!("CARGO_PKG_VERSION")
    );

    let result = run(&config).await;
    if let Err(e) = &result {
        log::error!("{e:#}");
    }
    result
}

async fn run(config: &Config) -> Result<()> {
    let template = config
        .template_path
        .as_deref()
        .map(MessageTemplate::load)
        .transpose()?;
    let rehoster = ImageRehoster::new(config.allowlist()?, config.image_fetch_timeout())?;
    if rehoster.allowlist().is_empty() {
        log::info!("No allowed image hosts configured, image re-hosting disabled");
    }

    let client = if config.matrix.token.is_empty() {
        MatrixClient::login_password(
            &config.matrix.homeserver_url,
            &config.user_id(),
            &config.matrix.password,
            &config.matrix.device_id,
        )
        .await?
    } else {
        MatrixClient::with_access_token(
            &config.matrix.homeserver_url,
            &config.matrix.token,
            &config.matrix.device_id,
        )
        .await?
    };

    let crypto = if config.matrix.encrypted {
        let store = CryptoStore::open(&config.state_dir)?;
        Some(Arc::new(CryptoEngine::load_or_create(
            store,
            client.user_id().as_ref(),
            client.device_id(),
            config.rotation_policy(),
        )))
    } else {
        None
    };

    let transport = match &crypto {
        Some(engine) => MatrixTransport::with_crypto(client, Arc::clone(engine)),
        None => MatrixTransport::new(client),
    };
    let transport: Arc<dyn ChatTransport> = Arc::new(transport);

    let target = RelayTarget {
        room_id: RoomId::from(config.matrix.room_id.clone()),
        encryption_enabled: config.matrix.encrypted,
    };
    let relay = Relay::new(Formatter::new(template), rehoster, transport, target);

    let (tx, rx) = mpsc::channel(constants::PAYLOAD_CHANNEL_CAPACITY);
    let source = GotifySource::new(&config.gotify.url, config.gotify.api_token.clone());
    let mut source_task = tokio::spawn(async move { source.run(tx).await });

    let outcome = tokio::select! {
        res = relay.run(rx) => res.context("Relay failed"),
        res = &mut source_task => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.context("Gotify stream failed")),
            Err(e) => Err(anyhow::anyhow!("Gotify task failed: {e}")),
        },
        () = shutdown_signal() => {
            log::info!("Shutting down");
            Ok(())
        }
    };

    source_task.abort();

    if let Some(engine) = &crypto {
        if let Err(e) = engine.persist().await {
            log::warn!("Failed to persist crypto state: {e:#}");
        }
    }

    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            log::warn!("Ctrl-C handler failed: {e}");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Could not install SIGTERM handler: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::warn!("Ctrl-C handler failed: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Ctrl-C handler failed: {e}");
        }
    }
}
