//! CLI for telebus
//!
//! Subcommands:
//! - `server`: run the ingestion broker (WebSocket, optionally mTLS)
//! - `publish`: sign and publish one payload
//! - `agent`: publish every stdin line, buffering while the broker is away
//! - `health`: ask the broker whether it is ready
//! - `keygen`: create an Ed25519 signing key for a producer

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use telebus_broker::{Broker, BrokerOptions};
use telebus_client::{Backoff, BrokerTransport, PublishOutcome, Publisher, PublisherOptions};
use telebus_config::{Settings, load_config_from};
use telebus_persistence::{LocalBuffer, Wal};
use telebus_protocol::{Ed25519Signer, SharedTrustStore, TrustStore};
use telebus_transport::{WsTransport, start_websocket_server, tls};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

type AppResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "telebus", version, about = "Secure telemetry ingestion bus")]
struct Cli {
    /// Configuration file, extension optional
    #[arg(long, global = true, default_value = telebus_config::DEFAULT_CONFIG_FILE)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the ingestion broker
    Server,
    /// Publish a single payload and print the broker's verdict
    Publish {
        #[arg(long)]
        payload: String,
        /// Idempotency key; derived from the payload when omitted
        #[arg(long)]
        key: Option<String>,
    },
    /// Publish each line read from stdin until EOF or Ctrl-C
    Agent,
    /// Query broker readiness
    Health,
    /// Generate a signing key and print the matching trust store entry
    Keygen {
        #[arg(long)]
        producer_id: String,
        /// Write the secret key here instead of printing it
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    telebus_utils::logging::init(&settings.log.level);

    let result = match cli.command {
        Command::Server => run_server(&cli.config, settings).await,
        Command::Publish { payload, key } => run_publish(&settings, payload, key).await,
        Command::Agent => run_agent(&settings).await,
        Command::Health => run_health(&settings).await,
        Command::Keygen { producer_id, out } => run_keygen(&producer_id, out.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn trust_store(settings: &Settings) -> AppResult<TrustStore> {
    let store = TrustStore::from_hex_entries(settings.trust.producers.iter())?;
    if store.is_empty() {
        warn!("trust store is empty; every publish will be rejected");
    }
    Ok(store)
}

async fn run_server(config_file: &str, settings: Settings) -> AppResult {
    let trust = Arc::new(SharedTrustStore::new(trust_store(&settings)?));
    let wal = Arc::new(Wal::open(&settings.wal.path)?);

    let options = BrokerOptions {
        max_envelope_bytes: settings.broker.max_envelope_bytes,
        dedup_ttl: settings.broker.dedup_ttl(),
        dedup_capacity: settings.broker.dedup_capacity,
        overload_threshold: settings.broker.overload_threshold,
        retry_after_base: settings.broker.retry_after_base(),
        retry_after_max: settings.broker.retry_after_max(),
    };
    let broker = Arc::new(Broker::new(options, trust.clone(), wal));

    let acceptor = match &settings.server.tls {
        Some(t) => Some(tls::acceptor(tls::load_server_config(
            &t.cert_path,
            &t.key_path,
            &t.client_ca_path,
        )?)),
        None => {
            warn!("server.tls is not configured; accepting unauthenticated plaintext connections");
            None
        }
    };

    tokio::spawn(Broker::start_maintenance_loop(
        broker.clone(),
        settings.broker.maintenance_interval(),
    ));
    #[cfg(unix)]
    tokio::spawn(reload_trust_on_hangup(config_file.to_string(), trust));
    #[cfg(not(unix))]
    let _ = (config_file, trust);

    let addr = settings.server.bind_addr();
    tokio::select! {
        result = start_websocket_server(&addr, broker.clone(), acceptor) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    broker.run_maintenance();
    Ok(())
}

/// SIGHUP re-reads the `trust` section and swaps it in without a restart.
#[cfg(unix)]
async fn reload_trust_on_hangup(config_file: String, trust: Arc<SharedTrustStore>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP; trust reload disabled");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        let reloaded = load_config_from(&config_file)
            .map_err(|e| e.to_string())
            .and_then(|settings| {
                TrustStore::from_hex_entries(settings.trust.producers.iter())
                    .map_err(|e| e.to_string())
            });
        match reloaded {
            Ok(store) => {
                let producers = store.len();
                trust.replace(store);
                info!(producers, "trust store reloaded");
            }
            Err(e) => error!(error = %e, "trust store reload failed; keeping current keys"),
        }
    }
}

fn transport(settings: &Settings) -> AppResult<WsTransport> {
    let client = &settings.client;
    let mut transport = WsTransport::new(&client.broker_url)?
        .with_max_envelope_bytes(settings.broker.max_envelope_bytes);
    if let Some(t) = &client.tls {
        let config = tls::load_client_config(&t.ca_path, &t.cert_path, &t.key_path)?;
        transport = transport.with_tls(config, &t.server_name)?;
    }
    Ok(transport)
}

fn publisher(settings: &Settings) -> AppResult<Publisher> {
    let client = &settings.client;
    let signer = Ed25519Signer::from_key_file(&client.producer_id, &client.signing_key_path)?;
    let buffer = LocalBuffer::open(&client.buffer_path)?;
    let options = PublisherOptions {
        request_timeout: client.request_timeout(),
        backoff: Backoff::new(
            client.backoff_base(),
            client.backoff_max(),
            client.backoff_jitter,
        ),
        max_envelope_bytes: settings.broker.max_envelope_bytes,
    };
    Ok(Publisher::new(
        Arc::new(transport(settings)?),
        Arc::new(signer),
        buffer,
        options,
    ))
}

async fn run_publish(settings: &Settings, payload: String, key: Option<String>) -> AppResult {
    let publisher = publisher(settings)?;
    let outcome = match key {
        Some(key) => publisher.publish_with_key(payload, key).await?,
        None => publisher.publish(payload).await?,
    };
    match outcome {
        PublishOutcome::Acked => println!("accepted"),
        PublishOutcome::Buffered { buffer_id, .. } => println!(
            "broker unavailable; buffered as #{buffer_id} in {} (run `telebus agent` to deliver)",
            settings.client.buffer_path.display()
        ),
        PublishOutcome::Rejected { reason } => return Err(format!("rejected: {reason}").into()),
    }
    Ok(())
}

async fn run_agent(settings: &Settings) -> AppResult {
    let publisher = Arc::new(publisher(settings)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = {
        let publisher = publisher.clone();
        let interval = settings.client.drain_interval();
        tokio::spawn(async move { publisher.run(interval, shutdown_rx).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match publisher.publish(line.into_bytes()).await {
                    Ok(PublishOutcome::Rejected { reason }) => warn!(%reason, "event rejected"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "event could not be published"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = drain.await;
    let metrics = publisher.metrics()?;
    info!(
        buffer_depth = metrics.buffer_depth,
        acked = metrics.acked,
        rejected = metrics.rejected,
        retries = metrics.retries,
        "agent stopped"
    );
    Ok(())
}

async fn run_health(settings: &Settings) -> AppResult {
    let status = transport(settings)?.health().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.ready {
        Ok(())
    } else {
        Err("broker is not ready".into())
    }
}

fn run_keygen(producer_id: &str, out: Option<&Path>) -> AppResult {
    let signer = Ed25519Signer::generate(producer_id);
    match out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, signer.secret_hex())?;
            println!("signing key written to {}", path.display());
        }
        None => println!("secret key: {}", signer.secret_hex()),
    }
    println!("trust store entry:");
    println!("[trust.producers]");
    println!("\"{producer_id}\" = \"{}\"", signer.public_key_hex());
    Ok(())
}
