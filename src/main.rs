//! ballotd - Vote notification server and forwarding relay daemon.

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ballotd::config::{ForwardingMethod, ForwardingRole, Settings};
use ballotd::crypto::{derive_key, new_token, KeyPair, TokenStore};
use ballotd::error::BallotError;
use ballotd::forwarding::{
    CachingForwardingSource, ForwardingSink, ForwardingTransport, InProcessBroker, RedisBroker,
};
use ballotd::protocol::{ProtocolVersion, VoteHandler};
use ballotd::server::VoteListener;
use ballotd::vote::Vote;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");

fn main() -> ExitCode {
    // Parse command line arguments (simple std::env approach)
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{} {}", NAME, VERSION);
        return ExitCode::SUCCESS;
    }

    let config_path = get_config_path(&args);

    let settings = match Settings::load(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting {} v{}", NAME, VERSION);
    info!("Configuration loaded from: {}", config_path);

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(async_main(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon failed");
            ExitCode::FAILURE
        }
    }
}

/// Dispatches decoded votes: logs every vote, and hands a copy to the
/// forwarding source when one is configured. Forwarding never blocks the
/// session task that decoded the vote.
struct RelayVoteHandler {
    source: Option<Arc<CachingForwardingSource>>,
}

impl VoteHandler for RelayVoteHandler {
    fn on_vote_received(&self, vote: Vote, version: ProtocolVersion, remote: Option<SocketAddr>) {
        match remote {
            Some(addr) => info!(vote = %vote, version = %version, remote = %addr, "Vote received"),
            None => info!(vote = %vote, version = %version, "Forwarded vote received"),
        }

        // Forwarded votes are not forwarded again.
        if version == ProtocolVersion::Forwarded {
            return;
        }

        if let Some(source) = &self.source {
            let source = Arc::clone(source);
            tokio::spawn(async move {
                if let Err(e) = source.forward(&vote).await {
                    warn!(error = %e, "Vote not forwarded");
                }
            });
        }
    }

    fn on_error(&self, err: &BallotError, vote_delivered: bool, remote: SocketAddr) {
        if vote_delivered {
            // The vote made it through; only the tail of the session failed.
            warn!(error = %err, remote = %remote, "Session error after vote delivery");
        } else {
            warn!(error = %err, remote = %remote, "Vote submission rejected");
        }
    }
}

/// Async main function.
async fn async_main(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Arc::new(settings);

    // Key material: RSA keypair for v1, site tokens for v2. Both read-only
    // after this point.
    let keys = Arc::new(KeyPair::load_or_generate(&settings.keys.directory)?);
    let mut tokens = TokenStore::from_config(&settings.keys.tokens)?;
    if tokens.is_empty() {
        let token = new_token();
        info!(
            token = %token,
            "No site tokens configured; generated token 'default' - give it to your voting sites"
        );
        tokens.insert("default", derive_key(&token)?);
    }
    let tokens = Arc::new(tokens);
    info!(sites = tokens.len(), "Token store ready");

    // Forwarding relay wiring.
    let transport: Option<Arc<dyn ForwardingTransport>> = match settings.forwarding.method {
        ForwardingMethod::None => None,
        ForwardingMethod::Channel => Some(InProcessBroker::new() as _),
        ForwardingMethod::Redis => {
            let broker = RedisBroker::connect(&settings.forwarding.redis.url)?;
            let _ = broker.spawn_reconnect_probe(Duration::from_secs(
                settings.forwarding.redis.reconnect_interval_seconds,
            ));
            Some(broker as _)
        }
    };

    let mut source = None;
    let mut sink = None;
    if let Some(transport) = transport {
        match settings.forwarding.role {
            ForwardingRole::Source => {
                let targets = if settings.forwarding.targets.is_empty() {
                    vec![settings.forwarding.channel.clone()]
                } else {
                    settings.forwarding.targets.clone()
                };
                info!(targets = ?targets, "Forwarding votes as source");

                let forwarding_source = CachingForwardingSource::new(
                    transport,
                    targets,
                    settings.forwarding.dump_rate,
                    settings.forwarding.cache_capacity,
                );
                let _ = forwarding_source.spawn_flush_on_reconnect();
                source = Some(forwarding_source);
            }
            ForwardingRole::Sink => {
                let handler: Arc<dyn VoteHandler> = Arc::new(RelayVoteHandler { source: None });
                sink = Some(
                    ForwardingSink::start(transport, &settings.forwarding.channel, handler).await?,
                );
            }
        }
    }

    let handler: Arc<dyn VoteHandler> = Arc::new(RelayVoteHandler {
        source: source.clone(),
    });

    // Bind the vote listener. A negative port means this instance only
    // consumes forwarded votes.
    let listener = VoteListener::bind(
        Arc::clone(&settings),
        Arc::clone(&keys),
        Arc::clone(&tokens),
        handler,
    )
    .await?;

    let shutdown = Arc::new(Notify::new());

    match listener {
        Some(listener) => {
            let shutdown_for_run = Arc::clone(&shutdown);
            tokio::select! {
                result = listener.run(Arc::clone(&shutdown_for_run)) => {
                    result?;
                }
                _ = shutdown_signal() => {
                    info!("Shutdown signal received, initiating graceful shutdown...");
                    shutdown.notify_waiters();

                    let drain_timeout = Duration::from_secs(30);
                    match tokio::time::timeout(drain_timeout, listener.wait_for_drain()).await {
                        Ok(()) => info!("Graceful shutdown complete"),
                        Err(_) => warn!(
                            "Shutdown timeout after {}s, some connections may be terminated",
                            drain_timeout.as_secs()
                        ),
                    }
                }
            }
        }
        None => {
            shutdown_signal().await;
            info!("Shutdown signal received");
        }
    }

    if let Some(source) = source {
        source.shutdown();
    }
    if let Some(sink) = sink {
        sink.halt().await;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print help message.
fn print_help() {
    println!(
        r#"{} {}
Vote notification server and forwarding relay daemon.

USAGE:
    {} [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file
                           [default: /etc/ballotd/config.toml]
    -h, --help             Print help information
    -V, --version          Print version information
"#,
        NAME, VERSION, NAME
    );
}

/// Get configuration file path from command line arguments.
fn get_config_path(args: &[String]) -> String {
    for (i, arg) in args.iter().enumerate() {
        if (arg == "--config" || arg == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }
    "/etc/ballotd/config.toml".to_string()
}

/// Initialize logging based on settings.
fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    let file_writer = match &settings.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("failed to open log file '{}': {}", path.display(), e))?;
            Some(Arc::new(file))
        }
        None => None,
    };

    match settings.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
                .init();
        }
        _ => {
            // Default to pretty format
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
                .init();
        }
    }

    Ok(())
}
