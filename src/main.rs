//! `fluux-xmpp`: a diagnostic command-line client.
//!
//! Connects one account, sends initial presence, prints the session as JSON
//! and logs whatever arrives until interrupted.

use std::path::{Path, PathBuf};

use fluux_xmpp::{ConnectionConfig, ConnectionEvent, Stanza, XmppConnection};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

fn print_help() {
    eprintln!("fluux-xmpp v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-xmpp --jid=JID [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --jid=JID         Account to log in with");
    eprintln!("      --server=SERVER   Server override (tls://host:port, tcp://host:port, wss://url, host:port)");
    eprintln!("      --config=FILE     Load connection settings from a JSON file");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform data dir)");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -V, --version         Print version and exit");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  XMPP_PASSWORD         Account password");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

/// Value of a `--name=value` flag.
fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .find_map(|arg| arg.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
}

fn log_directory(log_file_path: Option<&str>) -> PathBuf {
    match log_file_path {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fluux-xmpp")
            .join("logs"),
    }
}

/// File log always; stderr only when asked for.
fn init_tracing(log_dir: &Path, verbose_level: Option<&str>) -> WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_xmpp=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(log_dir, "fluux-xmpp.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_xmpp=debug,info")
        } else {
            // Traffic stays out unless explicitly requested.
            EnvFilter::new("fluux_xmpp=debug,fluux_xmpp::traffic=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    guard
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        println!("fluux-xmpp v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        std::process::exit(0);
    }

    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let log_file_path = flag_value(&args, "--log-file");
    let log_dir = log_directory(log_file_path);
    let _guard = init_tracing(&log_dir, verbose_level);

    let dangerous_insecure_tls = args.iter().any(|arg| arg == "--dangerous-insecure-tls");
    if dangerous_insecure_tls {
        eprintln!("WARNING: server certificates will not be verified. Use this against test servers only.");
    }

    let mut config = match flag_value(&args, "--config") {
        Some(path) => match ConnectionConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => ConnectionConfig::default(),
    };
    if let Some(jid) = flag_value(&args, "--jid") {
        config.jid = jid.to_string();
    }
    if let Some(server) = flag_value(&args, "--server") {
        config.server = Some(server.to_string());
    }
    if let Ok(password) = std::env::var("XMPP_PASSWORD") {
        config.password = password;
    }
    if dangerous_insecure_tls {
        config.insecure_tls = true;
    }
    if config.jid.is_empty() {
        eprintln!("Missing --jid (see --help)");
        std::process::exit(2);
    }

    info!(version = env!("CARGO_PKG_VERSION"), build = env!("GIT_HASH"), log_dir = %log_dir.display(), "Starting");
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start the async runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(config));
    drop(runtime);
    drop(_guard);
    std::process::exit(code);
}

async fn run(config: ConnectionConfig) -> i32 {
    let (connection, mut events) = match XmppConnection::connect(config).await {
        Ok(connected) => connected,
        Err(e) => {
            error!(error = %e, "Connection failed");
            eprintln!("Connection failed: {}", e);
            return 1;
        }
    };

    if let Err(e) = connection.send(&Stanza::presence()) {
        warn!(error = %e, "Could not send initial presence");
    }
    match serde_json::to_string_pretty(&connection.session()) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!(error = %e, "Could not serialise session"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                connection.disconnect().await;
                return 0;
            }
            event = events.recv() => match event {
                Some(ConnectionEvent::Stanza(stanza)) => {
                    info!(kind = stanza.kind().as_str(), from = ?stanza.from(), id = ?stanza.id(), "Stanza received");
                    println!("{}", stanza.to_xml());
                }
                Some(ConnectionEvent::StanzaLost(entry)) => {
                    warn!(seq = entry.seq, id = ?entry.id, "Stanza lost");
                }
                Some(ConnectionEvent::Reconnecting { attempt, delay }) => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
                }
                Some(ConnectionEvent::Connected { jid, resumed }) => {
                    info!(jid = ?jid, resumed, "Connected");
                }
                Some(ConnectionEvent::Disconnected { error: Some(e) }) => {
                    eprintln!("Disconnected: {}", e);
                    return 1;
                }
                Some(ConnectionEvent::Disconnected { error: None }) | None => return 0,
            }
        }
    }
}
