//! duo-chat-relay: policy-enforcing WebSocket relay between chat clients and
//! an upstream XMPP server.

mod relay;

use relay::{ChatRelay, ChatStore};
use std::path::Path;
use tracing::{error, info};

const DEFAULT_LISTEN: &str = "0.0.0.0:5443";
const DEFAULT_UPSTREAM: &str = "ws://127.0.0.1:5442";
const DEFAULT_DB: &str = "duo-chat.db";

fn print_usage() {
    eprintln!("duo-chat-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: duo-chat-relay [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --listen=HOST:PORT  Listen address for client WebSocket connections");
    eprintln!("                          (default: {DEFAULT_LISTEN}, env: DUO_CHAT_LISTEN)");
    eprintln!("      --upstream=URL      Upstream chat server WebSocket URL");
    eprintln!("                          (default: {DEFAULT_UPSTREAM}, env: DUO_CHAT_UPSTREAM)");
    eprintln!("      --db=PATH           Policy store database file");
    eprintln!("                          (default: {DEFAULT_DB}, env: DUO_CHAT_DB)");
    eprintln!("      --log-dir=PATH      Also write a daily-rotating log file to this directory");
    eprintln!("  -v, --verbose           Enable debug logging to stderr");
    eprintln!("  -h, --help              Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG                Override log filter (e.g. RUST_LOG=debug)");
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    args.iter()
        .find_map(|arg| arg.strip_prefix(&prefix).map(str::to_string))
}

fn flag_or_env(args: &[String], name: &str, env: &str) -> Option<String> {
    flag_value(args, name).or_else(|| std::env::var(env).ok())
}

/// Initialize the tracing subscriber: a stderr layer always, plus an optional
/// daily-rotating file layer when `--log-dir` is given. The returned guard
/// must stay alive for the program's lifetime or buffered file output is
/// lost.
fn init_tracing(
    verbose: bool,
    log_dir: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("duo_chat_relay=debug,info")
    } else {
        EnvFilter::new("duo_chat_relay=info,warn")
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Warning: could not create log directory '{dir}': {e}");
            }
            let file_appender = tracing_appender::rolling::daily(dir, "duo-chat-relay.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_filter = if std::env::var("RUST_LOG").is_ok() {
                EnvFilter::from_default_env()
            } else {
                EnvFilter::new("duo_chat_relay=info,info")
            };
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        return;
    }

    let verbose = args.iter().any(|arg| arg == "--verbose" || arg == "-v");
    let listen = flag_or_env(&args, "--listen", "DUO_CHAT_LISTEN")
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let upstream = flag_or_env(&args, "--upstream", "DUO_CHAT_UPSTREAM")
        .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());
    let db_path =
        flag_or_env(&args, "--db", "DUO_CHAT_DB").unwrap_or_else(|| DEFAULT_DB.to_string());
    let log_dir = flag_value(&args, "--log-dir");

    let _log_guard = init_tracing(verbose, log_dir.as_deref());

    info!(listen = %listen, upstream = %upstream, db = %db_path, "Starting duo-chat-relay");

    let store = match ChatStore::open(Path::new(&db_path)) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %db_path, "Failed to open policy store");
            std::process::exit(1);
        }
    };

    let mut relay = ChatRelay::new();
    match relay.start(&listen, upstream, store).await {
        Ok(addr) => info!(addr = %addr, "Relay listening"),
        Err(e) => {
            error!(error = %e, "Failed to start relay");
            std::process::exit(1);
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    relay.stop().await;
    info!("Relay stopped");
}
