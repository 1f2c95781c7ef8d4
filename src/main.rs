use std::process::ExitCode;
use std::time::Duration;

use fluux_xmpp::xmpp::error::{Error, Result};
use fluux_xmpp::xmpp::jid::Jid;
use fluux_xmpp::xmpp::packet::{Iq, StanzaError};
use fluux_xmpp::xmpp::{ClientConfig, Connection, Event};

const PASSWORD_ENV: &str = "FLUUX_XMPP_PASSWORD";
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

fn print_help() {
    eprintln!("fluux-xmpp v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-xmpp [OPTIONS] <JID>");
    eprintln!();
    eprintln!("Connects, prints the roster and server features, then pings the");
    eprintln!("server until interrupted. The password is read from ${}.", PASSWORD_ENV);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform data dir)");
    eprintln!("      --server=ADDR     Connect to ADDR instead of resolving SRV records");
    eprintln!("                        (tls://host:port, tcp://host:port, host:port or domain)");
    eprintln!("      --resource=NAME   Resource to request at bind time");
    eprintln!("      --sm-window=N     Request a Stream Management ack every N stanzas");
    eprintln!("      --no-sm           Do not enable Stream Management");
    eprintln!("      --ping-interval=SECS");
    eprintln!("                        Seconds between keepalive pings (default 30)");
    eprintln!("      --allow-plaintext Continue when the server does not offer STARTTLS");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!("      --version         Show version and build");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

/// Daily-rotating file log, plus stderr when asked for.
fn init_logging(verbose_level: Option<&str>, log_file_path: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = match log_file_path {
        Some(path) => std::path::PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("com.processone.fluux")
            .join("logs"),
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_xmpp=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-xmpp.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || log_file_path.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_xmpp=debug,info")
        } else {
            EnvFilter::new("fluux_xmpp=info,info")
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

    // The writer thread must outlive every log call
    std::mem::forget(guard);
    eprintln!("Log file: {}", log_dir.display());
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| arg.strip_prefix(name))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|arg| arg == "--version") {
        println!("fluux-xmpp v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        return ExitCode::SUCCESS;
    }

    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    init_logging(verbose_level, flag_value(&args, "--log-file="));

    let Some(jid) = args.iter().find(|arg| !arg.starts_with('-')) else {
        print_help();
        return ExitCode::from(2);
    };
    let jid: Jid = match jid.parse() {
        Ok(jid) => jid,
        Err(e) => {
            eprintln!("Invalid JID '{}': {}", jid, e);
            return ExitCode::from(2);
        }
    };
    let password = std::env::var(PASSWORD_ENV).unwrap_or_default();

    let dangerous_insecure_tls = args.iter().any(|arg| arg == "--dangerous-insecure-tls");
    if dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let mut config = ClientConfig::new(jid, password)
        .with_dangerous_insecure_tls(dangerous_insecure_tls)
        .with_require_tls(!args.iter().any(|arg| arg == "--allow-plaintext"));
    if let Some(server) = flag_value(&args, "--server=") {
        config = config.with_server(server);
    }
    if let Some(resource) = flag_value(&args, "--resource=") {
        config = config.with_resource(resource);
    }
    let window = match flag_value(&args, "--sm-window=").map(str::parse::<u32>) {
        Some(Ok(window)) => window,
        Some(Err(e)) => {
            eprintln!("Invalid --sm-window: {}", e);
            return ExitCode::from(2);
        }
        None => config.sm_window,
    };
    let sm_enabled = !args.iter().any(|arg| arg == "--no-sm");
    config = config.with_stream_management(sm_enabled, window, false);
    let ping_interval = match flag_value(&args, "--ping-interval=").map(str::parse::<u64>) {
        Some(Ok(secs)) if secs > 0 => Duration::from_secs(secs),
        Some(_) => {
            eprintln!("Invalid --ping-interval");
            return ExitCode::from(2);
        }
        None => DEFAULT_PING_INTERVAL,
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        jid = %config.jid,
        "Starting"
    );

    match run(config, ping_interval).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Session failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ClientConfig, ping_interval: Duration) -> Result<()> {
    let conn = Connection::connect(config).await?;
    let mut events = conn.subscribe();
    println!(
        "Connected as {}",
        conn.jid().map(|j| j.to_string()).unwrap_or_default()
    );

    let roster = conn.get_roster().await?;
    println!("{}", serde_json::to_string_pretty(&roster).unwrap_or_default());

    match conn.disco_info(None, None).await {
        Ok(info) => println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default()),
        Err(e) => tracing::warn!(error = %e, "Server discovery failed"),
    }

    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = ticker.tick() => match conn.ping(None).await {
                Ok(rtt) => tracing::info!(rtt_ms = rtt.as_millis() as u64, "Ping"),
                // A missed pong is retried on the next tick
                Err(e) if e.is_retryable() && !matches!(e, Error::Closed) => {
                    tracing::warn!(error = %e, "Ping failed")
                }
                Err(e) => return Err(e),
            },
            event = events.recv() => match event {
                Ok(Event::Message(message)) => {
                    println!("{}", message.to_xml());
                }
                Ok(Event::Iq(request)) => {
                    let reply = Iq::error_for(&request, StanzaError::new("cancel", "service-unavailable"));
                    conn.send(reply.to_element()).await?;
                }
                Ok(Event::StreamIntegrity(violation)) => {
                    tracing::warn!(%violation, "Stream Management accounting is unreliable");
                }
                Ok(Event::Disconnected(reason)) => {
                    tracing::warn!(?reason, "Disconnected");
                    return Err(Error::Closed);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Some(status) = conn.stream_management() {
        tracing::info!(sent = status.sent, acked = status.acked, handled = status.handled, "Stream Management totals");
    }
    conn.close().await;
    Ok(())
}
