// CLI entry point for a headless Hexfront host.
//
// Starts a server messenger that game clients connect to, with the
// invocation layer and moderation registry attached. Game logic registers
// its delegates against the returned unified messenger; this binary just
// keeps the session alive.
//
// Usage:
//   host [OPTIONS]
//     --port <PORT>             Listen port (default: 7654)
//     --name <NAME>             Session name (default: hexfront-session)
//     --password <PASS>         Session password (optional)
//     --max-nodes <N>           Max connected nodes (default: 8)
//     --invoke-timeout <SECS>   Bound invoke_and_wait; 0 = wait forever

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hexfront_messenger::messenger::Messenger;
use hexfront_messenger::moderation::ModerationRegistry;
use hexfront_messenger::server::{HostConfig, ServerMessenger};
use hexfront_messenger::unified::UnifiedMessenger;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_names(true))
        .init();

    let config = parse_args();
    let invoke_timeout = config.invoke_timeout;

    let (server, addr) = match ServerMessenger::bind(&config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start host: {e}");
            std::process::exit(1);
        }
    };

    let _unified = UnifiedMessenger::new(
        Arc::new(server.clone()) as Arc<dyn Messenger>,
        invoke_timeout,
    );
    let _moderation = ModerationRegistry::new(server.clone());

    println!("Host listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // The process exits on SIGINT/SIGTERM; the session dies with it. The
    // loop only exists so a moderator shutdown can end the process cleanly.
    while server.is_running() {
        std::thread::sleep(Duration::from_millis(100));
    }
    println!("Session ended.");
}

/// Parse command-line arguments into a `HostConfig`. Uses simple
/// `std::env::args()` matching — no clap dependency.
fn parse_args() -> HostConfig {
    let mut config = HostConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--name" => {
                i += 1;
                config.session_name = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--name requires a value");
                    std::process::exit(1);
                });
            }
            "--password" => {
                i += 1;
                config.password = args.get(i).cloned().or_else(|| {
                    eprintln!("--password requires a value");
                    std::process::exit(1);
                });
            }
            "--max-nodes" => {
                i += 1;
                config.max_nodes = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--max-nodes requires a valid number");
                    std::process::exit(1);
                });
            }
            "--invoke-timeout" => {
                i += 1;
                let secs: u64 = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--invoke-timeout requires a number of seconds");
                    std::process::exit(1);
                });
                config.invoke_timeout = (secs > 0).then_some(Duration::from_secs(secs));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: host [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>             Listen port (default: 7654)");
    println!("  --name <NAME>             Session name (default: hexfront-session)");
    println!("  --password <PASS>         Session password (optional)");
    println!("  --max-nodes <N>           Max connected nodes (default: 8)");
    println!("  --invoke-timeout <SECS>   Bound invoke_and_wait; 0 = wait forever");
    println!("  --help, -h                Show this help");
}
