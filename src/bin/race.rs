//! `race` — the Runtime driver CLI.
//!
//! ```text
//! race start <config.toml>       run a Runtime until Ctrl-C or a remote
//!                                 shutdown request; exit 0 on clean
//!                                 shutdown, 1 on startup failure, 2 on a
//!                                 runtime failure after startup
//! race inspect <runtime-uri>     print the lifecycle state of every
//!                                 Entity on a running Runtime
//! race shutdown <runtime-uri>    request a graceful shutdown (idempotent)
//! ```
//!
//! Argument parsing is hand-rolled rather than via a derive framework,
//! matching `araliya-ctl`'s shape: a handful of flat subcommands, no nested
//! flag grammar worth pulling in a dependency for.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use race_core::config;
use race_core::remote::listener;
use race_core::remote::wire::{read_frame, write_frame, WireMessage};
use race_core::remote::RuntimeUri;
use race_core::runtime::{EntityFactory, Runtime};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let Some(command) = args.first() else {
        print_usage();
        return ExitCode::from(1);
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match command.as_str() {
        "start" => {
            let Some(path) = args.get(1) else {
                eprintln!("usage: race start <config.toml>");
                return ExitCode::from(1);
            };
            rt.block_on(run_start(path))
        }
        "inspect" => {
            let Some(uri) = args.get(1) else {
                eprintln!("usage: race inspect <runtime-uri>");
                return ExitCode::from(1);
            };
            rt.block_on(run_inspect(uri))
        }
        "shutdown" => {
            let Some(uri) = args.get(1) else {
                eprintln!("usage: race shutdown <runtime-uri>");
                return ExitCode::from(1);
            };
            rt.block_on(run_shutdown(uri))
        }
        "--help" | "-h" => {
            print_usage();
            ExitCode::from(0)
        }
        other => {
            eprintln!("error: unknown command '{other}'");
            print_usage();
            ExitCode::from(1)
        }
    }
}

fn print_usage() {
    eprintln!("usage: race <command> [args]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  start <config.toml>     run a Runtime from a config file");
    eprintln!("  inspect <runtime-uri>   show the state of every Entity on a running Runtime");
    eprintln!("  shutdown <runtime-uri>  request a graceful shutdown");
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn run_start(path: &str) -> ExitCode {
    let _ = dotenvy::dotenv();

    let cfg = match config::load_from(std::path::Path::new(path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to load config: {e}");
            return ExitCode::from(1);
        }
    };

    init_logging(&cfg.log_level);

    // This binary ships no application Entities of its own — applications
    // embed `race_core` as a library and build their own `main` with a
    // populated registry. A config with entities but no matching registry
    // entries fails fast here with a clear config error, same as it would
    // for an embedding application that forgot to register one.
    let registry: HashMap<String, EntityFactory> = HashMap::new();

    let runtime = match Runtime::build(cfg, &registry) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("error: startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = runtime.start().await {
        eprintln!("error: startup failed: {e}");
        return ExitCode::from(1);
    }

    let listen_addr = runtime.config().listen.clone();
    if let Some(addr) = listen_addr {
        match addr.parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                let runtime = runtime.clone();
                let token = runtime.cancellation_token();
                tokio::spawn(async move {
                    if let Err(e) = listener::serve(addr, runtime, token).await {
                        tracing::warn!(error = %e, "remote listener exited");
                    }
                });
            }
            Err(e) => {
                eprintln!("error: invalid listen address '{addr}': {e}");
                return ExitCode::from(1);
            }
        }
    }

    runtime.wait_for_shutdown_signal().await;
    runtime.shutdown().await;

    ExitCode::from(0)
}

async fn run_inspect(uri_str: &str) -> ExitCode {
    let uri: RuntimeUri = match uri_str.parse() {
        Ok(u) => u,
        Err(e) => {
            eprintln!("error: invalid runtime uri: {e}");
            return ExitCode::from(1);
        }
    };

    match query(&uri, WireMessage::Inspect).await {
        Ok(WireMessage::InspectReply { entities }) => {
            if entities.is_empty() {
                println!("no entities");
            }
            for (name, state) in entities {
                println!("{name}\t{state}");
            }
            ExitCode::from(0)
        }
        Ok(other) => {
            eprintln!("error: unexpected reply: {other:?}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run_shutdown(uri_str: &str) -> ExitCode {
    let uri: RuntimeUri = match uri_str.parse() {
        Ok(u) => u,
        Err(e) => {
            eprintln!("error: invalid runtime uri: {e}");
            return ExitCode::from(1);
        }
    };

    match query(&uri, WireMessage::Shutdown).await {
        Ok(WireMessage::ShutdownAck) => {
            println!("ok  {uri} is shutting down");
            ExitCode::from(0)
        }
        Ok(other) => {
            eprintln!("error: unexpected reply: {other:?}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

/// A single request/reply round trip against a Runtime's listening
/// endpoint — `inspect`/`shutdown` are one-shot clients, not a persistent
/// [`race_core::remote::OutboundLink`].
async fn query(uri: &RuntimeUri, request: WireMessage) -> Result<WireMessage, String> {
    let mut stream = tokio::net::TcpStream::connect((uri.host.as_str(), uri.port))
        .await
        .map_err(|e| format!("cannot connect to {uri}: {e}"))?;

    write_frame(&mut stream, &request).await.map_err(|e| format!("send failed: {e}"))?;
    let reply = read_frame(&mut stream).await.map_err(|e| format!("recv failed: {e}"))?;
    Ok(reply)
}
