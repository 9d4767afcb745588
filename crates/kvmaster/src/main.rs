//! `kvmaster` — the coordinator fronting a fixed set of replicas.

use std::net::TcpListener;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use kv_coordinator::{Config, Coordinator};

/// Starts the key-value coordinator.
#[derive(Parser, Debug)]
#[command(name = "kvmaster")]
struct Args {
    #[arg(default_value_t = 8888)]
    port: u16,

    #[arg(long, default_value = "localhost", env = "KV_HOST")]
    host: String,

    #[arg(long, default_value_t = 4, env = "KV_MAX_THREADS")]
    max_threads: usize,

    #[arg(long, default_value = "info", env = "KV_LOG_LEVEL")]
    log_level: String,

    #[arg(long, default_value_t = 2)]
    slave_capacity: usize,

    #[arg(long, default_value_t = 2)]
    redundancy: usize,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => return exit_code_for_clap_error(e),
    };
    init_tracing(&args.log_level);

    if let Err(err) = run(args) {
        tracing::error!(error = ?err, "kvmaster exiting on fatal error");
        return ExitCode::from(exit_code_for_failure(&err));
    }
    ExitCode::SUCCESS
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = Config {
        host: args.host.clone(),
        port: args.port,
        slave_capacity: args.slave_capacity,
        redundancy: args.redundancy,
        ..Config::default()
    };
    let coordinator = std::sync::Arc::new(Coordinator::new(config));

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .with_context(|| format!("binding to {}:{}", args.host, args.port))?;
    tracing::info!(
        host = %args.host,
        port = args.port,
        slave_capacity = args.slave_capacity,
        redundancy = args.redundancy,
        "kvmaster listening"
    );

    let server = kv_net::Server::start(listener, args.max_threads, move |mut stream| {
        let span = tracing::info_span!("request", peer = ?stream.peer_addr().ok());
        let _enter = span.enter();
        match kv_wire::read_message(&mut stream) {
            Ok(req) => {
                let resp = coordinator.handle(&req);
                if let Err(e) = kv_wire::write_message(&mut stream, &resp) {
                    tracing::warn!(error = %e, "failed to write response");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to read request");
            }
        }
    });

    let _ = &server;
    loop {
        std::thread::park();
    }
}

/// Prints clap's own usage message and maps it to the process exit code: 0
/// for `--help`/`--version`, 1 for an actual usage error.
fn exit_code_for_clap_error(e: clap::Error) -> ExitCode {
    let _ = e.print();
    match e.kind() {
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
            ExitCode::SUCCESS
        }
        _ => ExitCode::from(1),
    }
}

/// Surfaces a fatal I/O failure's OS errno when one is available, falling
/// back to a generic failure code otherwise.
fn exit_code_for_failure(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .and_then(|io_err| io_err.raw_os_error())
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
