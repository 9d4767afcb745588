//! `kvslave` — a replica server. In TPC mode it registers with a
//! coordinator before serving.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

/// Starts a key-value replica.
#[derive(Parser, Debug)]
#[command(name = "kvslave")]
struct Args {
    /// Port this replica listens on.
    #[arg(default_value_t = 9000)]
    slave_port: u16,

    /// Port of the coordinator to register with in TPC mode.
    #[arg(default_value_t = 8888)]
    master_port: u16,

    /// Run as a two-phase-commit participant, registering with the
    /// coordinator at `master_port` before serving.
    #[arg(short = 't', long = "tpc")]
    tpc: bool,

    #[arg(long, default_value = "localhost", env = "KV_HOST")]
    host: String,

    #[arg(long, env = "KV_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 4, env = "KV_MAX_THREADS")]
    max_threads: usize,

    #[arg(long, default_value = "info", env = "KV_LOG_LEVEL")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => return exit_code_for_clap_error(e),
    };
    init_tracing(&args.log_level);

    if let Err(err) = run(args) {
        tracing::error!(error = ?err, "kvslave exiting on fatal error");
        return ExitCode::from(exit_code_for_failure(&err));
    }
    ExitCode::SUCCESS
}

fn run(args: Args) -> anyhow::Result<()> {
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("./data/slave-{}", args.slave_port)));

    let config = kv_replica::Config {
        host: args.host.clone(),
        port: args.slave_port,
        data_dir,
        tpc: args.tpc,
        ..kv_replica::Config::default()
    };
    let replica = Arc::new(kv_replica::Replica::open(config).context("opening replica store")?);

    if args.tpc {
        register_with_master(&args)?;
    }

    let listener = TcpListener::bind((args.host.as_str(), args.slave_port))
        .with_context(|| format!("binding to {}:{}", args.host, args.slave_port))?;
    tracing::info!(host = %args.host, port = args.slave_port, tpc = args.tpc, "kvslave listening");

    let server = kv_net::Server::start(listener, args.max_threads, move |mut stream| {
        let span = tracing::info_span!("request", peer = ?stream.peer_addr().ok());
        let _enter = span.enter();
        match kv_wire::read_message(&mut stream) {
            Ok(req) => {
                let resp = replica.handle(&req);
                if let Err(e) = kv_wire::write_message(&mut stream, &resp) {
                    tracing::warn!(error = %e, "failed to write response");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to read request");
            }
        }
    });

    // The acceptor and worker pool run until the process is killed.
    let _ = &server;
    loop {
        std::thread::park();
    }
}

fn register_with_master(args: &Args) -> anyhow::Result<()> {
    let connector = kv_net::Connector::default();
    let request = kv_wire::Message::new(kv_wire::MessageType::Register)
        .with_key(args.host.clone())
        .with_value(args.slave_port.to_string());
    let response = connector
        .round_trip(&args.host, args.master_port, &request)
        .context("registering with coordinator")?;
    if !response.is_success() {
        anyhow::bail!("coordinator rejected registration: {:?}", response.message);
    }
    tracing::info!(master_port = args.master_port, "registered with coordinator");
    Ok(())
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
