//! Host shell for the three server back-ends.
//!
//! Grounded on `examples/shadow-shadow/src/main/core/main.rs`'s overall shape
//! (clap parse, `anyhow`-wrapped setup, run, two-part error report at the
//! top level) and on `examples/original_source/core/src/main.c`'s CLI
//! surface (`--config/-c`, `--library/-l`, env prefix `SCALABLE_SERVER_`,
//! default library `"one-to-one"`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use bench_backend_blocking::BlockingBackend;
use bench_backend_poll::PollBackend;
use bench_backend_workerpool::WorkerPoolBackend;
use bench_core::logrecord::MutexLogSink;
use bench_core::{lifecycle::run_lifecycle, CoreObject, Settings};

/// Which concurrency back-end the `--library` flag names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Library {
    OneToOne,
    Poll,
    WorkerPool,
}

impl std::str::FromStr for Library {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "one-to-one" => Ok(Self::OneToOne),
            "poll" => Ok(Self::Poll),
            "worker-pool" => Ok(Self::WorkerPool),
            other => {
                bail!("unknown library \"{other}\" (expected one-to-one, poll, or worker-pool)")
            }
        }
    }
}

impl std::fmt::Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OneToOne => "one-to-one",
            Self::Poll => "poll",
            Self::WorkerPool => "worker-pool",
        };
        f.write_str(name)
    }
}

/// Benchmarking TCP echo-style server: one binary, three swappable
/// concurrency back-ends.
#[derive(Parser, Debug)]
#[command(name = "scalable-server")]
struct Cli {
    /// Path to the CSV measurement log file, opened in truncation mode.
    #[arg(short, long, env = "SCALABLE_SERVER_CONFIG")]
    config: PathBuf,

    /// Concurrency back-end to run: one-to-one, poll, or worker-pool.
    #[arg(short, long, env = "SCALABLE_SERVER_LIBRARY", default_value_t = Library::OneToOne)]
    library: Library,

    /// TCP port to listen on.
    #[arg(short, long, env = "SCALABLE_SERVER_PORT", default_value_t = bench_core::config::DEFAULT_SERVER_PORT)]
    port: u16,

    /// IPv4 address to listen on.
    #[arg(short, long = "ip-addr", env = "SCALABLE_SERVER_IP_ADDR", default_value_t = Ipv4Addr::LOCALHOST)]
    ip_addr: Ipv4Addr,

    /// Minimum severity a log record must have to be emitted.
    #[arg(long = "log-level", env = "SCALABLE_SERVER_LOG_LEVEL", default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = bench_core::logging::init(cli.log_level) {
        eprintln!("failed to initialize logging: {:#}", e.root_cause());
        std::process::exit(1);
    }

    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", bench_core::logging::format_error_chain(&e));
            eprintln!("scalable-server: {:#}", e.root_cause());
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let listen_addr = SocketAddr::new(IpAddr::V4(cli.ip_addr), cli.port);

    let log_sink: Arc<dyn bench_core::LogSink> = match cli.library {
        Library::WorkerPool => WorkerPoolBackend::shared_log_sink(&cli.config)
            .context("opening the worker-pool back-end's shared log sink")?,
        Library::OneToOne | Library::Poll => Arc::new(
            MutexLogSink::open(&cli.config).context("opening the measurement log file")?,
        ),
    };

    let core = CoreObject::new(listen_addr, log_sink, Settings::default());

    log::info!("starting {} back-end on {listen_addr}", cli.library);

    let exit_code = match cli.library {
        Library::OneToOne => run_lifecycle(&mut BlockingBackend::new(), &core),
        Library::Poll => run_lifecycle(&mut PollBackend::new(), &core),
        Library::WorkerPool => run_lifecycle(&mut WorkerPoolBackend::new(), &core),
    };

    Ok(exit_code)
}
