//! Worker client (load generator): opens one TCP connection per thread and
//! hammers a server with length-prefixed requests, either driven by its own
//! command line (standalone mode) or by a client controller over the
//! network (controller mode).
//!
//! Grounded on `examples/original_source/client/src/{main.c,run.c,state.c,
//! thread.c,handle.c,log.c}`: the standalone-vs-controller split on
//! `duration != 0` (`main.c`/`state.c`), the poll-with-timeout signal check
//! in `run_controller` (`run.c`), the one-thread-per-processor fan-out
//! (`thread.c`'s `get_processors`/`create_threads`), and the per-request
//! connect/write/read/log cycle (`handle.c`). Thread cancellation is
//! cooperative (`keep_running: Arc<AtomicBool>`, checked between
//! iterations) rather than `pthread_cancel`, since Rust threads have no
//! async-cancellation primitive and workers only need to stop between
//! iterations, not mid-syscall.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use bench_core::logrecord::{LogRecord, LogSink, MutexLogSink};
use bench_core::protocol::{self, ControlOpcode, PayloadRecord};

/// Benchmarking load generator: one TCP connection per worker thread,
/// standalone or controller-driven.
#[derive(Parser, Debug)]
#[command(name = "worker-client")]
struct Cli {
    /// Server IPv4 address (standalone mode).
    #[arg(short, long = "server_ip", env = "CLIENT_SERVER_IP")]
    server_ip: Option<String>,

    /// Controller IPv4 address (controller mode).
    #[arg(short, long = "controller_ip", env = "CLIENT_CONTROLLER_IP")]
    controller_ip: Option<String>,

    /// Server TCP port (standalone mode).
    #[arg(short = 'p', long = "server_port", env = "CLIENT_SERVER_PORT", default_value_t = bench_core::config::DEFAULT_SERVER_PORT)]
    server_port: u16,

    /// Controller TCP port (controller mode).
    #[arg(short = 'P', long = "controller_port", env = "CLIENT_CONTROLLER_PORT", default_value_t = bench_core::config::DEFAULT_LISTEN_PORT)]
    controller_port: u16,

    /// Path to the data file replayed as the request body (standalone mode).
    #[arg(short, long, env = "CLIENT_DATA")]
    data: Option<PathBuf>,

    /// Test duration in seconds. Non-zero selects standalone mode; zero
    /// selects controller mode.
    #[arg(short = 't', long = "duration", env = "CLIENT_DURATION", default_value_t = 0)]
    duration: u64,

    /// Path to the CSV measurement log file, opened in truncation mode.
    #[arg(short = 'L', long = "log", env = "CLIENT_LOG")]
    log: PathBuf,

    /// Minimum severity a log record must have to be emitted.
    #[arg(long = "log-level", env = "CLIENT_LOG_LEVEL", default_value_t = LevelFilter::Info)]
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
            eprintln!("worker-client: {:#}", e.root_cause());
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let log_sink: Arc<dyn LogSink> =
        Arc::new(MutexLogSink::open(&cli.log).context("opening the measurement log file")?);

    let keep_running = Arc::new(AtomicBool::new(true));
    for sig in [libc::SIGINT, libc::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&keep_running))
            .with_context(|| format!("registering signal {sig}"))?;
    }

    if cli.duration != 0 {
        run_standalone(&cli, log_sink, keep_running)
    } else {
        run_controller(&cli, log_sink, keep_running)
    }
}

/// Standalone mode: one fixed test period driven entirely by the command
/// line, matching `run_standalone`/`wait_duration` in the original source.
fn run_standalone(cli: &Cli, log_sink: Arc<dyn LogSink>, keep_running: Arc<AtomicBool>) -> Result<i32> {
    let server_ip = cli
        .server_ip
        .as_deref()
        .context("--server_ip is required in standalone mode (duration != 0)")?;
    let data_path = cli
        .data
        .as_ref()
        .context("--data is required in standalone mode (duration != 0)")?;

    let ip: IpAddr = server_ip
        .parse()
        .with_context(|| format!("parsing server IP {server_ip}"))?;
    let server_addr = SocketAddr::new(ip, cli.server_port);
    let data = Arc::new(
        std::fs::read(data_path)
            .with_context(|| format!("reading data file {}", data_path.display()))?,
    );

    log::info!("running in standalone mode against {server_addr}");
    let handles = spawn_workers(server_addr, data, Arc::clone(&log_sink), Arc::clone(&keep_running));

    println!(
        "Starting {} second load test with {} threads",
        cli.duration,
        handles.len()
    );
    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    while Instant::now() < deadline && keep_running.load(Ordering::SeqCst) {
        print!(".");
        std::io::Write::flush(&mut std::io::stdout()).ok();
        std::thread::sleep(Duration::from_secs(1));
    }
    println!("done");

    keep_running.store(false, Ordering::SeqCst);
    join_workers(handles);
    Ok(0)
}

/// Controller mode: connects to the controller, then loops reading opcodes
/// until STOP arrives or a signal is delivered, matching `run_controller`/
/// `handle_controller` in the original source.
fn run_controller(cli: &Cli, log_sink: Arc<dyn LogSink>, keep_running: Arc<AtomicBool>) -> Result<i32> {
    let controller_ip = cli
        .controller_ip
        .as_deref()
        .context("--controller_ip is required in controller mode (duration == 0)")?;
    let ip: IpAddr = controller_ip
        .parse()
        .with_context(|| format!("parsing controller IP {controller_ip}"))?;
    let controller_addr = SocketAddr::new(ip, cli.controller_port);

    log::info!("connecting to controller at {controller_addr}");
    let mut conn = TcpStream::connect(controller_addr)
        .with_context(|| format!("connecting to controller at {controller_addr}"))?;

    let mut handles: Vec<WorkerHandle> = Vec::new();
    let session_running = Arc::new(AtomicBool::new(false));

    loop {
        if !keep_running.load(Ordering::SeqCst) {
            session_running.store(false, Ordering::SeqCst);
            join_workers(handles);
            return Ok(0);
        }
        if !wait_readable_with_timeout(&conn, Duration::from_millis(500))? {
            continue;
        }

        let opcode = match protocol::read_opcode(&mut conn) {
            Ok(Ok(opcode)) => opcode,
            Ok(Err(unknown)) => bail!("unknown opcode {unknown} received from controller"),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::info!("controller closed the connection");
                session_running.store(false, Ordering::SeqCst);
                join_workers(handles);
                return Ok(0);
            }
            Err(e) => return Err(e).context("reading opcode from controller"),
        };

        match opcode {
            ControlOpcode::Start => {
                let payload =
                    PayloadRecord::read_from(&mut conn).context("reading payload record from controller")?;
                let server_ip: IpAddr = payload
                    .server_ip
                    .trim_end_matches('\0')
                    .parse()
                    .with_context(|| format!("parsing server IP {}", payload.server_ip))?;
                let server_addr = SocketAddr::new(server_ip, payload.server_port);
                log::info!("received START for {server_addr}, {} byte payload", payload.data.len());

                if !handles.is_empty() {
                    // A second START without an intervening STOP: stop the
                    // previous session's workers before starting a new one.
                    session_running.store(false, Ordering::SeqCst);
                    join_workers(std::mem::take(&mut handles));
                }
                session_running.store(true, Ordering::SeqCst);
                handles = spawn_workers(
                    server_addr,
                    Arc::new(payload.data),
                    Arc::clone(&log_sink),
                    Arc::clone(&session_running),
                );
            }
            ControlOpcode::Stop => {
                log::info!("received STOP, stopping {} workers", handles.len());
                session_running.store(false, Ordering::SeqCst);
                join_workers(std::mem::take(&mut handles));
                return Ok(0);
            }
        }
    }
}

/// `poll`s `stream` for readability with a bounded timeout, mirroring
/// `run_controller`'s `POLL_TIMEOUT_MSECS` gate so the surrounding loop gets
/// a chance to re-check `keep_running` between waits. Returns `true` once
/// the stream is actually readable.
fn wait_readable_with_timeout(stream: &TcpStream, timeout: Duration) -> Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags};
    use std::os::fd::BorrowedFd;

    // SAFETY: `stream` outlives this call, which is the only thing borrowing its fd.
    let borrowed = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    match poll(&mut fds, timeout.as_millis() as i32) {
        Ok(_) => Ok(fds[0].revents().is_some_and(|r| !r.is_empty())),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(e).context("polling controller connection"),
    }
}

struct WorkerHandle {
    thread: std::thread::JoinHandle<()>,
}

fn spawn_workers(
    server_addr: SocketAddr,
    data: Arc<Vec<u8>>,
    log_sink: Arc<dyn LogSink>,
    keep_running: Arc<AtomicBool>,
) -> Vec<WorkerHandle> {
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (0..n)
        .map(|thread_id| {
            let data = Arc::clone(&data);
            let log_sink = Arc::clone(&log_sink);
            let keep_running = Arc::clone(&keep_running);
            WorkerHandle {
                thread: std::thread::spawn(move || {
                    worker_loop(thread_id, server_addr, &data, &log_sink, &keep_running)
                }),
            }
        })
        .collect()
}

fn join_workers(handles: Vec<WorkerHandle>) {
    for handle in handles {
        let _ = handle.thread.join();
    }
}

/// One worker thread's whole life: connect, send, receive, log, close,
/// repeat until `keep_running` clears. Matches `handle()`/`create_threads()`
/// in the original source, generalized from a single fixed thread to a
/// cooperative-cancellation loop shared across a thread pool.
fn worker_loop(
    thread_id: usize,
    server_addr: SocketAddr,
    data: &[u8],
    log_sink: &Arc<dyn LogSink>,
    keep_running: &AtomicBool,
) {
    while keep_running.load(Ordering::SeqCst) {
        let stream = match TcpStream::connect(server_addr) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("thread {thread_id} could not connect to {server_addr}: {e}");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        if let Err(e) = run_one_request(thread_id, stream, data, log_sink) {
            log::warn!("thread {thread_id} request to {server_addr} failed: {e}");
            return;
        }
    }
}

fn run_one_request(
    thread_id: usize,
    mut stream: TcpStream,
    data: &[u8],
    log_sink: &Arc<dyn LogSink>,
) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    let fd = stream.as_raw_fd();

    let start_wall = SystemTime::now();
    let start_instant = Instant::now();
    protocol::send_request(&mut stream, data)?;
    let received = protocol::receive_reply(&mut stream)?;
    let end_wall = SystemTime::now();

    let record = LogRecord {
        start_timestamp: start_wall,
        identifier: format!("{thread_id}:{fd}"),
        peer_ip: peer.ip().to_string(),
        peer_port: peer.port(),
        bytes: received as u64,
        end_timestamp: end_wall,
        elapsed_secs: start_wall.elapsed().unwrap_or_default().as_secs_f64(),
        elapsed_high_res_secs: start_instant.elapsed().as_secs_f64(),
    };
    if let Err(e) = log_sink.append(&record) {
        log::warn!("failed to append log record: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::logrecord::MutexLogSink;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn run_one_request_logs_the_byte_count_the_server_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).unwrap();
            stream.write_all(&(len as u32).to_be_bytes()).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let log_sink: Arc<dyn LogSink> = Arc::new(MutexLogSink::in_memory());
        run_one_request(0, stream, b"HELLO", &log_sink).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn worker_loop_exits_immediately_when_keep_running_is_already_false() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let log_sink: Arc<dyn LogSink> = Arc::new(MutexLogSink::in_memory());
        let keep_running = AtomicBool::new(false);

        worker_loop(0, addr, b"data", &log_sink, &keep_running);
        // No assertion beyond "returns": a worker loop whose flag is already
        // clear must not attempt a single connection.
        drop(listener);
    }
}
