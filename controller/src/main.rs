//! Client controller: accepts check-ins from worker clients, then on the
//! operator's `start` command broadcasts a START opcode plus the workload
//! payload, waits out the test duration with a progress ticker, and
//! broadcasts STOP.
//!
//! Grounded on `examples/original_source/client-controller/src/{handle.c,
//! connection.c,state.c}`: the `poll(listen_fd, stdin)` accept/command loop
//! and `MAX_CONNS` cap (`handle.c`), the per-connection opcode broadcast
//! (`connection.c`'s `send_start`/`send_stop`, here using the wire values
//! `1=START, 2=STOP`), and the data-file loading and listen-socket setup
//! (`state.c`).

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use nix::poll::{poll, PollFd, PollFlags};

use bench_core::config::{CONNECTION_QUEUE, MAX_CONTROLLER_CONNECTIONS};
use bench_core::protocol::{ControlOpcode, PayloadRecord};

const START_COMMAND: &str = "start";

/// Benchmarking load-test controller: fans a start/stop broadcast out to a
/// fleet of worker clients.
#[derive(Parser, Debug)]
#[command(name = "client-controller")]
struct Cli {
    /// Local TCP port workers connect to.
    #[arg(short = 'p', long = "listen_port", env = "CONTROLLER_LISTEN_PORT", default_value_t = bench_core::config::DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// IPv4 address of the server under test, relayed to every worker.
    #[arg(short = 's', long = "server_ip", env = "CONTROLLER_SERVER_IP")]
    server_ip: String,

    /// TCP port of the server under test, relayed to every worker.
    #[arg(short = 'P', long = "server_port", env = "CONTROLLER_SERVER_PORT", default_value_t = bench_core::config::DEFAULT_SERVER_PORT)]
    server_port: u16,

    /// Path to the data file relayed to every worker as its request body.
    #[arg(short, long, env = "CONTROLLER_DATA")]
    data: std::path::PathBuf,

    /// Test duration in seconds.
    #[arg(short = 't', long = "duration", env = "CONTROLLER_DURATION", default_value_t = bench_core::config::DEFAULT_DURATION_SECS)]
    duration: u64,

    /// Minimum severity a log record must have to be emitted.
    #[arg(long = "log-level", env = "CONTROLLER_LOG_LEVEL", default_value_t = LevelFilter::Info)]
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
            eprintln!("client-controller: {:#}", e.root_cause());
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let data = std::fs::read(&cli.data)
        .with_context(|| format!("reading data file {}", cli.data.display()))?;
    let payload = PayloadRecord {
        server_port: cli.server_port,
        server_ip: cli.server_ip.clone(),
        data,
    };

    let listen_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), cli.listen_port);
    let listener = bench_core::listener::bind_listener(listen_addr, CONNECTION_QUEUE)
        .context("opening the controller's listen socket")?;

    let keep_running = Arc::new(AtomicBool::new(true));
    for sig in [libc::SIGINT, libc::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&keep_running))
            .with_context(|| format!("registering signal {sig}"))?;
    }

    log::info!("controller listening on {listen_addr}, waiting for \"start\"");
    let mut connections = accept_until_start(&listener, &keep_running)?;

    if !keep_running.load(Ordering::SeqCst) {
        log::warn!("interrupted before \"start\" was typed; no workers to signal");
        return Ok(0);
    }

    log::info!("broadcasting START to {} workers", connections.len());
    broadcast_start(&mut connections, &payload);

    wait_duration(cli.duration, connections.len(), &keep_running);

    log::info!("broadcasting STOP to {} workers", connections.len());
    broadcast_stop(&mut connections);

    Ok(0)
}

/// Polls the listen fd and stdin until the operator types the literal
/// `start` command (or a signal arrives), accepting and recording every
/// worker connection up to [`MAX_CONTROLLER_CONNECTIONS`] along the way.
/// Matches `handle()`'s poll loop in the original source; connections
/// accepted after this function returns are never observed by the
/// controller, which is how "connections accepted after start are ignored"
/// holds.
fn accept_until_start(listener: &TcpListener, keep_running: &AtomicBool) -> Result<Vec<TcpStream>> {
    let mut connections = Vec::new();
    let stdin_fd = std::io::stdin().as_raw_fd();

    while keep_running.load(Ordering::SeqCst) {
        // SAFETY: both fds outlive this poll call.
        let listen_borrowed = unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) };
        let stdin_borrowed = unsafe { BorrowedFd::borrow_raw(stdin_fd) };
        let mut fds = [
            PollFd::new(listen_borrowed, PollFlags::POLLIN),
            PollFd::new(stdin_borrowed, PollFlags::POLLIN),
        ];

        match poll(&mut fds, 500i32) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling listen socket and stdin"),
        }

        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if connections.len() >= MAX_CONTROLLER_CONNECTIONS {
                        log::warn!(
                            "maximum number of connections reached ({MAX_CONTROLLER_CONNECTIONS}), dropping {peer}"
                        );
                        drop(stream);
                    } else {
                        log::info!("{} connected", peer.ip());
                        connections.push(stream);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("accepting a worker connection"),
            }
        }

        if fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            let mut line = String::new();
            let nread = std::io::BufRead::read_line(&mut std::io::stdin().lock(), &mut line)
                .context("reading a command from stdin")?;
            if nread == 0 {
                // stdin closed: nothing more the operator can type.
                continue;
            }
            if line.trim_end_matches(['\n', '\r']) == START_COMMAND {
                return Ok(connections);
            }
        }
    }

    Ok(connections)
}

fn broadcast_start(connections: &mut [TcpStream], payload: &PayloadRecord) {
    use std::io::Write;
    for conn in connections.iter_mut() {
        if let Err(e) = conn.write_all(&ControlOpcode::Start.to_be_bytes()) {
            log::warn!("sending START to a worker failed: {e}");
            continue;
        }
        if let Err(e) = payload.write_to(conn) {
            log::warn!("sending payload record to a worker failed: {e}");
        }
    }
}

fn broadcast_stop(connections: &mut [TcpStream]) {
    use std::io::Write;
    for conn in connections.iter_mut() {
        if let Err(e) = conn.write_all(&ControlOpcode::Stop.to_be_bytes()) {
            log::warn!("sending STOP to a worker failed: {e}");
        }
    }
}

/// Prints a one-dot-per-second progress ticker for `duration_secs`,
/// matching `wait_duration` in the original source; breaks early if a
/// signal clears `keep_running`.
fn wait_duration(duration_secs: u64, num_workers: usize, keep_running: &AtomicBool) {
    print!("Starting {duration_secs} second load test with {num_workers} clients");
    std::io::Write::flush(&mut std::io::stdout()).ok();
    for _ in 0..duration_secs {
        if !keep_running.load(Ordering::SeqCst) {
            break;
        }
        print!(".");
        std::io::Write::flush(&mut std::io::stdout()).ok();
        std::thread::sleep(Duration::from_secs(1));
    }
    println!("done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn broadcast_start_sends_opcode_then_payload_record() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (mut worker_side, _) = listener.accept().unwrap();
        let mut controller_side = client.join().unwrap();

        let payload = PayloadRecord {
            server_port: 5000,
            server_ip: "127.0.0.1".to_string(),
            data: vec![1, 2, 3],
        };
        broadcast_start(std::slice::from_mut(&mut controller_side), &payload);

        let mut opcode_buf = [0u8; 2];
        worker_side.read_exact(&mut opcode_buf).unwrap();
        assert_eq!(ControlOpcode::from_be_bytes(opcode_buf), Ok(ControlOpcode::Start));

        let decoded = PayloadRecord::read_from(&mut worker_side).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn broadcast_stop_sends_stop_opcode_to_every_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (mut worker_side, _) = listener.accept().unwrap();
        let mut controller_side = client.join().unwrap();

        broadcast_stop(std::slice::from_mut(&mut controller_side));

        let mut opcode_buf = [0u8; 2];
        worker_side.read_exact(&mut opcode_buf).unwrap();
        assert_eq!(ControlOpcode::from_be_bytes(opcode_buf), Ok(ControlOpcode::Stop));
    }
}
