//! The blocking, one-connection-at-a-time server back-end.
//!
//! Grounded end to end on
//! `examples/original_source/one-to-one/src/one_to_one.c` (`check_fd`,
//! `accept_conn`, `receive_message`, `handle_client`, `destroy_state`),
//! reimplemented idiomatically: the original's `select()` self-pipe gate
//! becomes `nix::poll::poll` over two descriptors (`bench_ipc::SelfPipe`),
//! and the original's mis-decrementing receive loop is replaced by tracking
//! `remaining` as a local decremented by the actual bytes a `recv` returns,
//! per call.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Instant, SystemTime};

use bench_core::config::CONNECTION_QUEUE;
use bench_core::protocol::{self, RecvOutcome};
use bench_core::{logrecord::LogRecord, Backend, CoreObject, LifecycleState};
use bench_ipc::SelfPipe;
use nix::poll::{poll, PollFd, PollFlags};

/// Back-end state: the listen fd and, while one is accepted, the single
/// current client fd plus its peer address.
#[derive(Default)]
pub struct BlockingBackend {
    listener: Option<TcpListener>,
    self_pipe: Option<SelfPipe>,
}

enum AcceptOutcome {
    Accepted(TcpStream, SocketAddr),
    Terminated,
    Error,
}

enum ClientOutcome {
    ClosedByPeer,
    Terminated,
    Error,
}

/// Blocks until `fd` is readable or the self-pipe fires, mirroring
/// `check_fd`'s `select()` gate. Returns `false` ("stop") on signal
/// termination or a hard poll error; `true` ("continue") once `fd` itself is
/// ready for the caller's own `recv`.
fn wait_readable(fd: RawFd, self_pipe_fd: RawFd, saw_error: &std::cell::Cell<bool>) -> bool {
    loop {
        // SAFETY: both fds are owned by the caller for the duration of this
        // call and outlive it.
        let mut fds = [
            PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN),
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(self_pipe_fd) },
                PollFlags::POLLIN,
            ),
        ];
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return false,
            Err(_) => {
                saw_error.set(true);
                return false;
            }
        }
        if fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))
        {
            return false;
        }
        if fds[0].revents().is_some_and(|r| !r.is_empty()) {
            return true;
        }
        // Spurious wakeup: neither fd actually has revents set. Poll again.
    }
}

impl BlockingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn accept_one(&self) -> AcceptOutcome {
        let listener = self.listener.as_ref().expect("initialize runs before run");
        let self_pipe = self.self_pipe.as_ref().expect("initialize runs before run");
        let saw_error = std::cell::Cell::new(false);

        if !wait_readable(listener.as_raw_fd(), self_pipe.read_fd(), &saw_error) {
            self_pipe.drain();
            return if saw_error.get() {
                AcceptOutcome::Error
            } else {
                AcceptOutcome::Terminated
            };
        }

        match listener.accept() {
            Ok((stream, addr)) => AcceptOutcome::Accepted(stream, addr),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => AcceptOutcome::Terminated,
            Err(e) => {
                log::error!("accept failed: {e}");
                AcceptOutcome::Error
            }
        }
    }

    fn handle_client(&self, core: &CoreObject, mut stream: TcpStream, peer: SocketAddr) -> ClientOutcome {
        let self_pipe = self.self_pipe.as_ref().expect("initialize runs before run");
        let client_fd = stream.as_raw_fd();

        loop {
            let saw_error = std::cell::Cell::new(false);
            let should_continue = || wait_readable(client_fd, self_pipe.read_fd(), &saw_error);

            let start_wall = SystemTime::now();
            let start_instant = Instant::now();
            let outcome = match protocol::receive_request(&mut stream, should_continue) {
                Ok(o) => o,
                Err(e) => {
                    log::warn!("connection from {peer} failed: {e}");
                    return ClientOutcome::Error;
                }
            };

            match outcome {
                RecvOutcome::Idle => return ClientOutcome::ClosedByPeer,
                RecvOutcome::Terminated => {
                    self_pipe.drain();
                    return if saw_error.get() {
                        ClientOutcome::Error
                    } else {
                        ClientOutcome::Terminated
                    };
                }
                RecvOutcome::Truncated(body) => {
                    log_record(core, &peer, body.body.len() as u64, start_wall, start_instant);
                    return ClientOutcome::Error;
                }
                RecvOutcome::Complete(body) => {
                    let bytes = body.body.len() as u32;
                    log_record(core, &peer, bytes as u64, start_wall, start_instant);
                    if let Err(e) = protocol::send_reply(&mut stream, bytes) {
                        log::warn!("reply to {peer} failed: {e}");
                        return ClientOutcome::Error;
                    }
                }
            }
        }
    }
}

fn log_record(
    core: &CoreObject,
    peer: &SocketAddr,
    bytes: u64,
    start_wall: SystemTime,
    start_instant: Instant,
) {
    let record = LogRecord {
        start_timestamp: start_wall,
        identifier: format!("{}:{}", std::process::id(), 0),
        peer_ip: peer.ip().to_string(),
        peer_port: peer.port(),
        bytes,
        end_timestamp: SystemTime::now(),
        elapsed_secs: start_wall.elapsed().unwrap_or_default().as_secs_f64(),
        elapsed_high_res_secs: start_instant.elapsed().as_secs_f64(),
    };
    if let Err(e) = core.log_sink.append(&record) {
        log::warn!("failed to append log record: {e}");
    }
}

impl Backend for BlockingBackend {
    fn initialize(&mut self, core: &CoreObject) -> LifecycleState {
        match bench_core::listener::bind_listener(core.listen_addr, CONNECTION_QUEUE) {
            Ok(listener) => self.listener = Some(listener),
            Err(e) => {
                log::error!("failed to open listen socket: {e:#}");
                return LifecycleState::Error;
            }
        }
        match SelfPipe::arm(&[libc::SIGINT, libc::SIGTERM]) {
            Ok(pipe) => self.self_pipe = Some(pipe),
            Err(e) => {
                log::error!("failed to arm self-pipe: {e:#}");
                return LifecycleState::Error;
            }
        }
        log::info!("one-to-one back-end listening on {}", core.listen_addr);
        LifecycleState::Run
    }

    fn run(&mut self, core: &CoreObject) -> LifecycleState {
        loop {
            match self.accept_one() {
                AcceptOutcome::Terminated => return LifecycleState::Close,
                AcceptOutcome::Error => return LifecycleState::Error,
                AcceptOutcome::Accepted(stream, peer) => {
                    log::debug!("accepted connection from {peer}");
                    match self.handle_client(core, stream, peer) {
                        ClientOutcome::ClosedByPeer => continue,
                        ClientOutcome::Terminated => return LifecycleState::Close,
                        ClientOutcome::Error => return LifecycleState::Error,
                    }
                }
            }
        }
    }

    fn close(&mut self, _core: &CoreObject) -> LifecycleState {
        // Dropping a `TcpListener`/`SelfPipe` closes their fds; `EBADF` on an
        // already-closed fd is not observable through the `Drop` impl, so
        // `close` stays safe to invoke on an already-closed state for free.
        self.listener.take();
        self.self_pipe.take();
        LifecycleState::Exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::logrecord::MutexLogSink;
    use std::sync::Arc;

    fn dummy_core(addr: &str) -> CoreObject {
        CoreObject::new(
            addr.parse().unwrap(),
            Arc::new(MutexLogSink::in_memory()),
            bench_core::Settings::default(),
        )
    }

    #[test]
    fn initialize_binds_and_close_is_idempotent() {
        let core = dummy_core("127.0.0.1:0");
        let mut backend = BlockingBackend::new();
        assert_eq!(backend.initialize(&core), LifecycleState::Run);
        assert_eq!(backend.close(&core), LifecycleState::Exit);
        // Calling close again on an already-closed backend must stay safe.
        assert_eq!(backend.close(&core), LifecycleState::Exit);
    }

    #[test]
    fn single_request_round_trips_byte_count() {
        let core = dummy_core("127.0.0.1:0");
        let mut backend = BlockingBackend::new();
        assert_eq!(backend.initialize(&core), LifecycleState::Run);
        let addr = backend.listener.as_ref().unwrap().local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            use std::io::{Read, Write};
            stream.write_all(&5u32.to_be_bytes()).unwrap();
            stream.write_all(b"HELLO").unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        match backend.accept_one() {
            AcceptOutcome::Accepted(stream, peer) => {
                let self_pipe = backend.self_pipe.as_ref().unwrap();
                let client_fd = stream.as_raw_fd();
                let saw_error = std::cell::Cell::new(false);
                let mut stream = stream;
                let outcome = protocol::receive_request(&mut stream, || {
                    wait_readable(client_fd, self_pipe.read_fd(), &saw_error)
                })
                .unwrap();
                match outcome {
                    RecvOutcome::Complete(body) => {
                        protocol::send_reply(&mut stream, body.body.len() as u32).unwrap();
                    }
                    other => panic!("unexpected outcome: {other:?}"),
                }
                let _ = peer;
            }
            _ => panic!("expected an accepted connection"),
        }

        let reply = handle.join().unwrap();
        assert_eq!(reply, 5u32.to_be_bytes());
        backend.close(&core);
    }
}
