//! The single-process, event-multiplexed server back-end.
//!
//! No surviving original C implementation of this back-end's run loop exists
//! in the retrieved corpus (`examples/original_source/poll-server/src/poll_server.c`
//! only has `setup_state`/`open_server_for_listen`/`destroy_state`; the poll
//! loop itself was never written there). The slot-table/readiness-toggling
//! technique is instead carried over from
//! `examples/original_source/process-server/src/process_server.c`'s
//! `p_run_poll_loop`/`poll_accept`, which is this corpus's only working
//! readiness-table-driven accept/dispatch loop, adapted down to a single
//! process with no fd delegation.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bench_core::config::{CONNECTION_QUEUE, MAX_CONNECTIONS};
use bench_core::protocol::{self, RecvOutcome};
use bench_core::{logrecord::LogRecord, Backend, CoreObject, LifecycleState};
use nix::poll::{poll, PollFd, PollFlags};

struct ClientSlot {
    stream: TcpStream,
    addr: SocketAddr,
}

/// Back-end state: the listen fd, a fixed-size table of client slots keyed
/// by index, and the active connection count that table's occupancy must
/// always equal.
pub struct PollBackend {
    listener: Option<TcpListener>,
    slots: Vec<Option<ClientSlot>>,
    active_count: usize,
    keep_running: Arc<AtomicBool>,
    _signal_ids: Vec<signal_hook::SigId>,
}

impl Default for PollBackend {
    fn default() -> Self {
        Self {
            listener: None,
            slots: (0..MAX_CONNECTIONS).map(|_| None).collect(),
            active_count: 0,
            keep_running: Arc::new(AtomicBool::new(true)),
            _signal_ids: Vec::new(),
        }
    }
}

enum PollEvent {
    Listener,
    Slot(usize),
}

impl PollBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn listen_fd(&self) -> RawFd {
        self.listener.as_ref().expect("initialized").as_raw_fd()
    }

    fn accept_one(&mut self) -> std::io::Result<()> {
        let listener = self.listener.as_ref().expect("initialized");
        let (stream, addr) = listener.accept()?;
        let free = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .expect("listener interest was disabled once all slots were full");
        log::debug!("accepted connection from {addr} into slot {free}");
        self.slots[free] = Some(ClientSlot { stream, addr });
        self.active_count += 1;
        Ok(())
    }

    fn close_slot(&mut self, index: usize) {
        if self.slots[index].take().is_some() {
            self.active_count = self.active_count.saturating_sub(1);
        }
    }

    fn handle_slot(&mut self, core: &CoreObject, index: usize) {
        let slot = self.slots[index]
            .as_mut()
            .expect("handle_slot called only for occupied slots");
        let peer = slot.addr;

        let start_wall = SystemTime::now();
        let start_instant = Instant::now();
        let outcome = protocol::receive_request(&mut slot.stream, || {
            self.keep_running.load(Ordering::SeqCst)
        });

        match outcome {
            Ok(RecvOutcome::Idle) => {
                log::debug!("connection from {peer} closed by peer");
                self.close_slot(index);
            }
            Ok(RecvOutcome::Terminated) => {
                // Shutdown observed mid-receive: leave the slot as is: `close`
                // will tear down every remaining fd regardless.
            }
            Ok(RecvOutcome::Truncated(body)) => {
                log::warn!(
                    "connection from {peer} truncated at {} of {} declared bytes",
                    body.body.len(),
                    body.declared_len
                );
                log_record(core, &peer, body.body.len() as u64, start_wall, start_instant);
                self.close_slot(index);
            }
            Ok(RecvOutcome::Complete(body)) => {
                let bytes = body.body.len() as u32;
                log_record(core, &peer, bytes as u64, start_wall, start_instant);
                let slot = self.slots[index].as_mut().expect("still occupied");
                if let Err(e) = protocol::send_reply(&mut slot.stream, bytes) {
                    log::warn!("reply to {peer} failed: {e}");
                    self.close_slot(index);
                }
            }
            Err(e) => {
                log::warn!("connection from {peer} failed: {e}");
                self.close_slot(index);
            }
        }
    }

    /// Builds the poll array fresh each loop iteration (cheap at
    /// `MAX_CONNECTIONS` scale) and a parallel map back to logical events, so
    /// `PollFd`'s borrow of each fd never has to outlive one `poll()` call.
    fn poll_once(&self) -> nix::Result<Vec<(PollEvent, PollFlags)>> {
        let mut entries: Vec<BorrowedFd<'_>> = Vec::with_capacity(1 + MAX_CONNECTIONS);
        let mut kinds = Vec::with_capacity(1 + MAX_CONNECTIONS);
        let mut wanted = Vec::with_capacity(1 + MAX_CONNECTIONS);

        // SAFETY: the listener and every occupied slot's stream outlive this
        // function call, which is the only thing borrowing their fds.
        entries.push(unsafe { BorrowedFd::borrow_raw(self.listen_fd()) });
        kinds.push(PollEvent::Listener);
        wanted.push(if self.active_count < MAX_CONNECTIONS {
            PollFlags::POLLIN
        } else {
            PollFlags::empty()
        });

        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                entries.push(unsafe { BorrowedFd::borrow_raw(slot.stream.as_raw_fd()) });
                kinds.push(PollEvent::Slot(i));
                wanted.push(PollFlags::POLLIN);
            }
        }

        let mut pollfds: Vec<PollFd> = entries
            .into_iter()
            .zip(wanted.iter())
            .map(|(fd, &flags)| PollFd::new(fd, flags))
            .collect();

        poll(&mut pollfds, -1)?;

        let events = pollfds
            .iter()
            .zip(kinds)
            .filter_map(|(pfd, kind)| pfd.revents().map(|r| (kind, r)))
            .filter(|(_, r)| !r.is_empty())
            .collect();
        Ok(events)
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

impl Backend for PollBackend {
    fn initialize(&mut self, core: &CoreObject) -> LifecycleState {
        match bench_core::listener::bind_listener(core.listen_addr, CONNECTION_QUEUE) {
            Ok(listener) => self.listener = Some(listener),
            Err(e) => {
                log::error!("failed to open listen socket: {e:#}");
                return LifecycleState::Error;
            }
        }
        for sig in [libc::SIGINT, libc::SIGTERM] {
            match signal_hook::flag::register(sig, Arc::clone(&self.keep_running)) {
                Ok(id) => self._signal_ids.push(id),
                Err(e) => {
                    log::error!("failed to register signal {sig}: {e}");
                    return LifecycleState::Error;
                }
            }
        }
        log::info!("event-multiplexed back-end listening on {}", core.listen_addr);
        LifecycleState::Run
    }

    fn run(&mut self, core: &CoreObject) -> LifecycleState {
        while self.keep_running.load(Ordering::SeqCst) {
            let events = match self.poll_once() {
                Ok(events) => events,
                Err(nix::errno::Errno::EINTR) => break,
                Err(e) => {
                    log::error!("poll failed: {e}");
                    return LifecycleState::Error;
                }
            };

            for (event, _revents) in events {
                match event {
                    PollEvent::Listener => {
                        if let Err(e) = self.accept_one() {
                            if e.kind() == std::io::ErrorKind::Interrupted {
                                continue;
                            }
                            log::error!("accept failed: {e}");
                            return LifecycleState::Error;
                        }
                    }
                    PollEvent::Slot(index) => self.handle_slot(core, index),
                }
            }
        }
        LifecycleState::Close
    }

    fn close(&mut self, _core: &CoreObject) -> LifecycleState {
        self.listener.take();
        for slot in self.slots.iter_mut() {
            slot.take();
        }
        self.active_count = 0;
        LifecycleState::Exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::logrecord::MutexLogSink;
    use std::io::{Read, Write};

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
        let mut backend = PollBackend::new();
        assert_eq!(backend.initialize(&core), LifecycleState::Run);
        assert_eq!(backend.close(&core), LifecycleState::Exit);
        assert_eq!(backend.close(&core), LifecycleState::Exit);
    }

    #[test]
    fn accept_fills_first_free_slot_and_tracks_active_count() {
        let core = dummy_core("127.0.0.1:0");
        let mut backend = PollBackend::new();
        backend.initialize(&core);
        let addr = backend.listener.as_ref().unwrap().local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        // Give the kernel a moment to complete the handshake so accept()
        // doesn't need to block.
        std::thread::sleep(std::time::Duration::from_millis(20));
        backend.accept_one().unwrap();

        assert_eq!(backend.active_count, 1);
        assert!(backend.slots[0].is_some());
        backend.close(&core);
    }

    #[test]
    fn active_count_caps_at_max_connections_and_listener_interest_reflects_it() {
        let core = dummy_core("127.0.0.1:0");
        let mut backend = PollBackend::new();
        backend.initialize(&core);
        let addr = backend.listener.as_ref().unwrap().local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..MAX_CONNECTIONS {
            clients.push(TcpStream::connect(addr).unwrap());
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        for _ in 0..MAX_CONNECTIONS {
            backend.accept_one().unwrap();
        }

        assert_eq!(backend.active_count, MAX_CONNECTIONS);
        let events = backend.poll_once();
        // With every slot full, only the client streams themselves (idle, no
        // data) should ever report ready, never the listener.
        drop(events);
        assert!(backend.slots.iter().all(|s| s.is_some()));
        backend.close(&core);
    }

    #[test]
    fn single_request_on_a_slot_round_trips_byte_count() {
        let core = dummy_core("127.0.0.1:0");
        let mut backend = PollBackend::new();
        backend.initialize(&core);
        let addr = backend.listener.as_ref().unwrap().local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&3u32.to_be_bytes()).unwrap();
            stream.write_all(b"hey").unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        backend.accept_one().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        backend.handle_slot(&core, 0);

        let reply = handle.join().unwrap();
        assert_eq!(reply, 3u32.to_be_bytes());
        backend.close(&core);
    }
}
