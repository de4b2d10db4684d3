//! The pre-forked, multi-process worker-pool server back-end.
//!
//! Grounded on `examples/original_source/process-server/src/process_server.c`
//! (`fork_child_processes`, `run_process_server`, `p_run_poll_loop`,
//! `poll_accept`) and `examples/original_source/process-server/src/setup_teardown.c`
//! (`setup_semaphores`, `open_pipe_semaphores_domain_sockets`,
//! `p_destroy_parent_state`, `c_destroy_child_state`). `c_receive_and_handle_messages`,
//! the child's message loop, is an empty stub in that source
//! (`examples/original_source/process-server/include/objects.h` only declares
//! its shape); the worker loop below is built from scratch against the wire
//! contract the rest of this workspace already implements.
//!
//! Every fd this back-end hands across `fork` is tracked as a raw descriptor
//! with explicit `close()` calls rather than `OwnedFd`/RAII: once several
//! processes share the same open file description, Rust's single-owner
//! model no longer matches what is actually going on, and the original C
//! sources manage this exact situation the same way (explicit
//! `close_fd_report_undefined_error` calls at each teardown site).

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{self, Signal};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};

use bench_core::config::{CONNECTION_QUEUE, MAX_CONNECTIONS, NUM_CHILD_PROCESSES};
use bench_core::protocol::{self, RecvOutcome};
use bench_core::{logrecord::LogRecord, Backend, CoreObject, LifecycleState, LogSink};
use bench_ipc::fdpass;
use bench_ipc::semaphore::{semaphore_name, NamedSemaphore};

/// The four process-shared named semaphores, bundled so every role (parent,
/// and each forked child) carries exactly one handle set.
struct Semaphores {
    pipe_write: NamedSemaphore,
    domain_read: NamedSemaphore,
    domain_write: NamedSemaphore,
    log: NamedSemaphore,
}

impl Semaphores {
    fn create() -> Result<Self> {
        Ok(Self {
            pipe_write: NamedSemaphore::create(&semaphore_name("pipe_write"), 1)?,
            domain_read: NamedSemaphore::create(&semaphore_name("domain_read"), 0)?,
            domain_write: NamedSemaphore::create(&semaphore_name("domain_write"), 1)?,
            log: NamedSemaphore::create(&semaphore_name("log"), 1)?,
        })
    }

    fn close_all(&self) -> Result<()> {
        self.pipe_write.close().context("pipe_write_sem")?;
        self.domain_read.close().context("domain_read_sem")?;
        self.domain_write.close().context("domain_write_sem")?;
        self.log.close().context("log_sem")?;
        Ok(())
    }

    fn close_and_unlink_all(&self) -> Result<()> {
        self.pipe_write.close_and_unlink().context("pipe_write_sem")?;
        self.domain_read.close_and_unlink().context("domain_read_sem")?;
        self.domain_write.close_and_unlink().context("domain_write_sem")?;
        self.log.close_and_unlink().context("log_sem")?;
        Ok(())
    }
}

fn close_quietly(fd: RawFd, what: &str) {
    if let Err(e) = unistd::close(fd) {
        log::warn!("closing {what} (fd {fd}): {e}");
    }
}

/// Finds the slot currently holding `fd` positive (enabled for polling).
fn find_enabled_slot(table: &[i32], fd: i32) -> Option<usize> {
    table.iter().position(|&v| v == fd)
}

/// Finds the slot whose fd was disabled (negated) when `fd` was dispatched.
fn find_disabled_slot(table: &[i32], fd: i32) -> Option<usize> {
    table.iter().position(|&v| v == -fd)
}

enum ParentEvent {
    Listener,
    Pipe,
    Client(usize),
}

/// Parent-half back-end state, restructured into three parallel `Vec`s
/// instead of one shared 2+MAX_CONNECTIONS table: the listen and pipe slots
/// never take part in the sign-inversion dance the client slots do, so
/// splitting them out removes a family of "is this index 0, 1, or a real
/// client slot" checks.
struct ParentState {
    listener: TcpListener,
    pipe_read: RawFd,
    domain_write: RawFd,
    /// `0` = empty, positive = enabled for polling, negative = dispatched to
    /// a worker and awaiting its completion notification.
    readiness: Vec<i32>,
    peer_addrs: Vec<Option<SocketAddr>>,
    active_count: usize,
    children: Vec<Pid>,
    sems: Arc<Semaphores>,
    keep_running: Arc<AtomicBool>,
}

impl ParentState {
    fn listen_interest(&self) -> PollFlags {
        if self.active_count < MAX_CONNECTIONS {
            PollFlags::POLLIN
        } else {
            PollFlags::empty()
        }
    }

    fn poll_once(&self) -> nix::Result<Vec<ParentEvent>> {
        let mut fds = Vec::with_capacity(2 + MAX_CONNECTIONS);
        let mut kinds = Vec::with_capacity(2 + MAX_CONNECTIONS);

        fds.push(PollFd::new(self.listener.as_fd(), self.listen_interest()));
        kinds.push(ParentEvent::Listener);

        // SAFETY: `pipe_read` is owned by this `ParentState` for its whole
        // lifetime, which outlives this call.
        fds.push(PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(self.pipe_read) },
            PollFlags::POLLIN,
        ));
        kinds.push(ParentEvent::Pipe);

        for (slot, &fd) in self.readiness.iter().enumerate() {
            if fd > 0 {
                fds.push(PollFd::new(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
                    PollFlags::POLLIN,
                ));
                kinds.push(ParentEvent::Client(slot));
            }
        }

        poll(&mut fds, -1)?;

        Ok(fds
            .iter()
            .zip(kinds)
            .filter(|(pfd, _)| pfd.revents().is_some_and(|r| !r.is_empty()))
            .map(|(_, kind)| kind)
            .collect())
    }

    fn accept_one(&mut self) -> Result<()> {
        let (stream, addr) = self.listener.accept().context("accept")?;
        let slot = self
            .readiness
            .iter()
            .position(|&v| v == 0)
            .context("listener interest was enabled with no free slot")?;
        self.readiness[slot] = stream.into_raw_fd();
        self.peer_addrs[slot] = Some(addr);
        self.active_count += 1;
        log::debug!("accepted connection from {addr} into slot {slot}");
        Ok(())
    }

    fn dispatch_to_worker(&mut self, slot: usize) -> Result<()> {
        let fd = self.readiness[slot];
        self.sems.domain_write.wait().context("domain_write_sem wait")?;
        fdpass::send_fd(self.domain_write, fd, fd).context("dispatching fd to a worker")?;
        self.sems.domain_read.post().context("domain_read_sem post")?;
        self.readiness[slot] = -fd;
        Ok(())
    }

    fn handle_pipe_notification(&mut self) -> Result<()> {
        let token = fdpass::read_token(self.pipe_read).context("reading pipe notification")?;
        self.sems.pipe_write.post().context("pipe_write_sem post")?;

        let original_fd = token.abs();
        let slot = find_disabled_slot(&self.readiness, original_fd)
            .context("pipe notification for an fd this parent never dispatched")?;

        if token > 0 {
            self.readiness[slot] = original_fd;
        } else {
            close_quietly(original_fd, "finished client connection");
            self.readiness[slot] = 0;
            self.peer_addrs[slot] = None;
            self.active_count = self.active_count.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for ParentState {
    fn drop(&mut self) {
        close_quietly(self.pipe_read, "parent pipe read end");
        close_quietly(self.domain_write, "parent domain socket write end");
        for &fd in &self.readiness {
            if fd != 0 {
                close_quietly(fd.abs(), "client connection still open at teardown");
            }
        }
    }
}

/// Semaphore-serialized log sink used by every worker process: each `append`
/// holds `log_sem` for the duration of one CSV write ("acquire log_sem;
/// write one CSV record; release log_sem").
///
/// Built and handed to `CoreObject` before `initialize` forks, so this opens
/// its own handle to `log_sem` under the same pid-derived name that
/// [`Semaphores::create`] will reattach to moments later from inside
/// `try_initialize` — both handles address the one underlying kernel
/// semaphore, which is all serialization needs.
struct SemaphoreLogSink {
    inner: bench_core::logrecord::MutexLogSink,
    sem: NamedSemaphore,
}

impl LogSink for SemaphoreLogSink {
    fn append(&self, record: &LogRecord) -> Result<()> {
        self.sem.wait().context("log_sem wait")?;
        let result = self.inner.append(record);
        if let Err(e) = self.sem.post() {
            log::warn!("failed to post log_sem: {e}");
        }
        result
    }
}

/// Pre-forked worker-pool back-end. `None` until `initialize` selects the
/// parent role; a forked child never returns from `initialize`, running its
/// whole lifecycle (setup, message loop, teardown) inline and exiting the
/// process directly, so no `Child` variant is ever observed here.
#[derive(Default)]
pub struct WorkerPoolBackend {
    parent: Option<ParentState>,
}

impl WorkerPoolBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_initialize(core: &CoreObject) -> Result<ParentState> {
        let (domain_write_end, domain_read_end) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .context("socketpair for fd delegation")?;
        let domain_write_raw = domain_write_end.into_raw_fd();
        let domain_read_raw = domain_read_end.into_raw_fd();

        let (pipe_read_end, pipe_write_end) =
            unistd::pipe().context("pipe for completion notifications")?;
        let pipe_read_raw = pipe_read_end.into_raw_fd();
        let pipe_write_raw = pipe_write_end.into_raw_fd();

        let sems = Arc::new(Semaphores::create().context("creating named semaphores")?);
        let keep_running = Arc::new(AtomicBool::new(true));
        // Registered once, before forking: sigaction dispositions (and the
        // pointer this closure captures) survive fork, so every child
        // inherits a working handler into its own copy of `keep_running`
        // with no further setup.
        for sig in [libc::SIGINT, libc::SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&keep_running))
                .with_context(|| format!("registering signal {sig}"))?;
        }

        let mut children = Vec::with_capacity(NUM_CHILD_PROCESSES);
        for _ in 0..NUM_CHILD_PROCESSES {
            // SAFETY: single-threaded at this point in startup; no lock held
            // across the fork that another thread could leave poisoned.
            match unsafe { unistd::fork() }.context("fork")? {
                ForkResult::Parent { child } => children.push(child),
                ForkResult::Child => {
                    close_quietly(domain_write_raw, "child's copy of the parent's domain socket end");
                    close_quietly(pipe_read_raw, "child's copy of the parent's pipe read end");
                    // SAFETY: this process's own fd table still has these fds
                    // open (inherited across fork); from here this process is
                    // their sole Rust-level owner.
                    let domain_read = unsafe { OwnedFd::from_raw_fd(domain_read_raw) };
                    let pipe_write = unsafe { OwnedFd::from_raw_fd(pipe_write_raw) };
                    run_child(core, domain_read, pipe_write, Arc::clone(&sems), Arc::clone(&keep_running));
                }
            }
        }

        close_quietly(domain_read_raw, "parent's copy of the child's domain socket end");
        close_quietly(pipe_write_raw, "parent's copy of the child's pipe write end");

        let listener = bench_core::listener::bind_listener(core.listen_addr, CONNECTION_QUEUE)
            .context("opening listen socket")?;

        Ok(ParentState {
            listener,
            pipe_read: pipe_read_raw,
            domain_write: domain_write_raw,
            readiness: vec![0; MAX_CONNECTIONS],
            peer_addrs: vec![None; MAX_CONNECTIONS],
            active_count: 0,
            children,
            sems,
            keep_running,
        })
    }

    /// A log sink whose writes are serialized by `log_sem` instead of a
    /// process-local `Mutex`, for use by a [`CoreObject`] that will be handed
    /// to worker processes. The parent process itself never appends records.
    pub fn shared_log_sink(path: &std::path::Path) -> Result<Arc<dyn LogSink>> {
        let sem = NamedSemaphore::create(&semaphore_name("log"), 1)
            .context("creating log_sem for the shared log sink")?;
        let inner = bench_core::logrecord::MutexLogSink::open(path)?;
        Ok(Arc::new(SemaphoreLogSink { inner, sem }))
    }
}

fn notify_parent(sems: &Semaphores, pipe_write_fd: RawFd, value: i32) {
    if let Err(e) = sems.pipe_write.wait() {
        log::warn!("waiting on pipe_write_sem: {e}");
        return;
    }
    if let Err(e) = fdpass::write_token(pipe_write_fd, value) {
        log::warn!("writing pipe completion notification: {e}");
    }
}

/// The worker loop ("Child main loop"). Never returns: either it breaks out
/// on shutdown and exits the process, or it keeps looping.
fn run_child(
    core: &CoreObject,
    domain_read: OwnedFd,
    pipe_write: OwnedFd,
    sems: Arc<Semaphores>,
    keep_running: Arc<AtomicBool>,
) -> ! {
    let pid = std::process::id();

    'outer: loop {
        if !keep_running.load(Ordering::SeqCst) {
            break;
        }

        match sems.domain_read.wait() {
            Ok(()) => {}
            Err(nix::errno::Errno::EINTR) => break,
            Err(e) => {
                log::error!("worker {pid} failed waiting on domain_read_sem: {e}");
                break;
            }
        }

        let received = match fdpass::recv_fd(domain_read.as_raw_fd()) {
            Ok(r) => r,
            Err(e) => {
                log::error!("worker {pid} failed to receive a delegated fd: {e:#}");
                let _ = sems.domain_write.post();
                continue;
            }
        };
        if let Err(e) = sems.domain_write.post() {
            log::warn!("worker {pid} failed to post domain_write_sem: {e}");
        }
        let token = received.token;

        let peer = match fdpass::peer_addr(received.fd.as_fd()) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("worker {pid} getpeername on delegated fd failed: {e:#}");
                notify_parent(&sems, pipe_write.as_raw_fd(), -token);
                continue;
            }
        };

        let local_fd = received.fd.into_raw_fd();
        // SAFETY: `local_fd` was just received via SCM_RIGHTS and is not
        // tracked anywhere else in this process.
        let mut stream = unsafe { std::net::TcpStream::from_raw_fd(local_fd) };

        let start_wall = SystemTime::now();
        let start_instant = Instant::now();
        let outcome = protocol::receive_request(&mut stream, || keep_running.load(Ordering::SeqCst));

        let (bytes_to_log, reenable) = match outcome {
            Ok(RecvOutcome::Idle) => (None, false),
            Ok(RecvOutcome::Terminated) => {
                drop(stream);
                break 'outer;
            }
            Ok(RecvOutcome::Truncated(body)) => (Some(body.body.len() as u64), false),
            Ok(RecvOutcome::Complete(body)) => {
                let bytes = body.body.len() as u32;
                if let Err(e) = protocol::send_reply(&mut stream, bytes) {
                    log::warn!("worker {pid} failed replying to {peer}: {e}");
                    (Some(bytes as u64), false)
                } else {
                    (Some(bytes as u64), true)
                }
            }
            Err(e) => {
                log::warn!("worker {pid} connection from {peer} failed: {e}");
                (None, false)
            }
        };

        if let Some(bytes) = bytes_to_log {
            let record = LogRecord {
                start_timestamp: start_wall,
                identifier: format!("{pid}:{local_fd}"),
                peer_ip: peer.ip().to_string(),
                peer_port: peer.port(),
                bytes,
                end_timestamp: SystemTime::now(),
                elapsed_secs: start_wall.elapsed().unwrap_or_default().as_secs_f64(),
                elapsed_high_res_secs: start_instant.elapsed().as_secs_f64(),
            };
            if let Err(e) = core.log_sink.append(&record) {
                log::warn!("worker {pid} failed to append log record: {e:#}");
            }
        }

        drop(stream); // closes the local fd.
        notify_parent(&sems, pipe_write.as_raw_fd(), if reenable { token } else { -token });
    }

    drop(domain_read);
    drop(pipe_write);
    if let Err(e) = sems.close_all() {
        log::warn!("worker {pid} failed to close semaphore handles: {e:#}");
    }
    std::process::exit(0);
}

impl Backend for WorkerPoolBackend {
    fn initialize(&mut self, core: &CoreObject) -> LifecycleState {
        match Self::try_initialize(core) {
            Ok(parent) => {
                self.parent = Some(parent);
                log::info!("worker-pool back-end listening on {}", core.listen_addr);
                LifecycleState::Run
            }
            Err(e) => {
                log::error!("worker-pool initialize failed: {e:#}");
                LifecycleState::Error
            }
        }
    }

    fn run(&mut self, _core: &CoreObject) -> LifecycleState {
        let state = self
            .parent
            .as_mut()
            .expect("run is only reached after initialize selected the parent role");

        while state.keep_running.load(Ordering::SeqCst) {
            let events = match state.poll_once() {
                Ok(events) => events,
                Err(nix::errno::Errno::EINTR) => break,
                Err(e) => {
                    log::error!("worker-pool poll failed: {e}");
                    return LifecycleState::Error;
                }
            };

            for event in events {
                let outcome = match event {
                    ParentEvent::Listener => state.accept_one(),
                    ParentEvent::Pipe => state.handle_pipe_notification(),
                    ParentEvent::Client(slot) => state.dispatch_to_worker(slot),
                };
                if let Err(e) = outcome {
                    log::error!("worker-pool parent step failed: {e:#}");
                    return LifecycleState::Error;
                }
            }
        }
        LifecycleState::Close
    }

    fn close(&mut self, _core: &CoreObject) -> LifecycleState {
        let Some(state) = self.parent.take() else {
            return LifecycleState::Exit;
        };

        for pid in &state.children {
            if let Err(e) = signal::kill(*pid, Signal::SIGINT) {
                log::warn!("failed to signal child {pid}: {e}");
            }
        }
        for pid in &state.children {
            if let Err(e) = waitpid(*pid, None) {
                log::warn!("failed to reap child {pid}: {e}");
            }
        }
        if let Err(e) = state.sems.close_and_unlink_all() {
            log::warn!("failed to tear down semaphores: {e:#}");
        }
        LifecycleState::Exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_dispatch_and_reenable_round_trip_through_the_sign_convention() {
        // Pure data-structure exercise of the readiness-table bookkeeping:
        // no real fork, socket, or semaphore.
        let mut readiness = vec![0i32, 0, 0];
        readiness[1] = 42; // a connection accepted into slot 1

        let slot = find_enabled_slot(&readiness, 42).expect("slot 1 holds fd 42");
        assert_eq!(slot, 1);

        readiness[slot] = -readiness[slot]; // dispatch: negate to disable
        assert_eq!(readiness, vec![0, -42, 0]);
        assert!(find_enabled_slot(&readiness, 42).is_none());

        let disabled = find_disabled_slot(&readiness, 42).expect("slot 1 is disabled for fd 42");
        readiness[disabled] = 42; // completion notification: re-enable
        assert_eq!(readiness, vec![0, 42, 0]);
    }

    #[test]
    fn disabled_slot_lookup_is_independent_of_other_empty_slots() {
        let readiness = vec![-7, 0, -13, 0];
        assert_eq!(find_disabled_slot(&readiness, 7), Some(0));
        assert_eq!(find_disabled_slot(&readiness, 13), Some(2));
        assert_eq!(find_disabled_slot(&readiness, 99), None);
    }

    #[test]
    fn semaphore_set_creates_and_tears_down_cleanly() {
        let sems = Semaphores::create().expect("create");
        // pipe_write_sem, domain_write_sem and log_sem all start at 1, so a
        // single wait on each must succeed without blocking.
        sems.pipe_write.wait().expect("pipe_write_sem starts at 1");
        sems.domain_write.wait().expect("domain_write_sem starts at 1");
        sems.log.wait().expect("log_sem starts at 1");
        // domain_read_sem starts at 0; post once so the matching wait
        // doesn't block this test.
        sems.domain_read.post().expect("post");
        sems.domain_read.wait().expect("wait after post");
        sems.close_and_unlink_all().expect("teardown");
    }
}
