//! The self-pipe signal discipline: arm a pipe so a signal handler can wake a
//! thread blocked in `poll`/`select` without touching anything that isn't
//! async-signal-safe. Used by the one-to-one back-end, whose single-threaded
//! accept loop otherwise has no way to notice a delivered `SIGINT` while
//! blocked in `accept`.
//!
//! Grounded on `examples/original_source/one-to-one/src/one_to_one.c`'s
//! `self_pipe`/`handle_sigint`, reimplemented on top of
//! `signal_hook::low_level::pipe::register` rather than a hand-rolled
//! `sigaction`, since that registration helper exists precisely to make this
//! pattern safe without writing a signal handler by hand.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::unistd;

/// A pipe whose write end a signal handler writes one byte into; the read
/// end becomes readable (to `poll`) the instant a registered signal arrives.
pub struct SelfPipe {
    read_fd: OwnedFd,
    _write_fd: OwnedFd,
    _signal_ids: Vec<signal_hook::SigId>,
}

impl SelfPipe {
    /// Creates the pipe and arms it for every signal in `signals` (typically
    /// `SIGINT` and `SIGTERM`).
    pub fn arm(signals: &[libc::c_int]) -> Result<Self> {
        let (read_fd, write_fd) = unistd::pipe().context("creating self-pipe")?;
        let mut signal_ids = Vec::with_capacity(signals.len());
        for &sig in signals {
            let id = unsafe { signal_hook::low_level::pipe::register(sig, write_fd.as_raw_fd()) }
                .with_context(|| format!("registering self-pipe for signal {sig}"))?;
            signal_ids.push(id);
        }
        Ok(Self {
            read_fd,
            _write_fd: write_fd,
            _signal_ids: signal_ids,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Drains every byte currently buffered in the pipe. Called after `poll`
    /// reports the self-pipe readable, so the next arming of a registered
    /// signal is observed fresh rather than immediately re-triggering.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_for_sigusr1_and_signalling_self_makes_pipe_readable() {
        let pipe = SelfPipe::arm(&[libc::SIGUSR1]).expect("arm");
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).expect("raise");

        let mut fds = [nix::poll::PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(pipe.read_fd()) },
            nix::poll::PollFlags::POLLIN,
        )];
        let n = nix::poll::poll(&mut fds, 1000i32).expect("poll");
        assert_eq!(n, 1);
        pipe.drain();
    }
}
