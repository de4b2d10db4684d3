//! Ancillary-data file-description passing (`SCM_RIGHTS`) over a UNIX domain
//! socket pair, plus the 4-byte correlation token carried alongside it.
//!
//! The worker-pool back-end's parent hands a client fd to a worker this way;
//! the ordinary (non-ancillary) payload carries the fd number as the parent
//! knows it, because the kernel renumbers the fd on the receiving end (spec
//! §9 "Cross-process fd passing").

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};

/// Sends `fd` as an `SCM_RIGHTS` ancillary message over `socket_fd`, with
/// `token` (the fd number as the sender knows it) as the ordinary payload.
pub fn send_fd(socket_fd: RawFd, fd: RawFd, token: i32) -> Result<()> {
    let token_bytes = token.to_ne_bytes();
    let iov = [IoSlice::new(&token_bytes)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    socket::sendmsg::<()>(socket_fd, &iov, &cmsgs, MsgFlags::empty(), None)
        .with_context(|| format!("sendmsg(fd={fd}, token={token})"))?;
    Ok(())
}

/// The result of [`recv_fd`]: the newly received (locally renumbered) fd,
/// and the correlation token the sender attached.
pub struct ReceivedFd {
    pub fd: OwnedFd,
    pub token: i32,
}

/// Receives one `SCM_RIGHTS` message carrying exactly one fd, plus its
/// correlation token. Blocks until a message arrives.
pub fn recv_fd(socket_fd: RawFd) -> Result<ReceivedFd> {
    let mut token_bytes = [0u8; 4];
    let mut iov = [IoSliceMut::new(&mut token_bytes)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let msg = socket::recvmsg::<()>(
        socket_fd,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .context("recvmsg")?;

    let mut received: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&first) = fds.first() {
                // SAFETY: the kernel just handed us ownership of this fd via
                // SCM_RIGHTS; nothing else in this process has a handle to it
                // yet.
                received = Some(unsafe { OwnedFd::from_raw_fd(first) });
            }
        }
    }

    let fd = received.context("SCM_RIGHTS message carried no file descriptor")?;
    if msg.bytes < token_bytes.len() {
        anyhow::bail!(
            "short read of fd-passing correlation token ({} bytes)",
            msg.bytes
        );
    }
    let token = i32::from_ne_bytes(token_bytes);

    Ok(ReceivedFd { fd, token })
}

/// Reads the peer address of a just-received fd. Used by the worker-pool
/// child, which has no other way to learn the peer address than asking the
/// kernel about the socket it was just handed (spec §4.4 step C2).
pub fn peer_addr(fd: BorrowedFd<'_>) -> Result<std::net::SocketAddr> {
    let addr = socket::getpeername::<socket::SockaddrIn>(fd.as_raw_fd())
        .context("getpeername on delegated fd")?;
    Ok(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
        addr.ip(),
        addr.port(),
    )))
}

/// Writes a single `i32` correlation token to a pipe, matching the worker's
/// completion-notification step (spec §4.4 step C4). Writers must already
/// hold `pipe_write_sem` to keep this write atomic with respect to siblings.
pub fn write_token(pipe_write_fd: RawFd, token: i32) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(pipe_write_fd) });
    file.write_all(&token.to_ne_bytes())?;
    file.flush()
}

/// Reads a single `i32` correlation token from a pipe (spec §4.4 reaction 2).
pub fn read_token(pipe_read_fd: RawFd) -> std::io::Result<i32> {
    use std::io::Read;
    let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(pipe_read_fd) });
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType};

    fn make_socketpair() -> (OwnedFd, OwnedFd) {
        nix::sys::socket::socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
            .expect("socketpair")
    }

    #[test]
    fn send_and_recv_fd_round_trips_token() {
        let (a, b) = make_socketpair();
        // Pass stdin's fd across as the thing being delegated; its identity
        // doesn't matter for this test, only that a valid fd crosses over.
        let dummy = nix::unistd::dup(0).expect("dup stdin");

        send_fd(a.as_raw_fd(), dummy, 4242).expect("send_fd");
        let received = recv_fd(b.as_raw_fd()).expect("recv_fd");

        assert_eq!(received.token, 4242);
        let _ = nix::unistd::close(dummy);
        drop(received.fd);
    }

    #[test]
    fn pipe_token_round_trips() {
        use std::os::fd::IntoRawFd;
        let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe");
        write_token(write_fd.into_raw_fd(), -77).expect("write");
        let got = read_token(read_fd.into_raw_fd()).expect("read");
        assert_eq!(got, -77);
    }
}
