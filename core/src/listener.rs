//! Shared listen-socket setup used by every back-end. Grounded on
//! `examples/original_source/poll-server/src/poll_server.c`'s
//! `open_server_for_listen` and `examples/original_source/process-server/src/setup_teardown.c`'s
//! `p_open_process_server_for_listen`: socket, bind, listen with an explicit
//! backlog, in that order, with the fd only stored/returned on full success.
//!
//! A raw `nix` socket is used instead of `TcpListener::bind` because the
//! spec's `CONNECTION_QUEUE` backlog is a first-class tunable (§4 /
//! `config.rs`), and `std::net::TcpListener` hard-codes its own backlog with
//! no way to override it.

use std::net::SocketAddr;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use anyhow::{Context, Result};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrIn};

/// Creates a TCP listen socket bound to `addr` with `backlog` queued
/// connections, returned as a `std::net::TcpListener` so callers get the
/// ordinary standard-library accept/fd ergonomics afterward.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let SocketAddr::V4(addr_v4) = addr else {
        anyhow::bail!("only IPv4 listen addresses are supported, got {addr}");
    };

    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("socket()")?;

    let sockaddr = SockaddrIn::from(addr_v4);
    socket::bind(fd.as_raw_fd() as i32, &sockaddr).with_context(|| format!("bind({addr})"))?;
    socket::listen(&fd, backlog.try_into().unwrap_or(0))
        .with_context(|| format!("listen(backlog={backlog})"))?;

    // SAFETY: `fd` was just created above and is fully initialized (bound and
    // listening); `TcpListener` takes ownership of it from here.
    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_to_an_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_listener(addr, 16).expect("bind_listener");
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
