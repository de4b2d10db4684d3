//! Shared data model, wire codec, logging and lifecycle plumbing used by every
//! back-end crate and every binary in this workspace.

pub mod config;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod logrecord;
pub mod protocol;

pub use config::Settings;
pub use lifecycle::{Backend, LifecycleState};
pub use logrecord::{LogRecord, LogSink};

use std::net::SocketAddr;
use std::sync::Arc;

/// Per-process aggregate shared by every back-end. Owns the log sink and the
/// listen address; holds no reference to back-end state (back-ends are owned
/// by the host loop, never by `CoreObject`, so there is no cycle between the
/// two).
pub struct CoreObject {
    pub listen_addr: SocketAddr,
    pub log_sink: Arc<dyn LogSink>,
    pub settings: Settings,
}

impl CoreObject {
    pub fn new(listen_addr: SocketAddr, log_sink: Arc<dyn LogSink>, settings: Settings) -> Self {
        Self {
            listen_addr,
            log_sink,
            settings,
        }
    }
}
