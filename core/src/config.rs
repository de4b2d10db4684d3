//! Constants and shared settings shared by every back-end and binary.

/// Environment variable prefix recognized by every CLI in this workspace.
pub const ENV_PREFIX: &str = "SCALABLE_SERVER_";

/// Cap on simultaneous client connections for the event-multiplexed and
/// worker-pool back-ends.
pub const MAX_CONNECTIONS: usize = 5;

/// Backlog passed to `listen()`.
pub const CONNECTION_QUEUE: i32 = 128;

/// Number of pre-forked workers in the worker-pool back-end.
pub const NUM_CHILD_PROCESSES: usize = 4;

/// Upper bound on a single `recv` call's scratch buffer, regardless of how
/// large the declared message length is.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Cap on accepted connections tracked by the controller.
pub const MAX_CONTROLLER_CONNECTIONS: usize = 500;

/// Default TCP port for the benchmarked server.
pub const DEFAULT_SERVER_PORT: u16 = 5000;

/// Default listen/controller port.
pub const DEFAULT_LISTEN_PORT: u16 = 5000;

/// Default test duration, in seconds, for the controller and standalone client.
pub const DEFAULT_DURATION_SECS: u64 = 15;

/// Settings common to the server host shell; individual binaries hold their
/// own richer CLI structs and narrow down to (or build up from) this shape
/// where it overlaps.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_connections: usize,
    pub num_child_processes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            num_child_processes: NUM_CHILD_PROCESSES,
        }
    }
}
