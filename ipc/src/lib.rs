//! Cross-process coordination primitives: named POSIX semaphores, SCM_RIGHTS
//! file-description passing, and the self-pipe signal discipline. These are
//! the parts of the worker-pool back-end (and, for the self-pipe, the
//! one-to-one back-end) that have no safe single-process equivalent.

pub mod fdpass;
pub mod selfpipe;
pub mod semaphore;

pub use fdpass::{recv_fd, send_fd};
pub use selfpipe::SelfPipe;
pub use semaphore::NamedSemaphore;
