//! Named POSIX semaphores: the one primitive in this workspace whose memory
//! is guaranteed shared across a `fork`, which is why the worker-pool
//! back-end leans on these instead of an in-process `Mutex`/`Condvar`.
//!
//! `nix` has no binding for `sem_open`/`sem_unlink` (they are POSIX realtime
//! extensions, not part of its scope), so this wraps `libc` directly, the
//! same way this house reaches for a bare `libc` call plus `nix::errno`
//! error conversion whenever `nix` itself has no wrapper.

use std::ffi::CString;

use anyhow::{Context, Result};
use nix::errno::Errno;

// `libc::sem_open` is declared variadic in the real C header; `libc` does not
// expose the mode/value overload directly, so this binds the four-argument
// form actually used here.
extern "C" {
    fn sem_open(
        name: *const libc::c_char,
        oflag: libc::c_int,
        mode: libc::mode_t,
        value: libc::c_uint,
    ) -> *mut libc::sem_t;
}

/// A process-shared semaphore identified by a name, created fresh (or
/// attached to an existing one) by [`NamedSemaphore::create`], and released
/// by [`NamedSemaphore::close_and_unlink`].
pub struct NamedSemaphore {
    name: CString,
    handle: *mut libc::sem_t,
}

// The underlying `sem_t*` is safe to share across threads/processes by
// design of the POSIX semaphore API; this struct only ever exposes it
// through `wait`/`post`, which are themselves safe to call concurrently.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Opens (creating if necessary) a named semaphore initialized to
    /// `initial_value`. The name should be process-unique per run (see
    /// [`crate::semaphore_name`]) so a prior crashed run's semaphore is never
    /// silently reattached.
    pub fn create(name: &str, initial_value: u32) -> Result<Self> {
        let cname = CString::new(name).with_context(|| format!("semaphore name {name:?}"))?;
        let handle = unsafe {
            sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
                initial_value,
            )
        };
        if handle.is_null() || handle as isize == libc::SEM_FAILED as isize {
            return Err(Errno::last())
                .with_context(|| format!("sem_open({name:?}, initial={initial_value})"));
        }
        log::debug!("opened named semaphore {name} at initial value {initial_value}");
        Ok(Self { name: cname, handle })
    }

    /// Blocks until the semaphore's count is positive, then decrements it.
    /// `EINTR` is surfaced to the caller (not retried) so signal-driven
    /// shutdown paths can treat it as "stop waiting".
    pub fn wait(&self) -> nix::Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.handle) };
            if rc == 0 {
                return Ok(());
            }
            let errno = Errno::last();
            return Err(errno);
        }
    }

    /// Increments the semaphore's count, waking one waiter if any is blocked.
    pub fn post(&self) -> nix::Result<()> {
        let rc = unsafe { libc::sem_post(self.handle) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }

    /// Closes this process's handle to the semaphore without removing its
    /// name. Every process that opened the semaphore must close it; only the
    /// last closer should additionally unlink.
    pub fn close(&self) -> nix::Result<()> {
        let rc = unsafe { libc::sem_close(self.handle) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }

    /// Closes this handle and removes the semaphore's name from the system
    /// so a future run with the same name starts from a fresh semaphore.
    /// Idempotent: an already-unlinked name reports `ENOENT`, which is
    /// swallowed, matching the close-path "already torn down" tolerance used
    /// throughout this back-end's teardown.
    pub fn close_and_unlink(&self) -> Result<()> {
        self.close().context("sem_close")?;
        let rc = unsafe { libc::sem_unlink(self.name.as_ptr()) };
        if rc == -1 {
            let errno = Errno::last();
            if errno != Errno::ENOENT {
                return Err(errno).context("sem_unlink");
            }
        }
        Ok(())
    }
}

/// Derives a semaphore name scoped to this process group, so repeated runs
/// (and parallel test runs) never collide on a name left behind by a run that
/// was killed before it could unlink its semaphores.
pub fn semaphore_name(role: &str) -> String {
    format!("/scalable_server_{role}_{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_wait_post_round_trips() {
        let name = semaphore_name("test_sem_basic");
        let sem = NamedSemaphore::create(&name, 1).expect("create");
        sem.wait().expect("wait should succeed with count 1");
        sem.post().expect("post");
        sem.wait().expect("wait after post should succeed");
        sem.close_and_unlink().expect("teardown");
    }

    #[test]
    fn unlinking_twice_is_tolerated() {
        let name = semaphore_name("test_sem_double_unlink");
        let sem = NamedSemaphore::create(&name, 0).expect("create");
        sem.close_and_unlink().expect("first teardown");
        // Re-create under the same name, then unlink again: ENOENT on the
        // *first* sem's name is no longer observable once recreated, so this
        // only asserts the API doesn't panic on a fresh handle either.
        let sem2 = NamedSemaphore::create(&name, 0).expect("recreate");
        sem2.close_and_unlink().expect("second teardown");
    }
}
